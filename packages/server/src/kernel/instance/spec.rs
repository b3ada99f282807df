//! Pure instance derivations: naming, validation, and the env/label
//! projections.
//!
//! `build_env` is the source of truth for what a container should look like —
//! drift reconciliation compares running containers against it. Nothing in
//! this module touches the daemon.

use std::collections::BTreeMap;

use lazy_static::lazy_static;
use rand::RngCore;
use regex::Regex;
use thiserror::Error;

use crate::config::Config;

/// Port the engine listens on inside the container.
pub const ENGINE_PORT: u16 = 5678;

/// Engine data directory bound to the instance's named volume.
pub const ENGINE_DATA_DIR: &str = "/home/node/.n8n";

lazy_static! {
    static ref NAME_RE: Regex = Regex::new(r"^[a-z0-9][a-z0-9-]{0,30}[a-z0-9]$").unwrap();
    static ref VERSION_RE: Regex = Regex::new(r"^(latest|1\.\d{1,3}\.\d{1,3})$").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

pub fn container_name(name: &str) -> String {
    format!("engine-{name}")
}

pub fn volume_name(name: &str) -> String {
    format!("engine-data-{name}")
}

pub fn subdomain(config: &Config, name: &str) -> String {
    format!("{name}.{}", config.base_domain)
}

pub fn instance_url(config: &Config, name: &str) -> String {
    format!("{}://{}", config.scheme(), subdomain(config, name))
}

/// Validate an instance name at intake, before any daemon call.
pub fn validate_instance_name(raw: &str) -> Result<String, ValidationError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ValidationError("Nome obrigatório".to_string()));
    }
    if !NAME_RE.is_match(name) {
        return Err(ValidationError(
            "Nome deve conter apenas letras minusculas, numeros e hifens (2-32 chars)".to_string(),
        ));
    }
    Ok(name.to_string())
}

/// Validate an engine version tag (`latest` or `1.X.Y`).
pub fn validate_version(raw: &str) -> Result<String, ValidationError> {
    let version = raw.trim();
    if !VERSION_RE.is_match(version) {
        return Err(ValidationError(
            "Versão inválida. Use 'latest' ou o formato 1.X.Y".to_string(),
        ));
    }
    Ok(version.to_string())
}

/// 256 bits from the OS CSPRNG, hex-encoded. Generated once per instance and
/// preserved across rebuilds; stored data becomes unreadable without it.
pub fn generate_encryption_key() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Full environment an engine container is expected to run with.
pub fn build_env(config: &Config, name: &str, encryption_key: &str) -> BTreeMap<String, String> {
    let host = subdomain(config, name);
    let scheme = config.scheme();
    let base_url = format!("{scheme}://{host}/");

    let mut env = BTreeMap::new();
    env.insert("N8N_HOST".into(), "0.0.0.0".into());
    env.insert("N8N_PORT".into(), ENGINE_PORT.to_string());
    env.insert("N8N_PROTOCOL".into(), scheme.into());
    env.insert("N8N_EDITOR_BASE_URL".into(), base_url.clone());
    env.insert("N8N_ENCRYPTION_KEY".into(), encryption_key.into());
    env.insert("WEBHOOK_URL".into(), base_url);
    env.insert("GENERIC_TIMEZONE".into(), config.default_timezone.clone());
    env.insert("N8N_ENFORCE_SETTINGS_FILE_PERMISSIONS".into(), "true".into());
    env.insert("N8N_SECURE_COOKIE".into(), "false".into());
    env.insert("N8N_LOG_LEVEL".into(), "warn".into());
    // Embedded SQLite pool
    env.insert("DB_SQLITE_POOL_SIZE".into(), "4".into());
    // Telemetry off
    env.insert("N8N_DIAGNOSTICS_ENABLED".into(), "false".into());
    env.insert("N8N_BLOCK_ENV_ACCESS_IN_NODE".into(), "true".into());
    env.insert("N8N_GIT_NODE_DISABLE_BARE_REPOS".into(), "true".into());
    // Execution-data retention
    env.insert("EXECUTIONS_DATA_SAVE_ON_ERROR".into(), "all".into());
    env.insert("EXECUTIONS_DATA_SAVE_ON_SUCCESS".into(), "none".into());
    env.insert("EXECUTIONS_DATA_SAVE_ON_PROGRESS".into(), "false".into());
    env.insert(
        "EXECUTIONS_DATA_SAVE_MANUAL_EXECUTIONS".into(),
        "false".into(),
    );
    env.insert("EXECUTIONS_DATA_PRUNE".into(), "true".into());
    env.insert("EXECUTIONS_DATA_MAX_AGE".into(), "24".into());
    env.insert("EXECUTIONS_DATA_PRUNE_MAX_COUNT".into(), "100".into());
    // Concurrency and heap cap
    env.insert("N8N_CONCURRENCY_PRODUCTION_LIMIT".into(), "3".into());
    env.insert("NODE_OPTIONS".into(), "--max-old-space-size=256".into());
    // Feature flags
    env.insert("N8N_TEMPLATES_ENABLED".into(), "false".into());
    env.insert("N8N_VERSION_NOTIFICATIONS_ENABLED".into(), "false".into());
    env.insert("N8N_PERSONALIZATION_ENABLED".into(), "false".into());
    env.insert("N8N_HIRING_BANNER_ENABLED".into(), "false".into());
    env.insert("N8N_COMMUNITY_PACKAGES_ENABLED".into(), "true".into());
    env
}

/// Reverse-proxy routing labels plus the management label set.
pub fn build_labels(config: &Config, name: &str, created_at: &str) -> BTreeMap<String, String> {
    let host = subdomain(config, name);
    let router = format!("engine-{name}");

    let mut labels = BTreeMap::new();
    labels.insert("traefik.enable".into(), "true".into());
    labels.insert(
        format!("traefik.http.routers.{router}.rule"),
        format!("Host(`{host}`)"),
    );
    labels.insert(
        format!("traefik.http.services.{router}.loadbalancer.server.port"),
        ENGINE_PORT.to_string(),
    );
    if config.ssl_enabled {
        labels.insert(
            format!("traefik.http.routers.{router}.entrypoints"),
            "websecure".into(),
        );
        labels.insert(
            format!("traefik.http.routers.{router}.tls.certresolver"),
            config.traefik_cert_resolver.clone(),
        );
    }
    labels.insert("app.type".into(), "engine".into());
    labels.insert("app.instance".into(), name.into());
    labels.insert("app.created_at".into(), created_at.into());
    labels
}

/// Flatten an env map into the daemon's `KEY=value` list form.
pub fn env_to_list(env: &BTreeMap<String, String>) -> Vec<String> {
    env.iter().map(|(k, v)| format!("{k}={v}")).collect()
}

/// Parse the daemon's `KEY=value` list back into a map.
pub fn env_from_list(env: &[String]) -> BTreeMap<String, String> {
    env.iter()
        .filter_map(|item| {
            item.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect()
}

/// The instance's encryption key as currently configured on its container.
pub fn extract_encryption_key(env: &[String]) -> Option<String> {
    env.iter()
        .find_map(|item| item.strip_prefix("N8N_ENCRYPTION_KEY="))
        .map(|v| v.to_string())
}

/// Recognized env keys whose current value differs from the projection.
/// Keys the projection does not know about are ignored.
pub fn drift_keys(
    projection: &BTreeMap<String, String>,
    current: &BTreeMap<String, String>,
) -> Vec<String> {
    projection
        .iter()
        .filter(|(key, expected)| current.get(*key) != Some(expected))
        .map(|(key, _)| key.clone())
        .collect()
}

/// Parse a memory string like `384m`, `1g` or `524288k` into bytes.
pub fn parse_mem_string(raw: &str) -> Result<i64, ValidationError> {
    let raw = raw.trim().to_lowercase();
    let (digits, multiplier) = match raw.strip_suffix(&['k', 'm', 'g'][..]) {
        Some(digits) => {
            let multiplier = match raw.as_bytes()[raw.len() - 1] {
                b'k' => 1024,
                b'm' => 1024 * 1024,
                _ => 1024 * 1024 * 1024,
            };
            (digits, multiplier)
        }
        None => (raw.as_str(), 1),
    };
    digits
        .parse::<i64>()
        .map(|n| n * multiplier)
        .map_err(|_| ValidationError(format!("Valor de memória inválido: '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    #[test]
    fn names_derive_from_instance_name() {
        let config = test_config();
        assert_eq!(container_name("alice"), "engine-alice");
        assert_eq!(volume_name("alice"), "engine-data-alice");
        assert_eq!(subdomain(&config, "alice"), "alice.n8n.example.com");
        assert_eq!(
            instance_url(&config, "alice"),
            "https://alice.n8n.example.com"
        );
    }

    #[test]
    fn valid_names_pass() {
        for name in ["alice", "a1", "my-shop-2", "00"] {
            assert_eq!(validate_instance_name(name).unwrap(), name);
        }
        // surrounding whitespace is trimmed
        assert_eq!(validate_instance_name(" alice ").unwrap(), "alice");
    }

    #[test]
    fn invalid_names_are_rejected_with_the_exact_message() {
        for name in ["Alice!", "a", "-alice", "alice-", "UPPER", "a_b", "a.b"] {
            let err = validate_instance_name(name).unwrap_err();
            assert_eq!(
                err.to_string(),
                "Nome deve conter apenas letras minusculas, numeros e hifens (2-32 chars)"
            );
        }
        // 33 characters total exceeds the limit
        let long = "a".repeat(33);
        assert!(validate_instance_name(&long).is_err());
        // 32 is the maximum
        let max = "a".repeat(32);
        assert!(validate_instance_name(&max).is_ok());
    }

    #[test]
    fn empty_name_has_its_own_message() {
        assert_eq!(
            validate_instance_name("  ").unwrap_err().to_string(),
            "Nome obrigatório"
        );
    }

    #[test]
    fn versions_accept_latest_and_semver() {
        for version in ["latest", "1.0.0", "1.123.20", "1.999.999"] {
            assert_eq!(validate_version(version).unwrap(), version);
        }
        for version in ["2.0.0", "1.0", "1.0.0.0", "1.1000.0", "v1.2.3", ""] {
            assert!(validate_version(version).is_err(), "{version}");
        }
    }

    #[test]
    fn encryption_keys_are_64_hex_chars_and_unique() {
        let key = generate_encryption_key();
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(key, generate_encryption_key());
    }

    #[test]
    fn env_projection_carries_the_key_and_urls() {
        let config = test_config();
        let env = build_env(&config, "alice", "deadbeef");
        assert_eq!(env["N8N_ENCRYPTION_KEY"], "deadbeef");
        assert_eq!(env["N8N_EDITOR_BASE_URL"], "https://alice.n8n.example.com/");
        assert_eq!(env["WEBHOOK_URL"], "https://alice.n8n.example.com/");
        assert_eq!(env["N8N_PROTOCOL"], "https");
        assert_eq!(env["N8N_PORT"], "5678");
        assert_eq!(env["GENERIC_TIMEZONE"], "America/Sao_Paulo");
    }

    #[test]
    fn labels_match_the_proxy_contract_bit_for_bit() {
        let config = test_config();
        let labels = build_labels(&config, "alice", "2026-01-01T00:00:00Z");
        assert_eq!(labels["traefik.enable"], "true");
        assert_eq!(
            labels["traefik.http.routers.engine-alice.rule"],
            "Host(`alice.n8n.example.com`)"
        );
        assert_eq!(
            labels["traefik.http.services.engine-alice.loadbalancer.server.port"],
            "5678"
        );
        assert_eq!(
            labels["traefik.http.routers.engine-alice.entrypoints"],
            "websecure"
        );
        assert_eq!(
            labels["traefik.http.routers.engine-alice.tls.certresolver"],
            "letsencrypt"
        );
        assert_eq!(labels["app.type"], "engine");
        assert_eq!(labels["app.instance"], "alice");
        assert_eq!(labels["app.created_at"], "2026-01-01T00:00:00Z");
    }

    #[test]
    fn tls_labels_are_absent_when_ssl_is_off() {
        let mut config = test_config();
        config.ssl_enabled = false;
        let labels = build_labels(&config, "alice", "2026-01-01T00:00:00Z");
        assert!(!labels.contains_key("traefik.http.routers.engine-alice.entrypoints"));
        assert!(!labels.contains_key("traefik.http.routers.engine-alice.tls.certresolver"));
        assert_eq!(labels["traefik.enable"], "true");
    }

    #[test]
    fn env_list_round_trips() {
        let config = test_config();
        let env = build_env(&config, "alice", "deadbeef");
        let list = env_to_list(&env);
        assert_eq!(env_from_list(&list), env);
        assert_eq!(extract_encryption_key(&list).as_deref(), Some("deadbeef"));
    }

    #[test]
    fn drift_is_detected_only_on_recognized_keys() {
        let config = test_config();
        let projection = build_env(&config, "alice", "key1");
        let mut current = projection.clone();
        // extra keys the engine injects itself are ignored
        current.insert("HOSTNAME".into(), "abc123".into());
        assert!(drift_keys(&projection, &current).is_empty());

        current.insert("GENERIC_TIMEZONE".into(), "UTC".into());
        current.remove("N8N_LOG_LEVEL");
        let drifted = drift_keys(&projection, &current);
        assert_eq!(drifted, vec!["GENERIC_TIMEZONE", "N8N_LOG_LEVEL"]);
    }

    #[test]
    fn mem_strings_parse_to_bytes() {
        assert_eq!(parse_mem_string("384m").unwrap(), 384 * 1024 * 1024);
        assert_eq!(parse_mem_string("1g").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_mem_string("512k").unwrap(), 512 * 1024);
        assert_eq!(parse_mem_string("1024").unwrap(), 1024);
        assert!(parse_mem_string("abc").is_err());
    }
}
