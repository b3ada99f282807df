//! Engine version discovery against the public image registry.

use serde::{Deserialize, Serialize};
use tracing::warn;

const TAGS_URL: &str = "https://registry.hub.docker.com/v2/repositories/n8nio/n8n/tags";
const MAX_VERSIONS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionOption {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct TagPage {
    results: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

/// Up to eight recent `1.X.Y` tags, newest first. Any failure falls back to
/// offering `latest` only.
pub async fn fetch_engine_versions(client: &reqwest::Client) -> Vec<VersionOption> {
    match fetch_tags(client).await {
        Ok(tags) => {
            let versions = select_versions(tags.into_iter());
            if versions.is_empty() {
                fallback_versions()
            } else {
                versions
            }
        }
        Err(err) => {
            warn!(error = %err, "registry tag listing failed; falling back to latest");
            fallback_versions()
        }
    }
}

async fn fetch_tags(client: &reqwest::Client) -> anyhow::Result<Vec<String>> {
    let page: TagPage = client
        .get(TAGS_URL)
        .query(&[("page_size", "50"), ("ordering", "last_updated")])
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(page.results.into_iter().map(|t| t.name).collect())
}

/// Keep the first eight distinct semver tags in registry order (most recently
/// updated first), then sort them descending by version.
pub fn select_versions(tags: impl Iterator<Item = String>) -> Vec<VersionOption> {
    let mut seen = std::collections::HashSet::new();
    let mut picked: Vec<(u32, u32, u32)> = Vec::new();

    for tag in tags {
        if picked.len() >= MAX_VERSIONS {
            break;
        }
        let Some(version) = parse_semver(&tag) else {
            continue;
        };
        if seen.insert(version) {
            picked.push(version);
        }
    }

    picked.sort_unstable_by(|a, b| b.cmp(a));
    picked
        .into_iter()
        .map(|(major, minor, patch)| {
            let tag = format!("{major}.{minor}.{patch}");
            VersionOption {
                id: tag.clone(),
                name: tag,
            }
        })
        .collect()
}

pub fn fallback_versions() -> Vec<VersionOption> {
    vec![VersionOption {
        id: "latest".to_string(),
        name: "latest".to_string(),
    }]
}

/// `1.X.Y` only — prerelease and task-runner tags are excluded.
fn parse_semver(tag: &str) -> Option<(u32, u32, u32)> {
    let mut parts = tag.split('.');
    let major = parts.next()?.parse().ok()?;
    if major != 1 {
        return None;
    }
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}
