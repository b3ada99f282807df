//! Time-based eviction sweeper.
//!
//! Instances older than `CLEANUP_MAX_AGE_DAYS` are removed, container and
//! data volume both. The first tick is delayed so startup is never blocked,
//! and no error ever escapes the loop.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::kernel::instance::InstanceManager;

const INITIAL_DELAY: Duration = Duration::from_secs(60);

/// Should this instance be evicted?
pub fn is_expired(age_days: Option<i64>, max_age_days: i64) -> bool {
    age_days.is_some_and(|age| age >= max_age_days)
}

pub async fn run_sweeper(
    instances: Arc<InstanceManager>,
    config: Arc<Config>,
    shutdown: CancellationToken,
) {
    info!(
        interval_seconds = config.cleanup_interval_seconds,
        max_age_days = config.cleanup_max_age_days,
        "eviction sweeper started"
    );

    tokio::select! {
        _ = shutdown.cancelled() => return,
        _ = tokio::time::sleep(INITIAL_DELAY) => {}
    }

    loop {
        if let Err(err) = sweep_once(&instances, &config).await {
            error!(error = %err, "sweep failed");
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(config.cleanup_interval_seconds)) => {}
        }
    }
    info!("eviction sweeper stopped");
}

async fn sweep_once(instances: &InstanceManager, config: &Config) -> anyhow::Result<()> {
    let views = instances.list().await?;
    let total = views.len();
    let mut removed = 0;

    for view in views {
        if !is_expired(view.age_days, config.cleanup_max_age_days) {
            continue;
        }
        match instances.remove(&view.name).await {
            Ok(()) => {
                removed += 1;
                info!(
                    instance = %view.name,
                    age_days = view.age_days,
                    "expired instance removed"
                );
            }
            Err(err) => error!(instance = %view.name, error = %err, "eviction failed"),
        }
    }

    if removed > 0 {
        info!(removed, "sweep finished");
    } else {
        info!(active = total, "no expired instances");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instances_at_or_past_max_age_expire() {
        assert!(is_expired(Some(5), 5));
        assert!(is_expired(Some(6), 5));
        assert!(!is_expired(Some(4), 5));
    }

    #[test]
    fn unknown_age_never_expires() {
        assert!(!is_expired(None, 5));
    }
}
