//! Background tasks owned by a registry.
//!
//! Both tasks start when the settings source is first opened and stop when
//! the registry's shutdown signal fires.
//!
//! ```text
//! settings source ──changed──▶ invalidation listener ──▶ Registry::invalidate_all
//!                                                          └─▶ RetirementQueue
//! sweeper ──every sweep_interval──▶ RetirementQueue::sweep
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::registry::WeakRegistry;
use crate::retirement::RetirementQueue;

/// Spawn the task that invalidates the registry on every settings change.
///
/// Holds the registry weakly, so dropping every `Registry` clone also ends
/// the task.
pub(crate) fn spawn_invalidation_listener(
    registry: WeakRegistry,
    changes: watch::Receiver<u64>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(run_invalidation_listener(registry, changes, shutdown))
}

async fn run_invalidation_listener(
    registry: WeakRegistry,
    mut changes: watch::Receiver<u64>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("invalidation listener starting");

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    info!("settings source dropped, invalidation listener exiting");
                    break;
                }
                let version = *changes.borrow_and_update();
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let retired = registry.invalidate_all().await;
                info!(version, retired, "settings changed, registry invalidated");
            }
            _ = shutdown.changed() => {
                break;
            }
        }
    }

    debug!("invalidation listener stopped");
}

/// Spawn the task that periodically closes expired retirement entries.
pub(crate) fn spawn_sweeper(
    queue: Arc<RetirementQueue>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(run_sweeper(queue, interval, shutdown))
}

async fn run_sweeper(
    queue: Arc<RetirementQueue>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(?interval, grace = ?queue.grace(), "retirement sweeper starting");

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                queue.sweep();
            }
            _ = shutdown.changed() => {
                break;
            }
        }
    }

    debug!("retirement sweeper stopped");
}
