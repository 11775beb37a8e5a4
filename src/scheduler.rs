use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::engine::Engine;
use crate::models::PortalKind;

/// Fixed-interval driver of [`Engine::tick`] for one portal kind.
pub struct Scheduler {
    engine: Arc<Engine>,
    kind: PortalKind,
    every: Duration,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>, kind: PortalKind, every: Duration) -> Self {
        Self { engine, kind, every }
    }

    /// Ticks until `shutdown` flips to `true` or its sender is dropped. A tick
    /// that already started always runs to completion.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!("{} checks every {}s", self.kind, self.every.as_secs());

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if *shutdown.borrow() {
                break;
            }
            self.engine.tick(self.kind, Utc::now()).await;
        }
        log::info!("{} scheduler stopped", self.kind);
    }
}
