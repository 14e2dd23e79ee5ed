//! Failure injection and token regeneration
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{watch, Mutex};
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

use super::{NodeShared, NodeState};
use crate::error::{Result, TokenMeshError};

/// Crashes and restores a node, and runs the regeneration watchdog.
#[derive(Clone)]
pub struct FailureController {
    shared: Arc<NodeShared>,
    // fail/recover must not interleave with each other's transport calls
    lifecycle: Arc<Mutex<()>>,
}

impl FailureController {
    pub(crate) fn new(shared: Arc<NodeShared>) -> Self {
        Self {
            shared,
            lifecycle: Arc::new(Mutex::new(())),
        }
    }

    /// Mark the node failed, drop its token and make it unreachable.
    pub async fn fail(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.shared.step(|p| p.fail())?;
        self.shared.sender.suspend().await;
        warn!("[Node<{}>] Node failed", self.shared.id);
        Ok(())
    }

    /// Bring a failed node back. It resumes cycling from IDLE.
    pub async fn recover(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        // reject before touching the transport
        self.shared.with_protocol(|p| {
            if p.is_failed() {
                Ok(())
            } else {
                Err(TokenMeshError::InvalidTransition {
                    from: p.state(),
                    to: NodeState::Idle,
                })
            }
        })??;
        self.shared.sender.resume().await?;
        self.shared.step(|p| p.recover(Instant::now()))?;
        info!("[Node<{}>] Node recovered", self.shared.id);
        Ok(())
    }

    /// Periodically check whether the token looks lost and regenerate it.
    pub(crate) async fn run_watchdog(self, mut shutdown: watch::Receiver<bool>) {
        let id = self.shared.id;
        let timeout = self.shared.timing.token_loss_timeout;
        let mut ticker = time::interval(self.shared.timing.regeneration_check);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "[Node<{}>] Regeneration watchdog started (timeout {:?})",
            id, timeout
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.shared.step_optional(|p| p.try_regenerate(Instant::now(), timeout)) {
                        Ok(Some(effects)) => self.shared.deliver(effects).await,
                        Ok(None) => {}
                        Err(e) => error!("[Node<{}>] Regeneration check failed: {}", id, e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("[Node<{}>] Regeneration watchdog stopped", id);
    }
}
