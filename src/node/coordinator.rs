//! Coordination loop
//!
//! Each node runs one coordinator: think, request the critical section, wait
//! for the token, work, exit and pass the token on. Failure interrupts any
//! phase; the loop then parks until the node recovers.
//!
//! A cycle belongs to one failure epoch. If the node fails while the cycle
//! runs, the cycle is abandoned even when the node has already recovered by
//! the time the coordinator looks again.
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::time::{self, Instant};
use tracing::{debug, info};

use super::{Effects, NodeShared, NodeState, TokenProtocol};
use crate::error::{Result, TokenMeshError};

/// How a wait for the token ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenWait {
    Acquired,
    /// The node failed after the request was made; it may have recovered since
    Interrupted,
    Stopped,
}

pub struct Coordinator {
    shared: Arc<NodeShared>,
    rng: StdRng,
}

impl Coordinator {
    pub(crate) fn new(shared: Arc<NodeShared>) -> Self {
        Self {
            shared,
            rng: StdRng::from_os_rng(),
        }
    }

    pub async fn run(mut self) {
        let id = self.shared.id;
        info!("[Node<{}>] Coordination loop started", id);
        while !self.shared.is_stopped() {
            if let Err(e) = self.cycle().await {
                debug!("[Node<{}>] Cycle abandoned: {}", id, e);
            }
        }
        info!("[Node<{}>] Coordination loop stopped", id);
    }

    /// One think/request/work/exit round. Returns early, leaving the rest to
    /// the next round, whenever the node fails or stops.
    async fn cycle(&mut self) -> Result<()> {
        if !self.wait_until(|p| !p.is_failed()).await? {
            return Ok(());
        }
        let epoch = self.shared.with_protocol(|p| p.failure_epoch())?;

        let think = self.shared.timing.think.sample(&mut self.rng);
        if !self.pause(think, epoch).await? {
            return Ok(());
        }

        let effects = self.step_in(epoch, |p| {
            p.request_critical_section(std::time::Instant::now())
        })?;
        self.shared.deliver(effects).await;

        if self.shared.with_protocol(|p| p.state())? != NodeState::InCs {
            match self.wait_for_token(epoch).await? {
                TokenWait::Acquired => {}
                TokenWait::Interrupted | TokenWait::Stopped => return Ok(()),
            }
            self.step_in(epoch, |p| p.enter_critical_section())?;
        }

        let work = self.shared.timing.work.sample(&mut self.rng);
        debug!(
            "[Node<{}>] Working in critical section for {:?}",
            self.shared.id, work
        );
        if !self.pause(work, epoch).await? {
            return Ok(());
        }

        let effects = self.step_in(epoch, |p| p.exit_critical_section())?;
        self.shared.deliver(effects).await;
        Ok(())
    }

    /// Run a protocol step only if the node has not failed since `epoch`.
    fn step_in(
        &self,
        epoch: u64,
        f: impl FnOnce(&mut TokenProtocol) -> Result<Effects>,
    ) -> Result<Effects> {
        self.shared.step(|p| {
            if p.failure_epoch() != epoch {
                return Err(TokenMeshError::Node(format!(
                    "Node {} failed during its cycle",
                    p.id()
                )));
            }
            f(p)
        })
    }

    /// Block until the token is held, re-broadcasting the request every
    /// refresh interval.
    async fn wait_for_token(&self, epoch: u64) -> Result<TokenWait> {
        let refresh_every = self.shared.timing.request_refresh;
        let mut refresh = time::interval_at(Instant::now() + refresh_every, refresh_every);
        refresh.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            let notified = self.shared.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.is_stopped() {
                return Ok(TokenWait::Stopped);
            }
            let (current, state, holding) = self
                .shared
                .with_protocol(|p| (p.failure_epoch(), p.state(), p.has_token()))?;
            if current != epoch || state == NodeState::Failed {
                return Ok(TokenWait::Interrupted);
            }
            if holding {
                return Ok(TokenWait::Acquired);
            }
            if state != NodeState::Requesting {
                return Ok(TokenWait::Interrupted);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = refresh.tick() => {
                    if let Some(effects) = self.shared.step_optional(|p| p.refresh_request())? {
                        self.shared.deliver(effects).await;
                    }
                }
            }
        }
    }

    /// Sleep for `duration` unless the node fails or stops first. Returns
    /// `false` when interrupted.
    async fn pause(&self, duration: Duration, epoch: u64) -> Result<bool> {
        let deadline = Instant::now() + duration;
        let sleep = time::sleep_until(deadline);
        tokio::pin!(sleep);
        self.interruptible(sleep, epoch).await
    }

    /// Park until `ready` holds. Returns `false` if the node stops first.
    async fn wait_until(&self, ready: impl Fn(&TokenProtocol) -> bool) -> Result<bool> {
        loop {
            let notified = self.shared.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.is_stopped() {
                return Ok(false);
            }
            if self.shared.with_protocol(|p| ready(p))? {
                return Ok(true);
            }
            notified.await;
        }
    }

    async fn interruptible<F>(&self, mut until: std::pin::Pin<&mut F>, epoch: u64) -> Result<bool>
    where
        F: Future<Output = ()>,
    {
        loop {
            let notified = self.shared.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.is_stopped()
                || self
                    .shared
                    .with_protocol(|p| p.is_failed() || p.failure_epoch() != epoch)?
            {
                return Ok(false);
            }
            tokio::select! {
                _ = until.as_mut() => return Ok(true),
                _ = &mut notified => {}
            }
        }
    }
}
