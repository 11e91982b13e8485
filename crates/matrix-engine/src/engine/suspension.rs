//! Operator-driven suspension of the step loop.

use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Suspension record shared by the driver and the control surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SuspensionState {
    /// Operator asked to pause before the next action.
    pub paused: bool,

    /// Driver is blocked waiting for the operator.
    pub suspended: bool,

    /// Why the driver is blocked.
    pub reason: Option<String>,

    /// Replay of the current step is offered to the operator.
    pub replay_offered: bool,

    /// Operator asked to replay the current step.
    pub replay_requested: bool,

    /// Driver waits for a step start time.
    pub waiting_for_start: bool,

    /// Operator asked to start the step without waiting.
    pub skip_wait: bool,
}

/// What the operator decided while the driver was suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendOutcome {
    Continue,
    Replay,
    Interrupted,
}

/// Suspension state machine: one lock plus change notification.
#[derive(Debug)]
pub struct Suspension {
    state: watch::Sender<SuspensionState>,
}

impl Suspension {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SuspensionState::default());
        Self { state }
    }

    pub fn snapshot(&self) -> SuspensionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SuspensionState> {
        self.state.subscribe()
    }

    /// Driver is blocked or will block before the next action.
    pub fn is_suspended(&self) -> bool {
        let state = self.state.borrow();
        state.suspended || state.paused
    }

    pub fn is_paused(&self) -> bool {
        self.state.borrow().paused
    }

    /// Pause before the next action.
    pub fn pause(&self) {
        self.state.send_modify(|s| s.paused = true);
    }

    /// Resume a paused or suspended driver, or skip a start-time wait.
    pub fn continue_execution(&self) {
        self.state.send_modify(|s| {
            s.paused = false;
            s.suspended = false;
            if s.waiting_for_start {
                s.skip_wait = true;
            }
        });
    }

    /// Resume and replay the current step.
    pub fn replay_step(&self) {
        self.state.send_modify(|s| {
            s.replay_requested = true;
            s.paused = false;
            s.suspended = false;
        });
    }

    /// Block until the operator continues or asks for replay.
    pub async fn suspend(
        &self,
        reason: impl Into<String>,
        replay_offered: bool,
        cancel: &CancellationToken,
    ) -> SuspendOutcome {
        let reason = reason.into();
        tracing::info!(reason = %reason, replay_offered, "Execution suspended");
        self.state.send_modify(|s| {
            s.suspended = true;
            s.reason = Some(reason);
            s.replay_offered = replay_offered;
            s.replay_requested = false;
        });

        let mut rx = self.state.subscribe();
        let resumed = tokio::select! {
            r = rx.wait_for(|s| !s.suspended) => r.is_ok(),
            _ = cancel.cancelled() => false,
        };

        let mut replay = false;
        self.state.send_modify(|s| {
            s.suspended = false;
            s.reason = None;
            s.replay_offered = false;
            replay = std::mem::take(&mut s.replay_requested);
        });

        if !resumed {
            SuspendOutcome::Interrupted
        } else if replay {
            tracing::info!("Replay requested");
            SuspendOutcome::Replay
        } else {
            SuspendOutcome::Continue
        }
    }

    /// Block while paused. Returns false if interrupted.
    pub async fn wait_while_paused(&self, cancel: &CancellationToken) -> bool {
        if !self.is_paused() {
            return true;
        }
        tracing::info!("Execution paused");
        let mut rx = self.state.subscribe();
        let resumed = tokio::select! {
            r = rx.wait_for(|s| !s.paused) => r.is_ok(),
            _ = cancel.cancelled() => false,
        };
        resumed
    }

    /// Wait for a step start time. Returns false if interrupted.
    pub async fn wait_for_start(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        self.state.send_modify(|s| {
            s.waiting_for_start = true;
            s.skip_wait = false;
        });
        let mut rx = self.state.subscribe();
        let completed = tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            r = rx.wait_for(|s| s.skip_wait) => r.is_ok(),
            _ = cancel.cancelled() => false,
        };
        self.state.send_modify(|s| {
            s.waiting_for_start = false;
            s.skip_wait = false;
        });
        completed
    }
}

impl Default for Suspension {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_suspend_continue() {
        let suspension = Arc::new(Suspension::new());
        let cancel = CancellationToken::new();

        let s = suspension.clone();
        let c = cancel.clone();
        let waiter = tokio::spawn(async move { s.suspend("Step1 failed", true, &c).await });

        while !suspension.snapshot().suspended {
            tokio::task::yield_now().await;
        }
        assert!(suspension.is_suspended());
        assert!(suspension.snapshot().replay_offered);

        suspension.continue_execution();
        assert_eq!(waiter.await.unwrap(), SuspendOutcome::Continue);
        assert!(!suspension.is_suspended());
    }

    #[tokio::test]
    async fn test_suspend_replay() {
        let suspension = Arc::new(Suspension::new());
        let cancel = CancellationToken::new();

        let s = suspension.clone();
        let c = cancel.clone();
        let waiter = tokio::spawn(async move { s.suspend("ask", false, &c).await });

        while !suspension.snapshot().suspended {
            tokio::task::yield_now().await;
        }
        suspension.replay_step();
        assert_eq!(waiter.await.unwrap(), SuspendOutcome::Replay);
        assert!(!suspension.snapshot().replay_requested);
    }

    #[tokio::test]
    async fn test_suspend_interrupted() {
        let suspension = Suspension::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(
            suspension.suspend("ask", false, &cancel).await,
            SuspendOutcome::Interrupted
        );
        assert!(!suspension.snapshot().suspended);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let suspension = Arc::new(Suspension::new());
        let cancel = CancellationToken::new();
        suspension.pause();
        assert!(suspension.is_suspended());

        let s = suspension.clone();
        let c = cancel.clone();
        let waiter = tokio::spawn(async move { s.wait_while_paused(&c).await });
        tokio::task::yield_now().await;
        suspension.continue_execution();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_for_start_skipped() {
        let suspension = Arc::new(Suspension::new());
        let cancel = CancellationToken::new();

        let s = suspension.clone();
        let c = cancel.clone();
        let waiter =
            tokio::spawn(async move { s.wait_for_start(Duration::from_secs(3600), &c).await });
        while !suspension.snapshot().waiting_for_start {
            tokio::task::yield_now().await;
        }
        suspension.continue_execution();
        assert!(waiter.await.unwrap());
        assert!(!suspension.snapshot().waiting_for_start);
    }
}
