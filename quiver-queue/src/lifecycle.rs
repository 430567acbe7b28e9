//! Start/stop state machine for long-running components.
//!
//! Components supply ordered [`Hook`]s. Starting runs every `up` hook in
//! order; stopping runs the `down` hooks in reverse. A shutdown requested
//! while starting rolls back the hooks that already ran.
//!
//! ```text
//! Down ──► GoingUp ──► Up ──► GoingDown ──► Down
//!             │                  ▲  │
//!             └──────────────────┘  └─► GoingDown (clean-up loop)
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{QueueError, QueueResult};

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Stopped.
    Down,
    /// Running `up` hooks.
    GoingUp,
    /// Running.
    Up,
    /// Running `down` or clean-up hooks.
    GoingDown,
}

impl LifecycleState {
    /// Check if moving to `next` is allowed.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Down, GoingUp)
                | (GoingUp, Up)
                | (GoingUp, GoingDown)
                | (Up, GoingDown)
                | (GoingDown, Down)
                | (GoingDown, GoingDown)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Down => "down",
            LifecycleState::GoingUp => "going-up",
            LifecycleState::Up => "up",
            LifecycleState::GoingDown => "going-down",
        };
        f.write_str(name)
    }
}

/// One start/stop step of a component.
#[async_trait]
pub trait Hook: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Bring the step up.
    async fn up(&self) -> QueueResult<()>;

    /// Bring the step down.
    async fn down(&self) -> QueueResult<()>;

    /// Whether [`cleanup`](Hook::cleanup) must run after every hook is down.
    fn cleanup_required(&self) -> bool {
        false
    }

    /// Release what the step left behind.
    async fn cleanup(&self) -> QueueResult<()> {
        Ok(())
    }
}

/// A background task with its own stop signal.
pub(crate) struct Task {
    stop: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Task {
    pub fn new() -> Self {
        Self {
            stop: watch::channel(false).0,
            handle: Mutex::new(None),
        }
    }

    pub fn spawn<F, Fut>(&self, run: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.stop.send_replace(false);
        let handle = tokio::spawn(run(self.stop.subscribe()));
        *self.handle.lock() = Some(handle);
    }

    pub async fn stop(&self) {
        self.stop.send_replace(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "background task ended abnormally");
        }
    }
}

/// State machine driving a list of hooks.
pub struct Lifecycle {
    name: String,
    state: Mutex<LifecycleState>,
    shutdown_requested: AtomicBool,
    hooks: Vec<Arc<dyn Hook>>,
}

impl Lifecycle {
    /// Create a lifecycle over `hooks`, run in order on start.
    pub fn new(name: impl Into<String>, hooks: Vec<Arc<dyn Hook>>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(LifecycleState::Down),
            shutdown_requested: AtomicBool::new(false),
            hooks,
        }
    }

    /// Current state.
    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// Check if running.
    pub fn is_up(&self) -> bool {
        self.state() == LifecycleState::Up
    }

    /// Check if a shutdown was requested and has not finished yet.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    fn transition(&self, next: LifecycleState) -> QueueResult<()> {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            return Err(QueueError::Lifecycle(format!(
                "{}: cannot go from {} to {}",
                self.name, *state, next
            )));
        }
        debug!(component = %self.name, from = %*state, to = %next, "lifecycle transition");
        *state = next;
        Ok(())
    }

    /// Run every `up` hook.
    ///
    /// Returns `false` when a shutdown arrived during start-up; the hooks
    /// that already ran have been rolled back and the state is `Down`.
    pub async fn start(&self) -> QueueResult<bool> {
        self.transition(LifecycleState::GoingUp)?;
        self.shutdown_requested.store(false, Ordering::Release);

        let mut started = 0;
        for hook in &self.hooks {
            if self.is_shutting_down() {
                break;
            }
            if let Err(e) = hook.up().await {
                warn!(component = %self.name, hook = hook.name(), error = %e, "start-up hook failed");
                self.rollback(started).await;
                return Err(e);
            }
            started += 1;
        }

        if !self.mark_up() {
            info!(component = %self.name, "shutdown requested during start-up, rolling back");
            self.rollback(started).await;
            return Ok(false);
        }
        info!(component = %self.name, "up");
        Ok(true)
    }

    /// Move `GoingUp` to `Up` unless a shutdown was flagged.
    ///
    /// `shutdown` sets the flag under the same lock, so a request can never
    /// land between the check and the transition.
    fn mark_up(&self) -> bool {
        let mut state = self.state.lock();
        if *state != LifecycleState::GoingUp || self.is_shutting_down() {
            return false;
        }
        debug!(component = %self.name, from = %*state, to = %LifecycleState::Up, "lifecycle transition");
        *state = LifecycleState::Up;
        true
    }

    async fn rollback(&self, started: usize) {
        // GoingUp -> GoingDown cannot fail
        let _ = self.transition(LifecycleState::GoingDown);
        for hook in self.hooks[..started].iter().rev() {
            if let Err(e) = hook.down().await {
                warn!(component = %self.name, hook = hook.name(), error = %e, "rollback hook failed");
            }
        }
        self.finish();
    }

    fn finish(&self) {
        *self.state.lock() = LifecycleState::Down;
        self.shutdown_requested.store(false, Ordering::Release);
    }

    /// Stop the component.
    ///
    /// From `GoingUp` this only flags the request; [`start`](Self::start)
    /// rolls back. From `Up` the `down` hooks run in reverse, then one
    /// clean-up pass if any hook asks for it. The first hook error is
    /// returned after every hook has run.
    pub async fn shutdown(&self) -> QueueResult<()> {
        {
            let mut state = self.state.lock();
            match *state {
                LifecycleState::Down | LifecycleState::GoingDown => return Ok(()),
                LifecycleState::GoingUp => {
                    self.shutdown_requested.store(true, Ordering::Release);
                    return Ok(());
                }
                LifecycleState::Up => {
                    self.shutdown_requested.store(true, Ordering::Release);
                    *state = LifecycleState::GoingDown;
                }
            }
        }
        info!(component = %self.name, "going down");

        let mut first_error = None;
        for hook in self.hooks.iter().rev() {
            if let Err(e) = hook.down().await {
                warn!(component = %self.name, hook = hook.name(), error = %e, "shutdown hook failed");
                first_error.get_or_insert(e);
            }
        }

        let pending: Vec<_> = self.hooks.iter().filter(|h| h.cleanup_required()).collect();
        if !pending.is_empty() {
            self.transition(LifecycleState::GoingDown)?;
            for hook in pending {
                if let Err(e) = hook.cleanup().await {
                    warn!(component = %self.name, hook = hook.name(), error = %e, "clean-up failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        self.finish();
        info!(component = %self.name, "down");
        first_error.map_or(Ok(()), Err)
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("hooks", &self.hooks.len())
            .finish()
    }
}
