//! Cancellation of in-flight streams.
//!
//! Every `send` takes a fresh generation id. `cancel` (or [`AbortHandle::abort`])
//! retires the current generation and fires its abort signal; events are only
//! delivered through [`CancellationController::deliver`], which checks the
//! generation under a gate lock that cancellation also holds. Once `cancel`
//! returns, nothing from the cancelled stream reaches a handler, even if its
//! task is mid-chunk.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::watch;
use tracing::info;

/// Handle used to request cancellation of one stream.
///
/// Aborting through the handle has the same effect as
/// [`CancellationController::cancel`] while its stream is still the live one.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    generation: u64,
    tx: watch::Sender<bool>,
    state: Weak<ControllerState>,
}

impl AbortHandle {
    /// Generation of the stream this handle aborts.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Requests cancellation. Repeated calls are no-ops.
    pub fn abort(&self) {
        if let Some(state) = self.state.upgrade() {
            state.cancel_generation(self.generation, Some("aborted through handle"));
        }
        signal(&self.tx);
    }

    /// True once this handle's stream was cancelled by any means.
    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

fn signal(tx: &watch::Sender<bool>) {
    tx.send_if_modified(|aborted| !std::mem::replace(aborted, true));
}

/// Receiving side of a stream's abort signal, owned by the stream task.
#[derive(Debug)]
pub struct StreamToken {
    generation: u64,
    rx: watch::Receiver<bool>,
}

impl StreamToken {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True once the stream was cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the stream is cancelled; never resolves otherwise.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Sender dropped after natural completion: nothing can cancel us.
                std::future::pending::<()>().await;
            }
        }
    }
}

#[derive(Debug)]
struct Live {
    generation: u64,
    tx: watch::Sender<bool>,
}

#[derive(Debug, Default)]
struct ControllerState {
    generation: AtomicU64,
    gate: ReentrantMutex<()>,
    live: Mutex<Option<Live>>,
}

impl ControllerState {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn cancel_generation(&self, generation: u64, reason: Option<&str>) -> bool {
        let _gate = self.gate.lock();
        let is_live = self
            .live
            .lock()
            .as_ref()
            .is_some_and(|l| l.generation == generation);
        is_live && self.cancel_locked(reason)
    }

    /// Caller must hold the gate.
    fn cancel_locked(&self, reason: Option<&str>) -> bool {
        let Some(live) = self.live.lock().take() else {
            return false;
        };
        self.generation.fetch_add(1, Ordering::SeqCst);
        signal(&live.tx);
        info!(
            generation = live.generation,
            reason = reason.unwrap_or("cancelled by caller"),
            "stream cancelled"
        );
        true
    }
}

/// Binds one abort token per in-flight stream of a processor.
#[derive(Debug, Default)]
pub struct CancellationController {
    state: Arc<ControllerState>,
}

impl CancellationController {
    /// Creates a controller with no live stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels any live stream and issues a token for a new one.
    pub fn begin(&self) -> StreamToken {
        let _gate = self.state.gate.lock();
        self.state.cancel_locked(Some("superseded by a new request"));
        let generation = self.state.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = watch::channel(false);
        *self.state.live.lock() = Some(Live { generation, tx });
        StreamToken { generation, rx }
    }

    /// Cancels the live stream, if any. Returns true if one was cancelled.
    pub fn cancel(&self, reason: Option<&str>) -> bool {
        let _gate = self.state.gate.lock();
        self.state.cancel_locked(reason)
    }

    /// Marks `generation` as ended so later `cancel` calls are no-ops.
    pub fn complete(&self, generation: u64) {
        let mut live = self.state.live.lock();
        if live.as_ref().is_some_and(|l| l.generation == generation) {
            *live = None;
        }
    }

    /// True if events of `generation` may still be delivered.
    pub fn is_current(&self, generation: u64) -> bool {
        self.state.is_current(generation)
    }

    /// True while a stream is in flight.
    pub fn is_live(&self) -> bool {
        self.state.live.lock().is_some()
    }

    /// Abort handle of the live stream, for callers that cancel from elsewhere.
    pub fn abort_handle(&self) -> Option<AbortHandle> {
        self.state.live.lock().as_ref().map(|l| AbortHandle {
            generation: l.generation,
            tx: l.tx.clone(),
            state: Arc::downgrade(&self.state),
        })
    }

    /// Runs `deliver` only if `generation` is still current, holding the gate
    /// so a concurrent `cancel` or `abort` waits for the delivery to finish.
    pub fn deliver<R>(&self, generation: u64, deliver: impl FnOnce() -> R) -> Option<R> {
        let _gate = self.state.gate.lock();
        if !self.state.is_current(generation) {
            return None;
        }
        Some(deliver())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_supersedes_previous_token() {
        let controller = CancellationController::new();
        let first = controller.begin();
        let second = controller.begin();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert!(!controller.is_current(first.generation()));
        assert!(controller.is_current(second.generation()));
    }

    #[test]
    fn cancel_is_idempotent_and_noop_after_completion() {
        let controller = CancellationController::new();
        let token = controller.begin();
        assert!(controller.cancel(None));
        assert!(!controller.cancel(Some("again")));
        assert!(token.is_cancelled());

        let token = controller.begin();
        controller.complete(token.generation());
        assert!(!controller.is_live());
        assert!(!controller.cancel(None));
        assert!(controller.is_current(token.generation()));
    }

    #[test]
    fn deliver_skips_stale_generations() {
        let controller = CancellationController::new();
        let token = controller.begin();
        assert_eq!(controller.deliver(token.generation(), || 7), Some(7));
        controller.cancel(None);
        assert_eq!(controller.deliver(token.generation(), || 7), None);
    }

    #[test]
    fn cancel_from_inside_delivery_does_not_deadlock() {
        let controller = CancellationController::new();
        let token = controller.begin();
        let cancelled = controller.deliver(token.generation(), || controller.cancel(None));
        assert_eq!(cancelled, Some(true));
    }

    #[tokio::test]
    async fn cancelled_future_resolves_on_abort() {
        let controller = CancellationController::new();
        let mut token = controller.begin();
        let handle = controller.abort_handle().expect("live handle");
        handle.abort();
        handle.abort();
        assert!(handle.is_aborted());
        tokio::time::timeout(std::time::Duration::from_secs(1), token.cancelled())
            .await
            .expect("token should resolve");
    }

    #[test]
    fn abort_through_handle_retires_generation() {
        let controller = CancellationController::new();
        let token = controller.begin();
        let handle = controller.abort_handle().expect("live handle");
        handle.abort();
        assert!(token.is_cancelled());
        assert!(!controller.is_live());
        assert!(!controller.is_current(token.generation()));
        assert_eq!(controller.deliver(token.generation(), || ()), None);
        assert!(!controller.cancel(None));
    }

    #[test]
    fn stale_handle_does_not_cancel_newer_stream() {
        let controller = CancellationController::new();
        let first = controller.begin();
        let stale = controller.abort_handle().expect("live handle");
        let second = controller.begin();
        stale.abort();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert!(controller.is_live());
        assert!(controller.is_current(second.generation()));
    }

    #[test]
    fn abort_from_inside_delivery_blocks_later_deliveries() {
        let controller = CancellationController::new();
        let token = controller.begin();
        let handle = controller.abort_handle().expect("live handle");
        assert_eq!(controller.deliver(token.generation(), || handle.abort()), Some(()));
        assert_eq!(controller.deliver(token.generation(), || ()), None);
    }
}
