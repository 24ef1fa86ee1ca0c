//! Interrupt handling and one-shot cleanup

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Cooperative stop flag polled by the training loop at batch boundaries
///
/// Setup stages that block on I/O can also await [`CancellationToken::cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolve once the token is cancelled
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// What the process should do after an interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    /// Let the run unwind cooperatively
    Stop,
    /// Cleanup already ran; leave with status 0
    Exit,
}

/// React to one interrupt
///
/// The first interrupt cancels `token`. A second one runs the cleanup hooks
/// (a no-op if they already ran) and asks for an immediate exit.
pub fn on_interrupt(token: &CancellationToken, shutdown: &Shutdown) -> InterruptAction {
    if token.is_cancelled() {
        warn!("Second interrupt received, cleaning up and exiting");
        shutdown.cleanup();
        return InterruptAction::Exit;
    }
    info!("Interrupt received, stopping after the current batch");
    token.cancel();
    InterruptAction::Stop
}

/// Route SIGINT to `token` and `shutdown` via [`on_interrupt`]
pub fn install_interrupt_handler(token: CancellationToken, shutdown: Arc<Shutdown>) -> Result<()> {
    ctrlc::set_handler(move || {
        if on_interrupt(&token, &shutdown) == InterruptAction::Exit {
            std::process::exit(0);
        }
    })
    .map_err(|e| Error::internal(format!("failed to install interrupt handler: {}", e)))
}

type Hook = Box<dyn FnOnce() + Send>;

/// Cleanup hooks that run exactly once however the run ends
#[derive(Default)]
pub struct Shutdown {
    done: AtomicBool,
    hooks: Mutex<Vec<Hook>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a hook; hooks run in reverse registration order
    pub fn register<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.hooks.lock().push(Box::new(hook));
    }

    /// Run every registered hook, returning false if cleanup already ran
    pub fn cleanup(&self) -> bool {
        if self.done.swap(true, Ordering::SeqCst) {
            return false;
        }
        let hooks = std::mem::take(&mut *self.hooks.lock());
        for hook in hooks.into_iter().rev() {
            hook();
        }
        true
    }
}

impl std::fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shutdown")
            .field("done", &self.done.load(Ordering::SeqCst))
            .field("hooks", &self.hooks.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_token_is_shared_between_clones() {
        let token = CancellationToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        token.cancel();
        assert!(observer.is_cancelled());
    }

    #[test]
    fn test_cleanup_runs_once() {
        let shutdown = Shutdown::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        shutdown.register(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(shutdown.cleanup());
        assert!(!shutdown.cleanup());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_second_interrupt_cleans_up_once() {
        let token = CancellationToken::new();
        let shutdown = Shutdown::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        shutdown.register(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(on_interrupt(&token, &shutdown), InterruptAction::Stop);
        assert!(token.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(on_interrupt(&token, &shutdown), InterruptAction::Exit);
        assert_eq!(on_interrupt(&token, &shutdown), InterruptAction::Exit);
        assert!(!shutdown.cleanup());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiters() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        token.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        // Already cancelled: resolves immediately
        token.cancelled().await;
    }

    #[test]
    fn test_hooks_run_in_reverse_order() {
        let shutdown = Shutdown::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            shutdown.register(move || order.lock().push(i));
        }
        shutdown.cleanup();
        assert_eq!(*order.lock(), vec![2, 1, 0]);
    }
}
