//! Cooperative interruption. Ctrl-C flips a watch channel; pacing sleeps and
//! page fetches race against it so the engine stops between writes.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

impl Shutdown {
    pub fn new() -> (ShutdownTrigger, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger { tx }, Shutdown { rx })
    }

    /// Install a Ctrl-C listener that fires the returned handle.
    pub fn on_ctrl_c() -> Shutdown {
        let (trigger, shutdown) = Self::new();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, finishing current step and saving progress");
                trigger.trigger();
            }
        });
        shutdown
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested; never resolves if the trigger is
    /// dropped without firing.
    pub async fn requested(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Run `fut` unless shutdown arrives first.
    pub async fn guard<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        if self.is_triggered() {
            return None;
        }
        tokio::select! {
            out = fut => Some(out),
            _ = self.requested() => None,
        }
    }

    /// Sleep for `duration`; `false` if interrupted.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        self.guard(tokio::time::sleep(duration)).await.is_some()
    }
}
