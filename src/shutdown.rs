use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// One-shot shutdown signal shared by the server, maintenance task and worker slots.
///
/// The flag makes the signal sticky: a task that starts waiting after `trigger`
/// returns immediately instead of missing the notification.
#[derive(Debug, Default)]
pub struct Shutdown {
    triggered: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}
