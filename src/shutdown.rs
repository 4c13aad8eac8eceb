use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{Stream, StreamExt};
use tokio::sync::Notify;

/// Process-wide stop signal. Unlike a bare `Notify`, a task that starts
/// waiting after the signal fired still sees it.
#[derive(Default)]
pub struct Shutdown {
    fired: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.fired.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        let notified = self.notify.notified();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}

#[derive(Debug, PartialEq)]
pub enum Next<T> {
    Item(T),
    Ended,
    Shutdown,
}

/// Await the next item from a stream or the shutdown signal, whichever
/// comes first.
pub async fn select_stream_or_shutdown<T>(
    mut stream: Pin<&mut (dyn Stream<Item = T> + Send)>,
    shutdown: &Shutdown,
) -> Next<T> {
    tokio::select! {
        biased;
        _ = shutdown.wait() => Next::Shutdown,
        item = stream.next() => match item {
            Some(item) => Next::Item(item),
            None => Next::Ended,
        },
    }
}
