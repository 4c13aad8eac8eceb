use std::sync::Arc;

use tracing::info;

use crate::shutdown::{select_stream_or_shutdown, Next, Shutdown};
use crate::types::GenericBoxedStream;

/// Hand every item of `stream` to `handler` until the stream ends or
/// shutdown is signalled. `name` only shows up in logs.
pub async fn serve_stream<T>(
    name: &str,
    mut stream: GenericBoxedStream<T>,
    shutdown: Arc<Shutdown>,
    handler: impl Fn(T) -> tokio::task::JoinHandle<()> + Send + Sync + 'static,
) {
    loop {
        match select_stream_or_shutdown(stream.as_mut(), &shutdown).await {
            Next::Item(item) => {
                handler(item);
            }
            Next::Ended => {
                info!("{} listener closed", name);
                break;
            }
            Next::Shutdown => {
                info!("{} listener shutting down", name);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn dispatches_each_item() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let stream: GenericBoxedStream<usize> = Box::pin(futures_util::stream::iter(vec![1, 2, 3]));
        serve_stream("test", stream, Arc::new(Shutdown::new()), move |n| {
            let counter = counter.clone();
            tokio::spawn(async move {
                counter.fetch_add(n, Ordering::SeqCst);
            })
        })
        .await;
        // handlers may still be running
        for _ in 0..10 {
            if seen.load(Ordering::SeqCst) == 6 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 6);
    }
}
