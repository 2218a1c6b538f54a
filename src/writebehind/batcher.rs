use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

/// Collects the next micro-batch from `rx`.
///
/// Waits for the first event, then keeps buffering until either
/// `batch_size` events are held or `window` has elapsed since that first
/// event, whichever comes first. A closed channel flushes whatever is
/// buffered; `None` means the channel is closed and drained.
pub async fn next_batch<T>(
    rx: &mut mpsc::Receiver<T>,
    batch_size: usize,
    window: Duration,
) -> Option<Vec<T>> {
    let first = rx.recv().await?;

    let mut buffer = Vec::with_capacity(batch_size.min(64));
    buffer.push(first);

    // The window opens when the first event of the batch arrives, not when
    // the consumer started waiting.
    let deadline = Instant::now() + window;

    while buffer.len() < batch_size {
        tokio::select! {
            item = rx.recv() => match item {
                Some(item) => buffer.push(item),
                None => break,
            },
            _ = tokio::time::sleep_until(deadline) => break,
        }
    }

    Some(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn flushes_when_batch_size_reached() {
        let (tx, mut rx) = mpsc::channel(16);

        for i in 0..5 {
            tx.send(i).await.unwrap();
        }

        let batch = next_batch(&mut rx, 3, Duration::from_secs(30)).await.unwrap();
        assert_eq!(batch, vec![0, 1, 2]);

        let batch = next_batch(&mut rx, 3, Duration::from_millis(50)).await.unwrap();
        assert_eq!(batch, vec![3, 4]);
    }

    #[tokio::test]
    async fn flushes_partial_batch_when_window_elapses() {
        let (tx, mut rx) = mpsc::channel(16);

        tx.send("a").await.unwrap();
        tx.send("b").await.unwrap();

        let started = Instant::now();
        let batch = next_batch(&mut rx, 100, Duration::from_millis(80)).await.unwrap();

        assert_eq!(batch, vec!["a", "b"]);
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn closed_channel_flushes_then_ends() {
        let (tx, mut rx) = mpsc::channel(16);

        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        drop(tx);

        let batch = next_batch(&mut rx, 100, Duration::from_secs(30)).await.unwrap();
        assert_eq!(batch, vec![1, 2]);

        assert!(next_batch(&mut rx, 100, Duration::from_secs(30)).await.is_none());
    }
}
