//! Bounded-queue plumbing for streaming chat-completion responses.
//!
//! A background task (spawned by the chat handler, see
//! [`crate::routes::chat`]) pumps raw upstream bytes into a bounded channel;
//! the HTTP response body reads from the channel until it sees the
//! sentinel. This decouples slot release from the client's read behavior:
//! if the client disconnects mid-stream, the background task still drains
//! the upstream body, persists the snapshot, and releases the slot, because
//! none of that depends on anyone still reading from the queue.

use axum::body::Body;
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::Response;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

/// Matches §4.5's "bounded queue (capacity 16)".
pub const QUEUE_CAPACITY: usize = 16;

/// One item flowing through the queue: either a chunk of upstream bytes or
/// the terminal sentinel.
pub enum StreamEvent {
    Chunk(Bytes),
    End,
}

/// Create the queue and the axum response body that drains it. The body
/// stops at the first [`StreamEvent::End`]; no bytes for it are ever
/// written to the client, it only tells the body to stop polling.
pub fn channel() -> (mpsc::Sender<StreamEvent>, Body) {
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    let body_stream = ReceiverStream::new(rx).map_while(|event| match event {
        StreamEvent::Chunk(bytes) => Some(Ok::<Bytes, std::io::Error>(bytes)),
        StreamEvent::End => None,
    });
    (tx, Body::from_stream(body_stream))
}

/// Read `response` to completion, forwarding each chunk as a
/// [`StreamEvent::Chunk`]. Returns once the upstream body is exhausted or
/// errors; does not send the sentinel itself — that is the caller's job,
/// after it has run its own terminal actions (save, meta write, release).
///
/// Never panics on a mid-stream transport error: it is logged and treated
/// as end-of-stream, since the client has usually already received a
/// partial SSE stream by that point and there is nothing more useful to do
/// than stop.
pub async fn drain_upstream(response: Response, tx: &mpsc::Sender<StreamEvent>) {
    let mut bytes_stream = response.bytes_stream();
    while let Some(chunk) = bytes_stream.next().await {
        match chunk {
            Ok(bytes) => {
                if tx.send(StreamEvent::Chunk(bytes)).await.is_err() {
                    // Receiver (the HTTP body) is gone; the client has
                    // disconnected. Keep draining so upstream connection
                    // state stays clean, but no point holding more queue
                    // capacity.
                    continue;
                }
            }
            Err(err) => {
                warn!(error = %err, "upstream stream read failed, ending early");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn body_stops_reading_at_sentinel() {
        let (tx, body) = channel();
        tx.send(StreamEvent::Chunk(Bytes::from_static(b"hello "))).await.unwrap();
        tx.send(StreamEvent::Chunk(Bytes::from_static(b"world"))).await.unwrap();
        tx.send(StreamEvent::End).await.unwrap();
        // A chunk sent after End must never be observed by the body.
        drop(tx);

        let collected = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        assert_eq!(&collected[..], b"hello world");
    }

    #[tokio::test]
    async fn body_ends_cleanly_when_sender_is_dropped_without_sentinel() {
        let (tx, body) = channel();
        tx.send(StreamEvent::Chunk(Bytes::from_static(b"partial"))).await.unwrap();
        drop(tx);

        let collected = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        assert_eq!(&collected[..], b"partial");
    }
}
