//! Per-session output fan-out with replay.
//!
//! Every session gets a broadcast publisher for live bytes and a
//! [`ByteRing`] holding recent history. Hydrated subscriptions take the ring
//! snapshot and the live receiver under the same borrow, so no chunk is lost
//! or duplicated between the two.

use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream};
use futures_util::{future, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{trace, warn};

use crate::ring_buffer::ByteRing;

/// Stream of raw output chunks.
pub type OutputStream = BoxStream<'static, Bytes>;

/// Text-shaped output event (lossy UTF-8 view of the raw stream).
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalOutput {
    pub session_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

struct SessionOutput {
    tx: broadcast::Sender<Bytes>,
    ring: Option<ByteRing>,
}

/// Publishers and replay rings for every session.
pub struct OutputFanout {
    outputs: HashMap<String, SessionOutput>,
    ring_capacity: usize,
    broadcast_capacity: usize,
}

impl OutputFanout {
    pub fn new(ring_capacity: usize, broadcast_capacity: usize) -> Self {
        Self {
            outputs: HashMap::new(),
            ring_capacity,
            broadcast_capacity: broadcast_capacity.max(1),
        }
    }

    /// Make sure the publisher and ring for `session_id` exist.
    pub fn ensure(&mut self, session_id: &str) {
        let ring_capacity = self.ring_capacity;
        let broadcast_capacity = self.broadcast_capacity;
        let output = self
            .outputs
            .entry(session_id.to_string())
            .or_insert_with(|| SessionOutput {
                tx: broadcast::channel(broadcast_capacity).0,
                ring: None,
            });
        output
            .ring
            .get_or_insert_with(|| ByteRing::new(ring_capacity));
    }

    #[cfg(test)]
    pub fn has_publisher(&self, session_id: &str) -> bool {
        self.outputs.contains_key(session_id)
    }

    /// Append inbound bytes to the ring and fan them out to live subscribers.
    pub fn publish(&mut self, session_id: &str, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.ensure(session_id);
        let Some(output) = self.outputs.get_mut(session_id) else {
            return;
        };
        if let Some(ring) = output.ring.as_mut() {
            ring.append(&data);
        }
        // No receivers is fine: the ring keeps the history.
        let receivers = output.tx.send(data).unwrap_or(0);
        trace!(session_id, receivers, "published output chunk");
    }

    /// Current replay contents (empty if there is no ring).
    pub fn snapshot(&self, session_id: &str) -> Bytes {
        self.outputs
            .get(session_id)
            .and_then(|o| o.ring.as_ref())
            .map(ByteRing::snapshot)
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub fn ring_len(&self, session_id: &str) -> Option<usize> {
        self.outputs
            .get(session_id)
            .and_then(|o| o.ring.as_ref())
            .map(ByteRing::len)
    }

    /// Live-only stream; empty if the session has no publisher.
    pub fn raw_stream(&self, session_id: &str) -> OutputStream {
        match self.outputs.get(session_id) {
            Some(output) => live(session_id, output.tx.subscribe()),
            None => stream::empty().boxed(),
        }
    }

    /// Ring snapshot (if non-empty) followed by the live stream.
    pub fn hydrated_stream(&self, session_id: &str) -> OutputStream {
        let Some(output) = self.outputs.get(session_id) else {
            return stream::empty().boxed();
        };
        let rx = output.tx.subscribe();
        let snapshot = output
            .ring
            .as_ref()
            .map(ByteRing::snapshot)
            .unwrap_or_default();
        let live = live(session_id, rx);
        if snapshot.is_empty() {
            live
        } else {
            stream::once(future::ready(snapshot)).chain(live).boxed()
        }
    }

    /// Best-effort UTF-8 view of the live stream.
    pub fn text_stream(&self, session_id: &str) -> BoxStream<'static, TerminalOutput> {
        let id = session_id.to_string();
        let mut decoder = Utf8Decoder::default();
        self.raw_stream(session_id)
            .filter_map(move |chunk| {
                let text = decoder.decode(&chunk);
                let event = (!text.is_empty()).then(|| TerminalOutput {
                    session_id: id.clone(),
                    text,
                    timestamp: Utc::now(),
                });
                future::ready(event)
            })
            .boxed()
    }

    /// End every live stream for the session, keeping the ring and a fresh
    /// publisher so later subscribers still hydrate.
    pub fn close_streams(&mut self, session_id: &str) {
        if let Some(output) = self.outputs.get_mut(session_id) {
            output.tx = broadcast::channel(self.broadcast_capacity).0;
        }
    }

    /// Drop the replay ring, keeping the publisher for live consumers.
    pub fn clear_ring(&mut self, session_id: &str) {
        if let Some(output) = self.outputs.get_mut(session_id) {
            output.ring = None;
        }
    }

    /// Drop the publisher and ring; live streams end.
    pub fn remove(&mut self, session_id: &str) {
        self.outputs.remove(session_id);
    }

    pub fn clear(&mut self) {
        self.outputs.clear();
    }
}

fn live(session_id: &str, rx: broadcast::Receiver<Bytes>) -> OutputStream {
    let id = session_id.to_string();
    BroadcastStream::new(rx)
        .filter_map(move |item| {
            future::ready(match item {
                Ok(bytes) => Some(bytes),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(session_id = %id, skipped, "output subscriber lagged, chunks dropped");
                    None
                }
            })
        })
        .boxed()
}

/// Incremental UTF-8 decoder that carries incomplete sequences across chunks.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // valid_up_to guarantees this prefix is UTF-8.
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            // Incomplete trailing sequence: wait for more bytes.
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hydrated_stream_replays_then_goes_live() {
        let mut fanout = OutputFanout::new(1024, 16);
        fanout.publish("s1", Bytes::from_static(b"history"));

        let mut stream = fanout.hydrated_stream("s1");
        fanout.publish("s1", Bytes::from_static(b"live"));

        assert_eq!(stream.next().await.unwrap(), Bytes::from_static(b"history"));
        assert_eq!(stream.next().await.unwrap(), Bytes::from_static(b"live"));
    }

    #[tokio::test]
    async fn hydration_is_repeatable() {
        let mut fanout = OutputFanout::new(1024, 16);
        fanout.publish("s1", Bytes::from_static(b"prompt$ "));

        let mut first = fanout.hydrated_stream("s1");
        let mut second = fanout.hydrated_stream("s1");
        assert_eq!(first.next().await, second.next().await);
        assert_eq!(fanout.ring_len("s1"), Some(8));
    }

    #[tokio::test]
    async fn empty_ring_hydration_is_live_only() {
        let mut fanout = OutputFanout::new(1024, 16);
        fanout.ensure("s1");
        let mut stream = fanout.hydrated_stream("s1");
        fanout.publish("s1", Bytes::from_static(b"x"));
        assert_eq!(stream.next().await.unwrap(), Bytes::from_static(b"x"));
    }

    #[tokio::test]
    async fn unknown_session_streams_are_empty() {
        let fanout = OutputFanout::new(1024, 16);
        assert!(fanout.raw_stream("nope").next().await.is_none());
        assert!(fanout.hydrated_stream("nope").next().await.is_none());
    }

    #[tokio::test]
    async fn remove_ends_live_streams() {
        let mut fanout = OutputFanout::new(1024, 16);
        fanout.ensure("s1");
        let mut stream = fanout.raw_stream("s1");
        fanout.remove("s1");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn text_stream_joins_split_code_points() {
        let mut fanout = OutputFanout::new(1024, 16);
        fanout.ensure("s1");
        let mut text = fanout.text_stream("s1");

        let snowman = "☃".as_bytes();
        fanout.publish("s1", Bytes::copy_from_slice(&snowman[..1]));
        fanout.publish("s1", Bytes::copy_from_slice(&[&snowman[1..], b"!".as_slice()].concat()));

        let event = text.next().await.unwrap();
        assert_eq!(event.text, "☃!");
        assert_eq!(event.session_id, "s1");
    }

    #[test]
    fn decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{fffd}b");
        assert!(decoder.pending.is_empty());
    }

    #[tokio::test]
    async fn close_streams_keeps_history() {
        let mut fanout = OutputFanout::new(1024, 16);
        fanout.publish("s1", Bytes::from_static(b"abc"));
        let mut old = fanout.raw_stream("s1");
        fanout.close_streams("s1");
        assert!(old.next().await.is_none());

        let mut again = fanout.hydrated_stream("s1");
        assert_eq!(again.next().await.unwrap(), Bytes::from_static(b"abc"));
    }

    #[test]
    fn clear_ring_keeps_publisher() {
        let mut fanout = OutputFanout::new(1024, 16);
        fanout.publish("s1", Bytes::from_static(b"abc"));
        fanout.clear_ring("s1");
        assert!(fanout.has_publisher("s1"));
        assert!(fanout.snapshot("s1").is_empty());
        assert_eq!(fanout.ring_len("s1"), None);
    }
}
