// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-execution broadcast buffer.
//!
//! One producer (the execution engine), N subscribers (open SSE
//! connections). Guarantees ordered delivery, late-join replay of the full
//! buffered prefix, per-subscriber backpressure, and a single terminal
//! event after which the hub is permanently closed.

use ces_api_contract::{OutputEvent, OutputKind};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Maximum number of events retained for late joiners.
pub const HUB_BUFFER_CAP: usize = 10_000;

/// Per-subscriber queue depth; overflow drops the subscriber.
pub const SUBSCRIBER_QUEUE_CAP: usize = 256;

struct SubscriberSlot {
    id: u64,
    tx: mpsc::Sender<OutputEvent>,
    lagged: Arc<AtomicBool>,
}

struct HubInner {
    buffer: VecDeque<OutputEvent>,
    truncated: bool,
    subscribers: Vec<SubscriberSlot>,
    closed: bool,
    last_seq: Option<u64>,
    next_subscriber_id: u64,
}

/// Broadcast buffer for one execution's output events.
pub struct StreamHub {
    inner: Mutex<HubInner>,
    active_subscriptions: AtomicUsize,
}

impl StreamHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HubInner {
                buffer: VecDeque::new(),
                truncated: false,
                subscribers: Vec::new(),
                closed: false,
                last_seq: None,
                next_subscriber_id: 0,
            }),
            active_subscriptions: AtomicUsize::new(0),
        })
    }

    /// Append an event and fan it out to every live subscriber.
    ///
    /// Sequence numbers must be strictly increasing; an event published
    /// after the terminal one is refused. A subscriber whose queue is full
    /// is marked lagging and detached without affecting the publisher or
    /// the other subscribers.
    pub fn publish(&self, event: OutputEvent) -> Result<(), crate::RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(crate::RuntimeError::Internal(
                "event published after terminal".to_string(),
            ));
        }
        if let Some(last) = inner.last_seq {
            if event.seq <= last {
                return Err(crate::RuntimeError::Internal(format!(
                    "non-monotonic sequence number {} after {}",
                    event.seq, last
                )));
            }
        }
        inner.last_seq = Some(event.seq);

        if inner.buffer.len() == HUB_BUFFER_CAP {
            inner.buffer.pop_front();
            inner.truncated = true;
        }
        inner.buffer.push_back(event.clone());
        if event.terminal {
            inner.closed = true;
        }

        inner.subscribers.retain(|slot| match slot.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                slot.lagged.store(true, Ordering::SeqCst);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
        Ok(())
    }

    /// Open a subscription positioned at sequence zero.
    ///
    /// The subscription yields every buffered event (prefixed by a
    /// `truncated` marker when history was capped) and then every future
    /// event until the terminal one.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let mut inner = self.inner.lock().unwrap();
        let mut replay: VecDeque<OutputEvent> = inner.buffer.iter().cloned().collect();
        if inner.truncated {
            let first_seq = replay.front().map(|e| e.seq.saturating_sub(1)).unwrap_or(0);
            replay.push_front(OutputEvent::new(
                first_seq,
                OutputKind::Truncated,
                serde_json::json!({ "message": "older events were truncated" }),
            ));
        }

        let lagged = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAP);
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        if !inner.closed {
            inner.subscribers.push(SubscriberSlot {
                id,
                tx,
                lagged: Arc::clone(&lagged),
            });
        }
        self.active_subscriptions.fetch_add(1, Ordering::SeqCst);

        Subscription {
            hub: Arc::clone(self),
            id,
            replay,
            rx,
            lagged,
            last_seq: 0,
            seen_terminal: false,
        }
    }

    /// Whether the terminal event has been published.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Eligible for garbage collection: terminal published and nobody left
    /// reading.
    pub fn is_finished(&self) -> bool {
        self.is_closed() && self.active_subscriptions.load(Ordering::SeqCst) == 0
    }

    fn detach(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.retain(|slot| slot.id != id);
        self.active_subscriptions.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One consumer's ordered view of an execution's events.
pub struct Subscription {
    hub: Arc<StreamHub>,
    id: u64,
    replay: VecDeque<OutputEvent>,
    rx: mpsc::Receiver<OutputEvent>,
    lagged: Arc<AtomicBool>,
    last_seq: u64,
    seen_terminal: bool,
}

impl Subscription {
    /// Next event in publish order, or `None` after the terminal event.
    ///
    /// A subscriber that fell behind observes a single synthetic terminal
    /// `error` event instead of the remainder of the stream.
    pub async fn next(&mut self) -> Option<OutputEvent> {
        if let Some(event) = self.replay.pop_front() {
            self.last_seq = event.seq;
            self.seen_terminal |= event.terminal;
            return Some(event);
        }
        if self.seen_terminal {
            return None;
        }
        match self.rx.recv().await {
            Some(event) => {
                self.last_seq = event.seq;
                self.seen_terminal |= event.terminal;
                Some(event)
            }
            None => {
                if self.lagged.load(Ordering::SeqCst) {
                    self.seen_terminal = true;
                    Some(OutputEvent::terminal(
                        self.last_seq + 1,
                        OutputKind::Error,
                        serde_json::json!({ "message": "subscriber fell behind" }),
                    ))
                } else {
                    None
                }
            }
        }
    }

    /// Adapt into a [`futures::Stream`] for the SSE layer.
    pub fn into_stream(self) -> impl futures::Stream<Item = OutputEvent> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|event| (event, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.detach(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(seq: u64) -> OutputEvent {
        OutputEvent::new(seq, OutputKind::Stdout, json!({ "text": format!("{}\n", seq) }))
    }

    fn terminal(seq: u64) -> OutputEvent {
        OutputEvent::terminal(seq, OutputKind::Result, json!({}))
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let hub = StreamHub::new();
        let mut sub = hub.subscribe();
        for seq in 0..5 {
            hub.publish(event(seq)).unwrap();
        }
        hub.publish(terminal(5)).unwrap();

        for expected in 0..6 {
            assert_eq!(sub.next().await.unwrap().seq, expected);
        }
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn late_joiner_replays_full_prefix() {
        let hub = StreamHub::new();
        for seq in 0..3 {
            hub.publish(event(seq)).unwrap();
        }

        let mut sub = hub.subscribe();
        hub.publish(terminal(3)).unwrap();

        let seqs: Vec<u64> = {
            let mut out = Vec::new();
            while let Some(ev) = sub.next().await {
                out.push(ev.seq);
            }
            out
        };
        assert_eq!(seqs, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn subscribing_after_terminal_replays_everything() {
        let hub = StreamHub::new();
        hub.publish(event(0)).unwrap();
        hub.publish(terminal(1)).unwrap();

        let mut sub = hub.subscribe();
        assert_eq!(sub.next().await.unwrap().seq, 0);
        assert!(sub.next().await.unwrap().terminal);
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_is_cut_off_with_synthetic_error() {
        let hub = StreamHub::new();
        let mut sub = hub.subscribe();

        // Overflow the per-subscriber queue without draining it.
        for seq in 0..(SUBSCRIBER_QUEUE_CAP as u64 + 10) {
            hub.publish(event(seq)).unwrap();
        }

        let mut count = 0usize;
        let mut last = None;
        while let Some(ev) = sub.next().await {
            count += 1;
            last = Some(ev);
        }
        let last = last.unwrap();
        assert_eq!(count, SUBSCRIBER_QUEUE_CAP + 1);
        assert!(last.terminal);
        assert_eq!(last.kind, OutputKind::Error);
        assert_eq!(last.payload["message"], "subscriber fell behind");

        // The hub itself is unaffected and still accepts events.
        hub.publish(event(SUBSCRIBER_QUEUE_CAP as u64 + 10)).unwrap();
    }

    #[tokio::test]
    async fn rejects_publish_after_terminal_and_non_monotonic_seq() {
        let hub = StreamHub::new();
        hub.publish(event(0)).unwrap();
        assert!(hub.publish(event(0)).is_err());
        hub.publish(terminal(1)).unwrap();
        assert!(hub.publish(event(2)).is_err());
    }

    #[tokio::test]
    async fn truncation_marks_history_for_late_joiners() {
        let hub = StreamHub::new();
        for seq in 0..(HUB_BUFFER_CAP as u64 + 5) {
            hub.publish(event(seq)).unwrap();
        }

        let mut sub = hub.subscribe();
        let first = sub.next().await.unwrap();
        assert_eq!(first.kind, OutputKind::Truncated);
        let second = sub.next().await.unwrap();
        assert_eq!(second.seq, 5);
    }

    #[tokio::test]
    async fn finished_only_after_terminal_and_no_subscribers() {
        let hub = StreamHub::new();
        let sub = hub.subscribe();
        hub.publish(terminal(0)).unwrap();
        assert!(!hub.is_finished());
        drop(sub);
        assert!(hub.is_finished());
    }
}
