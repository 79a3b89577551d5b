//! Per-session event fan-out with replay.
//!
//! One upstream feed per session (the daemon subscription or the local
//! registry tap) fans out to any number of application subscribers. The
//! bus keeps a replay buffer per session so a late subscriber starts
//! from a scrollback snapshot taken atomically with its registration:
//! snapshot-then-live, no gap, no duplicate.
//!
//! Exit, disconnect, and error events are delivered like data; none of
//! them ends a subscription. A subscription ends only when its holder
//! unsubscribes (or drops the handle).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

use ptykeep_core::protocol::SessionEvent;
use ptykeep_core::scrollback::{ScrollbackBuffer, DEFAULT_MAX_BYTES};

struct ChannelState {
    replay: ScrollbackBuffer,
    subscribers: Vec<(u64, mpsc::UnboundedSender<SessionEvent>)>,
    /// A clear-scrollback sequence arrived since the channel was opened.
    /// The buffer consumes the marker on push, so the flag is the only
    /// record of it when the attach snapshot is seeded afterwards.
    cleared_since_open: bool,
}

struct BusInner {
    channels: HashMap<String, ChannelState>,
    next_subscriber_id: u64,
}

/// Fan-out hub shared by the session manager and its subscribers.
pub struct EventBus {
    inner: Mutex<BusInner>,
    max_replay_bytes: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_replay_capacity(DEFAULT_MAX_BYTES)
    }

    pub fn with_replay_capacity(max_replay_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                channels: HashMap::new(),
                next_subscriber_id: 1,
            }),
            max_replay_bytes,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a session's channel with an empty replay buffer, or clear
    /// the replay of an existing one. Subscribers are kept.
    ///
    /// Call this before registering the upstream tap; events that race
    /// ahead of [`seed`](Self::seed) then accumulate here instead of
    /// being dropped.
    pub fn open_channel(&self, session_id: &str) {
        let mut inner = self.lock();
        let max = self.max_replay_bytes;
        let channel = inner
            .channels
            .entry(session_id.to_string())
            .or_insert_with(|| ChannelState {
                replay: ScrollbackBuffer::new(max),
                subscribers: Vec::new(),
                cleared_since_open: false,
            });
        channel.replay.clear();
        channel.cleared_since_open = false;
    }

    /// Seed a session's replay with a scrollback snapshot from the
    /// backend.
    ///
    /// The snapshot is placed *before* whatever the channel accumulated
    /// since [`open_channel`](Self::open_channel): the upstream snapshot
    /// was taken atomically with the tap, so anything that raced in is
    /// strictly newer. If the raced content carried a clear sequence the
    /// snapshot is already obsolete and is dropped instead.
    pub fn seed(&self, session_id: &str, snapshot: &str) {
        let mut inner = self.lock();
        let max = self.max_replay_bytes;
        let channel = inner
            .channels
            .entry(session_id.to_string())
            .or_insert_with(|| ChannelState {
                replay: ScrollbackBuffer::new(max),
                subscribers: Vec::new(),
                cleared_since_open: false,
            });
        if channel.cleared_since_open {
            return;
        }
        let raced = channel.replay.snapshot();
        channel.replay.clear();
        channel.replay.push(snapshot);
        if !raced.is_empty() {
            channel.replay.push(&raced);
        }
    }

    /// Deliver an event to every subscriber of a session.
    ///
    /// Data events also land in the replay buffer, including any clear
    /// sequence handling, so future snapshots stay consistent with what
    /// live subscribers saw. Senders are unbounded; a slow consumer
    /// never stalls delivery to the others.
    pub fn emit(&self, session_id: &str, event: SessionEvent) {
        let mut inner = self.lock();
        let Some(channel) = inner.channels.get_mut(session_id) else {
            debug!("Dropping event for unknown channel {}", session_id);
            return;
        };
        if let SessionEvent::Data { data } = &event {
            if channel.replay.push(data) {
                channel.cleared_since_open = true;
            }
        }
        channel
            .subscribers
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    /// Register a subscriber, returning the replay snapshot taken in the
    /// same critical section. Fails if the session has no channel.
    pub fn subscribe(
        self: &Arc<Self>,
        session_id: &str,
    ) -> Option<(String, Subscription)> {
        let mut inner = self.lock();
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;

        let channel = inner.channels.get_mut(session_id)?;
        let snapshot = channel.replay.snapshot();
        let (tx, rx) = mpsc::unbounded_channel();
        channel.subscribers.push((id, tx));

        Some((
            snapshot,
            Subscription {
                session_id: session_id.to_string(),
                id,
                rx,
                bus: self.clone(),
                active: true,
            },
        ))
    }

    /// Tear down a session's channel. Subscriber streams end; the
    /// handles themselves stay valid until their holders drop them.
    pub fn remove_channel(&self, session_id: &str) {
        let mut inner = self.lock();
        inner.channels.remove(session_id);
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        let inner = self.lock();
        inner
            .channels
            .get(session_id)
            .map(|c| c.subscribers.len())
            .unwrap_or(0)
    }

    fn unsubscribe(&self, session_id: &str, subscriber_id: u64) {
        let mut inner = self.lock();
        if let Some(channel) = inner.channels.get_mut(session_id) {
            channel.subscribers.retain(|(id, _)| *id != subscriber_id);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscriber's live event stream.
///
/// Receiving `Exit`, `Disconnect`, or `Error` does not end the stream;
/// the holder keeps receiving until it unsubscribes or drops the handle.
pub struct Subscription {
    session_id: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<SessionEvent>,
    bus: Arc<EventBus>,
    active: bool,
}

impl Subscription {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next event, or `None` once the channel is gone (session killed or
    /// detached) and the backlog is drained.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<SessionEvent, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }

    /// Stop receiving events.
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if self.active {
            self.active = false;
            self.bus.unsubscribe(&self.session_id, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;

    fn data(s: &str) -> SessionEvent {
        SessionEvent::Data {
            data: s.to_string(),
        }
    }

    #[tokio::test]
    async fn snapshot_then_live_without_gap_or_duplicate() {
        let bus = Arc::new(EventBus::new());
        bus.seed("pane-1", "before");
        bus.emit("pane-1", data("-early"));

        let (snapshot, mut sub) = bus.subscribe("pane-1").expect("subscribe");
        // Everything emitted before the subscription is in the snapshot,
        // nothing in the live stream.
        assert_eq!(snapshot, "before-early");
        assert_eq!(sub.try_recv().unwrap_err(), TryRecvError::Empty);

        bus.emit("pane-1", data("-late"));
        assert_eq!(sub.recv().await, Some(data("-late")));
    }

    #[tokio::test]
    async fn fan_out_reaches_every_subscriber() {
        let bus = Arc::new(EventBus::new());
        bus.seed("pane-1", "");

        let (_, mut a) = bus.subscribe("pane-1").expect("a");
        let (_, mut b) = bus.subscribe("pane-1").expect("b");
        assert_eq!(bus.subscriber_count("pane-1"), 2);

        bus.emit("pane-1", data("x"));
        assert_eq!(a.recv().await, Some(data("x")));
        assert_eq!(b.recv().await, Some(data("x")));
    }

    #[tokio::test]
    async fn unsubscribe_affects_only_one_subscriber() {
        let bus = Arc::new(EventBus::new());
        bus.seed("pane-1", "");

        let (_, a) = bus.subscribe("pane-1").expect("a");
        let (_, mut b) = bus.subscribe("pane-1").expect("b");

        a.unsubscribe();
        assert_eq!(bus.subscriber_count("pane-1"), 1);

        bus.emit("pane-1", data("still here"));
        assert_eq!(b.recv().await, Some(data("still here")));
    }

    #[tokio::test]
    async fn lifecycle_events_do_not_end_the_stream() {
        let bus = Arc::new(EventBus::new());
        bus.seed("pane-1", "");
        let (_, mut sub) = bus.subscribe("pane-1").expect("subscribe");

        bus.emit(
            "pane-1",
            SessionEvent::Exit {
                exit_code: Some(1),
                signal: None,
            },
        );
        bus.emit(
            "pane-1",
            SessionEvent::Disconnect {
                reason: "socket dropped".to_string(),
            },
        );
        bus.emit(
            "pane-1",
            SessionEvent::Error {
                detail: "transient".to_string(),
            },
        );
        bus.emit("pane-1", data("after the storm"));

        assert!(matches!(
            sub.recv().await,
            Some(SessionEvent::Exit { .. })
        ));
        assert!(matches!(
            sub.recv().await,
            Some(SessionEvent::Disconnect { .. })
        ));
        assert!(matches!(
            sub.recv().await,
            Some(SessionEvent::Error { .. })
        ));
        assert_eq!(sub.recv().await, Some(data("after the storm")));
    }

    #[tokio::test]
    async fn dropped_handle_is_removed_from_fan_out() {
        let bus = Arc::new(EventBus::new());
        bus.seed("pane-1", "");
        {
            let (_, _sub) = bus.subscribe("pane-1").expect("subscribe");
            assert_eq!(bus.subscriber_count("pane-1"), 1);
        }
        assert_eq!(bus.subscriber_count("pane-1"), 0);
    }

    #[tokio::test]
    async fn clear_sequence_truncates_replay() {
        let bus = Arc::new(EventBus::new());
        bus.seed("pane-1", "stale history");
        bus.emit("pane-1", data("\u{1b}[3Jfresh"));

        let (snapshot, _sub) = bus.subscribe("pane-1").expect("subscribe");
        assert_eq!(snapshot, "fresh");
    }

    #[tokio::test]
    async fn removed_channel_ends_streams_and_refuses_subscribers() {
        let bus = Arc::new(EventBus::new());
        bus.seed("pane-1", "");
        let (_, mut sub) = bus.subscribe("pane-1").expect("subscribe");

        bus.remove_channel("pane-1");
        assert_eq!(sub.recv().await, None);
        assert!(bus.subscribe("pane-1").is_none());
    }

    #[tokio::test]
    async fn reopen_resets_replay_but_keeps_subscribers() {
        let bus = Arc::new(EventBus::new());
        bus.seed("pane-1", "first attach");
        let (_, mut sub) = bus.subscribe("pane-1").expect("subscribe");

        bus.open_channel("pane-1");
        bus.seed("pane-1", "fresh snapshot after reconnect");
        bus.emit("pane-1", data("!"));
        assert_eq!(sub.recv().await, Some(data("!")));

        let (snapshot, _) = bus.subscribe("pane-1").expect("resubscribe");
        assert_eq!(snapshot, "fresh snapshot after reconnect!");
    }

    #[tokio::test]
    async fn events_racing_the_seed_are_kept_after_it() {
        let bus = Arc::new(EventBus::new());
        bus.open_channel("pane-1");
        // Upstream data lands before the attach snapshot is seeded.
        bus.emit("pane-1", data("raced"));
        bus.seed("pane-1", "snapshot|");

        let (snapshot, _sub) = bus.subscribe("pane-1").expect("subscribe");
        assert_eq!(snapshot, "snapshot|raced");
    }

    #[tokio::test]
    async fn clear_in_raced_content_wipes_the_seed_too() {
        let bus = Arc::new(EventBus::new());
        bus.open_channel("pane-1");
        bus.emit("pane-1", data("\u{1b}[3Jonly this"));
        bus.seed("pane-1", "doomed snapshot");

        let (snapshot, _sub) = bus.subscribe("pane-1").expect("subscribe");
        assert_eq!(snapshot, "only this");
    }
}
