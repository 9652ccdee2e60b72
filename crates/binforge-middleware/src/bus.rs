//! Typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others. The bus is passed explicitly (cloned) into every component
//! that emits diagnostics.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Build`] | Compile steps, batch summaries, toolchain drift |
//! | [`Topic::Cache`] | Restores, stale entries, hash mismatches, pruning |
//! | [`Topic::Link`] | Module loads, link failures, hotfix attempts |
//! | [`Topic::Watchdog`] | Failure streaks, heals, fallback substitutions |
//! | [`Topic::Telemetry`] | Per-tick engine readings |

use binforge_types::{Event, EventPayload, ForgeError, Level};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Routing lanes of the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Build,
    Cache,
    Link,
    Watchdog,
    Telemetry,
}

impl Topic {
    pub const ALL: [Topic; 5] = [
        Topic::Build,
        Topic::Cache,
        Topic::Link,
        Topic::Watchdog,
        Topic::Telemetry,
    ];
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    build: broadcast::Sender<Event>,
    cache: broadcast::Sender<Event>,
    link: broadcast::Sender<Event>,
    watchdog: broadcast::Sender<Event>,
    telemetry: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// The `capacity` is applied to every topic channel independently.
    pub fn new(capacity: usize) -> Self {
        let (build, _) = broadcast::channel(capacity);
        let (cache, _) = broadcast::channel(capacity);
        let (link, _) = broadcast::channel(capacity);
        let (watchdog, _) = broadcast::channel(capacity);
        let (telemetry, _) = broadcast::channel(capacity);
        Self {
            build,
            cache,
            link,
            watchdog,
            telemetry,
        }
    }

    /// Publish `event` to the given [`Topic`] channel.
    ///
    /// Returns the number of active receivers that were handed the event, or
    /// [`ForgeError::Channel`] when nobody is subscribed to the topic.
    pub fn publish_to(&self, topic: Topic, event: Event) -> Result<usize, ForgeError> {
        self.topic_sender(topic)
            .send(event)
            .map_err(|_| ForgeError::Channel(format!("No subscribers for topic {topic:?}")))
    }

    /// Publish without caring whether anybody listens.
    ///
    /// Components call this for every diagnostic; a bus nobody subscribed
    /// to is the normal state of a headless run.
    pub fn emit(&self, topic: Topic, source: &str, payload: EventPayload) {
        if self.publish_to(topic, Event::new(source, payload)).is_err() {
            debug!(?topic, source, "event dropped: no subscribers");
        }
    }

    /// Shorthand for emitting an [`EventPayload::Diagnostic`].
    pub fn diagnostic(
        &self,
        topic: Topic,
        source: &str,
        level: Level,
        code: &str,
        message: impl Into<String>,
    ) {
        self.emit(
            topic,
            source,
            EventPayload::Diagnostic {
                level,
                code: code.to_string(),
                message: message.into(),
            },
        );
    }

    /// Subscribe to a specific [`Topic`] channel.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Subscribe to `topics` for the lifetime of the returned guard.
    ///
    /// Dropping the [`ScopedSubscription`] drops its receivers, which
    /// unsubscribes them from the bus.
    pub fn scoped(&self, topics: &[Topic]) -> ScopedSubscription {
        ScopedSubscription {
            receivers: topics.iter().map(|t| self.subscribe_to(*t)).collect(),
        }
    }

    /// Number of receivers currently attached to `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topic_sender(topic).receiver_count()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Build => &self.build,
            Topic::Cache => &self.cache,
            Topic::Link => &self.link,
            Topic::Watchdog => &self.watchdog,
            Topic::Telemetry => &self.telemetry,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Topic-based receiver
// ---------------------------------------------------------------------------

/// An async receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Returns `Err(RecvError::Lagged(n))` when the subscriber fell behind
    /// and `n` messages were dropped, and `Err(RecvError::Closed)` when the
    /// bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Non-blocking receive for synchronous callers (poll loops, tests).
    ///
    /// Lag is logged and skipped; `None` means the channel is currently empty
    /// or closed.
    pub fn try_next(&mut self) -> Option<Event> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "TopicReceiver lagged");
                    continue;
                }
                Err(_) => return None,
            }
        }
    }

    /// The [`Topic`] this receiver is bound to.
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

// ---------------------------------------------------------------------------
// Scoped subscription
// ---------------------------------------------------------------------------

/// A set of topic receivers that lives exactly as long as one unit of work.
pub struct ScopedSubscription {
    receivers: Vec<TopicReceiver>,
}

impl ScopedSubscription {
    /// Collect every event currently buffered on the subscribed topics, in
    /// topic order.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        for rx in &mut self.receivers {
            while let Some(event) = rx.try_next() {
                out.push(event);
            }
        }
        out
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.receivers.iter().map(TopicReceiver::topic).collect()
    }
}
