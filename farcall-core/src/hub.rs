//! Topic-based event hub.
//!
//! A single actor task owns every piece of hub state: subscriber sets,
//! per-topic guards, presence counts. Public operations enqueue a message on
//! one of three channels (`publish`, `subscribe`, `register`) and return;
//! nothing outside the actor ever mutates the maps, so no locks are needed
//! and racing operations are linearized at the actor.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::extract::ws::Message;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::codec::{self, Action, Codec};
use crate::context::{ConnId, UserId};

/// Delivery-time view of a subscriber, handed to topic guards.
#[derive(Clone, Copy, Debug)]
pub struct SessionInfo {
    pub conn: ConnId,
    pub user: UserId,
}

/// Per-topic delivery gate.
pub type TopicGuard = Arc<dyn Fn(&Value, &SessionInfo) -> bool + Send + Sync>;

/// One presence transition. `online` is true for a session entering.
#[derive(Clone, Copy, Debug)]
pub struct PresenceChange {
    pub user: UserId,
    pub conn: ConnId,
    pub online: bool,
}

/// Presence callback. The user handler fires only on the 0↔1 boundary of a
/// user's session count; every other transition fires the connection handler.
pub type PresenceHandler = Arc<dyn Fn(&PresenceChange) + Send + Sync>;

/// Send half of a session's bounded outbound queue, plus its identity.
/// The hub addresses sessions only through this registry entry, never
/// through the session itself.
pub(crate) struct SessionHandle {
    pub outbox: mpsc::Sender<Message>,
    pub user: UserId,
}

pub(crate) type SessionRegistry = Arc<DashMap<i64, SessionHandle>>;

/// Hub state snapshot, answered by the actor itself.
#[derive(Clone, Debug, Default)]
pub struct HubStats {
    /// Subscriber count per topic; topics with zero subscribers do not exist.
    pub subscribers: HashMap<String, usize>,
    /// Live session count per user id.
    pub presence: HashMap<i64, u32>,
}

struct PublishMsg {
    topic: String,
    payload: Value,
    targets: Vec<ConnId>,
}

enum ControlMsg {
    Join { topic: String, conn: ConnId },
    Leave { topic: String, conn: ConnId },
    Stats { reply: oneshot::Sender<HubStats> },
}

struct PresenceMsg {
    user: UserId,
    conn: ConnId,
    enter: bool,
}

pub(crate) struct HubConfig {
    pub codec: Codec,
    pub sessions: SessionRegistry,
    pub guards: HashMap<String, TopicGuard>,
    pub on_user: Option<PresenceHandler>,
    pub on_connection: Option<PresenceHandler>,
}

/// Cloneable handle to the hub actor.
#[derive(Clone)]
pub struct EventHub {
    publish: mpsc::Sender<PublishMsg>,
    subscribe: mpsc::Sender<ControlMsg>,
    register: mpsc::Sender<PresenceMsg>,
}

impl EventHub {
    pub(crate) fn start(config: HubConfig) -> Self {
        let (publish_tx, publish_rx) = mpsc::channel(1);
        let (subscribe_tx, subscribe_rx) = mpsc::channel(1);
        let (register_tx, register_rx) = mpsc::channel(1);

        let actor = HubState {
            codec: config.codec,
            sessions: config.sessions,
            guards: config.guards,
            on_user: config.on_user,
            on_connection: config.on_connection,
            channels: HashMap::new(),
            presence: HashMap::new(),
        };
        tokio::spawn(actor.run(publish_rx, subscribe_rx, register_rx));

        Self {
            publish: publish_tx,
            subscribe: subscribe_tx,
            register: register_tx,
        }
    }

    /// Add a session to a topic's subscriber set, creating the topic lazily.
    pub async fn subscribe(&self, topic: impl Into<String>, conn: ConnId) {
        let _ = self
            .subscribe
            .send(ControlMsg::Join {
                topic: topic.into(),
                conn,
            })
            .await;
    }

    /// Remove a session from a topic; an empty topic name removes the
    /// session from every topic. Topics left without subscribers are deleted.
    pub async fn unsubscribe(&self, topic: impl Into<String>, conn: ConnId) {
        let _ = self
            .subscribe
            .send(ControlMsg::Leave {
                topic: topic.into(),
                conn,
            })
            .await;
    }

    /// Publish to every subscriber of a topic, gated by the topic's guard.
    pub async fn publish<T: Serialize>(&self, topic: impl Into<String>, value: T) {
        self.publish_to(topic, value, Vec::new()).await;
    }

    /// Publish to the subscribers whose connection id appears in `targets`
    /// (all subscribers when `targets` is empty). The topic guard still
    /// applies.
    pub async fn publish_to<T: Serialize>(
        &self,
        topic: impl Into<String>,
        value: T,
        targets: Vec<ConnId>,
    ) {
        let payload = match serde_json::to_value(&value) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(error = %err, "cannot encode published event");
                return;
            }
        };
        let _ = self
            .publish
            .send(PublishMsg {
                topic: topic.into(),
                payload,
                targets,
            })
            .await;
    }

    /// Announce a session entering for presence accounting.
    pub async fn user_in(&self, user: UserId, conn: ConnId) {
        let _ = self
            .register
            .send(PresenceMsg {
                user,
                conn,
                enter: true,
            })
            .await;
    }

    /// Announce a session leaving for presence accounting.
    pub async fn user_out(&self, user: UserId, conn: ConnId) {
        let _ = self
            .register
            .send(PresenceMsg {
                user,
                conn,
                enter: false,
            })
            .await;
    }

    /// Snapshot the hub state.
    pub async fn stats(&self) -> HubStats {
        let (reply, rx) = oneshot::channel();
        if self
            .subscribe
            .send(ControlMsg::Stats { reply })
            .await
            .is_err()
        {
            return HubStats::default();
        }
        rx.await.unwrap_or_default()
    }
}

// ── Actor ───────────────────────────────────────────────────────────────────

struct HubState {
    codec: Codec,
    sessions: SessionRegistry,
    guards: HashMap<String, TopicGuard>,
    on_user: Option<PresenceHandler>,
    on_connection: Option<PresenceHandler>,
    channels: HashMap<String, HashSet<ConnId>>,
    presence: HashMap<i64, u32>,
}

#[derive(Serialize)]
struct EventBody<'a> {
    name: &'a str,
    value: &'a Value,
}

impl HubState {
    async fn run(
        mut self,
        mut publish: mpsc::Receiver<PublishMsg>,
        mut control: mpsc::Receiver<ControlMsg>,
        mut register: mpsc::Receiver<PresenceMsg>,
    ) {
        loop {
            tokio::select! {
                Some(msg) = publish.recv() => self.on_publish(msg).await,
                Some(msg) = control.recv() => self.on_control(msg),
                Some(msg) = register.recv() => self.on_presence(msg),
                else => break,
            }
        }
        tracing::debug!("event hub stopped");
    }

    fn on_control(&mut self, msg: ControlMsg) {
        match msg {
            ControlMsg::Join { topic, conn } => {
                self.channels.entry(topic).or_default().insert(conn);
            }
            ControlMsg::Leave { topic, conn } if topic.is_empty() => {
                // Session teardown: remove from every topic.
                self.channels.retain(|_, subscribers| {
                    subscribers.remove(&conn);
                    !subscribers.is_empty()
                });
            }
            ControlMsg::Leave { topic, conn } => {
                if let Some(subscribers) = self.channels.get_mut(&topic) {
                    subscribers.remove(&conn);
                    if subscribers.is_empty() {
                        self.channels.remove(&topic);
                    }
                }
            }
            ControlMsg::Stats { reply } => {
                let _ = reply.send(HubStats {
                    subscribers: self
                        .channels
                        .iter()
                        .map(|(topic, subscribers)| (topic.clone(), subscribers.len()))
                        .collect(),
                    presence: self.presence.clone(),
                });
            }
        }
    }

    async fn on_publish(&mut self, msg: PublishMsg) {
        let Some(subscribers) = self.channels.get(&msg.topic) else {
            return;
        };
        let frame = match codec::encode_envelope(
            self.codec,
            Action::Event,
            &EventBody {
                name: &msg.topic,
                value: &msg.payload,
            },
        ) {
            Ok(bytes) => codec::frame(self.codec, bytes),
            Err(err) => {
                tracing::error!(topic = %msg.topic, error = %err, "cannot encode event frame");
                return;
            }
        };
        let guard = self.guards.get(&msg.topic);

        for conn in subscribers {
            if !msg.targets.is_empty() && !msg.targets.contains(conn) {
                continue;
            }
            // Clone what we need out of the registry entry before awaiting.
            let Some((outbox, user)) = self
                .sessions
                .get(&conn.0)
                .map(|handle| (handle.outbox.clone(), handle.user))
            else {
                tracing::debug!(conn = conn.0, "subscriber has no live session");
                continue;
            };
            if let Some(guard) = guard {
                let info = SessionInfo { conn: *conn, user };
                if !guard(&msg.payload, &info) {
                    continue;
                }
            }
            // A full queue blocks here: slow readers push back on the hub.
            if outbox.send(frame.clone()).await.is_err() {
                tracing::warn!(conn = conn.0, topic = %msg.topic, "dropping event for terminated session");
            }
        }
    }

    fn on_presence(&mut self, msg: PresenceMsg) {
        let change = PresenceChange {
            user: msg.user,
            conn: msg.conn,
            online: msg.enter,
        };
        if msg.enter {
            let count = self.presence.entry(msg.user.0).or_insert(0);
            *count += 1;
            let boundary = *count == 1;
            self.fire(boundary, &change);
        } else {
            let Some(count) = self.presence.get(&msg.user.0).copied() else {
                tracing::debug!(user = msg.user.0, "presence count underflow");
                return;
            };
            if count <= 1 {
                self.presence.remove(&msg.user.0);
                self.fire(true, &change);
            } else {
                self.presence.insert(msg.user.0, count - 1);
                self.fire(false, &change);
            }
        }
    }

    fn fire(&self, boundary: bool, change: &PresenceChange) {
        let handler = if boundary {
            self.on_user.as_ref()
        } else {
            self.on_connection.as_ref()
        };
        if let Some(handler) = handler {
            handler(change);
        }
    }
}
