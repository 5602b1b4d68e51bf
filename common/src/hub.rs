//! In-process realtime channels.
//!
//! One topic per session, each with a broadcast stream and a presence table.
//! The server's WebSocket relay and the sync service both sit on top of this.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

use crate::wire::now_ms;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Dm,
    Player,
}

/// A connected peer as seen by the rest of the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    /// Unique per connection; one user may hold several.
    pub peer_key: String,
    pub user_id: String,
    pub role: Role,
    pub online_at: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Broadcast {
        event: String,
        payload: serde_json::Value,
        /// Peer key of the publishing connection.
        sender: String,
    },
    Join(Presence),
    Leave(Presence),
}

struct Topic {
    tx: broadcast::Sender<ChannelEvent>,
    presence: Mutex<HashMap<String, Presence>>,
}

/// Registry of session topics.
pub struct Hub {
    capacity: usize,
    topics: Mutex<HashMap<String, Arc<Topic>>>,
    next_peer: AtomicU64,
}

impl Hub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Mutex::new(HashMap::new()),
            next_peer: AtomicU64::new(1),
        }
    }

    /// Channel name a session's fog traffic travels on.
    pub fn channel_name(session_id: &str) -> String {
        format!("fog:{session_id}")
    }

    /// Open a handle on the session's channel, creating the topic if needed.
    pub fn join(&self, session_id: &str) -> Channel {
        let name = Self::channel_name(session_id);
        let topic = lock(&self.topics)
            .entry(name.clone())
            .or_insert_with(|| {
                tracing::debug!("Opening channel {}", name);
                let (tx, _) = broadcast::channel(self.capacity);
                Arc::new(Topic {
                    tx,
                    presence: Mutex::new(HashMap::new()),
                })
            })
            .clone();
        let peer = self.next_peer.fetch_add(1, Ordering::Relaxed);

        Channel {
            session_id: session_id.to_string(),
            peer_key: format!("peer-{peer}"),
            topic,
            tracked: false,
        }
    }

    /// Presence table of a session, empty if nobody has joined it.
    pub fn presence(&self, session_id: &str) -> Vec<Presence> {
        let topic = lock(&self.topics).get(&Self::channel_name(session_id)).cloned();
        topic.map(|t| sorted_presence(&t)).unwrap_or_default()
    }

    /// Drop topics nobody listens to or is tracked on. Returns how many went away.
    pub fn prune(&self) -> usize {
        let mut topics = lock(&self.topics);
        let before = topics.len();
        topics.retain(|_, topic| {
            topic.tx.receiver_count() > 0 || !lock(&topic.presence).is_empty()
        });
        before - topics.len()
    }

    pub fn topic_count(&self) -> usize {
        lock(&self.topics).len()
    }
}

fn sorted_presence(topic: &Topic) -> Vec<Presence> {
    let mut peers: Vec<Presence> = lock(&topic.presence).values().cloned().collect();
    peers.sort_by(|a, b| a.peer_key.cmp(&b.peer_key));
    peers
}

/// One connection's handle on a session channel. Untracks itself on drop.
pub struct Channel {
    session_id: String,
    peer_key: String,
    topic: Arc<Topic>,
    tracked: bool,
}

impl Channel {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn peer_key(&self) -> &str {
        &self.peer_key
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.topic.tx.subscribe()
    }

    /// Publish to every subscriber. Returns how many received it.
    pub fn broadcast(&self, event: &str, payload: serde_json::Value) -> usize {
        self.topic
            .tx
            .send(ChannelEvent::Broadcast {
                event: event.to_string(),
                payload,
                sender: self.peer_key.clone(),
            })
            .unwrap_or(0)
    }

    /// Announce this connection in the presence table.
    pub fn track(&mut self, user_id: &str, role: Role) -> Presence {
        let presence = Presence {
            peer_key: self.peer_key.clone(),
            user_id: user_id.to_string(),
            role,
            online_at: now_ms(),
        };
        lock(&self.topic.presence).insert(self.peer_key.clone(), presence.clone());
        self.tracked = true;
        let _ = self.topic.tx.send(ChannelEvent::Join(presence.clone()));
        presence
    }

    pub fn untrack(&mut self) {
        if !self.tracked {
            return;
        }
        self.tracked = false;
        let removed = lock(&self.topic.presence).remove(&self.peer_key);
        if let Some(presence) = removed {
            let _ = self.topic.tx.send(ChannelEvent::Leave(presence));
        }
    }

    pub fn is_tracked(&self) -> bool {
        self.tracked
    }

    pub fn presence_state(&self) -> Vec<Presence> {
        sorted_presence(&self.topic)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.untrack();
    }
}
