//! Session-scoped fog synchronization.
//!
//! [`FogSyncService`] joins a session channel on a [`Hub`], publishes the local
//! store's state and hands remote updates to registered subscribers. Delivery is
//! driven by the owner calling [`FogSyncService::recv`] from its event loop, so
//! the store it feeds never needs a lock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;

use crate::error::SyncError;
use crate::hub::{Channel, ChannelEvent, Hub, Presence, Role};
use crate::store::FogStore;
use crate::throttle::{PaintThrottle, DEFAULT_PAINT_INTERVAL};
use crate::wire::{
    diff_runs, now_ms, FogPayload, FogSyncData, ResyncRequest, Stamp, FOG_RESYNC_EVENT,
    FOG_UPDATE_EVENT, SCHEMA_VERSION,
};

static ANONYMOUS_PEERS: AtomicU64 = AtomicU64::new(1);

/// Who this client is, as resolved by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub is_dm: bool,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, is_dm: bool) -> Self {
        Self {
            user_id: user_id.into(),
            is_dm,
        }
    }

    /// Placeholder for unauthenticated clients.
    pub fn anonymous() -> Self {
        let n = ANONYMOUS_PEERS.fetch_add(1, Ordering::Relaxed);
        Self::new(format!("anonymous-{n}"), false)
    }

    fn role(&self) -> Role {
        if self.is_dm {
            Role::Dm
        } else {
            Role::Player
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Minimum spacing between broadcasts of the same map.
    pub min_interval: Duration,
    /// A full snapshot is sent after this many consecutive deltas.
    pub keyframe_every: u32,
    /// Whether to appear in the session's presence table.
    pub track_presence: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            min_interval: DEFAULT_PAINT_INTERVAL,
            keyframe_every: 10,
            track_presence: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Disconnected,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastOutcome {
    Sent,
    /// Inside the throttle interval; call `flush_pending` later.
    Deferred,
    NotReady,
    /// The store has not changed since the last broadcast.
    Unchanged,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    FogUpdate(FogSyncData),
    PeerJoined(Presence),
    PeerLeft(Presence),
    /// A peer is missing fog state. The holder of the maps should broadcast them
    /// again; the next broadcast of each covered map is a full snapshot.
    ResyncRequested { map_id: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

type FogCallback = Box<dyn FnMut(&FogSyncData) + Send>;
type PresenceCallback = Box<dyn FnMut(&SyncEvent) + Send>;

struct Joined {
    channel: Channel,
    events: broadcast::Receiver<ChannelEvent>,
}

/// What the last broadcast of a map looked like, for delta encoding.
struct Baseline {
    version: u64,
    dims: (u32, u32),
    buffer: Vec<u8>,
    deltas_since_snapshot: u32,
    /// `last_updated` of that broadcast; the base of the next delta.
    sent_at: u64,
}

pub struct FogSyncService {
    hub: Arc<Hub>,
    options: SyncOptions,
    identity: Option<Identity>,
    joined: Option<Joined>,
    fog_subscribers: Vec<(SubscriberId, FogCallback)>,
    presence_subscribers: Vec<(SubscriberId, PresenceCallback)>,
    next_subscriber: u64,
    peers: HashMap<String, Presence>,
    baselines: HashMap<String, Baseline>,
    throttles: HashMap<String, PaintThrottle>,
    last_sent_at: u64,
    /// Newest update delivered per map, for checking delta bases.
    received: HashMap<String, Stamp>,
    /// Maps a snapshot has been requested for.
    awaiting: HashSet<String>,
    /// A resync of every map went out and nothing was delivered since.
    resync_pending: bool,
}

impl FogSyncService {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self::with_options(hub, SyncOptions::default())
    }

    pub fn with_options(hub: Arc<Hub>, options: SyncOptions) -> Self {
        Self {
            hub,
            options,
            identity: None,
            joined: None,
            fog_subscribers: Vec::new(),
            presence_subscribers: Vec::new(),
            next_subscriber: 1,
            peers: HashMap::new(),
            baselines: HashMap::new(),
            throttles: HashMap::new(),
            last_sent_at: 0,
            received: HashMap::new(),
            awaiting: HashSet::new(),
            resync_pending: false,
        }
    }

    /// Join the channel of `session_id`.
    ///
    /// Joining the session already joined is a no-op; joining another one leaves
    /// the current session first. Registered subscribers are kept either way.
    pub fn initialize(&mut self, session_id: &str, identity: Option<Identity>) {
        if let Some(joined) = &self.joined {
            if joined.channel.session_id() == session_id {
                tracing::debug!("Already joined fog session {}", session_id);
                return;
            }
            self.leave();
        }

        let identity = identity.unwrap_or_else(Identity::anonymous);
        let mut channel = self.hub.join(session_id);
        let events = channel.subscribe();
        if self.options.track_presence {
            channel.track(&identity.user_id, identity.role());
        }

        self.peers = channel
            .presence_state()
            .into_iter()
            .filter(|p| p.peer_key != channel.peer_key())
            .map(|p| (p.peer_key.clone(), p))
            .collect();

        tracing::info!(
            "Joined fog session {} as {} ({} peers online)",
            session_id,
            identity.user_id,
            self.peers.len()
        );
        self.identity = Some(identity);
        self.joined = Some(Joined { channel, events });
    }

    pub fn status(&self) -> SyncStatus {
        if self.joined.is_some() {
            SyncStatus::Connected
        } else {
            SyncStatus::Disconnected
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.joined.as_ref().map(|j| j.channel.session_id())
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Other peers currently in the session.
    pub fn peers(&self) -> Vec<Presence> {
        let mut peers: Vec<Presence> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.peer_key.cmp(&b.peer_key));
        peers
    }

    fn next_id(&mut self) -> SubscriberId {
        let id = SubscriberId(self.next_subscriber);
        self.next_subscriber += 1;
        id
    }

    /// Register a callback for remote fog updates. Earlier registrations stay active.
    pub fn on_fog_update<F>(&mut self, callback: F) -> SubscriberId
    where
        F: FnMut(&FogSyncData) + Send + 'static,
    {
        let id = self.next_id();
        self.fog_subscribers.push((id, Box::new(callback)));
        id
    }

    /// Register a callback for peers joining or leaving and for resync requests.
    pub fn on_presence<F>(&mut self, callback: F) -> SubscriberId
    where
        F: FnMut(&SyncEvent) + Send + 'static,
    {
        let id = self.next_id();
        self.presence_subscribers.push((id, Box::new(callback)));
        id
    }

    pub fn remove_subscriber(&mut self, id: SubscriberId) -> bool {
        let before = self.fog_subscribers.len() + self.presence_subscribers.len();
        self.fog_subscribers.retain(|(sid, _)| *sid != id);
        self.presence_subscribers.retain(|(sid, _)| *sid != id);
        before != self.fog_subscribers.len() + self.presence_subscribers.len()
    }

    /// Publish the store's current state.
    ///
    /// Never fails loudly: problems are logged and reported through the outcome so
    /// painting keeps working while the channel is down.
    pub fn broadcast_fog_update(&mut self, store: &FogStore) -> BroadcastOutcome {
        let Some(joined) = &self.joined else {
            tracing::warn!(
                "Fog broadcast for map {} dropped: {}",
                store.map_id(),
                SyncError::ChannelNotReady
            );
            return BroadcastOutcome::NotReady;
        };
        let map_id = store.map_id();

        if let Some(baseline) = self.baselines.get(map_id) {
            if baseline.version == store.version() {
                return BroadcastOutcome::Unchanged;
            }
        }

        let throttle = self
            .throttles
            .entry(map_id.to_string())
            .or_insert_with(|| PaintThrottle::new(self.options.min_interval));
        if !throttle.admit(Instant::now()) {
            return BroadcastOutcome::Deferred;
        }

        let dims = store.dims();
        let (payload, deltas_since_snapshot) = match self.baselines.get(map_id) {
            Some(baseline)
                if baseline.dims == dims
                    && baseline.deltas_since_snapshot < self.options.keyframe_every =>
            {
                let (cols, rows) = dims;
                let payload = FogPayload::Delta {
                    cols,
                    rows,
                    base: baseline.sent_at,
                    runs: diff_runs(&baseline.buffer, store.raw()),
                };
                (payload, baseline.deltas_since_snapshot + 1)
            }
            _ => (
                FogPayload::Snapshot {
                    snapshot: store.snapshot(),
                },
                0,
            ),
        };

        // Strictly increasing per sender so our own updates never tie.
        let last_updated = now_ms().max(self.last_sent_at + 1);
        let data = FogSyncData {
            schema: SCHEMA_VERSION,
            session_id: joined.channel.session_id().to_string(),
            map_id: map_id.to_string(),
            payload,
            fog_settings: store.settings().clone(),
            last_updated,
            updated_by: self
                .identity
                .as_ref()
                .map(|i| i.user_id.clone())
                .unwrap_or_default(),
        };

        let json = match data.to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("Failed to encode fog update for map {}: {}", map_id, e);
                return BroadcastOutcome::Failed;
            }
        };
        let receivers = joined.channel.broadcast(FOG_UPDATE_EVENT, json);
        tracing::debug!(
            "Broadcast fog {} for map {} v{} to {} receivers",
            if data.payload.is_snapshot() { "snapshot" } else { "delta" },
            map_id,
            store.version(),
            receivers
        );

        self.last_sent_at = last_updated;
        self.baselines.insert(
            map_id.to_string(),
            Baseline {
                version: store.version(),
                dims,
                buffer: store.raw().to_vec(),
                deltas_since_snapshot,
                sent_at: last_updated,
            },
        );
        BroadcastOutcome::Sent
    }

    /// Send an update that was deferred by the throttle, once its interval passed.
    pub fn flush_pending(&mut self, store: &FogStore) -> BroadcastOutcome {
        match self.pending_deadline(store.map_id()) {
            None => BroadcastOutcome::Unchanged,
            Some(deadline) if Instant::now() < deadline => BroadcastOutcome::Deferred,
            Some(_) => self.broadcast_fog_update(store),
        }
    }

    /// When the deferred update for `map_id` may be flushed.
    pub fn pending_deadline(&self, map_id: &str) -> Option<Instant> {
        self.throttles.get(map_id).and_then(|t| t.ready_at())
    }

    /// Ask the session for full snapshots of `map_id`, or of every map.
    /// Returns whether the request went out.
    pub fn request_resync(&self, map_id: Option<&str>) -> bool {
        let Some(joined) = &self.joined else {
            tracing::warn!("Resync request dropped: {}", SyncError::ChannelNotReady);
            return false;
        };
        let request = ResyncRequest {
            map_id: map_id.map(str::to_string),
        };
        match serde_json::to_value(&request) {
            Ok(payload) => {
                tracing::info!("Requesting fog resync for {}", map_id.unwrap_or("all maps"));
                joined.channel.broadcast(FOG_RESYNC_EVENT, payload);
                true
            }
            Err(e) => {
                tracing::error!("Failed to encode resync request: {}", e);
                false
            }
        }
    }

    /// Whether a received update can be handed to the store.
    ///
    /// Deltas whose base is not the last update delivered for the map are dropped
    /// and a snapshot is requested instead.
    fn accept_update(&mut self, data: &FogSyncData) -> bool {
        let stamp = data.stamp();
        let last = self.received.get(&data.map_id);
        let newer = last.map_or(true, |last| stamp >= *last);

        if let FogPayload::Delta { base, .. } = &data.payload {
            let continues = last.is_some_and(|last| {
                *last == stamp || (last.at == *base && last.by == data.updated_by)
            });
            if !continues {
                if !newer {
                    tracing::debug!("Dropping stale fog delta for map {}", data.map_id);
                    return false;
                }
                tracing::warn!(
                    "Fog delta for map {} is based on {} which was never received",
                    data.map_id,
                    base
                );
                if !self.resync_pending && self.awaiting.insert(data.map_id.clone()) {
                    self.request_resync(Some(&data.map_id));
                }
                return false;
            }
        } else {
            self.awaiting.remove(&data.map_id);
        }

        if newer {
            self.received.insert(data.map_id.clone(), stamp);
        }
        true
    }

    /// Wait for the next event from the session.
    ///
    /// Own broadcasts and presence, malformed payloads and other event names are
    /// skipped, as are deltas that do not follow the last update received for
    /// their map. A lagging receiver asks for fresh snapshots. Returns `None`
    /// once disconnected.
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        loop {
            let received = self.joined.as_mut()?.events.recv().await;
            let event = match received {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Fog channel lagged, {} events skipped", skipped);
                    self.received.clear();
                    self.awaiting.clear();
                    if !self.resync_pending {
                        self.resync_pending = self.request_resync(None);
                    }
                    continue;
                }
                Err(RecvError::Closed) => {
                    tracing::warn!("Fog channel closed");
                    self.leave();
                    return None;
                }
            };
            let (own_key, session_id) = match &self.joined {
                Some(joined) => (
                    joined.channel.peer_key().to_string(),
                    joined.channel.session_id().to_string(),
                ),
                None => return None,
            };

            let sync_event = match event {
                ChannelEvent::Broadcast {
                    event,
                    payload,
                    sender,
                } => {
                    if sender == own_key {
                        continue;
                    }
                    if event == FOG_RESYNC_EVENT {
                        let request: ResyncRequest = match serde_json::from_value(payload) {
                            Ok(request) => request,
                            Err(e) => {
                                tracing::warn!("Dropping resync request from {}: {}", sender, e);
                                continue;
                            }
                        };
                        self.baselines.retain(|map_id, _| !request.covers(map_id));
                        SyncEvent::ResyncRequested {
                            map_id: request.map_id,
                        }
                    } else if event == FOG_UPDATE_EVENT {
                        let data = match FogSyncData::from_json(payload) {
                            Ok(data) => data,
                            Err(e) => {
                                tracing::warn!("Dropping fog update from {}: {}", sender, e);
                                continue;
                            }
                        };
                        if data.session_id != session_id {
                            tracing::warn!(
                                "Dropping fog update for session {} on {}",
                                data.session_id,
                                session_id
                            );
                            continue;
                        }
                        if !self.accept_update(&data) {
                            continue;
                        }
                        SyncEvent::FogUpdate(data)
                    } else {
                        continue;
                    }
                }
                ChannelEvent::Join(presence) => {
                    if presence.peer_key == own_key {
                        continue;
                    }
                    tracing::info!("Peer {} joined fog session", presence.user_id);
                    // The newcomer has no base for deltas.
                    self.baselines.clear();
                    self.peers.insert(presence.peer_key.clone(), presence.clone());
                    SyncEvent::PeerJoined(presence)
                }
                ChannelEvent::Leave(presence) => {
                    if presence.peer_key == own_key {
                        continue;
                    }
                    tracing::info!("Peer {} left fog session", presence.user_id);
                    self.peers.remove(&presence.peer_key);
                    SyncEvent::PeerLeft(presence)
                }
            };

            self.resync_pending = false;
            match &sync_event {
                SyncEvent::FogUpdate(data) => {
                    for (_, callback) in self.fog_subscribers.iter_mut() {
                        callback(data);
                    }
                }
                _ => {
                    for (_, callback) in self.presence_subscribers.iter_mut() {
                        callback(&sync_event);
                    }
                }
            }
            return Some(sync_event);
        }
    }

    fn leave(&mut self) {
        if let Some(mut joined) = self.joined.take() {
            joined.channel.untrack();
            tracing::info!("Left fog session {}", joined.channel.session_id());
        }
        self.peers.clear();
        self.baselines.clear();
        self.throttles.clear();
        self.received.clear();
        self.awaiting.clear();
        self.resync_pending = false;
    }

    /// Leave the session and forget all local state, subscribers included.
    /// Safe to call when not connected.
    pub fn disconnect(&mut self) {
        self.leave();
        self.identity = None;
        self.fog_subscribers.clear();
        self.presence_subscribers.clear();
    }
}

impl Drop for FogSyncService {
    fn drop(&mut self) {
        self.leave();
    }
}
