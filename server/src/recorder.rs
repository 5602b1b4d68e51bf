use fog_common::{
    FogPayload, FogStateSnapshot, FogStore, FogSyncData, FogSyncService, Hub, Identity, MapBounds,
    SyncEvent, SyncOptions,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::archive::FogArchive;

/// Server-side copy of every map a session has broadcast, with the maps awaiting a save.
pub struct SessionMirror {
    debounce: Duration,
    stores: HashMap<String, FogStore>,
    dirty: HashMap<String, Instant>,
}

impl SessionMirror {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            stores: HashMap::new(),
            dirty: HashMap::new(),
        }
    }

    pub fn contains(&self, map_id: &str) -> bool {
        self.stores.contains_key(map_id)
    }

    /// Apply a broadcast. A map is mirrored from its first snapshot on; deltas
    /// before that are ignored. Returns whether the map changed.
    pub fn apply(&mut self, data: &FogSyncData, now: Instant) -> bool {
        if !self.stores.contains_key(&data.map_id) {
            let FogPayload::Snapshot { snapshot } = &data.payload else {
                tracing::debug!("Delta for unmirrored map {}, waiting for a snapshot", data.map_id);
                return false;
            };
            self.stores
                .insert(data.map_id.clone(), store_from_snapshot(&data.map_id, snapshot));
        }
        let Some(store) = self.stores.get_mut(&data.map_id) else {
            return false;
        };

        match store.apply_remote(data) {
            Ok(true) => {
                self.dirty
                    .entry(data.map_id.clone())
                    .or_insert(now + self.debounce);
                true
            }
            Ok(false) => false,
            Err(e) => {
                tracing::warn!("Rejected fog update for map {}: {}", data.map_id, e);
                false
            }
        }
    }

    /// Earliest pending save.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.dirty.values().min().copied()
    }

    /// Snapshots whose debounce has elapsed, removed from the dirty set.
    pub fn take_due(&mut self, now: Instant) -> Vec<(String, FogStateSnapshot)> {
        let due: Vec<String> = self
            .dirty
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(map_id, _)| map_id.clone())
            .collect();
        due.into_iter()
            .filter_map(|map_id| self.take(map_id))
            .collect()
    }

    /// Every unsaved snapshot regardless of deadline.
    pub fn take_all(&mut self) -> Vec<(String, FogStateSnapshot)> {
        let all: Vec<String> = self.dirty.keys().cloned().collect();
        all.into_iter().filter_map(|map_id| self.take(map_id)).collect()
    }

    fn take(&mut self, map_id: String) -> Option<(String, FogStateSnapshot)> {
        self.dirty.remove(&map_id);
        let snapshot = self.stores.get(&map_id)?.snapshot();
        Some((map_id, snapshot))
    }
}

fn store_from_snapshot(map_id: &str, snapshot: &FogStateSnapshot) -> FogStore {
    let bounds = MapBounds::from_size(
        snapshot.cols as f64 * snapshot.cell_size,
        snapshot.rows as f64 * snapshot.cell_size,
    );
    let mut store = FogStore::new(map_id, bounds, snapshot.cell_size);
    store.restore(snapshot);
    store
}

/// Running recorder per session.
///
/// A recorder deregisters itself only while holding the registry lock and after
/// seeing the session empty, so a connection that tracks presence and then calls
/// [`RecorderRegistry::ensure`] is always covered by a live recorder.
#[derive(Default)]
pub struct RecorderRegistry {
    running: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl RecorderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `start()` for the session unless its recorder is registered.
    /// Returns whether a recorder was started.
    pub async fn ensure<F, Fut>(&self, session_id: &str, start: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut running = self.running.lock().await;
        running.retain(|_, handle| !handle.is_finished());
        if running.contains_key(session_id) {
            return false;
        }
        running.insert(session_id.to_string(), tokio::spawn(start()));
        true
    }

    /// Deregister the session's recorder if nobody is present. A recorder that
    /// gets `true` must stop.
    pub async fn release_if_idle(&self, hub: &Hub, session_id: &str) -> bool {
        let mut running = self.running.lock().await;
        if !hub.presence(session_id).is_empty() {
            return false;
        }
        running.remove(session_id);
        true
    }

    pub async fn len(&self) -> usize {
        self.running.lock().await.len()
    }
}

/// Follow a session's fog broadcasts and persist them until the last peer leaves.
pub async fn run(
    hub: Arc<Hub>,
    archive: Arc<Mutex<FogArchive>>,
    registry: Arc<RecorderRegistry>,
    session_id: String,
    debounce: Duration,
) {
    let mut service = FogSyncService::with_options(
        hub.clone(),
        SyncOptions {
            track_presence: false,
            ..SyncOptions::default()
        },
    );
    service.initialize(&session_id, Some(Identity::new("recorder", false)));
    let mut mirror = SessionMirror::new(debounce);
    tracing::info!("Recorder started for session {}", session_id);

    // Everyone may have left before we subscribed.
    let mut stopping = registry.release_if_idle(&hub, &session_id).await;
    while !stopping {
        let deadline = mirror.next_deadline();
        tokio::select! {
            event = service.recv() => match event {
                Some(SyncEvent::FogUpdate(data)) => {
                    mirror.apply(&data, Instant::now());
                }
                Some(SyncEvent::PeerLeft(_)) => {
                    stopping = registry.release_if_idle(&hub, &session_id).await;
                }
                Some(_) => {}
                None => break,
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                save(&archive, &session_id, mirror.take_due(Instant::now())).await;
            }
        }
    }

    save(&archive, &session_id, mirror.take_all()).await;
    service.disconnect();
    tracing::info!("Recorder stopped for session {}", session_id);
}

async fn save(archive: &Mutex<FogArchive>, session_id: &str, snapshots: Vec<(String, FogStateSnapshot)>) {
    if snapshots.is_empty() {
        return;
    }
    let mut archive = archive.lock().await;
    for (map_id, snapshot) in snapshots {
        tracing::debug!("Persisting fog for {}/{}", session_id, map_id);
        archive.put_snapshot(session_id, &map_id, snapshot).await;
    }
}
