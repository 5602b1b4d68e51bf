use fog_common::valkey;
use fog_common::FogStateSnapshot;
use lru::LruCache;
use redis::AsyncCommands;
use std::num::NonZero;

/// Persisted fog snapshots, one per (session, map), fronted by an LRU cache.
pub struct FogArchive {
    cache: LruCache<(String, String), FogStateSnapshot>,
    valkey: redis::aio::MultiplexedConnection,
}

impl FogArchive {
    pub fn new(valkey: redis::aio::MultiplexedConnection, capacity: usize) -> Self {
        Self {
            cache: LruCache::new(NonZero::new(capacity.max(1)).unwrap_or(NonZero::<usize>::MIN)),
            valkey,
        }
    }

    /// Get or load the stored snapshot of a map. Missing and corrupt entries are `None`.
    pub async fn get_snapshot(&mut self, session_id: &str, map_id: &str) -> Option<FogStateSnapshot> {
        let key = (session_id.to_string(), map_id.to_string());
        if let Some(snapshot) = self.cache.get(&key) {
            return Some(snapshot.clone());
        }

        let raw: Option<String> = self
            .valkey
            .get(valkey::fog_snapshot_key(session_id, map_id))
            .await
            .unwrap_or_else(|e| {
                tracing::error!("Failed to read fog for {}/{}: {}", session_id, map_id, e);
                None
            });

        let snapshot = decode_snapshot(session_id, map_id, &raw?)?;
        self.cache.put(key, snapshot.clone());
        Some(snapshot)
    }

    /// Store a snapshot and register the map under its session.
    pub async fn put_snapshot(&mut self, session_id: &str, map_id: &str, snapshot: FogStateSnapshot) {
        let json = match serde_json::to_string(&snapshot) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("Failed to encode fog for {}/{}: {}", session_id, map_id, e);
                return;
            }
        };

        let _: () = redis::pipe()
            .set(valkey::fog_snapshot_key(session_id, map_id), json).ignore()
            .sadd(valkey::session_maps_key(session_id), map_id).ignore()
            .sadd(valkey::FOG_SESSIONS, session_id).ignore()
            .query_async(&mut self.valkey)
            .await
            .unwrap_or_else(|e| {
                tracing::error!("Failed to write fog for {}/{}: {}", session_id, map_id, e);
            });

        self.cache
            .put((session_id.to_string(), map_id.to_string()), snapshot);
    }

    /// Map ids with stored fog in a session, sorted.
    pub async fn list_maps(&mut self, session_id: &str) -> Vec<String> {
        let mut maps: Vec<String> = self
            .valkey
            .smembers(valkey::session_maps_key(session_id))
            .await
            .unwrap_or_default();
        maps.sort();
        maps
    }
}

/// Parse a stored blob; anything unusable is logged and treated as absent.
fn decode_snapshot(session_id: &str, map_id: &str, raw: &str) -> Option<FogStateSnapshot> {
    let snapshot: FogStateSnapshot = match serde_json::from_str(raw) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            tracing::warn!("Corrupt fog blob for {}/{}: {}", session_id, map_id, e);
            return None;
        }
    };
    if let Err(e) = snapshot.validate() {
        tracing::warn!("Invalid fog blob for {}/{}: {}", session_id, map_id, e);
        return None;
    }
    Some(snapshot)
}
