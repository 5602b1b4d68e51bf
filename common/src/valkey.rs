/// Valkey set of every session that has persisted fog.
pub const FOG_SESSIONS: &str = "fog_sessions";

/// Build the Valkey key for a map's persisted fog snapshot.
pub fn fog_snapshot_key(session_id: &str, map_id: &str) -> String {
    format!("fog:{session_id}:{map_id}")
}

/// Build the Valkey key for the set of map ids with fog in a session.
pub fn session_maps_key(session_id: &str) -> String {
    format!("fog_maps:{session_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_by_session() {
        assert_eq!(fog_snapshot_key("s1", "cave"), "fog:s1:cave");
        assert_eq!(session_maps_key("s1"), "fog_maps:s1");
    }
}
