use std::time::Duration;

pub struct Config {
    pub valkey_url: String,
    pub listen_addr: String,
    /// Buffered events per session channel before slow receivers lag.
    pub channel_capacity: usize,
    /// How long a changed map may stay unsaved.
    pub persist_debounce: Duration,
    /// Snapshots kept in the archive's LRU cache.
    pub archive_cache: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            valkey_url: lookup("VALKEY_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".into()),
            listen_addr: lookup("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:3000".into()),
            channel_capacity: parse_or(&lookup, "FOG_CHANNEL_CAPACITY", 1024).max(1),
            persist_debounce: Duration::from_millis(parse_or(&lookup, "FOG_PERSIST_DEBOUNCE_MS", 1000)),
            archive_cache: parse_or(&lookup, "FOG_ARCHIVE_CACHE", 256).max(1),
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid {}={:?}, using {}", key, raw, default);
            default
        }),
    }
}
