use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Mutex;

/// Progress store semantics - key naming lives here so the API and any other
/// caller never drift on where completions and points are kept

pub const COMPLETED_PREFIX: &str = "codelab:completed";
pub const POINTS_PREFIX: &str = "codelab:points";

/// Key marking a challenge as completed by a user
pub fn completion_key(user_id: &str, challenge_id: &str) -> String {
    format!("{}:{}:{}", COMPLETED_PREFIX, user_id, challenge_id)
}

/// Key holding a user's point total
pub fn points_key(user_id: &str) -> String {
    format!("{}:{}", POINTS_PREFIX, user_id)
}

/// Synchronous key/value collaborator
pub trait ProgressStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    /// Atomically set `key` unless it exists; true when this call set it
    fn set_if_absent(&self, key: &str, value: &str) -> Result<bool>;
    /// Atomically add `delta` to the integer at `key` (0 when unset)
    fn incr_by(&self, key: &str, delta: i64) -> Result<i64>;
}

/// Process-local store, used when no Redis is configured and in tests
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))
    }
}

impl ProgressStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn set_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        let mut entries = self.entries()?;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut entries = self.entries()?;
        let current: i64 = match entries.get(key) {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("Value at {} is not an integer: {}", key, raw))?,
            None => 0,
        };
        let total = current + delta;
        entries.insert(key.to_string(), total.to_string());
        Ok(total)
    }
}

/// Redis-backed store using blocking commands
pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    pub fn open(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("Invalid Redis URL")?;
        Ok(Self { client })
    }
}

impl ProgressStore for RedisStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.client.get_connection().context("Failed to connect to Redis")?;
        let value: Option<String> = redis::Commands::get(&mut conn, key)?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.client.get_connection().context("Failed to connect to Redis")?;
        let _: () = redis::Commands::set(&mut conn, key, value)?;
        Ok(())
    }

    fn set_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.client.get_connection().context("Failed to connect to Redis")?;
        let set: bool = redis::Commands::set_nx(&mut conn, key, value)?;
        Ok(set)
    }

    fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.client.get_connection().context("Failed to connect to Redis")?;
        let total: i64 = redis::Commands::incr(&mut conn, key, delta)?;
        Ok(total)
    }
}

/// Read a user's point total (0 when unset)
pub fn points(store: &dyn ProgressStore, user_id: &str) -> Result<u64> {
    match store.get(&points_key(user_id))? {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("Corrupt points value for {}: {}", user_id, raw)),
        None => Ok(0),
    }
}

/// Mark a challenge complete and award its points once.
///
/// Returns true when this call recorded the completion, false when the
/// challenge was already completed and nothing changed. The completion key is
/// claimed with set-if-absent, so of several concurrent callers exactly one
/// adds the points.
pub fn record_completion(
    store: &dyn ProgressStore,
    user_id: &str,
    challenge_id: &str,
    awarded: u32,
) -> Result<bool> {
    let completed_at = chrono::Utc::now().to_rfc3339();
    if !store.set_if_absent(&completion_key(user_id, challenge_id), &completed_at)? {
        return Ok(false);
    }
    let total = store.incr_by(&points_key(user_id), i64::from(awarded))?;
    tracing::info!(user_id, challenge_id, awarded, total, "Recorded challenge completion");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_naming() {
        assert_eq!(completion_key("u1", "even-numbers"), "codelab:completed:u1:even-numbers");
        assert_eq!(points_key("u1"), "codelab:points:u1");
    }

    #[test]
    fn test_record_completion_awards_once() {
        let store = MemoryStore::new();
        assert!(record_completion(&store, "u1", "c1", 10).unwrap());
        assert!(!record_completion(&store, "u1", "c1", 10).unwrap());
        assert!(record_completion(&store, "u1", "c2", 5).unwrap());
        assert_eq!(points(&store, "u1").unwrap(), 15);
        assert_eq!(points(&store, "u2").unwrap(), 0);
    }

    #[test]
    fn test_concurrent_completions_award_once() {
        let store = MemoryStore::new();
        let start = std::sync::Barrier::new(8);
        let recorded = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        start.wait();
                        record_completion(&store, "u1", "c1", 25).unwrap()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count()
        });
        assert_eq!(recorded, 1);
        assert_eq!(points(&store, "u1").unwrap(), 25);
    }

    #[test]
    fn test_set_if_absent_and_incr_by() {
        let store = MemoryStore::new();
        assert!(store.set_if_absent("k", "first").unwrap());
        assert!(!store.set_if_absent("k", "second").unwrap());
        assert_eq!(store.get("k").unwrap().as_deref(), Some("first"));

        assert_eq!(store.incr_by("n", 5).unwrap(), 5);
        assert_eq!(store.incr_by("n", 7).unwrap(), 12);
        assert!(store.incr_by("k", 1).is_err());
    }

    #[test]
    fn test_corrupt_points_value() {
        let store = MemoryStore::new();
        store.set(&points_key("u1"), "lots").unwrap();
        assert!(points(&store, "u1").is_err());
    }

    #[test]
    #[ignore] // Requires a running Redis at REDIS_URL or localhost
    fn test_redis_store_roundtrip() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let store = RedisStore::open(&url).unwrap();
        let key = completion_key("test-user", &uuid::Uuid::new_v4().to_string());
        assert!(store.set_if_absent(&key, "done").unwrap());
        assert!(!store.set_if_absent(&key, "again").unwrap());
        assert_eq!(store.get(&key).unwrap().as_deref(), Some("done"));
    }
}
