//! Ordered pool of API keys with failover rotation.
//!
//! Keys come in from the environment in priority order. Construction drops
//! empty strings and the usual placeholder sentinels people leave in env
//! files, then dedupes while keeping the original order, so one connect
//! attempt per surviving entry exhausts the pool.

const PLACEHOLDER_SENTINELS: &[&str] = &[
    "YOUR_API_KEY",
    "YOUR_API_KEY_HERE",
    "PLACEHOLDER",
    "CHANGEME",
    "NONE",
];

fn is_placeholder(value: &str) -> bool {
    let upper = value.to_ascii_uppercase();
    PLACEHOLDER_SENTINELS.iter().any(|s| upper == *s)
}

#[derive(Debug, Clone)]
pub struct KeyPool {
    keys: Vec<String>,
}

impl KeyPool {
    pub fn new<I>(raw: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut keys: Vec<String> = Vec::new();
        for key in raw {
            let key = key.trim();
            if key.is_empty() || is_placeholder(key) {
                continue;
            }
            if keys.iter().any(|k| k == key) {
                continue;
            }
            keys.push(key.to_string());
        }
        Self { keys }
    }

    /// Reads `WAYFARER_API_KEYS` (comma-separated, priority order) and the
    /// single-key `GEMINI_API_KEY` fallback.
    pub fn from_env() -> Self {
        let mut raw: Vec<String> = Vec::new();
        if let Ok(list) = std::env::var("WAYFARER_API_KEYS") {
            raw.extend(list.split(',').map(|s| s.to_string()));
        }
        if let Ok(single) = std::env::var("GEMINI_API_KEY") {
            raw.push(single);
        }
        Self::new(raw)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn get(&self, index: usize) -> &str {
        &self.keys[index]
    }

    /// Next index after a failed attempt, wrapping at the pool size.
    pub fn rotate(&self, index: usize) -> usize {
        (index + 1) % self.keys.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(|k| k.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(keys: &[&str]) -> KeyPool {
        KeyPool::new(keys.iter().map(|k| k.to_string()))
    }

    #[test]
    fn filters_empty_and_placeholder_entries() {
        let pool = pool_of(&["", "  ", "YOUR_API_KEY", "changeme", "real-key-1"]);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.get(0), "real-key-1");
    }

    #[test]
    fn dedupes_preserving_order() {
        let pool = pool_of(&["k1", "k2", "k1", " k2 ", "k3"]);
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.get(0), "k1");
        assert_eq!(pool.get(1), "k2");
        assert_eq!(pool.get(2), "k3");
    }

    #[test]
    fn rotate_wraps_around() {
        let pool = pool_of(&["k1", "k2", "k3"]);
        assert_eq!(pool.rotate(0), 1);
        assert_eq!(pool.rotate(2), 0);
    }

    #[test]
    fn all_placeholders_yield_empty_pool() {
        let pool = pool_of(&["YOUR_API_KEY_HERE", "placeholder", ""]);
        assert!(pool.is_empty());
    }
}
