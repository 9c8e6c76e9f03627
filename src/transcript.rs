use chrono::Local;
use std::collections::VecDeque;

/// Most-recent entries kept for display; older ones are dropped.
pub const TRANSCRIPT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Clone)]
pub struct TranscriptionEntry {
    pub role: Role,
    pub text: String,
    pub timestamp: String,
}

fn wall_ts() -> String {
    Local::now().format("%H:%M:%S%.3f").to_string()
}

/// Bounded rolling log of transcription fragments. Display-only state, not
/// authoritative; nothing reads it back into the session.
#[derive(Debug, Default)]
pub struct TranscriptLog {
    entries: VecDeque<TranscriptionEntry>,
}

impl TranscriptLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, role: Role, text: &str) -> TranscriptionEntry {
        let entry = TranscriptionEntry {
            role,
            text: text.to_string(),
            timestamp: wall_ts(),
        };
        self.entries.push_back(entry.clone());
        while self.entries.len() > TRANSCRIPT_CAPACITY {
            self.entries.pop_front();
        }
        entry
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &TranscriptionEntry> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_most_recent_entries() {
        let mut log = TranscriptLog::new();
        for i in 0..TRANSCRIPT_CAPACITY + 5 {
            log.push(Role::User, &format!("fragment {}", i));
        }
        assert_eq!(log.len(), TRANSCRIPT_CAPACITY);
        let first = log.entries().next().map(|e| e.text.clone());
        assert_eq!(first.as_deref(), Some("fragment 5"));
    }

    #[test]
    fn preserves_arrival_order_and_roles() {
        let mut log = TranscriptLog::new();
        log.push(Role::User, "where am i");
        log.push(Role::Model, "clear path ahead");
        let roles: Vec<Role> = log.entries().map(|e| e.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Model]);
    }
}
