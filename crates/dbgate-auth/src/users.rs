//! Per-listener user tables.
//!
//! A users table maps a user name to the authentication data the listener's
//! authenticator checks against (typically a password or password hash).

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use parking_lot::RwLock;

/// A table of users and their authentication data.
#[derive(Debug, Default)]
pub struct Users {
    entries: RwLock<HashMap<String, String>>,
    n_adds: AtomicU64,
    n_deletes: AtomicU64,
    n_fetches: AtomicU64,
}

/// Usage statistics for a users table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsersStats {
    /// Current number of entries.
    pub n_entries: usize,
    /// Number of add calls.
    pub n_adds: u64,
    /// Number of delete calls.
    pub n_deletes: u64,
    /// Number of fetch calls.
    pub n_fetches: u64,
}

impl Users {
    /// Create an empty users table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a user. Returns `false` if the user already exists.
    pub fn add(&self, user: impl Into<String>, auth: impl Into<String>) -> bool {
        self.n_adds.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write();
        match entries.entry(user.into()) {
            hashbrown::hash_map::Entry::Occupied(_) => false,
            hashbrown::hash_map::Entry::Vacant(slot) => {
                slot.insert(auth.into());
                true
            }
        }
    }

    /// Delete a user. Returns `true` if the user was present.
    pub fn delete(&self, user: &str) -> bool {
        self.n_deletes.fetch_add(1, Ordering::Relaxed);
        self.entries.write().remove(user).is_some()
    }

    /// Fetch the authentication data stored for a user.
    #[must_use]
    pub fn fetch(&self, user: &str) -> Option<String> {
        self.n_fetches.fetch_add(1, Ordering::Relaxed);
        self.entries.read().get(user).cloned()
    }

    /// Replace the authentication data of an existing user.
    ///
    /// Returns `false` without inserting anything if the user is unknown.
    pub fn update(&self, user: &str, auth: impl Into<String>) -> bool {
        match self.entries.write().get_mut(user) {
            Some(existing) => {
                *existing = auth.into();
                true
            }
            None => false,
        }
    }

    /// Remove every entry, keeping the statistics.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// User names currently in the table, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshot of the table statistics.
    #[must_use]
    pub fn stats(&self) -> UsersStats {
        UsersStats {
            n_entries: self.len(),
            n_adds: self.n_adds.load(Ordering::Relaxed),
            n_deletes: self.n_deletes.load(Ordering::Relaxed),
            n_fetches: self.n_fetches.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_fetch_delete() {
        let users = Users::new();
        assert!(users.add("alice", "secret"));
        assert!(!users.add("alice", "other"));
        assert_eq!(users.fetch("alice").as_deref(), Some("secret"));
        assert!(users.delete("alice"));
        assert!(!users.delete("alice"));
        assert_eq!(users.fetch("alice"), None);

        let stats = users.stats();
        assert_eq!(stats.n_entries, 0);
        assert_eq!(stats.n_adds, 2);
        assert_eq!(stats.n_deletes, 2);
        assert_eq!(stats.n_fetches, 2);
    }

    #[test]
    fn test_update_requires_existing() {
        let users = Users::new();
        assert!(!users.update("bob", "pw"));
        assert!(users.is_empty());

        users.add("bob", "pw");
        assert!(users.update("bob", "pw2"));
        assert_eq!(users.fetch("bob").as_deref(), Some("pw2"));
    }

    #[test]
    fn test_names_sorted() {
        let users = Users::new();
        users.add("zed", "1");
        users.add("amy", "2");
        assert_eq!(users.names(), vec!["amy", "zed"]);
        users.clear();
        assert_eq!(users.len(), 0);
    }
}
