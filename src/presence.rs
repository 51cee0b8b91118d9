//! Online-user registry.
//!
//! Maps a username to its live connection and advertised peer-reach info.
//! All operations take the single registry lock; network writes never happen
//! under it — callers collect the link, release, then write.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::connection::PeerLink;
use crate::records::UserSummary;

/// One online user. Exclusively owned by [`Presence`].
#[derive(Clone)]
pub struct PresenceEntry {
    pub username: String,
    pub user_id: i64,
    pub link: Arc<dyn PeerLink>,
    pub last_seen: Instant,
    pub last_seen_wall: DateTime<Utc>,
    /// Advertised media port; peer-reach hint, never verified.
    pub p2p_port: u16,
    /// Advertised address; peer-reach hint, never verified.
    pub external_ip: String,
}

impl PresenceEntry {
    pub fn new(
        username: String,
        user_id: i64,
        link: Arc<dyn PeerLink>,
        p2p_port: u16,
        external_ip: String,
    ) -> Self {
        Self {
            username,
            user_id,
            link,
            last_seen: Instant::now(),
            last_seen_wall: Utc::now(),
            p2p_port,
            external_ip,
        }
    }
}

#[derive(Default)]
pub struct Presence {
    entries: RwLock<HashMap<String, PresenceEntry>>,
}

impl Presence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a user as online. Returns the displaced entry when the
    /// username was already connected; the caller owns its teardown.
    pub fn insert(&self, entry: PresenceEntry) -> Option<PresenceEntry> {
        self.entries
            .write()
            .insert(entry.username.clone(), entry)
    }

    pub fn link_of(&self, username: &str) -> Option<Arc<dyn PeerLink>> {
        self.entries.read().get(username).map(|e| e.link.clone())
    }

    pub fn contains(&self, username: &str) -> bool {
        self.entries.read().contains_key(username)
    }

    /// Refreshes `last_seen`; returns false when the user is not online.
    pub fn touch(&self, username: &str) -> bool {
        let mut entries = self.entries.write();
        match entries.get_mut(username) {
            Some(entry) => {
                entry.last_seen = Instant::now();
                entry.last_seen_wall = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Updates the advertised peer-reach hints, refreshing `last_seen`.
    pub fn update_reach(&self, username: &str, p2p_port: u16, external_ip: String) -> bool {
        let mut entries = self.entries.write();
        match entries.get_mut(username) {
            Some(entry) => {
                entry.p2p_port = p2p_port;
                entry.external_ip = external_ip;
                entry.last_seen = Instant::now();
                entry.last_seen_wall = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Removes the entry regardless of which connection owns it.
    pub fn remove(&self, username: &str) -> Option<PresenceEntry> {
        self.entries.write().remove(username)
    }

    /// Removes the entry only while it still belongs to `conn_id`, so a
    /// stale dispatcher cannot evict the connection that replaced it.
    pub fn remove_if(&self, username: &str, conn_id: Uuid) -> Option<PresenceEntry> {
        let mut entries = self.entries.write();
        if entries.get(username).is_some_and(|e| e.link.id() == conn_id) {
            entries.remove(username)
        } else {
            None
        }
    }

    /// Roster snapshot for `viewer`, never containing the viewer itself.
    pub fn roster_excluding(&self, viewer: &str) -> Vec<UserSummary> {
        let entries = self.entries.read();
        let mut users: Vec<UserSummary> = entries
            .values()
            .filter(|e| e.username != viewer)
            .map(|e| UserSummary {
                username: e.username.clone(),
                p2p_port: e.p2p_port,
                external_ip: e.external_ip.clone(),
                last_seen: e.last_seen_wall.to_rfc3339(),
            })
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        users
    }

    /// Usernames idle longer than `max_idle`, for the sweeper.
    pub fn idle_users(&self, max_idle: Duration) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .read()
            .values()
            .filter(|e| now.duration_since(e.last_seen) > max_idle)
            .map(|e| e.username.clone())
            .collect()
    }

    pub fn last_seen(&self, username: &str) -> Option<Instant> {
        self.entries.read().get(username).map(|e| e.last_seen)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
