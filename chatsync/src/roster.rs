//! Online-user roster.
//!
//! The roster holds at most one entry per user id and is kept sorted by
//! display name (falling back to id). Sorting is stable, so users with equal
//! keys stay in the order they were first seen.

use chatsync_proto::presence::PresenceUser;

/// Set of currently online users.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceRoster {
    users: Vec<PresenceUser>,
}

impl PresenceRoster {
    /// Creates an empty roster.
    #[must_use]
    pub const fn new() -> Self {
        Self { users: Vec::new() }
    }

    /// Replaces the roster with `users`.
    ///
    /// Duplicate ids collapse to one entry holding the last occurrence.
    pub fn replace_all(&mut self, users: Vec<PresenceUser>) {
        let mut deduped: Vec<PresenceUser> = Vec::with_capacity(users.len());
        for user in users {
            if let Some(existing) = deduped.iter_mut().find(|u| u.id == user.id) {
                *existing = user;
            } else {
                deduped.push(user);
            }
        }
        self.users = deduped;
        self.sort();
    }

    /// Adds `user` unless the id is already present.
    ///
    /// Returns `true` if the roster changed.
    pub fn add_one(&mut self, user: PresenceUser) -> bool {
        if self.contains(&user.id) {
            return false;
        }
        self.users.push(user);
        self.sort();
        true
    }

    /// Removes the user with `id`. Returns `true` if the roster changed.
    pub fn remove_one(&mut self, id: &str) -> bool {
        let before = self.users.len();
        self.users.retain(|u| u.id != id);
        self.users.len() != before
    }

    /// Whether a user with `id` is online.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.users.iter().any(|u| u.id == id)
    }

    /// Online users in display order.
    #[must_use]
    pub fn users(&self) -> &[PresenceUser] {
        &self.users
    }

    /// Number of online users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Whether nobody is online.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    fn sort(&mut self) {
        self.users.sort_by(|a, b| a.sort_key().cmp(b.sort_key()));
    }
}
