// SPDX-License-Identifier: Apache-2.0
//! User identity, access grants, and the token-based auth checks used by
//! the cmd/state protocol.
//!
//! Token values (the shared `server` token and each user's `public`/
//! `private` pair) are generated by the caller and passed in — this crate
//! is a deterministic simulation library with no source of real entropy,
//! so it never rolls its own tokens.

use crate::save::{Reader, SaveError, Writer, MAGIC_USERS};
use rustc_hash::FxHashMap;

/// A user's identity slot. Up to [`MAX_USERS`] are live at once, one bit
/// each in an access bitmask.
pub type UserId = u8;

/// Maximum concurrently registered users (one bit per user in a `u64`
/// access mask).
pub const MAX_USERS: u8 = 64;

/// One registered user: its interned atom, access grants, and tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct User {
    /// This user's slot id.
    pub id: UserId,
    /// Interned symbol naming this user.
    pub atom: u64,
    /// Bitmask of user ids whose chunks this user may view (`1 << id` is
    /// always set for the user's own id).
    pub access: u64,
    /// Public token: safe to hand to other users via [`Users::grant`].
    pub public: u64,
    /// Private token: proves this user's identity via [`Users::auth_user`].
    pub private: u64,
}

/// The world's user registry: a shared server token plus every
/// registered user, indexed by id, atom, and public token.
#[derive(Debug, Default)]
pub struct Users {
    server: u64,
    by_id: FxHashMap<UserId, User>,
    by_atom: FxHashMap<u64, UserId>,
    by_public: FxHashMap<u64, UserId>,
}

impl Users {
    /// Construct a registry presenting `server_token` to every client.
    #[must_use]
    pub fn new(server_token: u64) -> Self {
        Self {
            server: server_token,
            ..Self::default()
        }
    }

    /// The shared server token clients must present in `Cmd::User`/`Auth`.
    #[must_use]
    pub const fn server_token(&self) -> u64 {
        self.server
    }

    /// Register a new user under `atom`, with caller-supplied tokens.
    /// Rejects (returns `None`) if `atom` is already registered or every
    /// slot up to [`MAX_USERS`] is taken.
    pub fn create(&mut self, atom: u64, public: u64, private: u64) -> Option<UserId> {
        if self.by_atom.contains_key(&atom) {
            return None;
        }
        let id = (0..MAX_USERS).find(|id| !self.by_id.contains_key(id))?;
        let user = User {
            id,
            atom,
            access: 1u64 << id,
            public,
            private,
        };
        self.by_id.insert(id, user);
        self.by_atom.insert(atom, id);
        self.by_public.insert(public, id);
        Some(id)
    }

    /// Look up a user by atom.
    #[must_use]
    pub fn by_atom(&self, atom: u64) -> Option<&User> {
        self.by_atom.get(&atom).and_then(|id| self.by_id.get(id))
    }

    /// Look up a user by id.
    #[must_use]
    pub fn by_id(&self, id: UserId) -> Option<&User> {
        self.by_id.get(&id)
    }

    /// Constant-time-shaped check of the shared server token (a plain
    /// equality on a bare `u64` gives nothing away beyond the comparison
    /// itself, so no bit-masked compare is needed here).
    #[must_use]
    pub fn auth_server(&self, token: u64) -> bool {
        token == self.server
    }

    /// Check a user's private token.
    #[must_use]
    pub fn auth_user(&self, id: UserId, token: u64) -> bool {
        self.by_id.get(&id).is_some_and(|user| user.private == token)
    }

    /// Grant `id` access to whatever the user named by `token` (their
    /// public token) already has access to. Returns `false` if `id` or the
    /// token don't resolve to registered users.
    pub fn grant(&mut self, id: UserId, token: u64) -> bool {
        let Some(&grantor_id) = self.by_public.get(&token) else {
            return false;
        };
        let Some(grantor_access) = self.by_id.get(&grantor_id).map(|u| u.access) else {
            return false;
        };
        let Some(user) = self.by_id.get_mut(&id) else {
            return false;
        };
        user.access |= grantor_access;
        true
    }

    /// Write the server token and every registered user, bracketed by
    /// [`MAGIC_USERS`].
    pub fn encode(&self, w: &mut Writer) {
        w.write_magic(MAGIC_USERS);
        w.write_u64(self.server);
        w.write_u32(self.by_id.len() as u32);
        let mut ids: Vec<_> = self.by_id.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let user = &self.by_id[&id];
            w.write_u8(user.id);
            w.write_u64(user.atom);
            w.write_u64(user.access);
            w.write_u64(user.public);
            w.write_u64(user.private);
        }
        w.write_magic(MAGIC_USERS);
    }

    /// Read a registry previously written by [`Self::encode`].
    ///
    /// # Errors
    ///
    /// Returns an error on truncated data or a mismatched framing tag.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self, SaveError> {
        r.read_magic(MAGIC_USERS)?;
        let server = r.read_u64()?;
        let count = r.read_u32()?;
        let mut by_id = FxHashMap::default();
        let mut by_atom = FxHashMap::default();
        let mut by_public = FxHashMap::default();
        for _ in 0..count {
            let id = r.read_u8()?;
            let atom = r.read_u64()?;
            let access = r.read_u64()?;
            let public = r.read_u64()?;
            let private = r.read_u64()?;
            let user = User {
                id,
                atom,
                access,
                public,
                private,
            };
            by_id.insert(id, user);
            by_atom.insert(atom, id);
            by_public.insert(public, id);
        }
        r.read_magic(MAGIC_USERS)?;
        Ok(Self {
            server,
            by_id,
            by_atom,
            by_public,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn create_is_rejected_for_a_repeat_atom() {
        let mut users = Users::new(1);
        assert!(users.create(10, 100, 200).is_some());
        assert!(users.create(10, 101, 201).is_none());
    }

    #[test]
    fn auth_checks_match_the_right_secrets() {
        let mut users = Users::new(42);
        let id = users.create(10, 100, 200).unwrap();
        assert!(users.auth_server(42));
        assert!(!users.auth_server(0));
        assert!(users.auth_user(id, 200));
        assert!(!users.auth_user(id, 0));
    }

    #[test]
    fn grant_merges_the_grantors_access_mask() {
        let mut users = Users::new(1);
        let a = users.create(10, 100, 200).unwrap();
        let b = users.create(11, 101, 201).unwrap();
        let a_access = users.by_id(a).unwrap().access;
        assert!(users.grant(b, 100));
        assert_eq!(users.by_id(b).unwrap().access, a_access | (1 << b));
    }

    #[test]
    fn grant_fails_for_an_unknown_token() {
        let mut users = Users::new(1);
        let b = users.create(11, 101, 201).unwrap();
        assert!(!users.grant(b, 999));
    }

    #[test]
    fn encode_decode_roundtrips_users_and_tokens() {
        let mut users = Users::new(7);
        users.create(10, 100, 200);
        users.create(11, 101, 201);

        let mut w = Writer::new();
        users.encode(&mut w);
        let buf = w.into_inner();
        let mut r = Reader::new(&buf);
        let decoded = Users::decode(&mut r).unwrap();

        assert_eq!(decoded.server_token(), 7);
        assert_eq!(decoded.by_atom(10).unwrap().private, 200);
        assert_eq!(decoded.by_atom(11).unwrap().public, 101);
    }
}
