//! Session registry.
//!
//! All state is ephemeral and held in memory. On server restart every
//! connection, pairing code and pairing is gone.
//!
//! Entries live in a [`DashMap`] so relay lookups never contend with each
//! other. Every mutation that takes part in matching runs under a single
//! registry-wide lock, which makes "find a peer for this code, then pair"
//! one critical section: two concurrent submissions can never claim the same
//! waiting entry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::RegistryError;
use crate::protocol::{ConnectionId, Otp};

/// Pairing state of one live connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionEntry {
    /// Most recently requested or submitted pairing code.
    pub otp: Option<Otp>,
    /// Set once `otp` has been used by a successful match.
    pub otp_consumed: bool,
    /// The paired connection, if any.
    pub peer_id: Option<ConnectionId>,
    /// Submission stamp of `otp`; lower is older.
    submitted_seq: u64,
}

impl SessionEntry {
    /// Whether this entry has a peer or its code was consumed by a pairing.
    pub fn is_matched(&self) -> bool {
        self.peer_id.is_some() || self.otp_consumed
    }

    fn is_waiting_for(&self, otp: &Otp) -> bool {
        !self.otp_consumed && self.peer_id.is_none() && self.otp.as_ref() == Some(otp)
    }
}

/// Concurrency-safe map from connection id to session state.
#[derive(Debug, Default)]
pub struct Registry {
    entries: DashMap<ConnectionId, SessionEntry>,
    pairing: Mutex<()>,
    next_seq: AtomicU64,
}

impl Registry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        // The guarded data is `()`, so a poisoned lock carries no broken state.
        self.pairing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert an empty entry for a new connection.
    pub fn create(&self, id: ConnectionId) -> Result<(), RegistryError> {
        let _guard = self.lock();
        match self.entries.entry(id) {
            Entry::Occupied(entry) => Err(RegistryError::AlreadyPresent(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(SessionEntry::default());
                Ok(())
            }
        }
    }

    /// Snapshot of an entry.
    pub fn get(&self, id: &ConnectionId) -> Option<SessionEntry> {
        self.entries.get(id).map(|entry| entry.clone())
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.entries.contains_key(id)
    }

    /// The connection currently paired with `id`.
    pub fn peer_of(&self, id: &ConnectionId) -> Option<ConnectionId> {
        self.entries.get(id).and_then(|entry| entry.peer_id.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Overwrite the pairing code of `id`. An existing peer is left alone.
    pub fn set_otp(&self, id: &ConnectionId, otp: Otp) -> Result<(), RegistryError> {
        let _guard = self.lock();
        self.set_otp_locked(id, otp)
    }

    fn set_otp_locked(&self, id: &ConnectionId, otp: Otp) -> Result<(), RegistryError> {
        let mut entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        entry.otp = Some(otp);
        entry.otp_consumed = false;
        entry.submitted_seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Find a waiting entry, other than `exclude`, holding `otp`.
    ///
    /// When several entries qualify the earliest submission wins.
    pub fn find_unmatched_by_otp(&self, otp: &Otp, exclude: &ConnectionId) -> Option<ConnectionId> {
        self.entries
            .iter()
            .filter(|entry| entry.key() != exclude && entry.value().is_waiting_for(otp))
            .min_by_key(|entry| entry.value().submitted_seq)
            .map(|entry| entry.key().clone())
    }

    /// Pair two connections symmetrically and consume both codes.
    pub fn pair(&self, a: &ConnectionId, b: &ConnectionId) -> Result<(), RegistryError> {
        let _guard = self.lock();
        self.pair_locked(a, b)
    }

    fn pair_locked(&self, a: &ConnectionId, b: &ConnectionId) -> Result<(), RegistryError> {
        if a == b {
            return Err(RegistryError::SelfPairing(a.clone()));
        }
        for id in [a, b] {
            let entry = self
                .entries
                .get(id)
                .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
            if entry.peer_id.is_some() {
                return Err(RegistryError::AlreadyPaired(id.clone()));
            }
        }
        for (id, peer) in [(a, b), (b, a)] {
            if let Some(mut entry) = self.entries.get_mut(id) {
                entry.peer_id = Some(peer.clone());
                entry.otp_consumed = true;
            }
        }
        Ok(())
    }

    /// Store `otp` for `id` and pair it with the oldest waiting entry holding
    /// the same code, as one critical section.
    ///
    /// Returns the new peer, or `None` if nobody is waiting on this code yet.
    pub fn pair_with_code(
        &self,
        id: &ConnectionId,
        otp: Otp,
    ) -> Result<Option<ConnectionId>, RegistryError> {
        let _guard = self.lock();

        if self.peer_of(id).is_some() {
            return Err(RegistryError::AlreadyPaired(id.clone()));
        }
        self.set_otp_locked(id, otp.clone())?;

        let Some(peer) = self.find_unmatched_by_otp(&otp, id) else {
            return Ok(None);
        };
        self.pair_locked(id, &peer)?;
        Ok(Some(peer))
    }

    /// Remove an entry and return its last state.
    ///
    /// The former peer's `peer_id` is cleared so later relays from it go
    /// nowhere.
    pub fn remove(&self, id: &ConnectionId) -> Result<SessionEntry, RegistryError> {
        let _guard = self.lock();

        let (_, entry) = self
            .entries
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;

        if let Some(peer) = &entry.peer_id {
            if let Some(mut peer_entry) = self.entries.get_mut(peer) {
                if peer_entry.peer_id.as_ref() == Some(id) {
                    peer_entry.peer_id = None;
                }
            }
        }

        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(ids: &[&str]) -> Registry {
        let registry = Registry::new();
        for id in ids {
            registry.create(ConnectionId::from(*id)).unwrap();
        }
        registry
    }

    fn id(s: &str) -> ConnectionId {
        ConnectionId::from(s)
    }

    #[test]
    fn test_entry_lifecycle() {
        let registry = registry_with(&["a"]);

        assert!(registry.contains(&id("a")));
        assert_eq!(registry.get(&id("a")), Some(SessionEntry::default()));

        // Duplicate create is rejected and leaves the entry alone
        registry.set_otp(&id("a"), Otp::new("111111")).unwrap();
        assert_eq!(
            registry.create(id("a")),
            Err(RegistryError::AlreadyPresent(id("a")))
        );
        assert_eq!(registry.get(&id("a")).unwrap().otp, Some(Otp::new("111111")));

        let removed = registry.remove(&id("a")).unwrap();
        assert_eq!(removed.otp, Some(Otp::new("111111")));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unknown_ids_are_not_found() {
        let registry = Registry::new();

        assert_eq!(registry.get(&id("ghost")), None);
        assert_eq!(registry.peer_of(&id("ghost")), None);
        assert_eq!(
            registry.set_otp(&id("ghost"), Otp::new("1")),
            Err(RegistryError::NotFound(id("ghost")))
        );
        assert_eq!(
            registry.remove(&id("ghost")),
            Err(RegistryError::NotFound(id("ghost")))
        );
        assert_eq!(
            registry.pair_with_code(&id("ghost"), Otp::new("1")),
            Err(RegistryError::NotFound(id("ghost")))
        );
    }

    #[test]
    fn test_pair_with_code_is_symmetric() {
        let registry = registry_with(&["a", "b"]);

        // First submitter waits
        assert_eq!(registry.pair_with_code(&id("a"), Otp::new("424242")), Ok(None));
        assert!(!registry.get(&id("a")).unwrap().is_matched());

        // Second submitter finds the first
        assert_eq!(
            registry.pair_with_code(&id("b"), Otp::new("424242")),
            Ok(Some(id("a")))
        );

        let a = registry.get(&id("a")).unwrap();
        let b = registry.get(&id("b")).unwrap();
        assert_eq!(a.peer_id, Some(id("b")));
        assert_eq!(b.peer_id, Some(id("a")));
        assert!(a.is_matched() && b.is_matched());
    }

    #[test]
    fn test_different_codes_never_pair() {
        let registry = registry_with(&["a", "b"]);

        assert_eq!(registry.pair_with_code(&id("a"), Otp::new("111111")), Ok(None));
        assert_eq!(registry.pair_with_code(&id("b"), Otp::new("222222")), Ok(None));
        assert_eq!(registry.peer_of(&id("a")), None);
        assert_eq!(registry.peer_of(&id("b")), None);
    }

    #[test]
    fn test_earliest_submission_wins() {
        let registry = registry_with(&["a", "b", "c", "d"]);

        registry.set_otp(&id("a"), Otp::new("7")).unwrap();
        registry.set_otp(&id("c"), Otp::new("7")).unwrap();

        assert_eq!(registry.pair_with_code(&id("b"), Otp::new("7")), Ok(Some(id("a"))));
        assert_eq!(registry.pair_with_code(&id("d"), Otp::new("7")), Ok(Some(id("c"))));
    }

    #[test]
    fn test_resubmission_moves_to_back_of_queue() {
        let registry = registry_with(&["a", "b", "c"]);

        registry.set_otp(&id("a"), Otp::new("7")).unwrap();
        registry.set_otp(&id("c"), Otp::new("7")).unwrap();
        registry.set_otp(&id("a"), Otp::new("7")).unwrap();

        assert_eq!(registry.pair_with_code(&id("b"), Otp::new("7")), Ok(Some(id("c"))));
    }

    #[test]
    fn test_only_latest_code_is_eligible() {
        let registry = registry_with(&["a", "b"]);

        registry.set_otp(&id("a"), Otp::new("111111")).unwrap();
        registry.set_otp(&id("a"), Otp::new("222222")).unwrap();

        assert_eq!(registry.pair_with_code(&id("b"), Otp::new("111111")), Ok(None));
        assert_eq!(
            registry.pair_with_code(&id("b"), Otp::new("222222")),
            Ok(Some(id("a")))
        );
    }

    #[test]
    fn test_consumed_code_is_not_matched_again() {
        let registry = registry_with(&["a", "b", "c"]);

        registry.set_otp(&id("a"), Otp::new("5")).unwrap();
        registry.pair_with_code(&id("b"), Otp::new("5")).unwrap();

        assert_eq!(registry.find_unmatched_by_otp(&Otp::new("5"), &id("c")), None);
        assert_eq!(registry.pair_with_code(&id("c"), Otp::new("5")), Ok(None));
    }

    #[test]
    fn test_paired_connection_cannot_pair_again() {
        let registry = registry_with(&["a", "b", "c"]);

        registry.set_otp(&id("a"), Otp::new("5")).unwrap();
        registry.pair_with_code(&id("b"), Otp::new("5")).unwrap();
        registry.set_otp(&id("c"), Otp::new("9")).unwrap();

        assert_eq!(
            registry.pair_with_code(&id("a"), Otp::new("9")),
            Err(RegistryError::AlreadyPaired(id("a")))
        );
        assert_eq!(registry.peer_of(&id("a")), Some(id("b")));
        assert_eq!(registry.pair(&id("b"), &id("c")), Err(RegistryError::AlreadyPaired(id("b"))));
        assert_eq!(registry.pair(&id("c"), &id("c")), Err(RegistryError::SelfPairing(id("c"))));
    }

    #[test]
    fn test_new_code_keeps_paired_entry_matched() {
        let registry = registry_with(&["a", "b", "c"]);

        registry.set_otp(&id("a"), Otp::new("5")).unwrap();
        registry.pair_with_code(&id("b"), Otp::new("5")).unwrap();
        registry.set_otp(&id("a"), Otp::new("8")).unwrap();

        let a = registry.get(&id("a")).unwrap();
        assert!(a.is_matched());
        assert_eq!(a.peer_id, Some(id("b")));

        // Still taken, so the fresh code cannot pull it into a second pair
        assert_eq!(registry.pair_with_code(&id("c"), Otp::new("8")), Ok(None));
        assert_eq!(registry.peer_of(&id("a")), Some(id("b")));
    }

    #[test]
    fn test_remove_clears_peer_reference() {
        let registry = registry_with(&["a", "b"]);

        registry.pair(&id("a"), &id("b")).unwrap();
        let removed = registry.remove(&id("a")).unwrap();

        assert_eq!(removed.peer_id, Some(id("b")));
        assert_eq!(registry.peer_of(&id("b")), None);
        assert!(!registry.contains(&id("a")));
    }

    #[test]
    fn test_survivor_can_pair_again_with_new_code() {
        let registry = registry_with(&["a", "b", "c"]);

        registry.set_otp(&id("a"), Otp::new("5")).unwrap();
        registry.pair_with_code(&id("b"), Otp::new("5")).unwrap();
        registry.remove(&id("a")).unwrap();

        registry.set_otp(&id("b"), Otp::new("6")).unwrap();
        assert_eq!(registry.pair_with_code(&id("c"), Otp::new("6")), Ok(Some(id("b"))));
    }

    #[test]
    fn test_concurrent_submissions_pair_one_to_one() {
        const CONNECTIONS: usize = 64;
        const CODES: [&str; 3] = ["1", "2", "3"];

        let registry = Registry::new();
        let ids: Vec<ConnectionId> = (0..CONNECTIONS)
            .map(|i| ConnectionId::new(format!("conn-{i}")))
            .collect();
        for conn in &ids {
            registry.create(conn.clone()).unwrap();
        }

        std::thread::scope(|scope| {
            for (i, conn) in ids.iter().enumerate() {
                let registry = &registry;
                scope.spawn(move || {
                    let code = Otp::new(CODES[i % CODES.len()]);
                    registry.pair_with_code(conn, code).unwrap();
                });
            }
        });

        let mut paired = 0;
        for conn in &ids {
            let entry = registry.get(conn).unwrap();
            if let Some(peer) = &entry.peer_id {
                let peer_entry = registry.get(peer).unwrap();
                assert_eq!(peer_entry.peer_id.as_ref(), Some(conn));
                assert_eq!(peer_entry.otp, entry.otp);
                paired += 1;
            }
        }

        // Every code group pairs up fully except at most one leftover
        let expected: usize = CODES
            .iter()
            .enumerate()
            .map(|(slot, _)| {
                let members = (0..CONNECTIONS).filter(|i| i % CODES.len() == slot).count();
                members - members % 2
            })
            .sum();
        assert_eq!(paired, expected);
    }
}
