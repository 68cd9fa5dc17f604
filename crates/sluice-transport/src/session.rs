//! Session metadata and the registry that keeps it consistent with the
//! connection pairs.
//!
//! Both maps live behind one lock, so every operation that touches them is
//! atomic from the caller's point of view: an ID is present in the session
//! map if and only if its pair is present in the connection map.
//!
//! The same lock guards slot reservations for sessions that are still
//! initializing, so a session cap holds under concurrent initializations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sluice_core::SessionId;
use tokio::time::Instant;

use crate::connection::ConnectionPair;

/// Metadata for one registered session.
#[derive(Clone, Debug)]
pub struct Session {
    /// Session identifier.
    pub id: SessionId,
    /// Wall-clock registration time, for reporting.
    pub established_at: DateTime<Utc>,
    /// Monotonic registration time.
    pub created_at: Instant,
    /// Monotonic time of the last request start or finish.
    pub last_accessed_at: Instant,
    /// Requests currently being driven through the session.
    pub active_requests: u32,
}

impl Session {
    fn new(id: SessionId, now: Instant) -> Self {
        Self {
            id,
            established_at: Utc::now(),
            created_at: now,
            last_accessed_at: now,
            active_requests: 0,
        }
    }

    /// Idle longer than `timeout` as of `now`.
    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_accessed_at) > timeout
    }

    /// Stale and not serving any request.
    pub fn is_collectable(&self, now: Instant, timeout: Duration) -> bool {
        self.active_requests == 0 && self.is_stale(now, timeout)
    }

    /// Time since the last access.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_accessed_at)
    }
}

#[derive(Default)]
struct Maps {
    connections: HashMap<SessionId, Arc<ConnectionPair>>,
    sessions: HashMap<SessionId, Session>,
    reserved: usize,
}

impl Maps {
    fn insert(&mut self, id: SessionId, pair: Arc<ConnectionPair>) -> bool {
        if self.sessions.contains_key(&id) {
            return false;
        }
        let _ = self
            .sessions
            .insert(id.clone(), Session::new(id.clone(), Instant::now()));
        let _ = self.connections.insert(id, pair);
        true
    }
}

/// Outcome of a stale scan.
#[derive(Default)]
pub(crate) struct StaleScan {
    pub(crate) collected: Vec<(SessionId, Arc<ConnectionPair>)>,
    /// Stale by time but serving requests: ID, in-flight count, idle time.
    pub(crate) skipped_active: Vec<(SessionId, u32, Duration)>,
}

#[derive(Default)]
pub(crate) struct SessionRegistry {
    maps: Mutex<Maps>,
}

impl SessionRegistry {
    /// Register a session. Returns `false` (and leaves the registry untouched)
    /// if the ID is already taken.
    pub(crate) fn insert(&self, id: SessionId, pair: Arc<ConnectionPair>) -> bool {
        self.maps.lock().insert(id, pair)
    }

    /// Claim a slot for a session that is still initializing. Registered
    /// sessions plus outstanding claims never exceed `limit` (`0` = unlimited).
    pub(crate) fn reserve(&self, limit: usize) -> bool {
        let mut maps = self.maps.lock();
        if limit > 0 && maps.sessions.len() + maps.reserved >= limit {
            return false;
        }
        maps.reserved += 1;
        true
    }

    /// Return a claim that never became a session.
    pub(crate) fn unreserve(&self) {
        let mut maps = self.maps.lock();
        maps.reserved = maps.reserved.saturating_sub(1);
    }

    /// Like [`insert`](Self::insert), but turns one outstanding claim into
    /// the session. The claim is consumed even when the ID is taken.
    pub(crate) fn insert_reserved(&self, id: SessionId, pair: Arc<ConnectionPair>) -> bool {
        let mut maps = self.maps.lock();
        maps.reserved = maps.reserved.saturating_sub(1);
        maps.insert(id, pair)
    }

    #[cfg(test)]
    pub(crate) fn reserved(&self) -> usize {
        self.maps.lock().reserved
    }

    /// Remove a session from both maps, handing back its pair.
    pub(crate) fn remove(&self, id: &SessionId) -> Option<Arc<ConnectionPair>> {
        let mut maps = self.maps.lock();
        let _ = maps.sessions.remove(id);
        maps.connections.remove(id)
    }

    pub(crate) fn get(&self, id: &SessionId) -> Option<Session> {
        self.maps.lock().sessions.get(id).cloned()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: &SessionId) -> bool {
        self.maps.lock().sessions.contains_key(id)
    }

    /// Mark a request as started. Returns the pair to drive, or `None` if the
    /// session is unknown.
    pub(crate) fn begin_request(&self, id: &SessionId) -> Option<ActiveRequest<'_>> {
        let mut maps = self.maps.lock();
        let pair = maps.connections.get(id)?.clone();
        let session = maps.sessions.get_mut(id)?;
        session.active_requests = session.active_requests.saturating_add(1);
        session.last_accessed_at = Instant::now();
        Some(ActiveRequest {
            registry: self,
            id: id.clone(),
            pair,
        })
    }

    fn end_request(&self, id: &SessionId) {
        let mut maps = self.maps.lock();
        if let Some(session) = maps.sessions.get_mut(id) {
            session.active_requests = session.active_requests.saturating_sub(1);
            session.last_accessed_at = Instant::now();
        }
    }

    /// Remove every collectable session in one step and report the ones that
    /// are stale by time but still serving requests.
    pub(crate) fn take_stale(&self, now: Instant, timeout: Duration) -> StaleScan {
        let mut maps = self.maps.lock();
        let mut scan = StaleScan::default();
        let mut eligible = Vec::new();
        for session in maps.sessions.values() {
            if session.is_collectable(now, timeout) {
                eligible.push(session.id.clone());
            } else if session.is_stale(now, timeout) {
                scan.skipped_active.push((
                    session.id.clone(),
                    session.active_requests,
                    session.idle_for(now),
                ));
            }
        }
        for id in eligible {
            let _ = maps.sessions.remove(&id);
            if let Some(pair) = maps.connections.remove(&id) {
                scan.collected.push((id, pair));
            }
        }
        scan
    }

    /// Empty both maps, handing back every pair.
    pub(crate) fn drain(&self) -> Vec<(SessionId, Arc<ConnectionPair>)> {
        let mut maps = self.maps.lock();
        maps.sessions.clear();
        maps.connections.drain().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.maps.lock().sessions.len()
    }

    pub(crate) fn ids(&self) -> Vec<SessionId> {
        self.maps.lock().sessions.keys().cloned().collect()
    }

    /// Both maps hold exactly the same keys.
    pub(crate) fn is_consistent(&self) -> bool {
        let maps = self.maps.lock();
        maps.sessions.len() == maps.connections.len()
            && maps.sessions.keys().all(|k| maps.connections.contains_key(k))
    }
}

/// Guard for one in-flight request. Dropping it decrements the session's
/// `active_requests` and refreshes `last_accessed_at`, whether the request
/// succeeded, failed, or its future was cancelled.
pub(crate) struct ActiveRequest<'a> {
    registry: &'a SessionRegistry,
    id: SessionId,
    pair: Arc<ConnectionPair>,
}

impl ActiveRequest<'_> {
    pub(crate) fn pair(&self) -> &ConnectionPair {
        &self.pair
    }
}

impl Drop for ActiveRequest<'_> {
    fn drop(&mut self) {
        self.registry.end_request(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionFactory, TransportOptions};
    use crate::testing::{FakeFactory, FakeScript};

    async fn pair() -> Arc<ConnectionPair> {
        let factory = FakeFactory::new(FakeScript::default());
        Arc::new(factory.create(TransportOptions::stateless()).await.unwrap())
    }

    const TIMEOUT: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn insert_rejects_duplicates() {
        let registry = SessionRegistry::default();
        let id = SessionId::from("s1");
        assert!(registry.insert(id.clone(), pair().await));
        assert!(!registry.insert(id.clone(), pair().await));
        assert_eq!(registry.len(), 1);
        assert!(registry.is_consistent());
    }

    #[tokio::test(start_paused = true)]
    async fn guard_tracks_active_requests() {
        let registry = SessionRegistry::default();
        let id = SessionId::from("s1");
        let _ = registry.insert(id.clone(), pair().await);

        let first = registry.begin_request(&id).unwrap();
        let second = registry.begin_request(&id).unwrap();
        assert_eq!(registry.get(&id).unwrap().active_requests, 2);

        drop(first);
        assert_eq!(registry.get(&id).unwrap().active_requests, 1);
        drop(second);
        assert_eq!(registry.get(&id).unwrap().active_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn guard_after_removal_is_harmless() {
        let registry = SessionRegistry::default();
        let id = SessionId::from("s1");
        let _ = registry.insert(id.clone(), pair().await);
        let guard = registry.begin_request(&id).unwrap();
        assert!(registry.remove(&id).is_some());
        drop(guard);
        assert!(registry.get(&id).is_none());
        assert!(registry.is_consistent());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_session_has_no_guard() {
        let registry = SessionRegistry::default();
        assert!(registry.begin_request(&SessionId::from("nope")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn take_stale_skips_active_sessions() {
        let registry = SessionRegistry::default();
        let idle = SessionId::from("idle");
        let busy = SessionId::from("busy");
        let fresh = SessionId::from("fresh");
        let _ = registry.insert(idle.clone(), pair().await);
        let _ = registry.insert(busy.clone(), pair().await);
        let guard = registry.begin_request(&busy).unwrap();

        tokio::time::advance(Duration::from_secs(120)).await;
        let _ = registry.insert(fresh.clone(), pair().await);

        let scan = registry.take_stale(Instant::now(), TIMEOUT);
        let collected: Vec<_> = scan.collected.iter().map(|(id, _)| id.clone()).collect();
        assert_eq!(collected, vec![idle.clone()]);
        assert_eq!(
            scan.skipped_active,
            vec![(busy.clone(), 1, Duration::from_secs(120))]
        );
        assert!(registry.contains(&busy));
        assert!(registry.contains(&fresh));
        assert!(!registry.contains(&idle));
        assert!(registry.is_consistent());
        drop(guard);
    }

    #[tokio::test(start_paused = true)]
    async fn finishing_a_request_refreshes_last_access() {
        let registry = SessionRegistry::default();
        let id = SessionId::from("s1");
        let _ = registry.insert(id.clone(), pair().await);
        let guard = registry.begin_request(&id).unwrap();

        tokio::time::advance(Duration::from_secs(120)).await;
        drop(guard);

        let session = registry.get(&id).unwrap();
        assert!(!session.is_stale(Instant::now(), TIMEOUT));
        assert!(registry.take_stale(Instant::now(), TIMEOUT).collected.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reservations_count_against_the_limit() {
        let registry = SessionRegistry::default();
        assert!(registry.reserve(2));
        assert!(registry.reserve(2));
        assert!(!registry.reserve(2));

        assert!(registry.insert_reserved(SessionId::from("a"), pair().await));
        assert_eq!(registry.reserved(), 1);
        assert!(!registry.reserve(2));

        registry.unreserve();
        assert_eq!(registry.reserved(), 0);
        assert!(registry.reserve(2));
        assert!(!registry.reserve(2));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_reserved_insert_still_consumes_the_claim() {
        let registry = SessionRegistry::default();
        let id = SessionId::from("s1");
        let _ = registry.insert(id.clone(), pair().await);
        assert!(registry.reserve(0));
        assert!(!registry.insert_reserved(id, pair().await));
        assert_eq!(registry.reserved(), 0);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_limit_is_unlimited() {
        let registry = SessionRegistry::default();
        for _ in 0..8 {
            assert!(registry.reserve(0));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn drain_empties_both_maps() {
        let registry = SessionRegistry::default();
        let _ = registry.insert(SessionId::from("a"), pair().await);
        let _ = registry.insert(SessionId::from("b"), pair().await);
        assert_eq!(registry.drain().len(), 2);
        assert_eq!(registry.len(), 0);
        assert!(registry.ids().is_empty());
        assert!(registry.is_consistent());
    }
}
