use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use super::ServerSession;
use crate::bson::Document;

/// Server sessions released by ended `ClientSession`s. The most recently released session is
/// handed out first.
#[derive(Debug)]
pub(crate) struct ServerSessionPool {
    pool: Mutex<VecDeque<ServerSession>>,
}

impl ServerSessionPool {
    pub(crate) fn new() -> Self {
        Self {
            pool: Default::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ServerSession>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Checks out a server session from the pool. Sessions that are about to expire are dropped
    /// along the way. If none are left, a new session is created.
    pub(crate) fn check_out(&self, logical_session_timeout: Duration) -> ServerSession {
        let mut pool = self.lock();
        while let Some(session) = pool.pop_front() {
            // If a session is about to expire within the next minute, remove it from pool.
            if session.is_about_to_expire(logical_session_timeout) {
                continue;
            }
            return session;
        }
        ServerSession::new()
    }

    /// Checks in a server session to the pool. If it is about to expire or is dirty, it will be
    /// discarded.
    ///
    /// Expired sessions at the back of the pool are cleared out first.
    pub(crate) fn check_in(&self, session: ServerSession, logical_session_timeout: Duration) {
        let mut pool = self.lock();
        while let Some(pooled_session) = pool.pop_back() {
            if pooled_session.is_about_to_expire(logical_session_timeout) {
                continue;
            }
            pool.push_back(pooled_session);
            break;
        }

        if !session.dirty && !session.is_about_to_expire(logical_session_timeout) {
            pool.push_front(session);
        }
    }

    /// Empties the pool, returning the ids of the sessions it held.
    pub(crate) fn drain_ids(&self) -> Vec<Document> {
        self.lock().drain(..).map(|session| session.id).collect()
    }

    #[cfg(test)]
    pub(crate) fn ids(&self) -> Vec<Document> {
        self.lock().iter().map(|session| session.id.clone()).collect()
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use pretty_assertions::assert_eq;

    use super::{ServerSession, ServerSessionPool};

    const TIMEOUT: Duration = Duration::from_secs(30 * 60);

    #[test]
    fn most_recently_checked_in_comes_out_first() {
        let pool = ServerSessionPool::new();
        let first = ServerSession::new();
        let second = ServerSession::new();

        pool.check_in(first.clone(), TIMEOUT);
        pool.check_in(second.clone(), TIMEOUT);

        assert_eq!(pool.check_out(TIMEOUT).id, second.id);
        assert_eq!(pool.check_out(TIMEOUT).id, first.id);
    }

    #[test]
    fn dirty_sessions_are_discarded() {
        let pool = ServerSessionPool::new();
        let mut session = ServerSession::new();
        session.dirty = true;

        pool.check_in(session, TIMEOUT);
        assert!(pool.ids().is_empty());
    }

    #[test]
    fn stale_sessions_are_not_reused() {
        let pool = ServerSessionPool::new();
        let mut stale = ServerSession::new();
        stale.last_use = Instant::now() - Duration::from_secs(29 * 60 + 30);
        let stale_id = stale.id.clone();
        pool.pool.lock().unwrap().push_front(stale);

        let session = pool.check_out(TIMEOUT);
        assert_ne!(session.id, stale_id);
        assert!(pool.ids().is_empty());
    }

    #[test]
    fn drain_empties_the_pool() {
        let pool = ServerSessionPool::new();
        pool.check_in(ServerSession::new(), TIMEOUT);
        pool.check_in(ServerSession::new(), TIMEOUT);

        assert_eq!(pool.drain_ids().len(), 2);
        assert!(pool.ids().is_empty());
    }
}
