//! Bounded pool of PKCS#11 sessions for one token.

use std::{
    ops::Deref,
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use cryptoki::{context::Pkcs11, session::Session, slot::Slot};

use crate::error::{TokenError, TokenResult};

const DFLT_MAX_SESSIONS: usize = 20;
const DFLT_TIMEOUT_MS: u64 = 10_000;

struct PoolState {
    idle: Vec<Session>,
    open_count: usize,
}

/// Sessions are opened lazily up to `max_sessions`; borrows beyond that block
/// until one is returned or the timeout elapses.
pub(super) struct SessionPool {
    pkcs11: Arc<Pkcs11>,
    slot: Slot,
    read_write: bool,
    max_sessions: usize,
    timeout: Duration,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl SessionPool {
    /// `login_session` is the session the token was logged in through; it
    /// seeds the pool so the login state stays alive for the slot's lifetime.
    pub(super) fn new(
        pkcs11: Arc<Pkcs11>,
        slot: Slot,
        read_write: bool,
        num_sessions: Option<usize>,
        new_session_timeout_ms: Option<u64>,
        login_session: Session,
    ) -> Self {
        Self {
            pkcs11,
            slot,
            read_write,
            max_sessions: num_sessions.unwrap_or(DFLT_MAX_SESSIONS).max(1),
            timeout: Duration::from_millis(new_session_timeout_ms.unwrap_or(DFLT_TIMEOUT_MS)),
            state: Mutex::new(PoolState {
                idle: vec![login_session],
                open_count: 1,
            }),
            available: Condvar::new(),
        }
    }

    fn open_session(&self) -> TokenResult<Session> {
        let session = if self.read_write {
            self.pkcs11.open_rw_session(self.slot)
        } else {
            self.pkcs11.open_ro_session(self.slot)
        };
        session.map_err(|e| TokenError::Default(format!("could not open session: {e}")))
    }

    pub(super) fn borrow(&self) -> TokenResult<PooledSession<'_>> {
        let deadline = Instant::now() + self.timeout;
        let mut state = self.state.lock().expect("session pool poisoned");
        loop {
            if let Some(session) = state.idle.pop() {
                return Ok(PooledSession {
                    pool: self,
                    session: Some(session),
                });
            }
            if state.open_count < self.max_sessions {
                state.open_count += 1;
                drop(state);
                return match self.open_session() {
                    Ok(session) => Ok(PooledSession {
                        pool: self,
                        session: Some(session),
                    }),
                    Err(e) => {
                        let mut state = self.state.lock().expect("session pool poisoned");
                        state.open_count -= 1;
                        self.available.notify_one();
                        Err(e)
                    }
                };
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TokenError::Default(
                    "no idle session within the timeout".to_string(),
                ));
            }
            let (guard, result) = self
                .available
                .wait_timeout(state, remaining)
                .expect("session pool poisoned");
            state = guard;
            if result.timed_out() && state.idle.is_empty() {
                return Err(TokenError::Default(
                    "no idle session within the timeout".to_string(),
                ));
            }
        }
    }

    fn requite(&self, session: Session) {
        let mut state = self.state.lock().expect("session pool poisoned");
        state.idle.push(session);
        drop(state);
        self.available.notify_one();
    }
}

pub(super) struct PooledSession<'a> {
    pool: &'a SessionPool,
    session: Option<Session>,
}

impl Deref for PooledSession<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session.as_ref().expect("session already returned")
    }
}

impl Drop for PooledSession<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.requite(session);
        }
    }
}
