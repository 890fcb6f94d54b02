//! Purpose: Own the single shared engine session and hand out counted references to it.
//! Exports: `SessionManager`, `Session`, `SessionOptions`, `Transport`.
//! Role: Session Manager; contexts receive an `Arc<Session>` instead of reaching for a global.
//! Invariants: A live session exists iff at least one `Arc<Session>` is held.
//! Invariants: The engine is initialized once per live session and cleaned up exactly once,
//!             when the last holder drops its reference.
//! Invariants: A failed creation leaves the manager without a session and the count at zero.
//! Invariants: A new session is created only after the previous one finished its cleanup.
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};

use tracing::{error, info};

use crate::core::engine::{Engine, SessionId};
use crate::core::error::{Error, ErrorKind};

pub const DEFAULT_PIPE_NAME: &str = "hapi";
pub const DEFAULT_PIPE_TIMEOUT_MS: f32 = 3000.0;

#[derive(Clone, Debug, PartialEq)]
pub enum Transport {
    InProcess,
    NamedPipe {
        pipe_name: String,
        timeout_ms: f32,
        auto_close: bool,
    },
}

impl Transport {
    pub fn named_pipe() -> Self {
        Transport::NamedPipe {
            pipe_name: DEFAULT_PIPE_NAME.to_string(),
            timeout_ms: DEFAULT_PIPE_TIMEOUT_MS,
            auto_close: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SessionOptions {
    pub transport: Transport,
    pub use_cooking_thread: bool,
    pub cooking_thread_stack_size: i32,
    pub environment_files: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            transport: Transport::named_pipe(),
            use_cooking_thread: false,
            cooking_thread_stack_size: -1,
            environment_files: String::new(),
        }
    }
}

impl SessionOptions {
    pub fn in_process() -> Self {
        Self {
            transport: Transport::InProcess,
            ..Self::default()
        }
    }
}

/// Manager state shared with the session so teardown and creation are serialized.
#[derive(Default)]
struct Slot {
    state: Mutex<SlotState>,
    released: Condvar,
}

#[derive(Default)]
struct SlotState {
    current: Weak<Session>,
    /// Set while a created session has not finished its cleanup.
    live: bool,
}

impl Slot {
    fn lock(&self) -> std::sync::MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A live engine session. Dropping the last reference tears the engine down.
pub struct Session {
    engine: Arc<dyn Engine>,
    id: SessionId,
    slot: Arc<Slot>,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn engine(&self) -> &dyn Engine {
        self.engine.as_ref()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let mut state = self.slot.lock();
        info!(session = self.id.0, "releasing engine session");
        if let Err(err) = self.engine.cleanup(self.id) {
            error!(session = self.id.0, %err, "engine cleanup failed");
        }
        state.live = false;
        self.slot.released.notify_all();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}

pub struct SessionManager {
    engine: Arc<dyn Engine>,
    options: SessionOptions,
    slot: Arc<Slot>,
}

impl SessionManager {
    pub fn new(engine: Arc<dyn Engine>, options: SessionOptions) -> Self {
        Self {
            engine,
            options,
            slot: Arc::new(Slot::default()),
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// Returns the shared session, creating and initializing it on first use.
    ///
    /// Waits for a session whose last reference is being dropped to finish cleanup.
    pub fn acquire(&self) -> Result<Arc<Session>, Error> {
        let mut state = self.slot.lock();
        loop {
            if let Some(session) = state.current.upgrade() {
                return Ok(session);
            }
            if !state.live {
                break;
            }
            state = self
                .slot
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        info!(transport = ?self.options.transport, "creating engine session");
        let id = self.engine.create_session(&self.options).map_err(|err| {
            Error::engine(ErrorKind::Session, err)
                .with_hint("check that the engine is installed and licensed")
        })?;
        let session = Arc::new(Session {
            engine: Arc::clone(&self.engine),
            id,
            slot: Arc::clone(&self.slot),
        });
        state.current = Arc::downgrade(&session);
        state.live = true;
        Ok(session)
    }

    /// Number of live references to the shared session.
    pub fn users(&self) -> usize {
        self.slot.lock().current.strong_count()
    }

    pub fn is_active(&self) -> bool {
        self.users() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::{SessionManager, SessionOptions, Transport};
    use crate::core::engine::memory::MemoryEngine;
    use crate::core::error::ErrorKind;
    use std::sync::Arc;

    #[test]
    fn default_options_disable_cooking_thread() {
        let options = SessionOptions::default();
        assert!(!options.use_cooking_thread);
        assert_eq!(options.transport, Transport::named_pipe());
        assert_eq!(SessionOptions::in_process().transport, Transport::InProcess);
    }

    #[test]
    fn interleaved_acquire_release_creates_and_destroys_once() {
        let engine = Arc::new(MemoryEngine::new());
        let manager = SessionManager::new(engine.clone(), SessionOptions::in_process());

        let a = manager.acquire().expect("a");
        let b = manager.acquire().expect("b");
        drop(a);
        let c = manager.acquire().expect("c");
        assert_eq!(b.id(), c.id());
        assert_eq!(manager.users(), 2);
        drop(c);
        assert_eq!(engine.sessions_cleaned(), 0);
        drop(b);

        assert_eq!(engine.sessions_created(), 1);
        assert_eq!(engine.sessions_cleaned(), 1);
        assert!(!manager.is_active());
    }

    #[test]
    fn concurrent_acquire_never_overlaps_teardown() {
        let engine = Arc::new(MemoryEngine::new());
        let manager = Arc::new(SessionManager::new(engine.clone(), SessionOptions::in_process()));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let session = manager.acquire().expect("session");
                        drop(session);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker");
        }
        assert_eq!(engine.peak_live_sessions(), 1);
        assert_eq!(engine.sessions_created(), engine.sessions_cleaned());
        assert!(!manager.is_active());
    }

    #[test]
    fn failed_creation_leaves_no_session() {
        let engine = Arc::new(MemoryEngine::new());
        engine.fail_on("create_session");
        let manager = SessionManager::new(engine.clone(), SessionOptions::in_process());

        let err = manager.acquire().expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Session);
        assert_eq!(manager.users(), 0);

        engine.clear_failures();
        let session = manager.acquire().expect("retry");
        assert_eq!(manager.users(), 1);
        drop(session);
        assert_eq!(engine.sessions_created(), 1);
        assert_eq!(engine.sessions_cleaned(), 1);
    }
}
