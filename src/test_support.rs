//! Shared fixtures for unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::Config;
use crate::engine::{EngineError, EnginePayload, WorkflowEngine};
use crate::state::AppState;
use crate::store::memory::MemoryStore;

/// Engine double that records every start and can be told to fail.
#[derive(Default)]
pub struct StubEngine {
    started: Mutex<Vec<EnginePayload>>,
    fail: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl StubEngine {
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Hold every start for `delay`, to widen race windows.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn started(&self) -> Vec<EnginePayload> {
        self.started.lock().clone()
    }
}

#[async_trait]
impl WorkflowEngine for StubEngine {
    async fn start(&self, payload: &EnginePayload) -> Result<(), EngineError> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(EngineError::Rejected {
                status: 503,
                body: "engine unavailable".into(),
            });
        }
        self.started.lock().push(payload.clone());
        Ok(())
    }
}

pub struct Harness {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub engine: Arc<StubEngine>,
}

pub fn harness() -> Harness {
    harness_with(Config::default())
}

pub fn harness_with(config: Config) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let engine = Arc::new(StubEngine::default());
    let state = AppState::new(store.clone(), engine.clone(), config);
    Harness { state, store, engine }
}
