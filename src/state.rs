//! Shared application state handed to every handler and background task.

use std::sync::Arc;

use crate::config::Config;
use crate::engine::WorkflowEngine;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub engine: Arc<dyn WorkflowEngine>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, engine: Arc<dyn WorkflowEngine>, config: Config) -> Self {
        Self {
            store,
            engine,
            config: Arc::new(config),
        }
    }
}
