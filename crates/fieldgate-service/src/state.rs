//! Application state shared across services.
//!
//! The store is the only resource shared between the supervised loops. It is
//! held behind an async mutex; every caller locks it for the duration of one
//! store operation and never across a network call.

use std::sync::Arc;

use fieldgate_store::Store;
use tokio::sync::Mutex;

use crate::config::Config;

/// Shared handle to the store.
pub type SharedStore = Arc<Mutex<Store>>;

/// Shared application state.
pub struct AppState {
    /// The data store (wrapped in Mutex for thread-safe access).
    pub store: SharedStore,
    /// Configuration the gateway was started with.
    pub config: Config,
}

impl AppState {
    /// Create new application state.
    pub fn new(store: Store, config: Config) -> Arc<Self> {
        Arc::new(Self {
            store: Arc::new(Mutex::new(store)),
            config,
        })
    }
}
