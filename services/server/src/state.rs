//! Shared application state handed to every HTTP and WS handler.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::hub::Hub;
use crate::store::Store;
use crate::typing::TypingManager;

#[derive(Clone)]
pub struct AppState {
    /// The relational store. Handler tasks serialize on this mutex; the hub
    /// never touches it.
    pub store: Arc<Mutex<Store>>,
    pub hub: Hub,
    pub typing: TypingManager,
}

impl AppState {
    /// Wire up the hub task and the typing GC around an opened store.
    pub fn new(store: Store) -> Self {
        let typing = TypingManager::new();
        typing.spawn_gc();
        Self {
            store: Arc::new(Mutex::new(store)),
            hub: Hub::spawn(),
            typing,
        }
    }
}
