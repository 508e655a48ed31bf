use std::sync::Arc;

use crate::session::{ConversationHistory, ConversationTracker};

/// Shared by every dispatcher endpoint; cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub tracker: Arc<ConversationTracker>,
    pub history: Arc<ConversationHistory>,
}

impl AppState {
    pub fn new(session_shards: usize) -> Self {
        AppState {
            tracker: Arc::new(ConversationTracker::with_shards(session_shards)),
            history: Arc::new(ConversationHistory::new()),
        }
    }
}
