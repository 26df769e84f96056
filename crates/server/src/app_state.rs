use std::sync::Arc;

use notifier_core::NotificationEngine;
use storage::Storage;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) engine: Arc<NotificationEngine>,
    pub(crate) storage: Storage,
}
