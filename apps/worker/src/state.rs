use std::sync::Arc;

use kestrel_application::Instance;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub instance: Arc<Instance>,
}
