//! Application state shared across request handlers.

use std::sync::Arc;

use crate::db::Database;
use crate::registry::DeviceRegistry;
use crate::resolver::DeviceResolver;

/// Shared application state, handed to handlers through axum's `State`.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    resolver: Arc<DeviceResolver>,
    db: Option<Database>,
}

impl AppState {
    pub fn new(resolver: Arc<DeviceResolver>, db: Option<Database>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { resolver, db }),
        }
    }

    pub fn resolver(&self) -> &DeviceResolver {
        &self.inner.resolver
    }

    pub fn registry(&self) -> &Arc<dyn DeviceRegistry> {
        self.inner.resolver.registry()
    }

    /// The binding database, present only in binding mode.
    pub fn db(&self) -> Option<&Database> {
        self.inner.db.as_ref()
    }
}
