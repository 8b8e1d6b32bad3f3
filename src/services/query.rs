use std::sync::Arc;

use crate::db::models::{Measurement, WindowPoint};
use crate::db::store::{Store, StoreError};

/// Number of readings served to chart pollers.
pub const RECENT_WINDOW: usize = 50;

#[derive(Clone)]
pub struct QueryHandler {
    store: Arc<Store>,
    field: Measurement,
}

impl QueryHandler {
    pub fn new(store: Arc<Store>, field: Measurement) -> Self {
        QueryHandler { store, field }
    }

    /// Field served by [`QueryHandler::latest`].
    pub fn field(&self) -> Measurement {
        self.field
    }

    /// Last [`RECENT_WINDOW`] readings of the configured field, oldest first.
    pub fn latest(&self) -> Result<Vec<WindowPoint>, StoreError> {
        self.latest_for(self.field)
    }

    pub fn latest_for(&self, field: Measurement) -> Result<Vec<WindowPoint>, StoreError> {
        self.store.recent_window(RECENT_WINDOW, field)
    }
}
