//! Application state.

use pages_db::BuildRepo;
use pages_scheduler::BuildLedger;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub builds: Arc<dyn BuildRepo>,
    pub ledger: Arc<BuildLedger>,
}

impl AppState {
    pub fn new(builds: Arc<dyn BuildRepo>, ledger: Arc<BuildLedger>) -> Self {
        Self { builds, ledger }
    }
}
