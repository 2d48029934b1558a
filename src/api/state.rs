use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::contract::Contract;
use crate::target::TargetResolver;
use crate::worker::Worker;

/// Everything a handler can reach. The worker is the process-wide backend.
#[derive(Clone)]
pub struct AppState {
    pub worker: Arc<dyn Worker>,
    pub resolver: Arc<dyn TargetResolver>,
    /// `/contract` body, rendered once at startup.
    pub contract: Arc<str>,
    pub keepalive: Duration,
    /// Base for relative image paths in flash descriptors.
    pub workdir: PathBuf,
}

impl AppState {
    pub fn new(
        worker: Arc<dyn Worker>,
        resolver: Arc<dyn TargetResolver>,
        contract: &Contract,
        keepalive: Duration,
        workdir: PathBuf,
    ) -> Self {
        Self {
            worker,
            resolver,
            contract: Arc::from(contract.to_json()),
            keepalive,
            workdir,
        }
    }
}
