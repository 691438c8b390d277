use std::sync::Arc;

use crate::application::repos::EndpointConfigRepo;
use crate::cache::{CacheStore, EventQueue, PolicyResolver, WarmupJob};

#[derive(Clone)]
pub struct AdminState {
    pub store: Arc<CacheStore>,
    pub policies: Arc<PolicyResolver>,
    pub events: Arc<EventQueue>,
    pub warmup: Arc<WarmupJob>,
}

impl AdminState {
    pub fn configs(&self) -> &Arc<dyn EndpointConfigRepo> {
        self.policies.repo()
    }
}
