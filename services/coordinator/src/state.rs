//! Shared application state, mirroring the donor's `services/server/src/state.rs`.

use crate::coordinator::CoordinatorRegistry;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<CoordinatorRegistry>,
    pub web_domain: String,
}

impl AppState {
    pub fn new(registry: Arc<CoordinatorRegistry>, web_domain: impl Into<String>) -> Self {
        AppState {
            registry,
            web_domain: web_domain.into(),
        }
    }

    pub fn share_url(&self, share_name: &str) -> String {
        format!("{}/s/{}", self.web_domain.trim_end_matches('/'), share_name)
    }
}
