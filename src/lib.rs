pub mod activity;
pub mod aws_clients;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod errors;
pub mod extraction;
pub mod handlers;
pub mod memory;
pub mod models;
pub mod moderation;
pub mod notifications;
pub mod pipeline;
pub mod repositories;
pub mod routes;
pub mod startup;
pub mod storage;

use crate::{domain::ActivityLog, pipeline::EngagementPipeline};
use std::sync::Arc;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<EngagementPipeline>,
    pub activity_log: Arc<dyn ActivityLog>,
    pub max_upload_bytes: usize,
}
