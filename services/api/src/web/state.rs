//! services/api/src/web/state.rs
//!
//! Defines the application state shared by every handler.

use crate::config::Config;
use crate::queue::QueueHealth;
use crate::scenario::InterviewService;
use crate::web::gateway::SessionGateway;
use interview_core::ports::{AudioStorage, AuthSessionValidator};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub interviews: Arc<dyn InterviewService>,
    pub gateway: Arc<SessionGateway>,
    pub auth: Arc<dyn AuthSessionValidator>,
    pub audio: Arc<dyn AudioStorage>,
    pub broker: Arc<dyn QueueHealth>,
    /// Fires on server shutdown; every live session runs under a child of it.
    pub shutdown: CancellationToken,
}
