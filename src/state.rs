//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It holds the access gate, the room registry, and the edit pipeline whose
//! workers run the edit state machine against that registry.

use std::sync::Arc;

use crate::config::EditConfig;
use crate::services::access::PictureAccess;
use crate::services::edit::EditProcessor;
use crate::services::pipeline::EditPipeline;
use crate::services::registry::RoomRegistry;

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum; all inner fields are Arc-wrapped or Copy.
#[derive(Clone)]
pub struct AppState {
    pub access: Arc<dyn PictureAccess>,
    pub registry: Arc<RoomRegistry>,
    pub pipeline: EditPipeline,
    pub config: EditConfig,
}

impl AppState {
    /// Build state and start the edit pipeline workers. Needs a Tokio runtime.
    #[must_use]
    pub fn new(access: Arc<dyn PictureAccess>, config: EditConfig) -> Self {
        let registry = Arc::new(RoomRegistry::new());
        let processor = Arc::new(EditProcessor::new(Arc::clone(&registry)));
        let pipeline = EditPipeline::spawn(config.pipeline(), processor);
        Self { access, registry, pipeline, config }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================
