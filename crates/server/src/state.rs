use std::sync::Arc;

use reflector_pipeline::PipelineDeps;

#[derive(Clone)]
pub struct AppState {
    pub deps: Arc<PipelineDeps>,
}

impl AppState {
    pub fn new(deps: Arc<PipelineDeps>) -> Self {
        Self { deps }
    }
}
