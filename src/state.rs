// Jaskier Shared Pattern -- state
// Application state shared by the admin API handlers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::mcp::{McpService, ToolInvocationAdapter};

#[derive(Clone)]
pub struct AppState {
    pub service: McpService,
    pub adapter: ToolInvocationAdapter,
    pub start_time: Instant,
    ready: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(service: McpService) -> Self {
        Self {
            adapter: ToolInvocationAdapter::new(service.clone()),
            service,
            start_time: Instant::now(),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set once persisted configs are loaded.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}
