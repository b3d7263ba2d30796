use parking_lot::Mutex;
use std::sync::Arc;

use crate::config::ControlConfig;
use crate::health::HealthTracker;
use crate::scheduler::SchedulerHandle;
use crate::store::NodeStore;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Single state object handed to the axum router
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<NodeStore>,
    pub cfg: Arc<ControlConfig>,
    pub health_tracker: HealthTracker,
    /// Timer loop may be disabled; manual passes always work
    pub scheduler: SchedulerHandle,
}
