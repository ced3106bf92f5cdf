use parking_lot::RwLock;
use std::sync::Arc;

/// Read-mostly state shared between tasks; writers are serialized against readers
pub type Shared<T> = Arc<RwLock<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(RwLock::new(value))
}
