pub mod bus;
pub mod types;

// Re-export key types for convenience
pub use bus::{EventBus, EventBusError, EventBusResult, TypedSubscription};
pub use types::{JobStateChanged, TaskUpdateEvent, TaskUpdateKind};
