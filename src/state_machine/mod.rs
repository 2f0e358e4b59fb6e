// Status definitions and transition rules for runs and jobs.
//
// Transitions are applied as conditional updates by the store backends, so the
// rules here decide what a message may change, never the persistence order.

pub mod events;
pub mod states;

// Re-export main types for convenient access
pub use events::JobEvent;
pub use states::{JobStatus, RunStatus};
