//! Model lifecycle
//!
//! Module structure:
//! - state.rs: SlotState machine and published SlotStatus
//! - controller.rs: ModelLifecycleController (load, unload, generate, reconfigure)
//! - stream.rs: GenerationStream with per-call cooperative cancellation

pub mod state;
pub mod controller;
pub mod stream;

pub use state::{SlotState, SlotStatus};
pub use controller::ModelLifecycleController;
pub use stream::GenerationStream;
