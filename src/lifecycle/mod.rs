//! Connection lifecycle: the reconnect state machine and the controller
//! task that applies it

pub mod controller;
pub mod state;

pub use controller::{Controller, ControllerConfig, ControllerHandle, Snapshot};
pub use state::{Effect, EndCause, Input, Lifecycle, LifecycleState};
