//! Session orchestration: lifecycle state machine, registry and event
//! fan-out.

pub mod error;
pub mod events;
pub mod machine;
pub mod registry;
pub mod state;

pub use error::SessionError;
pub use events::{EventHub, SessionEvent};
pub use machine::{SessionHandle, SessionMachine, SessionRuntime, SessionSummary};
pub use registry::SessionRegistry;
pub use state::{Platform, SessionInfo, SessionStatus};
