//! benchsync-core: shared types and pure logic for the workbench sync substrate.
//! Module payload validation, the presence registry, activity-log
//! reconciliation, session identity, and the client sync phase machine.
//! No IO beyond the session key file; no async.

pub mod activity_log;
pub mod error;
pub mod module_state;
pub mod presence;
pub mod session;
pub mod types;
pub mod workflow;

pub use error::SyncError;
pub use module_state::{ModulePayload, ModuleState, decode_payload};
pub use types::{
    HeartbeatResponse, LogEntry, ModuleKind, NewLogEntry, PresenceEntry, SessionKey, StateEvent,
    Versioned, WriteOutcome, WriteRequest,
};
