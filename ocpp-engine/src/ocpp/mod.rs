//! OCPP 2.0.1 protocol vocabulary
//!
//! - `messages`: OCPP-J framing (CALL, CALLRESULT, CALLERROR)
//! - `types`: payload structures for the actions the engine uses

pub mod types;
pub mod messages;

pub use types::*;
pub use messages::*;
