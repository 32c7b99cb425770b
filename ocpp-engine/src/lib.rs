//! # OCPP Engine
//!
//! OCPP-J 2.0.1 session engine for both ends of the charging link: a central
//! system (CSMS) accepting many stations, and a charging station client.
//!
//! ## Architecture
//!
//! ```text
//!  CsmsServer ──accept──► Session ◄──connect── Station
//!      │                    │
//!      ▼                    ├── Transport   (WebSocket or in-process channel)
//!  Registry                 ├── Frame codec [2|3|4, id, ...]
//!  identity -> Session      ├── PendingCalls (outbound id -> waiter)
//!      │                    ├── Dispatcher  (action -> handler)
//!      ▼                    └── child tasks  (heartbeat, commands)
//!  CentralSystem
//!  list / send_to / reports / transactions
//! ```
//!
//! Each session reads frames strictly in order and dispatches inbound CALLs
//! inline, while any number of tasks send their own CALLs concurrently.
//! Closing a session fails every pending call and cancels its child tasks.
//!
//! ## Usage
//!
//! ```no_run
//! use ocpp_engine::{handlers, CsmsConfig, CsmsServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CsmsConfig::default();
//!     let dispatcher = handlers::csms_dispatcher(config.heartbeat_interval);
//!
//!     let server = CsmsServer::new(config, dispatcher);
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod central;
pub mod command;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod observer;
pub mod ocpp;
pub mod pending;
pub mod registry;
pub mod server;
pub mod session;
pub mod station;
pub mod transport;

pub use central::CentralSystem;
pub use command::{AdminCommand, CommandError, OperatorCommand};
pub use config::{CsmsConfig, SessionConfig, StationConfig, OCPP_SUBPROTOCOL};
pub use dispatcher::{handler_fn, typed, ActionHandler, CallContext, Dispatcher};
pub use error::OcppError;
pub use observer::{NoopObserver, SessionObserver, TracingObserver};
pub use ocpp::{Action, Call, CallError, CallResult, DecodeError, ErrorCode, Frame};
pub use pending::PendingCalls;
pub use registry::{DuplicatePolicy, Registry, ReleaseReason, ReleaseSignal};
pub use server::CsmsServer;
pub use session::{Session, SessionBuilder, SessionState};
pub use station::Station;
pub use transport::{ChannelTransport, Transport, WsTransport};
