//! kRPC Core - tick-driven RPC execution engine.
//!
//! This crate lets a host process (typically a game or simulation loop)
//! expose procedures to remote clients over the kRPC protocol. All work
//! happens inside [`Core::update`], which the host calls once per frame:
//! new connections are verified, queued requests are executed within a
//! per-update time budget, and every stream subscription is re-evaluated.
//!
//! # Example
//!
//! ```rust,ignore
//! use krpc_core::codec::TypeDesc;
//! use krpc_core::service::{CallOutcome, ProcedureSignature, ServiceRegistry};
//! use krpc_core::{Core, ServerConfig};
//!
//! fn main() -> krpc_core::Result<()> {
//!     let mut services = ServiceRegistry::new();
//!     services.register_fn(
//!         ProcedureSignature::new("Simulation", "Altitude").returns(TypeDesc::Double),
//!         |_, _| CallOutcome::value(1250.0),
//!     )?;
//!
//!     let mut core = Core::with_tcp(ServerConfig::default(), services)?;
//!     core.start()?;
//!     loop {
//!         core.update();
//!         // ... advance the simulation
//!     }
//! }
//! ```

pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod messages;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod service;
pub mod stats;
pub mod stream;
pub mod transport;

// Re-export commonly used types
pub use codec::{MessageKind, ObjectRef, TypeDesc, Value};
pub use config::{ServerConfig, UpdateConfig};
pub use error::{CodecError, KrpcError, Result, SchedulerError};
pub use messages::{Request, Response, Status};
pub use protocol::{ClientId, ConnectionAttempt, ConnectionStatus, Decision};
pub use registry::ObjectRegistry;
pub use server::{ClientInfo, Core, ServerEvent};
pub use service::{CallContext, CallOutcome, Continuation, ProcedureSignature, ServiceRegistry};
