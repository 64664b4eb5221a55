//! Procedure table and call interface.
//!
//! Services are registered once at startup as a set of
//! [`ProcedureSignature`]s, each paired with a [`Handler`]. A handler receives
//! its bound arguments and returns a [`CallOutcome`]: a finished value, a
//! failure message, or a [`Continuation`] to resume on a later tick. A
//! continuation keeps returning [`CallOutcome::Pending`] until it is done.

mod builtin;
mod registry;

pub use builtin::register_krpc_service;
pub use registry::{Procedure, ServiceRegistry};

use crate::codec::{encode_optional, TypeDesc, Value};
use crate::messages::{Request, Status};
use crate::protocol::ClientId;
use crate::registry::ObjectRegistry;
use crate::stream::StreamManager;
use crate::{KrpcError, Result};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Implementation backing one procedure.
pub type Handler = Arc<dyn Fn(&mut CallContext<'_>, Vec<Value>) -> CallOutcome + Send + Sync>;

/// Suspended handler state, resumed once per tick until it finishes.
pub trait Continuation: Send {
    fn resume(&mut self, ctx: &mut CallContext<'_>) -> CallOutcome;
}

impl<F> Continuation for F
where
    F: FnMut(&mut CallContext<'_>) -> CallOutcome + Send,
{
    fn resume(&mut self, ctx: &mut CallContext<'_>) -> CallOutcome {
        self(ctx)
    }
}

/// What a handler (or continuation) produced.
pub enum CallOutcome {
    /// Finished; `None` for void procedures.
    Completed(Option<Value>),
    /// Not finished yet; run the continuation again next tick.
    Suspended(Box<dyn Continuation>),
    /// Returned by a continuation that is still waiting; it is resumed
    /// again next tick.
    Pending,
    Faulted(String),
}

impl CallOutcome {
    pub fn value(value: impl Into<Value>) -> Self {
        CallOutcome::Completed(Some(value.into()))
    }

    pub fn void() -> Self {
        CallOutcome::Completed(None)
    }

    pub fn fault(message: impl fmt::Display) -> Self {
        CallOutcome::Faulted(message.to_string())
    }

    pub fn suspend(continuation: impl Continuation + 'static) -> Self {
        CallOutcome::Suspended(Box::new(continuation))
    }

    /// Run a handler or continuation, reporting a panic as a fault.
    pub fn guarded(f: impl FnOnce() -> CallOutcome) -> Self {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = if let Some(s) = payload.downcast_ref::<&str>() {
                    format!("Procedure panicked: {s}")
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    format!("Procedure panicked: {s}")
                } else {
                    "Procedure panicked".to_string()
                };
                CallOutcome::Faulted(message)
            }
        }
    }

    pub fn from_result(result: Result<Option<Value>>) -> Self {
        match result {
            Ok(value) => CallOutcome::Completed(value),
            Err(e) => CallOutcome::Faulted(e.to_string()),
        }
    }
}

impl fmt::Debug for CallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallOutcome::Completed(value) => f.debug_tuple("Completed").field(value).finish(),
            CallOutcome::Suspended(_) => write!(f, "Suspended(..)"),
            CallOutcome::Pending => write!(f, "Pending"),
            CallOutcome::Faulted(message) => f.debug_tuple("Faulted").field(message).finish(),
        }
    }
}

/// Parameter of a procedure.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub ty: TypeDesc,
    pub default: Option<Value>,
}

/// Static description of a procedure.
#[derive(Debug, Clone)]
pub struct ProcedureSignature {
    pub service: String,
    pub name: String,
    pub parameters: Vec<Parameter>,
    pub return_type: Option<TypeDesc>,
    pub documentation: String,
}

impl ProcedureSignature {
    pub fn new(service: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            name: name.into(),
            parameters: Vec::new(),
            return_type: None,
            documentation: String::new(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, ty: TypeDesc) -> Self {
        self.parameters.push(Parameter {
            name: name.into(),
            ty,
            default: None,
        });
        self
    }

    pub fn param_with_default(
        mut self,
        name: impl Into<String>,
        ty: TypeDesc,
        default: impl Into<Value>,
    ) -> Self {
        self.parameters.push(Parameter {
            name: name.into(),
            ty,
            default: Some(default.into()),
        });
        self
    }

    pub fn returns(mut self, ty: TypeDesc) -> Self {
        self.return_type = Some(ty);
        self
    }

    pub fn doc(mut self, documentation: impl Into<String>) -> Self {
        self.documentation = documentation.into();
        self
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.service, self.name)
    }

    /// Check a handler's result against the declared return type.
    pub fn check_return(&self, value: Option<&Value>) -> Result<()> {
        let invalid = |message: String| KrpcError::InvalidReturnValue {
            procedure: self.qualified_name(),
            message,
        };
        match (&self.return_type, value) {
            (None, None) => Ok(()),
            (None, Some(value)) => Err(invalid(format!(
                "procedure returns nothing, but got {}",
                value.kind_name()
            ))),
            (Some(ty), None) => Err(invalid(format!("expected {}, got nothing", ty))),
            (Some(ty), Some(value)) if !value.conforms_to(ty) => Err(invalid(format!(
                "expected {}, got {}",
                ty,
                value.kind_name()
            ))),
            (Some(_), Some(_)) => Ok(()),
        }
    }

    /// Check the result and encode it for a Response.
    pub fn encode_return(
        &self,
        value: Option<&Value>,
        objects: &mut ObjectRegistry,
    ) -> Result<Option<Vec<u8>>> {
        self.check_return(value)?;
        match &self.return_type {
            Some(ty) => encode_optional(value, ty, objects)
                .map(Some)
                .map_err(|e| KrpcError::InvalidReturnValue {
                    procedure: self.qualified_name(),
                    message: e.to_string(),
                }),
            None => Ok(None),
        }
    }
}

/// Everything a handler may touch while it runs.
pub struct CallContext<'a> {
    pub(crate) client: ClientId,
    pub(crate) universal_time: f64,
    pub(crate) tick: u64,
    pub(crate) services: &'a ServiceRegistry,
    pub(crate) objects: &'a ObjectRegistry,
    pub(crate) streams: &'a mut StreamManager,
    pub(crate) status: &'a Status,
    pub(crate) stream_connected: bool,
}

impl<'a> CallContext<'a> {
    /// Client on whose behalf the call runs.
    pub fn client_id(&self) -> ClientId {
        self.client
    }

    pub fn universal_time(&self) -> f64 {
        self.universal_time
    }

    /// Number of the current tick, counted from server start.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn services(&self) -> &ServiceRegistry {
        self.services
    }

    /// Server status as of the start of this tick.
    pub fn status(&self) -> &Status {
        self.status
    }

    /// Subscribe the calling client to `request`, re-run every tick.
    ///
    /// An existing subscription with the same procedure and equal decoded
    /// arguments is returned instead of creating another.
    pub fn add_stream(&mut self, request: &Request) -> Result<u32> {
        if !self.stream_connected {
            return Err(KrpcError::NoStreamClient);
        }
        let (procedure, arguments) = self.services.bind(request, self.objects)?;
        Ok(self.streams.add(self.client, procedure, arguments))
    }

    /// Remove one of the calling client's subscriptions. Unknown ids are ignored.
    pub fn remove_stream(&mut self, id: u32) {
        self.streams.remove(self.client, id);
    }
}
