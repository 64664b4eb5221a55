//! The built-in `KRPC` service.

use super::{CallOutcome, ProcedureSignature, ServiceRegistry};
use crate::codec::{MessageKind, TypeDesc, Value};
use crate::messages::Message;
use crate::Result;

pub const SERVICE_NAME: &str = "KRPC";

/// Register `KRPC.GetStatus`, `GetServices`, `AddStream` and `RemoveStream`.
pub fn register_krpc_service(registry: &mut ServiceRegistry) -> Result<()> {
    registry.set_documentation(SERVICE_NAME, "Main kRPC service, used by clients to interact with basic server functionality.");

    registry.register_fn(
        ProcedureSignature::new(SERVICE_NAME, "GetStatus")
            .returns(TypeDesc::Message(MessageKind::Status))
            .doc("Returns some information about the server, such as the version."),
        |ctx, _| CallOutcome::value(Message::Status(ctx.status().clone())),
    )?;

    registry.register_fn(
        ProcedureSignature::new(SERVICE_NAME, "GetServices")
            .returns(TypeDesc::Message(MessageKind::Services))
            .doc("Returns information on all services, procedures, classes, properties etc. provided by the server."),
        |ctx, _| CallOutcome::value(Message::Services(ctx.services().describe())),
    )?;

    registry.register_fn(
        ProcedureSignature::new(SERVICE_NAME, "AddStream")
            .param("request", TypeDesc::Message(MessageKind::Request))
            .returns(TypeDesc::UInt32)
            .doc("Add a streaming request and return its identifier."),
        |ctx, args| match args.first().and_then(Value::as_message) {
            Some(Message::Request(request)) => match ctx.add_stream(request) {
                Ok(id) => CallOutcome::value(id),
                Err(e) => CallOutcome::fault(e),
            },
            _ => CallOutcome::fault("AddStream expects a Request"),
        },
    )?;

    registry.register_fn(
        ProcedureSignature::new(SERVICE_NAME, "RemoveStream")
            .param("id", TypeDesc::UInt32)
            .doc("Remove a streaming request."),
        |ctx, args| match args.first().and_then(Value::as_u32) {
            Some(id) => {
                ctx.remove_stream(id);
                CallOutcome::void()
            }
            None => CallOutcome::fault("RemoveStream expects a uint32 id"),
        },
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_krpc_service_registered() {
        let mut registry = ServiceRegistry::new();
        register_krpc_service(&mut registry).unwrap();
        let services = registry.describe();
        let krpc = &services.services[0];
        assert_eq!(krpc.name, "KRPC");
        let names: Vec<_> = krpc.procedures.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["GetStatus", "GetServices", "AddStream", "RemoveStream"]);
        assert_eq!(krpc.procedures[0].return_type.as_deref(), Some("KRPC.Status"));
        assert_eq!(
            krpc.procedures[2].parameters[0].type_name,
            "KRPC.Request"
        );
    }

    #[test]
    fn test_register_twice_fails() {
        let mut registry = ServiceRegistry::new();
        register_krpc_service(&mut registry).unwrap();
        assert!(register_krpc_service(&mut registry).is_err());
    }
}
