use super::{Handler, ProcedureSignature};
use crate::codec::{decode, encode, TypeDesc, Value};
use crate::messages::{
    ClassInfo, EnumerationInfo, EnumerationValueInfo, ParameterInfo, ProcedureInfo, Request,
    ServiceInfo, Services,
};
use crate::registry::ObjectRegistry;
use crate::{KrpcError, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A registered procedure: its signature and handler.
pub struct Procedure {
    pub signature: ProcedureSignature,
    pub handler: Handler,
    /// Encoded defaults, one slot per parameter.
    default_bytes: Vec<Option<Vec<u8>>>,
}

impl fmt::Debug for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Procedure")
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct ServiceEntry {
    name: String,
    documentation: String,
    procedures: Vec<Arc<Procedure>>,
    classes: Vec<ClassInfo>,
    enumerations: Vec<EnumerationInfo>,
}

/// Every service and procedure the server exposes.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: Vec<ServiceEntry>,
    procedures: HashMap<(String, String), Arc<Procedure>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, service: &str) -> &mut ServiceEntry {
        let index = match self.services.iter().position(|s| s.name == service) {
            Some(index) => index,
            None => {
                self.services.push(ServiceEntry {
                    name: service.to_string(),
                    ..ServiceEntry::default()
                });
                self.services.len() - 1
            }
        };
        &mut self.services[index]
    }

    /// Register a procedure. Types are validated and defaults encoded here,
    /// so a bad signature fails at startup rather than on first call.
    pub fn register(&mut self, signature: ProcedureSignature, handler: Handler) -> Result<()> {
        let key = (signature.service.clone(), signature.name.clone());
        if self.procedures.contains_key(&key) {
            return Err(KrpcError::DuplicateProcedure(signature.qualified_name()));
        }

        let invalid = |message: String| KrpcError::Config {
            message: format!("{}: {}", signature.qualified_name(), message),
        };
        let mut scratch = ObjectRegistry::new();
        let mut default_bytes = Vec::with_capacity(signature.parameters.len());
        for parameter in &signature.parameters {
            parameter.ty.validate().map_err(&invalid)?;
            let bytes = match &parameter.default {
                Some(default) => Some(
                    encode(default, &parameter.ty, &mut scratch)
                        .map_err(|e| invalid(format!("default for {}: {}", parameter.name, e)))?,
                ),
                None => None,
            };
            default_bytes.push(bytes);
        }
        if let Some(ty) = &signature.return_type {
            ty.validate().map_err(&invalid)?;
        }

        debug!("Registered procedure {}", signature.qualified_name());
        let procedure = Arc::new(Procedure {
            signature,
            handler,
            default_bytes,
        });
        self.entry(&key.0).procedures.push(procedure.clone());
        self.procedures.insert(key, procedure);
        Ok(())
    }

    /// Register a procedure from a plain closure.
    pub fn register_fn<F>(&mut self, signature: ProcedureSignature, handler: F) -> Result<()>
    where
        F: Fn(&mut super::CallContext<'_>, Vec<Value>) -> super::CallOutcome + Send + Sync + 'static,
    {
        self.register(signature, Arc::new(handler))
    }

    pub fn set_documentation(&mut self, service: &str, documentation: impl Into<String>) {
        self.entry(service).documentation = documentation.into();
    }

    /// Declare a class so clients can discover it.
    pub fn add_class(&mut self, service: &str, name: &str, documentation: impl Into<String>) {
        self.entry(service).classes.push(ClassInfo {
            name: name.to_string(),
            documentation: documentation.into(),
        });
    }

    /// Declare an enumeration and its named values.
    pub fn add_enumeration(&mut self, service: &str, name: &str, values: &[(&str, i32)]) {
        self.entry(service).enumerations.push(EnumerationInfo {
            name: name.to_string(),
            values: values
                .iter()
                .map(|(value_name, value)| EnumerationValueInfo {
                    name: value_name.to_string(),
                    value: *value,
                    documentation: String::new(),
                })
                .collect(),
            documentation: String::new(),
        });
    }

    pub fn resolve(&self, service: &str, procedure: &str) -> Result<Arc<Procedure>> {
        if let Some(found) = self
            .procedures
            .get(&(service.to_string(), procedure.to_string()))
        {
            return Ok(found.clone());
        }
        if self.services.iter().any(|s| s.name == service) {
            Err(KrpcError::ProcedureNotFound {
                service: service.to_string(),
                procedure: procedure.to_string(),
            })
        } else {
            Err(KrpcError::ServiceNotFound(service.to_string()))
        }
    }

    /// Resolve a Request and decode its arguments into positional order,
    /// filling unsupplied parameters from their defaults.
    pub fn bind(
        &self,
        request: &Request,
        objects: &ObjectRegistry,
    ) -> Result<(Arc<Procedure>, Vec<Value>)> {
        let procedure = self.resolve(&request.service, &request.procedure)?;
        let signature = &procedure.signature;
        let invalid = |message: String| KrpcError::InvalidArgument {
            procedure: signature.qualified_name(),
            message,
        };

        let arity = signature.parameters.len();
        let mut supplied: Vec<Option<Value>> = vec![None; arity];
        for argument in &request.arguments {
            let position = argument.position as usize;
            if position >= arity {
                return Err(invalid(format!(
                    "argument position {} out of range, procedure takes {} arguments",
                    position, arity
                )));
            }
            if supplied[position].is_some() {
                return Err(invalid(format!(
                    "argument position {} supplied more than once",
                    position
                )));
            }
            let parameter = &signature.parameters[position];
            let value = decode(&argument.value, &parameter.ty, objects).map_err(|e| {
                invalid(format!(
                    "cannot decode {} as {}: {}",
                    parameter.name, parameter.ty, e
                ))
            })?;
            supplied[position] = Some(value);
        }

        let mut arguments = Vec::with_capacity(arity);
        for (parameter, value) in signature.parameters.iter().zip(supplied) {
            match value.or_else(|| parameter.default.clone()) {
                Some(value) => arguments.push(value),
                None => return Err(invalid(format!("missing argument {}", parameter.name))),
            }
        }
        Ok((procedure, arguments))
    }

    /// Describe every service for `KRPC.GetServices`.
    pub fn describe(&self) -> Services {
        Services {
            services: self
                .services
                .iter()
                .map(|service| ServiceInfo {
                    name: service.name.clone(),
                    procedures: service.procedures.iter().map(|p| describe_procedure(p)).collect(),
                    classes: service.classes.clone(),
                    enumerations: service.enumerations.clone(),
                    documentation: service.documentation.clone(),
                })
                .collect(),
        }
    }

    pub fn service_names(&self) -> Vec<&str> {
        self.services.iter().map(|s| s.name.as_str()).collect()
    }
}

fn describe_procedure(procedure: &Procedure) -> ProcedureInfo {
    let signature = &procedure.signature;
    ProcedureInfo {
        name: signature.name.clone(),
        parameters: signature
            .parameters
            .iter()
            .zip(&procedure.default_bytes)
            .map(|(parameter, default)| ParameterInfo {
                name: parameter.name.clone(),
                type_name: parameter.ty.to_string(),
                default_value: default.clone(),
            })
            .collect(),
        return_type: signature.return_type.as_ref().map(TypeDesc::to_string),
        attributes: Vec::new(),
        documentation: signature.documentation.clone(),
    }
}
