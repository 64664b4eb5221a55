//! The request loop: polling clients, executing calls within the time
//! budget and carrying suspended calls over to later ticks.

use super::{Core, ServerEvent};
use crate::codec::Value;
use crate::config::RateControlConfig;
use crate::messages::{Request, Response};
use crate::protocol::ClientId;
use crate::service::{CallContext, CallOutcome, Continuation, Procedure};
use crate::stats::RpcUpdateSample;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// A call waiting to run: either a freshly received Request or a handler
/// that suspended on an earlier tick.
pub(super) struct RequestContinuation {
    pub(super) client: ClientId,
    request: Request,
    suspended: Option<Suspended>,
}

enum Call {
    Start(Vec<Value>),
    Resume(Box<dyn Continuation>),
}

struct Suspended {
    procedure: Arc<Procedure>,
    continuation: Box<dyn Continuation>,
}

impl RequestContinuation {
    fn new(client: ClientId, request: Request) -> Self {
        Self {
            client,
            request,
            suspended: None,
        }
    }
}

/// Retune the per-update budget from the last frame time and exec time.
///
/// Frames slower than the target shrink the budget towards the floor. A
/// nearly idle update resets it to the idle value; otherwise it grows
/// towards the ceiling.
pub(super) fn adjust_budget(current_us: u32, frame_time: Duration, exec_time: Duration) -> u32 {
    if frame_time > RateControlConfig::target_frame_time() {
        if current_us > RateControlConfig::MIN_TIME_PER_UPDATE_US {
            current_us.saturating_sub(RateControlConfig::STEP_US)
        } else {
            current_us
        }
    } else if exec_time < RateControlConfig::IDLE_EXEC_THRESHOLD {
        RateControlConfig::IDLE_TIME_PER_UPDATE_US
    } else if current_us < RateControlConfig::MAX_TIME_PER_UPDATE_US {
        (current_us + RateControlConfig::STEP_US).min(RateControlConfig::MAX_TIME_PER_UPDATE_US)
    } else {
        current_us
    }
}

impl Core {
    /// Poll and execute requests until there is nothing left to do or the
    /// budget runs out. Calls that could not finish are kept for next tick.
    pub(super) fn update_rpc(&mut self) -> RpcUpdateSample {
        let started = Instant::now();
        let update = self.config.update.clone();
        let budget = update.max_time_per_update();
        let recv_timeout = update.recv_timeout();
        let mut poll_time = Duration::ZERO;
        let mut exec_time = Duration::ZERO;
        let mut executed = 0u64;
        let mut yielded: Vec<RequestContinuation> = Vec::new();

        loop {
            let poll_started = Instant::now();
            loop {
                self.poll_requests(&yielded);
                if !update.blocking_recv
                    || poll_started.elapsed() > recv_timeout
                    || started.elapsed() > budget
                    || !self.continuations.is_empty()
                {
                    break;
                }
                std::thread::yield_now();
            }
            poll_time += poll_started.elapsed();

            if self.continuations.is_empty() {
                break;
            }

            let exec_started = Instant::now();
            for continuation in std::mem::take(&mut self.continuations) {
                let connected = self
                    .clients
                    .get(&continuation.client)
                    .is_some_and(|client| client.channel.connected());
                if !connected {
                    continue;
                }
                if started.elapsed() > budget {
                    yielded.push(continuation);
                    continue;
                }
                if let Some(suspended) = self.execute(continuation) {
                    yielded.push(suspended);
                }
                executed += 1;
            }
            exec_time += exec_started.elapsed();

            if update.one_rpc_per_update || started.elapsed() > budget {
                break;
            }
        }

        self.continuations = yielded;

        RpcUpdateSample {
            rpcs_executed: executed,
            total: started.elapsed(),
            poll: poll_time,
            exec: exec_time,
        }
    }

    /// Read at most one Request from each idle client, in scheduler order.
    /// Clients with a call already queued or suspended are skipped.
    fn poll_requests(&mut self, yielded: &[RequestContinuation]) {
        if self.scheduler.is_empty() {
            return;
        }
        let busy: HashSet<ClientId> = self
            .continuations
            .iter()
            .chain(yielded)
            .map(|c| c.client)
            .collect();

        for id in self.scheduler.cycle() {
            if busy.contains(&id) {
                continue;
            }
            let Some(client) = self.clients.get_mut(&id) else {
                continue;
            };
            if !client.channel.has_data() {
                continue;
            }
            match client.channel.poll_request() {
                Ok(Some(request)) => {
                    debug!(
                        "Received request from client {} ({})",
                        client.channel.address(),
                        request.qualified_name()
                    );
                    self.continuations.push(RequestContinuation::new(id, request));
                    self.emit(&ServerEvent::ClientActivity(id));
                }
                Ok(None) => {}
                Err(e) if e.is_fatal_for_connection() => {
                    error!(
                        "Error receiving request from client {}: {}",
                        client.channel.address(),
                        e
                    );
                    self.disconnect_client(id);
                }
                Err(e) => {
                    let response = Response::error(self.universal_time, e.to_string());
                    self.send_response(id, &response);
                }
            }
        }
    }

    /// Run a call. Returns it back if the handler has not finished;
    /// otherwise the Response has been written to the client.
    fn execute(&mut self, continuation: RequestContinuation) -> Option<RequestContinuation> {
        let RequestContinuation {
            client,
            request,
            suspended,
        } = continuation;

        let (procedure, call) = match suspended {
            Some(Suspended {
                procedure,
                continuation,
            }) => (procedure, Call::Resume(continuation)),
            None => match self.services.bind(&request, &self.objects) {
                Ok((procedure, arguments)) => (procedure, Call::Start(arguments)),
                Err(e) => {
                    let message = self.error_text(&request.qualified_name(), e.to_string());
                    let response = Response::error(self.universal_time, message);
                    self.send_response(client, &response);
                    return None;
                }
            },
        };

        let mut ctx = CallContext {
            client,
            universal_time: self.universal_time,
            tick: self.tick,
            services: &self.services,
            objects: &self.objects,
            streams: &mut self.streams,
            status: &self.status,
            stream_connected: self.stream_clients.contains_key(&client),
        };
        let (outcome, resumed) = match call {
            Call::Resume(mut continuation) => {
                let outcome = CallOutcome::guarded(|| continuation.resume(&mut ctx));
                (outcome, Some(continuation))
            }
            Call::Start(arguments) => (
                CallOutcome::guarded(|| (procedure.handler)(&mut ctx, arguments)),
                None,
            ),
        };

        let qualified_name = procedure.signature.qualified_name();
        let response = match outcome {
            CallOutcome::Suspended(continuation) => {
                return Some(RequestContinuation {
                    client,
                    request,
                    suspended: Some(Suspended {
                        procedure,
                        continuation,
                    }),
                });
            }
            CallOutcome::Pending => match resumed {
                Some(continuation) => {
                    return Some(RequestContinuation {
                        client,
                        request,
                        suspended: Some(Suspended {
                            procedure,
                            continuation,
                        }),
                    });
                }
                None => {
                    let message = "Handler returned Pending without a continuation".to_string();
                    Response::error(self.universal_time, self.error_text(&qualified_name, message))
                }
            },
            CallOutcome::Faulted(message) => {
                Response::error(self.universal_time, self.error_text(&qualified_name, message))
            }
            CallOutcome::Completed(value) => {
                match procedure
                    .signature
                    .encode_return(value.as_ref(), &mut self.objects)
                {
                    Ok(return_value) => Response::success(self.universal_time, return_value),
                    Err(e) => Response::error(
                        self.universal_time,
                        self.error_text(&qualified_name, e.to_string()),
                    ),
                }
            }
        };
        self.send_response(client, &response);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TypeDesc;
    use crate::server::test_support::*;
    use crate::service::{CallOutcome, ProcedureSignature, ServiceRegistry};
    use std::time::Duration;

    fn counting_services() -> ServiceRegistry {
        let mut services = ServiceRegistry::new();
        services
            .register_fn(
                ProcedureSignature::new("Test", "Add")
                    .param("a", TypeDesc::Int32)
                    .param_with_default("b", TypeDesc::Int32, 10i32)
                    .returns(TypeDesc::Int32),
                |_, args| match (args[0].as_i64(), args[1].as_i64()) {
                    (Some(a), Some(b)) => CallOutcome::value(Value::Int32((a + b) as i32)),
                    _ => CallOutcome::fault("bad arguments"),
                },
            )
            .unwrap();
        services
            .register_fn(
                ProcedureSignature::new("Test", "Slow").returns(TypeDesc::UInt32),
                |_, _| {
                    std::thread::sleep(Duration::from_millis(2));
                    CallOutcome::value(1u32)
                },
            )
            .unwrap();
        services
            .register_fn(ProcedureSignature::new("Test", "Panic"), |_, _| {
                panic!("kaboom")
            })
            .unwrap();
        services
            .register_fn(
                ProcedureSignature::new("Test", "Len")
                    .param("data", TypeDesc::Bytes)
                    .returns(TypeDesc::UInt32),
                |_, args| match args.first() {
                    Some(Value::Bytes(data)) => CallOutcome::value(data.len() as u32),
                    _ => CallOutcome::fault("bad arguments"),
                },
            )
            .unwrap();
        services
            .register_fn(
                ProcedureSignature::new("Test", "WaitTicks")
                    .param("n", TypeDesc::UInt32)
                    .returns(TypeDesc::UInt64),
                |ctx, args| {
                    let target = ctx.tick() + u64::from(args[0].as_u32().unwrap_or(0));
                    CallOutcome::suspend(move |ctx: &mut CallContext<'_>| {
                        if ctx.tick() >= target {
                            CallOutcome::value(ctx.tick())
                        } else {
                            CallOutcome::Pending
                        }
                    })
                },
            )
            .unwrap();
        services
    }

    #[test]
    fn test_adjust_budget() {
        let fast = Duration::from_millis(10);
        let slow = Duration::from_millis(30);
        let busy = Duration::from_millis(3);
        let idle = Duration::from_micros(200);

        assert_eq!(adjust_budget(5000, slow, busy), 4900);
        assert_eq!(adjust_budget(1000, slow, busy), 1000);
        assert_eq!(adjust_budget(5000, fast, idle), 10_000);
        assert_eq!(adjust_budget(5000, fast, busy), 5100);
        assert_eq!(adjust_budget(25_000, fast, busy), 25_000);
        assert_eq!(adjust_budget(24_950, fast, busy), 25_000);
    }

    #[test]
    fn test_arguments_and_defaults() {
        let mut server = TestServer::new(TestServer::quick_config(), counting_services());
        let mut client = server.connect("Jeb");
        client.call("Test", "Add", &[(Value::Int32(2), TypeDesc::Int32)]);
        client.call(
            "Test",
            "Add",
            &[
                (Value::Int32(2), TypeDesc::Int32),
                (Value::Int32(-5), TypeDesc::Int32),
            ],
        );
        client.call("Test", "Add", &[]);
        server.core.update();

        let responses = client.responses();
        assert_eq!(responses.len(), 3);
        // zig-zag encoded 12 and -3
        assert_eq!(responses[0].return_value, Some(vec![24]));
        assert_eq!(responses[1].return_value, Some(vec![5]));
        assert!(responses[2].error.as_deref().unwrap().starts_with("Invalid argument"));
    }

    #[test]
    fn test_one_rpc_per_update() {
        let mut config = TestServer::quick_config();
        config.update.one_rpc_per_update = true;
        let mut server = TestServer::new(config, counting_services());
        let mut client = server.connect("Jeb");
        client.call("Test", "Add", &[(Value::Int32(1), TypeDesc::Int32)]);
        client.call("Test", "Add", &[(Value::Int32(2), TypeDesc::Int32)]);

        server.core.update();
        assert_eq!(client.responses().len(), 1);
        server.core.update();
        assert_eq!(client.responses().len(), 1);
        server.core.update();
        assert!(client.responses().is_empty());
    }

    #[test]
    fn test_large_request_served_on_first_update() {
        let mut server = TestServer::new(TestServer::quick_config(), counting_services());
        let mut client = server.connect("Jeb");
        client.call(
            "Test",
            "Len",
            &[(Value::Bytes(vec![0x5A; 20_000]), TypeDesc::Bytes)],
        );

        server.core.update();
        let responses = client.responses();
        assert_eq!(responses.len(), 1);
        let value = crate::codec::decode(
            responses[0].return_value.as_ref().unwrap(),
            &TypeDesc::UInt32,
            &crate::registry::ObjectRegistry::new(),
        )
        .unwrap();
        assert_eq!(value, Value::UInt32(20_000));
    }

    #[test]
    fn test_panicking_handler_is_error_response() {
        let mut server = TestServer::new(TestServer::quick_config(), counting_services());
        let mut client = server.connect("Jeb");
        client.call("Test", "Panic", &[]);
        server.core.update();
        client.call("Test", "Add", &[(Value::Int32(1), TypeDesc::Int32)]);
        server.core.update();

        let responses = client.responses();
        assert_eq!(responses.len(), 2);
        assert_eq!(
            responses[0].error.as_deref(),
            Some("Procedure panicked: kaboom")
        );
        assert!(!responses[1].has_error());
        assert_eq!(server.core.clients().len(), 1);
    }

    #[test]
    fn test_budget_defers_to_next_tick() {
        let mut config = TestServer::quick_config();
        config.update.max_time_per_update_us = 1000;
        let mut server = TestServer::new(config, counting_services());
        let mut clients: Vec<_> = ["A", "B", "C"].iter().map(|n| server.connect(n)).collect();
        for client in &clients {
            client.call("Test", "Slow", &[]);
        }

        let mut per_tick = Vec::new();
        for _ in 0..3 {
            server.core.update();
            per_tick.push(clients.iter_mut().map(|c| c.responses().len()).sum::<usize>());
        }
        assert_eq!(per_tick, vec![1, 1, 1]);
    }

    #[test]
    fn test_suspended_call_resumes_on_later_tick() {
        let mut server = TestServer::new(TestServer::quick_config(), counting_services());
        let mut waiter = server.connect("Waiter");
        let mut other = server.connect("Other");
        waiter.call("Test", "WaitTicks", &[(Value::UInt32(2), TypeDesc::UInt32)]);
        // Not read until the suspended call finishes.
        waiter.call("Test", "Add", &[(Value::Int32(0), TypeDesc::Int32)]);
        server.core.update();
        let start_tick = server.core.tick;
        assert_eq!(server.core.continuations.len(), 1);

        other.call("Test", "Add", &[(Value::Int32(1), TypeDesc::Int32)]);
        server.core.update();
        assert!(waiter.responses().is_empty());
        assert_eq!(other.responses().len(), 1);

        server.core.update();
        let responses = waiter.responses();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].return_value, Some(vec![(start_tick + 2) as u8]));
        assert_eq!(responses[1].return_value, Some(vec![20]));
        assert!(server.core.continuations.is_empty());
    }

    #[test]
    fn test_disconnect_drops_suspended_call() {
        let mut server = TestServer::new(TestServer::quick_config(), counting_services());
        let waiter = server.connect("Waiter");
        waiter.call("Test", "WaitTicks", &[(Value::UInt32(100), TypeDesc::UInt32)]);
        server.core.update();
        assert_eq!(server.core.continuations.len(), 1);
        waiter.transport.close();
        server.core.update();
        assert!(server.core.continuations.is_empty());
        assert!(server.core.clients().is_empty());
    }

    #[test]
    fn test_invalid_return_value_is_error() {
        let mut services = ServiceRegistry::new();
        services
            .register_fn(
                ProcedureSignature::new("Test", "Liar").returns(TypeDesc::String),
                |_, _| CallOutcome::value(3u32),
            )
            .unwrap();
        let mut server = TestServer::new(TestServer::quick_config(), services);
        let mut client = server.connect("Jeb");
        client.call("Test", "Liar", &[]);
        server.core.update();
        assert_eq!(
            client.responses()[0].error.as_deref(),
            Some("Invalid return value from Test.Liar: expected string, got uint32")
        );
    }
}
