//! The stream loop: every subscription is evaluated once per tick and the
//! results are written to each client as a single batch.

use super::Core;
use crate::messages::{Response, StreamMessage, StreamResponse, WireMessage};
use crate::protocol::ClientId;
use crate::service::{CallContext, CallOutcome};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::debug;

impl Core {
    pub(super) fn update_streams(&mut self) {
        let started = Instant::now();
        let mut executed = 0u64;
        let mut batches: BTreeMap<ClientId, Vec<StreamResponse>> = BTreeMap::new();

        for (id, client, procedure, arguments) in self.streams.snapshot() {
            if !self.clients.contains_key(&client) || !self.stream_clients.contains_key(&client) {
                continue;
            }
            let mut ctx = CallContext {
                client,
                universal_time: self.universal_time,
                tick: self.tick,
                services: &self.services,
                objects: &self.objects,
                streams: &mut self.streams,
                status: &self.status,
                stream_connected: true,
            };
            let outcome = CallOutcome::guarded(|| (procedure.handler)(&mut ctx, arguments));
            executed += 1;

            let qualified_name = procedure.signature.qualified_name();
            let time = self.universal_time;
            let response = match outcome {
                CallOutcome::Completed(value) => {
                    match procedure
                        .signature
                        .encode_return(value.as_ref(), &mut self.objects)
                    {
                        Ok(return_value) => Response::success(time, return_value),
                        Err(e) => Response::error(time, self.error_text(&qualified_name, e.to_string())),
                    }
                }
                CallOutcome::Faulted(message) => {
                    Response::error(time, self.error_text(&qualified_name, message))
                }
                CallOutcome::Suspended(_) | CallOutcome::Pending => {
                    let message = "Streamed procedures must complete within a tick".to_string();
                    Response::error(time, self.error_text(&qualified_name, message))
                }
            };

            if self.config.stream_only_changes {
                let unstamped = Response {
                    time: 0.0,
                    ..response.clone()
                };
                if !self.streams.record_sent(id, &unstamped.encode()) {
                    continue;
                }
            }
            batches
                .entry(client)
                .or_default()
                .push(StreamResponse { id, response });
        }

        for (client, responses) in batches {
            let Some(stream) = self.stream_clients.get_mut(&client) else {
                continue;
            };
            let count = responses.len();
            if let Err(e) = stream.channel.send(&StreamMessage { responses }) {
                debug!("Failed to send stream update to {}: {}", stream.channel.address(), e);
                stream.channel.close();
            } else {
                debug!("Sent {} stream results to {}", count, stream.channel.address());
            }
        }

        self.stats.record_stream_update(executed, started.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use crate::codec::{MessageKind, TypeDesc, Value};
    use crate::config::ServerConfig;
    use crate::messages::{Message, Request};
    use crate::server::test_support::*;
    use crate::service::{CallOutcome, ProcedureSignature, ServiceRegistry};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn counter_services(counter: Arc<AtomicU32>) -> ServiceRegistry {
        let mut services = ServiceRegistry::new();
        services
            .register_fn(
                ProcedureSignature::new("Test", "Counter").returns(TypeDesc::UInt32),
                move |_, _| CallOutcome::value(counter.fetch_add(1, Ordering::SeqCst)),
            )
            .unwrap();
        services
            .register_fn(
                ProcedureSignature::new("Test", "Constant").returns(TypeDesc::UInt32),
                |_, _| CallOutcome::value(7u32),
            )
            .unwrap();
        services
    }

    fn add_stream_args(procedure: &str) -> Vec<(Value, TypeDesc)> {
        vec![(
            Value::from(Message::Request(Request::new("Test", procedure))),
            TypeDesc::Message(MessageKind::Request),
        )]
    }

    fn stream_config(only_changes: bool) -> ServerConfig {
        let mut config = TestServer::quick_config();
        config.stream_only_changes = only_changes;
        config
    }

    #[test]
    fn test_add_stream_requires_stream_connection() {
        let mut server = TestServer::new(stream_config(false), counter_services(Arc::default()));
        let mut client = server.connect("Jeb");
        client.call("KRPC", "AddStream", &add_stream_args("Counter"));
        server.core.update();
        assert_eq!(
            client.responses()[0].error.as_deref(),
            Some("No stream client is connected for this RPC client")
        );
    }

    #[test]
    fn test_stream_results_every_tick() {
        let mut server = TestServer::new(stream_config(false), counter_services(Arc::default()));
        let mut client = server.connect("Jeb");
        let mut stream = server.connect_stream(&client);

        client.call("KRPC", "AddStream", &add_stream_args("Counter"));
        client.call("KRPC", "AddStream", &add_stream_args("Constant"));
        client.call("KRPC", "AddStream", &add_stream_args("Counter"));
        server.core.update();
        let ids: Vec<Option<Vec<u8>>> = client
            .responses()
            .into_iter()
            .map(|r| r.return_value)
            .collect();
        // The repeated subscription returns the existing id.
        assert_eq!(ids, vec![Some(vec![1]), Some(vec![2]), Some(vec![1])]);

        let messages = stream.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].responses.len(), 2);
        assert_eq!(messages[0].responses[0].id, 1);

        server.core.update();
        let messages = stream.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].responses[0].response.return_value, Some(vec![1]));
        assert_eq!(messages[0].responses[1].response.return_value, Some(vec![7]));
        assert_eq!(server.core.status().stream_rpcs, 2);

        client.call("KRPC", "RemoveStream", &[(Value::UInt32(1), TypeDesc::UInt32)]);
        client.call("KRPC", "RemoveStream", &[(Value::UInt32(1), TypeDesc::UInt32)]);
        server.core.update();
        assert_eq!(client.responses().len(), 2);
        let messages = stream.messages();
        assert_eq!(messages[0].responses.len(), 1);
        assert_eq!(messages[0].responses[0].id, 2);
    }

    #[test]
    fn test_only_changes_suppresses_repeats() {
        let mut server = TestServer::new(stream_config(true), counter_services(Arc::default()));
        let mut client = server.connect("Jeb");
        let mut stream = server.connect_stream(&client);
        client.call("KRPC", "AddStream", &add_stream_args("Counter"));
        client.call("KRPC", "AddStream", &add_stream_args("Constant"));
        server.core.set_universal_time(1.0);
        server.core.update();
        assert_eq!(stream.messages()[0].responses.len(), 2);

        server.core.set_universal_time(2.0);
        server.core.update();
        let messages = stream.messages();
        assert_eq!(messages[0].responses.len(), 1);
        assert_eq!(messages[0].responses[0].id, 1);
    }

    #[test]
    fn test_stream_client_disconnect_drops_subscriptions() {
        let mut server = TestServer::new(stream_config(false), counter_services(Arc::default()));
        let mut client = server.connect("Jeb");
        let stream = server.connect_stream(&client);
        client.call("KRPC", "AddStream", &add_stream_args("Constant"));
        server.core.update();
        assert_eq!(client.responses().len(), 1);
        assert_eq!(server.core.status().stream_rpcs, 1);

        stream.transport.close();
        server.core.update();
        assert_eq!(server.core.status().stream_rpcs, 0);
        assert!(!server.core.clients()[0].stream_connected);
    }
}
