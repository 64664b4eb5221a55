//! Server context and update loop.
//!
//! [`Core`] owns every piece of server state: listeners, pending handshakes,
//! connected clients, the procedure table, the object registry, stream
//! subscriptions and statistics. The host calls [`Core::update`] once per
//! frame; all engine work happens inside that call.
//!
//! # Threading
//!
//! `Core` is driven from a single thread. Transports may do their IO on other
//! threads (the TCP transport uses tokio tasks), but they only exchange bytes
//! with the engine through non-blocking channels.

mod connections;
mod events;
mod streams;
mod update;

pub use events::{ClientInfo, ServerEvent};

use crate::channel::{RequestChannel, StreamChannel};
use crate::config::{ProtocolConfig, ServerConfig};
use crate::messages::{Response, Status};
use crate::protocol::{ClientId, ConnectionAttempt, Decision, Handshake};
use crate::registry::ObjectRegistry;
use crate::scheduler::RoundRobinScheduler;
use crate::service::{register_krpc_service, ServiceRegistry};
use crate::stats::Stats;
use crate::stream::StreamManager;
use crate::transport::tcp::TcpListener;
use crate::transport::Listener;
use crate::Result;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, info};
use update::RequestContinuation;

/// Policy hook consulted for every connection attempt.
pub type ConnectionHook = Box<dyn Fn(&ConnectionAttempt) -> Decision + Send>;

/// Observer of [`ServerEvent`]s.
pub type EventObserver = Box<dyn Fn(&ServerEvent) + Send>;

struct RpcClient {
    name: String,
    channel: RequestChannel,
}

struct StreamClient {
    channel: StreamChannel,
}

/// Accepted connection still completing its handshake.
struct PendingConnection {
    handshake: Handshake,
    /// Identifier offered to an RPC client if it is allowed.
    assigned: ClientId,
}

/// The server context.
pub struct Core {
    config: ServerConfig,
    services: ServiceRegistry,
    objects: ObjectRegistry,
    rpc_listener: Box<dyn Listener>,
    stream_listener: Box<dyn Listener>,
    pending: Vec<PendingConnection>,
    clients: HashMap<ClientId, RpcClient>,
    stream_clients: HashMap<ClientId, StreamClient>,
    scheduler: RoundRobinScheduler<ClientId>,
    continuations: Vec<RequestContinuation>,
    streams: StreamManager,
    stats: Stats,
    status: Status,
    universal_time: f64,
    tick: u64,
    last_update: Option<Instant>,
    hooks: Vec<ConnectionHook>,
    observers: Vec<EventObserver>,
}

impl Core {
    /// Create a server over the given listeners. The `KRPC` service is
    /// added to `services` here.
    pub fn new(
        config: ServerConfig,
        mut services: ServiceRegistry,
        rpc_listener: Box<dyn Listener>,
        stream_listener: Box<dyn Listener>,
    ) -> Result<Self> {
        config.validate()?;
        register_krpc_service(&mut services)?;
        Ok(Self {
            config,
            services,
            objects: ObjectRegistry::new(),
            rpc_listener,
            stream_listener,
            pending: Vec::new(),
            clients: HashMap::new(),
            stream_clients: HashMap::new(),
            scheduler: RoundRobinScheduler::new(),
            continuations: Vec::new(),
            streams: StreamManager::new(),
            stats: Stats::default(),
            status: Status::default(),
            universal_time: 0.0,
            tick: 0,
            last_update: None,
            hooks: Vec::new(),
            observers: Vec::new(),
        })
    }

    /// Create a server listening on TCP at the configured address and ports.
    pub fn with_tcp(config: ServerConfig, services: ServiceRegistry) -> Result<Self> {
        let rpc = TcpListener::new("RPC", config.address.clone(), config.rpc_port);
        let stream = TcpListener::new("Stream", config.address.clone(), config.stream_port);
        Self::new(config, services, Box::new(rpc), Box::new(stream))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running() {
            return Ok(());
        }
        self.rpc_listener.start()?;
        if let Err(e) = self.stream_listener.start() {
            self.rpc_listener.stop();
            return Err(e);
        }
        self.tick = 0;
        self.last_update = None;
        info!(
            "Server started (rpc {}, stream {})",
            describe_addr(self.rpc_listener.local_addr()),
            describe_addr(self.stream_listener.local_addr())
        );
        self.emit(&ServerEvent::Started);
        Ok(())
    }

    /// Disconnect every client and return to a clean state. Object handles
    /// issued before the stop are invalid afterwards.
    pub fn stop(&mut self) {
        if !self.running() {
            return;
        }
        let ids: Vec<ClientId> = self.clients.keys().copied().collect();
        for id in ids {
            self.disconnect_client(id);
        }
        for pending in self.pending.drain(..) {
            debug!("Dropping pending connection from {}", pending.handshake.address());
        }
        for (_, mut stream) in self.stream_clients.drain() {
            stream.channel.close();
        }
        self.rpc_listener.stop();
        self.stream_listener.stop();
        self.continuations.clear();
        self.streams.clear();
        self.objects.reset();
        self.stats.clear();
        self.status = Status::default();
        info!("Server stopped");
        self.emit(&ServerEvent::Stopped);
    }

    pub fn running(&self) -> bool {
        self.rpc_listener.running() && self.stream_listener.running()
    }

    pub fn rpc_address(&self) -> Option<SocketAddr> {
        self.rpc_listener.local_addr()
    }

    pub fn stream_address(&self) -> Option<SocketAddr> {
        self.stream_listener.local_addr()
    }

    /// Set the simulation time reported in every Response.
    pub fn set_universal_time(&mut self, time: f64) {
        self.universal_time = time;
    }

    pub fn universal_time(&self) -> f64 {
        self.universal_time
    }

    pub fn add_connection_hook<F>(&mut self, hook: F)
    where
        F: Fn(&ConnectionAttempt) -> Decision + Send + 'static,
    {
        self.hooks.push(Box::new(hook));
    }

    pub fn subscribe<F>(&mut self, observer: F)
    where
        F: Fn(&ServerEvent) + Send + 'static,
    {
        self.observers.push(Box::new(observer));
    }

    fn emit(&self, event: &ServerEvent) {
        for observer in &self.observers {
            observer(event);
        }
    }

    /// Connected RPC clients, ordered by identifier.
    pub fn clients(&self) -> Vec<ClientInfo> {
        let mut clients: Vec<ClientInfo> = self
            .clients
            .keys()
            .filter_map(|id| self.client_info(*id))
            .collect();
        clients.sort_by_key(|c| c.id);
        clients
    }

    fn client_info(&self, id: ClientId) -> Option<ClientInfo> {
        let client = self.clients.get(&id)?;
        Some(ClientInfo {
            id,
            name: client.name.clone(),
            address: client.channel.address(),
            bytes_read: client.channel.bytes_read(),
            bytes_written: client.channel.bytes_written(),
            stream_connected: self.stream_clients.contains_key(&id),
        })
    }

    pub fn clear_stats(&mut self) {
        self.stats.clear();
    }

    /// Total bytes (read, written) across live and closed connections.
    fn byte_totals(&self) -> (u64, u64) {
        let mut read = self.stats.closed_bytes_read;
        let mut written = self.stats.closed_bytes_written;
        for client in self.clients.values() {
            read += client.channel.bytes_read();
            written += client.channel.bytes_written();
        }
        for client in self.stream_clients.values() {
            read += client.channel.bytes_read();
            written += client.channel.bytes_written();
        }
        (read, written)
    }

    /// Current server status, as returned by `KRPC.GetStatus`.
    pub fn status(&self) -> Status {
        let (bytes_read, bytes_written) = self.byte_totals();
        let update = &self.config.update;
        let stats = &self.stats;
        Status {
            version: ProtocolConfig::VERSION.to_string(),
            bytes_read,
            bytes_written,
            bytes_read_rate: stats.bytes_read_rate.value(),
            bytes_written_rate: stats.bytes_written_rate.value(),
            rpcs_executed: stats.rpcs_executed,
            rpc_rate: stats.rpc_rate.value(),
            one_rpc_per_update: update.one_rpc_per_update,
            max_time_per_update: update.max_time_per_update_us,
            adaptive_rate_control: update.adaptive_rate_control,
            blocking_recv: update.blocking_recv,
            recv_timeout: update.recv_timeout_us,
            time_per_rpc_update: stats.time_per_rpc_update.value(),
            poll_time_per_rpc_update: stats.poll_time_per_rpc_update.value(),
            exec_time_per_rpc_update: stats.exec_time_per_rpc_update.value(),
            stream_rpcs: u32::try_from(self.streams.len()).unwrap_or(u32::MAX),
            stream_rpcs_executed: stats.stream_rpcs_executed,
            stream_rpc_rate: stats.stream_rpc_rate.value(),
            time_per_stream_update: stats.time_per_stream_update.value(),
        }
    }

    /// Tear down an RPC client along with its stream connection,
    /// continuations and subscriptions.
    fn disconnect_client(&mut self, id: ClientId) {
        let info = self.client_info(id);
        if let Some(mut client) = self.clients.remove(&id) {
            client.channel.close();
            self.stats.closed_bytes_read += client.channel.bytes_read();
            self.stats.closed_bytes_written += client.channel.bytes_written();
        }
        let _ = self.scheduler.remove(&id);
        self.continuations.retain(|c| c.client != id);
        self.disconnect_stream_client(id);
        if let Some(info) = info {
            info!("Client {} ({}) disconnected", info.name, info.address);
            self.emit(&ServerEvent::ClientDisconnected(info));
        }
    }

    fn disconnect_stream_client(&mut self, id: ClientId) {
        if let Some(mut stream) = self.stream_clients.remove(&id) {
            stream.channel.close();
            self.stats.closed_bytes_read += stream.channel.bytes_read();
            self.stats.closed_bytes_written += stream.channel.bytes_written();
            let removed = self.streams.remove_client(id);
            debug!(
                "Stream client {} disconnected ({} subscriptions removed)",
                stream.channel.address(),
                removed
            );
        }
    }

    /// Format a procedure failure for a Response.
    fn error_text(&self, procedure: &str, message: String) -> String {
        if self.config.verbose_errors {
            format!("{}: {}", procedure, message)
        } else {
            message
        }
    }

    fn send_response(&mut self, id: ClientId, response: &Response) {
        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        match client.channel.send_response(response) {
            Ok(()) => match &response.error {
                Some(error) => debug!(
                    "Sent error response to client {} ({})",
                    client.channel.address(),
                    error
                ),
                None => debug!("Sent response to client {}", client.channel.address()),
            },
            Err(e) => {
                debug!("Failed to send response to {}: {}", client.channel.address(), e);
                client.channel.close();
            }
        }
    }

    /// Run one tick: accept and verify connections, serve requests within
    /// the time budget, then evaluate every stream subscription.
    pub fn update(&mut self) {
        if !self.running() {
            return;
        }
        let now = Instant::now();
        let frame_time = self.last_update.map(|last| now.duration_since(last));
        self.last_update = Some(now);
        self.tick += 1;

        let start_rpcs = self.stats.rpcs_executed;
        let start_stream_rpcs = self.stats.stream_rpcs_executed;
        let (start_read, start_written) = self.byte_totals();

        self.update_connections(now);
        self.status = self.status();

        let sample = self.update_rpc();
        self.stats.record_rpc_update(sample);
        self.update_streams();

        if let Some(frame_time) = frame_time {
            let (read, written) = self.byte_totals();
            self.stats.record_rates(
                frame_time,
                self.stats.rpcs_executed - start_rpcs,
                self.stats.stream_rpcs_executed - start_stream_rpcs,
                read.saturating_sub(start_read),
                written.saturating_sub(start_written),
            );
            if self.config.update.adaptive_rate_control {
                let current = self.config.update.max_time_per_update_us;
                let adjusted = update::adjust_budget(current, frame_time, self.stats.last_exec_time);
                if adjusted != current {
                    debug!("MaxTimePerUpdate {}us -> {}us", current, adjusted);
                    self.config.update.max_time_per_update_us = adjusted;
                }
            }
        }
    }
}

fn describe_addr(addr: Option<SocketAddr>) -> String {
    addr.map(|a| a.to_string())
        .unwrap_or_else(|| "in-process".to_string())
}

impl Drop for Core {
    fn drop(&mut self) {
        self.stop();
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::codec::{decode, MessageKind, TypeDesc, Value};
    use crate::messages::{Services, WireMessage};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_get_status() {
        let mut server = TestServer::new(TestServer::quick_config(), ServiceRegistry::new());
        let mut client = server.connect("Jeb");
        server.core.set_universal_time(42.5);
        client.call("KRPC", "GetStatus", &[]);
        server.core.update();

        let responses = client.responses();
        assert_eq!(responses.len(), 1);
        let response = &responses[0];
        assert!(!response.has_error());
        assert_eq!(response.time, 42.5);
        let status = Status::decode(response.return_value.as_ref().unwrap()).unwrap();
        assert_eq!(status.version, ProtocolConfig::VERSION);
        assert_eq!(status.max_time_per_update, 5000);
        assert!(status.bytes_read > 0);
    }

    #[test]
    fn test_get_services_lists_krpc() {
        let mut server = TestServer::new(TestServer::quick_config(), ServiceRegistry::new());
        let mut client = server.connect("Jeb");
        client.call("KRPC", "GetServices", &[]);
        server.core.update();

        let response = client.responses().remove(0);
        let value = decode(
            response.return_value.as_ref().unwrap(),
            &TypeDesc::Message(MessageKind::Services),
            &ObjectRegistry::new(),
        )
        .unwrap();
        let services = match value.as_message() {
            Some(crate::messages::Message::Services(services)) => services.clone(),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(services, Services::decode(response.return_value.as_ref().unwrap()).unwrap());
        assert_eq!(services.services[0].name, "KRPC");
    }

    #[test]
    fn test_unknown_procedure_is_error_response() {
        let mut server = TestServer::new(TestServer::quick_config(), ServiceRegistry::new());
        let mut client = server.connect("Jeb");
        client.call("KRPC", "Launch", &[]);
        client.call("Nope", "Launch", &[]);
        server.core.update();

        let responses = client.responses();
        assert_eq!(responses.len(), 2);
        assert_eq!(
            responses[0].error.as_deref(),
            Some("Procedure Launch not found, in Service KRPC")
        );
        assert_eq!(responses[1].error.as_deref(), Some("Service Nope not found"));
        assert_eq!(server.core.clients().len(), 1);
    }

    #[test]
    fn test_verbose_errors_name_procedure() {
        let mut services = ServiceRegistry::new();
        services
            .register_fn(
                crate::service::ProcedureSignature::new("S", "Fail"),
                |_, _| crate::service::CallOutcome::fault("boom"),
            )
            .unwrap();
        let mut config = TestServer::quick_config();
        config.verbose_errors = true;
        let mut server = TestServer::new(config, services);
        let mut client = server.connect("Jeb");
        client.call("S", "Fail", &[]);
        server.core.update();
        assert_eq!(client.responses()[0].error.as_deref(), Some("S.Fail: boom"));
    }

    #[test]
    fn test_malformed_request_closes_connection() {
        let mut server = TestServer::new(TestServer::quick_config(), ServiceRegistry::new());
        let client = server.connect("Jeb");
        // length 2, then a tag with field number 0
        client.transport.send(&[0x02, 0x00, 0x00]);
        server.core.update();
        server.core.update();
        assert!(client.transport.is_closed());
        assert!(server.core.clients().is_empty());
    }

    #[test]
    fn test_events_and_client_list() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut server = TestServer::new(TestServer::quick_config(), ServiceRegistry::new());
        let sink = events.clone();
        server
            .core
            .subscribe(move |event| sink.lock().unwrap().push(event.clone()));

        let client = server.connect("Bill");
        let clients = server.core.clients();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].name, "Bill");
        assert_eq!(clients[0].id, client.id);
        assert!(!clients[0].stream_connected);

        client.call("KRPC", "GetStatus", &[]);
        server.core.update();
        client.transport.close();
        server.core.update();
        assert!(server.core.clients().is_empty());

        let events = events.lock().unwrap();
        assert!(matches!(events[0], ServerEvent::ClientConnected(ref info) if info.name == "Bill"));
        assert_eq!(events[1], ServerEvent::ClientActivity(client.id));
        assert!(matches!(events[2], ServerEvent::ClientDisconnected(ref info) if info.id == client.id));
    }

    #[test]
    fn test_stop_resets_state() {
        let mut services = ServiceRegistry::new();
        let vessel = crate::codec::ObjectRef::new("vessel");
        services
            .register_fn(
                crate::service::ProcedureSignature::new("S", "Vessel")
                    .returns(TypeDesc::class("S.Vessel")),
                move |_, _| crate::service::CallOutcome::value(Value::object(vessel.clone())),
            )
            .unwrap();
        let mut server = TestServer::new(TestServer::quick_config(), services);
        let mut client = server.connect("Jeb");
        client.call("S", "Vessel", &[]);
        server.core.update();
        assert_eq!(client.responses()[0].return_value, Some(vec![0x01]));
        assert_eq!(server.core.objects.len(), 1);
        assert!(server.core.status().rpcs_executed > 0);

        server.core.stop();
        assert!(!server.core.running());
        assert!(client.transport.is_closed());
        assert!(server.core.objects.is_empty());
        assert_eq!(server.core.status().rpcs_executed, 0);

        server.core.start().unwrap();
        assert!(server.core.running());
        let mut client = server.connect("Jeb");
        client.call("S", "Vessel", &[]);
        server.core.update();
        // Handles are not reissued after a reset.
        assert_eq!(client.responses()[0].return_value, Some(vec![0x02]));
    }
}
