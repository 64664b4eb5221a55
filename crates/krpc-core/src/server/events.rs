use crate::protocol::ClientId;

/// Snapshot of a connected RPC client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: ClientId,
    pub name: String,
    pub address: String,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub stream_connected: bool,
}

/// Notifications delivered to observers installed with `Core::subscribe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Started,
    Stopped,
    ClientConnected(ClientInfo),
    /// A request was received from the client.
    ClientActivity(ClientId),
    ClientDisconnected(ClientInfo),
}
