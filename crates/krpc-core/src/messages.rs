//! Protocol messages and their wire form.
//!
//! Fields use proto3 conventions: scalar fields holding their default value
//! are omitted on encode, and unknown fields are skipped on decode.
//!
//! ```text
//! Request        { 1: service, 2: procedure, 3: repeated Argument }
//! Argument       { 1: position (uint32), 2: value (bytes) }
//! Response       { 1: time (double), 2: has_error, 3: error,
//!                  4: has_return_value, 5: return_value (bytes) }
//! StreamMessage  { 1: repeated StreamResponse }
//! StreamResponse { 1: id (uint32), 2: response (Response) }
//! ```

use crate::codec::types::MessageKind;
use crate::codec::wire::{
    expect_wire_type, put_bool_field, put_bytes_field, put_double_field, put_float_field,
    put_string_field, put_varint_field, zigzag_decode32, zigzag_encode32, WireReader, WireType,
};
use crate::protocol::ConnectionStatus;
use crate::CodecError;

/// Encoding and decoding of a message body (without a length prefix).
pub trait WireMessage: Sized {
    fn encode_to(&self, buf: &mut Vec<u8>);

    fn decode(bytes: &[u8]) -> Result<Self, CodecError>;

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_to(&mut buf);
        buf
    }
}

fn put_message_field<M: WireMessage>(buf: &mut Vec<u8>, field: u32, message: &M) {
    put_bytes_field(buf, field, &message.encode());
}

fn read_nested<M: WireMessage>(
    reader: &mut WireReader<'_>,
    field: u32,
    wire_type: WireType,
) -> Result<M, CodecError> {
    expect_wire_type(field, wire_type, WireType::LengthDelimited)?;
    M::decode(reader.read_length_delimited()?)
}

fn read_string(
    reader: &mut WireReader<'_>,
    field: u32,
    wire_type: WireType,
) -> Result<String, CodecError> {
    expect_wire_type(field, wire_type, WireType::LengthDelimited)?;
    reader.read_string()
}

fn read_bytes(
    reader: &mut WireReader<'_>,
    field: u32,
    wire_type: WireType,
) -> Result<Vec<u8>, CodecError> {
    expect_wire_type(field, wire_type, WireType::LengthDelimited)?;
    Ok(reader.read_length_delimited()?.to_vec())
}

fn read_bool(
    reader: &mut WireReader<'_>,
    field: u32,
    wire_type: WireType,
) -> Result<bool, CodecError> {
    expect_wire_type(field, wire_type, WireType::Varint)?;
    reader.read_bool()
}

fn read_u32(reader: &mut WireReader<'_>, field: u32, wire_type: WireType) -> Result<u32, CodecError> {
    expect_wire_type(field, wire_type, WireType::Varint)?;
    reader.read_varint_u32()
}

fn read_u64(reader: &mut WireReader<'_>, field: u32, wire_type: WireType) -> Result<u64, CodecError> {
    expect_wire_type(field, wire_type, WireType::Varint)?;
    reader.read_varint()
}

fn read_f32(reader: &mut WireReader<'_>, field: u32, wire_type: WireType) -> Result<f32, CodecError> {
    expect_wire_type(field, wire_type, WireType::Fixed32)?;
    reader.read_f32()
}

fn put_string_nonempty(buf: &mut Vec<u8>, field: u32, value: &str) {
    if !value.is_empty() {
        put_string_field(buf, field, value);
    }
}

fn put_u64_nonzero(buf: &mut Vec<u8>, field: u32, value: u64) {
    if value != 0 {
        put_varint_field(buf, field, value);
    }
}

fn put_f32_nonzero(buf: &mut Vec<u8>, field: u32, value: f32) {
    if value != 0.0 {
        put_float_field(buf, field, value);
    }
}

fn put_bool_set(buf: &mut Vec<u8>, field: u32, value: bool) {
    if value {
        put_bool_field(buf, field, true);
    }
}

/// Argument of a procedure call: its position and encoded value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
    pub position: u32,
    pub value: Vec<u8>,
}

impl WireMessage for Argument {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        put_u64_nonzero(buf, 1, u64::from(self.position));
        if !self.value.is_empty() {
            put_bytes_field(buf, 2, &self.value);
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut argument = Argument {
            position: 0,
            value: Vec::new(),
        };
        let mut reader = WireReader::new(bytes);
        while !reader.is_empty() {
            let (field, wire_type) = reader.read_tag()?;
            match field {
                1 => argument.position = read_u32(&mut reader, field, wire_type)?,
                2 => argument.value = read_bytes(&mut reader, field, wire_type)?,
                _ => reader.skip(wire_type)?,
            }
        }
        Ok(argument)
    }
}

/// A call to a single procedure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub service: String,
    pub procedure: String,
    pub arguments: Vec<Argument>,
}

impl Request {
    pub fn new(service: impl Into<String>, procedure: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            procedure: procedure.into(),
            arguments: Vec::new(),
        }
    }

    /// Append an already-encoded argument.
    pub fn with_argument(mut self, position: u32, value: Vec<u8>) -> Self {
        self.arguments.push(Argument { position, value });
        self
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.service, self.procedure)
    }
}

impl WireMessage for Request {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        put_string_nonempty(buf, 1, &self.service);
        put_string_nonempty(buf, 2, &self.procedure);
        for argument in &self.arguments {
            put_message_field(buf, 3, argument);
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut request = Request::default();
        let mut reader = WireReader::new(bytes);
        while !reader.is_empty() {
            let (field, wire_type) = reader.read_tag()?;
            match field {
                1 => request.service = read_string(&mut reader, field, wire_type)?,
                2 => request.procedure = read_string(&mut reader, field, wire_type)?,
                3 => request
                    .arguments
                    .push(read_nested(&mut reader, field, wire_type)?),
                _ => reader.skip(wire_type)?,
            }
        }
        Ok(request)
    }
}

/// Result of a call. At most one of `error` and `return_value` is set;
/// neither means a void success.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    pub time: f64,
    pub error: Option<String>,
    pub return_value: Option<Vec<u8>>,
}

impl Response {
    pub fn success(time: f64, return_value: Option<Vec<u8>>) -> Self {
        Self {
            time,
            error: None,
            return_value,
        }
    }

    pub fn error(time: f64, message: impl Into<String>) -> Self {
        Self {
            time,
            error: Some(message.into()),
            return_value: None,
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn has_return_value(&self) -> bool {
        self.return_value.is_some()
    }
}

impl WireMessage for Response {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        if self.time != 0.0 {
            put_double_field(buf, 1, self.time);
        }
        if let Some(error) = &self.error {
            put_bool_field(buf, 2, true);
            put_string_field(buf, 3, error);
        }
        if let Some(value) = &self.return_value {
            put_bool_field(buf, 4, true);
            put_bytes_field(buf, 5, value);
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut time = 0.0;
        let mut has_error = false;
        let mut error = String::new();
        let mut has_return_value = false;
        let mut return_value = Vec::new();
        let mut reader = WireReader::new(bytes);
        while !reader.is_empty() {
            let (field, wire_type) = reader.read_tag()?;
            match field {
                1 => {
                    expect_wire_type(field, wire_type, WireType::Fixed64)?;
                    time = reader.read_f64()?;
                }
                2 => has_error = read_bool(&mut reader, field, wire_type)?,
                3 => error = read_string(&mut reader, field, wire_type)?,
                4 => has_return_value = read_bool(&mut reader, field, wire_type)?,
                5 => return_value = read_bytes(&mut reader, field, wire_type)?,
                _ => reader.skip(wire_type)?,
            }
        }
        if has_error && has_return_value {
            return Err(CodecError::malformed(
                "response has both an error and a return value",
            ));
        }
        Ok(Response {
            time,
            error: has_error.then_some(error),
            return_value: has_return_value.then_some(return_value),
        })
    }
}

/// One subscription's result within a stream batch.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamResponse {
    pub id: u32,
    pub response: Response,
}

impl WireMessage for StreamResponse {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        put_u64_nonzero(buf, 1, u64::from(self.id));
        put_message_field(buf, 2, &self.response);
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut id = 0;
        let mut response = Response::default();
        let mut reader = WireReader::new(bytes);
        while !reader.is_empty() {
            let (field, wire_type) = reader.read_tag()?;
            match field {
                1 => id = read_u32(&mut reader, field, wire_type)?,
                2 => response = read_nested(&mut reader, field, wire_type)?,
                _ => reader.skip(wire_type)?,
            }
        }
        Ok(StreamResponse { id, response })
    }
}

/// Batch of stream results written to one client per tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamMessage {
    pub responses: Vec<StreamResponse>,
}

impl WireMessage for StreamMessage {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        for response in &self.responses {
            put_message_field(buf, 1, response);
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut message = StreamMessage::default();
        let mut reader = WireReader::new(bytes);
        while !reader.is_empty() {
            let (field, wire_type) = reader.read_tag()?;
            match field {
                1 => message
                    .responses
                    .push(read_nested(&mut reader, field, wire_type)?),
                _ => reader.skip(wire_type)?,
            }
        }
        Ok(message)
    }
}

/// Server information returned by `KRPC.GetStatus`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Status {
    pub version: String,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub bytes_read_rate: f32,
    pub bytes_written_rate: f32,
    pub rpcs_executed: u64,
    pub rpc_rate: f32,
    pub one_rpc_per_update: bool,
    pub max_time_per_update: u32,
    pub adaptive_rate_control: bool,
    pub blocking_recv: bool,
    pub recv_timeout: u32,
    pub time_per_rpc_update: f32,
    pub poll_time_per_rpc_update: f32,
    pub exec_time_per_rpc_update: f32,
    pub stream_rpcs: u32,
    pub stream_rpcs_executed: u64,
    pub stream_rpc_rate: f32,
    pub time_per_stream_update: f32,
}

impl WireMessage for Status {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        put_string_nonempty(buf, 1, &self.version);
        put_u64_nonzero(buf, 2, self.bytes_read);
        put_u64_nonzero(buf, 3, self.bytes_written);
        put_f32_nonzero(buf, 4, self.bytes_read_rate);
        put_f32_nonzero(buf, 5, self.bytes_written_rate);
        put_u64_nonzero(buf, 6, self.rpcs_executed);
        put_f32_nonzero(buf, 7, self.rpc_rate);
        put_bool_set(buf, 8, self.one_rpc_per_update);
        put_u64_nonzero(buf, 9, u64::from(self.max_time_per_update));
        put_bool_set(buf, 10, self.adaptive_rate_control);
        put_bool_set(buf, 11, self.blocking_recv);
        put_u64_nonzero(buf, 12, u64::from(self.recv_timeout));
        put_f32_nonzero(buf, 13, self.time_per_rpc_update);
        put_f32_nonzero(buf, 14, self.poll_time_per_rpc_update);
        put_f32_nonzero(buf, 15, self.exec_time_per_rpc_update);
        put_u64_nonzero(buf, 16, u64::from(self.stream_rpcs));
        put_u64_nonzero(buf, 17, self.stream_rpcs_executed);
        put_f32_nonzero(buf, 18, self.stream_rpc_rate);
        put_f32_nonzero(buf, 19, self.time_per_stream_update);
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut status = Status::default();
        let mut reader = WireReader::new(bytes);
        while !reader.is_empty() {
            let (field, wire_type) = reader.read_tag()?;
            let r = &mut reader;
            match field {
                1 => status.version = read_string(r, field, wire_type)?,
                2 => status.bytes_read = read_u64(r, field, wire_type)?,
                3 => status.bytes_written = read_u64(r, field, wire_type)?,
                4 => status.bytes_read_rate = read_f32(r, field, wire_type)?,
                5 => status.bytes_written_rate = read_f32(r, field, wire_type)?,
                6 => status.rpcs_executed = read_u64(r, field, wire_type)?,
                7 => status.rpc_rate = read_f32(r, field, wire_type)?,
                8 => status.one_rpc_per_update = read_bool(r, field, wire_type)?,
                9 => status.max_time_per_update = read_u32(r, field, wire_type)?,
                10 => status.adaptive_rate_control = read_bool(r, field, wire_type)?,
                11 => status.blocking_recv = read_bool(r, field, wire_type)?,
                12 => status.recv_timeout = read_u32(r, field, wire_type)?,
                13 => status.time_per_rpc_update = read_f32(r, field, wire_type)?,
                14 => status.poll_time_per_rpc_update = read_f32(r, field, wire_type)?,
                15 => status.exec_time_per_rpc_update = read_f32(r, field, wire_type)?,
                16 => status.stream_rpcs = read_u32(r, field, wire_type)?,
                17 => status.stream_rpcs_executed = read_u64(r, field, wire_type)?,
                18 => status.stream_rpc_rate = read_f32(r, field, wire_type)?,
                19 => status.time_per_stream_update = read_f32(r, field, wire_type)?,
                _ => r.skip(wire_type)?,
            }
        }
        Ok(status)
    }
}

/// Parameter description in a [`ProcedureInfo`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterInfo {
    pub name: String,
    pub type_name: String,
    /// Encoded default value, when the parameter is optional.
    pub default_value: Option<Vec<u8>>,
}

impl WireMessage for ParameterInfo {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        put_string_nonempty(buf, 1, &self.name);
        put_string_nonempty(buf, 2, &self.type_name);
        if let Some(default) = &self.default_value {
            put_bool_field(buf, 3, true);
            put_bytes_field(buf, 4, default);
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut info = ParameterInfo::default();
        let mut has_default = false;
        let mut default = Vec::new();
        let mut reader = WireReader::new(bytes);
        while !reader.is_empty() {
            let (field, wire_type) = reader.read_tag()?;
            match field {
                1 => info.name = read_string(&mut reader, field, wire_type)?,
                2 => info.type_name = read_string(&mut reader, field, wire_type)?,
                3 => has_default = read_bool(&mut reader, field, wire_type)?,
                4 => default = read_bytes(&mut reader, field, wire_type)?,
                _ => reader.skip(wire_type)?,
            }
        }
        info.default_value = has_default.then_some(default);
        Ok(info)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcedureInfo {
    pub name: String,
    pub parameters: Vec<ParameterInfo>,
    pub return_type: Option<String>,
    pub attributes: Vec<String>,
    pub documentation: String,
}

impl WireMessage for ProcedureInfo {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        put_string_nonempty(buf, 1, &self.name);
        for parameter in &self.parameters {
            put_message_field(buf, 2, parameter);
        }
        if let Some(return_type) = &self.return_type {
            put_bool_field(buf, 3, true);
            put_string_field(buf, 4, return_type);
        }
        for attribute in &self.attributes {
            put_string_field(buf, 5, attribute);
        }
        put_string_nonempty(buf, 6, &self.documentation);
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut info = ProcedureInfo::default();
        let mut has_return_type = false;
        let mut return_type = String::new();
        let mut reader = WireReader::new(bytes);
        while !reader.is_empty() {
            let (field, wire_type) = reader.read_tag()?;
            match field {
                1 => info.name = read_string(&mut reader, field, wire_type)?,
                2 => info
                    .parameters
                    .push(read_nested(&mut reader, field, wire_type)?),
                3 => has_return_type = read_bool(&mut reader, field, wire_type)?,
                4 => return_type = read_string(&mut reader, field, wire_type)?,
                5 => info
                    .attributes
                    .push(read_string(&mut reader, field, wire_type)?),
                6 => info.documentation = read_string(&mut reader, field, wire_type)?,
                _ => reader.skip(wire_type)?,
            }
        }
        info.return_type = has_return_type.then_some(return_type);
        Ok(info)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassInfo {
    pub name: String,
    pub documentation: String,
}

impl WireMessage for ClassInfo {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        put_string_nonempty(buf, 1, &self.name);
        put_string_nonempty(buf, 2, &self.documentation);
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut info = ClassInfo::default();
        let mut reader = WireReader::new(bytes);
        while !reader.is_empty() {
            let (field, wire_type) = reader.read_tag()?;
            match field {
                1 => info.name = read_string(&mut reader, field, wire_type)?,
                2 => info.documentation = read_string(&mut reader, field, wire_type)?,
                _ => reader.skip(wire_type)?,
            }
        }
        Ok(info)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnumerationValueInfo {
    pub name: String,
    pub value: i32,
    pub documentation: String,
}

impl WireMessage for EnumerationValueInfo {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        put_string_nonempty(buf, 1, &self.name);
        put_u64_nonzero(buf, 2, u64::from(zigzag_encode32(self.value)));
        put_string_nonempty(buf, 3, &self.documentation);
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut info = EnumerationValueInfo::default();
        let mut reader = WireReader::new(bytes);
        while !reader.is_empty() {
            let (field, wire_type) = reader.read_tag()?;
            match field {
                1 => info.name = read_string(&mut reader, field, wire_type)?,
                2 => info.value = zigzag_decode32(read_u32(&mut reader, field, wire_type)?),
                3 => info.documentation = read_string(&mut reader, field, wire_type)?,
                _ => reader.skip(wire_type)?,
            }
        }
        Ok(info)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnumerationInfo {
    pub name: String,
    pub values: Vec<EnumerationValueInfo>,
    pub documentation: String,
}

impl WireMessage for EnumerationInfo {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        put_string_nonempty(buf, 1, &self.name);
        for value in &self.values {
            put_message_field(buf, 2, value);
        }
        put_string_nonempty(buf, 3, &self.documentation);
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut info = EnumerationInfo::default();
        let mut reader = WireReader::new(bytes);
        while !reader.is_empty() {
            let (field, wire_type) = reader.read_tag()?;
            match field {
                1 => info.name = read_string(&mut reader, field, wire_type)?,
                2 => info.values.push(read_nested(&mut reader, field, wire_type)?),
                3 => info.documentation = read_string(&mut reader, field, wire_type)?,
                _ => reader.skip(wire_type)?,
            }
        }
        Ok(info)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub procedures: Vec<ProcedureInfo>,
    pub classes: Vec<ClassInfo>,
    pub enumerations: Vec<EnumerationInfo>,
    pub documentation: String,
}

impl WireMessage for ServiceInfo {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        put_string_nonempty(buf, 1, &self.name);
        for procedure in &self.procedures {
            put_message_field(buf, 2, procedure);
        }
        for class in &self.classes {
            put_message_field(buf, 3, class);
        }
        for enumeration in &self.enumerations {
            put_message_field(buf, 4, enumeration);
        }
        put_string_nonempty(buf, 5, &self.documentation);
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut info = ServiceInfo::default();
        let mut reader = WireReader::new(bytes);
        while !reader.is_empty() {
            let (field, wire_type) = reader.read_tag()?;
            match field {
                1 => info.name = read_string(&mut reader, field, wire_type)?,
                2 => info
                    .procedures
                    .push(read_nested(&mut reader, field, wire_type)?),
                3 => info.classes.push(read_nested(&mut reader, field, wire_type)?),
                4 => info
                    .enumerations
                    .push(read_nested(&mut reader, field, wire_type)?),
                5 => info.documentation = read_string(&mut reader, field, wire_type)?,
                _ => reader.skip(wire_type)?,
            }
        }
        Ok(info)
    }
}

/// Description of every service, returned by `KRPC.GetServices`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Services {
    pub services: Vec<ServiceInfo>,
}

impl WireMessage for Services {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        for service in &self.services {
            put_message_field(buf, 1, service);
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut services = Services::default();
        let mut reader = WireReader::new(bytes);
        while !reader.is_empty() {
            let (field, wire_type) = reader.read_tag()?;
            match field {
                1 => services
                    .services
                    .push(read_nested(&mut reader, field, wire_type)?),
                _ => reader.skip(wire_type)?,
            }
        }
        Ok(services)
    }
}

/// Reply sent to a client whose connection attempt was denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionResponse {
    pub status: ConnectionStatus,
    pub message: String,
}

impl WireMessage for ConnectionResponse {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        put_u64_nonzero(buf, 1, u64::from(self.status.code()));
        put_string_nonempty(buf, 2, &self.message);
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut status = ConnectionStatus::Ok;
        let mut message = String::new();
        let mut reader = WireReader::new(bytes);
        while !reader.is_empty() {
            let (field, wire_type) = reader.read_tag()?;
            match field {
                1 => {
                    let code = read_u32(&mut reader, field, wire_type)?;
                    status = ConnectionStatus::from_code(code).ok_or_else(|| {
                        CodecError::malformed(format!("unknown connection status {}", code))
                    })?;
                }
                2 => message = read_string(&mut reader, field, wire_type)?,
                _ => reader.skip(wire_type)?,
            }
        }
        Ok(ConnectionResponse { status, message })
    }
}

/// Message-typed value.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Services(Services),
    Status(Status),
    StreamMessage(StreamMessage),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Request(_) => MessageKind::Request,
            Message::Response(_) => MessageKind::Response,
            Message::Services(_) => MessageKind::Services,
            Message::Status(_) => MessageKind::Status,
            Message::StreamMessage(_) => MessageKind::StreamMessage,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Message::Request(m) => m.encode(),
            Message::Response(m) => m.encode(),
            Message::Services(m) => m.encode(),
            Message::Status(m) => m.encode(),
            Message::StreamMessage(m) => m.encode(),
        }
    }

    pub fn decode(kind: MessageKind, bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(match kind {
            MessageKind::Request => Message::Request(Request::decode(bytes)?),
            MessageKind::Response => Message::Response(Response::decode(bytes)?),
            MessageKind::Services => Message::Services(Services::decode(bytes)?),
            MessageKind::Status => Message::Status(Status::decode(bytes)?),
            MessageKind::StreamMessage => Message::StreamMessage(StreamMessage::decode(bytes)?),
        })
    }
}
