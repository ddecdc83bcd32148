//! Protocol packets and the values they carry

use std::fmt;
use std::net::SocketAddr;
use std::ops::RangeInclusive;

use bytes::BufMut;

use super::codec::CodecError;
use super::wire::Encode;
use super::*;

/// Network identity of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(SocketAddr);

impl Id {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for Id {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a checker lives and what it is called there.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckerRef {
    pub locator: String,
    pub name: String,
}

impl CheckerRef {
    pub fn new(locator: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for CheckerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.locator)
    }
}

/// Inclusive range of values, `0 <= inf <= sup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Range {
    inf: i64,
    sup: i64,
}

impl Range {
    pub fn new(inf: i64, sup: i64) -> Result<Self, CodecError> {
        if inf < 0 || sup < inf {
            return Err(CodecError::InvalidRange { inf, sup });
        }
        Ok(Self { inf, sup })
    }

    pub fn inf(&self) -> i64 {
        self.inf
    }

    pub fn sup(&self) -> i64 {
        self.sup
    }

    /// Number of values covered; never zero.
    pub fn len(&self) -> u64 {
        (self.sup - self.inf) as u64 + 1
    }

    pub fn values(&self) -> RangeInclusive<i64> {
        self.inf..=self.sup
    }

    /// Split off the first `count` values.
    ///
    /// Returns `None` for `count == 0`; otherwise the head and whatever is
    /// left over.
    pub fn split(&self, count: u64) -> Option<(Range, Option<Range>)> {
        if count == 0 {
            return None;
        }
        if count >= self.len() {
            return Some((*self, None));
        }
        let last = self.inf + count as i64 - 1;
        Some((
            Range {
                inf: self.inf,
                sup: last,
            },
            Some(Range {
                inf: last + 1,
                sup: self.sup,
            }),
        ))
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.inf, self.sup)
    }
}

/// Outcome class of a single checked value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseStatus {
    Done = 0,
    Exception = 1,
    Timeout = 2,
    CheckerUnavailable = 3,
}

impl ResponseStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Done),
            1 => Some(Self::Exception),
            2 => Some(Self::Timeout),
            3 => Some(Self::CheckerUnavailable),
            _ => None,
        }
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Done => "done",
            Self::Exception => "exception",
            Self::Timeout => "timeout",
            Self::CheckerUnavailable => "checker-unavailable",
        };
        f.write_str(name)
    }
}

/// Verdict for one value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub value: i64,
    pub status: ResponseStatus,
    pub message: String,
}

impl Response {
    /// Messages longer than the wire bound are cut at a character boundary.
    pub fn new(value: i64, status: ResponseStatus, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.len() > MAX_STRING_LEN {
            let mut end = MAX_STRING_LEN;
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            message.truncate(end);
        }
        Self {
            value,
            status,
            message,
        }
    }

    pub fn done(value: i64, message: impl Into<String>) -> Self {
        Self::new(value, ResponseStatus::Done, message)
    }

    pub fn exception(value: i64, message: impl Into<String>) -> Self {
        Self::new(value, ResponseStatus::Exception, message)
    }

    pub fn timeout(value: i64) -> Self {
        Self::new(value, ResponseStatus::Timeout, "timed out")
    }

    pub fn unavailable(value: i64, message: impl Into<String>) -> Self {
        Self::new(value, ResponseStatus::CheckerUnavailable, message)
    }
}

/// Frame category, first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Local = 0,
    Transfer = 1,
    Broadcast = 2,
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Local),
            1 => Some(Self::Transfer),
            2 => Some(Self::Broadcast),
            _ => None,
        }
    }
}

/// Join handshake and route announcements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionPacket {
    Connect { daughter: Id },
    ConnectKo,
    ConnectOk { mother: Id, ids: Vec<Id> },
    /// `daughter` is reachable through `source`.
    AddNode { source: Id, daughter: Id },
}

/// Graceful leave and reparenting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectionPacket {
    /// Leaver first, then its own daughters.
    Request { daughters: Vec<Id> },
    Denied,
    Granted,
    PleaseReconnect { mother: Id },
    Reconnect { id: Id, ancestors: Vec<Id> },
    Disconnected { source: Id, leaver: Id },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkRequest {
    pub dest: Id,
    pub src: Id,
    pub request_id: u64,
    pub checker: CheckerRef,
    pub range: Range,
    /// How many values the requester would like this peer to take.
    pub wanted: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkAvailability {
    pub dest: Id,
    pub src: Id,
    pub request_id: u64,
    pub capacity: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkAssignment {
    pub dest: Id,
    pub src: Id,
    pub request_id: u64,
    pub range: Range,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkResponse {
    pub dest: Id,
    pub src: Id,
    pub request_id: u64,
    pub response: Response,
}

/// Routed work traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkPacket {
    Request(WorkRequest),
    Availability(WorkAvailability),
    Assignment(WorkAssignment),
    Response(WorkResponse),
}

impl WorkPacket {
    pub fn dest(&self) -> Id {
        match self {
            Self::Request(p) => p.dest,
            Self::Availability(p) => p.dest,
            Self::Assignment(p) => p.dest,
            Self::Response(p) => p.dest,
        }
    }

    pub fn src(&self) -> Id {
        match self {
            Self::Request(p) => p.src,
            Self::Availability(p) => p.src,
            Self::Assignment(p) => p.src,
            Self::Response(p) => p.src,
        }
    }
}

/// Every packet exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connection(ConnectionPacket),
    Disconnection(DisconnectionPacket),
    Work(WorkPacket),
}

impl Packet {
    /// Frame category and opcode this packet travels under.
    pub fn header(&self) -> (FrameKind, u8) {
        match self {
            Packet::Connection(ConnectionPacket::AddNode { .. }) => {
                (FrameKind::Broadcast, OP_BROADCAST_ADD_NODE)
            }
            Packet::Connection(_) => (FrameKind::Local, OP_LOCAL_CONNECTION),
            Packet::Disconnection(DisconnectionPacket::Disconnected { .. }) => {
                (FrameKind::Broadcast, OP_BROADCAST_DISCONNECTED)
            }
            Packet::Disconnection(_) => (FrameKind::Local, OP_LOCAL_DISCONNECTION),
            Packet::Work(_) => (FrameKind::Transfer, OP_TRANSFER_WORK),
        }
    }

    pub fn type_tag(&self) -> u8 {
        match self {
            Packet::Connection(p) => match p {
                ConnectionPacket::Connect { .. } => TAG_CONNECT,
                ConnectionPacket::ConnectKo => TAG_CONNECT_KO,
                ConnectionPacket::ConnectOk { .. } => TAG_CONNECT_OK,
                ConnectionPacket::AddNode { .. } => TAG_ADD_NODE,
            },
            Packet::Disconnection(p) => match p {
                DisconnectionPacket::Request { .. } => TAG_DISCONNECTION_REQUEST,
                DisconnectionPacket::Denied => TAG_DISCONNECTION_DENIED,
                DisconnectionPacket::Granted => TAG_DISCONNECTION_GRANTED,
                DisconnectionPacket::PleaseReconnect { .. } => TAG_PLEASE_RECONNECT,
                DisconnectionPacket::Reconnect { .. } => TAG_RECONNECT,
                DisconnectionPacket::Disconnected { .. } => TAG_DISCONNECTED,
            },
            Packet::Work(p) => match p {
                WorkPacket::Request(_) => TAG_WORK_REQUEST,
                WorkPacket::Availability(_) => TAG_WORK_AVAILABILITY,
                WorkPacket::Assignment(_) => TAG_WORK_ASSIGNMENT,
                WorkPacket::Response(_) => TAG_WORK_RESPONSE,
            },
        }
    }

    /// Short variant name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connection(p) => match p {
                ConnectionPacket::Connect { .. } => "Connect",
                ConnectionPacket::ConnectKo => "ConnectKo",
                ConnectionPacket::ConnectOk { .. } => "ConnectOk",
                ConnectionPacket::AddNode { .. } => "AddNode",
            },
            Packet::Disconnection(p) => match p {
                DisconnectionPacket::Request { .. } => "DisconnectionRequest",
                DisconnectionPacket::Denied => "DisconnectionDenied",
                DisconnectionPacket::Granted => "DisconnectionGranted",
                DisconnectionPacket::PleaseReconnect { .. } => "PleaseReconnect",
                DisconnectionPacket::Reconnect { .. } => "Reconnect",
                DisconnectionPacket::Disconnected { .. } => "Disconnected",
            },
            Packet::Work(p) => match p {
                WorkPacket::Request(_) => "WorkRequest",
                WorkPacket::Availability(_) => "WorkAvailability",
                WorkPacket::Assignment(_) => "WorkAssignment",
                WorkPacket::Response(_) => "WorkResponse",
            },
        }
    }
}

impl From<ConnectionPacket> for Packet {
    fn from(packet: ConnectionPacket) -> Self {
        Packet::Connection(packet)
    }
}

impl From<DisconnectionPacket> for Packet {
    fn from(packet: DisconnectionPacket) -> Self {
        Packet::Disconnection(packet)
    }
}

impl From<WorkPacket> for Packet {
    fn from(packet: WorkPacket) -> Self {
        Packet::Work(packet)
    }
}

impl From<WorkRequest> for Packet {
    fn from(body: WorkRequest) -> Self {
        Packet::Work(WorkPacket::Request(body))
    }
}

impl From<WorkAvailability> for Packet {
    fn from(body: WorkAvailability) -> Self {
        Packet::Work(WorkPacket::Availability(body))
    }
}

impl From<WorkAssignment> for Packet {
    fn from(body: WorkAssignment) -> Self {
        Packet::Work(WorkPacket::Assignment(body))
    }
}

impl From<WorkResponse> for Packet {
    fn from(body: WorkResponse) -> Self {
        Packet::Work(WorkPacket::Response(body))
    }
}

impl Encode for CheckerRef {
    fn size(&self) -> usize {
        self.locator.size() + self.name.size()
    }

    fn write<B: BufMut>(&self, buf: &mut B) {
        self.locator.write(buf);
        self.name.write(buf);
    }
}

impl Encode for Range {
    fn size(&self) -> usize {
        16
    }

    fn write<B: BufMut>(&self, buf: &mut B) {
        buf.put_i64(self.inf);
        buf.put_i64(self.sup);
    }
}

impl Encode for Response {
    fn size(&self) -> usize {
        8 + 1 + self.message.size()
    }

    fn write<B: BufMut>(&self, buf: &mut B) {
        buf.put_i64(self.value);
        buf.put_u8(self.status as u8);
        self.message.write(buf);
    }
}

impl Encode for ConnectionPacket {
    fn size(&self) -> usize {
        match self {
            Self::Connect { daughter } => daughter.size(),
            Self::ConnectKo => 0,
            Self::ConnectOk { mother, ids } => mother.size() + ids.size(),
            Self::AddNode { source, daughter } => source.size() + daughter.size(),
        }
    }

    fn write<B: BufMut>(&self, buf: &mut B) {
        match self {
            Self::Connect { daughter } => daughter.write(buf),
            Self::ConnectKo => {}
            Self::ConnectOk { mother, ids } => {
                mother.write(buf);
                ids.write(buf);
            }
            Self::AddNode { source, daughter } => {
                source.write(buf);
                daughter.write(buf);
            }
        }
    }
}

impl Encode for DisconnectionPacket {
    fn size(&self) -> usize {
        match self {
            Self::Request { daughters } => daughters.size(),
            Self::Denied | Self::Granted => 0,
            Self::PleaseReconnect { mother } => mother.size(),
            Self::Reconnect { id, ancestors } => id.size() + ancestors.size(),
            Self::Disconnected { source, leaver } => source.size() + leaver.size(),
        }
    }

    fn write<B: BufMut>(&self, buf: &mut B) {
        match self {
            Self::Request { daughters } => daughters.write(buf),
            Self::Denied | Self::Granted => {}
            Self::PleaseReconnect { mother } => mother.write(buf),
            Self::Reconnect { id, ancestors } => {
                id.write(buf);
                ancestors.write(buf);
            }
            Self::Disconnected { source, leaver } => {
                source.write(buf);
                leaver.write(buf);
            }
        }
    }
}

// Destination precedes source in every work packet.
impl Encode for WorkPacket {
    fn size(&self) -> usize {
        let addressing = self.dest().size() + self.src().size() + 8;
        addressing
            + match self {
                Self::Request(p) => p.checker.size() + p.range.size() + 8,
                Self::Availability(_) => 8,
                Self::Assignment(p) => p.range.size(),
                Self::Response(p) => p.response.size(),
            }
    }

    fn write<B: BufMut>(&self, buf: &mut B) {
        match self {
            Self::Request(p) => {
                p.dest.write(buf);
                p.src.write(buf);
                buf.put_u64(p.request_id);
                p.checker.write(buf);
                p.range.write(buf);
                buf.put_u64(p.wanted);
            }
            Self::Availability(p) => {
                p.dest.write(buf);
                p.src.write(buf);
                buf.put_u64(p.request_id);
                buf.put_u64(p.capacity);
            }
            Self::Assignment(p) => {
                p.dest.write(buf);
                p.src.write(buf);
                buf.put_u64(p.request_id);
                p.range.write(buf);
            }
            Self::Response(p) => {
                p.dest.write(buf);
                p.src.write(buf);
                buf.put_u64(p.request_id);
                p.response.write(buf);
            }
        }
    }
}

impl Encode for Packet {
    fn size(&self) -> usize {
        3 + match self {
            Packet::Connection(p) => p.size(),
            Packet::Disconnection(p) => p.size(),
            Packet::Work(p) => p.size(),
        }
    }

    fn write<B: BufMut>(&self, buf: &mut B) {
        let (kind, opcode) = self.header();
        buf.put_u8(kind as u8);
        buf.put_u8(opcode);
        buf.put_u8(self.type_tag());
        match self {
            Packet::Connection(p) => p.write(buf),
            Packet::Disconnection(p) => p.write(buf),
            Packet::Work(p) => p.write(buf),
        }
    }
}
