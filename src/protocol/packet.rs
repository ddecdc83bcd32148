//! Frame header and packet decoding
//!
//! `[frame-category: u8][opcode: u8][type-tag: u8][fields...]`. The header
//! picks the family decoder, the tag picks the variant, and the result must
//! be one of the variants allowed under that header.

use bytes::BytesMut;

use super::codec::{CheckerDecoder, CodecError, Field, RangeDecoder, ResponseDecoder};
use super::message::*;
use super::wire::{ByteDecoder, Decode, DecodeResult, IdDecoder, IdListDecoder, LongDecoder};
use super::*;

/// Which family decoder handles a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Connection,
    Disconnection,
    Work,
}

fn family_for(kind: FrameKind, opcode: u8) -> Option<Family> {
    match (kind, opcode) {
        (FrameKind::Local, OP_LOCAL_CONNECTION) => Some(Family::Connection),
        (FrameKind::Local, OP_LOCAL_DISCONNECTION) => Some(Family::Disconnection),
        (FrameKind::Transfer, OP_TRANSFER_WORK) => Some(Family::Work),
        (FrameKind::Broadcast, OP_BROADCAST_DISCONNECTED) => Some(Family::Disconnection),
        (FrameKind::Broadcast, OP_BROADCAST_ADD_NODE) => Some(Family::Connection),
        _ => None,
    }
}

fn non_negative(value: i64) -> Result<u64, CodecError> {
    u64::try_from(value).map_err(|_| CodecError::InvalidAmount(value))
}

/// Connect, ConnectKo, ConnectOk and AddNode.
#[derive(Default)]
pub struct ConnectionDecoder {
    tag: Field<ByteDecoder>,
    first: Field<IdDecoder>,
    second: Field<IdDecoder>,
    ids: Field<IdListDecoder>,
    failed: bool,
}

impl ConnectionDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn advance(&mut self, buf: &mut BytesMut) -> DecodeResult<ConnectionPacket> {
        if !self.tag.ready(buf)? {
            return Ok(None);
        }
        let tag = self.tag.get().copied().unwrap_or_default();
        let packet = match tag {
            TAG_CONNECT => {
                if !self.first.ready(buf)? {
                    return Ok(None);
                }
                self.first
                    .take()
                    .map(|daughter| ConnectionPacket::Connect { daughter })
            }
            TAG_CONNECT_KO => Some(ConnectionPacket::ConnectKo),
            TAG_CONNECT_OK => {
                if !self.first.ready(buf)? || !self.ids.ready(buf)? {
                    return Ok(None);
                }
                match (self.first.take(), self.ids.take()) {
                    (Some(mother), Some(ids)) => Some(ConnectionPacket::ConnectOk { mother, ids }),
                    _ => None,
                }
            }
            TAG_ADD_NODE => {
                if !self.first.ready(buf)? || !self.second.ready(buf)? {
                    return Ok(None);
                }
                match (self.first.take(), self.second.take()) {
                    (Some(source), Some(daughter)) => {
                        Some(ConnectionPacket::AddNode { source, daughter })
                    }
                    _ => None,
                }
            }
            other => {
                return Err(CodecError::UnknownTag {
                    family: "connection",
                    tag: other,
                })
            }
        };
        if packet.is_some() {
            self.tag.take();
        }
        Ok(packet)
    }
}

impl Decode for ConnectionDecoder {
    type Output = ConnectionPacket;

    fn decode(&mut self, buf: &mut BytesMut) -> DecodeResult<ConnectionPacket> {
        if self.failed {
            return Err(CodecError::Poisoned);
        }
        let result = self.advance(buf);
        self.failed = result.is_err();
        result
    }

    fn reset(&mut self) {
        self.tag.reset();
        self.first.reset();
        self.second.reset();
        self.ids.reset();
        self.failed = false;
    }
}

/// The six leave/reparent packets.
#[derive(Default)]
pub struct DisconnectionDecoder {
    tag: Field<ByteDecoder>,
    first: Field<IdDecoder>,
    second: Field<IdDecoder>,
    ids: Field<IdListDecoder>,
    failed: bool,
}

impl DisconnectionDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn advance(&mut self, buf: &mut BytesMut) -> DecodeResult<DisconnectionPacket> {
        if !self.tag.ready(buf)? {
            return Ok(None);
        }
        let tag = self.tag.get().copied().unwrap_or_default();
        let packet = match tag {
            TAG_DISCONNECTION_REQUEST => {
                if !self.ids.ready(buf)? {
                    return Ok(None);
                }
                self.ids
                    .take()
                    .map(|daughters| DisconnectionPacket::Request { daughters })
            }
            TAG_DISCONNECTION_DENIED => Some(DisconnectionPacket::Denied),
            TAG_DISCONNECTION_GRANTED => Some(DisconnectionPacket::Granted),
            TAG_PLEASE_RECONNECT => {
                if !self.first.ready(buf)? {
                    return Ok(None);
                }
                self.first
                    .take()
                    .map(|mother| DisconnectionPacket::PleaseReconnect { mother })
            }
            TAG_RECONNECT => {
                if !self.first.ready(buf)? || !self.ids.ready(buf)? {
                    return Ok(None);
                }
                match (self.first.take(), self.ids.take()) {
                    (Some(id), Some(ancestors)) => {
                        Some(DisconnectionPacket::Reconnect { id, ancestors })
                    }
                    _ => None,
                }
            }
            TAG_DISCONNECTED => {
                if !self.first.ready(buf)? || !self.second.ready(buf)? {
                    return Ok(None);
                }
                match (self.first.take(), self.second.take()) {
                    (Some(source), Some(leaver)) => {
                        Some(DisconnectionPacket::Disconnected { source, leaver })
                    }
                    _ => None,
                }
            }
            other => {
                return Err(CodecError::UnknownTag {
                    family: "disconnection",
                    tag: other,
                })
            }
        };
        if packet.is_some() {
            self.tag.take();
        }
        Ok(packet)
    }
}

impl Decode for DisconnectionDecoder {
    type Output = DisconnectionPacket;

    fn decode(&mut self, buf: &mut BytesMut) -> DecodeResult<DisconnectionPacket> {
        if self.failed {
            return Err(CodecError::Poisoned);
        }
        let result = self.advance(buf);
        self.failed = result.is_err();
        result
    }

    fn reset(&mut self) {
        self.tag.reset();
        self.first.reset();
        self.second.reset();
        self.ids.reset();
        self.failed = false;
    }
}

/// The four routed work packets. All of them open with `dest`, `src` and
/// the request id.
#[derive(Default)]
pub struct WorkDecoder {
    tag: Field<ByteDecoder>,
    dest: Field<IdDecoder>,
    src: Field<IdDecoder>,
    request_id: Field<LongDecoder>,
    checker: Field<CheckerDecoder>,
    range: Field<RangeDecoder>,
    amount: Field<LongDecoder>,
    response: Field<ResponseDecoder>,
    failed: bool,
}

impl WorkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn advance(&mut self, buf: &mut BytesMut) -> DecodeResult<WorkPacket> {
        if !self.tag.ready(buf)? {
            return Ok(None);
        }
        let tag = self.tag.get().copied().unwrap_or_default();
        if !(TAG_WORK_REQUEST..=TAG_WORK_RESPONSE).contains(&tag) {
            return Err(CodecError::UnknownTag { family: "work", tag });
        }
        if !self.dest.ready(buf)? || !self.src.ready(buf)? || !self.request_id.ready(buf)? {
            return Ok(None);
        }

        let body_ready = match tag {
            TAG_WORK_REQUEST => {
                self.checker.ready(buf)? && self.range.ready(buf)? && self.amount.ready(buf)?
            }
            TAG_WORK_AVAILABILITY => self.amount.ready(buf)?,
            TAG_WORK_ASSIGNMENT => self.range.ready(buf)?,
            _ => self.response.ready(buf)?,
        };
        if !body_ready {
            return Ok(None);
        }

        let (Some(dest), Some(src), Some(request_id)) =
            (self.dest.take(), self.src.take(), self.request_id.take())
        else {
            return Ok(None);
        };
        self.tag.take();
        let request_id = request_id as u64;

        let packet = match tag {
            TAG_WORK_REQUEST => match (self.checker.take(), self.range.take(), self.amount.take()) {
                (Some(checker), Some(range), Some(wanted)) => WorkPacket::Request(WorkRequest {
                    dest,
                    src,
                    request_id,
                    checker,
                    range,
                    wanted: non_negative(wanted)?,
                }),
                _ => return Ok(None),
            },
            TAG_WORK_AVAILABILITY => match self.amount.take() {
                Some(capacity) => WorkPacket::Availability(WorkAvailability {
                    dest,
                    src,
                    request_id,
                    capacity: non_negative(capacity)?,
                }),
                None => return Ok(None),
            },
            TAG_WORK_ASSIGNMENT => match self.range.take() {
                Some(range) => WorkPacket::Assignment(WorkAssignment {
                    dest,
                    src,
                    request_id,
                    range,
                }),
                None => return Ok(None),
            },
            _ => match self.response.take() {
                Some(response) => WorkPacket::Response(WorkResponse {
                    dest,
                    src,
                    request_id,
                    response,
                }),
                None => return Ok(None),
            },
        };
        Ok(Some(packet))
    }
}

impl Decode for WorkDecoder {
    type Output = WorkPacket;

    fn decode(&mut self, buf: &mut BytesMut) -> DecodeResult<WorkPacket> {
        if self.failed {
            return Err(CodecError::Poisoned);
        }
        let result = self.advance(buf);
        self.failed = result.is_err();
        result
    }

    fn reset(&mut self) {
        self.tag.reset();
        self.dest.reset();
        self.src.reset();
        self.request_id.reset();
        self.checker.reset();
        self.range.reset();
        self.amount.reset();
        self.response.reset();
        self.failed = false;
    }
}

/// Decodes whole packets from a byte stream.
#[derive(Default)]
pub struct PacketDecoder {
    category: Field<ByteDecoder>,
    opcode: Field<ByteDecoder>,
    connection: ConnectionDecoder,
    disconnection: DisconnectionDecoder,
    work: WorkDecoder,
    failed: bool,
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether part of a packet has been consumed already.
    pub fn in_progress(&self) -> bool {
        self.category.get().is_some()
    }

    fn advance(&mut self, buf: &mut BytesMut) -> DecodeResult<Packet> {
        if !self.category.ready(buf)? || !self.opcode.ready(buf)? {
            return Ok(None);
        }
        let category = self.category.get().copied().unwrap_or_default();
        let opcode = self.opcode.get().copied().unwrap_or_default();
        let kind = FrameKind::from_u8(category).ok_or(CodecError::UnknownCategory(category))?;
        let family =
            family_for(kind, opcode).ok_or(CodecError::UnknownOpcode { category, opcode })?;

        let packet = match family {
            Family::Connection => self.connection.decode(buf)?.map(Packet::Connection),
            Family::Disconnection => self.disconnection.decode(buf)?.map(Packet::Disconnection),
            Family::Work => self.work.decode(buf)?.map(Packet::Work),
        };
        let Some(packet) = packet else {
            return Ok(None);
        };

        self.category.take();
        self.opcode.take();
        if packet.header() != (kind, opcode) {
            return Err(CodecError::IllegalContext {
                packet: packet.name(),
                category,
                opcode,
            });
        }
        Ok(Some(packet))
    }
}

impl Decode for PacketDecoder {
    type Output = Packet;

    fn decode(&mut self, buf: &mut BytesMut) -> DecodeResult<Packet> {
        if self.failed {
            return Err(CodecError::Poisoned);
        }
        let result = self.advance(buf);
        self.failed = result.is_err();
        result
    }

    fn reset(&mut self) {
        self.category.reset();
        self.opcode.reset();
        self.connection.reset();
        self.disconnection.reset();
        self.work.reset();
        self.failed = false;
    }
}
