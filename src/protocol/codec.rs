//! Composite value decoders
//!
//! Each composite is a fixed sequence of fields. A field that completed stays
//! cached in its slot while later fields wait for more input, so a value split
//! across reads is never decoded twice.

use bytes::BytesMut;
use thiserror::Error;

use super::message::{CheckerRef, Range, Response, ResponseStatus};
use super::wire::{ByteDecoder, Decode, DecodeResult, ListDecoder, LongDecoder, StringDecoder};

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Invalid string length: {0}")]
    InvalidLength(i32),

    #[error("Invalid list count: {0}")]
    InvalidCount(i32),

    #[error("Invalid amount: {0}")]
    InvalidAmount(i64),

    #[error("Invalid UTF-8 in string")]
    InvalidUtf8,

    #[error("Invalid IP type: {0}")]
    InvalidIpType(u8),

    #[error("Invalid port: {0}")]
    InvalidPort(i32),

    #[error("Invalid range [{inf}, {sup}]")]
    InvalidRange { inf: i64, sup: i64 },

    #[error("Invalid response status: {0}")]
    InvalidStatus(u8),

    #[error("Unknown frame category: {0}")]
    UnknownCategory(u8),

    #[error("Unknown opcode {opcode} for frame category {category}")]
    UnknownOpcode { category: u8, opcode: u8 },

    #[error("Unknown {family} packet tag: {tag}")]
    UnknownTag { family: &'static str, tag: u8 },

    #[error("{packet} is not allowed under frame category {category} opcode {opcode}")]
    IllegalContext {
        packet: &'static str,
        category: u8,
        opcode: u8,
    },

    #[error("Decoder is in error state")]
    Poisoned,
}

pub type CodecResult<T> = Result<T, CodecError>;

/// A decoder paired with the value it produced, if any.
pub(crate) struct Field<D: Decode> {
    decoder: D,
    value: Option<D::Output>,
}

impl<D: Decode + Default> Default for Field<D> {
    fn default() -> Self {
        Self {
            decoder: D::default(),
            value: None,
        }
    }
}

impl<D: Decode> Field<D> {
    /// Decode the field unless already cached; true once it holds a value.
    pub(crate) fn ready(&mut self, buf: &mut BytesMut) -> CodecResult<bool> {
        if self.value.is_none() {
            self.value = self.decoder.decode(buf)?;
        }
        Ok(self.value.is_some())
    }

    pub(crate) fn get(&self) -> Option<&D::Output> {
        self.value.as_ref()
    }

    pub(crate) fn take(&mut self) -> Option<D::Output> {
        self.value.take()
    }

    pub(crate) fn reset(&mut self) {
        self.decoder.reset();
        self.value = None;
    }
}

/// `[locator: string][name: string]`
#[derive(Default)]
pub struct CheckerDecoder {
    locator: Field<StringDecoder>,
    name: Field<StringDecoder>,
    failed: bool,
}

impl CheckerDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn advance(&mut self, buf: &mut BytesMut) -> DecodeResult<CheckerRef> {
        if !self.locator.ready(buf)? || !self.name.ready(buf)? {
            return Ok(None);
        }
        let (Some(locator), Some(name)) = (self.locator.take(), self.name.take()) else {
            return Ok(None);
        };
        Ok(Some(CheckerRef { locator, name }))
    }
}

impl Decode for CheckerDecoder {
    type Output = CheckerRef;

    fn decode(&mut self, buf: &mut BytesMut) -> DecodeResult<CheckerRef> {
        if self.failed {
            return Err(CodecError::Poisoned);
        }
        let result = self.advance(buf);
        self.failed = result.is_err();
        result
    }

    fn reset(&mut self) {
        self.locator.reset();
        self.name.reset();
        self.failed = false;
    }
}

/// `[inf: i64][sup: i64]`, rejected unless `0 <= inf <= sup`.
#[derive(Default)]
pub struct RangeDecoder {
    inf: Field<LongDecoder>,
    sup: Field<LongDecoder>,
    failed: bool,
}

impl RangeDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn advance(&mut self, buf: &mut BytesMut) -> DecodeResult<Range> {
        if !self.inf.ready(buf)? || !self.sup.ready(buf)? {
            return Ok(None);
        }
        let (Some(inf), Some(sup)) = (self.inf.take(), self.sup.take()) else {
            return Ok(None);
        };
        Range::new(inf, sup).map(Some)
    }
}

impl Decode for RangeDecoder {
    type Output = Range;

    fn decode(&mut self, buf: &mut BytesMut) -> DecodeResult<Range> {
        if self.failed {
            return Err(CodecError::Poisoned);
        }
        let result = self.advance(buf);
        self.failed = result.is_err();
        result
    }

    fn reset(&mut self) {
        self.inf.reset();
        self.sup.reset();
        self.failed = false;
    }
}

pub type RangeListDecoder = ListDecoder<RangeDecoder>;

/// `[value: i64][status: u8][message: string]`
#[derive(Default)]
pub struct ResponseDecoder {
    value: Field<LongDecoder>,
    status: Field<ByteDecoder>,
    message: Field<StringDecoder>,
    failed: bool,
}

impl ResponseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn advance(&mut self, buf: &mut BytesMut) -> DecodeResult<Response> {
        if !self.value.ready(buf)? || !self.status.ready(buf)? {
            return Ok(None);
        }
        // Reject the status before waiting on the message body.
        let status = match self.status.get().copied() {
            Some(raw) => ResponseStatus::from_u8(raw).ok_or(CodecError::InvalidStatus(raw))?,
            None => return Ok(None),
        };
        if !self.message.ready(buf)? {
            return Ok(None);
        }
        let (Some(value), Some(_), Some(message)) =
            (self.value.take(), self.status.take(), self.message.take())
        else {
            return Ok(None);
        };
        Ok(Some(Response {
            value,
            status,
            message,
        }))
    }
}

impl Decode for ResponseDecoder {
    type Output = Response;

    fn decode(&mut self, buf: &mut BytesMut) -> DecodeResult<Response> {
        if self.failed {
            return Err(CodecError::Poisoned);
        }
        let result = self.advance(buf);
        self.failed = result.is_err();
        result
    }

    fn reset(&mut self) {
        self.value.reset();
        self.status.reset();
        self.message.reset();
        self.failed = false;
    }
}
