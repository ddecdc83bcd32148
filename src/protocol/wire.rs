//! Primitive wire values
//!
//! Every decoder here is incremental: it takes whatever bytes are available
//! from the front of the buffer, keeps partial progress internally and returns
//! `Ok(None)` until the value is complete. A completed decoder is ready for the
//! next value straight away; a failed one keeps failing until `reset`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, BytesMut};

use super::codec::CodecError;
use super::message::Id;
use super::{MAX_LIST_LEN, MAX_STRING_LEN};

/// `Ok(Some(v))` once a value is complete, `Ok(None)` when more input is needed.
pub type DecodeResult<T> = Result<Option<T>, CodecError>;

/// An incremental decoder for one wire value.
pub trait Decode {
    type Output;

    /// Consume bytes from the front of `buf` towards the next value.
    fn decode(&mut self, buf: &mut BytesMut) -> DecodeResult<Self::Output>;

    /// Drop any partial value and leave the error state.
    fn reset(&mut self);
}

/// A value with a fixed wire layout.
///
/// Writing is all-or-nothing: `encode` checks the remaining space first and
/// writes nothing when the whole value does not fit.
pub trait Encode {
    /// Exact number of bytes `write` produces.
    fn size(&self) -> usize;

    /// Write the value unconditionally.
    fn write<B: BufMut>(&self, buf: &mut B);

    /// Write the value if it fits, returning whether it was written.
    fn encode<B: BufMut>(&self, buf: &mut B) -> bool {
        if buf.remaining_mut() < self.size() {
            return false;
        }
        self.write(buf);
        true
    }
}

/// Accumulates exactly `N` bytes across calls.
#[derive(Debug, Clone)]
pub struct FixedDecoder<const N: usize> {
    bytes: [u8; N],
    filled: usize,
}

impl<const N: usize> FixedDecoder<N> {
    pub fn new() -> Self {
        Self {
            bytes: [0; N],
            filled: 0,
        }
    }

    fn fill(&mut self, buf: &mut BytesMut) -> Option<[u8; N]> {
        let take = (N - self.filled).min(buf.len());
        self.bytes[self.filled..self.filled + take].copy_from_slice(&buf[..take]);
        buf.advance(take);
        self.filled += take;

        if self.filled == N {
            self.filled = 0;
            Some(self.bytes)
        } else {
            None
        }
    }

    fn clear(&mut self) {
        self.filled = 0;
    }
}

impl<const N: usize> Default for FixedDecoder<N> {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! fixed_decoder {
    ($(#[$doc:meta])* $name:ident, $ty:ty, $n:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Default)]
        pub struct $name(FixedDecoder<$n>);

        impl $name {
            pub fn new() -> Self {
                Self::default()
            }
        }

        impl Decode for $name {
            type Output = $ty;

            fn decode(&mut self, buf: &mut BytesMut) -> DecodeResult<$ty> {
                Ok(self.0.fill(buf).map(<$ty>::from_be_bytes))
            }

            fn reset(&mut self) {
                self.0.clear();
            }
        }
    };
}

fixed_decoder!(
    /// One unsigned byte.
    ByteDecoder, u8, 1
);
fixed_decoder!(
    /// Big-endian 32-bit signed integer.
    IntDecoder, i32, 4
);
fixed_decoder!(
    /// Big-endian 64-bit signed integer.
    LongDecoder, i64, 8
);


/// Length-prefixed UTF-8 string, bounded to `MAX_STRING_LEN` bytes.
pub struct StringDecoder {
    state: StringState,
}

enum StringState {
    Length(IntDecoder),
    Body { expected: usize, bytes: Vec<u8> },
    Failed,
}

impl StringDecoder {
    pub fn new() -> Self {
        Self {
            state: StringState::Length(IntDecoder::new()),
        }
    }

    fn fail(&mut self, err: CodecError) -> CodecError {
        self.state = StringState::Failed;
        err
    }
}

impl Default for StringDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decode for StringDecoder {
    type Output = String;

    fn decode(&mut self, buf: &mut BytesMut) -> DecodeResult<String> {
        loop {
            match &mut self.state {
                StringState::Length(length) => {
                    let Some(len) = length.decode(buf)? else {
                        return Ok(None);
                    };
                    if !(0..=MAX_STRING_LEN as i32).contains(&len) {
                        return Err(self.fail(CodecError::InvalidLength(len)));
                    }
                    self.state = StringState::Body {
                        expected: len as usize,
                        bytes: Vec::with_capacity(len as usize),
                    };
                }
                StringState::Body { expected, bytes } => {
                    let take = (*expected - bytes.len()).min(buf.len());
                    bytes.extend_from_slice(&buf[..take]);
                    buf.advance(take);
                    if bytes.len() < *expected {
                        return Ok(None);
                    }

                    let bytes = std::mem::take(bytes);
                    self.state = StringState::Length(IntDecoder::new());
                    return match String::from_utf8(bytes) {
                        Ok(value) => Ok(Some(value)),
                        Err(_) => Err(self.fail(CodecError::InvalidUtf8)),
                    };
                }
                StringState::Failed => return Err(CodecError::Poisoned),
            }
        }
    }

    fn reset(&mut self) {
        self.state = StringState::Length(IntDecoder::new());
    }
}

/// Node identity: `[ip-type][4 or 16 address bytes][port: i32]`.
pub struct IdDecoder {
    state: IdState,
}

enum IdState {
    Kind(ByteDecoder),
    V4(FixedDecoder<4>),
    V6(FixedDecoder<16>),
    Port(IpAddr, IntDecoder),
    Failed,
}

impl IdDecoder {
    pub fn new() -> Self {
        Self {
            state: IdState::Kind(ByteDecoder::new()),
        }
    }

    fn fail(&mut self, err: CodecError) -> CodecError {
        self.state = IdState::Failed;
        err
    }
}

impl Default for IdDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decode for IdDecoder {
    type Output = Id;

    fn decode(&mut self, buf: &mut BytesMut) -> DecodeResult<Id> {
        loop {
            match &mut self.state {
                IdState::Kind(kind) => {
                    let Some(kind) = kind.decode(buf)? else {
                        return Ok(None);
                    };
                    self.state = match kind {
                        4 => IdState::V4(FixedDecoder::new()),
                        6 => IdState::V6(FixedDecoder::new()),
                        other => return Err(self.fail(CodecError::InvalidIpType(other))),
                    };
                }
                IdState::V4(octets) => {
                    let Some(octets) = octets.fill(buf) else {
                        return Ok(None);
                    };
                    let ip = IpAddr::V4(Ipv4Addr::from(octets));
                    self.state = IdState::Port(ip, IntDecoder::new());
                }
                IdState::V6(octets) => {
                    let Some(octets) = octets.fill(buf) else {
                        return Ok(None);
                    };
                    let ip = IpAddr::V6(Ipv6Addr::from(octets));
                    self.state = IdState::Port(ip, IntDecoder::new());
                }
                IdState::Port(ip, port) => {
                    let ip = *ip;
                    let Some(port) = port.decode(buf)? else {
                        return Ok(None);
                    };
                    if !(0..=u16::MAX as i32).contains(&port) {
                        return Err(self.fail(CodecError::InvalidPort(port)));
                    }
                    self.state = IdState::Kind(ByteDecoder::new());
                    return Ok(Some(Id::new(SocketAddr::new(ip, port as u16))));
                }
                IdState::Failed => return Err(CodecError::Poisoned),
            }
        }
    }

    fn reset(&mut self) {
        self.state = IdState::Kind(ByteDecoder::new());
    }
}

/// `[count: i32][item]*` with `0 <= count <= MAX_LIST_LEN`.
///
/// Items already decoded survive a refill in the middle of the list.
pub struct ListDecoder<D: Decode> {
    state: ListState<D::Output>,
    item: D,
}

enum ListState<T> {
    Count(IntDecoder),
    Items { remaining: usize, items: Vec<T> },
    Failed,
}

impl<D: Decode + Default> ListDecoder<D> {
    pub fn new() -> Self {
        Self {
            state: ListState::Count(IntDecoder::new()),
            item: D::default(),
        }
    }
}

impl<D: Decode + Default> Default for ListDecoder<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Decode> ListDecoder<D> {
    fn fail(&mut self, err: CodecError) -> CodecError {
        self.state = ListState::Failed;
        err
    }
}

impl<D: Decode> Decode for ListDecoder<D> {
    type Output = Vec<D::Output>;

    fn decode(&mut self, buf: &mut BytesMut) -> DecodeResult<Vec<D::Output>> {
        loop {
            match &mut self.state {
                ListState::Count(count) => {
                    let Some(count) = count.decode(buf)? else {
                        return Ok(None);
                    };
                    if !(0..=MAX_LIST_LEN as i32).contains(&count) {
                        return Err(self.fail(CodecError::InvalidCount(count)));
                    }
                    self.state = ListState::Items {
                        remaining: count as usize,
                        items: Vec::with_capacity(count as usize),
                    };
                }
                ListState::Items { remaining, items } => {
                    if *remaining == 0 {
                        let items = std::mem::take(items);
                        self.state = ListState::Count(IntDecoder::new());
                        return Ok(Some(items));
                    }
                    match self.item.decode(buf) {
                        Ok(Some(item)) => {
                            items.push(item);
                            *remaining -= 1;
                        }
                        Ok(None) => return Ok(None),
                        Err(err) => return Err(self.fail(err)),
                    }
                }
                ListState::Failed => return Err(CodecError::Poisoned),
            }
        }
    }

    fn reset(&mut self) {
        self.state = ListState::Count(IntDecoder::new());
        self.item.reset();
    }
}

pub type IdListDecoder = ListDecoder<IdDecoder>;

impl Encode for u8 {
    fn size(&self) -> usize {
        1
    }

    fn write<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(*self);
    }
}

impl Encode for i32 {
    fn size(&self) -> usize {
        4
    }

    fn write<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32(*self);
    }
}

impl Encode for i64 {
    fn size(&self) -> usize {
        8
    }

    fn write<B: BufMut>(&self, buf: &mut B) {
        buf.put_i64(*self);
    }
}

impl Encode for str {
    fn size(&self) -> usize {
        4 + self.len()
    }

    fn write<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32(self.len() as i32);
        buf.put_slice(self.as_bytes());
    }
}

impl Encode for String {
    fn size(&self) -> usize {
        self.as_str().size()
    }

    fn write<B: BufMut>(&self, buf: &mut B) {
        self.as_str().write(buf)
    }
}

impl Encode for Id {
    fn size(&self) -> usize {
        match self.addr().ip() {
            IpAddr::V4(_) => 1 + 4 + 4,
            IpAddr::V6(_) => 1 + 16 + 4,
        }
    }

    fn write<B: BufMut>(&self, buf: &mut B) {
        match self.addr().ip() {
            IpAddr::V4(ip) => {
                buf.put_u8(4);
                buf.put_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                buf.put_u8(6);
                buf.put_slice(&ip.octets());
            }
        }
        buf.put_i32(self.addr().port() as i32);
    }
}

impl<T: Encode> Encode for [T] {
    fn size(&self) -> usize {
        4 + self.iter().map(Encode::size).sum::<usize>()
    }

    fn write<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32(self.len() as i32);
        for item in self {
            item.write(buf);
        }
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn size(&self) -> usize {
        self.as_slice().size()
    }

    fn write<B: BufMut>(&self, buf: &mut B) {
        self.as_slice().write(buf)
    }
}
