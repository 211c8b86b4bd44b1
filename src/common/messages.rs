//! Wire frames exchanged over a [Link](crate::rpc::Link).
//!
//! A frame is a fixed [HEADER_SIZE] header followed by the declared number of body bytes.
//! All integers are big-endian.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::common::{Id, ID_SIZE, N_CONTACTS};
use crate::{Error, Result};

/// Size of an encoded [ContactInfo].
pub const CONTACT_RECORD_SIZE: usize = ID_SIZE + 1 + 16 + 2;

/// Size of the fixed frame header.
pub const HEADER_SIZE: usize = 1 + 1 + 2 + 4 + CONTACT_RECORD_SIZE + ID_SIZE + 4 + 1
    + N_CONTACTS * CONTACT_RECORD_SIZE;

/// Largest blob a frame may declare.
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

const BLOB_LEN_OFFSET: usize = 8 + CONTACT_RECORD_SIZE + ID_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Request,
    Response,
    /// Free-form text between operators.
    Text,
}

impl Category {
    fn to_u8(self) -> u8 {
        match self {
            Category::Request => 1,
            Category::Response => 2,
            Category::Text => 3,
        }
    }

    fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(Category::Request),
            2 => Ok(Category::Response),
            3 => Ok(Category::Text),
            _ => Err(Error::MalformedFrame("unknown category")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcKind {
    Failure,
    Ping,
    Store,
    FindNode,
    FindValue,
    FoundNode,
    FoundValue,
}

impl RpcKind {
    fn to_u8(self) -> u8 {
        match self {
            RpcKind::Failure => 0,
            RpcKind::Ping => 1,
            RpcKind::Store => 2,
            RpcKind::FindNode => 3,
            RpcKind::FindValue => 4,
            RpcKind::FoundNode => 5,
            RpcKind::FoundValue => 6,
        }
    }

    fn from_u8(byte: u8) -> Result<Self> {
        Ok(match byte {
            0 => RpcKind::Failure,
            1 => RpcKind::Ping,
            2 => RpcKind::Store,
            3 => RpcKind::FindNode,
            4 => RpcKind::FindValue,
            5 => RpcKind::FoundNode,
            6 => RpcKind::FoundValue,
            _ => return Err(Error::MalformedFrame("unknown rpc kind")),
        })
    }

    /// Kinds whose frame is followed by a blob body.
    pub fn carries_blob(&self) -> bool {
        matches!(self, RpcKind::Store | RpcKind::FoundValue)
    }
}

/// A peer's identity and listening address, as copied onto the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContactInfo {
    pub id: Id,
    pub address: SocketAddr,
}

impl ContactInfo {
    pub fn new(id: Id, address: SocketAddr) -> Self {
        Self { id, address }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.id.as_bytes());

        match self.address.ip() {
            IpAddr::V4(ip) => {
                buf.put_u8(4);
                buf.put_slice(&ip.octets());
                buf.put_bytes(0, 12);
            }
            IpAddr::V6(ip) => {
                buf.put_u8(6);
                buf.put_slice(&ip.octets());
            }
        }

        buf.put_u16(self.address.port());
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < CONTACT_RECORD_SIZE {
            return Err(Error::MalformedFrame("truncated contact record"));
        }

        let mut id = [0u8; ID_SIZE];
        buf.copy_to_slice(&mut id);

        let family = buf.get_u8();
        let mut ip = [0u8; 16];
        buf.copy_to_slice(&mut ip);
        let port = buf.get_u16();

        let ip = match family {
            4 => IpAddr::V4(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])),
            6 => IpAddr::V6(Ipv6Addr::from(ip)),
            _ => return Err(Error::MalformedFrame("bad address family")),
        };

        Ok(Self {
            id: Id::from(id),
            address: SocketAddr::new(ip, port),
        })
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub category: Category,
    pub kind: RpcKind,
    pub transaction_id: u16,
    pub sender: ContactInfo,
    /// Entry id: the lookup target, or the id of the carried blob.
    pub target: Id,
    /// Blob for [RpcKind::carries_blob] kinds, UTF-8 for [Category::Text].
    pub body: Bytes,
    /// Up to [N_CONTACTS] records, for [RpcKind::FoundNode].
    pub nodes: Vec<ContactInfo>,
}

impl Message {
    pub fn request(kind: RpcKind, sender: ContactInfo, target: Id) -> Self {
        Self {
            category: Category::Request,
            kind,
            transaction_id: 0,
            sender,
            target,
            body: Bytes::new(),
            nodes: Vec::new(),
        }
    }

    pub fn response(kind: RpcKind, sender: ContactInfo, request: &Message) -> Self {
        Self {
            category: Category::Response,
            transaction_id: request.transaction_id,
            target: request.target,
            ..Self::request(kind, sender, request.target)
        }
    }

    pub fn text(sender: ContactInfo, text: &str) -> Self {
        Self {
            category: Category::Text,
            body: Bytes::copy_from_slice(text.as_bytes()),
            ..Self::request(RpcKind::Failure, sender, Id::MIN)
        }
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn with_nodes(mut self, nodes: Vec<ContactInfo>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_transaction_id(mut self, transaction_id: u16) -> Self {
        self.transaction_id = transaction_id;
        self
    }

    /// Whether the header declares a body to be streamed after it.
    pub fn has_body(&self) -> bool {
        self.category == Category::Text || self.kind.carries_blob()
    }

    // === Encoding ===

    /// Encode the fixed header. The body, if any, is streamed separately.
    pub fn encode_header(&self) -> Result<BytesMut> {
        if self.body.len() > MAX_VALUE_SIZE {
            return Err(Error::MalformedFrame("body too large"));
        }
        if self.nodes.len() > N_CONTACTS {
            return Err(Error::MalformedFrame("too many contacts"));
        }

        let body_len = if self.has_body() { self.body.len() } else { 0 };

        let mut buf = BytesMut::with_capacity(HEADER_SIZE);

        buf.put_u8(self.category.to_u8());
        buf.put_u8(self.kind.to_u8());
        buf.put_u16(self.transaction_id);
        buf.put_u32((HEADER_SIZE + body_len) as u32);
        self.sender.encode(&mut buf);
        buf.put_slice(self.target.as_bytes());
        buf.put_u32(body_len as u32);
        buf.put_u8(self.nodes.len() as u8);

        for node in &self.nodes {
            node.encode(&mut buf);
        }
        buf.put_bytes(0, (N_CONTACTS - self.nodes.len()) * CONTACT_RECORD_SIZE);

        Ok(buf)
    }

    /// Header followed by body, in one buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = self.encode_header()?;
        if self.has_body() {
            buf.put_slice(&self.body);
        }
        Ok(buf.freeze())
    }

    // === Decoding ===

    /// Read the declared body length from a header, before the body is received.
    pub fn body_len(header: &[u8]) -> Result<usize> {
        if header.len() < HEADER_SIZE {
            return Err(Error::MalformedFrame("truncated header"));
        }

        let mut len = &header[BLOB_LEN_OFFSET..BLOB_LEN_OFFSET + 4];
        let len = len.get_u32() as usize;

        if len > MAX_VALUE_SIZE {
            return Err(Error::MalformedFrame("declared body too large"));
        }

        Ok(len)
    }

    /// Transaction id of a header, readable even if the rest fails to parse.
    pub fn peek_transaction_id(header: &[u8]) -> u16 {
        match header {
            [_, _, a, b, ..] => u16::from_be_bytes([*a, *b]),
            _ => 0,
        }
    }

    pub fn decode(header: &[u8], body: Bytes) -> Result<Message> {
        let body_len = Self::body_len(header)?;
        if body.len() != body_len {
            return Err(Error::MalformedFrame("body length mismatch"));
        }

        let mut buf = &header[..HEADER_SIZE];

        let category = Category::from_u8(buf.get_u8())?;
        let kind = RpcKind::from_u8(buf.get_u8())?;
        let transaction_id = buf.get_u16();

        if buf.get_u32() as usize != HEADER_SIZE + body_len {
            return Err(Error::MalformedFrame("total length mismatch"));
        }

        let sender = ContactInfo::decode(&mut buf)?;

        let mut target = [0u8; ID_SIZE];
        buf.copy_to_slice(&mut target);

        // Already validated by body_len.
        buf.advance(4);

        let count = buf.get_u8() as usize;
        if count > N_CONTACTS {
            return Err(Error::MalformedFrame("too many contacts"));
        }

        let nodes = (0..count)
            .map(|_| ContactInfo::decode(&mut buf))
            .collect::<Result<Vec<_>>>()?;

        Ok(Message {
            category,
            kind,
            transaction_id,
            sender,
            target: Id::from(target),
            body,
            nodes,
        })
    }

    /// Decode a whole frame held in one buffer.
    pub fn from_bytes(bytes: &[u8]) -> Result<Message> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::MalformedFrame("truncated header"));
        }
        let (header, body) = bytes.split_at(HEADER_SIZE);

        Self::decode(header, Bytes::copy_from_slice(body))
    }
}
