//! Main Crate Error

use std::net::SocketAddr;

use crate::common::RpcKind;

#[derive(thiserror::Error, Debug)]
/// Kadht crate error enum.
pub enum Error {
    /// The Link to a peer could not be opened, or died mid-call.
    #[error("Peer at {0} is unreachable")]
    Unreachable(SocketAddr),

    /// A response arrived, but not the kind the request expects.
    #[error("Expected {expected:?} response, got {got:?}")]
    ProtocolMismatch { expected: RpcKind, got: RpcKind },

    /// Every slot of the content store is taken.
    #[error("Content store is full")]
    StoreFull,

    /// Every slot of the contact registry is referenced by a bucket.
    #[error("Contact registry is full")]
    RegistryFull,

    /// An incoming frame could not be parsed.
    #[error("Malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// Id bytes of the wrong length.
    #[error("Invalid Id size, expected 20, got {0}")]
    InvalidIdSize(usize),

    /// Id string that is not 40 hex characters.
    #[error("Invalid Id encoding: {0}")]
    InvalidIdEncoding(String),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),
}

/// Alias for `Result<T, kadht::Error>`.
pub type Result<T, E = Error> = std::result::Result<T, E>;
