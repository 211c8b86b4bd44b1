#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

// Public modules
pub mod common;
mod error;

#[cfg(feature = "async")]
pub mod async_dht;
mod dht;
pub mod rpc;

pub use crate::common::{digest, Contact, Id, RoutingTable};
pub use bytes::Bytes;
pub use dht::{Dht, DhtBuilder, DhtError, DhtWasShutdown, Testnet};
pub use error::{Error, Result};

pub mod errors {
    //! Exported errors
    pub use super::dht::{DhtError, DhtWasShutdown};
    pub use super::error::Error;
}
