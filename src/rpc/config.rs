use std::{
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

use crate::common::{Id, MAX_CONTACTS};

use super::{DEFAULT_REQUEST_TIMEOUT, DEFAULT_TICK_INTERVAL};

#[derive(Debug, Clone)]
/// Dht Configurations
pub struct Config {
    /// Addresses (`host:port`) pinged at start-up before looking up our own id.
    ///
    /// Defaults to an empty list.
    pub bootstrap: Vec<String>,
    /// Explicit port to listen on.
    ///
    /// Defaults to None, where the OS picks a free port.
    pub port: Option<u16>,
    /// Interface to listen on, and the address advertised to peers.
    ///
    /// Defaults to `127.0.0.1`.
    pub bind_ip: IpAddr,
    /// Explicit node id.
    ///
    /// Defaults to None, where the id is the [digest](crate::common::digest) of the
    /// listening port.
    pub id: Option<Id>,
    /// Timeout for opening a Link and for awaiting a response to a request.
    ///
    /// A peer that does not answer within this duration is treated as unreachable.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// Capacity of the contact registry.
    ///
    /// Defaults to [MAX_CONTACTS]
    pub max_contacts: usize,
    /// How long the dispatch loop blocks waiting for an inbound frame before running
    /// its periodic maintenance.
    ///
    /// Defaults to [DEFAULT_TICK_INTERVAL]
    pub tick_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bootstrap: Vec::new(),
            port: None,
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            id: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_contacts: MAX_CONTACTS,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}
