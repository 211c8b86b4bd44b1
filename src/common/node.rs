//! Struct and implementation of the Contact entry in the routing table
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::common::{ContactHandle, Id};
use crate::rpc::Link;

#[derive(Debug, Clone)]
/// A known peer: identity, address and liveness state.
///
/// Owned by the [ContactRegistry](crate::common::ContactRegistry), everything else refers
/// to it by [ContactHandle].
pub struct Contact {
    id: Id,
    address: SocketAddr,
    is_online: bool,
    last_seen: Instant,
    link: Option<Arc<Link>>,
}

impl Contact {
    /// Creates a new Contact from an id and socket address.
    pub fn new(id: Id, address: SocketAddr) -> Contact {
        Contact {
            id,
            address,
            is_online: true,
            last_seen: Instant::now(),
            link: None,
        }
    }

    #[cfg(test)]
    pub fn random() -> Contact {
        Contact::new(Id::random(), SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn is_online(&self) -> bool {
        self.is_online
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Time elapsed since the last successful exchange with this contact.
    pub fn idle(&self) -> Duration {
        self.last_seen.elapsed()
    }

    pub fn link(&self) -> Option<&Arc<Link>> {
        self.link.as_ref()
    }

    /// Returns `true` if this contact has a Link bound and that Link is still up.
    pub fn has_live_link(&self) -> bool {
        self.link.as_ref().map(|link| link.is_live()).unwrap_or(false)
    }

    // === Public Methods ===

    /// Record a successful exchange.
    pub(crate) fn touch(&mut self) {
        self.is_online = true;
        self.last_seen = Instant::now();
    }

    pub(crate) fn mark_offline(&mut self) {
        self.is_online = false;
    }

    pub(crate) fn bind_link(&mut self, link: Arc<Link>) {
        self.address = link.peer_addr();
        self.link = Some(link);
        self.touch();
    }

    /// The copy sent over the wire: identity and address only.
    pub(crate) fn detached(&self) -> Contact {
        Contact::new(self.id, self.address)
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.address == other.address
    }
}

/// A contact as seen by lookups: the registry handle plus the fields used to rank and dial it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRef {
    pub handle: ContactHandle,
    pub id: Id,
    pub address: SocketAddr,
}
