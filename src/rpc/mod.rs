//! Node core: shared state, outbound RPCs and the inbound dispatch loop.

mod config;
mod iterative_query;
mod link;
mod server;

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use flume::{Receiver, Sender};
use tracing::{debug, info, trace};

use crate::common::{
    digest, port_id, ClosestNodes, Contact, ContactHandle, ContactInfo, ContentStore, Id,
    Message, RoutingTable, RpcKind,
};
use crate::{Error, Result};

pub use config::Config;
pub use iterative_query::Lookup;
pub use link::{Inbound, Link, LinkPool, CHUNK_SIZE};
pub use server::handle_request;

/// Default timeout for opening a Link and for awaiting a response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000); // 2 seconds
/// Default duration the dispatch loop blocks on an empty inbound queue.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Received text messages kept until read.
const MAX_PENDING_TEXTS: usize = 64;

/// A text message and the contact that sent it.
pub type TextMessage = (Contact, String);

#[derive(Debug)]
pub struct Rpc {
    local: ContactInfo,
    routing_table: Mutex<RoutingTable>,
    store: Mutex<ContentStore>,
    links: LinkPool,
    listener: TcpListener,
    inbound: Receiver<Inbound>,
    texts: (Sender<TextMessage>, Receiver<TextMessage>),
    config: Config,
    shutdown: AtomicBool,
}

impl Rpc {
    /// Bind the listener and set up an idle node.
    pub fn new(config: Config) -> Result<Self> {
        let listener =
            TcpListener::bind(SocketAddr::new(config.bind_ip, config.port.unwrap_or(0)))?;
        listener.set_nonblocking(true)?;

        let local_addr = listener.local_addr()?;
        let id = config.id.unwrap_or_else(|| port_id(local_addr.port()));
        let local = ContactInfo::new(id, local_addr);

        let (inbound_sender, inbound) = flume::unbounded();

        info!(%id, address = ?local_addr, "Node listening");

        Ok(Rpc {
            local,
            routing_table: Mutex::new(RoutingTable::with_capacity(id, config.max_contacts)),
            store: Mutex::new(ContentStore::new()),
            links: LinkPool::new(local, config.request_timeout, inbound_sender),
            listener,
            inbound,
            texts: flume::bounded(MAX_PENDING_TEXTS),
            config,
            shutdown: AtomicBool::new(false),
        })
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.local.id
    }

    /// Returns the address the node is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local.address
    }

    /// Our own identity, as sent in every frame.
    pub fn local(&self) -> ContactInfo {
        self.local
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns a clone of the routing_table.
    pub fn routing_table(&self) -> RoutingTable {
        lock(&self.routing_table).clone()
    }

    /// The closest contacts we know to `target`.
    pub fn closest(&self, target: &Id) -> ClosestNodes {
        lock(&self.routing_table).closest(target)
    }

    /// The registered contact behind `handle`, or a detached one built from the Link's peer.
    pub fn contact(&self, handle: Option<ContactHandle>, link: &Link) -> Contact {
        handle
            .and_then(|handle| lock(&self.routing_table).get(handle).cloned())
            .unwrap_or_else(|| Contact::new(link.peer().id, link.peer_addr()))
    }

    pub fn links(&self) -> &LinkPool {
        &self.links
    }

    /// Receiver of text messages sent by peers.
    pub fn messages(&self) -> Receiver<TextMessage> {
        self.texts.1.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    // === Local store ===

    /// Insert into the local store, returns `false` if the id was already stored.
    pub fn put_local(&self, id: Id, value: Bytes) -> Result<bool> {
        lock(&self.store).insert(id, value)
    }

    /// Store a blob locally under its digest, without touching the network.
    pub fn save_local(&self, value: Bytes) -> Result<Id> {
        let id = digest(&value);
        self.put_local(id, value)?;
        Ok(id)
    }

    pub fn load_local(&self, id: &Id) -> Option<Bytes> {
        lock(&self.store).get(id)
    }

    // === Outbound RPCs ===

    /// Open (or reuse) a Link to `address`, send a Ping and register the peer.
    ///
    /// Returns the Link and the registry handle of the peer, `None` if it is ourselves.
    pub fn ping(&self, address: SocketAddr) -> Result<(Arc<Link>, Option<ContactHandle>)> {
        let link = self.links.open(address)?;

        self.send_rpc(&link, Message::request(RpcKind::Ping, self.local, self.local.id))?;

        let peer = *link.peer();
        let handle = self.register(&peer, &link)?;

        Ok((link, handle))
    }

    /// Send a request over `link`.
    ///
    /// Only [RpcKind::FindNode] and [RpcKind::FindValue] wait for a response, every other
    /// kind is fire-and-forget and returns `Ok(None)` once written.
    pub fn send_rpc(&self, link: &Link, request: Message) -> Result<Option<Message>> {
        let expected: &[RpcKind] = match request.kind {
            RpcKind::FindNode => &[RpcKind::FoundNode],
            // A value miss is answered as a node lookup.
            RpcKind::FindValue => &[RpcKind::FoundValue, RpcKind::FoundNode],
            _ => {
                link.send(&request)?;
                return Ok(None);
            }
        };

        let response = link.request(request, self.config.request_timeout)?;

        if !expected.contains(&response.kind) {
            return Err(Error::ProtocolMismatch {
                expected: expected[0],
                got: response.kind,
            });
        }

        let mut table = lock(&self.routing_table);
        if let Some(handle) = table.registry().find(&link.peer().id) {
            table.touch(handle);
        }
        drop(table);

        Ok(Some(response))
    }

    /// Find the closest live nodes to `id` and send each of them a Store.
    ///
    /// Returns the number of nodes the value was sent to.
    pub fn store_value(&self, id: Id, value: Bytes) -> usize {
        let lookup = self.lookup(id, false);
        let request = Message::request(RpcKind::Store, self.local, id).with_body(value);

        let mut stored = 0;
        for node in lookup.closest() {
            match self
                .links
                .open(node.address)
                .and_then(|link| self.send_rpc(&link, request.clone()))
            {
                Ok(_) => stored += 1,
                Err(error) => debug!(context = "store_value", to = ?node.address, ?error),
            }
        }

        debug!(context = "store_value", %id, stored, "Stored value");

        stored
    }

    /// Iterative value lookup.
    pub fn find_value(&self, id: Id) -> Option<Bytes> {
        self.lookup(id, true).into_value()
    }

    /// Iterative node lookup, returns the closest contacts found.
    pub fn find_node(&self, target: Id) -> Vec<Contact> {
        let lookup = self.lookup(target, false);
        let table = lock(&self.routing_table);

        lookup
            .closest()
            .into_iter()
            .map(|node| match table.get(node.handle) {
                Some(contact) if contact.id() == &node.id => contact.clone(),
                _ => Contact::new(node.id, node.address),
            })
            .collect()
    }

    /// Run an iterative lookup towards `target`.
    pub fn lookup(&self, target: Id, want_value: bool) -> Lookup {
        iterative_query::run(self, target, want_value)
    }

    /// Send a blob as a Store to every open Link, without a lookup.
    pub fn send_store(&self, value: Bytes) -> Result<Id> {
        let id = self.save_local(value.clone())?;
        let request = Message::request(RpcKind::Store, self.local, id).with_body(value);

        let sent = self
            .links
            .links()
            .iter()
            .filter(|link| link.send(&request).is_ok())
            .count();

        debug!(context = "send_store", %id, sent);

        Ok(id)
    }

    /// Broadcast a text message to every open Link, returns how many it was sent to.
    pub fn say(&self, text: &str) -> usize {
        let message = Message::text(self.local, text);

        self.links
            .links()
            .iter()
            .filter(|link| link.send(&message).is_ok())
            .count()
    }

    /// Ping every bootstrap address, then look up our own id to fill the routing table.
    pub fn bootstrap(&self) {
        if self.config.bootstrap.is_empty() {
            return;
        }

        for address in self
            .config
            .bootstrap
            .iter()
            .filter_map(|s| s.to_socket_addrs().ok().and_then(|mut a| a.next()))
        {
            if let Err(error) = self.ping(address) {
                debug!(context = "bootstrap", ?address, ?error, "Bootstrap node unreachable");
            }
        }

        self.lookup(self.local.id, false);

        let table_size = lock(&self.routing_table).size();
        if table_size == 0 {
            info!("Could not bootstrap the routing table");
        } else {
            info!(table_size, "Populated the routing table");
        }
    }

    // === Dispatch ===

    /// Handshake every pending inbound connection.
    pub fn accept_pending(&self) {
        loop {
            match self.listener.accept() {
                Ok((stream, from)) => match self.links.accept(stream) {
                    Ok(link) => trace!(context = "accept", ?from, peer = ?link.peer_addr()),
                    Err(error) => debug!(context = "accept", ?from, ?error, "Handshake failed"),
                },
                Err(error) if error.kind() == ErrorKind::WouldBlock => break,
                Err(error) => {
                    debug!(context = "accept", ?error);
                    break;
                }
            }
        }
    }

    /// Answer at most one inbound frame, then sweep dead Links.
    pub fn tick(&self) {
        if let Ok(Inbound { link, message }) = self.inbound.recv_timeout(self.config.tick_interval)
        {
            server::handle_inbound(self, &link, message);
        }

        self.clean_contacts();
    }

    /// Mark contacts whose Link died as offline, and drop dead Links.
    pub fn clean_contacts(&self) {
        let offline = lock(&self.routing_table).clean();
        let closed = self.links.clean();

        if offline > 0 || closed > 0 {
            debug!(context = "clean_contacts", offline, closed);
        }
    }

    /// Stop serving and close every Link.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.links.close_all();

        let bound: Vec<Arc<Link>> = lock(&self.routing_table)
            .registry()
            .iter()
            .filter_map(|(_, contact)| contact.link().cloned())
            .collect();

        // Closing waits on each Link's writer, never under the table lock.
        for link in bound {
            link.close();
        }

        debug!(context = "shutdown", id = %self.local.id);
    }

    // === Private Methods ===

    /// Add a peer to the routing table and bind the Link it was reached through.
    fn register(&self, peer: &ContactInfo, link: &Arc<Link>) -> Result<Option<ContactHandle>> {
        let mut table = lock(&self.routing_table);

        let handle = table.add(Contact::new(peer.id, peer.address))?;
        if let Some(handle) = handle {
            table.bind_link(handle, link.clone());
        }

        Ok(handle)
    }

    fn mark_offline(&self, handle: ContactHandle) {
        lock(&self.routing_table).mark_offline(handle);
    }

    fn deliver_text(&self, text: TextMessage) {
        // Dropped if nobody reads them.
        let _ = self.texts.0.try_send(text);
    }
}

/// Lock a mutex, recovering the data from a poisoned lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::*;

    fn node() -> Arc<Rpc> {
        node_with(Config::default())
    }

    fn node_with(config: Config) -> Arc<Rpc> {
        let rpc = Arc::new(Rpc::new(config).unwrap());

        let serving = rpc.clone();
        thread::spawn(move || {
            while !serving.is_shutdown() {
                serving.accept_pending();
                serving.tick();
            }
        });

        rpc
    }

    #[test]
    fn default_id_is_port_digest() {
        let rpc = Rpc::new(Config::default()).unwrap();
        assert_eq!(rpc.id(), &port_id(rpc.local_addr().port()));
    }

    #[test]
    fn explicit_id() {
        let id = Id::random();
        let rpc = Rpc::new(Config {
            id: Some(id),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(rpc.id(), &id);
    }

    #[test]
    fn save_and_load_local() {
        let rpc = Rpc::new(Config::default()).unwrap();
        let value = Bytes::from_static(b"local only");

        let id = rpc.save_local(value.clone()).unwrap();

        assert_eq!(id, digest(&value));
        assert_eq!(rpc.load_local(&id), Some(value));
        assert!(rpc.links().links().is_empty());
    }

    #[test]
    fn ping_registers_both_sides() {
        let a = node();
        let b = node();

        let (link, handle) = a.ping(b.local_addr()).unwrap();

        assert_eq!(link.peer().id, *b.id());
        assert!(handle.is_some());
        assert!(a.routing_table().find(b.id()).is_some());

        // B registers A when it handles the Ping.
        let start = std::time::Instant::now();
        while b.routing_table().find(a.id()).is_none() && start.elapsed() < Duration::from_secs(2)
        {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(b.routing_table().find(a.id()).is_some());

        a.shutdown();
        b.shutdown();
    }

    #[test]
    fn contact_of_a_pinged_peer() {
        let a = node();
        let b = node();

        let (link, handle) = a.ping(b.local_addr()).unwrap();

        let registered = a.contact(handle, &link);
        assert_eq!(registered.id(), b.id());
        assert!(registered.has_live_link());

        let detached = a.contact(None, &link);
        assert_eq!(detached.id(), b.id());
        assert_eq!(detached.address(), b.local_addr());
        assert!(detached.link().is_none());

        a.shutdown();
        b.shutdown();
    }

    #[test]
    fn shutdown_closes_contact_links() {
        let a = node();
        let b = node();

        let (link, handle) = a.ping(b.local_addr()).unwrap();
        let bound = a.routing_table().get(handle.unwrap()).unwrap().link().cloned().unwrap();

        a.shutdown();

        assert!(!link.is_live());
        assert!(!bound.is_live());
        // The table is still usable once the Links are closed.
        assert!(a.routing_table().find(b.id()).is_some());

        b.shutdown();
    }

    #[test]
    fn ping_self_is_refused() {
        let a = node();

        assert!(matches!(
            a.ping(a.local_addr()),
            Err(Error::Unreachable(_))
        ));
        assert!(a.routing_table().is_empty());

        a.shutdown();
    }

    #[test]
    fn find_value_hit_and_miss() {
        let a = node();
        let b = node();

        let value = Bytes::from_static(b"held by b");
        let id = b.save_local(value.clone()).unwrap();

        a.ping(b.local_addr()).unwrap();

        assert_eq!(a.find_value(id), Some(value));
        assert_eq!(a.find_value(Id::random()), None);

        a.shutdown();
        b.shutdown();
    }

    #[test]
    fn store_value_reaches_peers() {
        let a = node();
        let b = node();
        let c = node();

        a.ping(b.local_addr()).unwrap();
        a.ping(c.local_addr()).unwrap();

        let value = Bytes::from_static(b"replicated");
        let id = digest(&value);

        assert_eq!(a.store_value(id, value.clone()), 2);

        let start = std::time::Instant::now();
        while (b.load_local(&id).is_none() || c.load_local(&id).is_none())
            && start.elapsed() < Duration::from_secs(2)
        {
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(b.load_local(&id), Some(value.clone()));
        assert_eq!(c.load_local(&id), Some(value));

        a.shutdown();
        b.shutdown();
        c.shutdown();
    }

    /// A node that never ticks, so only explicit calls change its contacts.
    fn idle_node() -> Arc<Rpc> {
        Arc::new(
            Rpc::new(Config {
                request_timeout: Duration::from_millis(500),
                ..Default::default()
            })
            .unwrap(),
        )
    }

    #[test]
    fn sweep_marks_dead_contacts_offline() {
        let a = idle_node();
        let b = node();

        let (_, handle) = a.ping(b.local_addr()).unwrap();
        let handle = handle.unwrap();
        assert!(a.routing_table().get(handle).unwrap().is_online());

        b.shutdown();

        let start = std::time::Instant::now();
        while a.routing_table().get(handle).unwrap().has_live_link()
            && start.elapsed() < Duration::from_secs(2)
        {
            thread::sleep(Duration::from_millis(5));
        }

        a.clean_contacts();

        let table = a.routing_table();
        assert_eq!(table.find(b.id()), Some(handle));
        assert!(!table.get(handle).unwrap().is_online());

        a.shutdown();
    }

    #[test]
    fn offline_contact_comes_back_online() {
        let a = idle_node();
        let b = node();
        let id = *b.id();

        let (_, handle) = a.ping(b.local_addr()).unwrap();
        let handle = handle.unwrap();
        let first_seen = a.routing_table().get(handle).unwrap().last_seen();

        b.shutdown();

        let start = std::time::Instant::now();
        while a.routing_table().get(handle).unwrap().has_live_link()
            && start.elapsed() < Duration::from_secs(2)
        {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(a.routing_table().get(handle).unwrap().is_online());

        // The failed query marks the contact offline without removing it.
        let lookup = a.lookup(Id::random(), false);
        assert_eq!(lookup.visited(), 0);

        let table = a.routing_table();
        assert_eq!(table.find(&id), Some(handle));
        assert!(!table.get(handle).unwrap().is_online());

        // Same id, new address.
        let back = node_with(Config {
            id: Some(id),
            ..Default::default()
        });
        thread::sleep(Duration::from_millis(10));

        let (_, again) = a.ping(back.local_addr()).unwrap();
        assert_eq!(again, Some(handle));

        let table = a.routing_table();
        let contact = table.get(handle).unwrap();
        assert!(contact.is_online());
        assert!(contact.last_seen() > first_seen);
        assert_eq!(contact.address(), back.local_addr());

        a.shutdown();
        back.shutdown();
    }

    #[test]
    fn text_messages() {
        let a = node();
        let b = node();

        a.ping(b.local_addr()).unwrap();
        let messages = b.messages();

        assert_eq!(a.say("hello b"), 1);

        let (from, text) = messages.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(from.id(), a.id());
        assert_eq!(text, "hello b");

        a.shutdown();
        b.shutdown();
    }
}
