//! Dht node.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    thread,
    time::Duration,
};

use bytes::Bytes;
use flume::{Receiver, Sender};
use tracing::debug;

use crate::{
    common::{digest, Contact, Id, RoutingTable},
    rpc::{Config, Rpc, TextMessage},
    Error, Result,
};

#[derive(Debug, Clone)]
/// Kademlia node, a handle to the threads running it.
///
/// Cloning is cheap, the node stops once [Dht::shutdown] is called or every clone is
/// dropped.
pub struct Dht {
    pub(crate) sender: Sender<ActorMessage>,
    id: Id,
    local_addr: SocketAddr,
}

#[derive(Debug, Default, Clone)]
pub struct DhtBuilder(Config);

impl DhtBuilder {
    /// Set the port to listen on.
    pub fn port(mut self, port: u16) -> Self {
        self.0.port = Some(port);
        self
    }

    /// Set the interface to listen on.
    pub fn bind_ip(mut self, ip: IpAddr) -> Self {
        self.0.bind_ip = ip;
        self
    }

    /// Set an explicit node id instead of the digest of the port.
    pub fn id(mut self, id: Id) -> Self {
        self.0.id = Some(id);
        self
    }

    /// Set bootstrapping nodes.
    pub fn bootstrap(mut self, bootstrap: &[String]) -> Self {
        self.0.bootstrap = bootstrap.to_vec();
        self
    }

    /// Set the timeout for opening Links and awaiting responses.
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.0.request_timeout = request_timeout;
        self
    }

    /// Set the capacity of the contact registry.
    pub fn max_contacts(mut self, max_contacts: usize) -> Self {
        self.0.max_contacts = max_contacts;
        self
    }

    /// Create a Dht node.
    pub fn build(self) -> Result<Dht> {
        Dht::new(self.0)
    }
}

impl Dht {
    /// Returns a builder to edit settings before creating a Dht node.
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    /// Bind the listener, start the node threads and bootstrap.
    ///
    /// Requests made while bootstrapping wait for it to finish.
    pub fn new(config: Config) -> Result<Self> {
        let rpc = Arc::new(Rpc::new(config)?);
        let (sender, receiver) = flume::unbounded();

        let dht = Dht {
            sender,
            id: *rpc.id(),
            local_addr: rpc.local_addr(),
        };

        let name = rpc.local_addr().port();

        let listening = rpc.clone();
        thread::Builder::new()
            .name(format!("kadht listener {name}"))
            .spawn(move || {
                let interval = listening.config().tick_interval;
                while !listening.is_shutdown() {
                    listening.accept_pending();
                    thread::sleep(interval);
                }
            })?;

        let dispatching = rpc.clone();
        thread::Builder::new()
            .name(format!("kadht dispatch {name}"))
            .spawn(move || {
                while !dispatching.is_shutdown() {
                    dispatching.tick();
                }
            })?;

        thread::Builder::new()
            .name(format!("kadht actor {name}"))
            .spawn(move || run(rpc, receiver))?;

        Ok(dht)
    }

    // === Getters ===

    /// Returns the id of this node.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Returns the address the node is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns a snapshot of the routing table.
    pub fn routing_table(&self) -> Result<RoutingTable, DhtWasShutdown> {
        self.call(ActorMessage::RoutingTable)
    }

    /// Receiver of text messages sent by peers, see [Dht::say].
    pub fn messages(&self) -> Result<Receiver<TextMessage>, DhtWasShutdown> {
        self.call(ActorMessage::Messages)
    }

    // === Public Methods ===

    /// Shutdown the node threads and close every Link.
    pub fn shutdown(&self) {
        let _ = self.call(ActorMessage::Shutdown);
    }

    /// Ping a node, adding it to the routing table if it answers.
    pub fn ping(&self, address: SocketAddr) -> Result<Contact, DhtError> {
        Ok(self.call(|sender| ActorMessage::Ping(address, sender))??)
    }

    /// Look up the closest nodes to a target.
    pub fn find_node(&self, target: Id) -> Result<Vec<Contact>, DhtWasShutdown> {
        self.call(|sender| ActorMessage::FindNode(target, sender))
    }

    // === Values ===

    /// Store a blob locally and on the closest nodes to its digest.
    ///
    /// Returns the digest, the id to [Dht::get] the blob with.
    pub fn put(&self, value: Bytes) -> Result<Id, DhtError> {
        let id = digest(&value);
        self.put_with_id(id, value)?;
        Ok(id)
    }

    /// Store a blob under an explicit id, locally and on the closest nodes to that id.
    ///
    /// Returns the number of nodes the blob was sent to.
    pub fn put_with_id(&self, id: Id, value: Bytes) -> Result<usize, DhtError> {
        Ok(self.call(|sender| ActorMessage::Put(id, value, sender))??)
    }

    /// Get a blob, from the local store first, then from the network.
    pub fn get(&self, id: Id) -> Result<Option<Bytes>, DhtWasShutdown> {
        self.call(|sender| ActorMessage::Get(id, sender))
    }

    /// Store a blob in the local store only.
    pub fn save_local(&self, value: Bytes) -> Result<Id, DhtError> {
        Ok(self.call(|sender| ActorMessage::SaveLocal(value, sender))??)
    }

    /// Read a blob from the local store only.
    pub fn load_local(&self, id: Id) -> Result<Option<Bytes>, DhtWasShutdown> {
        self.call(|sender| ActorMessage::LoadLocal(id, sender))
    }

    /// Send a blob to every directly connected node, without a lookup.
    pub fn send_store(&self, value: Bytes) -> Result<Id, DhtError> {
        Ok(self.call(|sender| ActorMessage::SendStore(value, sender))??)
    }

    /// Send a text message to every directly connected node.
    ///
    /// Returns how many nodes it was sent to.
    pub fn say(&self, text: &str) -> Result<usize, DhtWasShutdown> {
        let text = text.to_string();
        self.call(|sender| ActorMessage::Say(text, sender))
    }

    // === Private Methods ===

    fn call<T>(
        &self,
        message: impl FnOnce(Sender<T>) -> ActorMessage,
    ) -> Result<T, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<T>(1);

        self.sender
            .send(message(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }
}

/// Actor loop, owns the outbound side of the node.
fn run(rpc: Arc<Rpc>, receiver: Receiver<ActorMessage>) {
    rpc.bootstrap();

    while let Ok(actor_message) = receiver.recv() {
        match actor_message {
            ActorMessage::Shutdown(sender) => {
                rpc.shutdown();
                let _ = sender.send(());
                return;
            }
            ActorMessage::RoutingTable(sender) => {
                let _ = sender.send(rpc.routing_table());
            }
            ActorMessage::Messages(sender) => {
                let _ = sender.send(rpc.messages());
            }
            ActorMessage::Ping(address, sender) => {
                let result = rpc
                    .ping(address)
                    .map(|(link, handle)| rpc.contact(handle, &link));
                let _ = sender.send(result);
            }
            ActorMessage::FindNode(target, sender) => {
                let _ = sender.send(rpc.find_node(target));
            }
            ActorMessage::Put(id, value, sender) => {
                let result = rpc
                    .put_local(id, value.clone())
                    .map(|_| rpc.store_value(id, value));
                let _ = sender.send(result);
            }
            ActorMessage::Get(id, sender) => {
                let value = rpc.load_local(&id).or_else(|| rpc.find_value(id));
                let _ = sender.send(value);
            }
            ActorMessage::SaveLocal(value, sender) => {
                let _ = sender.send(rpc.save_local(value));
            }
            ActorMessage::LoadLocal(id, sender) => {
                let _ = sender.send(rpc.load_local(&id));
            }
            ActorMessage::SendStore(value, sender) => {
                let _ = sender.send(rpc.send_store(value));
            }
            ActorMessage::Say(text, sender) => {
                let _ = sender.send(rpc.say(&text));
            }
        }
    }

    // Every handle was dropped.
    debug!(id = %rpc.id(), "Dht dropped");
    rpc.shutdown();
}

#[derive(Debug)]
pub(crate) enum ActorMessage {
    Shutdown(Sender<()>),
    RoutingTable(Sender<RoutingTable>),
    Messages(Sender<Receiver<TextMessage>>),
    Ping(SocketAddr, Sender<Result<Contact>>),
    FindNode(Id, Sender<Vec<Contact>>),
    Put(Id, Bytes, Sender<Result<usize>>),
    Get(Id, Sender<Option<Bytes>>),
    SaveLocal(Bytes, Sender<Result<Id>>),
    LoadLocal(Id, Sender<Option<Bytes>>),
    SendStore(Bytes, Sender<Result<Id>>),
    Say(String, Sender<usize>),
}

/// Create a testnet of Dht nodes on loopback.
#[derive(Debug)]
pub struct Testnet {
    pub bootstrap: Vec<String>,
    pub nodes: Vec<Dht>,
}

impl Testnet {
    /// `count` nodes, each bootstrapped from the first one.
    pub fn new(count: usize) -> Result<Testnet> {
        let mut nodes: Vec<Dht> = vec![];
        let mut bootstrap = vec![];

        for i in 0..count {
            if i == 0 {
                let node = Dht::builder().build()?;

                bootstrap.push(node.local_addr().to_string());

                nodes.push(node)
            } else {
                let node = Dht::builder().bootstrap(&bootstrap).build()?;
                nodes.push(node)
            }
        }

        // Wait for every node to finish bootstrapping.
        for node in &nodes {
            let _ = node.routing_table();
        }

        Ok(Self { bootstrap, nodes })
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("The Dht was shutdown")]
/// The node threads stopped before answering.
pub struct DhtWasShutdown;

#[derive(thiserror::Error, Debug)]
/// Errors of [Dht] operations that can fail for reasons other than shutdown.
pub enum DhtError {
    #[error(transparent)]
    Shutdown(#[from] DhtWasShutdown),

    #[error(transparent)]
    /// Transparent [Error]
    Rpc(#[from] Error),
}
