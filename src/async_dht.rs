//! AsyncDht node.

use std::net::SocketAddr;

use bytes::Bytes;
use flume::{Receiver, Sender};

use crate::{
    common::{digest, Contact, Id, RoutingTable},
    dht::{ActorMessage, Dht, DhtError, DhtWasShutdown},
    rpc::TextMessage,
};

impl Dht {
    /// Return an async version of the Dht client.
    pub fn as_async(self) -> AsyncDht {
        AsyncDht(self)
    }
}

#[derive(Debug, Clone)]
/// Async version of the Dht node.
pub struct AsyncDht(Dht);

impl AsyncDht {
    // === Getters ===

    /// Returns the id of this node.
    pub fn id(&self) -> &Id {
        self.0.id()
    }

    /// Returns the address the node is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.0.local_addr()
    }

    /// Returns a snapshot of the routing table.
    pub async fn routing_table(&self) -> Result<RoutingTable, DhtWasShutdown> {
        self.call(ActorMessage::RoutingTable).await
    }

    /// Receiver of text messages sent by peers.
    pub async fn messages(&self) -> Result<Receiver<TextMessage>, DhtWasShutdown> {
        self.call(ActorMessage::Messages).await
    }

    // === Public Methods ===

    /// Shutdown the actor thread loop.
    pub async fn shutdown(&self) {
        let _ = self.call(ActorMessage::Shutdown).await;
    }

    pub async fn ping(&self, address: SocketAddr) -> Result<Contact, DhtError> {
        Ok(self
            .call(|sender| ActorMessage::Ping(address, sender))
            .await??)
    }

    pub async fn find_node(&self, target: Id) -> Result<Vec<Contact>, DhtWasShutdown> {
        self.call(|sender| ActorMessage::FindNode(target, sender))
            .await
    }

    // === Values ===

    /// Async version of [Dht::put].
    pub async fn put(&self, value: Bytes) -> Result<Id, DhtError> {
        let id = digest(&value);
        self.put_with_id(id, value).await?;
        Ok(id)
    }

    pub async fn put_with_id(&self, id: Id, value: Bytes) -> Result<usize, DhtError> {
        Ok(self
            .call(|sender| ActorMessage::Put(id, value, sender))
            .await??)
    }

    /// Async version of [Dht::get].
    pub async fn get(&self, id: Id) -> Result<Option<Bytes>, DhtWasShutdown> {
        self.call(|sender| ActorMessage::Get(id, sender)).await
    }

    // === Private Methods ===

    async fn call<T>(
        &self,
        message: impl FnOnce(Sender<T>) -> ActorMessage,
    ) -> Result<T, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<T>(1);

        self.0
            .sender
            .send(message(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }
}

#[cfg(test)]
mod test {
    use crate::dht::Testnet;

    use super::*;

    #[test]
    fn shutdown() {
        async fn test() {
            let dht = Dht::builder().build().unwrap().as_async();

            let a = dht.clone();

            dht.shutdown().await;

            let result = a.get(Id::random()).await;

            assert!(matches!(result, Err(DhtWasShutdown)))
        }
        futures::executor::block_on(test());
    }

    #[test]
    fn put_get() {
        async fn test() {
            let testnet = Testnet::new(5).unwrap();

            let a = Dht::builder()
                .bootstrap(&testnet.bootstrap)
                .build()
                .unwrap()
                .as_async();
            let b = Dht::builder()
                .bootstrap(&testnet.bootstrap)
                .build()
                .unwrap()
                .as_async();

            let value = Bytes::from_static(b"Hello World!");

            let id = a.put(value.clone()).await.expect("failed to put");

            let got = b.get(id).await.unwrap();

            assert_eq!(got, Some(value));

            a.shutdown().await;
            b.shutdown().await;
            for node in testnet.nodes {
                node.shutdown();
            }
        }

        futures::executor::block_on(test());
    }

    #[test]
    fn find_node_includes_bootstrap() {
        async fn test() {
            let testnet = Testnet::new(3).unwrap();

            let a = Dht::builder()
                .bootstrap(&testnet.bootstrap)
                .build()
                .unwrap()
                .as_async();

            let nodes = a.find_node(*a.id()).await.unwrap();

            assert!(nodes.iter().any(|n| n.id() == testnet.nodes[0].id()));

            a.shutdown().await;
            for node in testnet.nodes {
                node.shutdown();
            }
        }

        futures::executor::block_on(test());
    }
}
