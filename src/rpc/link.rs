//! TCP transport between two nodes.
//!
//! Each [Link] owns one stream and one reader thread. The reader parses whole frames and
//! routes requests and text to the node's shared inbound queue, and responses to the
//! Link's single-slot mailbox where the blocked requester picks them up.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use flume::{Receiver, Sender};
use tracing::{debug, trace};

use crate::common::{
    Category, ContactInfo, Message, RpcKind, CONTACT_RECORD_SIZE, HEADER_SIZE,
};
use crate::{Error, Result};

use super::lock;

/// Largest slice of a body written in one call.
pub const CHUNK_SIZE: usize = 4096;

const NOT_AWAITING: u32 = u32::MAX;

/// A request or text frame, with the Link to answer it on.
#[derive(Debug)]
pub struct Inbound {
    pub link: Arc<Link>,
    pub message: Message,
}

#[derive(Debug)]
pub struct Link {
    local: ContactInfo,
    /// Identity and listening address announced by the peer during the handshake.
    peer: ContactInfo,
    writer: Mutex<TcpStream>,
    live: AtomicBool,
    next_tid: AtomicU16,
    /// Transaction id the current exchange waits for, or [NOT_AWAITING].
    awaiting: AtomicU32,
    /// Held for a whole request/response exchange, one outstanding request per Link.
    exchange: Mutex<()>,
    mailbox: Receiver<Message>,
}

impl Link {
    /// Connect to `address` and handshake.
    pub fn open(
        local: ContactInfo,
        address: SocketAddr,
        timeout: Duration,
        inbound: Sender<Inbound>,
    ) -> Result<Arc<Link>> {
        let stream = TcpStream::connect_timeout(&address, timeout).map_err(|error| {
            debug!(context = "link_open", ?address, ?error, "Connect failed");
            Error::Unreachable(address)
        })?;

        Self::establish(stream, local, timeout, inbound).map_err(|error| {
            debug!(context = "link_open", ?address, ?error, "Handshake failed");
            Error::Unreachable(address)
        })
    }

    /// Handshake a stream accepted by the listener.
    pub fn accept(
        stream: TcpStream,
        local: ContactInfo,
        timeout: Duration,
        inbound: Sender<Inbound>,
    ) -> Result<Arc<Link>> {
        stream.set_nonblocking(false)?;
        Self::establish(stream, local, timeout, inbound)
    }

    // === Getters ===

    pub fn peer(&self) -> &ContactInfo {
        &self.peer
    }

    /// Listening address of the peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer.address
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    // === Public Methods ===

    /// Send a frame without waiting for an answer.
    pub fn send(&self, message: &Message) -> Result<()> {
        let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
        self.write_frame(&message.clone().with_transaction_id(tid))
    }

    /// Answer a request, echoing its transaction id.
    pub fn respond(&self, response: &Message) -> Result<()> {
        self.write_frame(response)
    }

    /// Send a request and block until its response arrives, the Link dies, or
    /// `timeout` elapses.
    pub fn request(&self, message: Message, timeout: Duration) -> Result<Message> {
        let _exchange = lock(&self.exchange);

        let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);

        // A response that arrived after its requester gave up.
        while self.mailbox.try_recv().is_ok() {}

        self.awaiting.store(tid as u32, Ordering::Release);

        let result = self
            .write_frame(&message.with_transaction_id(tid))
            .and_then(|_| loop {
                match self.mailbox.recv_timeout(timeout) {
                    Ok(response) if response.transaction_id == tid => break Ok(response),
                    Ok(_) => continue,
                    Err(_) => break Err(Error::Unreachable(self.peer.address)),
                }
            });

        self.awaiting.store(NOT_AWAITING, Ordering::Release);

        result
    }

    /// Shut the stream down, which also stops the reader thread.
    pub fn close(&self) {
        self.live.store(false, Ordering::Release);
        let _ = lock(&self.writer).shutdown(Shutdown::Both);
    }

    // === Private Methods ===

    fn establish(
        stream: TcpStream,
        local: ContactInfo,
        timeout: Duration,
        inbound: Sender<Inbound>,
    ) -> Result<Arc<Link>> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        let remote = stream.peer_addr()?;

        let mut record = BytesMut::with_capacity(CONTACT_RECORD_SIZE);
        local.encode(&mut record);
        (&stream).write_all(&record)?;

        let mut buf = [0u8; CONTACT_RECORD_SIZE];
        (&stream).read_exact(&mut buf)?;
        let mut peer = ContactInfo::decode(&mut &buf[..])?;

        // A peer listening on every interface is reachable where it connected from.
        if peer.address.ip().is_unspecified() {
            peer.address.set_ip(remote.ip());
        }

        stream.set_read_timeout(None)?;

        let reader = stream.try_clone()?;
        let (mailbox_sender, mailbox) = flume::bounded(1);

        let link = Arc::new(Link {
            local,
            peer,
            writer: Mutex::new(stream),
            live: AtomicBool::new(true),
            next_tid: AtomicU16::new(0),
            awaiting: AtomicU32::new(NOT_AWAITING),
            exchange: Mutex::new(()),
            mailbox,
        });

        let reading = link.clone();
        thread::Builder::new()
            .name(format!("kadht link {}", peer.address))
            .spawn(move || reading.read_loop(reader, mailbox_sender, inbound))?;

        trace!(context = "link_open", local = ?local.address, peer = ?peer.address, peer_id = %peer.id);

        Ok(link)
    }

    fn write_frame(&self, message: &Message) -> Result<()> {
        if !self.is_live() {
            return Err(Error::Unreachable(self.peer.address));
        }

        let header = message.encode_header()?;

        trace!(
            context = "link_sending",
            peer = ?self.peer.address,
            category = ?message.category,
            kind = ?message.kind,
            tid = message.transaction_id
        );

        let mut writer = lock(&self.writer);

        let written = writer.write_all(&header).and_then(|_| {
            if message.has_body() {
                for chunk in message.body.chunks(CHUNK_SIZE) {
                    writer.write_all(chunk)?;
                }
            }
            writer.flush()
        });

        written.map_err(|error| {
            debug!(context = "link_sending", peer = ?self.peer.address, ?error, "Link died");
            self.live.store(false, Ordering::Release);
            Error::Unreachable(self.peer.address)
        })
    }

    /// Read exactly `len` bytes. If the peer disappears, marks the Link dead and returns
    /// a zero-filled buffer, callers must check [Self::is_live].
    fn receive(&self, stream: &mut TcpStream, len: usize) -> Bytes {
        let mut buf = vec![0u8; len];

        if let Err(error) = stream.read_exact(&mut buf) {
            if self.is_live() {
                debug!(context = "link_receive", peer = ?self.peer.address, ?error, "Link died");
            }
            self.live.store(false, Ordering::Release);
            buf.fill(0);
        }

        Bytes::from(buf)
    }

    fn read_loop(
        self: Arc<Self>,
        mut stream: TcpStream,
        mailbox: Sender<Message>,
        inbound: Sender<Inbound>,
    ) {
        loop {
            let header = self.receive(&mut stream, HEADER_SIZE);
            if !self.is_live() {
                break;
            }

            let body_len = match Message::body_len(&header) {
                Ok(len) => len,
                Err(error) => {
                    // Without a trustworthy length the stream can not be resynchronised.
                    debug!(context = "link_receive", peer = ?self.peer.address, ?error, "Malformed header");
                    self.reply_failure(&header);
                    self.close();
                    break;
                }
            };

            let body = self.receive(&mut stream, body_len);
            if !self.is_live() {
                break;
            }

            let message = match Message::decode(&header, body) {
                Ok(message) => message,
                Err(error) => {
                    debug!(context = "link_receive", peer = ?self.peer.address, ?error, "Malformed frame");
                    self.reply_failure(&header);
                    continue;
                }
            };

            trace!(
                context = "link_received",
                peer = ?self.peer.address,
                category = ?message.category,
                kind = ?message.kind,
                tid = message.transaction_id
            );

            match message.category {
                Category::Response => {
                    if self.awaiting.load(Ordering::Acquire) == message.transaction_id as u32 {
                        let _ = mailbox.try_send(message);
                    } else {
                        trace!(context = "link_received", tid = message.transaction_id, "Stale response");
                    }
                }
                Category::Request | Category::Text => {
                    let inbound_message = Inbound {
                        link: self.clone(),
                        message,
                    };
                    if inbound.send(inbound_message).is_err() {
                        // Node is gone.
                        self.close();
                        break;
                    }
                }
            }
        }

        self.live.store(false, Ordering::Release);
    }

    fn reply_failure(&self, header: &[u8]) {
        let failure = Message {
            category: Category::Response,
            transaction_id: Message::peek_transaction_id(header),
            ..Message::request(RpcKind::Failure, self.local, self.peer.id)
        };
        let _ = self.respond(&failure);
    }
}

/// Open Links, keyed by the peer's listening address.
#[derive(Debug)]
pub struct LinkPool {
    local: ContactInfo,
    timeout: Duration,
    inbound: Sender<Inbound>,
    links: Mutex<HashMap<SocketAddr, Arc<Link>>>,
    /// Accepted Links not keyed in `links` because a live Link to the same address exists.
    unpooled: Mutex<Vec<Arc<Link>>>,
}

impl LinkPool {
    pub fn new(local: ContactInfo, timeout: Duration, inbound: Sender<Inbound>) -> Self {
        Self {
            local,
            timeout,
            inbound,
            links: Mutex::new(HashMap::new()),
            unpooled: Mutex::new(Vec::new()),
        }
    }

    // === Getters ===

    /// Every live Link.
    pub fn links(&self) -> Vec<Arc<Link>> {
        lock(&self.links)
            .values()
            .filter(|link| link.is_live())
            .cloned()
            .collect()
    }

    pub fn get(&self, address: &SocketAddr) -> Option<Arc<Link>> {
        lock(&self.links)
            .get(address)
            .filter(|link| link.is_live())
            .cloned()
    }

    // === Public Methods ===

    /// Reuse the live Link to `address`, or open a new one.
    ///
    /// Links to our own listening address or id are refused.
    pub fn open(&self, address: SocketAddr) -> Result<Arc<Link>> {
        if address == self.local.address {
            return Err(Error::Unreachable(address));
        }

        if let Some(link) = self.get(&address) {
            return Ok(link);
        }

        // The pool is not locked while connecting.
        let link = Link::open(self.local, address, self.timeout, self.inbound.clone())?;

        if link.peer().id == self.local.id {
            link.close();
            return Err(Error::Unreachable(address));
        }

        let mut links = lock(&self.links);
        match links.get(&address) {
            Some(existing) if existing.is_live() => {
                link.close();
                Ok(existing.clone())
            }
            _ => {
                links.insert(address, link.clone());
                Ok(link)
            }
        }
    }

    /// Handshake and register an inbound connection.
    pub fn accept(&self, stream: TcpStream) -> Result<Arc<Link>> {
        let link = Link::accept(stream, self.local, self.timeout, self.inbound.clone())?;

        let mut links = lock(&self.links);
        let address = link.peer_addr();

        // Keep a live Link that may have an exchange in flight; the new one still
        // serves the peer's requests through its own reader thread.
        if links.get(&address).is_some_and(|existing| existing.is_live()) {
            lock(&self.unpooled).push(link.clone());
        } else {
            links.insert(address, link.clone());
        }

        Ok(link)
    }

    /// Forget dead Links, returns how many were removed.
    pub fn clean(&self) -> usize {
        let mut links = lock(&self.links);
        let before = links.len();
        links.retain(|_, link| link.is_live());
        let removed = before - links.len();
        drop(links);

        let mut unpooled = lock(&self.unpooled);
        let before = unpooled.len();
        unpooled.retain(|link| link.is_live());

        removed + before - unpooled.len()
    }

    /// Close every Link this pool opened or accepted.
    pub fn close_all(&self) {
        let links: Vec<Arc<Link>> = lock(&self.links)
            .drain()
            .map(|(_, link)| link)
            .chain(lock(&self.unpooled).drain(..))
            .collect();

        for link in links {
            link.close();
        }
    }
}
