//! Request handlers

use std::sync::Arc;

use tracing::{debug, error, info, trace};

use crate::common::{Category, Contact, ContactInfo, Message, RpcKind};

use super::{lock, Link, Rpc};

/// Handle one inbound frame and answer it on the Link it arrived on.
pub(crate) fn handle_inbound(rpc: &Rpc, link: &Arc<Link>, message: Message) {
    // Routing knowledge accumulates from all traffic, not just Pings.
    if message.sender.id != *rpc.id() {
        if let Err(error) = rpc.register(&message.sender, link) {
            debug!(context = "handle_request", from = %message.sender.id, ?error, "Sender not registered");
        }
    }

    match message.category {
        Category::Request => {
            if let Some(response) = handle_request(rpc, &message) {
                if let Err(error) = link.respond(&response) {
                    debug!(context = "handle_request", to = ?link.peer_addr(), ?error, "Response not sent");
                }
            }
        }
        Category::Text => handle_text(rpc, &message),
        // Responses go to the Link mailbox, never here.
        Category::Response => {}
    }
}

/// Answer a single request, `None` for fire-and-forget kinds.
pub fn handle_request(rpc: &Rpc, request: &Message) -> Option<Message> {
    let from = request.sender.id;
    let target = request.target;

    match request.kind {
        RpcKind::Ping => {
            trace!(context = "handle_request", %from, "Ping");
            None
        }
        RpcKind::Store => {
            match rpc.put_local(target, request.body.clone()) {
                Ok(true) => debug!(%target, %from, size = request.body.len(), "Stored value"),
                Ok(false) => trace!(%target, %from, "Value already stored"),
                Err(error) => error!(%target, %from, ?error, "Could not store value"),
            }
            None
        }
        RpcKind::FindValue => match rpc.load_local(&target) {
            Some(value) => {
                Some(Message::response(RpcKind::FoundValue, rpc.local(), request).with_body(value))
            }
            None => Some(found_node(rpc, request)),
        },
        RpcKind::FindNode => Some(found_node(rpc, request)),
        RpcKind::Failure | RpcKind::FoundNode | RpcKind::FoundValue => {
            debug!(context = "handle_request", %from, kind = ?request.kind, "Unexpected request kind");
            Some(Message::response(RpcKind::Failure, rpc.local(), request))
        }
    }
}

/// Closest contacts to the request target, copied by value.
fn found_node(rpc: &Rpc, request: &Message) -> Message {
    let nodes: Vec<ContactInfo> = rpc
        .closest(&request.target)
        .into_iter()
        .map(|node| ContactInfo::new(node.id, node.address))
        .collect();

    Message::response(RpcKind::FoundNode, rpc.local(), request).with_nodes(nodes)
}

fn handle_text(rpc: &Rpc, message: &Message) {
    let text = String::from_utf8_lossy(&message.body).into_owned();

    info!(from = %message.sender.id, address = ?message.sender.address, %text, "Text message");

    let sender = {
        let table = lock(&rpc.routing_table);
        table
            .registry()
            .find(&message.sender.id)
            .and_then(|handle| table.get(handle))
            .map(Contact::detached)
            .unwrap_or_else(|| Contact::new(message.sender.id, message.sender.address))
    };

    rpc.deliver_text((sender, text));
}
