//! Iterative node and value lookup.
//!
//! Queries are issued one at a time, in shortlist order. Every contact is queried at most
//! once per lookup, so the loop ends once no unqueried candidate is left, or as soon as a
//! value is found.

use std::collections::HashSet;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::common::{ClosestNodes, Id, Message, NodeRef, RpcKind};

use super::Rpc;

/// Outcome of a lookup.
#[derive(Debug, Clone)]
pub struct Lookup {
    target: Id,
    closest: ClosestNodes,
    value: Option<Bytes>,
    visited: usize,
}

impl Lookup {
    // === Getters ===

    pub fn target(&self) -> &Id {
        &self.target
    }

    /// Final shortlist, closest first.
    pub fn closest(&self) -> &ClosestNodes {
        &self.closest
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    /// Number of contacts queried.
    pub fn visited(&self) -> usize {
        self.visited
    }

    pub fn into_value(self) -> Option<Bytes> {
        self.value
    }
}

pub(crate) fn run(rpc: &Rpc, target: Id, want_value: bool) -> Lookup {
    trace!(%target, want_value, "New lookup");

    let mut shortlist = rpc.closest(&target);
    let mut excluded = HashSet::from([*rpc.id()]);
    let mut visited = 0;

    let kind = if want_value {
        RpcKind::FindValue
    } else {
        RpcKind::FindNode
    };

    loop {
        let frontier: Vec<NodeRef> = shortlist
            .nodes()
            .iter()
            .filter(|node| excluded.insert(node.id))
            .copied()
            .collect();

        if frontier.is_empty() {
            break;
        }

        for (index, node) in frontier.iter().enumerate() {
            let link = match rpc.ping(node.address) {
                Ok((link, _)) => link,
                Err(error) => {
                    debug!(context = "lookup", to = ?node.address, ?error, "Skipping contact");
                    rpc.mark_offline(node.handle);
                    continue;
                }
            };

            visited += 1;

            let response = match rpc.send_rpc(&link, Message::request(kind, rpc.local(), target))
            {
                Ok(Some(response)) => response,
                Ok(None) => continue,
                Err(error) => {
                    debug!(context = "lookup", to = ?node.address, ?error, "Skipping contact");
                    rpc.mark_offline(node.handle);
                    continue;
                }
            };

            if response.kind == RpcKind::FoundValue {
                // Cache toward the source: the contact queried just before did not have it.
                if let Some(previous) = index.checked_sub(1).map(|i| frontier[i]) {
                    replicate(rpc, &previous, target, response.body.clone());
                }

                debug!(%target, visited, found = true, "Done lookup");

                return Lookup {
                    target,
                    closest: shortlist,
                    value: Some(response.body),
                    visited,
                };
            }

            for candidate in response.nodes {
                if excluded.contains(&candidate.id) || shortlist.contains(&candidate.id) {
                    continue;
                }

                // Only contacts that answer a Ping make it into the shortlist.
                match rpc.ping(candidate.address) {
                    Ok((link, Some(handle))) => shortlist.add(NodeRef {
                        handle,
                        id: link.peer().id,
                        address: link.peer_addr(),
                    }),
                    Ok((_, None)) => {}
                    Err(error) => {
                        debug!(context = "lookup", to = ?candidate.address, ?error, "Candidate unreachable")
                    }
                }
            }
        }
    }

    debug!(%target, visited, candidates = shortlist.len(), found = false, "Done lookup");

    Lookup {
        target,
        closest: shortlist,
        value: None,
        visited,
    }
}

fn replicate(rpc: &Rpc, node: &NodeRef, id: Id, value: Bytes) {
    let request = Message::request(RpcKind::Store, rpc.local(), id).with_body(value);

    if let Err(error) = rpc
        .links()
        .open(node.address)
        .and_then(|link| rpc.send_rpc(&link, request))
    {
        debug!(context = "lookup", to = ?node.address, ?error, "Could not replicate value");
    }
}
