//! Iterative node and value lookup.

use std::collections::HashSet;
use std::thread;

use tracing::{debug, trace};

use super::Rpc;
use crate::common::{Id, Peer};
use crate::messages::{FindNodeArguments, FindValueArguments, MessageBody};

impl Rpc {
    /// Find the `k` closest peers to `target` in the network.
    ///
    /// Each round takes the `k` closest peers from the routing table. If any of
    /// them is new since the previous round, FIND_NODE (or FIND_VALUE when
    /// `want_value`) is sent to the `alpha` closest new ones and the pause
    /// between rounds resets to `round_delay`. Otherwise the lookup ends if the
    /// pause is already past `round_delay_ceiling`, and grows tenfold if not.
    ///
    /// Replies are handled by the P2P listener and only show up here through the
    /// routing table and the store. With `want_value`, the lookup stops as soon as
    /// the value is stored locally and returns an empty list.
    pub fn node_lookup(&self, target: &Id, want_value: bool) -> Vec<Peer> {
        let k = self.config.k;
        let alpha = self.config.alpha;
        let base_delay = self.config.round_delay;
        let ceiling = self.config.round_delay_ceiling;

        let mut closest_known: Vec<Peer> = Vec::new();
        let mut delay = base_delay;
        let mut rounds = 0_usize;

        loop {
            if want_value && self.store.read(target).is_some() {
                debug!(?target, rounds, "Value found");
                return Vec::new();
            }

            rounds += 1;

            let known: HashSet<&Id> = closest_known.iter().map(|peer| &peer.id).collect();
            let candidates = self.routing_table().closest_peers(target, k);

            if candidates.iter().all(|peer| known.contains(&peer.id)) {
                if delay > ceiling {
                    break;
                }

                delay = delay.saturating_mul(10);
            } else {
                delay = base_delay;

                let new_peers: Vec<Peer> = self
                    .routing_table()
                    .closest_peers(target, alpha)
                    .into_iter()
                    .filter(|peer| !known.contains(&peer.id))
                    .collect();

                trace!(?target, round = rounds, contacted = new_peers.len(), "Lookup round");

                for peer in new_peers {
                    let body = if want_value {
                        MessageBody::FindValue(FindValueArguments { key: *target })
                    } else {
                        MessageBody::FindNode(FindNodeArguments { target: *target })
                    };

                    self.outbox.send(peer.address, self.message(body));
                }

                drop(known);
                closest_known = candidates;
            }

            thread::sleep(delay);
        }

        debug!(?target, rounds, closest = closest_known.len(), "Lookup done");

        closest_known
    }
}
