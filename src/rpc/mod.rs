//! Node state shared by every listener, and the P2P operations on top of it.

mod lookup;
pub mod socket;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, error, info, trace, warn};

use crate::common::{Id, Peer, RoutingTable, UpdateOutcome};
use crate::config::Config;
use crate::messages::p2p::MAX_STORE_VALUE_SIZE;
use crate::messages::{
    FindNodeAnswerArguments, FindNodeArguments, FindValueArguments, FoundValueArguments, Message,
    MessageBody, StoreArguments,
};
use crate::store::{DueRepublish, Store};

pub use socket::{Outbox, TcpTransport, Transport, DEFAULT_OUTBOX_WORKERS};

#[derive(Debug)]
/// Everything a node knows: who it is, its routing table, and its stored values.
///
/// One instance is shared behind an [Arc] by the listeners, the sweep timer, and
/// any lookups in flight.
pub struct Rpc {
    peer: Peer,
    config: Config,

    routing_table: Mutex<RoutingTable>,
    store: Store,

    transport: Arc<dyn Transport>,
    outbox: Outbox,
}

impl Rpc {
    /// `peer` is this node as advertised to others, so its address must be the
    /// bound P2P address.
    pub fn new(peer: Peer, config: Config, transport: Arc<dyn Transport>, outbox: Outbox) -> Self {
        Rpc {
            routing_table: Mutex::new(RoutingTable::new(peer.id, config.k)),
            store: Store::new(),
            peer,
            config,
            transport,
            outbox,
        }
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.peer.id
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Exclusive access to the routing table.
    ///
    /// Hold the guard briefly, [RoutingTable::update] may block on a ping.
    pub fn routing_table(&self) -> MutexGuard<'_, RoutingTable> {
        self.routing_table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // === Public Methods ===

    /// Handle a message received by the P2P listener.
    ///
    /// Returns the reply to write back on the same connection, if any. Every
    /// other reply leaves through the outbox to the sender's advertised address.
    pub fn handle_message(&self, message: Message) -> Option<Message> {
        let sender = message.sender;
        trace!(?sender, message_type = message.message_type(), "Received message");

        self.observe(sender);

        match message.body {
            MessageBody::Ping => return Some(self.message(MessageBody::Pong)),
            MessageBody::Pong => {
                debug!(?sender, "Unsolicited PONG");
            }
            MessageBody::Store(StoreArguments { key, ttl, value }) => {
                let ttl = Duration::from_secs(ttl.into()).min(self.config.max_ttl);

                self.store
                    .write(key, value, ttl, self.config.republish_interval);
            }
            MessageBody::FindNode(FindNodeArguments { target }) => {
                self.answer_find_node(&sender, &target);
            }
            MessageBody::FindNodeAnswer(FindNodeAnswerArguments { peers }) => {
                for peer in peers {
                    self.observe(peer);
                }
            }
            MessageBody::FindValue(FindValueArguments { key }) => match self.store.read(&key) {
                Some(value) => {
                    let found = self.message(MessageBody::FoundValue(FoundValueArguments {
                        key,
                        value,
                    }));
                    self.outbox.send(sender.address, found);
                }
                None => self.answer_find_node(&sender, &key),
            },
            MessageBody::FoundValue(FoundValueArguments { key, value }) => {
                self.store.write(
                    key,
                    value,
                    self.config.found_value_ttl,
                    self.config.republish_interval,
                );
            }
        }

        None
    }

    /// Ping `address`, returning the peer that answered with a PONG.
    pub fn ping(&self, address: SocketAddr) -> Option<Peer> {
        self.transport
            .ping(address, &self.message(MessageBody::Ping))
    }

    /// Contact the configured bootstrap peers, then look up our own id to fill
    /// the routing table. Unreachable bootstrap peers are not an error.
    pub fn bootstrap(&self) {
        if self.config.bootstrap.is_empty() {
            info!("No bootstrap peers configured, starting a new network");
            return;
        }

        let mut reached = 0;

        for address in &self.config.bootstrap {
            match self.ping(*address) {
                Some(peer) => {
                    debug!(?peer, "Bootstrap peer answered");
                    self.observe(peer);
                    reached += 1;
                }
                None => debug!(?address, "Bootstrap peer unreachable"),
            }
        }

        if reached == 0 {
            info!("No bootstrap peer answered, starting as the only member of the network");
            return;
        }

        let closest = self.node_lookup(self.id(), false);

        info!(
            reached,
            closest = closest.len(),
            table_size = self.routing_table().size(),
            "Bootstrapped"
        );
    }

    /// Store `value` on the closest peers to `key` and on this node.
    ///
    /// The local copy keeps the full `ttl`, remote peers cap it to their own maximum.
    pub fn put(&self, key: Id, value: Bytes, ttl: u16) {
        self.store_remote(key, value.clone(), ttl);

        self.store.write(
            key,
            value,
            Duration::from_secs(ttl.into()),
            self.config.republish_interval,
        );
    }

    /// Find the value stored for `key`, locally or in the network.
    pub fn get(&self, key: &Id) -> Option<Bytes> {
        self.node_lookup(key, true);

        self.store.read(key)
    }

    /// Send STORE to the closest peers to `key` found by a lookup.
    ///
    /// Values larger than [MAX_STORE_VALUE_SIZE] do not fit in a STORE frame and
    /// are not replicated.
    pub fn store_remote(&self, key: Id, value: Bytes, ttl: u16) {
        if value.len() > MAX_STORE_VALUE_SIZE {
            warn!(
                ?key,
                len = value.len(),
                max = MAX_STORE_VALUE_SIZE,
                "Value too large to replicate, keeping it local only"
            );
            return;
        }

        let closest = self.node_lookup(&key, false);

        debug!(?key, peers = closest.len(), ttl, "Storing value remotely");

        for peer in closest {
            let store = self.message(MessageBody::Store(StoreArguments {
                key,
                ttl,
                value: value.clone(),
            }));

            self.outbox.send(peer.address, store);
        }
    }

    /// Re-announce values whose republish deadline passed, with what remains of their ttl.
    pub fn republish(&self, due: Vec<DueRepublish>) {
        for DueRepublish {
            key,
            value,
            remaining_ttl,
        } in due
        {
            let ttl = u16::try_from(remaining_ttl.as_secs()).unwrap_or(u16::MAX);

            debug!(?key, ttl, "Republishing value");
            self.store_remote(key, value, ttl);
        }
    }

    // === Private Methods ===

    fn message(&self, body: MessageBody) -> Message {
        Message::new(self.peer, body)
    }

    /// Record that `peer` was seen, pinging the least recently seen peer of its
    /// bucket if that bucket is full.
    fn observe(&self, peer: Peer) {
        let mut table = self.routing_table();

        match table.update(peer, |least_recent| self.ping(least_recent.address).is_some()) {
            Ok(UpdateOutcome::Evicted(evicted)) => {
                trace!(?peer, ?evicted, "Replaced unresponsive peer");
            }
            Ok(_) => {}
            Err(error) => {
                error!(?peer, ?error, "Routing table update failed");
            }
        }
    }

    fn answer_find_node(&self, sender: &Peer, target: &Id) {
        let peers = self.routing_table().closest_peers(target, self.config.k);

        let answer = self.message(MessageBody::FindNodeAnswer(FindNodeAnswerArguments {
            peers,
        }));

        self.outbox.send(sender.address, answer);
    }
}

#[cfg(test)]
pub(crate) mod test {
    use flume::Receiver;

    use super::socket::sim::SimTransport;
    use super::*;

    pub(crate) struct Harness {
        pub rpc: Rpc,
        pub transport: Arc<SimTransport>,
        pub outgoing: Receiver<(SocketAddr, Message)>,
    }

    pub(crate) fn harness(config: Config) -> Harness {
        let transport = Arc::new(SimTransport::new());
        let (outbox, outgoing) = Outbox::detached();
        let peer = Peer::random(SocketAddr::from(([127, 0, 0, 1], 7402)));

        Harness {
            rpc: Rpc::new(peer, config, transport.clone(), outbox),
            transport,
            outgoing,
        }
    }

    fn remote(port: u16) -> Peer {
        Peer::random(SocketAddr::from(([10, 0, 0, 1], port)))
    }

    #[test]
    fn every_message_updates_the_routing_table() {
        let Harness { rpc, .. } = harness(Config::default());
        let sender = remote(1);

        rpc.handle_message(Message::new(sender, MessageBody::Pong));

        assert!(rpc.routing_table().to_owned_peers().contains(&sender));
    }

    #[test]
    fn ping_is_answered_with_pong() {
        let Harness { rpc, outgoing, .. } = harness(Config::default());

        let reply = rpc
            .handle_message(Message::new(remote(1), MessageBody::Ping))
            .unwrap();

        assert_eq!(reply.body, MessageBody::Pong);
        assert_eq!(reply.sender, *rpc.peer());
        assert!(outgoing.is_empty());
    }

    #[test]
    fn store_caps_ttl() {
        let Harness { rpc, .. } = harness(Config {
            max_ttl: Duration::ZERO,
            ..Default::default()
        });
        let key = Id::random();

        let reply = rpc.handle_message(Message::new(
            remote(1),
            MessageBody::Store(StoreArguments {
                key,
                ttl: 60,
                value: Bytes::from_static(b"value"),
            }),
        ));

        assert!(reply.is_none());
        assert_eq!(rpc.store().read(&key), Some(Bytes::from_static(b"value")));

        // Capped to zero, so gone after the next sweep.
        rpc.store().sweep(Duration::from_secs(3600));
        assert_eq!(rpc.store().read(&key), None);
    }

    #[test]
    fn find_node_answers_with_closest_peers() {
        let Harness { rpc, outgoing, .. } = harness(Config::default());

        let known: Vec<Peer> = (1..=5).map(remote).collect();
        for peer in &known {
            rpc.observe(*peer);
        }

        let sender = remote(100);
        let target = Id::random();
        rpc.handle_message(Message::new(
            sender,
            MessageBody::FindNode(FindNodeArguments { target }),
        ));

        let (address, answer) = outgoing.try_recv().unwrap();
        assert_eq!(address, sender.address);

        let MessageBody::FindNodeAnswer(FindNodeAnswerArguments { peers }) = answer.body else {
            panic!("expected FIND_NODE_ANSWER");
        };
        assert_eq!(peers, rpc.routing_table().closest_peers(&target, 20));
        assert_eq!(peers.len(), 6);
    }

    #[test]
    fn find_node_answer_fills_the_table() {
        let Harness { rpc, .. } = harness(Config::default());
        let peers: Vec<Peer> = (1..=3).map(remote).collect();

        rpc.handle_message(Message::new(
            remote(100),
            MessageBody::FindNodeAnswer(FindNodeAnswerArguments {
                peers: peers.clone(),
            }),
        ));

        let table = rpc.routing_table().to_owned_peers();
        assert_eq!(table.len(), 4);
        for peer in &peers {
            assert!(table.contains(peer));
        }
    }

    #[test]
    fn find_value_hit_and_miss() {
        let Harness { rpc, outgoing, .. } = harness(Config::default());
        let key = Id::random();
        let sender = remote(1);

        rpc.handle_message(Message::new(
            sender,
            MessageBody::FindValue(FindValueArguments { key }),
        ));
        let (_, miss) = outgoing.try_recv().unwrap();
        assert!(matches!(miss.body, MessageBody::FindNodeAnswer(_)));

        rpc.store().write(
            key,
            Bytes::from_static(b"value"),
            Duration::from_secs(60),
            Duration::from_secs(3600),
        );

        rpc.handle_message(Message::new(
            sender,
            MessageBody::FindValue(FindValueArguments { key }),
        ));
        let (address, hit) = outgoing.try_recv().unwrap();
        assert_eq!(address, sender.address);
        assert_eq!(
            hit.body,
            MessageBody::FoundValue(FoundValueArguments {
                key,
                value: Bytes::from_static(b"value"),
            })
        );
    }

    #[test]
    fn found_value_is_cached() {
        let Harness { rpc, .. } = harness(Config::default());
        let key = Id::random();

        rpc.handle_message(Message::new(
            remote(1),
            MessageBody::FoundValue(FoundValueArguments {
                key,
                value: Bytes::from_static(b"cached"),
            }),
        ));

        assert_eq!(rpc.store().read(&key), Some(Bytes::from_static(b"cached")));
    }

    #[test]
    fn full_bucket_pings_least_recently_seen() {
        let Harness { rpc, transport, .. } = harness(Config {
            k: 1,
            ..Default::default()
        });

        // With k = 1 the root splits until the bucket opposite our own id
        // holds a single peer, so pick two peers on that side.
        let own_first_bit = rpc.id().bit(0);
        let opposite = |port| loop {
            let peer = remote(port);
            if peer.id.bit(0) != own_first_bit {
                return peer;
            }
        };

        let old = opposite(1);
        let new = opposite(2);

        rpc.observe(old);
        transport.respond_as(old);
        rpc.observe(new);

        assert_eq!(transport.pinged(), vec![old.address]);
        let table = rpc.routing_table().to_owned_peers();
        assert!(table.contains(&old));
        assert!(!table.contains(&new));
    }

    #[test]
    fn bootstrap_inserts_answering_peer() {
        let Harness {
            rpc, transport, ..
        } = harness(Config {
            bootstrap: vec![
                SocketAddr::from(([10, 0, 0, 1], 1)),
                SocketAddr::from(([10, 0, 0, 2], 2)),
            ],
            round_delay: Duration::from_millis(1),
            round_delay_ceiling: Duration::from_millis(10),
            ..Default::default()
        });

        let answering = Peer::random(SocketAddr::from(([10, 0, 0, 1], 1)));
        transport.respond_as(answering);

        rpc.bootstrap();

        assert_eq!(transport.pinged().len(), 2);
        assert_eq!(rpc.routing_table().to_owned_peers(), vec![answering]);
    }

    #[test]
    fn put_writes_locally_without_peers() {
        let Harness { rpc, outgoing, .. } = harness(Config {
            round_delay: Duration::from_millis(1),
            round_delay_ceiling: Duration::from_millis(10),
            ..Default::default()
        });
        let key = Id::random();

        rpc.put(key, Bytes::from_static(b"value"), 20);

        assert!(outgoing.is_empty());
        assert_eq!(rpc.get(&key), Some(Bytes::from_static(b"value")));
        assert_eq!(rpc.get(&Id::random()), None);
    }

    #[test]
    fn republish_saturates_ttl() {
        let Harness { rpc, outgoing, .. } = harness(Config {
            round_delay: Duration::from_millis(1),
            round_delay_ceiling: Duration::from_millis(10),
            ..Default::default()
        });
        let peer = remote(1);
        rpc.observe(peer);

        let key = Id::random();
        rpc.republish(vec![DueRepublish {
            key,
            value: Bytes::from_static(b"value"),
            remaining_ttl: Duration::from_secs(u64::from(u16::MAX) + 100),
        }]);

        let stores: Vec<_> = outgoing
            .drain()
            .filter_map(|(address, message)| match message.body {
                MessageBody::Store(arguments) => Some((address, arguments)),
                _ => None,
            })
            .collect();

        assert_eq!(stores.len(), 1);
        assert_eq!(stores[0].0, peer.address);
        assert_eq!(stores[0].1.key, key);
        assert_eq!(stores[0].1.ttl, u16::MAX);
    }

    fn stores(outgoing: &Receiver<(SocketAddr, Message)>) -> Vec<Message> {
        outgoing
            .drain()
            .filter(|(_, message)| matches!(message.body, MessageBody::Store(_)))
            .map(|(_, message)| message)
            .collect()
    }

    #[test]
    fn oversized_value_is_kept_local() {
        let Harness { rpc, outgoing, .. } = harness(Config {
            round_delay: Duration::from_millis(1),
            round_delay_ceiling: Duration::from_millis(10),
            ..Default::default()
        });
        rpc.observe(remote(1));

        // Fits a DHT_PUT frame, but not a STORE frame.
        let key = Id::random();
        let value = Bytes::from(vec![7_u8; MAX_STORE_VALUE_SIZE + 1]);
        rpc.put(key, value.clone(), 20);

        assert!(outgoing.is_empty());
        assert_eq!(rpc.store().read(&key), Some(value));
    }

    #[test]
    fn largest_storable_value_is_replicated() {
        let Harness { rpc, outgoing, .. } = harness(Config {
            round_delay: Duration::from_millis(1),
            round_delay_ceiling: Duration::from_millis(10),
            ..Default::default()
        });
        rpc.observe(remote(1));

        let value = Bytes::from(vec![7_u8; MAX_STORE_VALUE_SIZE]);
        rpc.store_remote(Id::random(), value, 20);

        let stores = stores(&outgoing);
        assert_eq!(stores.len(), 1);
        assert!(stores[0].to_bytes().is_ok());
    }

    #[test]
    fn concurrent_observers_keep_buckets_consistent() {
        let Harness { rpc, transport, .. } = harness(Config {
            k: 4,
            ..Default::default()
        });

        std::thread::scope(|scope| {
            for thread in 0..8_u16 {
                let rpc = &rpc;
                let transport = &transport;
                scope.spawn(move || {
                    for index in 0..50_u16 {
                        let peer = remote(thread * 100 + index);
                        // Every third peer answers eviction pings.
                        if index % 3 == 0 {
                            transport.respond_as(peer);
                        }
                        rpc.observe(peer);

                        let closest = rpc.routing_table().closest_peers(&Id::random(), 4);
                        assert!(closest.len() <= 4);
                    }
                });
            }
        });

        let table = rpc.routing_table();
        assert!(!table.is_empty());

        let mut seen = std::collections::HashSet::new();
        for bucket in table.buckets() {
            assert!(bucket.len() <= bucket.max_size());
            for peer in bucket.peers() {
                assert!(bucket.in_range(&peer.id));
                assert_ne!(peer.id, *rpc.id());
                assert!(seen.insert(peer.id), "peer listed twice: {:?}", peer);
            }
        }
        assert_eq!(seen.len(), table.size());
    }
}
