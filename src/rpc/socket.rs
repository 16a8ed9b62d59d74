//! Outbound TCP connections to other peers.

use std::fmt::Debug;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use flume::{Receiver, Sender};
use tracing::{debug, trace};

use crate::common::Peer;
use crate::messages::{read_frame, write_frame, Message, MessageBody};
use crate::Result;

/// Number of threads draining the [Outbox].
pub const DEFAULT_OUTBOX_WORKERS: usize = 8;

/// How P2P messages leave this node.
pub trait Transport: Debug + Send + Sync {
    /// Send a PING and wait for the reply.
    ///
    /// Returns the replying peer if a PONG arrived in time. Any failure means
    /// the peer is unreachable and yields `None`.
    fn ping(&self, address: SocketAddr, ping: &Message) -> Option<Peer>;

    /// Deliver a message on a fresh connection without waiting for a reply.
    fn send(&self, address: SocketAddr, message: &Message) -> Result<()>;
}

/// Blocking TCP transport, opening one connection per message.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    timeout: Duration,
}

impl TcpTransport {
    /// `timeout` bounds connecting, writing, and waiting for a PONG.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn connect(&self, address: SocketAddr) -> Result<TcpStream> {
        let stream = TcpStream::connect_timeout(&address, self.timeout)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        Ok(stream)
    }

    fn try_ping(&self, address: SocketAddr, ping: &Message) -> Result<Option<Peer>> {
        let mut stream = self.connect(address)?;
        write_frame(&mut stream, &ping.to_bytes()?)?;

        let Some(frame) = read_frame(&mut stream)? else {
            return Ok(None);
        };

        let reply = Message::from_bytes(frame)?;

        Ok(match reply.body {
            MessageBody::Pong => Some(reply.sender),
            _ => None,
        })
    }
}

impl Transport for TcpTransport {
    fn ping(&self, address: SocketAddr, ping: &Message) -> Option<Peer> {
        match self.try_ping(address, ping) {
            Ok(Some(peer)) => Some(peer),
            Ok(None) => {
                debug!(?address, "No PONG received");
                None
            }
            Err(error) => {
                debug!(?address, ?error, "Ping failed");
                None
            }
        }
    }

    fn send(&self, address: SocketAddr, message: &Message) -> Result<()> {
        let bytes = message.to_bytes()?;
        let mut stream = self.connect(address)?;

        write_frame(&mut stream, &bytes)
    }
}

/// A queued message and where it goes.
pub type Outgoing = (SocketAddr, Message);

/// Queue of fire-and-forget messages, drained by a pool of sender threads so a
/// slow peer never stalls the caller.
#[derive(Debug, Clone)]
pub struct Outbox {
    sender: Sender<Outgoing>,
}

impl Outbox {
    /// Spawn `workers` threads sending through `transport`.
    ///
    /// Workers exit once every clone of the returned [Outbox] is dropped and the
    /// queue is drained.
    pub fn new(transport: Arc<dyn Transport>, workers: usize) -> Result<Self> {
        let (sender, receiver) = flume::unbounded::<Outgoing>();

        for index in 0..workers.max(1) {
            let receiver = receiver.clone();
            let transport = transport.clone();

            thread::Builder::new()
                .name(format!("kadnode-outbox-{index}"))
                .spawn(move || drain(&*transport, receiver))?;
        }

        Ok(Self { sender })
    }

    /// An outbox with no workers, handing every queued message to the receiver.
    pub fn detached() -> (Self, Receiver<Outgoing>) {
        let (sender, receiver) = flume::unbounded();

        (Self { sender }, receiver)
    }

    pub fn send(&self, address: SocketAddr, message: Message) {
        trace!(?address, message_type = message.message_type(), "Queueing message");

        if self.sender.send((address, message)).is_err() {
            debug!(?address, "Outbox workers are gone, dropping message");
        }
    }
}

fn drain(transport: &dyn Transport, receiver: Receiver<Outgoing>) {
    while let Ok((address, message)) = receiver.recv() {
        if let Err(error) = transport.send(address, &message) {
            debug!(
                ?address,
                ?error,
                message_type = message.message_type(),
                "Failed to send message"
            );
        }
    }
}
