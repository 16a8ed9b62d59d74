//! Dht node.

use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::common::{Id, Peer};
use crate::config::Config;
use crate::rpc::{Outbox, Rpc, TcpTransport, DEFAULT_OUTBOX_WORKERS};
use crate::server::{self, ApiServer, P2pServer};
use crate::Result;

/// Interval of the store's expire and republish sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
/// A running DHT node: the API listener, the P2P listener, and the sweep timer.
pub struct Dht {
    rpc: Arc<Rpc>,
    api_address: SocketAddr,
    shutdown: ShutdownHandle,
    handles: Vec<JoinHandle<()>>,
}

/// Stops a running [Dht] when [ShutdownHandle::shutdown] is called on any clone.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    sender: Arc<Mutex<Option<Sender<()>>>>,
}

impl ShutdownHandle {
    fn new() -> (Self, Receiver<()>) {
        let (sender, receiver) = flume::bounded(1);

        (
            Self {
                sender: Arc::new(Mutex::new(Some(sender))),
            },
            receiver,
        )
    }

    /// Signal every loop to stop. Calling it more than once has no effect.
    pub fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if sender.is_some() {
            debug!("Shutdown requested");
        }
    }
}

impl Dht {
    /// Bind both listeners, bootstrap, then start serving.
    ///
    /// Binding failures are returned, unreachable bootstrap peers are not.
    pub fn start(config: Config) -> Result<Self> {
        let id = match &config.hostkey {
            Some(path) => Id::from_hostkey(path)?,
            None => Id::random(),
        };

        let p2p_listener = TcpListener::bind(config.p2p_address)?;
        let api_listener = TcpListener::bind(config.api_address)?;

        let p2p_address = p2p_listener.local_addr()?;
        let api_address = api_listener.local_addr()?;

        let transport = Arc::new(TcpTransport::new(config.ping_timeout));
        let outbox = Outbox::new(transport.clone(), DEFAULT_OUTBOX_WORKERS)?;

        let peer = Peer::new(id, p2p_address);
        info!(?id, ?p2p_address, ?api_address, "Starting node");

        let rpc = Arc::new(Rpc::new(peer, config, transport, outbox));
        let (shutdown, receiver) = ShutdownHandle::new();

        let mut handles = vec![server::spawn(
            p2p_listener,
            Arc::new(P2pServer::new(rpc.clone())),
            receiver.clone(),
        )?];

        // Bootstrap peers ping back while we ping them, so the P2P listener has to be up.
        rpc.bootstrap();

        handles.push(server::spawn(
            api_listener,
            Arc::new(ApiServer::new(rpc.clone())),
            receiver.clone(),
        )?);

        let sweeper = rpc.clone();
        handles.push(
            thread::Builder::new()
                .name("kadnode-sweep".to_string())
                .spawn(move || sweep_loop(sweeper, receiver))?,
        );

        Ok(Dht {
            rpc,
            api_address,
            shutdown,
            handles,
        })
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        self.rpc.id()
    }

    /// Bound address of the client API.
    pub fn api_address(&self) -> SocketAddr {
        self.api_address
    }

    /// Bound P2P address, as advertised to other peers.
    pub fn p2p_address(&self) -> SocketAddr {
        self.rpc.peer().address
    }

    pub fn rpc(&self) -> &Arc<Rpc> {
        &self.rpc
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    // === Public Methods ===

    pub fn shutdown(&self) {
        self.shutdown.shutdown();
    }

    /// Block until every listener and the sweep timer have stopped.
    pub fn block_until_shutdown(mut self) {
        for handle in std::mem::take(&mut self.handles) {
            if handle.join().is_err() {
                warn!("A node thread panicked");
            }
        }

        info!("Node stopped");
    }
}

impl Drop for Dht {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

fn sweep_loop(rpc: Arc<Rpc>, shutdown: Receiver<()>) {
    loop {
        match shutdown.recv_timeout(SWEEP_INTERVAL) {
            Err(RecvTimeoutError::Disconnected) => break,
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
        }

        let due = rpc.store().sweep(rpc.config().republish_interval);
        if due.is_empty() {
            continue;
        }

        let republisher = rpc.clone();
        let spawned = thread::Builder::new()
            .name("kadnode-republish".to_string())
            .spawn(move || republisher.republish(due));

        if let Err(error) = spawned {
            warn!(?error, "Failed to start republishing");
        }
    }

    debug!("Sweep timer stopped");
}

#[cfg(test)]
mod test {
    use std::time::Instant;

    use super::*;

    fn local_config() -> Config {
        Config {
            api_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            p2p_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Default::default()
        }
    }

    #[test]
    fn binds_ephemeral_ports() {
        let dht = Dht::start(local_config()).unwrap();

        assert_ne!(dht.api_address().port(), 0);
        assert_ne!(dht.p2p_address().port(), 0);
        assert_ne!(dht.api_address(), dht.p2p_address());
        assert_eq!(dht.rpc().peer().address, dht.p2p_address());
    }

    #[test]
    fn shutdown() {
        let dht = Dht::start(local_config()).unwrap();

        let handle = dht.shutdown_handle();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));

            handle.shutdown();
        });

        let start = Instant::now();
        dht.block_until_shutdown();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn hostkey_sets_the_id() {
        let path = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/data/hostkey.pem");

        let dht = Dht::start(Config {
            hostkey: Some(path.clone()),
            ..local_config()
        })
        .unwrap();

        assert_eq!(dht.id(), &Id::from_hostkey(&path).unwrap());
    }

    #[test]
    fn invalid_hostkey_is_fatal() {
        let path = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("Cargo.toml");

        assert!(matches!(
            Dht::start(Config {
                hostkey: Some(path),
                ..local_config()
            }),
            Err(crate::Error::InvalidHostKey(_))
        ));
    }
}
