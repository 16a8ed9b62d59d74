//! TCP listeners for the client API and the P2P protocol.

mod api;
mod p2p;

use std::fmt::Debug;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError};
use tracing::{debug, info, warn};

use crate::Result;

pub use api::ApiServer;
pub use p2p::P2pServer;

/// How long the accept loop waits for a shutdown signal when no connection is pending.
pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Handles accepted connections, each on its own thread.
pub trait Server: Debug + Send + Sync + 'static {
    /// Name used for thread names and logs.
    fn name(&self) -> &'static str;

    /// Deadline for reading the next message on an accepted connection.
    fn idle_timeout(&self) -> Duration;

    /// Serve one connection until it is done. An error closes the connection.
    fn handle_connection(&self, stream: &mut TcpStream) -> Result<()>;
}

/// Run the accept loop of `server` on a new thread.
///
/// The loop stops once every sender of `shutdown` is dropped. Connections
/// already accepted are served to completion.
pub fn spawn<S: Server>(
    listener: TcpListener,
    server: Arc<S>,
    shutdown: Receiver<()>,
) -> Result<JoinHandle<()>> {
    listener.set_nonblocking(true)?;

    let local_addr = listener.local_addr()?;
    let name = server.name();

    let handle = thread::Builder::new()
        .name(format!("kadnode-{name}-listener"))
        .spawn(move || {
            info!(?local_addr, "{name} listener started");
            accept_loop(&listener, &server, &shutdown);
            info!(?local_addr, "{name} listener stopped");
        })?;

    Ok(handle)
}

fn accept_loop<S: Server>(listener: &TcpListener, server: &Arc<S>, shutdown: &Receiver<()>) {
    loop {
        match listener.accept() {
            Ok((stream, from)) => {
                if let Err(error) = serve(server.clone(), stream, from) {
                    warn!(?from, ?error, "Failed to start connection handler");
                }
            }
            Err(error) if error.kind() == ErrorKind::WouldBlock => {
                if shutdown_requested(shutdown) {
                    break;
                }
            }
            Err(error) => {
                // EMFILE and similar errors repeat on every call.
                debug!(?error, "Accept failed");

                if shutdown_requested(shutdown) {
                    break;
                }
            }
        }

        if shutdown.is_disconnected() {
            break;
        }
    }
}

/// Wait up to [ACCEPT_POLL_INTERVAL] for shutdown, returning `true` once every
/// sender is gone.
fn shutdown_requested(shutdown: &Receiver<()>) -> bool {
    matches!(
        shutdown.recv_timeout(ACCEPT_POLL_INTERVAL),
        Err(RecvTimeoutError::Disconnected)
    )
}

fn serve<S: Server>(server: Arc<S>, mut stream: TcpStream, from: SocketAddr) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(server.idle_timeout()))?;

    thread::Builder::new()
        .name(format!("kadnode-{}-connection", server.name()))
        .spawn(move || match server.handle_connection(&mut stream) {
            Ok(()) => debug!(?from, "{} connection closed", server.name()),
            Err(error) => debug!(?from, ?error, "{} connection dropped", server.name()),
        })?;

    Ok(())
}
