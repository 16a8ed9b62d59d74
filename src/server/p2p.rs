use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use super::Server;
use crate::messages::{read_frame, write_frame, Message};
use crate::rpc::Rpc;
use crate::Result;

/// Serves one P2P message per connection.
///
/// Only a PING is answered on the same connection; other replies are sent by
/// [Rpc] on new connections to the sender's advertised address.
#[derive(Debug)]
pub struct P2pServer {
    rpc: Arc<Rpc>,
}

impl P2pServer {
    pub fn new(rpc: Arc<Rpc>) -> Self {
        Self { rpc }
    }
}

impl Server for P2pServer {
    fn name(&self) -> &'static str {
        "p2p"
    }

    fn idle_timeout(&self) -> Duration {
        self.rpc.config().idle_timeout
    }

    fn handle_connection(&self, stream: &mut TcpStream) -> Result<()> {
        let Some(frame) = read_frame(stream)? else {
            return Ok(());
        };

        let message = Message::from_bytes(frame)?;

        if let Some(reply) = self.rpc.handle_message(message) {
            write_frame(stream, &reply.to_bytes()?)?;
        }

        Ok(())
    }
}
