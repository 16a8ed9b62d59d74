use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::Server;
use crate::messages::{read_frame, write_frame, ApiMessage};
use crate::rpc::Rpc;
use crate::{Error, Result};

/// Serves DHT_PUT and DHT_GET requests from clients.
///
/// Requests on one connection are handled strictly in order, each one to
/// completion before the next is read. A malformed request closes the
/// connection without a reply.
#[derive(Debug)]
pub struct ApiServer {
    rpc: Arc<Rpc>,
}

impl ApiServer {
    pub fn new(rpc: Arc<Rpc>) -> Self {
        Self { rpc }
    }

    /// Handle one request, returning the reply to send if any.
    pub fn handle_request(&self, request: ApiMessage) -> Result<Option<ApiMessage>> {
        match request {
            ApiMessage::Put {
                ttl, key, value, ..
            } => {
                debug!(?key, ttl, len = value.len(), "DHT_PUT");
                self.rpc.put(key, value, ttl);

                Ok(None)
            }
            ApiMessage::Get { key } => {
                debug!(?key, "DHT_GET");

                Ok(Some(match self.rpc.get(&key) {
                    Some(value) => ApiMessage::Success { key, value },
                    None => ApiMessage::Failure { key },
                }))
            }
            other => Err(Error::UnexpectedMessageType(other.message_type())),
        }
    }
}

impl Server for ApiServer {
    fn name(&self) -> &'static str {
        "api"
    }

    fn idle_timeout(&self) -> Duration {
        self.rpc.config().idle_timeout
    }

    fn handle_connection(&self, stream: &mut TcpStream) -> Result<()> {
        while let Some(frame) = read_frame(stream)? {
            let request = ApiMessage::from_bytes(frame)?;

            if let Some(reply) = self.handle_request(request)? {
                write_frame(stream, &reply.to_bytes()?)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::common::Id;
    use crate::config::Config;
    use crate::rpc::test::harness;

    fn server() -> ApiServer {
        let harness = harness(Config {
            round_delay: Duration::from_millis(1),
            round_delay_ceiling: Duration::from_millis(10),
            ..Default::default()
        });

        ApiServer::new(Arc::new(harness.rpc))
    }

    #[test]
    fn put_then_get() {
        let server = server();
        let key = Id::random();

        let reply = server
            .handle_request(ApiMessage::Put {
                ttl: 20,
                replication: 1,
                reserved: 0,
                key,
                value: Bytes::from_static(b"value"),
            })
            .unwrap();
        assert_eq!(reply, None);

        let reply = server.handle_request(ApiMessage::Get { key }).unwrap();
        assert_eq!(
            reply,
            Some(ApiMessage::Success {
                key,
                value: Bytes::from_static(b"value"),
            })
        );
    }

    #[test]
    fn get_missing_key_fails() {
        let server = server();
        let key = Id::random();

        let reply = server.handle_request(ApiMessage::Get { key }).unwrap();
        assert_eq!(reply, Some(ApiMessage::Failure { key }));
    }

    #[test]
    fn rejects_server_only_messages() {
        let server = server();

        assert!(matches!(
            server.handle_request(ApiMessage::Failure { key: Id::random() }),
            Err(Error::UnexpectedMessageType(653))
        ));
    }
}
