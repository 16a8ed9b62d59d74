//! Messages peers exchange with each other.
//!
//! Header: `size: u16, message_type: u16, sender: peer record, nonce: [u8; 20]`,
//! followed by a body specific to the message type.

use bytes::{Buf, BufMut, Bytes};
use rand::Rng;

use super::{frame, get_id, get_peer, put_id, put_peer, split_header, PEER_SIZE};
use crate::common::{Id, Peer, ID_SIZE};
use crate::{Error, Result};

pub const PING: u16 = 654;
pub const PONG: u16 = 655;
pub const STORE: u16 = 656;
pub const FIND_NODE: u16 = 657;
pub const FIND_NODE_ANSWER: u16 = 658;
pub const FIND_VALUE: u16 = 659;
// 660 is reserved: a FIND_VALUE miss is answered with FIND_NODE_ANSWER.
pub const FOUND_VALUE: u16 = 661;

pub const NONCE_SIZE: usize = 20;
/// Size of the full P2P header, including the common `size, type` prefix.
pub const P2P_HEADER_SIZE: usize = super::HEADER_SIZE + PEER_SIZE + NONCE_SIZE;
/// Largest value a STORE frame can carry after its key and ttl.
pub const MAX_STORE_VALUE_SIZE: usize = super::MAX_MESSAGE_LENGTH - P2P_HEADER_SIZE - ID_SIZE - 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The peer that sent this message, as it advertises itself.
    pub sender: Peer,
    /// Random per-message bytes, not checked by receivers.
    pub nonce: [u8; NONCE_SIZE],
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Ping,
    Pong,
    Store(StoreArguments),
    FindNode(FindNodeArguments),
    FindNodeAnswer(FindNodeAnswerArguments),
    FindValue(FindValueArguments),
    FoundValue(FoundValueArguments),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreArguments {
    pub key: Id,
    /// Requested time to live in seconds.
    pub ttl: u16,
    pub value: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindNodeArguments {
    pub target: Id,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindNodeAnswerArguments {
    pub peers: Vec<Peer>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindValueArguments {
    pub key: Id,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundValueArguments {
    pub key: Id,
    pub value: Bytes,
}

impl Message {
    /// Create a message from `sender` with a fresh random nonce.
    pub fn new(sender: Peer, body: MessageBody) -> Self {
        Message {
            sender,
            nonce: rand::thread_rng().gen(),
            body,
        }
    }

    pub fn message_type(&self) -> u16 {
        match self.body {
            MessageBody::Ping => PING,
            MessageBody::Pong => PONG,
            MessageBody::Store(_) => STORE,
            MessageBody::FindNode(_) => FIND_NODE,
            MessageBody::FindNodeAnswer(_) => FIND_NODE_ANSWER,
            MessageBody::FindValue(_) => FIND_VALUE,
            MessageBody::FoundValue(_) => FOUND_VALUE,
        }
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Message> {
        let bytes = bytes.as_ref();
        let (message_type, mut buf) = split_header(bytes)?;

        if bytes.len() < P2P_HEADER_SIZE {
            return Err(Error::MessageTooShort {
                message_type,
                size: bytes.len(),
            });
        }

        let sender = get_peer(&mut buf);
        let mut nonce = [0_u8; NONCE_SIZE];
        buf.copy_to_slice(&mut nonce);

        let too_short = || Error::MessageTooShort {
            message_type,
            size: bytes.len(),
        };

        let body = match message_type {
            PING => MessageBody::Ping,
            PONG => MessageBody::Pong,
            STORE => {
                if buf.remaining() < ID_SIZE + 2 {
                    return Err(too_short());
                }
                let key = get_id(&mut buf);
                let ttl = buf.get_u16();

                MessageBody::Store(StoreArguments {
                    key,
                    ttl,
                    value: Bytes::copy_from_slice(buf),
                })
            }
            FIND_NODE => {
                if buf.remaining() < ID_SIZE {
                    return Err(too_short());
                }

                MessageBody::FindNode(FindNodeArguments {
                    target: get_id(&mut buf),
                })
            }
            FIND_NODE_ANSWER => {
                if buf.remaining() % PEER_SIZE != 0 {
                    return Err(Error::InvalidPeerList(buf.remaining()));
                }

                let mut peers = Vec::with_capacity(buf.remaining() / PEER_SIZE);
                while buf.has_remaining() {
                    peers.push(get_peer(&mut buf));
                }

                MessageBody::FindNodeAnswer(FindNodeAnswerArguments { peers })
            }
            FIND_VALUE => {
                if buf.remaining() < ID_SIZE {
                    return Err(too_short());
                }

                MessageBody::FindValue(FindValueArguments {
                    key: get_id(&mut buf),
                })
            }
            FOUND_VALUE => {
                if buf.remaining() < ID_SIZE {
                    return Err(too_short());
                }
                let key = get_id(&mut buf);

                MessageBody::FoundValue(FoundValueArguments {
                    key,
                    value: Bytes::copy_from_slice(buf),
                })
            }
            other => return Err(Error::UnknownMessageType(other)),
        };

        Ok(Message {
            sender,
            nonce,
            body,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(PEER_SIZE + NONCE_SIZE);

        put_peer(&mut body, &self.sender);
        body.put_slice(&self.nonce);

        match &self.body {
            MessageBody::Ping | MessageBody::Pong => {}
            MessageBody::Store(StoreArguments { key, ttl, value }) => {
                put_id(&mut body, key);
                body.put_u16(*ttl);
                body.put_slice(value);
            }
            MessageBody::FindNode(FindNodeArguments { target }) => put_id(&mut body, target),
            MessageBody::FindNodeAnswer(FindNodeAnswerArguments { peers }) => {
                for peer in peers {
                    put_peer(&mut body, peer);
                }
            }
            MessageBody::FindValue(FindValueArguments { key }) => put_id(&mut body, key),
            MessageBody::FoundValue(FoundValueArguments { key, value }) => {
                put_id(&mut body, key);
                body.put_slice(value);
            }
        }

        frame(self.message_type(), &body)
    }
}
