//! Messages between a client and the API listener.

use bytes::{Buf, BufMut, Bytes};

use super::{frame, get_id, put_id, split_header, HEADER_SIZE};
use crate::common::{Id, ID_SIZE};
use crate::{Error, Result};

pub const DHT_PUT: u16 = 650;
pub const DHT_GET: u16 = 651;
pub const DHT_SUCCESS: u16 = 652;
pub const DHT_FAILURE: u16 = 653;

/// Fixed size of a DHT_GET or DHT_FAILURE frame.
pub const KEY_ONLY_SIZE: usize = HEADER_SIZE + ID_SIZE;
const PUT_FIXED_SIZE: usize = HEADER_SIZE + 4 + ID_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiMessage {
    /// Store `value` under `key` for `ttl` seconds.
    Put {
        ttl: u16,
        /// Replication hint sent by clients, currently not acted on.
        replication: u8,
        reserved: u8,
        key: Id,
        value: Bytes,
    },
    Get {
        key: Id,
    },
    /// Server to client only: the value found for a GET.
    Success {
        key: Id,
        value: Bytes,
    },
    /// Server to client only: the GET found nothing.
    Failure {
        key: Id,
    },
}

impl ApiMessage {
    pub fn message_type(&self) -> u16 {
        match self {
            ApiMessage::Put { .. } => DHT_PUT,
            ApiMessage::Get { .. } => DHT_GET,
            ApiMessage::Success { .. } => DHT_SUCCESS,
            ApiMessage::Failure { .. } => DHT_FAILURE,
        }
    }

    pub fn key(&self) -> &Id {
        match self {
            ApiMessage::Put { key, .. }
            | ApiMessage::Get { key }
            | ApiMessage::Success { key, .. }
            | ApiMessage::Failure { key } => key,
        }
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<ApiMessage> {
        let bytes = bytes.as_ref();
        let (message_type, mut buf) = split_header(bytes)?;

        let expect_size = |valid: bool| {
            if valid {
                Ok(())
            } else {
                Err(Error::MessageTooShort {
                    message_type,
                    size: bytes.len(),
                })
            }
        };

        match message_type {
            DHT_PUT => {
                expect_size(bytes.len() >= PUT_FIXED_SIZE)?;

                let ttl = buf.get_u16();
                let replication = buf.get_u8();
                let reserved = buf.get_u8();
                let key = get_id(&mut buf);

                Ok(ApiMessage::Put {
                    ttl,
                    replication,
                    reserved,
                    key,
                    value: Bytes::copy_from_slice(buf),
                })
            }
            DHT_GET | DHT_FAILURE => {
                if bytes.len() != KEY_ONLY_SIZE {
                    return Err(Error::SizeMismatch {
                        declared: KEY_ONLY_SIZE,
                        actual: bytes.len(),
                    });
                }
                let key = get_id(&mut buf);

                Ok(match message_type {
                    DHT_GET => ApiMessage::Get { key },
                    _ => ApiMessage::Failure { key },
                })
            }
            DHT_SUCCESS => {
                expect_size(bytes.len() >= KEY_ONLY_SIZE)?;
                let key = get_id(&mut buf);

                Ok(ApiMessage::Success {
                    key,
                    value: Bytes::copy_from_slice(buf),
                })
            }
            other => Err(Error::UnknownMessageType(other)),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(ID_SIZE + 4);

        match self {
            ApiMessage::Put {
                ttl,
                replication,
                reserved,
                key,
                value,
            } => {
                body.put_u16(*ttl);
                body.put_u8(*replication);
                body.put_u8(*reserved);
                put_id(&mut body, key);
                body.put_slice(value);
            }
            ApiMessage::Get { key } | ApiMessage::Failure { key } => put_id(&mut body, key),
            ApiMessage::Success { key, value } => {
                put_id(&mut body, key);
                body.put_slice(value);
            }
        }

        frame(self.message_type(), &body)
    }
}
