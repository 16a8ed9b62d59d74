//! Main Crate Error

use crate::config::ConfigError;

#[derive(thiserror::Error, Debug)]
/// Kadnode crate error enum.
pub enum Error {
    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    /// Fatal configuration error, see [ConfigError].
    Config(#[from] ConfigError),

    /// Id was created from a byte slice of the wrong length.
    #[error("Invalid Id size, expected {expected}, got {0}", expected = crate::common::ID_SIZE)]
    InvalidIdSize(usize),

    /// Id could not be parsed from a hex string.
    #[error("Invalid Id encoding: {0}")]
    InvalidId(String),

    /// The host key file is not an RSA private key PEM.
    #[error("Invalid host key: {0}")]
    InvalidHostKey(String),

    /// The `size` field of a frame disagrees with the bytes actually carried.
    #[error("Declared message size {declared} does not match received size {actual}")]
    SizeMismatch { declared: usize, actual: usize },

    /// A frame declares a size smaller than the common `size, type` header.
    #[error("Frame of {0} bytes is shorter than a message header")]
    FrameTooShort(usize),

    /// A frame is shorter than the fixed part of its message type.
    #[error("Message of type {message_type} is too short: {size} bytes")]
    MessageTooShort { message_type: u16, size: usize },

    /// An encoded message would not fit the 16 bit size field.
    #[error("Message of {0} bytes exceeds the maximum message length")]
    MessageTooLarge(usize),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u16),

    /// A known message arrived where it is not accepted, such as DHT_SUCCESS sent to the API.
    #[error("Unexpected message type: {0}")]
    UnexpectedMessageType(u16),

    /// A FIND_NODE_ANSWER body is not a whole number of peer records.
    #[error("Peer list of {0} bytes is not a multiple of the peer record size")]
    InvalidPeerList(usize),

    /// Splitting a bucket whose prefix already covers every bit of the id.
    ///
    /// This is a defect in the routing table, never a result of remote input.
    #[error("Tried to split a k-bucket at maximum depth (prefix {0})")]
    SplitAtMaxDepth(String),
}

/// Alias for `Result<T, kadnode::Error>`.
pub type Result<T, E = Error> = std::result::Result<T, E>;
