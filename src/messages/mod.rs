//! Length-prefixed binary messages of the client API and the P2P protocol.
//!
//! Every frame starts with `size: u16, message_type: u16` in network byte order,
//! where `size` counts the whole frame including these four bytes.

use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut};

use crate::common::{Id, Peer, ID_SIZE};
use crate::{Error, Result};

pub mod api;
pub mod p2p;

pub use api::ApiMessage;
pub use p2p::{
    FindNodeAnswerArguments, FindNodeArguments, FindValueArguments, FoundValueArguments, Message,
    MessageBody, StoreArguments,
};

/// Size of the `size, message_type` header shared by all frames.
pub const HEADER_SIZE: usize = 4;
/// Largest frame the 16 bit size field can describe.
pub const MAX_MESSAGE_LENGTH: usize = u16::MAX as usize;

const IP_SIZE: usize = 16;
/// Size of an encoded `ip, port, id` peer record.
pub const PEER_SIZE: usize = IP_SIZE + 2 + ID_SIZE;

/// Read one whole frame.
///
/// Returns `Ok(None)` if the connection was closed before a new frame started.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut size = [0_u8; 2];

    match reader.read_exact(&mut size) {
        Ok(()) => {}
        Err(error) if error.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(error) => return Err(error.into()),
    }

    let declared = u16::from_be_bytes(size) as usize;
    if declared < HEADER_SIZE {
        return Err(Error::FrameTooShort(declared));
    }

    let mut frame = Vec::with_capacity(declared);
    frame.extend_from_slice(&size);
    reader
        .by_ref()
        .take((declared - size.len()) as u64)
        .read_to_end(&mut frame)?;

    if frame.len() != declared {
        return Err(Error::SizeMismatch {
            declared,
            actual: frame.len(),
        });
    }

    Ok(Some(frame))
}

/// Write one encoded frame.
pub fn write_frame<W: Write>(writer: &mut W, frame: &[u8]) -> Result<()> {
    writer.write_all(frame)?;
    writer.flush()?;
    Ok(())
}

/// Split off and validate the common header, returning the message type and the body.
fn split_header(bytes: &[u8]) -> Result<(u16, &[u8])> {
    if bytes.len() < HEADER_SIZE {
        return Err(Error::FrameTooShort(bytes.len()));
    }

    let mut header = &bytes[..HEADER_SIZE];
    let declared = header.get_u16() as usize;
    let message_type = header.get_u16();

    if declared != bytes.len() {
        return Err(Error::SizeMismatch {
            declared,
            actual: bytes.len(),
        });
    }

    Ok((message_type, &bytes[HEADER_SIZE..]))
}

/// Prepend the common header to an encoded body.
fn frame(message_type: u16, body: &[u8]) -> Result<Vec<u8>> {
    let size = HEADER_SIZE + body.len();
    if size > MAX_MESSAGE_LENGTH {
        return Err(Error::MessageTooLarge(size));
    }

    let mut frame = Vec::with_capacity(size);
    frame.put_u16(size as u16);
    frame.put_u16(message_type);
    frame.put_slice(body);

    Ok(frame)
}

fn put_id<B: BufMut>(buf: &mut B, id: &Id) {
    buf.put_slice(id.as_bytes());
}

/// Caller checks that at least [ID_SIZE] bytes remain.
fn get_id<B: Buf>(buf: &mut B) -> Id {
    let mut id = [0_u8; ID_SIZE];
    buf.copy_to_slice(&mut id);
    Id(id)
}

fn put_peer<B: BufMut>(buf: &mut B, peer: &Peer) {
    let ip = match peer.ip() {
        IpAddr::V4(ip) => ip.to_ipv6_mapped(),
        IpAddr::V6(ip) => ip,
    };

    buf.put_slice(&ip.octets());
    buf.put_u16(peer.port());
    put_id(buf, peer.id());
}

/// Caller checks that at least [PEER_SIZE] bytes remain.
fn get_peer<B: Buf>(buf: &mut B) -> Peer {
    let mut octets = [0_u8; IP_SIZE];
    buf.copy_to_slice(&mut octets);

    let ip = Ipv6Addr::from(octets);
    let ip = match ip.to_ipv4_mapped() {
        Some(ip) => IpAddr::V4(ip),
        None => IpAddr::V6(ip),
    };
    let port = buf.get_u16();
    let id = get_id(buf);

    Peer::new(id, SocketAddr::new(ip, port))
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn peer_record_keeps_ipv4_and_ipv6() {
        for address in ["10.0.0.7:4000", "[2001:db8::1]:4001"] {
            let peer = Peer::random(address.parse().unwrap());

            let mut buf = Vec::new();
            put_peer(&mut buf, &peer);
            assert_eq!(buf.len(), PEER_SIZE);

            let decoded = get_peer(&mut buf.as_slice());
            assert_eq!(decoded, peer);
            assert_eq!(decoded.address(), peer.address());
        }
    }

    #[test]
    fn read_frames_back_to_back() {
        let first = frame(1, b"abc").unwrap();
        let second = frame(2, b"").unwrap();

        let mut stream = Cursor::new([first.clone(), second.clone()].concat());

        assert_eq!(read_frame(&mut stream).unwrap(), Some(first));
        assert_eq!(read_frame(&mut stream).unwrap(), Some(second));
        assert_eq!(read_frame(&mut stream).unwrap(), None);
    }

    #[test]
    fn truncated_frame_is_a_size_mismatch() {
        let mut bytes = frame(1, b"abcdef").unwrap();
        bytes.truncate(7);

        assert!(matches!(
            read_frame(&mut Cursor::new(bytes)),
            Err(Error::SizeMismatch {
                declared: 10,
                actual: 7
            })
        ));
    }

    #[test]
    fn frame_smaller_than_header() {
        assert!(matches!(
            read_frame(&mut Cursor::new([0_u8, 3, 0])),
            Err(Error::FrameTooShort(3))
        ));
    }

    #[test]
    fn oversized_message() {
        let body = vec![0_u8; MAX_MESSAGE_LENGTH];

        assert!(matches!(
            frame(1, &body),
            Err(Error::MessageTooLarge(_))
        ));
    }
}
