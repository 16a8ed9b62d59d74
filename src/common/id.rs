//! Kademlia node Id or a storage key
use rand::Rng;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey};
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use std::{
    fmt::{self, Debug, Display, Formatter},
    fs,
    path::Path,
    str::FromStr,
};

use crate::{Error, Result};

/// The size of node IDs and keys in bytes.
pub const ID_SIZE: usize = 32;
/// The size of node IDs and keys in bits.
pub const ID_BITS: usize = ID_SIZE * 8;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Kademlia node Id or a storage key.
///
/// The derived ordering is the unsigned big-endian ordering of the bytes, which
/// is exactly how two XOR distances are compared for closeness.
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE](crate::common::ID_SIZE).
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp.copy_from_slice(bytes);

        Ok(Id(tmp))
    }

    /// Derive a self-certifying Id from an RSA private key PEM file.
    ///
    /// See [Id::from_hostkey_pem].
    pub fn from_hostkey<P: AsRef<Path>>(path: P) -> Result<Id> {
        let pem = fs::read_to_string(path)?;

        Id::from_hostkey_pem(&pem)
    }

    /// The SHA-256 of the DER encoded public key (SubjectPublicKeyInfo) of an
    /// RSA private key, given as PKCS#1 (`RSA PRIVATE KEY`) or PKCS#8 PEM.
    ///
    /// Anyone holding the public key can derive the same Id.
    pub fn from_hostkey_pem(pem: &str) -> Result<Id> {
        let key = RsaPrivateKey::from_pkcs1_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
            .map_err(|error| Error::InvalidHostKey(error.to_string()))?;

        let public_key = key
            .to_public_key()
            .to_public_key_der()
            .map_err(|error| Error::InvalidHostKey(error.to_string()))?;

        Ok(Id(Sha256::digest(public_key.as_bytes()).into()))
    }

    /// XOR distance between this Id and another.
    ///
    /// Compare two distances with `Ord`: smaller means closer.
    pub fn distance(&self, other: &Id) -> Id {
        let mut xor = [0_u8; ID_SIZE];

        for (i, byte) in xor.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Id(xor)
    }

    /// Returns the bit at `index`, most significant bit of the first byte first.
    pub fn bit(&self, index: usize) -> bool {
        self.0[index / 8] & (0b1000_0000 >> (index % 8)) != 0
    }

    /// Returns `true` if the first `prefix.len()` bits of this Id equal `prefix`.
    pub fn starts_with(&self, prefix: &Prefix) -> bool {
        (0..prefix.len()).all(|i| self.bit(i) == prefix.bit(i))
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Id> {
        if s.len() != ID_SIZE * 2 {
            return Err(Error::InvalidIdSize(s.len() / 2));
        }

        let mut bytes = [0_u8; ID_SIZE];

        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = s
                .get(i * 2..i * 2 + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| Error::InvalidId(s.to_string()))?;
        }

        Ok(Id(bytes))
    }
}

/// A bit string addressing a subtree of the identifier space.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Prefix {
    bits: [u8; ID_SIZE],
    len: usize,
}

impl Prefix {
    /// The empty prefix, covering the whole identifier space.
    pub fn root() -> Self {
        Prefix {
            bits: [0; ID_SIZE],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bit(&self, index: usize) -> bool {
        self.bits[index / 8] & (0b1000_0000 >> (index % 8)) != 0
    }

    /// Returns a copy of this prefix extended by one bit, or `None` if it is
    /// already [ID_BITS] long.
    pub fn child(&self, bit: bool) -> Option<Prefix> {
        if self.len == ID_BITS {
            return None;
        }

        let mut child = *self;
        if bit {
            child.bits[self.len / 8] |= 0b1000_0000 >> (self.len % 8);
        }
        child.len += 1;

        Some(child)
    }
}

impl Display for Prefix {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for i in 0..self.len {
            write!(f, "{}", if self.bit(i) { '1' } else { '0' })?;
        }
        Ok(())
    }
}

impl Debug for Prefix {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Prefix({})", self)
    }
}
