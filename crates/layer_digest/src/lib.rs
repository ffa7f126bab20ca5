#![deny(missing_docs)]

//! Digests used as equality keys for file content inside image layers.
//!
//! Everything here is generic over the [`Digest`] trait of the
//! [RustCrypto/hashes](https://github.com/RustCrypto/hashes) project, so any algorithm that
//! implements it can be used as a content key. The set of algorithms that can be selected at
//! runtime (for example from a command line flag) is described by [`DigestAlgorithm`].
//!
//! # Examples
//!
//! ```
//! use layer_digest::{compute_bytes_digest, Sha256};
//!
//! let digest = compute_bytes_digest::<Sha256>("Hello, world!");
//! assert_eq!(
//!     format!("{digest:x}"),
//!     "315f5bdb76d078c43b8ac0064e4a0164612b1fce77c869345bfc94c75894edd3"
//! );
//! ```
//!
//! # Available functions
//!
//! - [`compute_bytes_digest`]: Computes the hash of an in-memory byte slice.
//! - [`parse_digest_from_hex`]: Given a hex representation of a digest, parses it to bytes.
//! - [`oci_digest`]: Formats a SHA-256 digest the way image manifests spell it.
//! - [`HashingWriter`]: wraps a writable object and computes the hash of everything written to
//!   it. With the `tokio` feature it also implements [`::tokio::io::AsyncWrite`].

#[cfg(feature = "tokio")]
mod tokio;

#[cfg(feature = "serde")]
pub mod serde;

pub use digest;

use blake2::digest::consts::U32;
use blake2::Blake2b;
use digest::{Digest, Output};
use std::fmt::{Display, Formatter};
use std::io::Write;
use std::str::FromStr;

pub use md5::Md5;
pub use sha2::Sha256;

/// A type alias for the output of a SHA256 hash.
pub type Sha256Hash = sha2::digest::Output<Sha256>;

/// A type for a 32 bit length blake2b digest.
pub type Blake2b256 = Blake2b<U32>;

/// The digest algorithms that can be chosen at runtime to compare file contents.
///
/// `Md5` is fast but only suitable when collisions are not a concern. `Sha256` and `Blake2b256`
/// are collision resistant.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum DigestAlgorithm {
    /// MD5, 128 bits.
    Md5,
    /// SHA-256, 256 bits.
    #[default]
    Sha256,
    /// BLAKE2b truncated to 256 bits.
    Blake2b256,
}

impl DigestAlgorithm {
    /// All supported algorithms.
    pub const ALL: [DigestAlgorithm; 3] = [
        DigestAlgorithm::Md5,
        DigestAlgorithm::Sha256,
        DigestAlgorithm::Blake2b256,
    ];

    /// The canonical lowercase name of the algorithm.
    pub fn as_str(self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "md5",
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Blake2b256 => "blake2b256",
        }
    }
}

impl Display for DigestAlgorithm {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an unknown digest algorithm name.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown digest algorithm '{0}', expected one of md5, sha256 or blake2b256")]
pub struct ParseDigestAlgorithmError(String);

impl FromStr for DigestAlgorithm {
    type Err = ParseDigestAlgorithmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(DigestAlgorithm::Md5),
            "sha256" | "sha-256" => Ok(DigestAlgorithm::Sha256),
            "blake2b256" | "blake2b-256" | "blake2b" => Ok(DigestAlgorithm::Blake2b256),
            _ => Err(ParseDigestAlgorithmError(s.to_owned())),
        }
    }
}

/// Compute a hash of the specified bytes.
pub fn compute_bytes_digest<D: Digest + Default>(bytes: impl AsRef<[u8]>) -> Output<D> {
    let mut hasher = D::default();
    hasher.update(bytes);
    hasher.finalize()
}

/// Parses a hash hex string to a digest.
pub fn parse_digest_from_hex<D: Digest>(str: &str) -> Option<Output<D>> {
    let mut hash = <Output<D>>::default();
    match hex::decode_to_slice(str, &mut hash) {
        Ok(_) => Some(hash),
        Err(_) => None,
    }
}

/// Formats a SHA-256 digest as an OCI content identifier (`sha256:<hex>`).
pub fn oci_digest(hash: &Sha256Hash) -> String {
    format!("sha256:{hash:x}")
}

/// A simple object that provides a [`Write`] implementation that also immediately hashes the bytes
/// written to it. Call [`HashingWriter::finalize`] to retrieve both the original `impl Write`
/// object as well as the hash.
///
/// If the `tokio` feature is enabled this object also implements [`::tokio::io::AsyncWrite`] which
/// allows you to use it in an async context as well.
#[cfg(not(feature = "tokio"))]
pub struct HashingWriter<W, D: Digest> {
    writer: W,
    hasher: D,
}

#[cfg(feature = "tokio")]
pin_project_lite::pin_project! {
    /// A simple object that provides a [`Write`] implementation that also immediately hashes the
    /// bytes written to it. Call [`HashingWriter::finalize`] to retrieve both the original
    /// `impl Write` object as well as the hash.
    ///
    /// This object also implements [`::tokio::io::AsyncWrite`] which allows you to use it in an
    /// async context as well.
    pub struct HashingWriter<W, D: Digest> {
        #[pin]
        writer: W,
        hasher: D,
    }
}

impl<W, D: Digest + Default> HashingWriter<W, D> {
    /// Constructs a new instance from a writer and a new (empty) hasher.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            hasher: Default::default(),
        }
    }
}

impl<W, D: Digest> HashingWriter<W, D> {
    /// Consumes this instance and returns the original writer and the hash of all bytes written to
    /// this instance.
    pub fn finalize(self) -> (W, Output<D>) {
        (self.writer, self.hasher.finalize())
    }
}

impl<W: Write, D: Digest> Write for HashingWriter<W, D> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let bytes = self.writer.write(buf)?;
        self.hasher.update(&buf[..bytes]);
        Ok(bytes)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}
