//! # OpenPGP capabilities.
//!
//! The primitives themselves live outside of this crate. The application
//! plugs them in through [`AttachmentCrypto`] and [`KeyProvider`] when it
//! creates the [`Context`](crate::context::Context).

use std::fmt;

use anyhow::Result;
use futures::future::BoxFuture;

/// Symmetric key an attachment data packet is encrypted with.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey {
    /// Raw key material.
    pub data: Vec<u8>,

    /// Symmetric algorithm name, e.g. `aes256`.
    pub algorithm: String,
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("data", &"<redacted>")
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

/// Unlocked private key material of one address.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey(pub Vec<u8>);

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

/// Outcome of verifying a detached signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignatureStatus {
    /// Not verified yet, or the verification keys were not available.
    #[default]
    Unknown,
    Valid,
    Invalid,
    NotSigned,
}

/// Plaintext of an attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decrypted {
    pub data: Vec<u8>,
    pub signature: SignatureStatus,
}

/// Resolves the private keys of a sending identity.
pub trait KeyProvider: Send + Sync + fmt::Debug {
    /// Returns the unlocked private keys of `address_id`.
    fn private_keys(&self, address_id: &str) -> Result<Vec<PrivateKey>>;
}

/// Decryption of attachment packets.
pub trait AttachmentCrypto: Send + Sync + fmt::Debug {
    /// Recovers the session key from `key_packets`.
    fn decrypt_session_key<'a>(
        &'a self,
        key_packets: &'a [u8],
        keys: &'a [PrivateKey],
    ) -> BoxFuture<'a, Result<SessionKey>>;

    /// Decrypts the data packet `data` whose session key is in `key_packets`.
    fn decrypt_attachment<'a>(
        &'a self,
        key_packets: &'a [u8],
        data: &'a [u8],
        keys: &'a [PrivateKey],
    ) -> BoxFuture<'a, Result<Decrypted>>;
}
