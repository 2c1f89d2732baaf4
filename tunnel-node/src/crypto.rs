//! Session encryption for tunnel connections.
//!
//! Each connection agrees on a fresh key during the handshake:
//! - both sides generate an ephemeral X25519 key pair and exchange the
//!   public halves in Open/Accept (base64, field `pc_key`)
//! - the shared secret is expanded with HKDF-SHA256, salted with the
//!   connection id, into a 32-byte XChaCha20-Poly1305 key
//! - every Data/DataAck payload is sealed with a random 192-bit nonce
//!   prefixed to the ciphertext, and the plaintext header as associated data
//!
//! The `none` cipher passes payloads through unchanged.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use sha2::Sha256;
use std::sync::Arc;
use thiserror::Error;
use tunnel_types::{ConnectionId, Header, WireError};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Nonce size for XChaCha20-Poly1305 (192 bits = 24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Key size for XChaCha20-Poly1305 (256 bits = 32 bytes).
pub const KEY_SIZE: usize = 32;

/// Cipher name for unencrypted sessions.
pub const CIPHER_NONE: &str = "none";

/// Cipher name for XChaCha20-Poly1305 sessions.
pub const CIPHER_XCHACHA: &str = "xchacha20-poly1305";

/// Curve name for X25519 key agreement.
pub const CURVE_X25519: &str = "x25519";

const SESSION_INFO: &[u8] = b"relay-tunnel session v1";

/// Crypto errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The peer asked for a cipher we do not implement.
    #[error("unsupported cipher: {0}")]
    UnsupportedCipher(String),

    /// The peer asked for a curve we do not implement.
    #[error("unsupported curve: {0}")]
    UnsupportedCurve(String),

    /// The peer's public key is malformed or weak.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (authentication error).
    #[error("decryption failed: authentication error")]
    DecryptionFailed,

    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// The OS random source failed.
    #[error("random source failed: {0}")]
    Random(String),

    /// The header could not be encoded as associated data.
    #[error("header encoding failed: {0}")]
    Header(#[from] WireError),
}

/// Symmetric cipher protecting the payloads of one connection.
pub trait SessionCipher: Send + Sync {
    /// Cipher name as negotiated in the bridge options.
    fn name(&self) -> &'static str;

    /// Seal a payload travelling under `header`.
    fn encrypt(&self, header: &Header, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Open a payload received under `header`.
    fn decrypt(&self, header: &Header, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Pass-through cipher (`none`).
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextCipher;

impl SessionCipher for PlaintextCipher {
    fn name(&self) -> &'static str {
        CIPHER_NONE
    }

    fn encrypt(&self, _header: &Header, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, _header: &Header, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(ciphertext.to_vec())
    }
}

/// XChaCha20-Poly1305 with a per-connection key.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct XChaChaCipher {
    key: [u8; KEY_SIZE],
}

impl XChaChaCipher {
    /// Create a cipher from a raw key.
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    fn aead(&self) -> Result<XChaCha20Poly1305, CryptoError> {
        XChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
    }
}

impl SessionCipher for XChaChaCipher {
    fn name(&self) -> &'static str {
        CIPHER_XCHACHA
    }

    fn encrypt(&self, header: &Header, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let aad = header.to_bytes()?;
        let mut nonce = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce).map_err(|e| CryptoError::Random(e.to_string()))?;

        let ciphertext = self
            .aead()?
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed("aead encrypt failed".into()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn decrypt(&self, header: &Header, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < NONCE_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        let aad = header.to_bytes()?;
        let (nonce, body) = ciphertext.split_at(NONCE_SIZE);

        self.aead()?
            .decrypt(XNonce::from_slice(nonce), Payload { msg: body, aad: &aad })
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

// Don't leak keys in debug output
impl std::fmt::Debug for XChaChaCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "XChaChaCipher {{ key: [REDACTED] }}")
    }
}

/// One side's ephemeral key material for a single handshake.
///
/// Consumed by [`EphemeralKeys::derive`]; the secret is zeroized on drop.
pub struct EphemeralKeys {
    cipher: &'static str,
    secret: Option<StaticSecret>,
    public_key: String,
}

impl EphemeralKeys {
    /// Generate keys for the negotiated cipher and curve.
    pub fn generate(cipher: &str, curve: &str) -> Result<Self, CryptoError> {
        match cipher {
            CIPHER_NONE => Ok(Self {
                cipher: CIPHER_NONE,
                secret: None,
                public_key: String::new(),
            }),
            CIPHER_XCHACHA => {
                if curve != CURVE_X25519 {
                    return Err(CryptoError::UnsupportedCurve(curve.to_string()));
                }
                let mut bytes = [0u8; 32];
                getrandom::getrandom(&mut bytes).map_err(|e| CryptoError::Random(e.to_string()))?;
                let secret = StaticSecret::from(bytes);
                bytes.zeroize();
                let public_key = BASE64.encode(PublicKey::from(&secret).as_bytes());
                Ok(Self {
                    cipher: CIPHER_XCHACHA,
                    secret: Some(secret),
                    public_key,
                })
            }
            other => Err(CryptoError::UnsupportedCipher(other.to_string())),
        }
    }

    /// Public key to send to the peer (empty for `none`).
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Name of the cipher these keys were generated for.
    pub fn cipher(&self) -> &'static str {
        self.cipher
    }

    /// Agree on the session cipher with the peer's public key.
    pub fn derive(
        self,
        peer_key: &str,
        connection_id: &ConnectionId,
    ) -> Result<Arc<dyn SessionCipher>, CryptoError> {
        let Some(secret) = self.secret else {
            return Ok(Arc::new(PlaintextCipher));
        };

        let decoded = BASE64
            .decode(peer_key)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        let peer: [u8; 32] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidPublicKey(format!("{} bytes", decoded.len())))?;

        let shared = secret.diffie_hellman(&PublicKey::from(peer));
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicKey("low-order point".into()));
        }

        let hkdf = Hkdf::<Sha256>::new(Some(connection_id.as_bytes()), shared.as_bytes());
        let mut key = [0u8; KEY_SIZE];
        hkdf.expand(SESSION_INFO, &mut key)
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;

        let cipher = XChaChaCipher::new(key);
        key.zeroize();
        Ok(Arc::new(cipher))
    }
}

impl std::fmt::Debug for EphemeralKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeys")
            .field("cipher", &self.cipher)
            .field("public_key", &self.public_key)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnel_types::{DeviceId, MessageType};

    fn header(cid: &ConnectionId) -> Header {
        Header::new(
            DeviceId::random(),
            DeviceId::random(),
            MessageType::Data,
            cid.clone(),
        )
    }

    fn agree(cid: &ConnectionId) -> (Arc<dyn SessionCipher>, Arc<dyn SessionCipher>) {
        let a = EphemeralKeys::generate(CIPHER_XCHACHA, CURVE_X25519).unwrap();
        let b = EphemeralKeys::generate(CIPHER_XCHACHA, CURVE_X25519).unwrap();
        let a_pub = a.public_key().to_string();
        let b_pub = b.public_key().to_string();
        (a.derive(&b_pub, cid).unwrap(), b.derive(&a_pub, cid).unwrap())
    }

    // ===========================================
    // Key Agreement Tests
    // ===========================================

    #[test]
    fn both_sides_derive_the_same_session() {
        let cid = ConnectionId::generate();
        let (opener, acceptor) = agree(&cid);
        let header = header(&cid);

        let sealed = opener.encrypt(&header, b"hello through the relay").unwrap();
        let opened = acceptor.decrypt(&header, &sealed).unwrap();

        assert_eq!(opened, b"hello through the relay");
        assert_eq!(opener.name(), "xchacha20-poly1305");
    }

    #[test]
    fn public_key_is_base64_of_32_bytes() {
        let keys = EphemeralKeys::generate(CIPHER_XCHACHA, CURVE_X25519).unwrap();
        let decoded = BASE64.decode(keys.public_key()).unwrap();
        assert_eq!(decoded.len(), 32);
    }

    #[test]
    fn sessions_of_different_connections_do_not_mix() {
        let (opener, _) = agree(&ConnectionId::new("conn-a"));
        let (_, other) = agree(&ConnectionId::new("conn-b"));
        let header = header(&ConnectionId::new("conn-a"));

        let sealed = opener.encrypt(&header, b"data").unwrap();

        assert!(matches!(
            other.decrypt(&header, &sealed),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn unsupported_names_are_rejected() {
        assert!(matches!(
            EphemeralKeys::generate("aes-128-ecb", CURVE_X25519),
            Err(CryptoError::UnsupportedCipher(_))
        ));
        assert!(matches!(
            EphemeralKeys::generate(CIPHER_XCHACHA, "p256"),
            Err(CryptoError::UnsupportedCurve(_))
        ));
    }

    #[test]
    fn malformed_peer_key_is_rejected() {
        let cid = ConnectionId::generate();
        let keys = EphemeralKeys::generate(CIPHER_XCHACHA, CURVE_X25519).unwrap();
        assert!(matches!(
            keys.derive("not base64!", &cid),
            Err(CryptoError::InvalidPublicKey(_))
        ));

        let keys = EphemeralKeys::generate(CIPHER_XCHACHA, CURVE_X25519).unwrap();
        let short = BASE64.encode([7u8; 16]);
        assert!(matches!(
            keys.derive(&short, &cid),
            Err(CryptoError::InvalidPublicKey(_))
        ));
    }

    #[test]
    fn all_zero_peer_key_is_rejected() {
        let keys = EphemeralKeys::generate(CIPHER_XCHACHA, CURVE_X25519).unwrap();
        let zero = BASE64.encode([0u8; 32]);
        assert!(matches!(
            keys.derive(&zero, &ConnectionId::generate()),
            Err(CryptoError::InvalidPublicKey(_))
        ));
    }

    // ===========================================
    // Sealing Tests
    // ===========================================

    #[test]
    fn header_is_bound_as_associated_data() {
        let cid = ConnectionId::generate();
        let (opener, acceptor) = agree(&cid);
        let header = header(&cid);

        let sealed = opener.encrypt(&header, b"data").unwrap();
        let retyped = header.with_type(MessageType::DataAck);

        assert!(acceptor.decrypt(&retyped, &sealed).is_err());
    }

    #[test]
    fn nonce_is_prefixed_and_random() {
        let cid = ConnectionId::generate();
        let (opener, _) = agree(&cid);
        let header = header(&cid);

        let first = opener.encrypt(&header, b"same").unwrap();
        let second = opener.encrypt(&header, b"same").unwrap();

        // nonce + plaintext + 16-byte tag
        assert_eq!(first.len(), NONCE_SIZE + 4 + 16);
        assert_ne!(first[..NONCE_SIZE], second[..NONCE_SIZE]);
    }

    #[test]
    fn truncated_or_corrupted_ciphertext_fails() {
        let cid = ConnectionId::generate();
        let (opener, acceptor) = agree(&cid);
        let header = header(&cid);

        let mut sealed = opener.encrypt(&header, b"secret").unwrap();
        assert!(acceptor.decrypt(&header, &sealed[..10]).is_err());

        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(acceptor.decrypt(&header, &sealed).is_err());
    }

    #[test]
    fn plaintext_cipher_passes_through() {
        let cid = ConnectionId::generate();
        let keys = EphemeralKeys::generate(CIPHER_NONE, "").unwrap();
        assert_eq!(keys.public_key(), "");

        let cipher = keys.derive("", &cid).unwrap();
        let header = header(&cid);

        assert_eq!(cipher.name(), "none");
        assert_eq!(cipher.encrypt(&header, b"raw").unwrap(), b"raw");
        assert_eq!(cipher.decrypt(&header, b"raw").unwrap(), b"raw");
    }

    #[test]
    fn debug_output_is_redacted() {
        let keys = EphemeralKeys::generate(CIPHER_XCHACHA, CURVE_X25519).unwrap();
        assert!(format!("{keys:?}").contains("REDACTED"));
        assert!(format!("{:?}", XChaChaCipher::new([1u8; KEY_SIZE])).contains("REDACTED"));
    }
}
