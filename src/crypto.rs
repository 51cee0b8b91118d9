//! Cryptographic primitives for the broker.
//!
//! Post-handshake frames are sealed with the Fernet token format
//! (AES-128-CBC + HMAC-SHA-256 over a timestamped envelope, URL-safe base64)
//! so the symmetric layer interoperates with clients built on the reference
//! Fernet implementation. The per-connection key travels to the client
//! RSA-OAEP(SHA-256)-wrapped under its 2048-bit public key. Password
//! verifiers use a salted SHA-256 digest compared in constant time.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPublicKey};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

const FERNET_VERSION: u8 = 0x80;
const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 32;
// version + timestamp + IV + one cipher block + tag
const MIN_TOKEN_LEN: usize = 1 + 8 + IV_LEN + 16 + TAG_LEN;

/// Errors emitted by the crypto layer.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("public key rejected: {0}")]
    PublicKey(String),
    #[error("key wrap failed: {0}")]
    Wrap(String),
    #[error("symmetric key material rejected")]
    Key,
    // deliberately detail-free: forged and malformed tokens are
    // indistinguishable to the peer
    #[error("token rejected")]
    Token,
}

/// Symmetric cipher in the Fernet token format.
///
/// A key is 32 random bytes carried as 44 bytes of URL-safe base64; the
/// first half signs, the second half encrypts. Tokens are
/// `0x80 ‖ timestamp ‖ IV ‖ ciphertext ‖ HMAC`, base64-encoded.
#[derive(Clone)]
pub struct Fernet {
    signing: [u8; 16],
    encryption: [u8; 16],
}

impl std::fmt::Debug for Fernet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Fernet(..)")
    }
}

impl Fernet {
    /// Mints a fresh base64 key suitable for [`Fernet::new`].
    pub fn generate_key() -> String {
        let mut raw = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut raw);
        URL_SAFE.encode(raw)
    }

    pub fn new(key: &str) -> Result<Self, CryptoError> {
        let raw = URL_SAFE.decode(key.trim()).map_err(|_| CryptoError::Key)?;
        if raw.len() != KEY_LEN {
            return Err(CryptoError::Key);
        }
        let mut signing = [0u8; 16];
        let mut encryption = [0u8; 16];
        signing.copy_from_slice(&raw[..16]);
        encryption.copy_from_slice(&raw[16..]);
        Ok(Self { signing, encryption })
    }

    /// Seals `plaintext` into a URL-safe token with a fresh IV.
    pub fn encrypt(&self, plaintext: &[u8]) -> String {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let ciphertext = Aes128CbcEnc::new((&self.encryption).into(), (&iv).into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut token = Vec::with_capacity(1 + 8 + IV_LEN + ciphertext.len() + TAG_LEN);
        token.push(FERNET_VERSION);
        token.extend_from_slice(&timestamp.to_be_bytes());
        token.extend_from_slice(&iv);
        token.extend_from_slice(&ciphertext);
        let tag = self.tag(&token);
        token.extend_from_slice(&tag);
        URL_SAFE.encode(token)
    }

    /// Opens a token, verifying the HMAC before touching the ciphertext.
    pub fn decrypt(&self, token: &str) -> Result<Vec<u8>, CryptoError> {
        let raw = URL_SAFE
            .decode(token.trim())
            .map_err(|_| CryptoError::Token)?;
        if raw.len() < MIN_TOKEN_LEN || raw[0] != FERNET_VERSION {
            return Err(CryptoError::Token);
        }
        let (body, tag) = raw.split_at(raw.len() - TAG_LEN);
        let mut mac =
            HmacSha256::new_from_slice(&self.signing).map_err(|_| CryptoError::Token)?;
        mac.update(body);
        mac.verify_slice(tag).map_err(|_| CryptoError::Token)?;

        let iv: &[u8; IV_LEN] = body[9..9 + IV_LEN]
            .try_into()
            .map_err(|_| CryptoError::Token)?;
        Aes128CbcDec::new((&self.encryption).into(), iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&body[9 + IV_LEN..])
            .map_err(|_| CryptoError::Token)
    }

    fn tag(&self, body: &[u8]) -> [u8; TAG_LEN] {
        let mut mac = HmacSha256::new_from_slice(&self.signing)
            .expect("hmac accepts any key length");
        mac.update(body);
        mac.finalize().into_bytes().into()
    }
}

/// Parses a client's PEM-encoded RSA public key and enforces the minimum
/// modulus size.
pub fn parse_client_public_key(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    let key = RsaPublicKey::from_public_key_pem(pem)
        .map_err(|e| CryptoError::PublicKey(e.to_string()))?;
    if key.size() * 8 < 2048 {
        return Err(CryptoError::PublicKey(format!(
            "modulus too small: {} bits",
            key.size() * 8
        )));
    }
    Ok(key)
}

/// Wraps the symmetric key material under the client's public key.
pub fn wrap_session_key(public: &RsaPublicKey, key_material: &[u8]) -> Result<Vec<u8>, CryptoError> {
    public
        .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), key_material)
        .map_err(|e| CryptoError::Wrap(e.to_string()))
}

/// Produces a salted `salt$hexdigest` password verifier.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let salt = hex::encode(salt);
    let digest = Sha256::digest(format!("{salt}{password}").as_bytes());
    format!("{salt}${}", hex::encode(digest))
}

/// Checks a password against a stored verifier in constant time.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt, digest_hex)) = stored.split_once('$') else {
        return false;
    };
    let Ok(expected) = hex::decode(digest_hex) else {
        return false;
    };
    let computed = Sha256::digest(format!("{salt}{password}").as_bytes());
    computed.as_slice().ct_eq(&expected).into()
}

/// Mints an unpredictable 32-byte URL-safe session token.
pub fn session_token() -> String {
    let mut raw = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut raw);
    URL_SAFE_NO_PAD.encode(raw)
}
