//! Session crypto for SecureString exchange
//!
//! PSRP encrypts SecureString payloads under a 256-bit AES session key
//! negotiated over an RSA exchange: the client sends its public key as a
//! CAPI `PUBLICKEYBLOB`, the server answers with the session key encrypted
//! RSAES-PKCS1-v1_5 inside a CAPI `SIMPLEBLOB`. CAPI stores both the
//! modulus and the ciphertext little-endian, hence the byte reversals.
//!
//! The CLIXML codec only sees the [`CryptoProvider`] trait; both methods
//! fail with `CryptoUnavailable` until a session key is registered.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};

use crate::errors::{CryptoError, PsrpError, Result, SerializationError};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const SESSION_KEY_LEN: usize = 32;
const AES_BLOCK_LEN: usize = 16;
const RSA_KEY_BITS: usize = 2048;

// CAPI blob headers: bType, bVersion, reserved u16, aiKeyAlg u32 (LE).
const PUBLIC_KEY_BLOB_HEADER: [u8; 8] = [0x06, 0x02, 0x00, 0x00, 0x00, 0xA4, 0x00, 0x00];
const SIMPLE_BLOB_HEADER: [u8; 12] = [
    0x01, 0x02, 0x00, 0x00, 0x10, 0x66, 0x00, 0x00, 0x00, 0xA4, 0x00, 0x00,
];
const RSA1_MAGIC: [u8; 4] = *b"RSA1";

// ----------------------------------------------------------------------------
// Provider trait
// ----------------------------------------------------------------------------

/// The crypto boundary the CLIXML codec delegates SecureString handling
/// to. Implementations transform the element text directly so they can
/// track whatever the current protocol revision requires.
pub trait CryptoProvider {
    /// Encrypt a plaintext string, returning the base64 element text.
    fn encrypt(&self, value: &str) -> Result<String>;

    /// Decrypt base64 element text back into the plaintext string.
    fn decrypt(&self, value: &str) -> Result<String>;

    /// Install the negotiated session key.
    fn register_session_key(&mut self, key: &[u8]) -> Result<()>;
}

// ----------------------------------------------------------------------------
// AES session cipher
// ----------------------------------------------------------------------------

/// The default provider: AES-256-CBC with PKCS#7 padding and a random IV
/// prepended to each ciphertext. Plaintext is UTF-16-LE on the wire.
#[derive(Clone, Default)]
pub struct SessionCrypto {
    key: Option<[u8; SESSION_KEY_LEN]>,
}

impl std::fmt::Debug for SessionCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of debug output.
        f.debug_struct("SessionCrypto")
            .field("has_key", &self.key.is_some())
            .finish()
    }
}

impl SessionCrypto {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a session key has been registered.
    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }
}

impl CryptoProvider for SessionCrypto {
    fn encrypt(&self, value: &str) -> Result<String> {
        let key = self
            .key
            .as_ref()
            .ok_or(SerializationError::CryptoUnavailable)?;

        let plaintext: Vec<u8> = value
            .encode_utf16()
            .flat_map(|unit| unit.to_le_bytes())
            .collect();

        let mut iv = [0u8; AES_BLOCK_LEN];
        OsRng.fill_bytes(&mut iv);

        let cipher = Aes256CbcEnc::new_from_slices(key, &iv).map_err(|e| {
            PsrpError::Crypto(CryptoError::EncryptionFailed {
                reason: e.to_string(),
            })
        })?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(&plaintext);

        let mut blob = Vec::with_capacity(AES_BLOCK_LEN + ciphertext.len());
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    fn decrypt(&self, value: &str) -> Result<String> {
        let key = self
            .key
            .as_ref()
            .ok_or(SerializationError::CryptoUnavailable)?;

        let decrypt_err = |reason: String| {
            PsrpError::Crypto(CryptoError::DecryptionFailed { reason })
        };

        let blob = BASE64
            .decode(value.trim())
            .map_err(|e| decrypt_err(e.to_string()))?;
        if blob.len() < AES_BLOCK_LEN * 2 || blob.len() % AES_BLOCK_LEN != 0 {
            return Err(decrypt_err(format!("invalid blob length {}", blob.len())));
        }
        let (iv, ciphertext) = blob.split_at(AES_BLOCK_LEN);

        let cipher = Aes256CbcDec::new_from_slices(key, iv)
            .map_err(|e| decrypt_err(e.to_string()))?;
        let plaintext = cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|e| decrypt_err(e.to_string()))?;

        if plaintext.len() % 2 != 0 {
            return Err(decrypt_err("plaintext is not UTF-16".to_string()));
        }
        let units: Vec<u16> = plaintext
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16(&units).map_err(|e| decrypt_err(e.to_string()))
    }

    fn register_session_key(&mut self, key: &[u8]) -> Result<()> {
        if key.len() != SESSION_KEY_LEN {
            return Err(PsrpError::Crypto(CryptoError::InvalidKeyLength {
                expected: SESSION_KEY_LEN,
                actual: key.len(),
            }));
        }
        let mut buf = [0u8; SESSION_KEY_LEN];
        buf.copy_from_slice(key);
        self.key = Some(buf);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Key exchange
// ----------------------------------------------------------------------------

/// Generate the client's exchange keypair. Returns the private key and
/// the public key encoded as a CAPI `PUBLICKEYBLOB`.
pub fn generate_exchange_key() -> Result<(RsaPrivateKey, Vec<u8>)> {
    let private = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS).map_err(|e| {
        PsrpError::Crypto(CryptoError::KeyGeneration {
            reason: e.to_string(),
        })
    })?;
    let blob = public_key_blob(&RsaPublicKey::from(&private));
    Ok((private, blob))
}

/// Encode a public key as a CAPI `PUBLICKEYBLOB` (CALG_RSA_KEYX).
fn public_key_blob(key: &RsaPublicKey) -> Vec<u8> {
    let mut modulus = key.n().to_bytes_le();
    modulus.resize(RSA_KEY_BITS / 8, 0);

    let mut blob = Vec::with_capacity(20 + modulus.len());
    blob.extend_from_slice(&PUBLIC_KEY_BLOB_HEADER);
    blob.extend_from_slice(&RSA1_MAGIC);
    blob.extend_from_slice(&(RSA_KEY_BITS as u32).to_le_bytes());
    let mut exponent = key.e().to_bytes_le();
    exponent.resize(4, 0);
    blob.extend_from_slice(&exponent);
    blob.extend_from_slice(&modulus);
    blob
}

/// Decode a CAPI `PUBLICKEYBLOB` into an RSA public key.
fn parse_public_key_blob(blob: &[u8]) -> Result<RsaPublicKey> {
    let invalid = |reason: &str| {
        PsrpError::Crypto(CryptoError::InvalidKeyBlob {
            reason: reason.to_string(),
        })
    };

    if blob.len() < 20 {
        return Err(invalid("blob too short"));
    }
    if blob[0] != 0x06 || blob[8..12] != RSA1_MAGIC {
        return Err(invalid("not an RSA public key blob"));
    }

    let bit_len = u32::from_le_bytes([blob[12], blob[13], blob[14], blob[15]]) as usize;
    let modulus_len = bit_len / 8;
    if blob.len() < 20 + modulus_len {
        return Err(invalid("modulus truncated"));
    }

    let exponent = BigUint::from_bytes_le(&blob[16..20]);
    let modulus = BigUint::from_bytes_le(&blob[20..20 + modulus_len]);
    RsaPublicKey::new(modulus, exponent).map_err(|e| invalid(&e.to_string()))
}

/// Encrypt a session key under the peer's exchange key, producing the
/// CAPI `SIMPLEBLOB` carried by ENCRYPTED_SESSION_KEY.
pub fn encrypt_session_key(public_key_blob: &[u8], session_key: &[u8]) -> Result<Vec<u8>> {
    let public_key = parse_public_key_blob(public_key_blob)?;
    let mut encrypted = public_key
        .encrypt(&mut OsRng, Pkcs1v15Encrypt, session_key)
        .map_err(|e| {
            PsrpError::Crypto(CryptoError::EncryptionFailed {
                reason: e.to_string(),
            })
        })?;
    encrypted.reverse();

    let mut blob = Vec::with_capacity(SIMPLE_BLOB_HEADER.len() + encrypted.len());
    blob.extend_from_slice(&SIMPLE_BLOB_HEADER);
    blob.extend_from_slice(&encrypted);
    Ok(blob)
}

/// Decrypt an ENCRYPTED_SESSION_KEY `SIMPLEBLOB` with the private
/// exchange key.
pub fn decrypt_session_key(private_key: &RsaPrivateKey, blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() <= SIMPLE_BLOB_HEADER.len() || blob[0] != 0x01 {
        return Err(PsrpError::Crypto(CryptoError::InvalidKeyBlob {
            reason: "not a simple key blob".to_string(),
        }));
    }

    let mut ciphertext = blob[SIMPLE_BLOB_HEADER.len()..].to_vec();
    ciphertext.reverse();

    private_key
        .decrypt(Pkcs1v15Encrypt, &ciphertext)
        .map_err(|e| {
            PsrpError::Crypto(CryptoError::DecryptionFailed {
                reason: e.to_string(),
            })
        })
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_cipher_round_trip() {
        let mut crypto = SessionCrypto::new();
        assert!(crypto.encrypt("secret").unwrap_err().is_crypto_unavailable());
        assert!(crypto.decrypt("AAAA").unwrap_err().is_crypto_unavailable());

        crypto.register_session_key(&[0x11; SESSION_KEY_LEN]).unwrap();
        let encrypted = crypto.encrypt("p@ssw0rd \u{00E9}").unwrap();
        assert_ne!(encrypted, "p@ssw0rd \u{00E9}");
        assert_eq!(crypto.decrypt(&encrypted).unwrap(), "p@ssw0rd \u{00E9}");
    }

    #[test]
    fn test_session_cipher_random_iv() {
        let mut crypto = SessionCrypto::new();
        crypto.register_session_key(&[0x22; SESSION_KEY_LEN]).unwrap();
        let a = crypto.encrypt("same input").unwrap();
        let b = crypto.encrypt("same input").unwrap();
        assert_ne!(a, b);
        assert_eq!(crypto.decrypt(&a).unwrap(), crypto.decrypt(&b).unwrap());
    }

    #[test]
    fn test_register_key_validates_length() {
        let mut crypto = SessionCrypto::new();
        assert!(crypto.register_session_key(&[0u8; 16]).is_err());
        assert!(crypto.register_session_key(&[0u8; 32]).is_ok());
    }

    #[test]
    fn test_key_exchange_round_trip() {
        let (private, public_blob) = generate_exchange_key().unwrap();
        assert_eq!(public_blob[0], 0x06);
        assert_eq!(&public_blob[8..12], b"RSA1");

        let session_key = [0xAB; SESSION_KEY_LEN];
        let encrypted = encrypt_session_key(&public_blob, &session_key).unwrap();
        assert_eq!(&encrypted[..12], &SIMPLE_BLOB_HEADER);

        let decrypted = decrypt_session_key(&private, &encrypted).unwrap();
        assert_eq!(decrypted, session_key);
    }

    #[test]
    fn test_malformed_blobs_rejected() {
        assert!(parse_public_key_blob(&[0u8; 8]).is_err());
        let (private, _) = generate_exchange_key().unwrap();
        assert!(decrypt_session_key(&private, &[0u8; 4]).is_err());
    }
}
