//! Endpoint token sealing.
//!
//! The endpoint URL issued on channel registration carries an opaque token
//! identifying the `(device, channel)` pair. With no key configured the
//! token is the plain `"<hex uaid>.<hex chid>"` string; with a key it is
//! the URL-safe base64 of `nonce || AES-256-GCM(plaintext)`, so the IDs
//! never leak to third-party senders and tampered tokens fail the MAC
//! check.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use thiserror::Error;

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

/// Token errors.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The configured key has the wrong length.
    #[error("token key must be 32 bytes, got {0}")]
    InvalidKey(usize),

    /// The token is not structurally valid.
    #[error("malformed token")]
    Malformed,

    /// The token failed authentication.
    #[error("token failed authentication")]
    Verification,

    /// Encryption failed.
    #[error("token sealing failed")]
    Seal,
}

/// Seals and opens endpoint tokens.
#[derive(Clone)]
pub struct TokenCodec {
    cipher: Option<Aes256Gcm>,
}

impl TokenCodec {
    /// Create a codec. `key` is the raw symmetric key; `None` disables
    /// sealing and tokens pass through in plaintext.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is present but not 32 bytes.
    pub fn new(key: Option<&[u8]>) -> Result<Self, TokenError> {
        let cipher = match key {
            None => None,
            Some(raw) => {
                if raw.len() != 32 {
                    return Err(TokenError::InvalidKey(raw.len()));
                }
                Some(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(raw)))
            }
        };
        Ok(Self { cipher })
    }

    /// Whether tokens are sealed.
    #[must_use]
    pub fn is_sealing(&self) -> bool {
        self.cipher.is_some()
    }

    /// Seal a textual primary key into an endpoint token.
    ///
    /// # Errors
    ///
    /// Returns an error if encryption fails.
    pub fn encode(&self, plain: &str) -> Result<String, TokenError> {
        let Some(cipher) = &self.cipher else {
            return Ok(plain.to_string());
        };
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(&nonce, plain.as_bytes())
            .map_err(|_| TokenError::Seal)?;
        let mut raw = Vec::with_capacity(NONCE_LEN + sealed.len());
        raw.extend_from_slice(&nonce);
        raw.extend_from_slice(&sealed);
        Ok(URL_SAFE_NO_PAD.encode(raw))
    }

    /// Open an endpoint token back into the textual primary key.
    ///
    /// # Errors
    ///
    /// `Malformed` if the token is not decodable base64 or too short;
    /// `Verification` if the MAC does not verify under the configured key.
    pub fn decode(&self, token: &str) -> Result<String, TokenError> {
        let Some(cipher) = &self.cipher else {
            return Ok(token.to_string());
        };
        let raw = URL_SAFE_NO_PAD
            .decode(token.trim_end_matches('='))
            .map_err(|_| TokenError::Malformed)?;
        if raw.len() <= NONCE_LEN {
            return Err(TokenError::Malformed);
        }
        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let plain = cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| TokenError::Verification)?;
        String::from_utf8(plain).map_err(|_| TokenError::Verification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8; 32] = b"an example very very secret key.";

    #[test]
    fn test_plaintext_passthrough() {
        let codec = TokenCodec::new(None).unwrap();
        assert!(!codec.is_sealing());
        assert_eq!(codec.encode("aa.bb").unwrap(), "aa.bb");
        assert_eq!(codec.decode("aa.bb").unwrap(), "aa.bb");
    }

    #[test]
    fn test_seal_open_identity() {
        let codec = TokenCodec::new(Some(KEY)).unwrap();
        let token = codec.encode("aabb.ccdd").unwrap();
        assert_ne!(token, "aabb.ccdd");
        assert_eq!(codec.decode(&token).unwrap(), "aabb.ccdd");
    }

    #[test]
    fn test_tokens_are_nonce_randomized() {
        let codec = TokenCodec::new(Some(KEY)).unwrap();
        let a = codec.encode("aabb.ccdd").unwrap();
        let b = codec.encode("aabb.ccdd").unwrap();
        assert_ne!(a, b);
        assert_eq!(codec.decode(&a).unwrap(), codec.decode(&b).unwrap());
    }

    #[test]
    fn test_wrong_key_fails_verification() {
        let codec = TokenCodec::new(Some(KEY)).unwrap();
        let other = TokenCodec::new(Some(b"another key that is 32 bytes wow")).unwrap();
        let token = codec.encode("aabb.ccdd").unwrap();
        assert!(matches!(
            other.decode(&token),
            Err(TokenError::Verification)
        ));
    }

    #[test]
    fn test_malformed_tokens() {
        let codec = TokenCodec::new(Some(KEY)).unwrap();
        assert!(matches!(
            codec.decode("!!not-base64!!"),
            Err(TokenError::Malformed)
        ));
        // Valid base64 but shorter than a nonce.
        assert!(matches!(codec.decode("aGk"), Err(TokenError::Malformed)));
    }

    #[test]
    fn test_rejects_bad_key_length() {
        assert!(matches!(
            TokenCodec::new(Some(b"short")),
            Err(TokenError::InvalidKey(5))
        ));
    }
}
