//! AES-256-GCM envelope encryption for OAuth tokens.
//!
//! Tokens are encrypted before they touch persistent storage. The key is
//! derived once per process from a master secret via PBKDF2-HMAC-SHA256; the
//! ciphertext and auth tag are stored separately (`<ciphertext>:<authTag>`)
//! alongside a record-level IV so tampering is detected on every read.
//!
//! # Security
//! - 16-byte random IV per record write (never reused across records)
//! - Authenticated encryption: a flipped bit anywhere fails decryption
//! - The master secret and derived key stay in memory only
//! - Logging paths only ever see masked tokens via [`mask_token`]

use aes_gcm::{
    aead::{consts::U16, Aead, AeadCore, KeyInit, OsRng},
    aes::Aes256,
    AesGcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};

/// AES-256-GCM with a 128-bit nonce, matching the persisted record format.
type Cipher = AesGcm<Aes256, U16>;

/// Size of the derived encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the initialization vector in bytes (128 bits)
const IV_SIZE: usize = 16;

/// Size of the GCM authentication tag in bytes
const TAG_SIZE: usize = 16;

/// PBKDF2 iteration count for key derivation
const KDF_ITERATIONS: u32 = 100_000;

/// Fixed KDF salt. Key separation comes from the master secret; the salt only
/// namespaces this crate's derivation.
const KDF_SALT: &[u8] = b"ledgersync.oauth.tokens.v1";

/// Fixed mask inserted between the visible head and tail of a logged token.
const TOKEN_MASK: &str = "****";

/// Sealed ciphertext plus the IV and auth tag needed to open it.
///
/// All three fields are base64-encoded for storage.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub ciphertext: String,
    pub iv: String,
    pub tag: String,
}

/// Token encryption engine.
///
/// Construct once at startup; key derivation (PBKDF2, 100k iterations) runs
/// a single time and the derived key lives for the process lifetime.
pub struct TokenCrypto {
    cipher: Cipher,
}

impl TokenCrypto {
    /// Derive the encryption key from `master_secret` and build the cipher.
    pub fn new(master_secret: &str) -> Result<Self> {
        if master_secret.is_empty() {
            return Err(Error::Encryption("master secret is empty".to_string()));
        }

        let mut key = [0u8; KEY_SIZE];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            master_secret.as_bytes(),
            KDF_SALT,
            KDF_ITERATIONS,
            &mut key,
        );

        let cipher = Cipher::new_from_slice(&key)
            .map_err(|e| Error::Encryption(format!("failed to create cipher: {e}")))?;

        Ok(Self { cipher })
    }

    /// Encrypt `plaintext` under a fresh random 16-byte IV.
    pub fn encrypt(&self, plaintext: &str) -> Result<Envelope> {
        let iv = Cipher::generate_nonce(&mut OsRng);
        self.seal(plaintext, &iv)
    }

    /// Encrypt `plaintext` under a caller-supplied IV.
    ///
    /// Used by the token store so both ciphertexts of one record share the
    /// record's single IV column. The IV must be freshly generated for every
    /// record write; callers never reuse an IV already persisted.
    pub(crate) fn encrypt_with_iv(&self, plaintext: &str, iv_b64: &str) -> Result<Envelope> {
        let iv_bytes = BASE64
            .decode(iv_b64)
            .map_err(|e| Error::Encryption(format!("invalid IV encoding: {e}")))?;
        if iv_bytes.len() != IV_SIZE {
            return Err(Error::Encryption(format!(
                "IV must be {} bytes, got {}",
                IV_SIZE,
                iv_bytes.len()
            )));
        }
        self.seal(plaintext, Nonce::<U16>::from_slice(&iv_bytes))
    }

    /// Generate a fresh random IV, base64-encoded.
    pub(crate) fn generate_iv(&self) -> String {
        let iv = Cipher::generate_nonce(&mut OsRng);
        BASE64.encode(iv)
    }

    fn seal(&self, plaintext: &str, iv: &Nonce<U16>) -> Result<Envelope> {
        let mut sealed = self
            .cipher
            .encrypt(iv, plaintext.as_bytes())
            .map_err(|_| Error::Encryption("cipher rejected plaintext".to_string()))?;

        // AES-GCM appends the auth tag; split it off so ciphertext and tag
        // are stored as separate fields.
        let tag = sealed.split_off(sealed.len() - TAG_SIZE);

        Ok(Envelope {
            ciphertext: BASE64.encode(&sealed),
            iv: BASE64.encode(iv),
            tag: BASE64.encode(&tag),
        })
    }

    /// Decrypt an envelope back to plaintext.
    ///
    /// Fails with [`Error::Decryption`] if the auth tag does not verify
    /// (tampering, corruption, or wrong key). The error never carries
    /// ciphertext or key material.
    pub fn decrypt(&self, ciphertext: &str, iv: &str, tag: &str) -> Result<String> {
        let mut sealed = BASE64.decode(ciphertext).map_err(|_| Error::Decryption)?;
        let iv_bytes = BASE64.decode(iv).map_err(|_| Error::Decryption)?;
        let tag_bytes = BASE64.decode(tag).map_err(|_| Error::Decryption)?;

        if iv_bytes.len() != IV_SIZE || tag_bytes.len() != TAG_SIZE {
            return Err(Error::Decryption);
        }

        sealed.extend_from_slice(&tag_bytes);

        let plaintext = self
            .cipher
            .decrypt(Nonce::<U16>::from_slice(&iv_bytes), sealed.as_ref())
            .map_err(|_| Error::Decryption)?;

        String::from_utf8(plaintext).map_err(|_| Error::Decryption)
    }
}

/// Mask a token for logging: first/last `visible` characters around a fixed
/// mask. Short tokens come back fully masked so no substring survives.
///
/// Only ever used for log output, never for storage or comparison.
pub fn mask_token(token: &str, visible: usize) -> String {
    let chars: Vec<char> = token.chars().collect();
    if visible == 0 || chars.len() <= visible * 2 {
        return TOKEN_MASK.to_string();
    }
    let head: String = chars[..visible].iter().collect();
    let tail: String = chars[chars.len() - visible..].iter().collect();
    format!("{head}{TOKEN_MASK}{tail}")
}

/// Constant-time byte comparison.
///
/// Length mismatch returns false; `ct_eq` on slices already folds the length
/// check in without a data-dependent early exit.
pub fn secure_compare(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crypto() -> TokenCrypto {
        TokenCrypto::new("test-master-secret").expect("failed to build crypto")
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let c = crypto();
        let plaintext = "eyJhbGciOiJSUzI1NiJ9.access-token-12345";

        let env = c.encrypt(plaintext).unwrap();
        assert_ne!(env.ciphertext, plaintext);

        let decrypted = c.decrypt(&env.ciphertext, &env.iv, &env.tag).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_unique_ivs_per_call() {
        let c = crypto();
        let env1 = c.encrypt("same-plaintext").unwrap();
        let env2 = c.encrypt("same-plaintext").unwrap();

        assert_ne!(env1.iv, env2.iv);
        assert_ne!(env1.ciphertext, env2.ciphertext);
    }

    #[test]
    fn test_shared_iv_roundtrip() {
        let c = crypto();
        let iv = c.generate_iv();

        let access = c.encrypt_with_iv("access-token-aaa", &iv).unwrap();
        let refresh = c.encrypt_with_iv("refresh-token-bbb", &iv).unwrap();

        assert_eq!(access.iv, iv);
        assert_eq!(refresh.iv, iv);
        assert_eq!(
            c.decrypt(&access.ciphertext, &iv, &access.tag).unwrap(),
            "access-token-aaa"
        );
        assert_eq!(
            c.decrypt(&refresh.ciphertext, &iv, &refresh.tag).unwrap(),
            "refresh-token-bbb"
        );
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let c = crypto();
        let env = c.encrypt("secret-token").unwrap();

        let mut bytes = BASE64.decode(&env.ciphertext).unwrap();
        bytes[0] ^= 0x01;
        let tampered = BASE64.encode(&bytes);

        let err = c.decrypt(&tampered, &env.iv, &env.tag).unwrap_err();
        assert!(matches!(err, Error::Decryption));
    }

    #[test]
    fn test_tampered_tag_fails() {
        let c = crypto();
        let env = c.encrypt("secret-token").unwrap();

        let mut bytes = BASE64.decode(&env.tag).unwrap();
        bytes[TAG_SIZE - 1] ^= 0x80;
        let tampered = BASE64.encode(&bytes);

        let err = c.decrypt(&env.ciphertext, &env.iv, &tampered).unwrap_err();
        assert!(matches!(err, Error::Decryption));
    }

    #[test]
    fn test_wrong_key_fails() {
        let c1 = TokenCrypto::new("secret-one").unwrap();
        let c2 = TokenCrypto::new("secret-two").unwrap();

        let env = c1.encrypt("secret").unwrap();
        assert!(c2.decrypt(&env.ciphertext, &env.iv, &env.tag).is_err());
    }

    #[test]
    fn test_empty_master_secret_rejected() {
        assert!(TokenCrypto::new("").is_err());
    }

    #[test]
    fn test_mask_token() {
        let masked = mask_token("abcdefghij1234567890", 4);
        assert_eq!(masked, "abcd****7890");
        assert!(!masked.contains("efghij123456"));
    }

    #[test]
    fn test_mask_short_token_fully_hidden() {
        assert_eq!(mask_token("abcdefgh", 4), "****");
        assert_eq!(mask_token("", 4), "****");
    }

    #[test]
    fn test_secure_compare() {
        assert!(secure_compare("token-abc", "token-abc"));
        assert!(!secure_compare("token-abc", "token-abd"));
        assert!(!secure_compare("token-abc", "token-abc-longer"));
        assert!(secure_compare("", ""));
    }
}
