//! Passphrase-derived wrapping of stored key material.

use openssl::{
    hash::MessageDigest,
    pkcs5::pbkdf2_hmac,
    pkey::{PKey, Private},
    symm::{decrypt_aead, encrypt_aead, Cipher},
};
use rand::{rngs::OsRng, TryRngCore};
use zeroize::Zeroizing;

use crate::error::{TokenError, TokenResult};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const ITERATIONS: usize = 10_000;
// Fixed so the wrapping key is deterministic for a given password: the same
// password must open the same slot directory across restarts.
const SALT: &[u8; 16] = b"p11-emu-key-salt";

/// Wraps and unwraps stored key material with a key derived from the slot
/// password (PBKDF2-HMAC-SHA256, then AES-256-GCM per value).
pub struct KeyCryptor {
    key: Zeroizing<Vec<u8>>,
}

impl KeyCryptor {
    pub fn new(password: &[u8]) -> TokenResult<Self> {
        let mut key = Zeroizing::new(vec![0_u8; KEY_LEN]);
        pbkdf2_hmac(password, SALT, ITERATIONS, MessageDigest::sha256(), &mut key)
            .map_err(|e| TokenError::Default(format!("could not derive wrapping key: {e}")))?;
        Ok(Self { key })
    }

    /// Encrypts `plaintext`; the result is `nonce || tag || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> TokenResult<Vec<u8>> {
        let mut nonce = [0_u8; NONCE_LEN];
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|e| TokenError::Default(format!("error generating nonce: {e}")))?;
        let mut tag = [0_u8; TAG_LEN];
        let ciphertext = encrypt_aead(
            Cipher::aes_256_gcm(),
            &self.key,
            Some(&nonce),
            &[],
            plaintext,
            &mut tag,
        )
        .map_err(|e| TokenError::Default(format!("could not encrypt key material: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_LEN + TAG_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&tag);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypts a value produced by [`encrypt`](Self::encrypt); fails on any
    /// tampering or a wrong password.
    pub fn decrypt(&self, data: &[u8]) -> TokenResult<Zeroizing<Vec<u8>>> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(TokenError::Default(
                "encrypted value is too short".to_string(),
            ));
        }
        let (nonce, rest) = data.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);
        decrypt_aead(
            Cipher::aes_256_gcm(),
            &self.key,
            Some(nonce),
            &[],
            ciphertext,
            tag,
        )
        .map(Zeroizing::new)
        .map_err(|e| TokenError::Default(format!("could not decrypt key material: {e}")))
    }

    /// Encrypts a private key in its PKCS#8 DER form.
    pub fn encrypt_private_key(&self, key: &PKey<Private>) -> TokenResult<Vec<u8>> {
        let der = Zeroizing::new(key.private_key_to_pkcs8().map_err(|e| {
            TokenError::Default(format!("could not serialize private key: {e}"))
        })?);
        self.encrypt(&der)
    }

    pub fn decrypt_private_key(&self, data: &[u8]) -> TokenResult<PKey<Private>> {
        let der = self.decrypt(data)?;
        PKey::private_key_from_pkcs8(&der)
            .map_err(|e| TokenError::Default(format!("could not parse private key: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let cryptor = KeyCryptor::new(b"test-1234").unwrap();
        let encrypted = cryptor.encrypt(b"sensitive bytes").unwrap();
        assert_eq!(
            cryptor.decrypt(&encrypted).unwrap().as_slice(),
            b"sensitive bytes"
        );
    }

    #[test]
    fn wrong_password_fails() {
        let cryptor = KeyCryptor::new(b"test-1234").unwrap();
        let other = KeyCryptor::new(b"test-5678").unwrap();
        let encrypted = cryptor.encrypt(b"sensitive bytes").unwrap();
        assert!(other.decrypt(&encrypted).is_err());
    }

    #[test]
    fn tampering_is_detected() {
        let cryptor = KeyCryptor::new(b"test-1234").unwrap();
        let mut encrypted = cryptor.encrypt(b"sensitive bytes").unwrap();
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0x01;
        assert!(cryptor.decrypt(&encrypted).is_err());
    }

    #[test]
    fn private_key_round_trip() {
        let rsa = openssl::rsa::Rsa::generate(2048).unwrap();
        let key = PKey::from_rsa(rsa).unwrap();
        let cryptor = KeyCryptor::new(b"test-1234").unwrap();
        let encrypted = cryptor.encrypt_private_key(&key).unwrap();
        let decrypted = cryptor.decrypt_private_key(&encrypted).unwrap();
        assert!(decrypted.public_eq(&key));
    }
}
