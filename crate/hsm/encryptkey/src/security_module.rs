//! The contract every security module fulfils.
//!
//! A security module only has to provide its secrets; the symmetric
//! operations used by the rest of the application are derived from them:
//! AES-256-CBC with PKCS#7 padding, values serialized as
//! `hex(iv):hex(ciphertext)`.

use openssl::symm::{Cipher, decrypt, encrypt};
use rand::{TryRngCore, rngs::OsRng};
use zeroize::Zeroizing;

use crate::{HError, HResult, secrets::SECRET_LENGTH};

/// Secret protecting token data and PINs
pub const TOKEN_KEY: usize = 0;
/// Secret protecting passwords stored in the configuration
pub const CONFIG_KEY: usize = 1;
/// Secret protecting other values
pub const VALUE_KEY: usize = 2;

const IV_LENGTH: usize = 16;

pub trait SecurityModule {
    fn name(&self) -> &str;

    /// The secret stored in `slot_id`
    fn get_secret(&self, slot_id: usize) -> Option<&[u8]>;

    /// Whether secrets can be served
    fn is_ready(&self) -> bool;

    /// Cryptographically secure random bytes
    fn random(&self, length: usize) -> HResult<Vec<u8>> {
        let mut bytes = vec![0_u8; length];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| HError::Default(format!("Error generating random data: {e}")))?;
        Ok(bytes)
    }

    fn encrypt(&self, data: &[u8], iv: &[u8], key_id: usize) -> HResult<Vec<u8>> {
        let key = self.cipher_key(key_id)?;
        check_iv(iv)?;
        Ok(encrypt(Cipher::aes_256_cbc(), key, Some(iv), data)?)
    }

    fn decrypt(&self, ciphertext: &[u8], iv: &[u8], key_id: usize) -> HResult<Zeroizing<Vec<u8>>> {
        let key = self.cipher_key(key_id)?;
        check_iv(iv)?;
        Ok(Zeroizing::new(decrypt(
            Cipher::aes_256_cbc(),
            key,
            Some(iv),
            ciphertext,
        )?))
    }

    fn encrypt_password(&self, password: &str) -> HResult<String> {
        self.encrypt_value(password.as_bytes(), CONFIG_KEY)
    }

    fn decrypt_password(&self, crypted: &str) -> HResult<Zeroizing<String>> {
        self.decrypt_value(crypted, CONFIG_KEY)
    }

    fn encrypt_pin(&self, pin: &str) -> HResult<String> {
        self.encrypt_value(pin.as_bytes(), TOKEN_KEY)
    }

    fn decrypt_pin(&self, crypted: &str) -> HResult<Zeroizing<String>> {
        self.decrypt_value(crypted, TOKEN_KEY)
    }

    /// Encrypt under a fresh random IV, returning `hex(iv):hex(ciphertext)`
    fn encrypt_value(&self, value: &[u8], key_id: usize) -> HResult<String> {
        let iv = self.random(IV_LENGTH)?;
        let ciphertext = self.encrypt(value, &iv, key_id)?;
        Ok(format!("{}:{}", hex::encode(iv), hex::encode(ciphertext)))
    }

    fn decrypt_value(&self, crypted: &str, key_id: usize) -> HResult<Zeroizing<String>> {
        let (iv, ciphertext) = crypted.split_once(':').ok_or_else(|| {
            HError::Default("encrypted value is not of the form iv:ciphertext".to_owned())
        })?;
        let plaintext = self.decrypt(&hex::decode(ciphertext)?, &hex::decode(iv)?, key_id)?;
        let text = std::str::from_utf8(&plaintext)
            .map_err(|e| HError::Default(format!("decrypted value is not UTF-8: {e}")))?;
        Ok(Zeroizing::new(text.to_owned()))
    }

    /// Interactive provisioning of the module; modules that load their
    /// secrets by other means do not support it.
    fn setup_module(&mut self) -> HResult<()> {
        Err(HError::Default(format!(
            "setup is not implemented for the {} security module",
            self.name()
        )))
    }

    #[doc(hidden)]
    fn cipher_key(&self, key_id: usize) -> HResult<&[u8]> {
        if !self.is_ready() {
            return Err(HError::Default(format!(
                "the {} security module is not ready",
                self.name()
            )));
        }
        let key = self
            .get_secret(key_id)
            .ok_or_else(|| HError::Default(format!("no secret is loaded in slot {key_id}")))?;
        if key.len() != SECRET_LENGTH {
            return Err(HError::Default(format!(
                "secret {key_id} has {} bytes, expected {SECRET_LENGTH}",
                key.len()
            )));
        }
        Ok(key)
    }
}

fn check_iv(iv: &[u8]) -> HResult<()> {
    if iv.len() == IV_LENGTH {
        Ok(())
    } else {
        Err(HError::Default(format!(
            "invalid IV length: {} bytes, expected {IV_LENGTH}",
            iv.len()
        )))
    }
}
