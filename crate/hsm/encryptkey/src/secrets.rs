use std::fmt;

use tracing::info;
use zeroize::Zeroizing;

use crate::{HError, HResult};

/// Length of one secret
pub const SECRET_LENGTH: usize = 32;
/// Number of secrets carried by a key file
pub const SECRET_SLOTS: usize = 3;
/// Minimum length of decrypted key material
pub const KEY_MATERIAL_LENGTH: usize = SECRET_LENGTH * SECRET_SLOTS;

/// The secrets decrypted from the key file, indexed by slot id.
///
/// Filled once and read-only afterwards.
#[derive(Default)]
pub struct SecretStore {
    secrets: Vec<Zeroizing<[u8; SECRET_LENGTH]>>,
}

impl SecretStore {
    /// Split decrypted key material into the secret slots: slot `k` holds
    /// bytes `k * 32 .. (k + 1) * 32`. Bytes past the last slot are ignored.
    ///
    /// # Errors
    ///
    /// Fails when `key_material` is too short to fill a single secret.
    pub fn from_decrypted(key_material: &[u8]) -> HResult<Self> {
        if key_material.len() < KEY_MATERIAL_LENGTH {
            return Err(HError::Default(format!(
                "decrypted key material too short: {} bytes, expected at least \
                 {KEY_MATERIAL_LENGTH}",
                key_material.len()
            )));
        }
        let secrets = key_material
            .chunks_exact(SECRET_LENGTH)
            .take(SECRET_SLOTS)
            .map(|chunk| {
                let mut secret = Zeroizing::new([0_u8; SECRET_LENGTH]);
                secret.copy_from_slice(chunk);
                secret
            })
            .collect();
        info!("Successfully loaded encryption keys into process.");
        Ok(Self { secrets })
    }

    /// The secret in `slot_id`, `None` if the store holds no such slot
    #[must_use]
    pub fn get(&self, slot_id: usize) -> Option<&[u8]> {
        self.secrets.get(slot_id).map(|secret| secret.as_slice())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

impl fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretStore")
            .field("slots", &self.secrets.len())
            .finish_non_exhaustive()
    }
}
