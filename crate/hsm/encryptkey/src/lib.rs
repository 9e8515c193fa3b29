//! Security module serving encryption keys decrypted by a PKCS#11 token.

#![allow(non_snake_case)]

pub use backend::{ObjectTemplate, Pkcs11Backend};
pub use codec::{KEY_FILE_MECHANISM, decrypt_blob, encrypt_blob};
pub use config::{
    DEFAULT_LOCK_PATH, DEFAULT_LOCK_TIMEOUT_SECS, HsmModuleConfig, KeySelector, LockConfig,
    SlotSelector, ValidatedConfig,
};
pub use credential::Credential;
pub use encryptkey_hsm::{EncryptKeyHsm, InstantiateOptions, ModuleState};
pub use error::{ErrorKind, HError, HResult};
pub use hsm_lib::HsmLib;
pub use locator::{KeyClass, KeyObject, KeyObjectInfo, find_key, key_id_bytes, list_keys};
pub use lock::{HsmLock, HsmLockGuard};
pub use secrets::{KEY_MATERIAL_LENGTH, SECRET_LENGTH, SECRET_SLOTS, SecretStore};
pub use security_module::{CONFIG_KEY, SecurityModule, TOKEN_KEY, VALUE_KEY};
pub use session::Session;
pub use slots::resolve_slot;

mod backend;
mod codec;
mod config;
mod credential;
mod encryptkey_hsm;
mod error;
mod hsm_lib;
mod locator;
mod lock;
mod secrets;
mod security_module;
mod session;
mod slots;

#[cfg(test)]
mod test_helpers;
