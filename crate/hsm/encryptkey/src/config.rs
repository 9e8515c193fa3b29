use std::{
    env,
    path::{Path, PathBuf},
    str::FromStr,
};

use pkcs11_sys::CK_SLOT_ID;
use serde::Deserialize;
use tracing::debug;

use crate::{Credential, HError, HResult};

/// Directory whose existence serializes HSM access between processes
pub const DEFAULT_LOCK_PATH: &str = "/dev/shm/pilock";
/// Number of one-second ticks to wait for another process to release the lock
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 15;

const ENV_PREFIX: &str = "PI_HSM_MODULE_";

/// The security module configuration as it is written in a configuration
/// file or in the environment.
///
/// ```toml
/// module = "/usr/lib/libykcs11.so"
/// slotname = "Yubico YubiKey"
/// keyid = 1
/// password = "123456"
/// encfile = "/etc/privacyidea/enckey.enc"
/// ```
///
/// Nothing is checked until [`HsmModuleConfig::validate`] runs.
#[derive(Deserialize, Clone, Default, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct HsmModuleConfig {
    /// Path to the PKCS#11 shared library
    pub module: Option<PathBuf>,
    /// Numeric slot id; takes precedence over `slotname`
    pub slot: Option<CK_SLOT_ID>,
    /// Prefix of the slot description
    pub slotname: Option<String>,
    /// `CKA_ID` of the RSA key pair
    pub keyid: Option<u64>,
    /// `CKA_LABEL` of the RSA key pair
    pub keylabel: Option<String>,
    /// User PIN; prompted for when absent
    pub password: Credential,
    /// Encrypted key file decrypted at startup
    pub encfile: Option<PathBuf>,
    pub lock_path: Option<PathBuf>,
    pub lock_timeout: Option<u64>,
}

/// How the slot is chosen among the enumerated ones
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotSelector {
    Id(CK_SLOT_ID),
    Name(String),
    /// Use the only available slot
    Only,
}

/// How the RSA key pair is found inside the token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySelector {
    Id(u64),
    Label(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    pub path: PathBuf,
    pub timeout_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_LOCK_PATH),
            timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
        }
    }
}

/// A checked, immutable configuration. Produced once, before any contact
/// with the hardware.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub module: PathBuf,
    pub slot: SlotSelector,
    pub key: KeySelector,
    pub password: Credential,
    pub encfile: Option<PathBuf>,
    pub lock: LockConfig,
}

impl HsmModuleConfig {
    /// Parse a TOML configuration file
    ///
    /// # Errors
    ///
    /// `HError::Io` if the file cannot be read, `HError::Toml` if it is not
    /// valid TOML.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> HResult<Self> {
        let path = path.as_ref();
        debug!("Loading the HSM module configuration from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Read the `PI_HSM_MODULE_*` environment variables
    /// (`PI_HSM_MODULE_MODULE`, `PI_HSM_MODULE_SLOT`, `PI_HSM_MODULE_SLOTNAME`,
    /// `PI_HSM_MODULE_KEYID`, `PI_HSM_MODULE_KEYLABEL`, `PI_HSM_MODULE_PASSWORD`,
    /// `PI_HSM_MODULE_ENCFILE`, `PI_HSM_MODULE_LOCK_PATH`,
    /// `PI_HSM_MODULE_LOCK_TIMEOUT`).
    ///
    /// # Errors
    ///
    /// `HError::Configuration` naming the variable that does not parse.
    pub fn from_env() -> HResult<Self> {
        Ok(Self {
            module: env_var("MODULE").map(PathBuf::from),
            slot: env_parse("SLOT")?,
            slotname: env_var("SLOTNAME"),
            keyid: env_parse("KEYID")?,
            keylabel: env_var("KEYLABEL"),
            password: Credential::new(env_var("PASSWORD")),
            encfile: env_var("ENCFILE").map(PathBuf::from),
            lock_path: env_var("LOCK_PATH").map(PathBuf::from),
            lock_timeout: env_parse("LOCK_TIMEOUT")?,
        })
    }

    /// Check the configuration and build its typed form.
    ///
    /// The password is shared with `self`, not copied.
    ///
    /// # Errors
    ///
    /// `HError::Configuration` when no module is set, when both or none of
    /// the key selectors are given, or when the key label is empty.
    pub fn validate(&self) -> HResult<ValidatedConfig> {
        let module = self
            .module
            .clone()
            .ok_or_else(|| HError::Configuration("No PKCS11 module defined.".to_owned()))?;

        let key = match (self.keyid, &self.keylabel) {
            (Some(_), Some(_)) => {
                return Err(HError::Configuration(
                    "Both keyid and keylabel are defined. Only use one of both.".to_owned(),
                ));
            }
            (Some(id), None) => KeySelector::Id(id),
            (None, Some(label)) if !label.is_empty() => KeySelector::Label(label.clone()),
            (None, Some(_)) => {
                return Err(HError::Configuration("The keylabel is empty.".to_owned()));
            }
            (None, None) => {
                return Err(HError::Configuration(
                    "No keyid or keylabel defined.".to_owned(),
                ));
            }
        };

        let slot = match (self.slot, &self.slotname) {
            (Some(id), name) => {
                if name.is_some() {
                    debug!("Both slot and slotname are configured, using slot {id}");
                }
                SlotSelector::Id(id)
            }
            (None, Some(name)) => SlotSelector::Name(name.clone()),
            (None, None) => SlotSelector::Only,
        };

        let defaults = LockConfig::default();
        Ok(ValidatedConfig {
            module,
            slot,
            key,
            password: self.password.clone(),
            encfile: self.encfile.clone(),
            lock: LockConfig {
                path: self.lock_path.clone().unwrap_or(defaults.path),
                timeout_secs: self.lock_timeout.unwrap_or(defaults.timeout_secs),
            },
        })
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{name}")).ok()
}

fn env_parse<T: FromStr>(name: &str) -> HResult<Option<T>> {
    env_var(name)
        .map(|value| {
            value.trim().parse::<T>().map_err(|_| {
                HError::Configuration(format!(
                    "{ENV_PREFIX}{name} must be an integer, got {value:?}"
                ))
            })
        })
        .transpose()
}
