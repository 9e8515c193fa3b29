//! The encryption key security module.
//!
//! At startup the module connects to a PKCS#11 token, logs in and decrypts
//! the encrypted key file with the token's RSA private key. The three
//! secrets it contains are then served from process memory; the token is not
//! used again.

use std::{
    fs,
    path::Path,
    sync::Arc,
    time::Duration,
};

use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::{
    HError, HResult, HsmLib,
    backend::Pkcs11Backend,
    codec::{decrypt_blob, encrypt_blob},
    config::{HsmModuleConfig, ValidatedConfig},
    locator::{self, KeyClass, KeyObjectInfo},
    lock::HsmLock,
    secrets::SecretStore,
    security_module::SecurityModule,
    session::Session,
    slots::resolve_slot,
};

#[derive(Debug, Clone)]
pub struct InstantiateOptions {
    /// Keep the session open after startup, for the diagnostic operations
    pub keep_session: bool,
    /// Prompt on the terminal when no password is configured
    pub interactive: bool,
    /// Length of one lock wait tick
    pub lock_poll_interval: Duration,
}

impl Default for InstantiateOptions {
    fn default() -> Self {
        Self {
            keep_session: false,
            interactive: true,
            lock_poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Unconfigured,
    Locking,
    Connecting,
    Authenticating,
    Decrypting,
    Ready,
    Failed,
}

pub struct EncryptKeyHsm {
    config: ValidatedConfig,
    state: ModuleState,
    secrets: SecretStore,
    session: Option<Session>,
}

impl EncryptKeyHsm {
    /// Load the configured PKCS#11 library and set the module up
    ///
    /// # Errors
    ///
    /// See [`EncryptKeyHsm::instantiate_with`]; loading the library may also fail.
    pub fn instantiate(config: &HsmModuleConfig, options: &InstantiateOptions) -> HResult<Self> {
        Self::instantiate_with(config, options, |path| {
            let hsm_lib: Arc<dyn Pkcs11Backend> = Arc::new(HsmLib::instantiate(path)?);
            Ok(hsm_lib)
        })
    }

    /// Set the module up with the PKCS#11 backend returned by `load`.
    ///
    /// `load` is called with the configured module path once the lock is
    /// held. Construction either returns a `Ready` module or an error: the
    /// lock is released and the session closed on every path.
    ///
    /// # Errors
    ///
    /// Returns the first error among acquiring the lock, validating the
    /// configuration, resolving the slot, logging in, locating the key and
    /// decrypting the key file.
    pub fn instantiate_with<F>(
        config: &HsmModuleConfig,
        options: &InstantiateOptions,
        load: F,
    ) -> HResult<Self>
    where
        F: FnOnce(&Path) -> HResult<Arc<dyn Pkcs11Backend>>,
    {
        let config = config.validate()?;
        let mut hsm = Self {
            config,
            state: ModuleState::Unconfigured,
            secrets: SecretStore::default(),
            session: None,
        };
        match hsm.set_up(options, load) {
            Ok(()) => Ok(hsm),
            Err(e) => {
                hsm.set_state(ModuleState::Failed);
                error!("Unable to set up the HSM security module: {e}");
                Err(e)
            }
        }
    }

    fn set_up<F>(&mut self, options: &InstantiateOptions, load: F) -> HResult<()>
    where
        F: FnOnce(&Path) -> HResult<Arc<dyn Pkcs11Backend>>,
    {
        self.config.password.obtain(options.interactive)?;

        self.set_state(ModuleState::Locking);
        let guard = HsmLock::from_config(&self.config.lock)
            .with_poll_interval(options.lock_poll_interval)
            .acquire()?;

        self.set_state(ModuleState::Connecting);
        let backend = load(&self.config.module)?;
        let slot_id = resolve_slot(backend.as_ref(), &self.config.slot)?;
        info!("Setting up the HSM on slot {slot_id}");
        let mut session = Session::open(backend, slot_id)?;

        self.set_state(ModuleState::Authenticating);
        session.login(&self.config.password)?;

        if let Some(encfile) = self.config.encfile.clone() {
            self.set_state(ModuleState::Decrypting);
            let blob = fs::read(&encfile).map_err(|e| {
                HError::Default(format!(
                    "unable to read the encrypted key file {}: {e}",
                    encfile.display()
                ))
            })?;
            let key_material = decrypt_blob(&session, &self.config.key, &blob)?;
            self.secrets = SecretStore::from_decrypted(&key_material)?;
        }

        if options.keep_session {
            self.session = Some(session);
        } else {
            session.close()?;
        }
        guard.release()?;
        self.set_state(ModuleState::Ready);
        Ok(())
    }

    fn set_state(&mut self, state: ModuleState) {
        debug!("HSM module state: {:?} -> {state:?}", self.state);
        self.state = state;
    }

    #[must_use]
    pub const fn state(&self) -> ModuleState {
        self.state
    }

    #[must_use]
    pub const fn secrets(&self) -> &SecretStore {
        &self.secrets
    }

    fn session(&self) -> HResult<&Session> {
        self.session.as_ref().ok_or_else(|| {
            HError::Default(
                "no open HSM session: the module was instantiated without keep_session"
                    .to_owned(),
            )
        })
    }

    /// Encrypt the plaintext key file `infile` with the public key and
    /// write the result to `outfile`. Needs a kept session.
    ///
    /// # Errors
    ///
    /// Fails without a kept session, or when reading `infile`, encrypting it
    /// or writing `outfile` fails.
    pub fn encrypt_file(&self, infile: &Path, outfile: &Path) -> HResult<()> {
        let session = self.session()?;
        let plaintext = Zeroizing::new(fs::read(infile)?);
        let blob = encrypt_blob(session, &self.config.key, &plaintext)?;
        fs::write(outfile, &blob)?;
        info!(
            "Encrypted {} into {} ({} bytes)",
            infile.display(),
            outfile.display(),
            blob.len()
        );
        Ok(())
    }

    /// Every key of `class` on the token. Needs a kept session.
    ///
    /// # Errors
    ///
    /// Fails without a kept session or when the object search fails.
    pub fn list_keys(&self, class: KeyClass) -> HResult<Vec<KeyObjectInfo>> {
        let keys = locator::list_keys(self.session()?, class)?;
        for key in &keys {
            info!("{key}");
        }
        Ok(keys)
    }

    /// Log out and close a kept session
    ///
    /// # Errors
    ///
    /// Returns the logout or close failure of the token.
    pub fn close_session(&mut self) -> HResult<()> {
        match self.session.take() {
            Some(session) => session.close(),
            None => Ok(()),
        }
    }
}

impl SecurityModule for EncryptKeyHsm {
    fn name(&self) -> &str {
        "HSM"
    }

    fn get_secret(&self, slot_id: usize) -> Option<&[u8]> {
        if self.state == ModuleState::Ready {
            self.secrets.get(slot_id)
        } else {
            None
        }
    }

    fn is_ready(&self) -> bool {
        self.state == ModuleState::Ready
    }

    fn setup_module(&mut self) -> HResult<()> {
        warn!("setup_module is not implemented for the HSM security module");
        Err(HError::Default("not implemented".to_owned()))
    }
}
