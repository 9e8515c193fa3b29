use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use serde::Deserialize;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::{HError, HResult};

/// The HSM user password.
///
/// Clones share the same cell: invalidating one clone invalidates all of them,
/// so a configuration holding a password the device rejected cannot hand it
/// out again.
#[derive(Clone, Default, Deserialize)]
#[serde(from = "String")]
pub struct Credential(Arc<Mutex<Option<Zeroizing<String>>>>);

impl Credential {
    #[must_use]
    pub fn new(password: Option<String>) -> Self {
        Self(Arc::new(Mutex::new(password.map(Zeroizing::new))))
    }

    fn cell(&self) -> MutexGuard<'_, Option<Zeroizing<String>>> {
        // a poisoned cell still holds a consistent Option
        self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// A copy of the password, if one is available
    #[must_use]
    pub fn secret(&self) -> Option<Zeroizing<String>> {
        self.cell().clone()
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.cell().is_some()
    }

    pub fn set(&self, password: String) {
        *self.cell() = Some(Zeroizing::new(password));
    }

    /// Forget the password.
    ///
    /// Called when the device reports an incorrect PIN: retrying with the same
    /// value would only count down the token's PIN lockout counter.
    pub fn invalidate(&self) {
        warn!("Forgetting the HSM password");
        *self.cell() = None;
    }

    /// Make sure a password is available, prompting the operator on the
    /// terminal (without echo) when `interactive` is set.
    ///
    /// # Errors
    ///
    /// `HError::Authentication` when no password is configured and prompting
    /// is disabled. A failing prompt is reported as `HError::Io`.
    pub fn obtain(&self, interactive: bool) -> HResult<Zeroizing<String>> {
        if let Some(secret) = self.secret() {
            return Ok(secret);
        }
        if !interactive {
            return Err(HError::Authentication(
                "no HSM password is configured and prompting is disabled".to_owned(),
            ));
        }
        debug!("No password specified, prompting for it");
        let password = rpassword::prompt_password("HSM password: ")?;
        self.set(password);
        self.secret().ok_or_else(|| {
            HError::Authentication("the HSM password was reset while prompting".to_owned())
        })
    }
}

impl From<String> for Credential {
    fn from(password: String) -> Self {
        Self::new(Some(password))
    }
}

impl From<&str> for Credential {
    fn from(password: &str) -> Self {
        Self::new(Some(password.to_owned()))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_available() {
            "[redacted]"
        } else {
            "[none]"
        };
        f.debug_tuple("Credential").field(&state).finish()
    }
}
