use std::sync::Arc;

use pkcs11_sys::{CK_SESSION_HANDLE, CK_SLOT_ID, CKR_PIN_INCORRECT};
use tracing::{debug, error, info, warn};

use crate::{Credential, HError, HResult, backend::Pkcs11Backend};

/// A session opened on one slot.
///
/// The session is closed exactly once: either by [`Session::close`] or, on
/// error paths, when it is dropped. A logged in session is logged out before
/// being closed.
pub struct Session {
    backend: Arc<dyn Pkcs11Backend>,
    handle: CK_SESSION_HANDLE,
    slot_id: CK_SLOT_ID,
    logged_in: bool,
    open: bool,
}

impl Session {
    /// # Errors
    ///
    /// Returns the backend error when the session cannot be opened.
    pub fn open(backend: Arc<dyn Pkcs11Backend>, slot_id: CK_SLOT_ID) -> HResult<Self> {
        let handle = backend.open_session(slot_id)?;
        debug!("Opened session {handle} on slot {slot_id}");
        Ok(Self {
            backend,
            handle,
            slot_id,
            logged_in: false,
            open: true,
        })
    }

    pub(crate) fn backend(&self) -> &dyn Pkcs11Backend {
        self.backend.as_ref()
    }

    #[must_use]
    pub const fn handle(&self) -> CK_SESSION_HANDLE {
        self.handle
    }

    #[must_use]
    pub const fn slot_id(&self) -> CK_SLOT_ID {
        self.slot_id
    }

    #[must_use]
    pub const fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    /// Log in as the normal user.
    ///
    /// A user already logged in (another session of this process won the
    /// race) is logged out and logged in again. An incorrect PIN invalidates
    /// `credential` so it cannot be tried again. Other failures are returned
    /// unchanged.
    ///
    /// # Errors
    ///
    /// `HError::Authentication` for a missing or incorrect PIN; any other
    /// login failure is returned unchanged.
    pub fn login(&mut self, credential: &Credential) -> HResult<()> {
        let password = credential.secret().ok_or_else(|| {
            HError::Authentication("no password available for the HSM login".to_owned())
        })?;
        debug!("Logging in to slot {}", self.slot_id);
        let first = self.backend.login(self.handle, password.as_bytes());
        let result = match first {
            Err(e) if e.is_retryable() => {
                info!("Timing issues. We need to log in the user again.");
                self.backend.logout(self.handle)?;
                self.backend.login(self.handle, password.as_bytes())
            }
            other => other,
        };
        check_login(result, credential)?;
        self.logged_in = true;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns the backend error when the token refuses the logout.
    pub fn logout(&mut self) -> HResult<()> {
        if self.logged_in {
            self.logged_in = false;
            self.backend.logout(self.handle)?;
            debug!("Logged out of slot {}", self.slot_id);
        }
        Ok(())
    }

    /// Log out if needed and close the session
    ///
    /// # Errors
    ///
    /// Fails when the logout or the session close fails.
    pub fn close(mut self) -> HResult<()> {
        self.close_()
    }

    fn close_(&mut self) -> HResult<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        let logout = self.logout();
        self.backend.close_session(self.handle)?;
        debug!("Closed session {}", self.handle);
        logout
    }
}

/// An incorrect PIN, on the first attempt or on the retry, invalidates the
/// credential
fn check_login(result: HResult<()>, credential: &Credential) -> HResult<()> {
    match result {
        Err(e) if e.rv() == Some(CKR_PIN_INCORRECT) => {
            error!("A wrong HSM password is configured. Please check your configuration.");
            credential.invalidate();
            Err(HError::Authentication(e.to_string()))
        }
        other => other,
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.close_() {
            warn!("Failed to close HSM session {}: {e}", self.handle);
        }
    }
}
