//! An in-memory token standing in for a PKCS#11 library in unit tests.
//!
//! The "RSA" operations are a keyed byte permutation: enough to check that
//! the right key of the right class is used, not a cipher.
#![allow(clippy::unwrap_used)]

use std::{collections::HashSet, sync::Mutex};

use pkcs11_sys::{
    CK_MECHANISM_TYPE, CK_OBJECT_CLASS, CK_OBJECT_HANDLE, CK_RV, CK_SESSION_HANDLE, CK_SLOT_ID,
    CKM_RSA_PKCS, CKO_PRIVATE_KEY, CKO_PUBLIC_KEY, CKR_KEY_HANDLE_INVALID, CKR_KEY_TYPE_INCONSISTENT,
    CKR_MECHANISM_INVALID, CKR_PIN_INCORRECT, CKR_SESSION_HANDLE_INVALID, CKR_SLOT_ID_INVALID,
    CKR_USER_ALREADY_LOGGED_IN, CKR_USER_NOT_LOGGED_IN,
};
use zeroize::Zeroizing;

use crate::{
    HError, HResult,
    backend::{ObjectTemplate, Pkcs11Backend},
    locator::key_id_bytes,
};

/// 96 bytes of recognizable key material
pub(crate) fn key_material(seed: u8) -> Vec<u8> {
    (0..96_u8)
        .map(|i| i.wrapping_mul(7).wrapping_add(seed))
        .collect()
}

struct MockKey {
    handle: CK_OBJECT_HANDLE,
    class: CK_OBJECT_CLASS,
    id: Vec<u8>,
    label: String,
    secret: u8,
}

#[derive(Default)]
struct MockState {
    calls: Vec<String>,
    sessions: HashSet<CK_SESSION_HANDLE>,
    next_session: CK_SESSION_HANDLE,
    logged_in: bool,
    mechanisms: Vec<CK_MECHANISM_TYPE>,
}

#[derive(Default)]
pub(crate) struct MockBackend {
    slots: Vec<(CK_SLOT_ID, String)>,
    pin: Option<String>,
    keys: Vec<MockKey>,
    login_error: Option<CK_RV>,
    state: Mutex<MockState>,
}

impl MockBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_slot(mut self, slot_id: CK_SLOT_ID, description: &str) -> Self {
        self.slots.push((slot_id, description.to_owned()));
        self
    }

    pub(crate) fn with_pin(mut self, pin: &str) -> Self {
        self.pin = Some(pin.to_owned());
        self
    }

    fn with_key(mut self, class: CK_OBJECT_CLASS, id: u64, label: &str) -> Self {
        let handle = 100 + CK_OBJECT_HANDLE::try_from(self.keys.len()).unwrap();
        self.keys.push(MockKey {
            handle,
            class,
            id: key_id_bytes(id),
            label: label.to_owned(),
            secret: (id as u8).wrapping_mul(37) | 0x01,
        });
        self
    }

    pub(crate) fn with_key_pair(self, id: u64, label: &str) -> Self {
        self.with_key(CKO_PUBLIC_KEY, id, label)
            .with_key(CKO_PRIVATE_KEY, id, label)
    }

    pub(crate) fn with_public_key_only(self, id: u64, label: &str) -> Self {
        self.with_key(CKO_PUBLIC_KEY, id, label)
    }

    /// The token behaves as if another session already logged the user in
    pub(crate) fn with_user_already_logged_in(self) -> Self {
        self.state.lock().unwrap().logged_in = true;
        self
    }

    /// Every login attempt fails with `rv`
    pub(crate) fn with_login_error(mut self, rv: CK_RV) -> Self {
        self.login_error = Some(rv);
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub(crate) fn count_calls(&self, name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| *c == name)
            .count()
    }

    pub(crate) fn open_sessions(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    pub(crate) fn is_logged_in(&self) -> bool {
        self.state.lock().unwrap().logged_in
    }

    pub(crate) fn mechanisms(&self) -> Vec<CK_MECHANISM_TYPE> {
        self.state.lock().unwrap().mechanisms.clone()
    }

    fn record(&self, call: &str) -> std::sync::MutexGuard<'_, MockState> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call.to_owned());
        state
    }

    fn check_session(state: &MockState, call: &str, session: CK_SESSION_HANDLE) -> HResult<()> {
        if state.sessions.contains(&session) {
            Ok(())
        } else {
            Err(HError::pkcs11(call, CKR_SESSION_HANDLE_INVALID))
        }
    }

    fn key(
        &self,
        call: &str,
        handle: CK_OBJECT_HANDLE,
        class: CK_OBJECT_CLASS,
        mechanism: CK_MECHANISM_TYPE,
    ) -> HResult<u8> {
        let mut state = self.record(call);
        if !state.logged_in {
            return Err(HError::pkcs11(call, CKR_USER_NOT_LOGGED_IN));
        }
        state.mechanisms.push(mechanism);
        if mechanism != CKM_RSA_PKCS {
            return Err(HError::pkcs11(call, CKR_MECHANISM_INVALID));
        }
        let key = self
            .keys
            .iter()
            .find(|k| k.handle == handle)
            .ok_or_else(|| HError::pkcs11(call, CKR_KEY_HANDLE_INVALID))?;
        if key.class != class {
            return Err(HError::pkcs11(call, CKR_KEY_TYPE_INCONSISTENT));
        }
        Ok(key.secret)
    }
}

impl Pkcs11Backend for MockBackend {
    fn slot_list(&self) -> HResult<Vec<CK_SLOT_ID>> {
        drop(self.record("C_GetSlotList"));
        Ok(self.slots.iter().map(|(id, _)| *id).collect())
    }

    fn slot_description(&self, slot_id: CK_SLOT_ID) -> HResult<String> {
        drop(self.record("C_GetSlotInfo"));
        self.slots
            .iter()
            .find(|(id, _)| *id == slot_id)
            .map(|(_, description)| description.clone())
            .ok_or_else(|| HError::pkcs11("C_GetSlotInfo", CKR_SLOT_ID_INVALID))
    }

    fn open_session(&self, slot_id: CK_SLOT_ID) -> HResult<CK_SESSION_HANDLE> {
        let mut state = self.record("C_OpenSession");
        if !self.slots.iter().any(|(id, _)| *id == slot_id) {
            return Err(HError::pkcs11("C_OpenSession", CKR_SLOT_ID_INVALID));
        }
        state.next_session += 1;
        let handle = state.next_session;
        state.sessions.insert(handle);
        Ok(handle)
    }

    fn close_session(&self, session: CK_SESSION_HANDLE) -> HResult<()> {
        let mut state = self.record("C_CloseSession");
        Self::check_session(&state, "C_CloseSession", session)?;
        state.sessions.remove(&session);
        if state.sessions.is_empty() {
            state.logged_in = false;
        }
        Ok(())
    }

    fn login(&self, session: CK_SESSION_HANDLE, pin: &[u8]) -> HResult<()> {
        let mut state = self.record("C_Login");
        Self::check_session(&state, "C_Login", session)?;
        if let Some(rv) = self.login_error {
            return Err(HError::pkcs11("C_Login", rv));
        }
        if state.logged_in {
            return Err(HError::pkcs11("C_Login", CKR_USER_ALREADY_LOGGED_IN));
        }
        if self.pin.as_deref().map(str::as_bytes) != Some(pin) {
            return Err(HError::pkcs11("C_Login", CKR_PIN_INCORRECT));
        }
        state.logged_in = true;
        Ok(())
    }

    fn logout(&self, session: CK_SESSION_HANDLE) -> HResult<()> {
        let mut state = self.record("C_Logout");
        Self::check_session(&state, "C_Logout", session)?;
        if !state.logged_in {
            return Err(HError::pkcs11("C_Logout", CKR_USER_NOT_LOGGED_IN));
        }
        state.logged_in = false;
        Ok(())
    }

    fn find_objects(
        &self,
        session: CK_SESSION_HANDLE,
        template: &ObjectTemplate,
    ) -> HResult<Vec<CK_OBJECT_HANDLE>> {
        let state = self.record("C_FindObjects");
        Self::check_session(&state, "C_FindObjects", session)?;
        Ok(self
            .keys
            .iter()
            // private objects are only visible to a logged in user
            .filter(|k| k.class != CKO_PRIVATE_KEY || state.logged_in)
            .filter(|k| k.class == template.class)
            .filter(|k| template.id.as_ref().is_none_or(|id| *id == k.id))
            .filter(|k| template.label.as_ref().is_none_or(|l| *l == k.label))
            .map(|k| k.handle)
            .collect())
    }

    fn object_label_and_id(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
    ) -> HResult<(Option<String>, Option<Vec<u8>>)> {
        let state = self.record("C_GetAttributeValue");
        Self::check_session(&state, "C_GetAttributeValue", session)?;
        let key = self
            .keys
            .iter()
            .find(|k| k.handle == object)
            .ok_or_else(|| HError::pkcs11("C_GetAttributeValue", CKR_KEY_HANDLE_INVALID))?;
        Ok((Some(key.label.clone()), Some(key.id.clone())))
    }

    fn encrypt(
        &self,
        _session: CK_SESSION_HANDLE,
        key: CK_OBJECT_HANDLE,
        mechanism: CK_MECHANISM_TYPE,
        plaintext: &[u8],
    ) -> HResult<Vec<u8>> {
        let secret = self.key("C_Encrypt", key, CKO_PUBLIC_KEY, mechanism)?;
        Ok(plaintext.iter().rev().map(|b| b ^ secret).collect())
    }

    fn decrypt(
        &self,
        _session: CK_SESSION_HANDLE,
        key: CK_OBJECT_HANDLE,
        mechanism: CK_MECHANISM_TYPE,
        ciphertext: &[u8],
    ) -> HResult<Zeroizing<Vec<u8>>> {
        let secret = self.key("C_Decrypt", key, CKO_PRIVATE_KEY, mechanism)?;
        Ok(Zeroizing::new(
            ciphertext.iter().rev().map(|b| b ^ secret).collect(),
        ))
    }
}
