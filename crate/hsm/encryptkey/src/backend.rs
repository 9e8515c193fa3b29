use pkcs11_sys::{
    CK_MECHANISM_TYPE, CK_OBJECT_CLASS, CK_OBJECT_HANDLE, CK_SESSION_HANDLE, CK_SLOT_ID,
};
use zeroize::Zeroizing;

use crate::HResult;

/// Attributes an object must carry to be returned by
/// [`Pkcs11Backend::find_objects`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectTemplate {
    pub class: CK_OBJECT_CLASS,
    pub id: Option<Vec<u8>>,
    pub label: Option<String>,
}

/// The subset of the PKCS#11 API this module drives.
///
/// [`crate::HsmLib`] implements it on top of a dynamically loaded library.
/// Every method maps to one Cryptoki call (or one call sequence for object
/// search and single-part encryption) and reports a non-`CKR_OK` return value
/// as [`crate::HError::Pkcs11`] carrying that value unchanged.
pub trait Pkcs11Backend: Send + Sync {
    /// `C_GetSlotList`, in the order the library enumerates them
    fn slot_list(&self) -> HResult<Vec<CK_SLOT_ID>>;

    /// `C_GetSlotInfo().slotDescription`, trailing blanks removed
    fn slot_description(&self, slot_id: CK_SLOT_ID) -> HResult<String>;

    /// `C_OpenSession` (serial, read-only)
    fn open_session(&self, slot_id: CK_SLOT_ID) -> HResult<CK_SESSION_HANDLE>;

    fn close_session(&self, session: CK_SESSION_HANDLE) -> HResult<()>;

    /// `C_Login` as `CKU_USER`
    fn login(&self, session: CK_SESSION_HANDLE, pin: &[u8]) -> HResult<()>;

    fn logout(&self, session: CK_SESSION_HANDLE) -> HResult<()>;

    fn find_objects(
        &self,
        session: CK_SESSION_HANDLE,
        template: &ObjectTemplate,
    ) -> HResult<Vec<CK_OBJECT_HANDLE>>;

    /// `CKA_LABEL` and `CKA_ID` of an object, `None` when not readable
    fn object_label_and_id(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
    ) -> HResult<(Option<String>, Option<Vec<u8>>)>;

    fn encrypt(
        &self,
        session: CK_SESSION_HANDLE,
        key: CK_OBJECT_HANDLE,
        mechanism: CK_MECHANISM_TYPE,
        plaintext: &[u8],
    ) -> HResult<Vec<u8>>;

    fn decrypt(
        &self,
        session: CK_SESSION_HANDLE,
        key: CK_OBJECT_HANDLE,
        mechanism: CK_MECHANISM_TYPE,
        ciphertext: &[u8],
    ) -> HResult<Zeroizing<Vec<u8>>>;
}
