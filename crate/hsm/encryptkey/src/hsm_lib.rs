use std::ptr;

use libloading::Library;
use pkcs11_sys::*;
use tracing::{debug, trace};
use zeroize::Zeroizing;

use crate::{
    HError, HResult,
    backend::{ObjectTemplate, Pkcs11Backend},
};

/// Number of handles fetched per `C_FindObjects` call
const FIND_BATCH_SIZE: usize = 32;

/// Call a PKCS#11 function pointer of an [`HsmLib`] and turn a non-`CKR_OK`
/// return value into an [`HError::Pkcs11`]. Evaluates to `HResult<()>`.
macro_rules! hsm_call {
    ($hsm:expr, $context:expr, $function:ident $(, $arg:expr)* $(,)?) => {{
        #[allow(unsafe_code)]
        let rv = unsafe {
            $hsm.$function.ok_or_else(|| {
                HError::Default(format!(
                    "{} not available on library",
                    stringify!($function)
                ))
            })?($($arg),*)
        };
        if rv == CKR_OK {
            Ok(())
        } else {
            Err(HError::pkcs11($context, rv))
        }
    }};
}

/// A PKCS#11 library loaded at runtime.
///
/// The function pointers are resolved once when the library is loaded; the
/// library is initialized with OS locking on load and finalized on drop.
pub struct HsmLib {
    _library: Library,
    C_Initialize: CK_C_Initialize,
    C_Finalize: CK_C_Finalize,

    C_GetSlotList: CK_C_GetSlotList,
    C_GetSlotInfo: CK_C_GetSlotInfo,

    C_OpenSession: CK_C_OpenSession,
    C_CloseSession: CK_C_CloseSession,

    C_Login: CK_C_Login,
    C_Logout: CK_C_Logout,

    C_FindObjectsInit: CK_C_FindObjectsInit,
    C_FindObjects: CK_C_FindObjects,
    C_FindObjectsFinal: CK_C_FindObjectsFinal,

    C_GetAttributeValue: CK_C_GetAttributeValue,

    C_Encrypt: CK_C_Encrypt,
    C_EncryptInit: CK_C_EncryptInit,

    C_Decrypt: CK_C_Decrypt,
    C_DecryptInit: CK_C_DecryptInit,
}

impl HsmLib {
    /// Load the PKCS#11 library at `path` and initialize it
    ///
    /// # Errors
    ///
    /// Fails if the library cannot be loaded, misses a required symbol or
    /// `C_Initialize` returns an error.
    #[allow(unsafe_code)]
    pub fn instantiate<P>(path: P) -> HResult<Self>
    where
        P: AsRef<std::ffi::OsStr>,
    {
        debug!(
            "Loading the PKCS#11 library {}",
            path.as_ref().to_string_lossy()
        );
        unsafe {
            let library = Library::new(path)?;
            let hsm_lib = Self {
                C_Initialize: Some(*library.get(b"C_Initialize")?),
                C_Finalize: Some(*library.get(b"C_Finalize")?),
                C_GetSlotList: Some(*library.get(b"C_GetSlotList")?),
                C_GetSlotInfo: Some(*library.get(b"C_GetSlotInfo")?),
                C_OpenSession: Some(*library.get(b"C_OpenSession")?),
                C_CloseSession: Some(*library.get(b"C_CloseSession")?),
                C_Login: Some(*library.get(b"C_Login")?),
                C_Logout: Some(*library.get(b"C_Logout")?),
                C_FindObjectsInit: Some(*library.get(b"C_FindObjectsInit")?),
                C_FindObjects: Some(*library.get(b"C_FindObjects")?),
                C_FindObjectsFinal: Some(*library.get(b"C_FindObjectsFinal")?),
                C_GetAttributeValue: Some(*library.get(b"C_GetAttributeValue")?),
                C_Encrypt: Some(*library.get(b"C_Encrypt")?),
                C_EncryptInit: Some(*library.get(b"C_EncryptInit")?),
                C_Decrypt: Some(*library.get(b"C_Decrypt")?),
                C_DecryptInit: Some(*library.get(b"C_DecryptInit")?),
                // we need to keep the library alive
                _library: library,
            };
            hsm_lib.initialize()?;
            Ok(hsm_lib)
        }
    }

    fn initialize(&self) -> HResult<()> {
        let mut init_args = CK_C_INITIALIZE_ARGS {
            CreateMutex: None,
            DestroyMutex: None,
            LockMutex: None,
            UnlockMutex: None,
            flags: CKF_OS_LOCKING_OK,
            pReserved: ptr::null_mut(),
        };
        match hsm_call!(
            self,
            "Failed initializing the HSM",
            C_Initialize,
            (&raw mut init_args).cast()
        ) {
            Err(e) if e.rv() == Some(CKR_CRYPTOKI_ALREADY_INITIALIZED) => {
                debug!("The PKCS#11 library is already initialized in this process");
                Ok(())
            }
            other => other,
        }
    }

    fn finalize(&self) -> HResult<()> {
        hsm_call!(
            self,
            "Failed to finalize the HSM",
            C_Finalize,
            ptr::null_mut()
        )
    }

    fn attribute(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        attribute_type: CK_ATTRIBUTE_TYPE,
    ) -> HResult<Option<Vec<u8>>> {
        let mut attribute = CK_ATTRIBUTE {
            type_: attribute_type,
            pValue: ptr::null_mut(),
            ulValueLen: 0,
        };
        match hsm_call!(
            self,
            "Failed reading an attribute length",
            C_GetAttributeValue,
            session,
            object,
            &raw mut attribute,
            1
        ) {
            Ok(()) => {}
            Err(e)
                if matches!(
                    e.rv(),
                    Some(CKR_ATTRIBUTE_SENSITIVE | CKR_ATTRIBUTE_TYPE_INVALID)
                ) =>
            {
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
        // CK_UNAVAILABLE_INFORMATION
        if attribute.ulValueLen == CK_ULONG::MAX {
            return Ok(None);
        }
        let mut value = vec![0_u8; usize::try_from(attribute.ulValueLen)?];
        attribute.pValue = value.as_mut_ptr().cast();
        hsm_call!(
            self,
            "Failed reading an attribute",
            C_GetAttributeValue,
            session,
            object,
            &raw mut attribute,
            1
        )?;
        value.truncate(usize::try_from(attribute.ulValueLen)?);
        Ok(Some(value))
    }
}

impl Pkcs11Backend for HsmLib {
    fn slot_list(&self) -> HResult<Vec<CK_SLOT_ID>> {
        let mut count: CK_ULONG = 0;
        hsm_call!(
            self,
            "Failed counting the slots",
            C_GetSlotList,
            CK_BBOOL::from(false),
            ptr::null_mut(),
            &raw mut count
        )?;
        let mut slots: Vec<CK_SLOT_ID> = vec![0; usize::try_from(count)?];
        hsm_call!(
            self,
            "Failed listing the slots",
            C_GetSlotList,
            CK_BBOOL::from(false),
            slots.as_mut_ptr(),
            &raw mut count
        )?;
        slots.truncate(usize::try_from(count)?);
        Ok(slots)
    }

    fn slot_description(&self, slot_id: CK_SLOT_ID) -> HResult<String> {
        let mut info = CK_SLOT_INFO::default();
        hsm_call!(
            self,
            format!("Failed getting the info of slot {slot_id}"),
            C_GetSlotInfo,
            slot_id,
            &raw mut info
        )?;
        Ok(String::from_utf8_lossy(&info.slotDescription)
            .trim_end_matches([' ', '\0'])
            .to_owned())
    }

    fn open_session(&self, slot_id: CK_SLOT_ID) -> HResult<CK_SESSION_HANDLE> {
        let mut session_handle: CK_SESSION_HANDLE = 0;
        hsm_call!(
            self,
            format!("Failed opening a session on slot {slot_id}"),
            C_OpenSession,
            slot_id,
            CKF_SERIAL_SESSION,
            ptr::null_mut(),
            None,
            &raw mut session_handle
        )?;
        trace!("Opened session {session_handle} on slot {slot_id}");
        Ok(session_handle)
    }

    fn close_session(&self, session: CK_SESSION_HANDLE) -> HResult<()> {
        hsm_call!(self, "Failed closing a session", C_CloseSession, session)
    }

    fn login(&self, session: CK_SESSION_HANDLE, pin: &[u8]) -> HResult<()> {
        let mut pin = Zeroizing::new(pin.to_vec());
        hsm_call!(
            self,
            "Failed logging in",
            C_Login,
            session,
            CKU_USER,
            pin.as_mut_ptr(),
            CK_ULONG::try_from(pin.len())?
        )
    }

    fn logout(&self, session: CK_SESSION_HANDLE) -> HResult<()> {
        hsm_call!(self, "Failed logging out", C_Logout, session)
    }

    fn find_objects(
        &self,
        session: CK_SESSION_HANDLE,
        template: &ObjectTemplate,
    ) -> HResult<Vec<CK_OBJECT_HANDLE>> {
        let mut class: CK_OBJECT_CLASS = template.class;
        let mut id = template.id.clone();
        let mut label = template.label.clone().map(String::into_bytes);

        let mut attributes = vec![CK_ATTRIBUTE {
            type_: CKA_CLASS,
            pValue: (&raw mut class).cast(),
            ulValueLen: CK_ULONG::try_from(size_of::<CK_OBJECT_CLASS>())?,
        }];
        if let Some(id) = id.as_mut() {
            attributes.push(CK_ATTRIBUTE {
                type_: CKA_ID,
                pValue: id.as_mut_ptr().cast(),
                ulValueLen: CK_ULONG::try_from(id.len())?,
            });
        }
        if let Some(label) = label.as_mut() {
            attributes.push(CK_ATTRIBUTE {
                type_: CKA_LABEL,
                pValue: label.as_mut_ptr().cast(),
                ulValueLen: CK_ULONG::try_from(label.len())?,
            });
        }

        hsm_call!(
            self,
            "Failed to initialize object search",
            C_FindObjectsInit,
            session,
            attributes.as_mut_ptr(),
            CK_ULONG::try_from(attributes.len())?
        )?;

        let mut object_handles = Vec::new();
        let mut handles_buf: Vec<CK_OBJECT_HANDLE> = vec![0; FIND_BATCH_SIZE];
        let search = loop {
            let mut object_count: CK_ULONG = 0;
            if let Err(e) = hsm_call!(
                self,
                "Failed to find objects",
                C_FindObjects,
                session,
                handles_buf.as_mut_ptr(),
                CK_ULONG::try_from(FIND_BATCH_SIZE)?,
                &raw mut object_count
            ) {
                break Err(e);
            }
            if object_count == 0 {
                break Ok(());
            }
            let Some(found) = handles_buf.get(..usize::try_from(object_count)?) else {
                break Err(HError::Default(
                    "More objects returned than requested".to_owned(),
                ));
            };
            object_handles.extend_from_slice(found);
        };
        let finalize = hsm_call!(
            self,
            "Failed to finalize object search",
            C_FindObjectsFinal,
            session
        );
        search?;
        finalize?;
        trace!("Found {} objects", object_handles.len());
        Ok(object_handles)
    }

    fn object_label_and_id(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
    ) -> HResult<(Option<String>, Option<Vec<u8>>)> {
        let label = self
            .attribute(session, object, CKA_LABEL)?
            .map(|label| String::from_utf8_lossy(&label).into_owned());
        let id = self.attribute(session, object, CKA_ID)?;
        Ok((label, id))
    }

    fn encrypt(
        &self,
        session: CK_SESSION_HANDLE,
        key: CK_OBJECT_HANDLE,
        mechanism: CK_MECHANISM_TYPE,
        plaintext: &[u8],
    ) -> HResult<Vec<u8>> {
        let mut mechanism = CK_MECHANISM {
            mechanism,
            pParameter: ptr::null_mut(),
            ulParameterLen: 0,
        };
        let mut data = Zeroizing::new(plaintext.to_vec());
        hsm_call!(
            self,
            "Failed to initialize encryption",
            C_EncryptInit,
            session,
            &raw mut mechanism,
            key
        )?;

        let mut encrypted_data_len: CK_ULONG = 0;
        hsm_call!(
            self,
            format!(
                "Failed to allocate encrypted data length. Data to encrypt is likely too big: {} \
                 bytes",
                data.len()
            ),
            C_Encrypt,
            session,
            data.as_mut_ptr(),
            CK_ULONG::try_from(data.len())?,
            ptr::null_mut(),
            &raw mut encrypted_data_len
        )?;

        let mut encrypted_data = vec![0_u8; usize::try_from(encrypted_data_len)?];
        hsm_call!(
            self,
            "Failed to encrypt data",
            C_Encrypt,
            session,
            data.as_mut_ptr(),
            CK_ULONG::try_from(data.len())?,
            encrypted_data.as_mut_ptr(),
            &raw mut encrypted_data_len
        )?;
        encrypted_data.truncate(usize::try_from(encrypted_data_len)?);
        Ok(encrypted_data)
    }

    fn decrypt(
        &self,
        session: CK_SESSION_HANDLE,
        key: CK_OBJECT_HANDLE,
        mechanism: CK_MECHANISM_TYPE,
        ciphertext: &[u8],
    ) -> HResult<Zeroizing<Vec<u8>>> {
        let mut mechanism = CK_MECHANISM {
            mechanism,
            pParameter: ptr::null_mut(),
            ulParameterLen: 0,
        };
        let mut encrypted_data = ciphertext.to_vec();
        hsm_call!(
            self,
            "Failed to initialize decryption",
            C_DecryptInit,
            session,
            &raw mut mechanism,
            key
        )?;

        let mut decrypted_data_len: CK_ULONG = 0;
        hsm_call!(
            self,
            "Failed to get decrypted data length",
            C_Decrypt,
            session,
            encrypted_data.as_mut_ptr(),
            CK_ULONG::try_from(encrypted_data.len())?,
            ptr::null_mut(),
            &raw mut decrypted_data_len
        )?;

        let mut decrypted_data = Zeroizing::new(vec![0_u8; usize::try_from(decrypted_data_len)?]);
        hsm_call!(
            self,
            "Failed to decrypt data",
            C_Decrypt,
            session,
            encrypted_data.as_mut_ptr(),
            CK_ULONG::try_from(encrypted_data.len())?,
            decrypted_data.as_mut_ptr(),
            &raw mut decrypted_data_len
        )?;
        decrypted_data.truncate(usize::try_from(decrypted_data_len)?);
        Ok(decrypted_data)
    }
}

impl Drop for HsmLib {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            debug!("{e}");
        }
    }
}
