use std::{fmt, marker::PhantomData};

use pkcs11_sys::{CK_OBJECT_CLASS, CK_OBJECT_HANDLE, CKO_PRIVATE_KEY, CKO_PUBLIC_KEY};
use tracing::debug;

use crate::{
    HError, HResult,
    backend::ObjectTemplate,
    config::KeySelector,
    session::Session,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyClass {
    PublicKey,
    PrivateKey,
}

impl KeyClass {
    #[must_use]
    pub const fn object_class(self) -> CK_OBJECT_CLASS {
        match self {
            Self::PublicKey => CKO_PUBLIC_KEY,
            Self::PrivateKey => CKO_PRIVATE_KEY,
        }
    }
}

impl fmt::Display for KeyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PublicKey => "public",
            Self::PrivateKey => "private",
        })
    }
}

/// A key object found in a session; only valid while that session is open
#[derive(Debug, Clone, Copy)]
pub struct KeyObject<'s> {
    handle: CK_OBJECT_HANDLE,
    class: KeyClass,
    _session: PhantomData<&'s Session>,
}

impl KeyObject<'_> {
    #[must_use]
    pub const fn handle(&self) -> CK_OBJECT_HANDLE {
        self.handle
    }

    #[must_use]
    pub const fn class(&self) -> KeyClass {
        self.class
    }
}

/// What the diagnostic key listing reports for each object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyObjectInfo {
    pub handle: CK_OBJECT_HANDLE,
    pub class: KeyClass,
    pub label: Option<String>,
    pub id: Option<Vec<u8>>,
}

impl fmt::Display for KeyObjectInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} key object {}", self.class, self.handle)?;
        if let Some(id) = &self.id {
            write!(f, ", id: {}", hex::encode(id))?;
        }
        if let Some(label) = &self.label {
            write!(f, ", label: {label:?}")?;
        }
        Ok(())
    }
}

/// `CKA_ID` value of a numeric key id: its big-endian bytes without the
/// leading zeros, so `1` is the single byte `0x01`.
#[must_use]
pub fn key_id_bytes(id: u64) -> Vec<u8> {
    let bytes = id.to_be_bytes();
    let first = bytes
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(bytes.len() - 1);
    bytes.get(first..).map(<[u8]>::to_vec).unwrap_or_default()
}

fn template(class: KeyClass, selector: Option<&KeySelector>) -> ObjectTemplate {
    let (id, label) = match selector {
        Some(KeySelector::Id(id)) => (Some(key_id_bytes(*id)), None),
        Some(KeySelector::Label(label)) => (None, Some(label.clone())),
        None => (None, None),
    };
    ObjectTemplate {
        class: class.object_class(),
        id,
        label,
    }
}

/// Find the key of `class` matching `selector`.
///
/// When several objects match, the first one enumerated by the token is used.
///
/// # Errors
///
/// `HError::Lookup` if no object matches. Backend failures of the object
/// search are returned as is.
pub fn find_key<'s>(
    session: &'s Session,
    class: KeyClass,
    selector: &KeySelector,
) -> HResult<KeyObject<'s>> {
    let handles = session
        .backend()
        .find_objects(session.handle(), &template(class, Some(selector)))?;
    debug!("Found {} {class} keys matching {selector:?}", handles.len());
    let handle = *handles
        .first()
        .ok_or_else(|| HError::Lookup(format!("No {class} key found for {selector:?}")))?;
    Ok(KeyObject {
        handle,
        class,
        _session: PhantomData,
    })
}

/// List every key of `class` visible in the session
///
/// # Errors
///
/// Propagates backend failures of the object search and attribute reads.
pub fn list_keys(session: &Session, class: KeyClass) -> HResult<Vec<KeyObjectInfo>> {
    let backend = session.backend();
    let handles = backend.find_objects(session.handle(), &template(class, None))?;
    debug!("Found {} {class} keys.", handles.len());
    handles
        .into_iter()
        .map(|handle| {
            let (label, id) = backend.object_label_and_id(session.handle(), handle)?;
            let info = KeyObjectInfo {
                handle,
                class,
                label,
                id,
            };
            debug!("Found {info}");
            Ok(info)
        })
        .collect()
}
