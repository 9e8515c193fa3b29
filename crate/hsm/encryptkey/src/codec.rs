use pkcs11_sys::{CK_MECHANISM_TYPE, CKM_RSA_PKCS};
use tracing::debug;
use zeroize::Zeroizing;

use crate::{
    HResult,
    config::KeySelector,
    locator::{KeyClass, find_key},
    session::Session,
};

/// The key file is protected with RSA PKCS#1 v1.5
pub const KEY_FILE_MECHANISM: CK_MECHANISM_TYPE = CKM_RSA_PKCS;

/// Decrypt an encrypted key file with the private key designated by `selector`
///
/// # Errors
///
/// Fails if the private key cannot be found or the token rejects the blob.
pub fn decrypt_blob(
    session: &Session,
    selector: &KeySelector,
    blob: &[u8],
) -> HResult<Zeroizing<Vec<u8>>> {
    let private_key = find_key(session, KeyClass::PrivateKey, selector)?;
    let plaintext = session.backend().decrypt(
        session.handle(),
        private_key.handle(),
        KEY_FILE_MECHANISM,
        blob,
    )?;
    debug!(
        "Decrypted {} bytes of key material into {} bytes",
        blob.len(),
        plaintext.len()
    );
    Ok(plaintext)
}

/// Encrypt key material with the public key designated by `selector`.
/// Only used to produce key files out of band.
///
/// # Errors
///
/// Fails if the public key cannot be found or the token cannot encrypt
/// `plaintext`.
pub fn encrypt_blob(
    session: &Session,
    selector: &KeySelector,
    plaintext: &[u8],
) -> HResult<Vec<u8>> {
    let public_key = find_key(session, KeyClass::PublicKey, selector)?;
    session.backend().encrypt(
        session.handle(),
        public_key.handle(),
        KEY_FILE_MECHANISM,
        plaintext,
    )
}
