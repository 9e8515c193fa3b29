//! These tests require a SoftHSM2 token holding an RSA key pair with
//! `CKA_ID` 0x01 and are gated behind the `softhsm2` feature.
//! ```sh
//! softhsm2-util --init-token --free --label TestSlot --pin 12345678 --so-pin 12345678
//! pkcs11-tool --module /usr/lib/softhsm/libsofthsm2.so --login --pin 12345678 \
//!     --keypairgen --key-type rsa:2048 --id 01 --label "my secret key"
//! HSM_USER_PASSWORD=12345678 cargo test --features softhsm2 -- --ignored
//! ```
#![cfg(feature = "softhsm2")]

use std::{env, fs, path::PathBuf, time::Duration};

use encryptkey_hsm::{
    Credential, EncryptKeyHsm, HError, HResult, HsmModuleConfig, InstantiateOptions, KeyClass,
    ModuleState, SecurityModule,
};
use encryptkey_logger::log_init;

const SOFTHSM2_PKCS11_LIB: &str = "/usr/lib/softhsm/libsofthsm2.so";

fn config(dir: &std::path::Path, encfile: Option<PathBuf>) -> HResult<HsmModuleConfig> {
    let password = env::var("HSM_USER_PASSWORD")
        .map_err(|_| HError::Default("HSM_USER_PASSWORD is not set".to_owned()))?;
    Ok(HsmModuleConfig {
        module: Some(PathBuf::from(
            env::var("SOFTHSM2_PKCS11_LIB").unwrap_or_else(|_| SOFTHSM2_PKCS11_LIB.to_owned()),
        )),
        slotname: Some("SoftHSM".to_owned()),
        keyid: Some(1),
        password: Credential::from(password),
        encfile,
        lock_path: Some(dir.join("pilock")),
        ..HsmModuleConfig::default()
    })
}

fn options(keep_session: bool) -> InstantiateOptions {
    InstantiateOptions {
        keep_session,
        interactive: false,
        lock_poll_interval: Duration::from_millis(100),
    }
}

#[test]
#[ignore = "Requires Linux, SoftHSM2 library, and HSM environment"]
fn test_softhsm2_encrypt_then_load_key_file() -> HResult<()> {
    log_init(None);
    let dir = tempfile::tempdir()?;
    let infile = dir.path().join("enckey");
    let outfile = dir.path().join("enckey.enc");

    let mut diagnostic = EncryptKeyHsm::instantiate(&config(dir.path(), None)?, &options(true))?;
    let plaintext = diagnostic.random(96)?;
    fs::write(&infile, &plaintext)?;
    diagnostic.encrypt_file(&infile, &outfile)?;
    assert!(!diagnostic.list_keys(KeyClass::PrivateKey)?.is_empty());
    diagnostic.close_session()?;
    drop(diagnostic);

    let hsm = EncryptKeyHsm::instantiate(&config(dir.path(), Some(outfile))?, &options(false))?;
    assert_eq!(hsm.state(), ModuleState::Ready);
    for k in 0..3 {
        assert_eq!(hsm.get_secret(k), plaintext.get(k * 32..(k + 1) * 32));
    }
    let crypted = hsm.encrypt_password("topSekr3t")?;
    assert_eq!(hsm.decrypt_password(&crypted)?.as_str(), "topSekr3t");
    assert!(!dir.path().join("pilock").exists());
    Ok(())
}

#[test]
#[ignore = "Requires Linux, SoftHSM2 library, and HSM environment"]
fn test_softhsm2_wrong_password() -> HResult<()> {
    log_init(None);
    let dir = tempfile::tempdir()?;
    let config = HsmModuleConfig {
        password: Credential::from("not the pin"),
        ..config(dir.path(), None)?
    };
    let Err(err) = EncryptKeyHsm::instantiate(&config, &options(false)) else {
        return Err(HError::Default("a wrong password was accepted".to_owned()));
    };
    assert!(err.to_string().contains("CKR_PIN_INCORRECT"));
    assert!(!config.password.is_available());
    Ok(())
}
