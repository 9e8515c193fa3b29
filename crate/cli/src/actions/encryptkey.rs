use std::path::PathBuf;

use clap::Parser;
use encryptkey_hsm::{EncryptKeyHsm, HsmModuleConfig, InstantiateOptions, KeyClass};
use tracing::debug;

use crate::{
    actions::self_test,
    error::{
        CliError,
        result::{CliResult, CliResultHelper},
    },
};

/// Load the encryption keys from an HSM, create encrypted key files and
/// inspect the keys stored on the token.
///
/// Options given on the command line override the configuration file, or the
/// `PI_HSM_MODULE_*` environment variables when no file is given.
#[derive(Parser, Debug, Default)]
pub struct EncryptKeyAction {
    /// TOML file holding the module configuration
    #[arg(long, short = 'c', env = "ENCRYPTKEY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to the PKCS#11 library
    #[arg(long)]
    pub module: Option<PathBuf>,

    /// Numeric slot id; takes precedence over --slotname
    #[arg(long)]
    pub slot: Option<u64>,

    /// Prefix of the slot description
    #[arg(long)]
    pub slotname: Option<String>,

    /// CKA_ID of the RSA key pair
    #[arg(long)]
    pub keyid: Option<u64>,

    /// CKA_LABEL of the RSA key pair
    #[arg(long)]
    pub keylabel: Option<String>,

    /// User PIN of the token; prompted for when absent
    #[arg(long)]
    pub password: Option<String>,

    /// Encrypted key file to load and test
    #[arg(long)]
    pub encfile: Option<PathBuf>,

    /// Plaintext key file to encrypt
    #[arg(long, requires = "outfile")]
    pub infile: Option<PathBuf>,

    /// Where to write the encrypted key file
    #[arg(long, requires = "infile")]
    pub outfile: Option<PathBuf>,

    /// List the public keys on the token
    #[arg(long, default_value = "false")]
    pub listpublic: bool,

    /// List the private keys on the token
    #[arg(long, default_value = "false")]
    pub listprivate: bool,

    /// Directory used as the HSM lock
    #[arg(long)]
    pub lock_path: Option<PathBuf>,

    /// Seconds to wait for the HSM lock
    #[arg(long)]
    pub lock_timeout: Option<u64>,

    /// Fail instead of prompting when no password is configured
    #[arg(long, default_value = "false")]
    pub no_prompt: bool,
}

impl EncryptKeyAction {
    /// The module configuration: file or environment, overridden by the
    /// command line options
    pub fn module_config(&self) -> CliResult<HsmModuleConfig> {
        let mut config = match &self.config {
            Some(path) => HsmModuleConfig::load_from_file(path)
                .with_context(|| format!("unable to load {}", path.display()))?,
            None => HsmModuleConfig::from_env()
                .context("invalid PI_HSM_MODULE_* environment variables")?,
        };
        if let Some(module) = &self.module {
            config.module = Some(module.clone());
        }
        if let Some(slot) = self.slot {
            config.slot = Some(slot.try_into().map_err(|_| {
                CliError::UserError(format!("slot {slot} is out of range"))
            })?);
        }
        if let Some(slotname) = &self.slotname {
            config.slotname = Some(slotname.clone());
        }
        if let Some(keyid) = self.keyid {
            config.keyid = Some(keyid);
        }
        if let Some(keylabel) = &self.keylabel {
            config.keylabel = Some(keylabel.clone());
        }
        if let Some(password) = &self.password {
            config.password.set(password.clone());
        }
        if let Some(encfile) = &self.encfile {
            config.encfile = Some(encfile.clone());
        }
        if let Some(lock_path) = &self.lock_path {
            config.lock_path = Some(lock_path.clone());
        }
        if let Some(lock_timeout) = self.lock_timeout {
            config.lock_timeout = Some(lock_timeout);
        }
        Ok(config)
    }

    pub fn run(&self) -> CliResult<()> {
        let config = self.module_config()?;
        debug!("Module configuration: {config:?}");
        let options = InstantiateOptions {
            keep_session: self.infile.is_some() || self.listpublic || self.listprivate,
            interactive: !self.no_prompt,
            ..InstantiateOptions::default()
        };
        let mut hsm = EncryptKeyHsm::instantiate(&config, &options)?;

        if let (Some(infile), Some(outfile)) = (&self.infile, &self.outfile) {
            hsm.encrypt_file(infile, outfile)?;
            println!("The encrypted key file was written to {}", outfile.display());
        }
        for (requested, class) in [
            (self.listpublic, KeyClass::PublicKey),
            (self.listprivate, KeyClass::PrivateKey),
        ] {
            if requested {
                for key in hsm.list_keys(class)? {
                    println!("{key}");
                }
            }
        }
        hsm.close_session()?;

        if config.encfile.is_some() {
            self_test::run(&hsm)?;
            println!("The encryption keys were loaded and passed the self test");
        } else {
            println!("The HSM module is ready");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use clap::Parser;

    use super::EncryptKeyAction;

    #[test]
    fn command_line_overrides_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "module = \"/usr/lib/libykcs11.so\"\nkeyid = 1\nslotname = \"Yubico\""
        )
        .unwrap();
        let path = file.path().to_string_lossy().into_owned();
        let action = EncryptKeyAction::try_parse_from([
            "encryptkey",
            "--config",
            path.as_str(),
            "--slotname",
            "TestSlot",
            "--password",
            "pw",
            "--lock-timeout",
            "3",
        ])
        .unwrap();
        let config = action.module_config().unwrap();
        assert_eq!(config.slotname.as_deref(), Some("TestSlot"));
        assert_eq!(config.keyid, Some(1));
        assert_eq!(config.lock_timeout, Some(3));
        assert!(config.password.is_available());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn infile_requires_outfile() {
        assert!(EncryptKeyAction::try_parse_from(["encryptkey", "--infile", "key"]).is_err());
        assert!(
            EncryptKeyAction::try_parse_from([
                "encryptkey",
                "--infile",
                "key",
                "--outfile",
                "key.enc"
            ])
            .is_ok()
        );
    }
}
