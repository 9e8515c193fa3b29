use pkcs11_sys::{
    CK_RV, CKR_ARGUMENTS_BAD, CKR_DEVICE_ERROR, CKR_DEVICE_REMOVED, CKR_FUNCTION_FAILED,
    CKR_GENERAL_ERROR, CKR_KEY_HANDLE_INVALID, CKR_OK, CKR_PIN_INCORRECT, CKR_PIN_LOCKED,
    CKR_SESSION_HANDLE_INVALID, CKR_SLOT_ID_INVALID, CKR_TOKEN_NOT_PRESENT,
    CKR_USER_ALREADY_LOGGED_IN, CKR_USER_NOT_LOGGED_IN,
};
use thiserror::Error;

pub type HResult<T> = Result<T, HError>;

/// Coarse classification of an [`HError`], used by callers to tell fatal
/// categories apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    DeviceUnavailable,
    Authentication,
    Lookup,
    Lock,
    Hardware,
    Other,
}

#[derive(Error, Debug)]
pub enum HError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Lookup error: {0}")]
    Lookup(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("PKCS#11 error: {context}: {}", ckr_name(.rv))]
    Pkcs11 { context: String, rv: CK_RV },

    #[error("{0}")]
    Default(String),

    #[error("Error loading the library: {0}")]
    LibLoading(#[from] libloading::Error),

    #[error("Cryptographic error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    #[error("Invalid configuration file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Hex(#[from] hex::FromHexError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    TryFromIntError(#[from] std::num::TryFromIntError),
}

impl HError {
    pub(crate) fn pkcs11<S: Into<String>>(context: S, rv: CK_RV) -> Self {
        Self::Pkcs11 {
            context: context.into(),
            rv,
        }
    }

    /// The PKCS#11 return value carried by this error, if any
    #[must_use]
    pub const fn rv(&self) -> Option<CK_RV> {
        match self {
            Self::Pkcs11 { rv, .. } => Some(*rv),
            _ => None,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) | Self::Toml(_) => ErrorKind::Configuration,
            Self::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            Self::Authentication(_) => ErrorKind::Authentication,
            Self::Lookup(_) => ErrorKind::Lookup,
            Self::Lock(_) => ErrorKind::Lock,
            Self::Pkcs11 { rv, .. } => match *rv {
                CKR_PIN_INCORRECT | CKR_PIN_LOCKED | CKR_USER_NOT_LOGGED_IN => {
                    ErrorKind::Authentication
                }
                CKR_SLOT_ID_INVALID | CKR_TOKEN_NOT_PRESENT | CKR_DEVICE_REMOVED => {
                    ErrorKind::DeviceUnavailable
                }
                _ => ErrorKind::Hardware,
            },
            Self::LibLoading(_) => ErrorKind::Hardware,
            Self::Default(_)
            | Self::Crypto(_)
            | Self::Hex(_)
            | Self::Io(_)
            | Self::TryFromIntError(_) => ErrorKind::Other,
        }
    }

    /// Only the "user already logged in" race is recoverable by retrying the login.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Pkcs11 {
                rv: CKR_USER_ALREADY_LOGGED_IN,
                ..
            }
        )
    }
}

/// Symbolic name of the PKCS#11 return values this module reacts to
fn ckr_name(rv: &CK_RV) -> String {
    let name = match *rv {
        CKR_OK => "CKR_OK",
        CKR_ARGUMENTS_BAD => "CKR_ARGUMENTS_BAD",
        CKR_DEVICE_ERROR => "CKR_DEVICE_ERROR",
        CKR_DEVICE_REMOVED => "CKR_DEVICE_REMOVED",
        CKR_FUNCTION_FAILED => "CKR_FUNCTION_FAILED",
        CKR_GENERAL_ERROR => "CKR_GENERAL_ERROR",
        CKR_KEY_HANDLE_INVALID => "CKR_KEY_HANDLE_INVALID",
        CKR_PIN_INCORRECT => "CKR_PIN_INCORRECT",
        CKR_PIN_LOCKED => "CKR_PIN_LOCKED",
        CKR_SESSION_HANDLE_INVALID => "CKR_SESSION_HANDLE_INVALID",
        CKR_SLOT_ID_INVALID => "CKR_SLOT_ID_INVALID",
        CKR_TOKEN_NOT_PRESENT => "CKR_TOKEN_NOT_PRESENT",
        CKR_USER_ALREADY_LOGGED_IN => "CKR_USER_ALREADY_LOGGED_IN",
        CKR_USER_NOT_LOGGED_IN => "CKR_USER_NOT_LOGGED_IN",
        other => return format!("0x{other:08X}"),
    };
    name.to_owned()
}

#[cfg(test)]
mod tests {
    use pkcs11_sys::{CKR_DEVICE_ERROR, CKR_PIN_INCORRECT, CKR_USER_ALREADY_LOGGED_IN};

    use super::{ErrorKind, HError};

    #[test]
    fn pkcs11_errors_are_classified_by_return_value() {
        let wrong_pin = HError::pkcs11("C_Login", CKR_PIN_INCORRECT);
        assert_eq!(wrong_pin.kind(), ErrorKind::Authentication);
        assert!(!wrong_pin.is_retryable());
        assert_eq!(
            wrong_pin.to_string(),
            "PKCS#11 error: C_Login: CKR_PIN_INCORRECT"
        );

        let race = HError::pkcs11("C_Login", CKR_USER_ALREADY_LOGGED_IN);
        assert!(race.is_retryable());

        let device = HError::pkcs11("C_Decrypt", CKR_DEVICE_ERROR);
        assert_eq!(device.kind(), ErrorKind::Hardware);
        assert_eq!(device.rv(), Some(CKR_DEVICE_ERROR));
    }

    #[test]
    fn unknown_return_values_are_printed_in_hex() {
        let err = HError::pkcs11("C_Encrypt", 0x8000_0001);
        assert_eq!(err.to_string(), "PKCS#11 error: C_Encrypt: 0x80000001");
    }

    #[test]
    fn module_level_errors_keep_their_kind() {
        assert_eq!(
            HError::Configuration("x".to_owned()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(HError::Lock("x".to_owned()).kind(), ErrorKind::Lock);
        assert_eq!(HError::Lookup("x".to_owned()).kind(), ErrorKind::Lookup);
        assert_eq!(
            HError::DeviceUnavailable("x".to_owned()).kind(),
            ErrorKind::DeviceUnavailable
        );
        assert_eq!(HError::Default("x".to_owned()).rv(), None);
    }
}
