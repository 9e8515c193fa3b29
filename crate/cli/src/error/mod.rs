use encryptkey_hsm::HError;
use thiserror::Error;

pub mod result;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("{0}")]
    Default(String),
    #[error(transparent)]
    Hsm(#[from] HError),
    #[error("Self test failed: {0}")]
    SelfTest(String),
    #[error("invalid options: {0}")]
    UserError(String),
}

/// Return early with a self test error if a condition is not satisfied.
#[macro_export]
macro_rules! self_test_ensure {
    ($cond:expr, $fmt:expr $(, $arg:expr)* $(,)?) => {
        if !$cond {
            return ::core::result::Result::Err($crate::error::CliError::SelfTest(
                ::core::format_args!($fmt $(, $arg)*).to_string(),
            ));
        }
    };
}
