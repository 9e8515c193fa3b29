mod log_utils;

pub use log_utils::{DEFAULT_LOG_FILTER, log_init};
