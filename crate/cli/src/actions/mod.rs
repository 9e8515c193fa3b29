pub mod encryptkey;
