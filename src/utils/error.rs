//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;

/// Customized error type for shardset.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ShardsetError(pub String);

impl fmt::Display for ShardsetError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `ShardsetError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for ShardsetError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                ShardsetError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::time::error::Elapsed);
impl_from_error!(tokio::task::JoinError);
