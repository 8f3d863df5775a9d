//! CNI error reporting.
//!
//! Failures are printed to stdout as the CNI error object and the process
//! exits non-zero. Codes below 100 are the well-known CNI codes;
//! address management failures use [`CODE_IPAM`].

use serde::Serialize;
use thiserror::Error;
use vnet_ipam::IpamError;
use vnet_ipam_store::StoreError;

/// Invalid or missing `CNI_*` environment variables.
pub const CODE_INVALID_ENVIRONMENT: u32 = 4;
/// Failure reading input or writing output.
pub const CODE_IO: u32 = 5;
/// The network configuration is not valid JSON.
pub const CODE_DECODE: u32 = 6;
/// The network configuration is semantically invalid.
pub const CODE_INVALID_CONFIG: u32 = 7;
/// The address manager rejected the operation.
pub const CODE_IPAM: u32 = 100;

/// Errors surfaced to the container runtime.
#[derive(Debug, Error)]
pub enum CniError {
    /// A required environment variable is missing or malformed.
    #[error("invalid CNI environment: {0}")]
    InvalidEnvironment(String),

    /// Reading stdin or the store failed.
    #[error("I/O failure: {0}")]
    Io(String),

    /// The network configuration could not be parsed.
    #[error("failed to decode network configuration: {0}")]
    Decode(#[from] serde_json::Error),

    /// The network configuration names an unknown or inconsistent setting.
    #[error("invalid network configuration: {0}")]
    InvalidConfig(String),

    /// The address manager failed.
    #[error("{0}")]
    Ipam(IpamError),
}

impl From<IpamError> for CniError {
    fn from(err: IpamError) -> Self {
        match err {
            IpamError::InvalidConfiguration(msg) => Self::InvalidConfig(msg),
            other => Self::Ipam(other),
        }
    }
}

impl From<StoreError> for CniError {
    fn from(err: StoreError) -> Self {
        Self::Io(err.to_string())
    }
}

impl CniError {
    /// CNI error code.
    pub fn code(&self) -> u32 {
        match self {
            Self::InvalidEnvironment(_) => CODE_INVALID_ENVIRONMENT,
            Self::Io(_) => CODE_IO,
            Self::Decode(_) => CODE_DECODE,
            Self::InvalidConfig(_) => CODE_INVALID_CONFIG,
            Self::Ipam(_) => CODE_IPAM,
        }
    }

    /// Short description of the error class.
    pub fn summary(&self) -> &'static str {
        match self {
            Self::InvalidEnvironment(_) => "invalid CNI environment",
            Self::Io(_) => "I/O failure",
            Self::Decode(_) => "failed to decode network configuration",
            Self::InvalidConfig(_) => "invalid network configuration",
            Self::Ipam(_) => "address management failed",
        }
    }

    /// Builds the error object for `cni_version`.
    pub fn to_output(&self, cni_version: &str) -> ErrorOutput {
        let details = match self {
            Self::InvalidEnvironment(d) | Self::Io(d) | Self::InvalidConfig(d) => d.clone(),
            Self::Decode(e) => e.to_string(),
            Self::Ipam(e) => e.to_string(),
        };
        ErrorOutput {
            cni_version: cni_version.to_string(),
            code: self.code(),
            msg: self.summary().to_string(),
            details,
        }
    }
}

/// The CNI error object.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ErrorOutput {
    /// Version of the CNI result format.
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Error code.
    pub code: u32,
    /// Short message.
    pub msg: String,
    /// Longer explanation.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub details: String,
}

/// Result type for the CNI plugin.
pub type Result<T> = std::result::Result<T, CniError>;

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(CniError::InvalidEnvironment("CNI_COMMAND".into()), CODE_INVALID_ENVIRONMENT ; "environment")]
    #[test_case(CniError::InvalidConfig("bad".into()), CODE_INVALID_CONFIG ; "config")]
    #[test_case(CniError::from(IpamError::NoAvailableAddresses), CODE_IPAM ; "ipam")]
    #[test_case(CniError::from(IpamError::InvalidConfiguration("x".into())), CODE_INVALID_CONFIG ; "ipam config")]
    fn test_codes(err: CniError, code: u32) {
        assert_eq!(err.code(), code);
    }

    #[test]
    fn test_ipam_output() {
        let output = CniError::from(IpamError::NoAvailableAddresses).to_output("0.4.0");
        let json = serde_json::to_value(&output).expect("encode");
        assert_eq!(
            json,
            serde_json::json!({
                "cniVersion": "0.4.0",
                "code": 100,
                "msg": "address management failed",
                "details": "No available addresses"
            })
        );
    }

    #[test]
    fn test_decode_output() {
        let err = serde_json::from_str::<serde_json::Value>("{").expect_err("invalid");
        let output = CniError::from(err).to_output("1.0.0");
        assert_eq!(output.code, CODE_DECODE);
        assert_eq!(output.msg, "failed to decode network configuration");
        assert!(!output.details.is_empty());
    }
}
