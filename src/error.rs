//! Error types for destguard.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GuardError {
    /// Malformed address or CIDR literal (configuration time only).
    #[error("Invalid address spec: {0}")]
    InvalidAddressSpec(String),

    /// The kernel rejected the fixed rule skeleton. Fatal at startup.
    #[error("Firewall topology construction failed: {0}")]
    TopologyConstructionFailed(String),

    /// Reading back the dynamic allow-sets failed. Fatal at startup.
    #[error("Recovering allow-set entries failed: {0}")]
    RecoveryReadFailed(String),

    /// An address whose byte length is neither 4 nor 16.
    #[error("Malformed address ({0} bytes)")]
    MalformedAddress(usize),

    /// A set add/remove or commit did not land in the kernel.
    #[error("Kernel sync failed: {0}")]
    KernelSyncFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The synchronizer is no longer accepting messages.
    #[error("Allow-list synchronizer stopped")]
    WorkerStopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            GuardError::InvalidAddressSpec("foo".into()).to_string(),
            "Invalid address spec: foo"
        );
        assert_eq!(
            GuardError::MalformedAddress(5).to_string(),
            "Malformed address (5 bytes)"
        );
        assert_eq!(
            GuardError::WorkerStopped.to_string(),
            "Allow-list synchronizer stopped"
        );
    }
}
