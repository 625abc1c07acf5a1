use state::WriteKind;
use std::fmt;
use thiserror::Error;

/// The collaborator an operation could not run without.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Missing {
    Signer,
    Deployment,
    Engine,
}

impl Missing {
    pub fn guidance(&self) -> &'static str {
        match self {
            Missing::Signer => "Connect wallet to continue.",
            Missing::Deployment => "Contract not deployed on this network.",
            Missing::Engine => "FHE engine not available.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Refresh,
    Increment,
    Decrement,
    Reset,
    Decrypt,
}

impl OperationKind {
    pub fn label(&self) -> &'static str {
        match self {
            OperationKind::Refresh => "Refresh",
            OperationKind::Increment => "Increment",
            OperationKind::Decrement => "Decrement",
            OperationKind::Reset => "Reset",
            OperationKind::Decrypt => "Decrypt",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl From<WriteKind> for OperationKind {
    fn from(kind: WriteKind) -> Self {
        match kind {
            WriteKind::Increment => OperationKind::Increment,
            WriteKind::Decrement => OperationKind::Decrement,
            WriteKind::Reset => OperationKind::Reset,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CounterError {
    #[error("{}", .0.guidance())]
    PreconditionNotMet(Missing),
    #[error("{0} already in flight")]
    AlreadyInFlight(OperationKind),
    #[error("{0} cancelled in wallet")]
    UserCancelled(OperationKind),
    #[error("{kind} failed: {reason}")]
    OperationFailed { kind: OperationKind, reason: String },
    #[error("decryption authorization invalid: {0}")]
    AuthorizationInvalid(String),
    #[error("decryption authorization rejected in wallet")]
    AuthorizationRejected,
    #[error("FHE engine not ready")]
    EngineNotReady,
}

impl CounterError {
    pub fn failed(kind: OperationKind, reason: impl fmt::Display) -> Self {
        CounterError::OperationFailed {
            kind,
            reason: reason.to_string(),
        }
    }

    /// Transient conditions the caller can simply retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CounterError::EngineNotReady
                | CounterError::AlreadyInFlight(_)
                | CounterError::AuthorizationInvalid(_)
        )
    }
}
