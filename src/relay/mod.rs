//! Transaction handling: the glue between the SMTP boundary and delivery.

pub mod handler;

pub use handler::{TransactionHandler, resolve};

use std::fmt;

use crate::error::RelayError;

/// A fully received inbound message, as handed over by the transfer layer.
#[derive(Debug, Clone)]
pub struct InboundTransaction {
    /// Submitting peer (IP or socket address). `None` when unknown.
    pub peer_address: Option<String>,
    pub raw_payload: Vec<u8>,
}

/// Overall verdict for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Accepted,
    TemporaryFailure,
    PermanentReject,
}

impl StatusCode {
    /// SMTP reply code.
    pub fn code(self) -> u16 {
        match self {
            Self::Accepted => 250,
            Self::TemporaryFailure => 451,
            Self::PermanentReject => 550,
        }
    }
}

/// The single externally visible output of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionResult {
    pub status: StatusCode,
    pub detail: String,
}

impl TransactionResult {
    pub fn accepted() -> Self {
        Self {
            status: StatusCode::Accepted,
            detail: "Message accepted".into(),
        }
    }

    pub fn temporary_failure() -> Self {
        Self {
            status: StatusCode::TemporaryFailure,
            detail: "Temporary failure".into(),
        }
    }

    fn reject(detail: &str) -> Self {
        Self {
            status: StatusCode::PermanentReject,
            detail: detail.into(),
        }
    }

    pub fn code(&self) -> u16 {
        self.status.code()
    }
}

impl fmt::Display for TransactionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.detail)
    }
}

impl From<RelayError> for TransactionResult {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::UntrustedSource(_) => Self::reject("Source IP unacceptable"),
            RelayError::EmptyRecipients => Self::reject("No recipient found"),
            RelayError::MalformedPayload | RelayError::InvalidContent => {
                Self::reject("Invalid email content")
            }
            RelayError::RecipientNotPermitted => Self::reject("Recipient not permitted"),
            RelayError::Internal(_) => Self::temporary_failure(),
        }
    }
}
