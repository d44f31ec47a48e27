//! Fault payload: the wire form of an error sent back to a caller.
//!
//! Every failure the dispatcher answers with travels as a `Fault`. The
//! client turns the well-known kinds back into their typed `BusError`
//! variants so a caller can match on `NoHandler` the same way locally and
//! remotely.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::error::BusError;
use crate::domain::message::Message;

/// Well-known fault kinds produced by the bus itself.
pub mod kinds {
    pub const NO_HANDLER: &str = "NoHandler";
    pub const MULTIPLE_HANDLERS: &str = "MultipleHandlers";
    pub const UNKNOWN_MESSAGE: &str = "UnknownMessage";
    pub const HANDLER_PANICKED: &str = "HandlerPanicked";
    pub const CODEC: &str = "Codec";
    pub const INTERNAL: &str = "Internal";
}

/// Error-shaped payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    /// Discriminant the caller matches on, e.g. `InsufficientFunds`.
    pub kind: String,
    /// Human-readable description.
    pub message: String,
    /// Message type the fault concerns, when relevant.
    #[serde(default)]
    pub message_type: Option<String>,
    /// Handler names, for `MultipleHandlers`.
    #[serde(default)]
    pub handlers: Vec<String>,
}

impl Fault {
    /// Create a business fault.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            message_type: None,
            handlers: Vec::new(),
        }
    }

    /// Wrap any error under the given kind.
    pub fn from_error(kind: impl Into<String>, err: &dyn std::error::Error) -> Self {
        Self::new(kind, err.to_string())
    }

    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind == kind
    }

    /// Convert back into the typed error a caller observes.
    pub fn into_error(self) -> BusError {
        match self.kind.as_str() {
            kinds::NO_HANDLER => BusError::NoHandler {
                message_type: self.message_type.unwrap_or_default(),
            },
            kinds::MULTIPLE_HANDLERS => BusError::MultipleHandlers {
                message_type: self.message_type.unwrap_or_default(),
                handlers: self.handlers,
            },
            kinds::UNKNOWN_MESSAGE => BusError::UnknownMessage(self.message),
            _ => BusError::Fault(self),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl Message for Fault {
    const TYPE_TAG: &'static str = "cqs.Fault";
}

impl BusError {
    /// Wire form of this error for a fault reply.
    pub fn to_fault(&self) -> Fault {
        match self {
            BusError::Fault(fault) => fault.clone(),
            BusError::NoHandler { message_type } => Fault {
                message_type: Some(message_type.clone()),
                ..Fault::new(kinds::NO_HANDLER, self.to_string())
            },
            BusError::MultipleHandlers {
                message_type,
                handlers,
            } => Fault {
                message_type: Some(message_type.clone()),
                handlers: handlers.clone(),
                ..Fault::new(kinds::MULTIPLE_HANDLERS, self.to_string())
            },
            BusError::UnknownMessage(detail) => Fault::new(kinds::UNKNOWN_MESSAGE, detail.clone()),
            BusError::HandlerPanicked(detail) => {
                Fault::new(kinds::HANDLER_PANICKED, detail.clone())
            }
            BusError::Codec(detail) => Fault::new(kinds::CODEC, detail.clone()),
            other => Fault::new(kinds::INTERNAL, other.to_string()),
        }
    }
}

impl From<Fault> for BusError {
    fn from(fault: Fault) -> Self {
        fault.into_error()
    }
}
