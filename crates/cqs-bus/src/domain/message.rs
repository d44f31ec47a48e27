//! Message marker traits.
//!
//! Every payload that crosses the transport carries a stable type tag so the
//! receiving side can pick a decode target without reflection.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A payload that can travel in an envelope.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable name written into the envelope's type tag.
    const TYPE_TAG: &'static str;
}

/// A request answered with exactly one reply.
pub trait Request: Message {
    type Reply: Message;
}

/// Queries share the request/reply protocol.
pub use self::Request as Query;

/// Fire-and-forget instruction handled by exactly one handler.
pub trait Command: Message {}

/// One-way notification handled by any number of subscribers.
pub trait ApplicationEvent: Message {}
