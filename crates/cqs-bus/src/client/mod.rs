//! Client side: buses that send messages.
//!
//! - `request_reply`: requests and queries, awaiting a typed reply
//! - `one_way`: commands and events, fire and forget

pub mod one_way;
pub mod request_reply;

pub use one_way::{CommandBus, EventBus};
pub use request_reply::{QueryBus, RequestReplyBus};
