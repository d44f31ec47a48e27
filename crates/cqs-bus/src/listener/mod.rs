//! Server side: listeners that pull messages and run handlers.
//!
//! - `request_reply`: requests and queries, answered on the caller's session
//! - `one_way`: commands (exactly one handler) and events (any number)

pub mod one_way;
pub(crate) mod receive_loop;
pub mod request_reply;

use std::sync::Arc;

use crate::container::Scope;
use crate::domain::fault::Fault;

pub use one_way::{CommandListener, EventListener, OneWayListener};
pub use request_reply::{QueryListener, RequestReplyListener};

/// Runs after a handler succeeded, with the scope that resolved it, before
/// the scope is disposed. An error counts as a handler failure.
pub type SuccessHook = Arc<dyn Fn(&Scope) -> Result<(), Fault> + Send + Sync>;
