//! Ports: the seams between the buses and the outside world.
//!
//! - `outbound`: the queue transport the buses drive
//! - `inbound`: the handlers the listeners drive

pub mod inbound;
pub mod outbound;

pub use inbound::{CommandHandler, EventSubscriber, RequestHandler};
pub use outbound::{QueueReceiver, QueueSender, SessionAcceptor, Transport};
