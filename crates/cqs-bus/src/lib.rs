//! CQS message bus over a durable, session-capable queue transport.
//!
//! Four buses share one transport:
//!
//! - **Command bus**: fire-and-forget, exactly one handler
//! - **Event bus**: fire-and-forget, any number of subscribers
//! - **Request/reply bus** and **query bus**: the caller suspends until the
//!   matching reply arrives on its own session
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │ client                                                               │
//! │  RequestReplyBus::execute                                            │
//! │     │ put(id)                                                        │
//! │     ▼                                                                │
//! │  PendingCallTable ◀──── take(id) ──── reply loop (own session)       │
//! │     │                                       ▲                        │
//! └─────┼───────────────────────────────────────┼────────────────────────┘
//!       │ send(request, id, session)            │ reply(reply_to = id)
//!       ▼                                       │
//! ┌─────────────────────┐                ┌──────┴──────────────┐
//! │    request queue    │                │ reply queue         │
//! └──────────┬──────────┘                │ (session-enabled)   │
//!            ▼                           └──────▲──────────────┘
//! ┌──────────────────────────────────────────────┼───────────────────────┐
//! │ RequestReplyListener: type tag → one handler in a fresh Scope ──────┘│
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use cqs_bus::{BusConfig, Container, CqsFactory, InMemoryTransport};
//!
//! let transport = Arc::new(InMemoryTransport::new());
//! let factory = CqsFactory::new(transport, BusConfig::from_env()?)?;
//!
//! let mut container = Container::new();
//! container.register_request_handler::<Ping, _>(|_| PingHandler);
//! let listener = factory.create_request_reply_listener(Arc::new(container));
//! listener.start()?;
//!
//! let bus = factory.create_request_reply_bus()?;
//! let pong = bus.execute(Ping(42)).await?;
//! ```
//!
//! Receive loops never die on a bad message. Per-message and bus-level
//! failures are reported through each instance's [`FailureNotifier`].

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod adapters;
pub mod client;
pub mod codec;
pub mod container;
pub mod domain;
pub mod factory;
pub mod listener;
pub mod notify;
pub mod ports;
pub mod registry;
pub mod shutdown;

// Re-exports for public API
pub use adapters::InMemoryTransport;
pub use client::{CommandBus, EventBus, QueryBus, RequestReplyBus};
pub use codec::Codec;
pub use container::{Container, HandlerKey, HandlerKind, Resolved, Scope};
pub use domain::*;
pub use factory::CqsFactory;
pub use listener::{CommandListener, EventListener, QueryListener, RequestReplyListener};
pub use notify::FailureNotifier;
pub use ports::{
    CommandHandler, EventSubscriber, QueueReceiver, QueueSender, RequestHandler, SessionAcceptor,
    Transport,
};
pub use registry::{EncodedReply, ReplyRegistry};
pub use shutdown::{LoopState, ShutdownCoordinator};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
