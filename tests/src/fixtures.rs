//! Shared messages, handlers and helpers for the integration flows.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cqs_bus::{
    ApplicationEvent, BusConfig, Command, CommandHandler, CqsFactory, EventSubscriber, Fault,
    InMemoryTransport, Message, Request, RequestHandler, Transport,
};

// =============================================================================
// MESSAGES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping(pub u32);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pong(pub u32);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Withdraw {
    pub account: String,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub remaining: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Explode;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetCount;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Count(pub usize);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Audit {
    pub entry: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlowCommand {
    pub millis: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shipped {
    pub order: u32,
}

impl Message for Ping {
    const TYPE_TAG: &'static str = "Ping";
}
impl Message for Pong {
    const TYPE_TAG: &'static str = "Pong";
}
impl Message for Withdraw {
    const TYPE_TAG: &'static str = "Withdraw";
}
impl Message for Receipt {
    const TYPE_TAG: &'static str = "Receipt";
}
impl Message for Explode {
    const TYPE_TAG: &'static str = "Explode";
}
impl Message for GetCount {
    const TYPE_TAG: &'static str = "GetCount";
}
impl Message for Count {
    const TYPE_TAG: &'static str = "Count";
}
impl Message for Audit {
    const TYPE_TAG: &'static str = "Audit";
}
impl Message for SlowCommand {
    const TYPE_TAG: &'static str = "SlowCommand";
}
impl Message for Shipped {
    const TYPE_TAG: &'static str = "Shipped";
}

impl Request for Ping {
    type Reply = Pong;
}
impl Request for Withdraw {
    type Reply = Receipt;
}
impl Request for Explode {
    type Reply = Pong;
}
impl Request for GetCount {
    type Reply = Count;
}
impl Command for Audit {}
impl Command for SlowCommand {}
impl ApplicationEvent for Shipped {}

// =============================================================================
// HANDLERS
// =============================================================================

pub struct PingHandler;

#[async_trait]
impl RequestHandler<Ping> for PingHandler {
    async fn execute(&self, request: Ping) -> Result<Pong, Fault> {
        Ok(Pong(request.0))
    }
}

/// Second Ping handler, to provoke `MultipleHandlers`.
pub struct EchoHandler;

#[async_trait]
impl RequestHandler<Ping> for EchoHandler {
    async fn execute(&self, request: Ping) -> Result<Pong, Fault> {
        Ok(Pong(request.0 + 1))
    }
}

/// Every account holds `balance`.
pub struct WithdrawHandler {
    pub balance: u64,
}

#[async_trait]
impl RequestHandler<Withdraw> for WithdrawHandler {
    async fn execute(&self, request: Withdraw) -> Result<Receipt, Fault> {
        if request.amount > self.balance {
            return Err(Fault::new(
                "InsufficientFunds",
                format!("{} holds {}", request.account, self.balance),
            ));
        }
        Ok(Receipt {
            remaining: self.balance - request.amount,
        })
    }
}

pub struct ExplodingHandler;

#[async_trait]
impl RequestHandler<Explode> for ExplodingHandler {
    async fn execute(&self, _request: Explode) -> Result<Pong, Fault> {
        panic!("handler exploded")
    }
}

pub struct CountHandler {
    pub counter: Arc<AtomicUsize>,
}

#[async_trait]
impl RequestHandler<GetCount> for CountHandler {
    async fn execute(&self, _query: GetCount) -> Result<Count, Fault> {
        Ok(Count(self.counter.load(Ordering::SeqCst)))
    }
}

/// Records entries; fails on the entry "reject".
pub struct AuditHandler {
    pub log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl CommandHandler<Audit> for AuditHandler {
    async fn execute(&self, command: Audit) -> Result<(), Fault> {
        if command.entry == "reject" {
            return Err(Fault::new("Rejected", "audit entry refused"));
        }
        self.log.lock().push(command.entry);
        Ok(())
    }
}

/// Flags start and finish so a test can stop mid-handler.
pub struct SlowHandler {
    pub started: Arc<AtomicUsize>,
    pub finished: Arc<AtomicUsize>,
}

#[async_trait]
impl CommandHandler<SlowCommand> for SlowHandler {
    async fn execute(&self, command: SlowCommand) -> Result<(), Fault> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(command.millis)).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Counts the events it saw; fails on `fail_on` when set.
pub struct ShipmentSubscriber {
    pub seen: Arc<AtomicUsize>,
    pub fail_on: Option<u32>,
}

#[async_trait]
impl EventSubscriber<Shipped> for ShipmentSubscriber {
    async fn handle(&self, event: &Shipped) -> Result<(), Fault> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        if self.fail_on == Some(event.order) {
            return Err(Fault::new("ShipmentRejected", format!("order {}", event.order)));
        }
        Ok(())
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Short receive waits so stop is quick; a generous reply timeout.
pub fn fast_config() -> BusConfig {
    BusConfig {
        receive_wait: Duration::from_millis(20),
        reply_timeout: Some(Duration::from_secs(5)),
        sweep_interval: Duration::from_millis(20),
        ..BusConfig::default()
    }
}

/// A factory over `transport`; the caller keeps a handle for inspection.
pub fn factory_over(transport: &InMemoryTransport, config: BusConfig) -> CqsFactory {
    let shared: Arc<dyn Transport> = Arc::new(transport.clone());
    match CqsFactory::new(shared, config) {
        Ok(factory) => factory,
        Err(e) => panic!("test configuration rejected: {e}"),
    }
}

pub fn factory_with(config: BusConfig) -> (InMemoryTransport, CqsFactory) {
    let transport = InMemoryTransport::new();
    let factory = factory_over(&transport, config);
    (transport, factory)
}

pub fn factory() -> (InMemoryTransport, CqsFactory) {
    factory_with(fast_config())
}

/// Poll `condition` for up to two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 2s");
}
