//! # CQS Demo
//!
//! A toy ledger driven through all four buses:
//!
//! ```text
//! Deposit ──command──▶ DepositHandler ──AccountCredited──▶ AuditTrail, Notifier
//! GetBalance ──query──▶ BalanceHandler ──Balance──▶ caller
//! Withdraw ──request──▶ WithdrawHandler ──Receipt / InsufficientFunds──▶ caller
//! Ping ──request──▶ PingHandler ──Pong──▶ caller
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn, Instrument};

use cqs_bus::{
    ApplicationEvent, BusConfig, BusError, Command, CommandHandler, Container, CqsFactory,
    EventBus, EventSubscriber, Fault, InMemoryTransport, Message, MessageHandling, Request,
    RequestHandler, Transport,
};
use cqs_telemetry::{init_logging, service_span, TelemetryConfig};

// =============================================================================
// Messages
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct Ping(u32);

#[derive(Debug, Serialize, Deserialize)]
struct Pong(u32);

#[derive(Debug, Serialize, Deserialize)]
struct Deposit {
    account: String,
    amount: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct AccountCredited {
    account: String,
    amount: u64,
    balance: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct GetBalance {
    account: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Balance {
    account: String,
    amount: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Withdraw {
    account: String,
    amount: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Receipt {
    remaining: u64,
}

impl Message for Ping {
    const TYPE_TAG: &'static str = "demo.Ping";
}
impl Message for Pong {
    const TYPE_TAG: &'static str = "demo.Pong";
}
impl Message for Deposit {
    const TYPE_TAG: &'static str = "demo.Deposit";
}
impl Message for AccountCredited {
    const TYPE_TAG: &'static str = "demo.AccountCredited";
}
impl Message for GetBalance {
    const TYPE_TAG: &'static str = "demo.GetBalance";
}
impl Message for Balance {
    const TYPE_TAG: &'static str = "demo.Balance";
}
impl Message for Withdraw {
    const TYPE_TAG: &'static str = "demo.Withdraw";
}
impl Message for Receipt {
    const TYPE_TAG: &'static str = "demo.Receipt";
}

impl Request for Ping {
    type Reply = Pong;
}
impl Request for GetBalance {
    type Reply = Balance;
}
impl Request for Withdraw {
    type Reply = Receipt;
}
impl Command for Deposit {}
impl ApplicationEvent for AccountCredited {}

// =============================================================================
// Handlers
// =============================================================================

#[derive(Default)]
struct Ledger {
    accounts: Mutex<HashMap<String, u64>>,
}

impl Ledger {
    fn balance(&self, account: &str) -> u64 {
        self.accounts.lock().get(account).copied().unwrap_or(0)
    }
}

struct PingHandler;

#[async_trait]
impl RequestHandler<Ping> for PingHandler {
    async fn execute(&self, request: Ping) -> Result<Pong, Fault> {
        Ok(Pong(request.0))
    }
}

struct DepositHandler {
    ledger: Arc<Ledger>,
    events: EventBus,
}

#[async_trait]
impl CommandHandler<Deposit> for DepositHandler {
    async fn execute(&self, command: Deposit) -> Result<(), Fault> {
        let balance = {
            let mut accounts = self.ledger.accounts.lock();
            let balance = accounts.entry(command.account.clone()).or_insert(0);
            *balance += command.amount;
            *balance
        };
        self.events
            .publish(AccountCredited {
                account: command.account,
                amount: command.amount,
                balance,
            })
            .await
            .map_err(|e| e.to_fault())?;
        Ok(())
    }
}

struct BalanceHandler {
    ledger: Arc<Ledger>,
}

#[async_trait]
impl RequestHandler<GetBalance> for BalanceHandler {
    async fn execute(&self, query: GetBalance) -> Result<Balance, Fault> {
        Ok(Balance {
            amount: self.ledger.balance(&query.account),
            account: query.account,
        })
    }
}

struct WithdrawHandler {
    ledger: Arc<Ledger>,
}

#[async_trait]
impl RequestHandler<Withdraw> for WithdrawHandler {
    async fn execute(&self, request: Withdraw) -> Result<Receipt, Fault> {
        let mut accounts = self.ledger.accounts.lock();
        let balance = accounts.entry(request.account).or_insert(0);
        if *balance < request.amount {
            return Err(Fault::new(
                "InsufficientFunds",
                format!("balance {} is below {}", balance, request.amount),
            ));
        }
        *balance -= request.amount;
        Ok(Receipt {
            remaining: *balance,
        })
    }
}

struct AuditTrail {
    entries: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl EventSubscriber<AccountCredited> for AuditTrail {
    async fn handle(&self, event: &AccountCredited) -> Result<(), Fault> {
        self.entries
            .lock()
            .push(format!("{} +{}", event.account, event.amount));
        Ok(())
    }
}

struct Notifier;

#[async_trait]
impl EventSubscriber<AccountCredited> for Notifier {
    async fn handle(&self, event: &AccountCredited) -> Result<(), Fault> {
        info!(account = %event.account, balance = event.balance, "Account credited");
        Ok(())
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = TelemetryConfig::for_service("cqs-demo");
    init_logging(&telemetry)?;

    run().instrument(service_span(&telemetry)).await
}

async fn run() -> Result<()> {
    let config = BusConfig::from_env().context("loading bus configuration")?;
    let transport: Arc<dyn Transport> = Arc::new(InMemoryTransport::new());
    let factory = CqsFactory::new(transport, config)?;

    let ledger = Arc::new(Ledger::default());
    let audit = Arc::new(Mutex::new(Vec::new()));
    let events = factory.create_event_bus()?;

    let mut container = Container::new();
    {
        let ledger = ledger.clone();
        container.register_command_handler::<Deposit, _>(move |_| DepositHandler {
            ledger: ledger.clone(),
            events: events.clone(),
        });
    }
    {
        let ledger = ledger.clone();
        container.register_request_handler::<GetBalance, _>(move |_| BalanceHandler {
            ledger: ledger.clone(),
        });
    }
    {
        let ledger = ledger.clone();
        container.register_request_handler::<Withdraw, _>(move |_| WithdrawHandler {
            ledger: ledger.clone(),
        });
    }
    {
        let audit = audit.clone();
        container
            .register_event_subscriber::<AccountCredited, _>(move |_| AuditTrail {
                entries: audit.clone(),
            })
            .register_event_subscriber::<AccountCredited, _>(|_| Notifier)
            .register_request_handler::<Ping, _>(|_| PingHandler);
    }
    let container = Arc::new(container);

    let requests = factory.create_request_reply_listener(container.clone());
    let queries = factory.create_query_listener(container.clone());
    let commands = factory.create_command_listener(container.clone());
    let event_listener = factory.create_event_listener(container);

    commands.on_success(|_| {
        info!("Command committed");
        Ok(())
    });
    commands.failures().subscribe(|notice| {
        // A malformed command will never succeed; drop it.
        if matches!(notice.error, BusError::UnknownMessage(_)) {
            notice.set_disposition(MessageHandling::RemoveMessage);
        }
    });
    requests.start()?;
    queries.start()?;
    commands.start()?;
    event_listener.start()?;

    let bus = factory.create_request_reply_bus()?;
    let query_bus = factory.create_query_bus()?;
    let command_bus = factory.create_command_bus()?;

    let pong = bus.execute(Ping(42)).await?;
    info!(value = pong.0, "Ping answered");

    command_bus
        .send(Deposit {
            account: "alice".into(),
            amount: 100,
        })
        .await?;

    // Commands are asynchronous; poll until the deposit is visible.
    let mut balance = 0;
    for _ in 0..50 {
        balance = query_bus
            .query(GetBalance {
                account: "alice".into(),
            })
            .await?
            .amount;
        if balance == 100 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    if balance != 100 {
        bail!("deposit never became visible, balance is {balance}");
    }
    info!(account = "alice", balance = balance, "Deposit visible");

    let receipt = bus
        .execute(Withdraw {
            account: "alice".into(),
            amount: 30,
        })
        .await?;
    info!(remaining = receipt.remaining, "Withdrawal accepted");

    match bus
        .execute(Withdraw {
            account: "alice".into(),
            amount: 500,
        })
        .await
    {
        Err(BusError::Fault(fault)) if fault.is_kind("InsufficientFunds") => {
            info!(fault = %fault, "Withdrawal refused");
        }
        other => bail!("expected an InsufficientFunds fault, got {other:?}"),
    }

    bus.stop().await;
    query_bus.stop().await;
    requests.stop().await;
    queries.stop().await;
    commands.stop().await;
    event_listener.stop().await;

    let entries = audit.lock().clone();
    if entries.is_empty() {
        warn!("Audit trail is empty; the event may still be in flight");
    }
    info!(audit = ?entries, "Demo finished");
    Ok(())
}
