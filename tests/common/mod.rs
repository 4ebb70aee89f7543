#![allow(dead_code)]

use paysplit::application::adapters::ChannelAdapters;
use paysplit::application::reconciler::ReconciliationScheduler;
use paysplit::application::engine::DivisionEngine;
use paysplit::config::{EngineConfig, ReconcileConfig};
use paysplit::domain::money::{Amount, Ratio};
use paysplit::domain::order::{DivisionStatus, Order};
use paysplit::domain::receiver::{AccountType, BindingState, ChannelCode, ReceiverBinding};
use paysplit::infrastructure::channels::{SandboxChannel, SandboxConfig};
use paysplit::infrastructure::in_memory::InMemoryStore;
use paysplit::infrastructure::registry::InMemoryReceiverRegistry;
use rust_decimal::Decimal;
use std::fs::File;
use std::io::Error;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub fn order(id: &str, channel: &str, amount: u64) -> Order {
    Order {
        id: id.to_string(),
        merchant_id: "M1".to_string(),
        app_id: "APP1".to_string(),
        channel: ChannelCode::new(channel),
        channel_order_ref: format!("CH-{id}"),
        amount: Amount::new(amount),
        division_eligible: true,
        division_status: DivisionStatus::None,
    }
}

pub fn binding(id: u64, channel: &str, ratio: Decimal) -> ReceiverBinding {
    ReceiverBinding {
        id,
        merchant_id: "M1".to_string(),
        isv_no: None,
        app_id: "APP1".to_string(),
        channel: ChannelCode::new(channel),
        alias: format!("receiver-{id}"),
        group_id: None,
        group_name: None,
        account_type: AccountType::Business,
        account_no: format!("ACC{id}"),
        account_name: format!("Receiver {id}"),
        relation_type: "PARTNER".to_string(),
        relation_label: None,
        split_ratio: Ratio::new(ratio).unwrap(),
        state: BindingState::Active,
        channel_bind_result: None,
        channel_ext_info: None,
        bind_success_at: None,
        created_at: None,
        updated_at: None,
    }
}

/// Engine, scheduler and a scripted `wxpay` sandbox over one in-memory store.
pub struct Harness {
    pub store: InMemoryStore,
    pub registry: InMemoryReceiverRegistry,
    pub sandbox: Arc<SandboxChannel>,
    pub engine: Arc<DivisionEngine>,
    pub scheduler: ReconciliationScheduler,
}

impl Harness {
    pub fn new(sandbox: SandboxConfig, channel_timeout_ms: u64) -> Self {
        let store = InMemoryStore::new();
        let registry = InMemoryReceiverRegistry::new();
        let sandbox = Arc::new(SandboxChannel::new(sandbox));
        let adapters = ChannelAdapters::new().with(sandbox.clone());
        let engine_config = EngineConfig {
            channel_timeout_ms,
            ..EngineConfig::default()
        };
        let reconcile_config = ReconcileConfig {
            grace_ms: 0,
            base_backoff_ms: 0,
            max_attempts: 3,
            ..ReconcileConfig::default()
        };
        let engine = Arc::new(DivisionEngine::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(registry.clone()),
            adapters.clone(),
            engine_config,
        ));
        let scheduler = ReconciliationScheduler::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            adapters,
            reconcile_config,
            Duration::from_millis(channel_timeout_ms),
        );
        Self {
            store,
            registry,
            sandbox,
            engine,
            scheduler,
        }
    }

    pub fn wxpay() -> Self {
        Self::new(SandboxConfig::new("wxpay"), 5_000)
    }
}

pub fn write_receivers_csv(path: &Path, ratios: &[(u64, &str)]) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);
    wtr.write_record([
        "id",
        "merchant_id",
        "app_id",
        "channel",
        "account_type",
        "account_no",
        "account_name",
        "relation_type",
        "split_ratio",
    ])?;
    for (id, ratio) in ratios {
        wtr.write_record([
            id.to_string().as_str(),
            "M1",
            "APP1",
            "wxpay",
            "business",
            &format!("ACC{id}"),
            &format!("Receiver {id}"),
            "PARTNER",
            *ratio,
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Writes `rows` captured `wxpay` orders named `P1..=Pn`, each for `amount`.
pub fn generate_orders_csv(path: &Path, rows: usize, amount: u64) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);
    wtr.write_record([
        "id",
        "merchant_id",
        "app_id",
        "channel",
        "channel_order_ref",
        "amount",
        "division_eligible",
    ])?;
    for i in 1..=rows {
        wtr.write_record([
            format!("P{i}").as_str(),
            "M1",
            "APP1",
            "wxpay",
            &format!("42000{i}"),
            &amount.to_string(),
            "true",
        ])?;
    }
    wtr.flush()?;
    Ok(())
}
