//! Test helper module for billing-engine integration tests.
//!
//! Wires the orchestrator to a store, a hand-driven clock, a scripted payment gateway
//! and a notifier that records every notice. The store is in-memory by default; the
//! PostgreSQL variant runs in its own schema and is skipped when `TEST_DATABASE_URL`
//! is not set.

#![allow(dead_code)]

use async_trait::async_trait;
use billing_engine::config::{BillingConfig, BillingSettings, SchedulerConfig};
use billing_engine::models::{
    BillingCycle, CreateInvoice, CreateLineItem, CreatePlan, CreateSubscription, Invoice,
    LineItemCategory, Plan, Subscription,
};
use billing_engine::services::{
    init_metrics, BillingOrchestrator, BillingStore, ChargeOutcome, ChargeRequest, Clock,
    CollaboratorError, Database, DunningNotice, DunningNotifier, FixedClock, MemoryStore,
    PaymentGateway,
};
use billing_engine::startup::Application;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use service_core::config::Config as CoreConfig;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use uuid::Uuid;

// Counter for unique schema names
static SCHEMA_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Generate a unique schema name for test isolation.
fn unique_schema_name() -> String {
    let counter = SCHEMA_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("test_billing_engine_{}_{}", std::process::id(), counter)
}

/// 2026-03-10 09:00 UTC.
pub fn start_instant() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap()
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Gateway that plays back queued outcomes and declines once the queue is empty.
///
/// `hold_next_charge` parks the next charge until `release` is called, so a test can
/// interleave other commands with an in-flight retry.
#[derive(Default)]
pub struct ScriptedGateway {
    outcomes: Mutex<VecDeque<Result<ChargeOutcome, CollaboratorError>>>,
    requests: Mutex<Vec<ChargeRequest>>,
    hold: Mutex<bool>,
    charging: Notify,
    released: Notify,
}

impl ScriptedGateway {
    pub fn push(&self, outcome: Result<ChargeOutcome, CollaboratorError>) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn requests(&self) -> Vec<ChargeRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn hold_next_charge(&self) {
        *self.hold.lock().unwrap() = true;
    }

    /// Resolves once a held charge has reached the gateway.
    pub async fn wait_until_charging(&self) {
        self.charging.notified().await;
    }

    pub fn release(&self) {
        self.released.notify_one();
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn charge(&self, request: ChargeRequest) -> Result<ChargeOutcome, CollaboratorError> {
        self.requests.lock().unwrap().push(request);
        let held = std::mem::take(&mut *self.hold.lock().unwrap());
        if held {
            self.charging.notify_one();
            self.released.notified().await;
        }
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ChargeOutcome::declined("insufficient_funds")))
    }
}

/// Notifier that records every notice, optionally failing sends.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<DunningNotice>>,
    failing: Mutex<bool>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<DunningNotice> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_days(&self) -> Vec<i64> {
        self.sent().iter().map(|notice| notice.day_offset).collect()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }
}

#[async_trait]
impl DunningNotifier for RecordingNotifier {
    async fn send(&self, notice: DunningNotice) -> Result<(), CollaboratorError> {
        if *self.failing.lock().unwrap() {
            return Err(CollaboratorError::Unavailable("notification relay down".to_string()));
        }
        self.sent.lock().unwrap().push(notice);
        Ok(())
    }
}

/// Orchestrator fixture with handles on every collaborator.
pub struct TestApp {
    pub orchestrator: BillingOrchestrator,
    pub store: Arc<dyn BillingStore>,
    pub clock: Arc<FixedClock>,
    pub gateway: Arc<ScriptedGateway>,
    pub notifier: Arc<RecordingNotifier>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_settings(BillingSettings::default())
    }

    pub fn with_settings(settings: BillingSettings) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), settings)
    }

    /// Fixture backed by a migrated PostgreSQL schema of its own, or `None` when
    /// `TEST_DATABASE_URL` is not set.
    pub async fn postgres() -> Option<Self> {
        let Ok(base_url) = std::env::var("TEST_DATABASE_URL") else {
            eprintln!("TEST_DATABASE_URL not set, skipping PostgreSQL test");
            return None;
        };
        let schema_name = unique_schema_name();

        // Create schema for test isolation
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(2)
            .connect(&base_url)
            .await
            .expect("Failed to connect to test database");
        sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema_name))
            .execute(&pool)
            .await
            .ok();
        sqlx::query(&format!("CREATE SCHEMA {}", schema_name))
            .execute(&pool)
            .await
            .expect("Failed to create test schema");
        pool.close().await;

        // Use ? or & depending on whether URL already has query parameters
        let separator = if base_url.contains('?') { "&" } else { "?" };
        let db_url_with_schema = format!(
            "{}{}options=-c search_path%3D{}",
            base_url, separator, schema_name
        );

        let db = Database::new(&db_url_with_schema, 10, 1)
            .await
            .expect("Failed to create test database");
        db.run_migrations()
            .await
            .expect("Failed to run migrations");

        Some(Self::with_store(Arc::new(db), BillingSettings::default()))
    }

    pub fn with_store(store: Arc<dyn BillingStore>, settings: BillingSettings) -> Self {
        init_metrics();

        let clock = Arc::new(FixedClock::new(start_instant()));
        let gateway = Arc::new(ScriptedGateway::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let orchestrator = BillingOrchestrator::new(
            store.clone(),
            clock.clone(),
            gateway.clone(),
            notifier.clone(),
            settings,
        );

        Self {
            orchestrator,
            store,
            clock,
            gateway,
            notifier,
        }
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    pub async fn create_plan(&self, monthly_price: Decimal) -> Plan {
        self.orchestrator
            .create_plan(CreatePlan {
                name: "Growth".to_string(),
                description: Some("Growth tier".to_string()),
                monthly_price,
                annual_price: monthly_price * dec!(10),
                currency: None,
            })
            .await
            .expect("Failed to create plan")
    }

    pub fn subscription_input(&self, organization_id: Uuid, plan: &Plan) -> CreateSubscription {
        CreateSubscription {
            organization_id,
            plan_id: plan.plan_id,
            billing_cycle: BillingCycle::Monthly,
            agreed_price: None,
            contract_months: 12,
            discount_percentage: None,
            auto_renew: false,
            sales_rep_id: None,
            start_date: None,
        }
    }

    /// Active monthly subscription on a 1000/month plan for a fresh organization.
    pub async fn active_subscription(&self) -> Subscription {
        let plan = self.create_plan(dec!(1000)).await;
        self.orchestrator
            .create_subscription(self.subscription_input(Uuid::new_v4(), &plan))
            .await
            .expect("Failed to create subscription")
    }

    pub fn invoice_input(
        &self,
        organization_id: Uuid,
        subscription_id: Option<Uuid>,
        unit_price: Decimal,
    ) -> CreateInvoice {
        CreateInvoice {
            organization_id,
            subscription_id,
            currency: None,
            line_items: vec![CreateLineItem {
                description: "Platform subscription".to_string(),
                quantity: dec!(1),
                unit_price,
                category: LineItemCategory::Subscription,
            }],
            tax_rate: Some(dec!(15)),
            notes: None,
            billing_period_start: None,
            billing_period_end: None,
            sales_rep_id: None,
        }
    }

    /// Issued 1150 invoice (1000 + 15% tax) with 30-day terms for the subscription.
    pub async fn issued_invoice(&self, subscription: &Subscription) -> Invoice {
        let invoice = self
            .orchestrator
            .create_invoice(self.invoice_input(
                subscription.organization_id,
                Some(subscription.subscription_id),
                dec!(1000),
            ))
            .await
            .expect("Failed to create invoice");
        self.orchestrator
            .issue_invoice(invoice.invoice_id, self.today(), 30)
            .await
            .expect("Failed to issue invoice")
    }
}

/// Application serving the operational endpoints on a random port.
pub struct TestServer {
    pub http_address: String,
    pub http_port: u16,
}

impl TestServer {
    pub async fn spawn() -> Self {
        init_metrics();

        let config = BillingConfig {
            common: CoreConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            service_name: "billing-engine-test".to_string(),
            service_version: "0.1.0".to_string(),
            log_level: "warn".to_string(),
            otlp_endpoint: None,
            database: None,
            billing: BillingSettings::default(),
            scheduler: SchedulerConfig::default(),
        };

        let app = Application::build(config)
            .await
            .expect("Failed to build test application");
        let http_port = app.http_port();
        let http_address = format!("http://127.0.0.1:{}", http_port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        let client = reqwest::Client::new();
        let health_url = format!("{}/health", http_address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }

        TestServer {
            http_address,
            http_port,
        }
    }
}
