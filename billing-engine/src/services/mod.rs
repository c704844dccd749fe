//! Services module for billing-engine.

pub mod clock;
pub mod collaborators;
pub mod database;
pub mod memory;
pub mod metrics;
pub mod orchestrator;
pub mod sequence;
pub mod store;

pub use clock::{Clock, FixedClock, SystemClock};
pub use collaborators::{
    ChargeOutcome, ChargeRequest, CollaboratorError, DunningNotice, DunningNotifier,
    ManualCollectionGateway, PaymentGateway, TracingNotifier,
};
pub use database::Database;
pub use memory::MemoryStore;
pub use metrics::{
    get_metrics, init_metrics, record_batch_run, record_dunning_action, record_error,
    record_invoice_operation, record_payment_amount, record_subscription_operation,
};
pub use orchestrator::{
    BatchFailure, BatchReport, BillingOrchestrator, DailyRunReport, DunningRunReport,
    DunningStatistics, InvoiceStatistics, SubscriptionStatistics,
};
pub use sequence::SequenceGenerator;
pub use store::{BillingStore, UnitOfWork};
