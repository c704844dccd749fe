//! PostgreSQL store for billing-engine.

use crate::error::{BillingError, BillingResult};
use crate::models::{
    DunningSequence, DunningStep, Invoice, LineItem, ListDunningFilter, ListInvoicesFilter,
    ListSubscriptionsFilter, PaymentRecord, Plan, RetryAttempt, SequenceRow, Subscription,
};
use crate::services::metrics::STORE_QUERY_DURATION;
use crate::services::store::{BillingStore, UnitOfWork};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, Transaction};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const PLAN_COLUMNS: &str =
    "plan_id, name, description, monthly_price, annual_price, currency, is_active, created_utc, version";

const INVOICE_COLUMNS: &str = "invoice_id, invoice_number, organization_id, subscription_id, status, currency, line_items, tax_rate, subtotal, tax_amount, total, paid_amount, payments, issue_date, due_date, paid_date, billing_period_start, billing_period_end, notes, sales_rep_id, created_utc, updated_utc, version";

const SUBSCRIPTION_COLUMNS: &str = "subscription_id, organization_id, plan_id, status, billing_cycle, start_date, end_date, trial_end_date, agreed_price, currency, discount_percentage, auto_renew, sales_rep_id, contract_months, suspended_at, cancelled_at, cancellation_reason, created_utc, updated_utc, version";

const DUNNING_COLUMNS: &str = "dunning_id, organization_id, subscription_id, invoice_id, amount, currency, status, steps, retry_days, suspension_day, deactivation_day, retry_count, retry_attempts, last_retry_at, last_retry_result, csm_escalated, csm_escalated_at, csm_id, failure_reason, notes, failed_at, suspended_at, deactivated_at, recovered_at, recovery_method, resolved_at, created_utc, updated_utc, version";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "billing-engine"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn write_plan(tx: &mut Transaction<'_, Postgres>, plan: &Plan) -> BillingResult<()> {
        if plan.version == 1 {
            sqlx::query(
                r#"
                INSERT INTO billing_plans (plan_id, name, description, monthly_price, annual_price, currency, is_active, created_utc, version)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 1)
                "#,
            )
            .bind(plan.plan_id)
            .bind(&plan.name)
            .bind(&plan.description)
            .bind(plan.monthly_price)
            .bind(plan.annual_price)
            .bind(&plan.currency)
            .bind(plan.is_active)
            .bind(plan.created_utc)
            .execute(&mut **tx)
            .await?;
            return Ok(());
        }

        let result = sqlx::query(
            r#"
            UPDATE billing_plans SET
                name = $3,
                description = $4,
                monthly_price = $5,
                annual_price = $6,
                currency = $7,
                is_active = $8,
                version = $2
            WHERE plan_id = $1 AND version = $2 - 1
            "#,
        )
        .bind(plan.plan_id)
        .bind(plan.version)
        .bind(&plan.name)
        .bind(&plan.description)
        .bind(plan.monthly_price)
        .bind(plan.annual_price)
        .bind(&plan.currency)
        .bind(plan.is_active)
        .execute(&mut **tx)
        .await?;
        ensure_current(result.rows_affected(), "Plan", plan.plan_id, plan.version)
    }

    async fn write_invoice(tx: &mut Transaction<'_, Postgres>, invoice: &Invoice) -> BillingResult<()> {
        if invoice.version == 1 {
            sqlx::query(
                r#"
                INSERT INTO invoices (invoice_id, invoice_number, organization_id, subscription_id, status, currency, line_items, tax_rate, subtotal, tax_amount, total, paid_amount, payments, issue_date, due_date, paid_date, billing_period_start, billing_period_end, notes, sales_rep_id, created_utc, updated_utc, version)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, 1)
                "#,
            )
            .bind(invoice.invoice_id)
            .bind(&invoice.invoice_number)
            .bind(invoice.organization_id)
            .bind(invoice.subscription_id)
            .bind(invoice.status.as_str())
            .bind(&invoice.currency)
            .bind(Json(&invoice.line_items))
            .bind(invoice.tax_rate)
            .bind(invoice.subtotal)
            .bind(invoice.tax_amount)
            .bind(invoice.total)
            .bind(invoice.paid_amount)
            .bind(Json(&invoice.payments))
            .bind(invoice.issue_date)
            .bind(invoice.due_date)
            .bind(invoice.paid_date)
            .bind(invoice.billing_period_start)
            .bind(invoice.billing_period_end)
            .bind(&invoice.notes)
            .bind(invoice.sales_rep_id)
            .bind(invoice.created_utc)
            .bind(invoice.updated_utc)
            .execute(&mut **tx)
            .await?;
            return Ok(());
        }

        let result = sqlx::query(
            r#"
            UPDATE invoices SET
                status = $3,
                line_items = $4,
                tax_rate = $5,
                subtotal = $6,
                tax_amount = $7,
                total = $8,
                paid_amount = $9,
                payments = $10,
                issue_date = $11,
                due_date = $12,
                paid_date = $13,
                notes = $14,
                updated_utc = $15,
                version = $2
            WHERE invoice_id = $1 AND version = $2 - 1
            "#,
        )
        .bind(invoice.invoice_id)
        .bind(invoice.version)
        .bind(invoice.status.as_str())
        .bind(Json(&invoice.line_items))
        .bind(invoice.tax_rate)
        .bind(invoice.subtotal)
        .bind(invoice.tax_amount)
        .bind(invoice.total)
        .bind(invoice.paid_amount)
        .bind(Json(&invoice.payments))
        .bind(invoice.issue_date)
        .bind(invoice.due_date)
        .bind(invoice.paid_date)
        .bind(&invoice.notes)
        .bind(invoice.updated_utc)
        .execute(&mut **tx)
        .await?;
        ensure_current(result.rows_affected(), "Invoice", invoice.invoice_id, invoice.version)
    }

    async fn write_subscription(
        tx: &mut Transaction<'_, Postgres>,
        subscription: &Subscription,
    ) -> BillingResult<()> {
        let contract_months = i32::try_from(subscription.contract_months)
            .map_err(|_| BillingError::validation("Contract months out of range"))?;

        if subscription.version == 1 {
            sqlx::query(
                r#"
                INSERT INTO subscriptions (subscription_id, organization_id, plan_id, status, billing_cycle, start_date, end_date, trial_end_date, agreed_price, currency, discount_percentage, auto_renew, sales_rep_id, contract_months, suspended_at, cancelled_at, cancellation_reason, created_utc, updated_utc, version)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, 1)
                "#,
            )
            .bind(subscription.subscription_id)
            .bind(subscription.organization_id)
            .bind(subscription.plan_id)
            .bind(subscription.status.as_str())
            .bind(subscription.billing_cycle.as_str())
            .bind(subscription.start_date)
            .bind(subscription.end_date)
            .bind(subscription.trial_end_date)
            .bind(subscription.agreed_price)
            .bind(&subscription.currency)
            .bind(subscription.discount_percentage)
            .bind(subscription.auto_renew)
            .bind(subscription.sales_rep_id)
            .bind(contract_months)
            .bind(subscription.suspended_at)
            .bind(subscription.cancelled_at)
            .bind(&subscription.cancellation_reason)
            .bind(subscription.created_utc)
            .bind(subscription.updated_utc)
            .execute(&mut **tx)
            .await?;
            return Ok(());
        }

        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET
                plan_id = $3,
                status = $4,
                start_date = $5,
                end_date = $6,
                trial_end_date = $7,
                agreed_price = $8,
                currency = $9,
                discount_percentage = $10,
                auto_renew = $11,
                contract_months = $12,
                suspended_at = $13,
                cancelled_at = $14,
                cancellation_reason = $15,
                updated_utc = $16,
                version = $2
            WHERE subscription_id = $1 AND version = $2 - 1
            "#,
        )
        .bind(subscription.subscription_id)
        .bind(subscription.version)
        .bind(subscription.plan_id)
        .bind(subscription.status.as_str())
        .bind(subscription.start_date)
        .bind(subscription.end_date)
        .bind(subscription.trial_end_date)
        .bind(subscription.agreed_price)
        .bind(&subscription.currency)
        .bind(subscription.discount_percentage)
        .bind(subscription.auto_renew)
        .bind(contract_months)
        .bind(subscription.suspended_at)
        .bind(subscription.cancelled_at)
        .bind(&subscription.cancellation_reason)
        .bind(subscription.updated_utc)
        .execute(&mut **tx)
        .await?;
        ensure_current(
            result.rows_affected(),
            "Subscription",
            subscription.subscription_id,
            subscription.version,
        )
    }

    async fn write_dunning(
        tx: &mut Transaction<'_, Postgres>,
        sequence: &DunningSequence,
    ) -> BillingResult<()> {
        if sequence.version == 1 {
            sqlx::query(
                r#"
                INSERT INTO dunning_sequences (dunning_id, organization_id, subscription_id, invoice_id, amount, currency, status, steps, retry_days, suspension_day, deactivation_day, retry_count, retry_attempts, last_retry_at, last_retry_result, csm_escalated, csm_escalated_at, csm_id, failure_reason, notes, failed_at, suspended_at, deactivated_at, recovered_at, recovery_method, resolved_at, created_utc, updated_utc, version)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, 1)
                "#,
            )
            .bind(sequence.dunning_id)
            .bind(sequence.organization_id)
            .bind(sequence.subscription_id)
            .bind(sequence.invoice_id)
            .bind(sequence.amount)
            .bind(&sequence.currency)
            .bind(sequence.status.as_str())
            .bind(Json(&sequence.steps))
            .bind(Json(&sequence.retry_days))
            .bind(sequence.suspension_day)
            .bind(sequence.deactivation_day)
            .bind(sequence.retry_count as i32)
            .bind(Json(&sequence.retry_attempts))
            .bind(sequence.last_retry_at)
            .bind(&sequence.last_retry_result)
            .bind(sequence.csm_escalated)
            .bind(sequence.csm_escalated_at)
            .bind(sequence.csm_id)
            .bind(&sequence.failure_reason)
            .bind(&sequence.notes)
            .bind(sequence.failed_at)
            .bind(sequence.suspended_at)
            .bind(sequence.deactivated_at)
            .bind(sequence.recovered_at)
            .bind(&sequence.recovery_method)
            .bind(sequence.resolved_at)
            .bind(sequence.created_utc)
            .bind(sequence.updated_utc)
            .execute(&mut **tx)
            .await?;
            return Ok(());
        }

        let result = sqlx::query(
            r#"
            UPDATE dunning_sequences SET
                status = $3,
                steps = $4,
                retry_count = $5,
                retry_attempts = $6,
                last_retry_at = $7,
                last_retry_result = $8,
                csm_escalated = $9,
                csm_escalated_at = $10,
                csm_id = $11,
                notes = $12,
                suspended_at = $13,
                deactivated_at = $14,
                recovered_at = $15,
                recovery_method = $16,
                resolved_at = $17,
                updated_utc = $18,
                version = $2
            WHERE dunning_id = $1 AND version = $2 - 1
            "#,
        )
        .bind(sequence.dunning_id)
        .bind(sequence.version)
        .bind(sequence.status.as_str())
        .bind(Json(&sequence.steps))
        .bind(sequence.retry_count as i32)
        .bind(Json(&sequence.retry_attempts))
        .bind(sequence.last_retry_at)
        .bind(&sequence.last_retry_result)
        .bind(sequence.csm_escalated)
        .bind(sequence.csm_escalated_at)
        .bind(sequence.csm_id)
        .bind(&sequence.notes)
        .bind(sequence.suspended_at)
        .bind(sequence.deactivated_at)
        .bind(sequence.recovered_at)
        .bind(&sequence.recovery_method)
        .bind(sequence.resolved_at)
        .bind(sequence.updated_utc)
        .execute(&mut **tx)
        .await?;
        ensure_current(
            result.rows_affected(),
            "Dunning sequence",
            sequence.dunning_id,
            sequence.version,
        )
    }
}

/// An update that matched no row lost the race against another writer, or targets a
/// row that no longer exists.
fn ensure_current(rows_affected: u64, entity: &str, id: Uuid, staged_version: i64) -> BillingResult<()> {
    if rows_affected == 0 {
        return Err(BillingError::conflict(format!(
            "{} {} changed since it was read (expected stored version {})",
            entity,
            id,
            staged_version - 1
        )));
    }
    Ok(())
}

#[async_trait]
impl BillingStore for Database {
    /// Check database health.
    #[instrument(skip(self))]
    async fn health_check(&self) -> BillingResult<()> {
        let timer = STORE_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1").execute(&self.pool).await?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn allocate_invoice_sequence(&self, year: i32) -> BillingResult<SequenceRow> {
        let timer = STORE_QUERY_DURATION
            .with_label_values(&["allocate_invoice_sequence"])
            .start_timer();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO invoice_sequences (sequence_id, year, last_value) VALUES (1, $1, 0) ON CONFLICT (sequence_id) DO NOTHING",
        )
        .bind(year)
        .execute(&mut *tx)
        .await?;

        // Row lock serializes every allocation until this transaction ends
        let (current_year, last_value) = sqlx::query_as::<_, (i32, i64)>(
            "SELECT year, last_value FROM invoice_sequences WHERE sequence_id = 1 FOR UPDATE",
        )
        .fetch_one(&mut *tx)
        .await?;

        let mut row = SequenceRow {
            year: current_year,
            last_value,
        };
        row.advance(year)?;

        sqlx::query("UPDATE invoice_sequences SET year = $1, last_value = $2 WHERE sequence_id = 1")
            .bind(row.year)
            .bind(row.last_value)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        timer.observe_duration();
        Ok(row)
    }

    #[instrument(skip(self, unit), fields(
        invoices = unit.invoices.len(),
        subscriptions = unit.subscriptions.len(),
        dunning = unit.dunning.len()
    ))]
    async fn commit(&self, unit: UnitOfWork) -> BillingResult<()> {
        if unit.is_empty() {
            return Ok(());
        }
        let timer = STORE_QUERY_DURATION
            .with_label_values(&["commit"])
            .start_timer();

        let mut tx = self.pool.begin().await?;

        for invoice_id in &unit.deleted_invoices {
            sqlx::query("DELETE FROM invoices WHERE invoice_id = $1 AND status = 'draft'")
                .bind(invoice_id)
                .execute(&mut *tx)
                .await?;
        }
        for plan in &unit.plans {
            Self::write_plan(&mut tx, plan).await?;
        }
        for invoice in &unit.invoices {
            Self::write_invoice(&mut tx, invoice).await?;
        }
        for subscription in &unit.subscriptions {
            Self::write_subscription(&mut tx, subscription).await?;
        }
        for sequence in &unit.dunning {
            Self::write_dunning(&mut tx, sequence).await?;
        }

        tx.commit().await?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>> {
        let row = sqlx::query_as::<_, PlanRow>(&format!(
            "SELECT {} FROM billing_plans WHERE plan_id = $1",
            PLAN_COLUMNS
        ))
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Plan::from))
    }

    #[instrument(skip(self))]
    async fn list_plans(&self, include_inactive: bool) -> BillingResult<Vec<Plan>> {
        let rows = sqlx::query_as::<_, PlanRow>(&format!(
            "SELECT {} FROM billing_plans WHERE ($1 OR is_active) ORDER BY name",
            PLAN_COLUMNS
        ))
        .bind(include_inactive)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Plan::from).collect())
    }

    #[instrument(skip(self))]
    async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<Option<Invoice>> {
        let timer = STORE_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let row = sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {} FROM invoices WHERE invoice_id = $1",
            INVOICE_COLUMNS
        ))
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;

        timer.observe_duration();
        row.map(Invoice::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn get_invoice_by_number(&self, invoice_number: &str) -> BillingResult<Option<Invoice>> {
        let row = sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {} FROM invoices WHERE invoice_number = $1",
            INVOICE_COLUMNS
        ))
        .bind(invoice_number)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Invoice::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn find_invoice_for_period(
        &self,
        subscription_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> BillingResult<Option<Invoice>> {
        let row = sqlx::query_as::<_, InvoiceRow>(&format!(
            r#"
            SELECT {} FROM invoices
            WHERE subscription_id = $1
              AND billing_period_start = $2
              AND billing_period_end = $3
              AND status <> 'cancelled'
            LIMIT 1
            "#,
            INVOICE_COLUMNS
        ))
        .bind(subscription_id)
        .bind(period_start)
        .bind(period_end)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Invoice::try_from).transpose()
    }

    #[instrument(skip(self, filter))]
    async fn list_invoices(&self, filter: &ListInvoicesFilter) -> BillingResult<Vec<Invoice>> {
        let timer = STORE_QUERY_DURATION
            .with_label_values(&["list_invoices"])
            .start_timer();

        let statuses: Vec<String> = filter
            .statuses
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let rows = sqlx::query_as::<_, InvoiceRow>(&format!(
            r#"
            SELECT {} FROM invoices
            WHERE ($1::uuid IS NULL OR organization_id = $1)
              AND ($2::uuid IS NULL OR subscription_id = $2)
              AND (cardinality($3::varchar[]) = 0 OR status = ANY($3))
              AND ($4::date IS NULL OR due_date < $4)
            ORDER BY created_utc, invoice_number
            "#,
            INVOICE_COLUMNS
        ))
        .bind(filter.organization_id)
        .bind(filter.subscription_id)
        .bind(&statuses)
        .bind(filter.due_before)
        .fetch_all(&self.pool)
        .await?;

        timer.observe_duration();
        rows.into_iter().map(Invoice::try_from).collect()
    }

    #[instrument(skip(self))]
    async fn get_subscription(&self, subscription_id: Uuid) -> BillingResult<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {} FROM subscriptions WHERE subscription_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Subscription::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn find_open_subscription(
        &self,
        organization_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE organization_id = $1 AND status IN ('trial', 'active', 'suspended')
            LIMIT 1
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Subscription::try_from).transpose()
    }

    #[instrument(skip(self, filter))]
    async fn list_subscriptions(
        &self,
        filter: &ListSubscriptionsFilter,
    ) -> BillingResult<Vec<Subscription>> {
        let timer = STORE_QUERY_DURATION
            .with_label_values(&["list_subscriptions"])
            .start_timer();

        let statuses: Vec<String> = filter
            .statuses
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE ($1::uuid IS NULL OR organization_id = $1)
              AND (cardinality($2::varchar[]) = 0 OR status = ANY($2))
              AND ($3::uuid IS NULL OR plan_id = $3)
            ORDER BY created_utc, subscription_id
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(filter.organization_id)
        .bind(&statuses)
        .bind(filter.plan_id)
        .fetch_all(&self.pool)
        .await?;

        timer.observe_duration();
        rows.into_iter().map(Subscription::try_from).collect()
    }

    #[instrument(skip(self))]
    async fn get_dunning(&self, dunning_id: Uuid) -> BillingResult<Option<DunningSequence>> {
        let row = sqlx::query_as::<_, DunningRow>(&format!(
            "SELECT {} FROM dunning_sequences WHERE dunning_id = $1",
            DUNNING_COLUMNS
        ))
        .bind(dunning_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(DunningSequence::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn find_open_dunning_for_invoice(
        &self,
        invoice_id: Uuid,
    ) -> BillingResult<Option<DunningSequence>> {
        let row = sqlx::query_as::<_, DunningRow>(&format!(
            r#"
            SELECT {} FROM dunning_sequences
            WHERE invoice_id = $1 AND status IN ('active', 'suspended')
            LIMIT 1
            "#,
            DUNNING_COLUMNS
        ))
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(DunningSequence::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn find_open_dunning_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Option<DunningSequence>> {
        let row = sqlx::query_as::<_, DunningRow>(&format!(
            r#"
            SELECT {} FROM dunning_sequences
            WHERE subscription_id = $1 AND status IN ('active', 'suspended')
            LIMIT 1
            "#,
            DUNNING_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(DunningSequence::try_from).transpose()
    }

    #[instrument(skip(self, filter))]
    async fn list_dunning(&self, filter: &ListDunningFilter) -> BillingResult<Vec<DunningSequence>> {
        let timer = STORE_QUERY_DURATION
            .with_label_values(&["list_dunning"])
            .start_timer();

        let statuses: Vec<String> = filter
            .statuses
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let rows = sqlx::query_as::<_, DunningRow>(&format!(
            r#"
            SELECT {} FROM dunning_sequences
            WHERE ($1::uuid IS NULL OR organization_id = $1)
              AND ($2::uuid IS NULL OR subscription_id = $2)
              AND ($3::uuid IS NULL OR invoice_id = $3)
              AND (cardinality($4::varchar[]) = 0 OR status = ANY($4))
              AND ($5::boolean IS NULL OR csm_escalated = $5)
            ORDER BY failed_at, dunning_id
            "#,
            DUNNING_COLUMNS
        ))
        .bind(filter.organization_id)
        .bind(filter.subscription_id)
        .bind(filter.invoice_id)
        .bind(&statuses)
        .bind(filter.csm_escalated)
        .fetch_all(&self.pool)
        .await?;

        timer.observe_duration();
        rows.into_iter().map(DunningSequence::try_from).collect()
    }
}

// =========================================================================
// Row mapping
// =========================================================================

#[derive(FromRow)]
struct PlanRow {
    plan_id: Uuid,
    name: String,
    description: Option<String>,
    monthly_price: Decimal,
    annual_price: Decimal,
    currency: String,
    is_active: bool,
    created_utc: DateTime<Utc>,
    version: i64,
}

impl From<PlanRow> for Plan {
    fn from(row: PlanRow) -> Self {
        Self {
            plan_id: row.plan_id,
            name: row.name,
            description: row.description,
            monthly_price: row.monthly_price,
            annual_price: row.annual_price,
            currency: row.currency,
            is_active: row.is_active,
            created_utc: row.created_utc,
            version: row.version,
        }
    }
}

#[derive(FromRow)]
struct InvoiceRow {
    invoice_id: Uuid,
    invoice_number: String,
    organization_id: Uuid,
    subscription_id: Option<Uuid>,
    status: String,
    currency: String,
    line_items: Json<Vec<LineItem>>,
    tax_rate: Decimal,
    subtotal: Decimal,
    tax_amount: Decimal,
    total: Decimal,
    paid_amount: Decimal,
    payments: Json<Vec<PaymentRecord>>,
    issue_date: Option<NaiveDate>,
    due_date: Option<NaiveDate>,
    paid_date: Option<NaiveDate>,
    billing_period_start: Option<NaiveDate>,
    billing_period_end: Option<NaiveDate>,
    notes: Option<String>,
    sales_rep_id: Option<Uuid>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
    version: i64,
}

impl TryFrom<InvoiceRow> for Invoice {
    type Error = BillingError;

    fn try_from(row: InvoiceRow) -> Result<Self, Self::Error> {
        Ok(Self {
            invoice_id: row.invoice_id,
            invoice_number: row.invoice_number,
            organization_id: row.organization_id,
            subscription_id: row.subscription_id,
            status: row.status.parse()?,
            currency: row.currency,
            line_items: row.line_items.0,
            tax_rate: row.tax_rate,
            subtotal: row.subtotal,
            tax_amount: row.tax_amount,
            total: row.total,
            paid_amount: row.paid_amount,
            payments: row.payments.0,
            issue_date: row.issue_date,
            due_date: row.due_date,
            paid_date: row.paid_date,
            billing_period_start: row.billing_period_start,
            billing_period_end: row.billing_period_end,
            notes: row.notes,
            sales_rep_id: row.sales_rep_id,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
            version: row.version,
        })
    }
}

#[derive(FromRow)]
struct SubscriptionRow {
    subscription_id: Uuid,
    organization_id: Uuid,
    plan_id: Uuid,
    status: String,
    billing_cycle: String,
    start_date: NaiveDate,
    end_date: NaiveDate,
    trial_end_date: Option<NaiveDate>,
    agreed_price: Decimal,
    currency: String,
    discount_percentage: Option<Decimal>,
    auto_renew: bool,
    sales_rep_id: Option<Uuid>,
    contract_months: i32,
    suspended_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    cancellation_reason: Option<String>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
    version: i64,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            subscription_id: row.subscription_id,
            organization_id: row.organization_id,
            plan_id: row.plan_id,
            status: row.status.parse()?,
            billing_cycle: row.billing_cycle.parse()?,
            start_date: row.start_date,
            end_date: row.end_date,
            trial_end_date: row.trial_end_date,
            agreed_price: row.agreed_price,
            currency: row.currency,
            discount_percentage: row.discount_percentage,
            auto_renew: row.auto_renew,
            sales_rep_id: row.sales_rep_id,
            contract_months: u32::try_from(row.contract_months).map_err(|_| {
                BillingError::Storage(anyhow::anyhow!(
                    "Negative contract months on subscription {}",
                    row.subscription_id
                ))
            })?,
            suspended_at: row.suspended_at,
            cancelled_at: row.cancelled_at,
            cancellation_reason: row.cancellation_reason,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
            version: row.version,
        })
    }
}

#[derive(FromRow)]
struct DunningRow {
    dunning_id: Uuid,
    organization_id: Uuid,
    subscription_id: Uuid,
    invoice_id: Uuid,
    amount: Decimal,
    currency: String,
    status: String,
    steps: Json<Vec<DunningStep>>,
    retry_days: Json<Vec<i64>>,
    suspension_day: i64,
    deactivation_day: i64,
    retry_count: i32,
    retry_attempts: Json<Vec<RetryAttempt>>,
    last_retry_at: Option<DateTime<Utc>>,
    last_retry_result: Option<String>,
    csm_escalated: bool,
    csm_escalated_at: Option<DateTime<Utc>>,
    csm_id: Option<Uuid>,
    failure_reason: Option<String>,
    notes: Option<String>,
    failed_at: DateTime<Utc>,
    suspended_at: Option<DateTime<Utc>>,
    deactivated_at: Option<DateTime<Utc>>,
    recovered_at: Option<DateTime<Utc>>,
    recovery_method: Option<String>,
    resolved_at: Option<DateTime<Utc>>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
    version: i64,
}

impl TryFrom<DunningRow> for DunningSequence {
    type Error = BillingError;

    fn try_from(row: DunningRow) -> Result<Self, Self::Error> {
        let mut steps = row.steps.0;
        steps.sort_by_key(|step| step.day_offset);
        Ok(Self {
            dunning_id: row.dunning_id,
            organization_id: row.organization_id,
            subscription_id: row.subscription_id,
            invoice_id: row.invoice_id,
            amount: row.amount,
            currency: row.currency,
            status: row.status.parse()?,
            steps,
            retry_days: row.retry_days.0,
            suspension_day: row.suspension_day,
            deactivation_day: row.deactivation_day,
            retry_count: u32::try_from(row.retry_count).unwrap_or(0),
            retry_attempts: row.retry_attempts.0,
            last_retry_at: row.last_retry_at,
            last_retry_result: row.last_retry_result,
            csm_escalated: row.csm_escalated,
            csm_escalated_at: row.csm_escalated_at,
            csm_id: row.csm_id,
            failure_reason: row.failure_reason,
            notes: row.notes,
            failed_at: row.failed_at,
            suspended_at: row.suspended_at,
            deactivated_at: row.deactivated_at,
            recovered_at: row.recovered_at,
            recovery_method: row.recovery_method,
            resolved_at: row.resolved_at,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
            version: row.version,
        })
    }
}
