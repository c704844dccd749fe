//! Ports to the systems that move money and deliver notices.

use crate::models::{DunningStep, NotificationChannel};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Failure talking to a collaborator. Batch jobs log these and move on.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("Collaborator rejected the request: {0}")]
    Rejected(String),
}

/// Charge against the payment method on file.
#[derive(Debug, Clone, Serialize)]
pub struct ChargeRequest {
    pub organization_id: Uuid,
    pub invoice_id: Uuid,
    pub invoice_number: String,
    pub amount: Decimal,
    pub currency: String,
    /// Stable per invoice and attempt so the gateway can deduplicate.
    pub idempotency_key: String,
}

/// Result reported by the payment gateway.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChargeOutcome {
    pub success: bool,
    pub reference: Option<String>,
    pub message: String,
}

impl ChargeOutcome {
    pub fn approved(reference: impl Into<String>) -> Self {
        Self {
            success: true,
            reference: Some(reference.into()),
            message: "approved".to_string(),
        }
    }

    pub fn declined(message: impl Into<String>) -> Self {
        Self {
            success: false,
            reference: None,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, request: ChargeRequest) -> Result<ChargeOutcome, CollaboratorError>;
}

/// Gateway for accounts that pay out of band. Every automatic retry is declined; the
/// money arrives through `record_payment`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualCollectionGateway;

#[async_trait]
impl PaymentGateway for ManualCollectionGateway {
    async fn charge(&self, request: ChargeRequest) -> Result<ChargeOutcome, CollaboratorError> {
        info!(
            invoice_number = %request.invoice_number,
            amount = %request.amount,
            "No automatic collection configured, declining retry"
        );
        Ok(ChargeOutcome::declined("manual_collection"))
    }
}

/// Notice for one dunning step.
#[derive(Debug, Clone, Serialize)]
pub struct DunningNotice {
    pub dunning_id: Uuid,
    pub organization_id: Uuid,
    pub invoice_id: Uuid,
    pub step_id: Uuid,
    pub day_offset: i64,
    pub channels: Vec<NotificationChannel>,
    pub template: String,
    pub include_payment_link: bool,
    pub amount: Decimal,
    pub currency: String,
}

impl DunningNotice {
    pub fn for_step(
        dunning_id: Uuid,
        organization_id: Uuid,
        invoice_id: Uuid,
        amount: Decimal,
        currency: &str,
        step: &DunningStep,
    ) -> Self {
        Self {
            dunning_id,
            organization_id,
            invoice_id,
            step_id: step.step_id,
            day_offset: step.day_offset,
            channels: step.channels.clone(),
            template: step.template.clone(),
            include_payment_link: step.include_payment_link,
            amount,
            currency: currency.to_string(),
        }
    }
}

/// Send-and-report notification delivery. An error leaves the step unsent.
#[async_trait]
pub trait DunningNotifier: Send + Sync {
    async fn send(&self, notice: DunningNotice) -> Result<(), CollaboratorError>;
}

/// Writes each notice as a structured log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl DunningNotifier for TracingNotifier {
    async fn send(&self, notice: DunningNotice) -> Result<(), CollaboratorError> {
        let channels = notice
            .channels
            .iter()
            .map(NotificationChannel::as_str)
            .collect::<Vec<_>>()
            .join(",");
        info!(
            dunning_id = %notice.dunning_id,
            organization_id = %notice.organization_id,
            day_offset = notice.day_offset,
            template = %notice.template,
            channels = %channels,
            "Dunning notice dispatched"
        );
        Ok(())
    }
}
