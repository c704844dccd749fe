//! Dunning (failed-payment recovery) aggregate.
//!
//! A sequence is opened when a payment against an issued invoice fails and is walked
//! forward one day at a time by the scheduled dunning job. Every action is gated on the
//! sequence state and the number of calendar days since the failure, so re-running the
//! job on the same day changes nothing.

use crate::error::{BillingError, BillingResult};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

const ENTITY: &str = "dunning sequence";

/// Dunning sequence status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DunningStatus {
    Active,
    Suspended,
    Recovered,
    Deactivated,
    Cancelled,
}

impl DunningStatus {
    pub const ALL: [DunningStatus; 5] = [
        DunningStatus::Active,
        DunningStatus::Suspended,
        DunningStatus::Recovered,
        DunningStatus::Deactivated,
        DunningStatus::Cancelled,
    ];

    pub const OPEN: [DunningStatus; 2] = [DunningStatus::Active, DunningStatus::Suspended];

    pub fn as_str(&self) -> &'static str {
        match self {
            DunningStatus::Active => "active",
            DunningStatus::Suspended => "suspended",
            DunningStatus::Recovered => "recovered",
            DunningStatus::Deactivated => "deactivated",
            DunningStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DunningStatus::Recovered | DunningStatus::Deactivated | DunningStatus::Cancelled
        )
    }
}

impl fmt::Display for DunningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DunningStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DunningStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| BillingError::validation(format!("Unknown dunning status: {}", s)))
    }
}

/// Channel a dunning notice goes out on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationChannel {
    Email,
    Sms,
    Push,
    InApp,
}

impl NotificationChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationChannel::Email => "EMAIL",
            NotificationChannel::Sms => "SMS",
            NotificationChannel::Push => "PUSH",
            NotificationChannel::InApp => "IN_APP",
        }
    }
}

/// Step template a new sequence copies its steps from.
#[derive(Debug, Clone, PartialEq)]
pub struct StepTemplate {
    pub day_offset: i64,
    pub channels: Vec<NotificationChannel>,
    pub template: String,
    pub description: String,
    pub include_payment_link: bool,
    pub escalate_to_csm: bool,
}

/// Schedule and thresholds applied to new sequences.
#[derive(Debug, Clone, PartialEq)]
pub struct DunningPolicy {
    pub steps: Vec<StepTemplate>,
    pub retry_days: Vec<i64>,
    pub suspension_day: i64,
    pub deactivation_day: i64,
}

impl DunningPolicy {
    pub const DEFAULT_STEP_DAYS: [i64; 6] = [1, 3, 7, 14, 21, 30];
    pub const DEFAULT_ESCALATION_DAYS: [i64; 2] = [7, 21];
    pub const DEFAULT_RETRY_DAYS: [i64; 3] = [1, 3, 7];
    pub const DEFAULT_SUSPENSION_DAY: i64 = 14;
    pub const DEFAULT_DEACTIVATION_DAY: i64 = 30;

    /// Build a policy from day offsets. Step wording depends on where each offset
    /// falls relative to the suspension and deactivation thresholds.
    pub fn from_offsets(
        step_days: &[i64],
        escalation_days: &[i64],
        retry_days: &[i64],
        suspension_day: i64,
        deactivation_day: i64,
    ) -> BillingResult<Self> {
        ensure_ascending("step", step_days)?;
        ensure_ascending("retry", retry_days)?;
        if let Some(day) = escalation_days.iter().find(|d| !step_days.contains(d)) {
            return Err(BillingError::validation(format!(
                "Escalation day {} has no matching step",
                day
            )));
        }
        if suspension_day <= 0 {
            return Err(BillingError::validation("Suspension day must be positive"));
        }
        if deactivation_day <= suspension_day {
            return Err(BillingError::validation(format!(
                "Deactivation day {} must be after suspension day {}",
                deactivation_day, suspension_day
            )));
        }

        let steps = step_days
            .iter()
            .map(|&day| {
                step_template(
                    day,
                    escalation_days.contains(&day),
                    suspension_day,
                    deactivation_day,
                )
            })
            .collect();

        Ok(Self {
            steps,
            retry_days: retry_days.to_vec(),
            suspension_day,
            deactivation_day,
        })
    }
}

impl Default for DunningPolicy {
    fn default() -> Self {
        Self {
            steps: Self::DEFAULT_STEP_DAYS
                .iter()
                .map(|&day| {
                    step_template(
                        day,
                        Self::DEFAULT_ESCALATION_DAYS.contains(&day),
                        Self::DEFAULT_SUSPENSION_DAY,
                        Self::DEFAULT_DEACTIVATION_DAY,
                    )
                })
                .collect(),
            retry_days: Self::DEFAULT_RETRY_DAYS.to_vec(),
            suspension_day: Self::DEFAULT_SUSPENSION_DAY,
            deactivation_day: Self::DEFAULT_DEACTIVATION_DAY,
        }
    }
}

fn ensure_ascending(label: &str, days: &[i64]) -> BillingResult<()> {
    if days.iter().any(|d| *d < 0) {
        return Err(BillingError::validation(format!(
            "Dunning {} days cannot be negative",
            label
        )));
    }
    if days.windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err(BillingError::validation(format!(
            "Dunning {} days must be strictly ascending: {:?}",
            label, days
        )));
    }
    Ok(())
}

fn step_template(
    day: i64,
    escalate_to_csm: bool,
    suspension_day: i64,
    deactivation_day: i64,
) -> StepTemplate {
    use NotificationChannel::*;

    let (channels, template, description, include_payment_link) = if day >= deactivation_day {
        (
            vec![Email],
            "account_deactivated".to_string(),
            "Email: Account deactivated for non-payment".to_string(),
            false,
        )
    } else if day > suspension_day {
        (
            vec![Email],
            "deactivation_warning".to_string(),
            "Email: Account will be deactivated unless payment is made".to_string(),
            true,
        )
    } else if day == suspension_day {
        (
            vec![Email, Sms],
            "subscription_suspended".to_string(),
            "Email + SMS: Subscription suspended due to non-payment".to_string(),
            true,
        )
    } else if day <= 1 {
        (
            vec![Email, Sms],
            format!("payment_failed_day{}", day),
            "Email + SMS: Payment failed, please update card".to_string(),
            true,
        )
    } else if escalate_to_csm {
        (
            vec![Push, Email],
            format!("payment_failed_day{}", day),
            "Push + Email: Final notice before suspension".to_string(),
            true,
        )
    } else {
        (
            vec![Email],
            format!("payment_failed_day{}", day),
            "Email: Action required - update payment method".to_string(),
            true,
        )
    };

    StepTemplate {
        day_offset: day,
        channels,
        template,
        description,
        include_payment_link,
        escalate_to_csm,
    }
}

/// One scheduled notification in a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DunningStep {
    pub step_id: Uuid,
    pub day_offset: i64,
    pub channels: Vec<NotificationChannel>,
    pub template: String,
    pub description: String,
    pub include_payment_link: bool,
    pub escalate_to_csm: bool,
    pub sent_at: Option<DateTime<Utc>>,
    pub clicked_at: Option<DateTime<Utc>>,
    /// Set on deactivation for earlier steps that never went out.
    #[serde(default)]
    pub skipped_at: Option<DateTime<Utc>>,
}

impl DunningStep {
    fn from_template(template: &StepTemplate) -> Self {
        Self {
            step_id: Uuid::new_v4(),
            day_offset: template.day_offset,
            channels: template.channels.clone(),
            template: template.template.clone(),
            description: template.description.clone(),
            include_payment_link: template.include_payment_link,
            escalate_to_csm: template.escalate_to_csm,
            sent_at: None,
            clicked_at: None,
            skipped_at: None,
        }
    }

    pub fn is_sent(&self) -> bool {
        self.sent_at.is_some()
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped_at.is_some()
    }

    pub fn channel_list(&self) -> String {
        self.channels
            .iter()
            .map(NotificationChannel::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Outcome of one payment retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub attempted_at: DateTime<Utc>,
    pub success: bool,
    pub result: String,
}

/// Input for opening a sequence.
#[derive(Debug, Clone)]
pub struct CreateDunningSequence {
    pub organization_id: Uuid,
    pub subscription_id: Uuid,
    pub invoice_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub failure_reason: Option<String>,
}

/// Kind of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DunningEventType {
    PaymentFailed,
    RetryAttempted,
    NotificationSent,
    CsmEscalated,
    SubscriptionSuspended,
    PaymentRecovered,
    AccountDeactivated,
    ManuallyResolved,
}

/// One entry of a sequence timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DunningEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: DunningEventType,
    pub description: String,
}

/// Dunning sequence aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DunningSequence {
    pub dunning_id: Uuid,
    pub organization_id: Uuid,
    pub subscription_id: Uuid,
    pub invoice_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub status: DunningStatus,
    /// Sorted by `day_offset`.
    pub steps: Vec<DunningStep>,
    pub retry_days: Vec<i64>,
    pub suspension_day: i64,
    pub deactivation_day: i64,
    pub retry_count: u32,
    pub retry_attempts: Vec<RetryAttempt>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub last_retry_result: Option<String>,
    pub csm_escalated: bool,
    pub csm_escalated_at: Option<DateTime<Utc>>,
    pub csm_id: Option<Uuid>,
    pub failure_reason: Option<String>,
    pub notes: Option<String>,
    pub failed_at: DateTime<Utc>,
    pub suspended_at: Option<DateTime<Utc>>,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub recovered_at: Option<DateTime<Utc>>,
    pub recovery_method: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    /// Store revision; see `UnitOfWork`.
    #[serde(default)]
    pub version: i64,
}

impl DunningSequence {
    /// Open a sequence at `now`, copying the policy's schedule and thresholds.
    ///
    /// The one-open-sequence-per-invoice rule needs the store and is checked there.
    pub fn create(
        input: CreateDunningSequence,
        policy: &DunningPolicy,
        now: DateTime<Utc>,
    ) -> BillingResult<Self> {
        if input.amount <= Decimal::ZERO {
            return Err(BillingError::validation(
                "Dunning amount must be positive",
            ));
        }
        let mut steps: Vec<DunningStep> =
            policy.steps.iter().map(DunningStep::from_template).collect();
        steps.sort_by_key(|step| step.day_offset);

        Ok(Self {
            dunning_id: Uuid::new_v4(),
            organization_id: input.organization_id,
            subscription_id: input.subscription_id,
            invoice_id: input.invoice_id,
            amount: input.amount,
            currency: input.currency,
            status: DunningStatus::Active,
            steps,
            retry_days: policy.retry_days.clone(),
            suspension_day: policy.suspension_day,
            deactivation_day: policy.deactivation_day,
            retry_count: 0,
            retry_attempts: Vec::new(),
            last_retry_at: None,
            last_retry_result: None,
            csm_escalated: false,
            csm_escalated_at: None,
            csm_id: None,
            failure_reason: input.failure_reason,
            notes: None,
            failed_at: now,
            suspended_at: None,
            deactivated_at: None,
            recovered_at: None,
            recovery_method: None,
            resolved_at: None,
            created_utc: now,
            updated_utc: now,
            version: 0,
        })
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Whole calendar days between the failure date and `today`.
    pub fn days_since_failure(&self, today: NaiveDate) -> i64 {
        (today - self.failed_at.date_naive()).num_days()
    }

    /// Earliest step due by `today` that was neither sent nor skipped.
    pub fn next_pending_step(&self, today: NaiveDate) -> Option<&DunningStep> {
        let days = self.days_since_failure(today);
        self.steps
            .iter()
            .find(|step| !step.is_sent() && !step.is_skipped() && step.day_offset <= days)
    }

    /// Step the scheduled job should send today. A backlog of due steps drains one
    /// step per day, so a second run on the same day sends nothing. A deactivated
    /// sequence only has its deactivation notice left, which goes out regardless.
    pub fn notification_due(&self, today: NaiveDate) -> Option<&DunningStep> {
        if self.status == DunningStatus::Deactivated {
            return self.next_pending_step(today);
        }
        let sent_today = self
            .steps
            .iter()
            .any(|step| step.sent_at.is_some_and(|at| at.date_naive() == today));
        if sent_today {
            return None;
        }
        self.next_pending_step(today)
    }

    /// Mark a step as sent. Only the next pending step may be sent, which keeps
    /// steps in day order and each step to a single send.
    pub fn mark_step_sent(&mut self, step_id: Uuid, now: DateTime<Utc>) -> BillingResult<&DunningStep> {
        if matches!(
            self.status,
            DunningStatus::Recovered | DunningStatus::Cancelled
        ) {
            return Err(BillingError::invalid_transition(
                ENTITY,
                self.status,
                "send_step",
            ));
        }
        let position = self.step_position(step_id)?;
        if self.steps[position].is_sent() || self.steps[position].is_skipped() {
            return Err(BillingError::validation(format!(
                "Step for day {} was already sent or skipped",
                self.steps[position].day_offset
            )));
        }
        let next = self
            .next_pending_step(now.date_naive())
            .map(|step| step.step_id);
        if next != Some(step_id) {
            return Err(BillingError::validation(format!(
                "Step for day {} is not the next due step",
                self.steps[position].day_offset
            )));
        }

        self.steps[position].sent_at = Some(now);
        self.updated_utc = now;
        Ok(&self.steps[position])
    }

    /// Record client engagement with a sent notice. Repeat clicks keep the first time.
    pub fn record_click(&mut self, step_id: Uuid, now: DateTime<Utc>) -> BillingResult<()> {
        let position = self.step_position(step_id)?;
        let step = &mut self.steps[position];
        if !step.is_sent() {
            return Err(BillingError::validation(
                "Cannot record a click on a step that was not sent",
            ));
        }
        if step.clicked_at.is_none() {
            step.clicked_at = Some(now);
            self.updated_utc = now;
        }
        Ok(())
    }

    fn step_position(&self, step_id: Uuid) -> BillingResult<usize> {
        self.steps
            .iter()
            .position(|step| step.step_id == step_id)
            .ok_or_else(|| BillingError::not_found("dunning step", step_id))
    }

    // ------------------------------------------------------------------
    // Retries
    // ------------------------------------------------------------------

    pub fn max_retries(&self) -> u32 {
        self.retry_days.len() as u32
    }

    pub fn next_retry_day(&self) -> Option<i64> {
        self.retry_days.get(self.retry_count as usize).copied()
    }

    /// At most one retry per calendar day, even when several retry days have passed.
    pub fn is_retry_due(&self, today: NaiveDate) -> bool {
        self.status == DunningStatus::Active
            && self
                .last_retry_at
                .is_none_or(|at| at.date_naive() < today)
            && self
                .next_retry_day()
                .is_some_and(|day| self.days_since_failure(today) >= day)
    }

    /// Count a payment retry. On success the caller recovers the sequence in the same
    /// unit of work.
    pub fn record_retry_attempt(
        &mut self,
        success: bool,
        result: impl Into<String>,
        now: DateTime<Utc>,
    ) -> BillingResult<()> {
        if self.status != DunningStatus::Active {
            return Err(BillingError::invalid_transition(
                ENTITY,
                self.status,
                "retry_payment",
            ));
        }
        if self.retry_count >= self.max_retries() {
            return Err(BillingError::validation(format!(
                "All {} payment retries have been used",
                self.max_retries()
            )));
        }
        let result = result.into();
        self.retry_count += 1;
        self.retry_attempts.push(RetryAttempt {
            attempt: self.retry_count,
            attempted_at: now,
            success,
            result: result.clone(),
        });
        self.last_retry_at = Some(now);
        self.last_retry_result = Some(result);
        self.updated_utc = now;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Status transitions
    // ------------------------------------------------------------------

    pub fn recover(&mut self, method: impl Into<String>, now: DateTime<Utc>) -> BillingResult<()> {
        if self.status != DunningStatus::Active {
            return Err(BillingError::invalid_transition(ENTITY, self.status, "recover"));
        }
        self.status = DunningStatus::Recovered;
        self.recovered_at = Some(now);
        self.recovery_method = Some(method.into());
        self.updated_utc = now;
        Ok(())
    }

    /// Flag the sequence for a CSM. Returns `false` when it was already escalated.
    pub fn escalate_to_csm(&mut self, csm_id: Option<Uuid>, now: DateTime<Utc>) -> BillingResult<bool> {
        if self.status.is_terminal() {
            return Err(BillingError::invalid_transition(ENTITY, self.status, "escalate"));
        }
        if csm_id.is_some() {
            self.csm_id = csm_id;
        }
        if self.csm_escalated {
            return Ok(false);
        }
        self.csm_escalated = true;
        self.csm_escalated_at = Some(now);
        self.updated_utc = now;
        Ok(true)
    }

    pub fn assign_csm(&mut self, csm_id: Uuid, now: DateTime<Utc>) -> BillingResult<()> {
        if self.status.is_terminal() {
            return Err(BillingError::invalid_transition(ENTITY, self.status, "assign_csm"));
        }
        self.csm_id = Some(csm_id);
        self.updated_utc = now;
        Ok(())
    }

    pub fn is_suspension_due(&self, today: NaiveDate) -> bool {
        self.status == DunningStatus::Active
            && self.days_since_failure(today) >= self.suspension_day
    }

    pub fn suspend(&mut self, now: DateTime<Utc>) -> BillingResult<()> {
        if self.status != DunningStatus::Active {
            return Err(BillingError::invalid_transition(ENTITY, self.status, "suspend"));
        }
        let days = self.days_since_failure(now.date_naive());
        if days < self.suspension_day {
            return Err(BillingError::validation(format!(
                "Suspension is allowed from day {}, sequence is at day {}",
                self.suspension_day, days
            )));
        }
        self.status = DunningStatus::Suspended;
        self.suspended_at = Some(now);
        self.updated_utc = now;
        Ok(())
    }

    pub fn is_deactivation_due(&self, today: NaiveDate) -> bool {
        self.status == DunningStatus::Suspended
            && self.days_since_failure(today) >= self.deactivation_day
    }

    pub fn deactivate(&mut self, now: DateTime<Utc>) -> BillingResult<()> {
        if self.status != DunningStatus::Suspended {
            return Err(BillingError::invalid_transition(
                ENTITY,
                self.status,
                "deactivate",
            ));
        }
        let days = self.days_since_failure(now.date_naive());
        if days < self.deactivation_day {
            return Err(BillingError::validation(format!(
                "Deactivation is allowed from day {}, sequence is at day {}",
                self.deactivation_day, days
            )));
        }
        // Warnings that never went out are stale once the account is gone.
        let deactivation_day = self.deactivation_day;
        for step in self
            .steps
            .iter_mut()
            .filter(|step| !step.is_sent() && step.day_offset < deactivation_day)
        {
            step.skipped_at = Some(now);
        }
        self.status = DunningStatus::Deactivated;
        self.deactivated_at = Some(now);
        self.updated_utc = now;
        Ok(())
    }

    pub fn resolve_manually(&mut self, notes: Option<String>, now: DateTime<Utc>) -> BillingResult<()> {
        if self.status.is_terminal() {
            return Err(BillingError::invalid_transition(
                ENTITY,
                self.status,
                "resolve_manually",
            ));
        }
        self.status = DunningStatus::Cancelled;
        self.notes = notes;
        self.resolved_at = Some(now);
        self.updated_utc = now;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn notifications_sent(&self) -> usize {
        self.steps.iter().filter(|step| step.is_sent()).count()
    }

    pub fn timeline(&self) -> Vec<DunningEvent> {
        let mut events = vec![DunningEvent {
            timestamp: self.failed_at,
            event_type: DunningEventType::PaymentFailed,
            description: format!(
                "Payment of {} {} failed: {}",
                self.amount,
                self.currency,
                self.failure_reason.as_deref().unwrap_or("unknown reason")
            ),
        }];

        events.extend(self.retry_attempts.iter().map(|attempt| DunningEvent {
            timestamp: attempt.attempted_at,
            event_type: DunningEventType::RetryAttempted,
            description: format!("Retry attempt #{}: {}", attempt.attempt, attempt.result),
        }));

        events.extend(self.steps.iter().filter_map(|step| {
            step.sent_at.map(|sent_at| DunningEvent {
                timestamp: sent_at,
                event_type: DunningEventType::NotificationSent,
                description: format!("Sent via {}: {}", step.channel_list(), step.description),
            })
        }));

        let milestones = [
            (
                self.csm_escalated_at,
                DunningEventType::CsmEscalated,
                "Escalated to customer success".to_string(),
            ),
            (
                self.suspended_at,
                DunningEventType::SubscriptionSuspended,
                "Subscription suspended due to non-payment".to_string(),
            ),
            (
                self.recovered_at,
                DunningEventType::PaymentRecovered,
                format!(
                    "Payment recovered via {}",
                    self.recovery_method.as_deref().unwrap_or("unknown")
                ),
            ),
            (
                self.deactivated_at,
                DunningEventType::AccountDeactivated,
                "Account deactivated for non-payment".to_string(),
            ),
            (
                self.resolved_at,
                DunningEventType::ManuallyResolved,
                format!(
                    "Resolved manually: {}",
                    self.notes.as_deref().unwrap_or("no notes")
                ),
            ),
        ];
        events.extend(
            milestones
                .into_iter()
                .filter_map(|(timestamp, event_type, description)| {
                    timestamp.map(|timestamp| DunningEvent {
                        timestamp,
                        event_type,
                        description,
                    })
                }),
        );

        events.sort_by_key(|event| event.timestamp);
        events
    }
}

/// Filter parameters for listing dunning sequences.
#[derive(Debug, Clone, Default)]
pub struct ListDunningFilter {
    pub organization_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub invoice_id: Option<Uuid>,
    pub statuses: Vec<DunningStatus>,
    pub csm_escalated: Option<bool>,
}

impl ListDunningFilter {
    pub fn with_status(status: DunningStatus) -> Self {
        Self {
            statuses: vec![status],
            ..Default::default()
        }
    }

    pub fn open() -> Self {
        Self {
            statuses: DunningStatus::OPEN.to_vec(),
            ..Default::default()
        }
    }

    pub fn matches(&self, sequence: &DunningSequence) -> bool {
        self.organization_id
            .is_none_or(|org| sequence.organization_id == org)
            && self
                .subscription_id
                .is_none_or(|sub| sequence.subscription_id == sub)
            && self.invoice_id.is_none_or(|inv| sequence.invoice_id == inv)
            && (self.statuses.is_empty() || self.statuses.contains(&sequence.status))
            && self
                .csm_escalated
                .is_none_or(|flag| sequence.csm_escalated == flag)
    }
}
