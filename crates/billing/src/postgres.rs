//! Postgres-backed stores
//!
//! Timestamps copied from Stripe (`current_period_*`, `canceled_at`, ...) are
//! stored as BIGINT unix seconds, exactly as Stripe reports them. Audit rows
//! use TIMESTAMPTZ.

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::events::{BillingEvent, DeliveryOutcome, NewBillingEvent, NewDeliveryOutcome};
use crate::objects::Metadata;
use crate::store::{EventStore, SubscriptionStore, UserDirectory};
use crate::subscriptions::{SubscriptionPatch, SubscriptionRecord};

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, billing_subscription_id, user_id, customer_id, price_id, currency,
    billing_interval, status, current_period_start, current_period_end,
    cancel_at_period_end, amount, started_at, canceled_at, ended_at,
    metadata, last_event_at
"#;

const EVENT_COLUMNS: &str = r#"
    id, user_id, event_type, category, provider_event_id, livemode,
    occurred_at, recorded_at, payload
"#;

const OUTCOME_COLUMNS: &str = r#"
    id, provider_event_id, event_type, processing_result, error_message, recorded_at
"#;

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    billing_subscription_id: String,
    user_id: Uuid,
    customer_id: Option<String>,
    price_id: String,
    currency: String,
    billing_interval: String,
    status: String,
    current_period_start: i64,
    current_period_end: i64,
    cancel_at_period_end: bool,
    amount: i64,
    started_at: Option<i64>,
    canceled_at: Option<i64>,
    ended_at: Option<i64>,
    metadata: Json<Metadata>,
    last_event_at: Option<i64>,
}

impl From<SubscriptionRow> for SubscriptionRecord {
    fn from(row: SubscriptionRow) -> Self {
        Self {
            id: row.id,
            billing_subscription_id: row.billing_subscription_id,
            user_id: row.user_id,
            customer_id: row.customer_id,
            price_id: row.price_id,
            currency: row.currency,
            billing_interval: row.billing_interval,
            status: row.status,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            amount: row.amount,
            started_at: row.started_at,
            canceled_at: row.canceled_at,
            ended_at: row.ended_at,
            metadata: row.metadata.0,
            last_event_at: row.last_event_at,
        }
    }
}

/// `subscriptions` table
#[derive(Clone)]
pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn find_by_billing_id(
        &self,
        billing_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let query = format!(
            "SELECT {} FROM subscriptions WHERE billing_subscription_id = $1",
            SUBSCRIPTION_COLUMNS
        );

        let row: Option<SubscriptionRow> = sqlx::query_as(&query)
            .bind(billing_subscription_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    async fn upsert(&self, record: &SubscriptionRecord) -> BillingResult<SubscriptionRecord> {
        // Conflict target keeps the existing row's id; last_event_at never moves backwards
        let query = format!(
            r#"
            INSERT INTO subscriptions (
                id, billing_subscription_id, user_id, customer_id, price_id, currency,
                billing_interval, status, current_period_start, current_period_end,
                cancel_at_period_end, amount, started_at, canceled_at, ended_at,
                metadata, last_event_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, NOW(), NOW())
            ON CONFLICT (billing_subscription_id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                customer_id = EXCLUDED.customer_id,
                price_id = EXCLUDED.price_id,
                currency = EXCLUDED.currency,
                billing_interval = EXCLUDED.billing_interval,
                status = EXCLUDED.status,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                amount = EXCLUDED.amount,
                started_at = EXCLUDED.started_at,
                canceled_at = EXCLUDED.canceled_at,
                ended_at = EXCLUDED.ended_at,
                metadata = EXCLUDED.metadata,
                last_event_at = GREATEST(subscriptions.last_event_at, EXCLUDED.last_event_at),
                updated_at = NOW()
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        );

        let row: SubscriptionRow = sqlx::query_as(&query)
            .bind(record.id)
            .bind(&record.billing_subscription_id)
            .bind(record.user_id)
            .bind(&record.customer_id)
            .bind(&record.price_id)
            .bind(&record.currency)
            .bind(&record.billing_interval)
            .bind(&record.status)
            .bind(record.current_period_start)
            .bind(record.current_period_end)
            .bind(record.cancel_at_period_end)
            .bind(record.amount)
            .bind(record.started_at)
            .bind(record.canceled_at)
            .bind(record.ended_at)
            .bind(Json(&record.metadata))
            .bind(record.last_event_at)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.into())
    }

    async fn apply_patch(
        &self,
        billing_subscription_id: &str,
        patch: &SubscriptionPatch,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let query = format!(
            r#"
            UPDATE subscriptions SET
                status = $2,
                current_period_start = $3,
                current_period_end = $4,
                cancel_at_period_end = $5,
                canceled_at = $6,
                ended_at = $7,
                metadata = subscriptions.metadata || $8::jsonb
                    || jsonb_build_object('user_id', subscriptions.user_id::text),
                last_event_at = GREATEST(subscriptions.last_event_at, $9),
                updated_at = NOW()
            WHERE billing_subscription_id = $1
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        );

        let row: Option<SubscriptionRow> = sqlx::query_as(&query)
            .bind(billing_subscription_id)
            .bind(&patch.status)
            .bind(patch.current_period_start)
            .bind(patch.current_period_end)
            .bind(patch.cancel_at_period_end)
            .bind(patch.canceled_at)
            .bind(patch.ended_at)
            .bind(Json(&patch.metadata))
            .bind(patch.event_at)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    async fn set_status(
        &self,
        billing_subscription_id: &str,
        status: &str,
        event_at: i64,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let query = format!(
            r#"
            UPDATE subscriptions SET
                status = $2,
                last_event_at = GREATEST(subscriptions.last_event_at, $3),
                updated_at = NOW()
            WHERE billing_subscription_id = $1 AND status <> 'canceled'
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        );

        let row: Option<SubscriptionRow> = sqlx::query_as(&query)
            .bind(billing_subscription_id)
            .bind(status)
            .bind(event_at)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }
}

/// `billing_events` table
#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn append(&self, event: &NewBillingEvent) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO billing_events (
                id, user_id, event_type, category, provider_event_id, livemode,
                occurred_at, recorded_at, payload
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (provider_event_id, event_type) DO NOTHING
            "#,
        )
        .bind(event.id)
        .bind(event.user_id)
        .bind(&event.event_type)
        .bind(&event.category)
        .bind(&event.provider_event_id)
        .bind(event.livemode)
        .bind(event.occurred_at)
        .bind(event.recorded_at)
        .bind(&event.payload)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn append_outcome(&self, outcome: &NewDeliveryOutcome) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_event_outcomes (
                id, provider_event_id, event_type, processing_result, error_message, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(outcome.id)
        .bind(&outcome.provider_event_id)
        .bind(&outcome.event_type)
        .bind(outcome.processing_result.as_str())
        .bind(&outcome.error_message)
        .bind(outcome.recorded_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn events_for(&self, provider_event_id: &str) -> BillingResult<Vec<BillingEvent>> {
        let query = format!(
            "SELECT {} FROM billing_events WHERE provider_event_id = $1 ORDER BY recorded_at ASC",
            EVENT_COLUMNS
        );

        let rows = sqlx::query_as(&query)
            .bind(provider_event_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    async fn outcomes_for(&self, provider_event_id: &str) -> BillingResult<Vec<DeliveryOutcome>> {
        let query = format!(
            "SELECT {} FROM billing_event_outcomes WHERE provider_event_id = $1 ORDER BY recorded_at ASC",
            OUTCOME_COLUMNS
        );

        let rows = sqlx::query_as(&query)
            .bind(provider_event_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    async fn list_failed(&self, limit: i64) -> BillingResult<Vec<DeliveryOutcome>> {
        let query = format!(
            r#"
            SELECT {cols} FROM (
                SELECT DISTINCT ON (provider_event_id, event_type) {cols}
                FROM billing_event_outcomes
                ORDER BY provider_event_id, event_type, recorded_at DESC
            ) latest
            WHERE processing_result = 'error'
            ORDER BY recorded_at DESC
            LIMIT $1
            "#,
            cols = OUTCOME_COLUMNS
        );

        let rows: Vec<DeliveryOutcome> = sqlx::query_as(&query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }
}

/// Read-only access to `users`
#[derive(Clone)]
pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn find_user_id_by_email(&self, email: &str) -> BillingResult<Option<Uuid>> {
        // users.email is unique
        let row: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM users WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(id,)| id))
    }
}
