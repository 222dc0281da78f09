//! Local user resolution
//!
//! Maps a Stripe subscription or checkout session to a local user id. The
//! strategies are tried in a fixed order and the first match wins, so a
//! `user_id` written into metadata always beats an email match.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::objects::Metadata;
use crate::provider::BillingProvider;
use crate::store::UserDirectory;

/// Which object's metadata a [`ResolutionStrategy::ByMetadata`] reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataSource {
    /// The event's own object (subscription or checkout session)
    Primary,
    /// The subscription referenced by a checkout session
    Related,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStrategy {
    ByMetadata(MetadataSource),
    ByClientReference,
    ByCustomerEmail,
}

impl ResolutionStrategy {
    /// Precedence order, highest first
    pub const ORDER: [ResolutionStrategy; 4] = [
        ResolutionStrategy::ByMetadata(MetadataSource::Primary),
        ResolutionStrategy::ByMetadata(MetadataSource::Related),
        ResolutionStrategy::ByClientReference,
        ResolutionStrategy::ByCustomerEmail,
    ];

    /// True when the user id was already recorded on the Stripe side
    pub fn is_metadata(&self) -> bool {
        matches!(self, ResolutionStrategy::ByMetadata(_))
    }
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionStrategy::ByMetadata(MetadataSource::Primary) => f.write_str("metadata"),
            ResolutionStrategy::ByMetadata(MetadataSource::Related) => {
                f.write_str("related_metadata")
            }
            ResolutionStrategy::ByClientReference => f.write_str("client_reference_id"),
            ResolutionStrategy::ByCustomerEmail => f.write_str("customer_email"),
        }
    }
}

/// Everything a delivery offers for resolution. Absent inputs skip their strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolutionContext<'a> {
    /// Label used in logs and the not-resolved error (subscription or session id)
    pub subject: &'a str,
    pub metadata: Option<&'a Metadata>,
    pub related_metadata: Option<&'a Metadata>,
    pub client_reference_id: Option<&'a str>,
    pub customer_id: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub user_id: Uuid,
    pub strategy: ResolutionStrategy,
}

/// Resolves local users; never creates them
#[derive(Clone)]
pub struct UserResolver {
    provider: Arc<dyn BillingProvider>,
    users: Arc<dyn UserDirectory>,
}

impl UserResolver {
    pub fn new(provider: Arc<dyn BillingProvider>, users: Arc<dyn UserDirectory>) -> Self {
        Self { provider, users }
    }

    /// Try each strategy in [`ResolutionStrategy::ORDER`]; the customer is only fetched if all cheaper ones miss
    pub async fn resolve(&self, ctx: &ResolutionContext<'_>) -> BillingResult<Resolution> {
        for strategy in ResolutionStrategy::ORDER {
            if let Some(user_id) = self.try_strategy(strategy, ctx).await? {
                tracing::debug!(
                    subject = %ctx.subject,
                    user_id = %user_id,
                    strategy = %strategy,
                    "Resolved local user"
                );
                return Ok(Resolution { user_id, strategy });
            }
        }

        tracing::warn!(
            subject = %ctx.subject,
            customer_id = ?ctx.customer_id,
            "No local user matches this Stripe object - manual backfill required"
        );
        Err(BillingError::UserNotResolved(ctx.subject.to_string()))
    }

    async fn try_strategy(
        &self,
        strategy: ResolutionStrategy,
        ctx: &ResolutionContext<'_>,
    ) -> BillingResult<Option<Uuid>> {
        match strategy {
            ResolutionStrategy::ByMetadata(MetadataSource::Primary) => {
                Ok(ctx.metadata.and_then(|m| uuid_from_metadata(ctx.subject, m)))
            }
            ResolutionStrategy::ByMetadata(MetadataSource::Related) => {
                Ok(ctx.related_metadata.and_then(|m| uuid_from_metadata(ctx.subject, m)))
            }
            ResolutionStrategy::ByClientReference => Ok(ctx
                .client_reference_id
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .and_then(|value| parse_user_id(ctx.subject, "client_reference_id", value))),
            ResolutionStrategy::ByCustomerEmail => self.by_customer_email(ctx).await,
        }
    }

    async fn by_customer_email(&self, ctx: &ResolutionContext<'_>) -> BillingResult<Option<Uuid>> {
        let Some(customer_id) = ctx.customer_id else {
            return Ok(None);
        };

        let customer = self.provider.retrieve_customer(customer_id).await?;
        if customer.deleted {
            tracing::warn!(customer_id = %customer_id, "Stripe customer is deleted - no email to match");
            return Ok(None);
        }

        let Some(email) = customer.email.as_deref().filter(|e| !e.is_empty()) else {
            tracing::debug!(customer_id = %customer_id, "Stripe customer has no email");
            return Ok(None);
        };

        self.users.find_user_id_by_email(email).await
    }
}

fn uuid_from_metadata(subject: &str, metadata: &Metadata) -> Option<Uuid> {
    metadata
        .user_id_hint()
        .and_then(|value| parse_user_id(subject, "metadata", value))
}

fn parse_user_id(subject: &str, source: &str, value: &str) -> Option<Uuid> {
    match Uuid::parse_str(value) {
        Ok(user_id) => Some(user_id),
        Err(_) => {
            tracing::warn!(
                subject = %subject,
                source = source,
                value = %value,
                "Ignoring user id that is not a valid UUID"
            );
            None
        }
    }
}
