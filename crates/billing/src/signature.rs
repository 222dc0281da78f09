//! Stripe webhook signature verification
//!
//! Stripe signs `"{timestamp}.{raw body}"` with HMAC-SHA256 and sends
//! `Stripe-Signature: t=<timestamp>,v1=<hex>[,v1=<hex>...]`. Verification runs
//! over the raw bytes exactly as received; the body is parsed only after a
//! signature matched.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::objects::WebhookEvent;

type HmacSha256 = Hmac<Sha256>;

/// Default tolerance between the signed timestamp and now
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Verifies Stripe webhook signatures against the endpoint's signing secret
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &"<redacted>")
            .field("tolerance_secs", &self.tolerance_secs)
            .finish()
    }
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<String>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
        }
    }

    /// Verify the signature header over `payload` and parse the event envelope
    pub fn verify(&self, payload: &[u8], signature: &str) -> BillingResult<WebhookEvent> {
        self.verify_at(payload, signature, OffsetDateTime::now_utc().unix_timestamp())
    }

    pub(crate) fn verify_at(
        &self,
        payload: &[u8],
        signature: &str,
        now: i64,
    ) -> BillingResult<WebhookEvent> {
        let header = SignatureHeader::parse(signature)?;

        // `t` is caller-controlled; abs_diff cannot overflow
        if now.abs_diff(header.timestamp) > self.tolerance_secs.unsigned_abs() {
            tracing::warn!(
                timestamp = header.timestamp,
                now = now,
                tolerance_secs = self.tolerance_secs,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid(
                "timestamp outside tolerance".to_string(),
            ));
        }

        let matched = header
            .v1_signatures
            .iter()
            .any(|candidate| self.signature_matches(header.timestamp, payload, candidate));

        if !matched {
            tracing::warn!(
                payload_len = payload.len(),
                candidates = header.v1_signatures.len(),
                "Webhook signature mismatch"
            );
            return Err(BillingError::WebhookSignatureInvalid(
                "no matching v1 signature".to_string(),
            ));
        }

        let event: WebhookEvent = serde_json::from_slice(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Signed webhook body is not a Stripe event");
            BillingError::InvalidInput(format!("malformed event envelope: {}", e))
        })?;

        tracing::debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Webhook signature verified"
        );

        Ok(event)
    }

    fn signature_matches(&self, timestamp: i64, payload: &[u8], candidate: &str) -> bool {
        let Ok(expected) = hex::decode(candidate) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(self.secret.as_bytes()) else {
            return false;
        };
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        // verify_slice compares in constant time
        mac.verify_slice(&expected).is_ok()
    }
}

/// Parsed `Stripe-Signature` header
#[derive(Debug, PartialEq, Eq)]
struct SignatureHeader {
    timestamp: i64,
    v1_signatures: Vec<String>,
}

impl SignatureHeader {
    fn parse(header: &str) -> BillingResult<Self> {
        let mut timestamp: Option<i64> = None;
        let mut v1_signatures = Vec::new();

        for part in header.split(',') {
            if let Some((key, value)) = part.trim().split_once('=') {
                match key {
                    "t" => timestamp = value.parse().ok(),
                    "v1" => v1_signatures.push(value.to_string()),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            BillingError::WebhookSignatureInvalid("missing timestamp".to_string())
        })?;

        if v1_signatures.is_empty() {
            return Err(BillingError::WebhookSignatureInvalid(
                "missing v1 signature".to_string(),
            ));
        }

        Ok(Self {
            timestamp,
            v1_signatures,
        })
    }
}

/// Build a `Stripe-Signature` header value the way Stripe does
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let mut signed = Vec::with_capacity(payload.len() + 12);
    signed.extend_from_slice(timestamp.to_string().as_bytes());
    signed.push(b'.');
    signed.extend_from_slice(payload);

    let signature = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mut mac) => {
            mac.update(&signed);
            hex::encode(mac.finalize().into_bytes())
        }
        Err(_) => String::new(),
    };

    format!("t={},v1={}", timestamp, signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const NOW: i64 = 1_700_000_000;

    fn payload() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "id": "evt_1",
            "type": "customer.subscription.created",
            "created": NOW,
            "livemode": false,
            "data": { "object": { "id": "sub_1" } }
        }))
        .unwrap()
    }

    #[test]
    fn test_valid_signature_parses_event() {
        let verifier = SignatureVerifier::new(SECRET, DEFAULT_TOLERANCE_SECS);
        let body = payload();
        let header = sign_payload(SECRET, NOW, &body);

        let event = verifier.verify_at(&body, &header, NOW + 10).unwrap();
        assert_eq!(event.id, "evt_1");
        assert_eq!(event.event_type, "customer.subscription.created");
    }

    #[test]
    fn test_tampered_body_rejected() {
        let verifier = SignatureVerifier::new(SECRET, DEFAULT_TOLERANCE_SECS);
        let body = payload();
        let header = sign_payload(SECRET, NOW, &body);

        let mut tampered = body.clone();
        tampered.extend_from_slice(b" ");
        let err = verifier.verify_at(&tampered, &header, NOW).unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid(_)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let verifier = SignatureVerifier::new(SECRET, DEFAULT_TOLERANCE_SECS);
        let body = payload();
        let header = sign_payload("whsec_other", NOW, &body);

        assert!(verifier.verify_at(&body, &header, NOW).is_err());
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let verifier = SignatureVerifier::new(SECRET, DEFAULT_TOLERANCE_SECS);
        let body = payload();
        let header = sign_payload(SECRET, NOW - 301, &body);

        let err = verifier.verify_at(&body, &header, NOW).unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid(_)));
    }

    #[test]
    fn test_extreme_timestamps_rejected_without_overflow() {
        let verifier = SignatureVerifier::new(SECRET, DEFAULT_TOLERANCE_SECS);

        for header in [
            format!("t={},v1=00", i64::MIN),
            format!("t={},v1=00", i64::MAX),
        ] {
            let err = verifier.verify(b"{}", &header).unwrap_err();
            assert!(matches!(err, BillingError::WebhookSignatureInvalid(_)));
        }

        let err = verifier
            .verify_at(b"{}", &format!("t={},v1=00", i64::MAX), i64::MIN)
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid(_)));
    }

    #[test]
    fn test_any_v1_entry_may_match() {
        let verifier = SignatureVerifier::new(SECRET, DEFAULT_TOLERANCE_SECS);
        let body = payload();
        let valid = sign_payload(SECRET, NOW, &body);
        let valid_sig = valid.split("v1=").nth(1).unwrap();
        let header = format!("t={},v1={},v1={}", NOW, "00".repeat(32), valid_sig);

        assert!(verifier.verify_at(&body, &header, NOW).is_ok());
    }

    #[test]
    fn test_header_without_timestamp_or_signature() {
        assert!(SignatureHeader::parse("v1=abcdef").is_err());
        assert!(SignatureHeader::parse("t=123").is_err());
        assert!(SignatureHeader::parse("garbage").is_err());
    }

    #[test]
    fn test_non_hex_signature_rejected() {
        let verifier = SignatureVerifier::new(SECRET, DEFAULT_TOLERANCE_SECS);
        let body = payload();
        let header = format!("t={},v1=not-hex", NOW);
        assert!(verifier.verify_at(&body, &header, NOW).is_err());
    }

    #[test]
    fn test_signed_garbage_is_invalid_input() {
        let verifier = SignatureVerifier::new(SECRET, DEFAULT_TOLERANCE_SECS);
        let body = b"not json".to_vec();
        let header = sign_payload(SECRET, NOW, &body);

        let err = verifier.verify_at(&body, &header, NOW).unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
    }
}
