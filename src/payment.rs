use async_trait::async_trait;
use ulid::Ulid;

/// Capture failure reported by the external gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentError(pub String);

impl std::fmt::Display for PaymentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "payment declined: {}", self.0)
    }
}

impl std::error::Error for PaymentError {}

/// Boundary to the external payment processor. The engine calls `capture`
/// once per booking group, after the reservation commits and outside any
/// teacher lock, so a slow gateway never blocks other bookings.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn capture(&self, reference: Ulid, amount_cents: i64) -> Result<(), PaymentError>;
}

/// Gateway that always captures. Useful for tests and for deployments where
/// payment is handled entirely out of band.
pub struct AlwaysCapture;

#[async_trait]
impl PaymentGateway for AlwaysCapture {
    async fn capture(&self, _reference: Ulid, _amount_cents: i64) -> Result<(), PaymentError> {
        Ok(())
    }
}

/// Gateway that always declines. Test double for the compensation path.
pub struct AlwaysDecline;

#[async_trait]
impl PaymentGateway for AlwaysDecline {
    async fn capture(&self, _reference: Ulid, _amount_cents: i64) -> Result<(), PaymentError> {
        Err(PaymentError("declined by test gateway".into()))
    }
}
