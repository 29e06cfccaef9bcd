use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Capture request body, as the gateway expects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayCharge {
    /// Exact decimal string; never a float.
    pub amount: Decimal,
    pub currency: String,
    pub payment_method: String,
    /// Our payment id.
    pub reference: String,
    pub customer_id: String,
    pub description: String,
    pub idempotency_key: String,
    /// RFC 3339.
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayRefund {
    /// Gateway transaction id of the capture being refunded.
    #[serde(skip)]
    pub transaction_id: String,
    pub amount: Decimal,
    pub reason: String,
}

/// A 2xx answer from the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayReply {
    pub transaction_id: Option<String>,
    pub status: Option<String>,
    pub message: Option<String>,
    /// Response body verbatim, for the audit snapshot.
    pub raw: String,
}

/// Body fields the gateway may send back. Everything is optional; the raw
/// text is kept alongside.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ReplyBody {
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayFault {
    /// 4xx: the gateway refused the request. Final.
    #[error("gateway rejected request ({status}): {message}")]
    Rejected {
        status: u16,
        message: String,
        body: String,
    },
    #[error("gateway server error: {status}")]
    Server { status: u16 },
    #[error("gateway request timed out")]
    Timeout,
    #[error("cannot connect to payment gateway: {0}")]
    Connect(String),
    /// 1xx/3xx or anything else we can't classify.
    #[error("unexpected gateway response: {status}")]
    Unexpected { status: u16 },
    /// 2xx with a body we can't use.
    #[error("malformed gateway response: {0}")]
    Malformed(String),
}

impl GatewayFault {
    /// Server errors, timeouts and connection failures may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayFault::Server { .. } | GatewayFault::Timeout | GatewayFault::Connect(_)
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            GatewayFault::Rejected { .. } => "rejected",
            GatewayFault::Server { .. } => "server_error",
            GatewayFault::Timeout => "timeout",
            GatewayFault::Connect(_) => "connect_error",
            GatewayFault::Unexpected { .. } => "unexpected",
            GatewayFault::Malformed(_) => "malformed",
        }
    }
}

/// External payment service.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &str;

    async fn capture(&self, charge: &GatewayCharge) -> Result<GatewayReply, GatewayFault>;

    async fn refund(&self, refund: &GatewayRefund) -> Result<GatewayReply, GatewayFault>;

    async fn query_status(&self, transaction_id: &str) -> Result<GatewayReply, GatewayFault>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn amount_serializes_as_exact_string() {
        let charge = GatewayCharge {
            amount: dec!(40.10),
            currency: "USD".into(),
            payment_method: "Card".into(),
            reference: "p1".into(),
            customer_id: "u1".into(),
            description: "Booking".into(),
            idempotency_key: "k1".into(),
            timestamp: "2027-01-15T08:00:00Z".into(),
        };
        let json = serde_json::to_value(&charge).unwrap();
        assert_eq!(json["amount"], "40.10");
    }

    #[test]
    fn refund_body_omits_transaction_id() {
        let refund = GatewayRefund {
            transaction_id: "tx".into(),
            amount: dec!(5),
            reason: "customer request".into(),
        };
        let json = serde_json::to_value(&refund).unwrap();
        assert!(json.get("transaction_id").is_none());
        assert_eq!(json["amount"], "5");
    }

    #[test]
    fn only_transient_faults_retry() {
        assert!(GatewayFault::Server { status: 503 }.is_retryable());
        assert!(GatewayFault::Timeout.is_retryable());
        assert!(GatewayFault::Connect("refused".into()).is_retryable());
        assert!(!GatewayFault::Unexpected { status: 302 }.is_retryable());
        assert!(
            !GatewayFault::Rejected {
                status: 400,
                message: "card declined".into(),
                body: "{}".into()
            }
            .is_retryable()
        );
    }
}
