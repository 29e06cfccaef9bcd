use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};

use crate::observability::{self, Metrics};

use super::gateway::{
    GatewayCharge, GatewayFault, GatewayRefund, GatewayReply, PaymentGateway, ReplyBody,
};

pub const IDEMPOTENCY_HEADER: &str = "X-Idempotency-Key";
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Payment gateway reached over HTTP/JSON.
pub struct HttpGateway {
    client: Client,
    base_url: String,
    api_key: String,
    metrics: Metrics,
}

impl HttpGateway {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
        metrics: Metrics,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            metrics,
        })
    }

    async fn send(&self, op: &'static str, request: RequestBuilder) -> Result<GatewayReply, GatewayFault> {
        let started = Instant::now();
        let result = self.send_inner(request.header(API_KEY_HEADER, &self.api_key)).await;
        self.metrics.record(
            observability::GATEWAY_LATENCY_SECONDS,
            started.elapsed().as_secs_f64(),
            &[("op", op)],
        );
        let outcome = match &result {
            Ok(_) => "ok",
            Err(fault) => fault.label(),
        };
        self.metrics.increment(
            observability::GATEWAY_ATTEMPTS_TOTAL,
            &[("op", op), ("result", outcome)],
        );
        result
    }

    async fn send_inner(&self, request: RequestBuilder) -> Result<GatewayReply, GatewayFault> {
        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        let raw = response.text().await.map_err(classify_transport)?;
        classify(status, raw)
    }
}

fn classify_transport(err: reqwest::Error) -> GatewayFault {
    if err.is_timeout() {
        GatewayFault::Timeout
    } else {
        GatewayFault::Connect(err.to_string())
    }
}

/// Map an HTTP answer onto the gateway fault taxonomy.
pub(crate) fn classify(status: StatusCode, raw: String) -> Result<GatewayReply, GatewayFault> {
    let code = status.as_u16();
    if status.is_success() {
        let body: ReplyBody =
            serde_json::from_str(&raw).map_err(|e| GatewayFault::Malformed(e.to_string()))?;
        return Ok(GatewayReply {
            transaction_id: body.transaction_id,
            status: body.status,
            message: body.message,
            raw,
        });
    }
    if status.is_client_error() {
        let message = serde_json::from_str::<ReplyBody>(&raw)
            .ok()
            .and_then(|b| b.message)
            .unwrap_or_else(|| "Payment validation failed".to_string());
        return Err(GatewayFault::Rejected {
            status: code,
            message,
            body: raw,
        });
    }
    if status.is_server_error() {
        return Err(GatewayFault::Server { status: code });
    }
    Err(GatewayFault::Unexpected { status: code })
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    fn name(&self) -> &str {
        "http"
    }

    async fn capture(&self, charge: &GatewayCharge) -> Result<GatewayReply, GatewayFault> {
        let url = format!("{}/api/payments/process", self.base_url);
        let request = self
            .client
            .post(url)
            .header(IDEMPOTENCY_HEADER, &charge.idempotency_key)
            .json(charge);
        self.send("capture", request).await
    }

    async fn refund(&self, refund: &GatewayRefund) -> Result<GatewayReply, GatewayFault> {
        let url = format!("{}/api/payments/{}/refund", self.base_url, refund.transaction_id);
        self.send("refund", self.client.post(url).json(refund)).await
    }

    async fn query_status(&self, transaction_id: &str) -> Result<GatewayReply, GatewayFault> {
        let url = format!("{}/api/payments/{transaction_id}/status", self.base_url);
        self.send("status", self.client.get(url)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_parses_reply() {
        let reply = classify(
            StatusCode::OK,
            r#"{"success":true,"transaction_id":"tx-1","status":"captured"}"#.into(),
        )
        .unwrap();
        assert_eq!(reply.transaction_id.as_deref(), Some("tx-1"));
        assert_eq!(reply.status.as_deref(), Some("captured"));
    }

    #[test]
    fn client_error_carries_message() {
        match classify(StatusCode::PAYMENT_REQUIRED, r#"{"message":"card declined"}"#.into()) {
            Err(GatewayFault::Rejected { status, message, .. }) => {
                assert_eq!(status, 402);
                assert_eq!(message, "card declined");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn client_error_without_json_gets_default_message() {
        match classify(StatusCode::BAD_REQUEST, "nope".into()) {
            Err(GatewayFault::Rejected { message, body, .. }) => {
                assert_eq!(message, "Payment validation failed");
                assert_eq!(body, "nope");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn other_statuses() {
        assert_eq!(
            classify(StatusCode::BAD_GATEWAY, String::new()),
            Err(GatewayFault::Server { status: 502 })
        );
        assert_eq!(
            classify(StatusCode::FOUND, String::new()),
            Err(GatewayFault::Unexpected { status: 302 })
        );
        assert!(matches!(
            classify(StatusCode::OK, "<html>".into()),
            Err(GatewayFault::Malformed(_))
        ));
    }
}
