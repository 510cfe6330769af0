//! HTTP client for a running runlane server, used by the CLI subcommands.

mod error;

use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use serde::Serialize;
use serde::de::DeserializeOwned;

pub use error::ClientError;

use crate::server::types::{
    CancelReceipt, CostReceipt, CostReport, Envelope, ErrorEnvelope, HealthReport, JobResult,
    JobStatus, QueueSnapshot, SubmitReceipt,
};
use crate::state_machine::JobSpec;

pub const DEFAULT_URL: &str = "http://127.0.0.1:7878";

pub struct RunlaneClient {
    client: Client,
    base_url: String,
}

impl RunlaneClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{path}", self.base_url)
    }

    pub async fn submit(&self, spec: &JobSpec) -> Result<SubmitReceipt, ClientError> {
        self.send(self.client.post(self.url("/jobs")).json(spec)).await
    }

    pub async fn status(&self, job_id: &str) -> Result<JobStatus, ClientError> {
        self.send(self.client.get(self.url(&format!("/jobs/{job_id}"))))
            .await
    }

    pub async fn result(&self, job_id: &str) -> Result<JobResult, ClientError> {
        self.send(self.client.get(self.url(&format!("/jobs/{job_id}/result"))))
            .await
    }

    pub async fn cancel(&self, job_id: &str) -> Result<CancelReceipt, ClientError> {
        self.send(self.client.delete(self.url(&format!("/jobs/{job_id}"))))
            .await
    }

    pub async fn report_cost(&self, job_id: &str, amount: f64) -> Result<CostReceipt, ClientError> {
        self.post(&format!("/jobs/{job_id}/cost"), &CostReport { amount })
            .await
    }

    pub async fn health(&self) -> Result<HealthReport, ClientError> {
        self.send(self.client.get(self.url("/health"))).await
    }

    pub async fn queue(&self) -> Result<QueueSnapshot, ClientError> {
        self.send(self.client.get(self.url("/queue"))).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        self.send(self.client.post(self.url(path)).json(body)).await
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ClientError> {
        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match serde_json::from_str::<ErrorEnvelope>(&body) {
                Ok(envelope) => ClientError::Api {
                    status: status.as_u16(),
                    code: envelope.error.code,
                    message: envelope.error.message,
                },
                Err(_) => ClientError::UnexpectedStatus {
                    status: status.as_u16(),
                    body,
                },
            });
        }

        let envelope = response.json::<Envelope<T>>().await?;
        Ok(envelope.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::JobState;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn submit_unwraps_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/jobs"))
            .and(body_partial_json(serde_json::json!({
                "target": "tests/",
                "framework": "pytest"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"job_id": "j-1", "queue_position": 3, "estimated_wait_seconds": 120}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = RunlaneClient::new(server.uri()).unwrap();
        let receipt = client.submit(&JobSpec::new("tests/", "pytest")).await.unwrap();
        assert_eq!(receipt.job_id, "j-1");
        assert_eq!(receipt.queue_position, 3);
        assert_eq!(receipt.estimated_wait_seconds, 120);
    }

    #[tokio::test]
    async fn error_envelope_becomes_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/jobs"))
            .respond_with(ResponseTemplate::new(503).set_body_json(serde_json::json!({
                "error": {"code": "queue_full", "message": "Queue is full (50 jobs waiting)"}
            })))
            .mount(&server)
            .await;

        let client = RunlaneClient::new(server.uri()).unwrap();
        let err = client.submit(&JobSpec::new("a", "shell")).await.unwrap_err();
        assert!(matches!(err, ClientError::Api { status: 503, .. }));
        assert_eq!(err.code(), Some("queue_full"));
    }

    #[tokio::test]
    async fn plain_error_body_is_unexpected_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let client = RunlaneClient::new(server.uri()).unwrap();
        let err = client.health().await.unwrap_err();
        match err {
            ClientError::UnexpectedStatus { status, body } => {
                assert_eq!(status, 502);
                assert_eq!(body, "bad gateway");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_uses_delete() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/v1/jobs/j-9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"job_id": "j-9", "state": "cancelled", "was_running": true}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = RunlaneClient::new(format!("{}/", server.uri())).unwrap();
        let receipt = client.cancel("j-9").await.unwrap();
        assert_eq!(receipt.state, JobState::Cancelled);
        assert!(receipt.was_running);
    }
}
