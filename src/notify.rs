//! Job lifecycle events and the optional webhook listener.
//!
//! The coordinator publishes on a broadcast channel and never waits on
//! subscribers. A slow or failing webhook can only make its own listener lag.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::ClientError;
use crate::state_machine::{AuditRecord, FailureClassification};

pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Queued {
        job_id: String,
        position: usize,
    },
    Started {
        job_id: String,
        attempt: u32,
    },
    RetryScheduled {
        job_id: String,
        next_attempt: u32,
        classification: FailureClassification,
        delay_ms: u64,
    },
    Finished {
        record: AuditRecord,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Queued { job_id, .. }
            | JobEvent::Started { job_id, .. }
            | JobEvent::RetryScheduled { job_id, .. } => job_id,
            JobEvent::Finished { record } => &record.job_id,
        }
    }
}

/// POSTs the audit record of every finished job to a fixed URL.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ClientError> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub async fn deliver(&self, record: &AuditRecord) -> Result<(), ClientError> {
        let response = self.client.post(&self.url).json(record).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    /// Forward `Finished` events until every sender is gone. Events already
    /// buffered when the coordinator drops are still delivered.
    pub fn spawn(self, mut events: broadcast::Receiver<JobEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(url = %self.url, "webhook notifier started");
            loop {
                match events.recv().await {
                    Ok(JobEvent::Finished { record }) => match self.deliver(&record).await {
                        Ok(()) => debug!(job_id = %record.job_id, "webhook delivered"),
                        Err(e) => {
                            warn!(job_id = %record.job_id, error = %e, "webhook delivery failed")
                        }
                    },
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "webhook notifier lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("webhook notifier stopped");
        })
    }
}
