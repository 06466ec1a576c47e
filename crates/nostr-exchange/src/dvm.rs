//! NIP-90 text-process jobs over the exchange.
//!
//! A customer publishes a kind 5000 job; a service provider answers with a
//! kind 6000 result tagging the job id, which the exchange correlates by
//! back-reference.

use crate::correlation::CorrelationStrategy;
use crate::error::{ExchangeError, Result};
use crate::event::{Event, EventTemplate};
use crate::filter::Filter;
use crate::manager::{ExchangeManager, ExchangeRequest};
use crate::transport::{EventSigner, RelayTransport};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Kind range for job requests
pub const JOB_REQUEST_KIND_MIN: u16 = 5000;
pub const JOB_REQUEST_KIND_MAX: u16 = 5999;

/// Text-process job request
pub const KIND_JOB_TEXT_PROCESS: u16 = 5000;
/// Text-process job result
pub const KIND_JOB_RESULT_TEXT_PROCESS: u16 = 6000;

/// Job type carried in the request payload.
pub const TEXT_PROCESS: &str = "text-process";

/// Get the result kind for a given request kind.
pub fn result_kind(request_kind: u16) -> Option<u16> {
    if (JOB_REQUEST_KIND_MIN..=JOB_REQUEST_KIND_MAX).contains(&request_kind) {
        Some(request_kind + 1000)
    } else {
        None
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextProcessOptions {
    #[serde(default)]
    pub uppercase: bool,
    #[serde(default)]
    pub reverse: bool,
}

/// Job request payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextProcessRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    pub input: String,
    #[serde(default)]
    pub options: TextProcessOptions,
}

impl TextProcessRequest {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            job_type: TEXT_PROCESS.to_string(),
            input: input.into(),
            options: TextProcessOptions::default(),
        }
    }

    pub fn uppercase(mut self, uppercase: bool) -> Self {
        self.options.uppercase = uppercase;
        self
    }

    pub fn reverse(mut self, reverse: bool) -> Self {
        self.options.reverse = reverse;
        self
    }
}

/// Job result payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextProcessResponse {
    pub input: String,
    pub output: String,
    /// Unix time in milliseconds
    #[serde(rename = "processedAt")]
    pub processed_at: u64,
}

/// Run a text-process job.
pub fn process_text(request: &TextProcessRequest) -> TextProcessResponse {
    let mut output = if request.options.uppercase {
        request.input.to_uppercase()
    } else {
        request.input.clone()
    };
    if request.options.reverse {
        output = output.chars().rev().collect();
    }

    TextProcessResponse {
        input: request.input.clone(),
        output,
        processed_at: now_millis(),
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Customer side: publishes jobs and waits for their results.
#[derive(Clone)]
pub struct DvmClient {
    manager: ExchangeManager,
}

impl DvmClient {
    pub fn new(manager: ExchangeManager) -> Self {
        Self { manager }
    }

    /// Publish a text-process job and wait for its result.
    ///
    /// Uses the manager's default timeout when `timeout` is `None`.
    pub async fn submit_text(
        &self,
        request: &TextProcessRequest,
        timeout: Option<Duration>,
    ) -> Result<TextProcessResponse> {
        let content = serde_json::to_string(request)?;
        let mut exchange = ExchangeRequest::new(EventTemplate::new(KIND_JOB_TEXT_PROCESS, content))
            .strategy(CorrelationStrategy::BackReference)
            .reply_kinds([KIND_JOB_RESULT_TEXT_PROCESS]);
        if let Some(timeout) = timeout {
            exchange = exchange.timeout(timeout);
        }

        let reply = self.manager.dispatch(exchange).await?;
        debug!("Job result {} received", reply.event.id);
        reply.json()
    }
}

/// Service provider side: answers text-process jobs until shut down.
pub struct DvmWorker {
    transport: Arc<dyn RelayTransport>,
    signer: Arc<dyn EventSigner>,
}

impl DvmWorker {
    pub fn new(transport: Arc<dyn RelayTransport>, signer: Arc<dyn EventSigner>) -> Self {
        Self { transport, signer }
    }

    /// Answer jobs until `shutdown` completes or the subscription ends.
    ///
    /// Returns the number of jobs answered.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<usize> {
        let pubkey = self.signer.public_key()?;
        let subscription_id = format!("dvm-{}", &Uuid::new_v4().to_string()[..8]);
        let filter = Filter::new()
            .kinds([KIND_JOB_TEXT_PROCESS])
            .since(crate::event::now());
        let mut jobs = self
            .transport
            .subscribe(&subscription_id, &[filter])
            .await
            .map_err(ExchangeError::Subscription)?;
        info!("DVM worker {} listening for kind {} jobs", pubkey, KIND_JOB_TEXT_PROCESS);

        let mut seen = HashSet::new();
        let mut answered = 0;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                job = jobs.recv() => {
                    let Some(job) = job else { break };
                    if job.validate().is_err() || !seen.insert(job.id.clone()) {
                        continue;
                    }
                    match self.answer(&job).await {
                        Ok(()) => answered += 1,
                        Err(e) => warn!("Skipping job {}: {}", job.id, e),
                    }
                }
            }
        }

        if let Err(e) = self.transport.unsubscribe(&subscription_id).await {
            warn!("Failed to close subscription {}: {}", subscription_id, e);
        }
        info!("DVM worker stopped after {} jobs", answered);
        Ok(answered)
    }

    async fn answer(&self, job: &Event) -> Result<()> {
        let request: TextProcessRequest = serde_json::from_str(&job.content)?;
        if request.job_type != TEXT_PROCESS {
            return Err(ExchangeError::InvalidRequest(format!(
                "unsupported job type {:?}",
                request.job_type
            )));
        }

        let response = process_text(&request);
        let template = EventTemplate::new(
            KIND_JOB_RESULT_TEXT_PROCESS,
            serde_json::to_string(&response)?,
        )
        .tag(["e", job.id.as_str()])
        .tag(["p", job.pubkey.as_str()]);
        let result = self.signer.sign(template)?;

        debug!("Answering job {} with {}", job.id, result.id);
        self.transport
            .publish(result)
            .await
            .map_err(ExchangeError::PublishFailed)
    }
}
