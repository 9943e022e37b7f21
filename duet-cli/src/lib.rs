//! Local side of the generation function: dispatches calls to a running worker.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use duet_core::{app::FunctionSpec, FunctionResult, GenerationRequest};
use reqwest::Client;
use serde::Deserialize;

/// Extra time the client waits past the function timeout, so the worker's own timeout
/// response arrives first.
const TIMEOUT_GRACE: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// Handle to a function exposed by a worker.
pub struct RemoteFunction {
    client: Client,
    url: String,
}

impl RemoteFunction {
    pub fn new(base_url: &str, function: &FunctionSpec) -> Result<Self> {
        let client = Client::builder()
            .timeout(function.timeout + TIMEOUT_GRACE)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            client,
            url: format!("{}{}", base_url.trim_end_matches('/'), function.route()),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Runs the function on the worker and waits for its result.
    pub async fn remote(&self, request: &GenerationRequest) -> Result<String> {
        tracing::debug!(url = %self.url, "calling remote function");
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .with_context(|| format!("failed to reach {}", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&body)
                .map(|e| e.error)
                .unwrap_or(body);
            bail!("remote function failed ({status}): {message}");
        }
        let result: FunctionResult = response
            .json()
            .await
            .context("invalid response from remote function")?;
        Ok(result.result)
    }
}
