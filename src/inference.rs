//! Client for the action-prediction service.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bbox::BBox;
use crate::error::{Result, TraceError};
use crate::history::PromptStep;

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    image: &'a str,
    instruction_history: &'a [PromptStep],
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    action: String,
}

/// Next step the model asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCommand {
    ClickAt(BBox),
    Input(String),
    Scroll,
    Key(String),
    End,
    /// Text the parser could not map to a command.
    Unknown(String),
}

pub struct InferenceClient {
    client: Client,
    url: String,
}

impl InferenceClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Ask the service for the next action given the current screenshot and
    /// the instruction history. Returns the raw action text.
    pub async fn predict_next_action(&self, screenshot: &str, history: &[PromptStep]) -> Result<String> {
        let response = self
            .client
            .post(&self.url)
            .json(&PredictRequest {
                image: screenshot,
                instruction_history: history,
            })
            .send()
            .await
            .map_err(|e| TraceError::Inference(format!("request to {} failed: {e}", self.url)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TraceError::Inference(format!("service answered {status}: {body}")));
        }

        let predicted: PredictResponse = response
            .json()
            .await
            .map_err(|e| TraceError::Inference(format!("malformed prediction: {e}")))?;
        debug!(action = %predicted.action, "model prediction");
        Ok(predicted.action)
    }

    pub async fn next_command(&self, screenshot: &str, history: &[PromptStep]) -> Result<AgentCommand> {
        let action = self.predict_next_action(screenshot, history).await?;
        parse_action(&action)
    }
}

fn quoted(text: &str) -> Option<&str> {
    text.split('"').nth(1).map(str::trim)
}

/// Turn model output such as `Click At BBox (x1=87, y1=146, x2=197, y2=175)`
/// or `Input Text "hello"` into a command.
pub fn parse_action(text: &str) -> Result<AgentCommand> {
    let lower = text.trim().to_lowercase();

    if lower.contains("click") {
        return Ok(AgentCommand::ClickAt(BBox::from_rf_string(&lower)?));
    }
    if lower.contains("input") {
        let typed = quoted(text)
            .ok_or_else(|| TraceError::Parse(format!("no quoted text in input action: {text}")))?;
        return Ok(AgentCommand::Input(typed.to_string()));
    }
    if lower.contains("scroll") {
        return Ok(AgentCommand::Scroll);
    }
    if lower.contains("key") {
        let keys = quoted(text)
            .ok_or_else(|| TraceError::Parse(format!("no quoted keys in key action: {text}")))?;
        return Ok(AgentCommand::Key(keys.replace("ctrl", "Control").replace("Ctrl", "Control")));
    }
    if lower.contains("end") {
        return Ok(AgentCommand::End);
    }
    Ok(AgentCommand::Unknown(lower))
}
