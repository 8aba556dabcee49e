use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::app::ports::{ClassificationProvider, ProviderAnswer};
use crate::config::ProviderConfig;
use crate::domain::EntityType;
use crate::error::{PipelineError, Result};

/// Used when a provider answers without a confidence figure
const DEFAULT_CONFIDENCE: f64 = 0.5;

#[derive(Serialize)]
struct NormalizeRequest<'a> {
    name: &'a str,
    entity_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

/// Provider that POSTs the name to a JSON endpoint and parses the answer
pub struct HttpJsonProvider {
    id: String,
    priority: i32,
    endpoint: String,
    model: Option<String>,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpJsonProvider {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>, priority: i32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            id: id.into(),
            priority,
            endpoint: endpoint.into(),
            model: None,
            api_key: None,
            client,
        })
    }

    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let endpoint = config.endpoint.clone().ok_or_else(|| {
            PipelineError::ValidationFailed(format!("provider '{}' has no endpoint", config.id))
        })?;
        let mut provider = Self::new(config.id.clone(), endpoint, config.priority)?;
        provider.model = config.model.clone();
        provider.api_key = config.resolved_api_key();
        Ok(provider)
    }
}

#[async_trait]
impl ClassificationProvider for HttpJsonProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn normalize(&self, name: &str, entity_type: EntityType) -> Result<ProviderAnswer> {
        let body = NormalizeRequest {
            name,
            entity_type: entity_type.as_str(),
            model: self.model.as_deref(),
        };
        let mut request = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.header(AUTHORIZATION, format!("Bearer {}", key));
        }

        let response = request
            .send()
            .await
            .map_err(|e| PipelineError::ProviderUnavailable(format!("{}: {}", self.id, e)))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| PipelineError::ProviderUnavailable(format!("{}: {}", self.id, e)))?;
        if !status.is_success() {
            return Err(PipelineError::ProviderUnavailable(format!(
                "{} answered HTTP {}",
                self.id,
                status.as_u16()
            )));
        }
        debug!(provider = %self.id, bytes = text.len(), "Provider response received");
        parse_answer(&text)
    }
}

/// Parses a provider body: plain JSON, JSON inside a markdown fence, or a
/// chat-completion envelope whose message content holds either of those.
pub fn parse_answer(body: &str) -> Result<ProviderAnswer> {
    let value = parse_json_loose(body)?;

    if let Some(content) = value
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
    {
        return parse_answer(content);
    }

    let normalized_name = ["normalized_name", "normalized", "name", "result"]
        .iter()
        .find_map(|k| value.get(*k).and_then(Value::as_str))
        .map(|s| s.trim().to_string())
        .ok_or_else(|| PipelineError::ProviderUnavailable("answer has no normalized name".into()))?;
    let category = value
        .get("category")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let confidence = value
        .get("confidence")
        .and_then(parse_confidence)
        .unwrap_or(DEFAULT_CONFIDENCE);

    Ok(ProviderAnswer {
        normalized_name,
        category,
        confidence,
    })
}

fn parse_json_loose(body: &str) -> Result<Value> {
    let trimmed = strip_fence(body.trim());
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => Ok(serde_json::from_str(&trimmed[start..=end])?),
        _ => Err(PipelineError::ProviderUnavailable(format!(
            "unparseable provider answer: {}",
            trimmed.chars().take(80).collect::<String>()
        ))),
    }
}

fn strip_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    rest.trim_end().trim_end_matches("```").trim()
}

/// Accepts 0.87, 87, "87%" and "0.87"
fn parse_confidence(value: &Value) -> Option<f64> {
    let raw = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse().ok()?,
        _ => return None,
    };
    let scaled = if raw > 1.0 { raw / 100.0 } else { raw };
    Some(scaled.clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_json() {
        let answer = parse_answer(r#"{"normalized_name": "Болт М6", "category": "Крепеж", "confidence": 0.91}"#).unwrap();
        assert_eq!(answer.normalized_name, "Болт М6");
        assert_eq!(answer.category.as_deref(), Some("Крепеж"));
        assert_eq!(answer.confidence, 0.91);
    }

    #[test]
    fn tolerates_fences_and_percentages() {
        let body = "```json\n{\"normalized\": \"ООО Ромашка\", \"confidence\": \"85%\"}\n```";
        let answer = parse_answer(body).unwrap();
        assert_eq!(answer.normalized_name, "ООО Ромашка");
        assert!((answer.confidence - 0.85).abs() < 1e-9);
    }

    #[test]
    fn unwraps_chat_completion_envelopes() {
        let body = r#"{"choices":[{"message":{"content":"Here you go: {\"name\": \"Гайка М8\", \"confidence\": 90}"}}]}"#;
        let answer = parse_answer(body).unwrap();
        assert_eq!(answer.normalized_name, "Гайка М8");
        assert!((answer.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn rejects_answers_without_a_name() {
        let err = parse_answer(r#"{"confidence": 0.3}"#).unwrap_err();
        assert_eq!(err.kind(), "provider_unavailable");
        assert!(parse_answer("I cannot help with that").is_err());
    }
}
