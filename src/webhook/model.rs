use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::topic::validate_filter;
use crate::utils::{RelayError, Result};

pub const DEFAULT_METHOD: &str = "POST";
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_RETRY_COUNT: u32 = 3;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 5;

/// A persisted webhook: where to deliver messages whose topic matches
/// `topic_filter`, and how hard to try.
///
/// `timeout` and `retry_delay` are whole seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookDefinition {
    pub id: String,
    pub name: String,
    pub url: String,
    pub method: String,
    pub topic_filter: String,
    pub enabled: bool,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub timeout: u64,
    pub retry_count: u32,
    pub retry_delay: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Create/update input. Every field is optional so the same shape serves
/// partial updates; numbers are signed so out-of-range input is reported
/// rather than rejected by the decoder.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookRequest {
    pub name: Option<String>,
    pub url: Option<String>,
    pub method: Option<String>,
    pub topic_filter: Option<String>,
    pub enabled: Option<bool>,
    pub headers: Option<HashMap<String, String>>,
    pub timeout: Option<i64>,
    pub retry_count: Option<i64>,
    pub retry_delay: Option<i64>,
}

fn positive_secs(field: &str, value: i64) -> Result<u64> {
    if value <= 0 {
        return Err(RelayError::validation(format!(
            "{field} must be greater than zero, got {value}"
        )));
    }
    Ok(value as u64)
}

fn retry_count(value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        RelayError::validation(format!("retry_count must be zero or more, got {value}"))
    })
}

fn normalize_method(method: &str) -> Result<String> {
    let upper = method.trim().to_uppercase();
    Method::from_bytes(upper.as_bytes())
        .map_err(|_| RelayError::validation(format!("'{method}' is not a valid HTTP method")))?;
    Ok(upper)
}

impl WebhookDefinition {
    /// Builds a new definition from a create request, applying defaults for
    /// everything but `url` and `topic_filter`.
    pub fn create(request: WebhookRequest) -> Result<Self> {
        let url = request
            .url
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| RelayError::validation("url is required"))?;
        let topic_filter = request
            .topic_filter
            .filter(|f| !f.is_empty())
            .ok_or_else(|| RelayError::validation("topic_filter is required"))?;

        let now = Utc::now().trunc_subsecs(6);
        let definition = Self {
            id: Uuid::new_v4().to_string(),
            name: request.name.unwrap_or_default(),
            url,
            method: match request.method {
                Some(method) if !method.trim().is_empty() => normalize_method(&method)?,
                _ => DEFAULT_METHOD.to_string(),
            },
            topic_filter,
            enabled: request.enabled.unwrap_or(true),
            headers: request.headers.unwrap_or_default(),
            timeout: match request.timeout {
                Some(value) => positive_secs("timeout", value)?,
                None => DEFAULT_TIMEOUT_SECS,
            },
            retry_count: match request.retry_count {
                Some(value) => retry_count(value)?,
                None => DEFAULT_RETRY_COUNT,
            },
            retry_delay: match request.retry_delay {
                Some(value) => positive_secs("retry_delay", value)?,
                None => DEFAULT_RETRY_DELAY_SECS,
            },
            created_at: now,
            updated_at: now,
        };
        definition.validate()?;
        Ok(definition)
    }

    /// Returns a copy with the present fields of `request` overlaid and
    /// `updated_at` refreshed. `self` is untouched if validation fails.
    pub fn updated(&self, request: WebhookRequest) -> Result<Self> {
        let mut next = self.clone();
        if let Some(name) = request.name {
            next.name = name;
        }
        if let Some(url) = request.url {
            next.url = url;
        }
        if let Some(method) = request.method {
            next.method = normalize_method(&method)?;
        }
        if let Some(filter) = request.topic_filter {
            next.topic_filter = filter;
        }
        if let Some(enabled) = request.enabled {
            next.enabled = enabled;
        }
        if let Some(headers) = request.headers {
            next.headers = headers;
        }
        if let Some(value) = request.timeout {
            next.timeout = positive_secs("timeout", value)?;
        }
        if let Some(value) = request.retry_count {
            next.retry_count = retry_count(value)?;
        }
        if let Some(value) = request.retry_delay {
            next.retry_delay = positive_secs("retry_delay", value)?;
        }
        next.validate()?;
        next.updated_at = Utc::now().trunc_subsecs(6).max(self.updated_at);
        Ok(next)
    }

    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.url)
            .map_err(|e| RelayError::validation(format!("invalid url '{}': {e}", self.url)))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(RelayError::validation(format!(
                "url '{}' must be an absolute http(s) url",
                self.url
            )));
        }
        validate_filter(&self.topic_filter)?;
        normalize_method(&self.method)?;
        if self.timeout == 0 {
            return Err(RelayError::validation("timeout must be greater than zero"));
        }
        if self.retry_delay == 0 {
            return Err(RelayError::validation("retry_delay must be greater than zero"));
        }
        Ok(())
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn retry_delay_duration(&self) -> Duration {
        Duration::from_secs(self.retry_delay)
    }
}
