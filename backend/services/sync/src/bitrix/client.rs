use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;

use super::models::{id_to_string, ApiErrorBody, ApiResponse, ContactFields};
use crate::connector::{MatchKey, TargetConnector, TargetError, TargetRecord};
use crate::rate_limit::RequestSpacer;
use crate::retry::RetryPolicy;

/// Bitrix24 error codes that mean the webhook credentials are unusable.
const AUTH_ERROR_CODES: &[&str] = &[
    "expired_token",
    "invalid_token",
    "INVALID_CREDENTIALS",
    "NO_AUTH_FOUND",
    "insufficient_scope",
    "ACCESS_DENIED",
    "WRONG_AUTH_TYPE",
];

/// Error codes Bitrix24 uses for throttling (returned with HTTP 503).
const THROTTLE_ERROR_CODES: &[&str] = &["QUERY_LIMIT_EXCEEDED", "OPERATION_TIME_LIMIT"];

const CONTACT_SELECT: &[&str] = &[
    "ID",
    "NAME",
    "PHONE",
    "EMAIL",
    "COMMENTS",
    "ADDRESS",
    "ADDRESS_CITY",
    "ADDRESS_POSTAL_CODE",
    "ADDRESS_COUNTRY",
    "ORIGINATOR_ID",
    "ORIGIN_ID",
];

#[derive(Debug, Clone)]
pub struct BitrixClientConfig {
    /// Incoming webhook URL, e.g. `https://acme.bitrix24.es/rest/1/<token>`.
    pub base_url: String,
    pub timeout: Duration,
    pub min_spacing: Duration,
    pub retry: RetryPolicy,
}

impl From<&relay_config::BitrixConfig> for BitrixClientConfig {
    fn from(config: &relay_config::BitrixConfig) -> Self {
        Self {
            base_url: config.endpoint.trim_end_matches('/').to_owned(),
            timeout: Duration::from_secs(config.timeout_secs),
            min_spacing: Duration::from_millis(config.min_spacing_ms),
            retry: match config.max_retries {
                0 => RetryPolicy::no_retry(),
                n => RetryPolicy::new(n, Duration::from_millis(config.retry_base_ms)),
            },
        }
    }
}

/// Outcome of a single HTTP attempt, before the retry loop decides.
#[derive(Debug)]
enum AttemptError {
    Retryable {
        message: String,
        retry_after: Option<Duration>,
        delivery: Delivery,
    },
    Fatal(TargetError),
}

/// Whether a failed request may still have been executed by Bitrix24.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    /// Connection refused or throttled before the method ran.
    Rejected,
    /// Timed out or failed mid-flight; the write may have been applied.
    Unknown,
}

/// When the retry loop may send the same request again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resend {
    Always,
    /// Only after a [`Delivery::Rejected`] failure. Anything else hands control
    /// back to the caller as [`Sent::Unconfirmed`].
    IfRejected,
}

enum Sent<T> {
    Reply(T),
    Unconfirmed,
}

/// Attempt counter and last failure, carried across resumed retry loops.
#[derive(Debug, Default)]
struct RetryState {
    next_attempt: u32,
    retry_after: Option<Duration>,
    last_error: String,
}

pub struct BitrixClient {
    client: Client,
    config: BitrixClientConfig,
    spacer: RequestSpacer,
}

impl BitrixClient {
    pub fn new(config: BitrixClientConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.timeout).build()?;
        let spacer = RequestSpacer::new(config.min_spacing);
        tracing::debug!(
            base_url = %config.base_url,
            min_spacing_ms = spacer.min_spacing().as_millis() as u64,
            max_retries = config.retry.max_retries,
            "bitrix24 client configured"
        );
        Ok(Self {
            client,
            config,
            spacer,
        })
    }

    /// For testing: point the client at a specific base URL (e.g., wiremock).
    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.config.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Cheap authenticated call used to verify the webhook at startup.
    pub async fn check_connection(&self) -> Result<(), TargetError> {
        let _: serde_json::Value = self.call("crm.contact.fields", &serde_json::json!({})).await?;
        tracing::info!("bitrix24 connection check succeeded");
        Ok(())
    }

    /// Call a read-only or idempotent REST method, retrying transient failures
    /// per the retry policy.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<T, TargetError> {
        let mut state = RetryState::default();
        match self.send(method, body, &mut state, Resend::Always).await? {
            Sent::Reply(value) => Ok(value),
            Sent::Unconfirmed => Err(self.exhausted(&state)),
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &serde_json::Value,
        state: &mut RetryState,
        resend: Resend,
    ) -> Result<Sent<T>, TargetError> {
        let url = format!("{}/{}", self.config.base_url, method);
        let policy = &self.config.retry;

        while state.next_attempt < policy.total_attempts() {
            let attempt = state.next_attempt;
            state.next_attempt += 1;

            if attempt > 0 {
                let delay = policy.delay_with_hint(attempt, state.retry_after.take());
                tracing::warn!(
                    method,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    last_error = %state.last_error,
                    "retrying bitrix24 call after backoff"
                );
                tokio::time::sleep(delay).await;
            }

            self.spacer.wait_turn().await;

            match self.attempt(&url, body).await {
                Ok(value) => return Ok(Sent::Reply(value)),
                Err(AttemptError::Retryable {
                    message,
                    retry_after,
                    delivery,
                }) => {
                    state.last_error = message;
                    state.retry_after = retry_after;
                    if resend == Resend::IfRejected && delivery == Delivery::Unknown {
                        return Ok(Sent::Unconfirmed);
                    }
                }
                Err(AttemptError::Fatal(err)) => return Err(err),
            }
        }

        Err(self.exhausted(state))
    }

    fn exhausted(&self, state: &RetryState) -> TargetError {
        TargetError::Transient {
            attempts: state.next_attempt,
            message: state.last_error.clone(),
        }
    }

    async fn attempt<T: DeserializeOwned>(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<T, AttemptError> {
        let response = match self.client.post(url).json(body).send().await {
            Ok(resp) => resp,
            Err(e) => {
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    let delivery = if e.is_connect() && !e.is_timeout() {
                        Delivery::Rejected
                    } else {
                        Delivery::Unknown
                    };
                    return Err(AttemptError::Retryable {
                        message: e.to_string(),
                        retry_after: None,
                        delivery,
                    });
                }
                return Err(AttemptError::Fatal(TargetError::Permanent(format!(
                    "request failed: {e}"
                ))));
            }
        };

        let status = response.status();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        let text = response.text().await.map_err(|e| AttemptError::Retryable {
            message: format!("reading response body: {e}"),
            retry_after: None,
            delivery: Delivery::Unknown,
        })?;

        let error_body = ApiErrorBody::parse(&text);
        let error_code = error_body.error.as_deref().unwrap_or_default();

        if status == StatusCode::UNAUTHORIZED
            || status == StatusCode::FORBIDDEN
            || AUTH_ERROR_CODES.contains(&error_code)
        {
            return Err(AttemptError::Fatal(TargetError::AuthFailure(
                error_body.describe(&format!("HTTP {status}")),
            )));
        }

        if status == StatusCode::TOO_MANY_REQUESTS || THROTTLE_ERROR_CODES.contains(&error_code) {
            return Err(AttemptError::Retryable {
                message: error_body.describe(&format!("HTTP {status}")),
                retry_after,
                delivery: Delivery::Rejected,
            });
        }

        if status.is_server_error() {
            return Err(AttemptError::Retryable {
                message: error_body.describe(&format!("HTTP {status}")),
                retry_after,
                delivery: Delivery::Unknown,
            });
        }

        if !status.is_success() {
            return Err(AttemptError::Fatal(TargetError::Permanent(format!(
                "HTTP {status}: {}",
                error_body.describe(&text)
            ))));
        }

        let envelope: ApiResponse<T> = serde_json::from_str(&text).map_err(|e| {
            AttemptError::Fatal(TargetError::Permanent(format!(
                "undecodable response: {e}"
            )))
        })?;

        if let Some(code) = envelope.error {
            let desc = envelope.error_description.unwrap_or_default();
            return Err(AttemptError::Fatal(TargetError::Permanent(format!(
                "{code}: {desc}"
            ))));
        }

        envelope.result.ok_or_else(|| {
            AttemptError::Fatal(TargetError::Permanent(
                "response has no result".to_string(),
            ))
        })
    }

    async fn list_contacts(&self, filter: serde_json::Value) -> Result<Vec<ContactFields>, TargetError> {
        let body = serde_json::json!({
            "filter": filter,
            "select": CONTACT_SELECT,
            "order": { "ID": "ASC" },
        });
        self.call("crm.contact.list", &body).await
    }
}

#[async_trait]
impl TargetConnector for BitrixClient {
    fn integration_name(&self) -> &str {
        "bitrix24"
    }

    async fn find(&self, key: &MatchKey) -> Result<Option<TargetRecord>, TargetError> {
        let contacts = self
            .list_contacts(serde_json::json!({
                "ORIGINATOR_ID": key.originator,
                "ORIGIN_ID": key.external_id,
            }))
            .await?;

        if contacts.len() > 1 {
            tracing::warn!(
                key = %key,
                matches = contacts.len(),
                "several contacts share one match key, using the oldest"
            );
        }

        Ok(contacts.into_iter().next().map(ContactFields::into_target))
    }

    /// `crm.contact.add` is not idempotent. After a failure that may have reached
    /// Bitrix24, the contact is looked up by its match key before any resend.
    async fn create(&self, record: &TargetRecord) -> Result<String, TargetError> {
        let body = serde_json::json!({
            "fields": ContactFields::from_target(record),
            "params": { "REGISTER_SONET_EVENT": "N" },
        });
        let mut state = RetryState::default();

        loop {
            let sent = self
                .send::<serde_json::Value>("crm.contact.add", &body, &mut state, Resend::IfRejected)
                .await?;

            let result = match sent {
                Sent::Reply(result) => result,
                Sent::Unconfirmed => {
                    let Some(key) = &record.match_key else {
                        return Err(self.exhausted(&state));
                    };
                    if let Some(existing) = self.find(key).await? {
                        tracing::info!(key = %key, "contact add was applied despite the failed reply");
                        return existing.remote_id.ok_or_else(|| {
                            TargetError::Permanent(format!("contact for {key} has no id"))
                        });
                    }
                    if state.next_attempt >= self.config.retry.total_attempts() {
                        return Err(self.exhausted(&state));
                    }
                    continue;
                }
            };

            return id_to_string(&result).ok_or_else(|| {
                TargetError::Permanent(format!("crm.contact.add returned no id: {result}"))
            });
        }
    }

    async fn update(&self, remote_id: &str, record: &TargetRecord) -> Result<(), TargetError> {
        let body = serde_json::json!({
            "id": remote_id,
            "fields": ContactFields::from_target(record),
            "params": { "REGISTER_SONET_EVENT": "N" },
        });
        let result: serde_json::Value = self.call("crm.contact.update", &body).await?;

        match result {
            serde_json::Value::Bool(true) => Ok(()),
            other => Err(TargetError::Permanent(format!(
                "crm.contact.update({remote_id}) returned {other}"
            ))),
        }
    }
}
