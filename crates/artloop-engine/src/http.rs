use std::time::Duration;

use artloop_contracts::error::{ConfigurationError, ServiceError};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;

pub(crate) fn http_client(timeout: Duration) -> Result<HttpClient, ConfigurationError> {
    HttpClient::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| ConfigurationError(format!("failed to build HTTP client: {err}")))
}

/// Connect, timeout and request-build failures mean the service never answered.
pub(crate) fn transport_error(service: &str, err: reqwest::Error) -> ServiceError {
    let message = error_chain_text(&err);
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ServiceError::unreachable(service, message)
    } else {
        ServiceError::invalid_response(service, message)
    }
}

pub(crate) fn ensure_success(
    service: &str,
    response: HttpResponse,
) -> Result<HttpResponse, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(ServiceError::from_status(service, status.as_u16(), &body))
}

pub(crate) fn response_json_or_error(
    service: &str,
    response: HttpResponse,
) -> Result<Value, ServiceError> {
    let response = ensure_success(service, response)?;
    let body = response
        .text()
        .map_err(|err| transport_error(service, err))?;
    serde_json::from_str(&body).map_err(|err| {
        ServiceError::invalid_response(service, format!("returned invalid JSON payload: {err}"))
    })
}

pub(crate) fn post_chat_completion(
    http: &HttpClient,
    service: &str,
    api_base: &str,
    api_key: &str,
    payload: &Value,
) -> Result<String, ServiceError> {
    let endpoint = format!("{api_base}/chat/completions");
    let response = http
        .post(&endpoint)
        .bearer_auth(api_key)
        .header(CONTENT_TYPE, "application/json")
        .json(payload)
        .send()
        .map_err(|err| transport_error(service, err))?;
    let parsed = response_json_or_error(service, response)?;
    extract_chat_text(service, &parsed)
}

pub(crate) fn extract_chat_text(service: &str, response: &Value) -> Result<String, ServiceError> {
    response
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .map(|text| text.trim().to_string())
        .ok_or_else(|| ServiceError::invalid_response(service, "no content in response"))
}

fn error_chain_text(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut current = Some(err);
    while let Some(cause) = current {
        let text = cause.to_string();
        let trimmed = text.trim();
        if !trimmed.is_empty() && parts.last().map(|last| last != trimmed).unwrap_or(true) {
            parts.push(trimmed.to_string());
        }
        current = cause.source();
    }
    parts.join(" | caused by: ")
}
