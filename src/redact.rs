//! Scrubbing of credentials from error snapshots.

use std::fmt;
use std::sync::Arc;

use http::HeaderMap;
use http::header::HeaderValue;
use serde_json::Value;
use url::Url;

use crate::body::{Body, Data, FormParams, ResponseData};
use crate::descriptor::RequestDescriptor;
use crate::error::RequestError;

/// Replacement for every redacted value.
pub const REDACTED: &str = "<<REDACTED> - set `error_redactor` on the request options to configure redaction>";

const SENSITIVE_JSON_KEYS: [&str; 3] = ["grant_type", "assertion", "client_secret"];
const SENSITIVE_QUERY_KEYS: [&str; 2] = ["token", "client_secret"];

/// Rewrites a terminal error before it is returned. Runs on the error's own
/// snapshots, never on the caller's options.
pub trait ErrorRedactor: Send + Sync {
    fn redact(&self, error: &mut RequestError);
}

impl<F> ErrorRedactor for F
where
    F: Fn(&mut RequestError) + Send + Sync,
{
    fn redact(&self, error: &mut RequestError) {
        self(error)
    }
}

/// How terminal errors are redacted for a request.
#[derive(Clone, Default)]
pub enum ErrorRedaction {
    #[default]
    Default,
    Disabled,
    Custom(Arc<dyn ErrorRedactor>),
}

impl ErrorRedaction {
    pub(crate) fn apply(&self, error: &mut RequestError) {
        match self {
            Self::Default => DefaultErrorRedactor.redact(error),
            Self::Disabled => {}
            Self::Custom(redactor) => redactor.redact(error),
        }
    }
}

impl fmt::Debug for ErrorRedaction {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => formatter.write_str("Default"),
            Self::Disabled => formatter.write_str("Disabled"),
            Self::Custom(_) => formatter.write_str("Custom(..)"),
        }
    }
}

/// Masks authorization and secret headers, OAuth grant bodies and token query
/// parameters on the request snapshot and on the attached response.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultErrorRedactor;

impl ErrorRedactor for DefaultErrorRedactor {
    fn redact(&self, error: &mut RequestError) {
        redact_descriptor(error.config_mut());
        if let Some(response) = error.response_mut() {
            redact_headers(response.headers_mut());
            redact_descriptor(response.config_mut());
            redact_response_data(response.data_mut());
        }
    }
}

pub(crate) fn redact_descriptor(config: &mut RequestDescriptor) {
    redact_headers(config.headers_mut());
    redact_url(config.url_mut());
    if let Some(data) = config.data_mut() {
        redact_data(data);
    }
    if let Some(body) = config.body_mut() {
        redact_body(body);
    }
}

fn redacted_value() -> HeaderValue {
    HeaderValue::from_static(REDACTED)
}

fn is_sensitive_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("authentication")
        || name.eq_ignore_ascii_case("authorization")
        || name.to_ascii_lowercase().contains("secret")
}

fn redact_headers(headers: &mut HeaderMap) {
    let sensitive: Vec<_> = headers
        .keys()
        .filter(|name| is_sensitive_header(name.as_str()))
        .cloned()
        .collect();
    for name in sensitive {
        headers.insert(name, redacted_value());
    }
}

fn is_sensitive_text(text: &str) -> bool {
    let lowered = text.to_ascii_lowercase();
    lowered.contains("grant_type=") || lowered.contains("assertion=") || lowered.contains("secret")
}

fn is_sensitive_form_key(key: &str) -> bool {
    key == "grant_type" || key == "assertion" || key.contains("secret")
}

fn redact_text(text: &mut String) {
    if is_sensitive_text(text) {
        *text = REDACTED.to_owned();
        return;
    }
    // serialized JSON bodies carry the same keys as their source objects
    if let Ok(mut value) = serde_json::from_str::<Value>(text)
        && redact_json(&mut value)
        && let Ok(serialized) = serde_json::to_string(&value)
    {
        *text = serialized;
    }
}

/// Returns whether anything was replaced.
fn redact_json(value: &mut Value) -> bool {
    let Value::Object(fields) = value else {
        return false;
    };
    let mut changed = false;
    for key in SENSITIVE_JSON_KEYS {
        if let Some(field) = fields.get_mut(key) {
            *field = Value::String(REDACTED.to_owned());
            changed = true;
        }
    }
    changed
}

fn redact_form(params: &mut FormParams) {
    let sensitive: Vec<String> = params
        .keys()
        .into_iter()
        .filter(|key| is_sensitive_form_key(key))
        .collect();
    for key in sensitive {
        params.set(&key, REDACTED);
    }
}

fn redact_data(data: &mut Data) {
    match data {
        Data::Text(text) => redact_text(text),
        Data::Json(value) => {
            redact_json(value);
        }
        Data::Form(params) => redact_form(params),
        Data::Bytes(_) | Data::Stream(_) => {}
    }
}

fn redact_body(body: &mut Body) {
    match body {
        Body::Text(text) => redact_text(text),
        Body::Form(params) => redact_form(params),
        Body::Bytes(_) | Body::Stream(_) => {}
    }
}

fn redact_response_data(data: &mut ResponseData) {
    match data {
        ResponseData::Text(text) => redact_text(text),
        ResponseData::Json(Value::String(text)) => redact_text(text),
        ResponseData::Json(value) => {
            redact_json(value);
        }
        _ => {}
    }
}

fn redact_url(url: &mut Url) {
    if !url
        .query_pairs()
        .any(|(name, _)| SENSITIVE_QUERY_KEYS.iter().any(|key| name == *key))
    {
        return;
    }
    let mut params = FormParams::parse(url.query().unwrap_or_default());
    for key in SENSITIVE_QUERY_KEYS {
        if params.contains(key) {
            params.set(key, REDACTED);
        }
    }
    url.set_query(Some(&params.to_urlencoded()));
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn header_rules_are_case_insensitive() {
        assert!(is_sensitive_header("Authorization"));
        assert!(is_sensitive_header("AUTHENTICATION"));
        assert!(is_sensitive_header("x-goog-api-secret"));
        assert!(!is_sensitive_header("x-authorization-hint"));
        assert!(!is_sensitive_header("content-type"));
    }

    #[test]
    fn text_bodies_are_replaced_wholesale() {
        let mut text = "grant_type=refresh&refresh_token=abc".to_owned();
        redact_text(&mut text);
        assert_eq!(text, REDACTED);

        let mut text = "harmless".to_owned();
        redact_text(&mut text);
        assert_eq!(text, "harmless");
    }

    #[test]
    fn serialized_json_bodies_keep_unrelated_fields() {
        let mut text = json!({"grant_type": "jwt", "unrelated": "keep-me"}).to_string();
        redact_text(&mut text);
        let value: Value = serde_json::from_str(&text).expect("json body");
        assert_eq!(value["grant_type"], REDACTED);
        assert_eq!(value["unrelated"], "keep-me");
    }

    #[test]
    fn form_entries_matching_secret_are_masked() {
        let mut params: FormParams = [
            ("grant_type", "client_credentials"),
            ("client_secret", "hunter2"),
            ("scope", "read"),
        ]
        .into_iter()
        .collect();
        redact_form(&mut params);
        assert_eq!(params.get("grant_type"), Some(REDACTED));
        assert_eq!(params.get("client_secret"), Some(REDACTED));
        assert_eq!(params.get("scope"), Some("read"));
    }

    #[test]
    fn token_query_parameters_are_masked() {
        let mut url = Url::parse("https://example.com/?token=abc&keep=me").expect("valid url");
        redact_url(&mut url);
        let params = FormParams::parse(url.query().unwrap_or_default());
        assert_eq!(params.get("token"), Some(REDACTED));
        assert_eq!(params.get("keep"), Some("me"));

        let mut untouched = Url::parse("https://example.com/?keep=me").expect("valid url");
        redact_url(&mut untouched);
        assert_eq!(untouched.as_str(), "https://example.com/?keep=me");
    }
}
