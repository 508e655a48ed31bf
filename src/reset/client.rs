use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::CONFIG;
use crate::utils::http::get_http_client;
use crate::utils::text::truncate_chars;
use crate::utils::timing::log_external_timing;

const RESET_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const RESET_MESSAGE_LIMIT: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetTargetKind {
    Email,
    Username,
}

impl ResetTargetKind {
    pub fn classify(target: &str) -> Self {
        if target.contains('@') {
            ResetTargetKind::Email
        } else {
            ResetTargetKind::Username
        }
    }

    pub fn form_field(self) -> &'static str {
        match self {
            ResetTargetKind::Email => "email",
            ResetTargetKind::Username => "username",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ResetTargetKind::Email => "email address",
            ResetTargetKind::Username => "username",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResetError {
    #[error("account reset is not configured")]
    Disabled,
    #[error("account reset request failed: {0}")]
    Request(String),
    #[error("account reset was refused ({status}){}", .message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    Refused {
        status: StatusCode,
        message: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetReceipt {
    pub kind: ResetTargetKind,
    pub message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ResetResponseBody {
    message: Option<String>,
    status: Option<String>,
}

fn build_form(target: &str) -> (ResetTargetKind, Vec<(&'static str, String)>) {
    let kind = ResetTargetKind::classify(target);
    (kind, vec![(kind.form_field(), target.to_string())])
}

fn response_message(body: &ResetResponseBody) -> Option<String> {
    body.message
        .as_deref()
        .map(str::trim)
        .filter(|message| !message.is_empty())
        .map(|message| truncate_chars(message, RESET_MESSAGE_LIMIT))
}

/// Maps the endpoint's reply to a receipt. A 2xx reply whose JSON body says
/// `"status": "fail"` is still a refusal.
fn interpret_response(
    kind: ResetTargetKind,
    status: StatusCode,
    body: &str,
) -> Result<ResetReceipt, ResetError> {
    let parsed = serde_json::from_str::<ResetResponseBody>(body).unwrap_or_default();
    let message = response_message(&parsed);
    let reported_failure = parsed
        .status
        .as_deref()
        .map(|value| value.eq_ignore_ascii_case("fail") || value.eq_ignore_ascii_case("error"))
        .unwrap_or(false);

    if !status.is_success() || reported_failure {
        return Err(ResetError::Refused { status, message });
    }
    Ok(ResetReceipt { kind, message })
}

/// A body that cannot be read leaves the result unknown, so it is reported
/// as a failed request even on a 2xx status.
fn interpret_body(
    kind: ResetTargetKind,
    status: StatusCode,
    body: Result<String, String>,
) -> Result<ResetReceipt, ResetError> {
    match body {
        Ok(body) => interpret_response(kind, status, &body),
        Err(err) => {
            warn!("Could not read account reset response ({status}): {err}");
            Err(ResetError::Request(format!(
                "could not read response ({status}): {err}"
            )))
        }
    }
}

/// Asks the configured account-recovery endpoint to send a reset link to
/// `target` (already trimmed and validated by the session tracker).
pub async fn request_account_reset(target: &str) -> Result<ResetReceipt, ResetError> {
    let Some(endpoint) = CONFIG.reset_endpoint.as_ref() else {
        return Err(ResetError::Disabled);
    };
    let (kind, form) = build_form(target);
    let detail = format!("kind={}", kind.form_field());

    log_external_timing("reset", "account_reset", &detail, || async {
        let response = get_http_client()
            .post(endpoint.clone())
            .timeout(RESET_REQUEST_TIMEOUT)
            .header(reqwest::header::USER_AGENT, &CONFIG.reset_user_agent)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|err| ResetError::Request(err.without_url().to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| err.without_url().to_string());
        let result = interpret_body(kind, status, body);
        match &result {
            Ok(_) => info!("Account reset requested for a {}", kind.label()),
            Err(err) => warn!("Account reset failed: {err}"),
        }
        result
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_sign_selects_email_field() {
        let (kind, form) = build_form("jane@example.com");
        assert_eq!(kind, ResetTargetKind::Email);
        assert_eq!(form, vec![("email", "jane@example.com".to_string())]);

        let (kind, form) = build_form("john_doe");
        assert_eq!(kind, ResetTargetKind::Username);
        assert_eq!(form[0].0, "username");
    }

    #[test]
    fn success_relays_endpoint_message() {
        let receipt = interpret_response(
            ResetTargetKind::Username,
            StatusCode::OK,
            r#"{"status":"ok","message":"  We sent a link to j***@example.com  "}"#,
        )
        .expect("accepted");
        assert_eq!(
            receipt.message.as_deref(),
            Some("We sent a link to j***@example.com")
        );
    }

    #[test]
    fn non_json_success_has_no_message() {
        let receipt = interpret_response(ResetTargetKind::Email, StatusCode::OK, "<html></html>")
            .expect("accepted");
        assert_eq!(receipt.message, None);
    }

    #[test]
    fn failure_status_in_body_is_a_refusal() {
        let err = interpret_response(
            ResetTargetKind::Username,
            StatusCode::OK,
            r#"{"status":"fail","message":"No users found"}"#,
        )
        .expect_err("refused");
        assert_eq!(
            err.to_string(),
            "account reset was refused (200 OK): No users found"
        );
    }

    #[test]
    fn unreadable_body_is_a_failed_request() {
        let err = interpret_body(
            ResetTargetKind::Email,
            StatusCode::OK,
            Err("connection reset by peer".to_string()),
        )
        .expect_err("body lost");
        assert!(matches!(err, ResetError::Request(ref detail) if detail.contains("connection reset")));

        let receipt = interpret_body(ResetTargetKind::Email, StatusCode::OK, Ok(String::new()))
            .expect("empty body is fine");
        assert_eq!(receipt.message, None);
    }

    #[test]
    fn http_errors_are_refusals() {
        let err = interpret_response(ResetTargetKind::Username, StatusCode::TOO_MANY_REQUESTS, "")
            .expect_err("refused");
        assert!(matches!(
            err,
            ResetError::Refused {
                status: StatusCode::TOO_MANY_REQUESTS,
                message: None
            }
        ));
    }
}
