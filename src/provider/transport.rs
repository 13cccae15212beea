//! Authenticated HTTP transport with retry and backoff.

use std::{cmp::min, time::Duration};

use http::StatusCode;
use reqwest::{header::RETRY_AFTER, Client, Method, Response};
use serde::{de::DeserializeOwned, Deserialize};
use tokio::sync::OnceCell;
use url::Url;

use crate::error::ProviderError;

/// Upper bound for a single backoff sleep
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// How transient provider failures are retried
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
	/// Total attempts including the first one
	pub max_attempts: u32,
	/// Delay before the second attempt; doubles on every further attempt
	pub base_delay: Duration,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self { max_attempts: 3, base_delay: Duration::from_millis(500) }
	}
}

impl RetryPolicy {
	/// Delay before retrying after `attempt` failed attempts
	fn backoff(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
		let exponential = self.base_delay.saturating_mul(2u32.saturating_pow(attempt - 1));
		min(retry_after.map_or(exponential, |hint| hint.max(exponential)), MAX_BACKOFF)
	}
}

/// OAuth2 token endpoint and form parameters
#[derive(Clone)]
pub(crate) struct TokenRequest {
	/// Token endpoint
	pub(crate) url: Url,
	/// Form body of the grant
	pub(crate) form: Vec<(&'static str, String)>,
}

impl std::fmt::Debug for TokenRequest {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TokenRequest").field("url", &self.url).finish_non_exhaustive()
	}
}

/// OAuth2 token response
#[derive(Debug, Deserialize)]
struct OAuth2Token {
	/// Access token
	access_token: String,
}

/// Error envelope shared closely enough by both providers
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
	/// Error body
	error: ErrorBody,
}

/// Body of an error envelope
#[derive(Debug, Deserialize)]
struct ErrorBody {
	/// String code (Graph) or numeric code (Google)
	#[serde(default)]
	code: serde_json::Value,
	/// Message
	#[serde(default)]
	message: String,
	/// Detailed errors (Google)
	#[serde(default)]
	errors: Vec<ErrorDetail>,
}

/// Detailed error entry
#[derive(Debug, Deserialize)]
struct ErrorDetail {
	/// Machine-readable reason
	#[serde(default)]
	reason: String,
}

/// Outcome of a single attempt
enum Attempt {
	/// Done, successfully or not
	Done(Result<Response, ProviderError>),
	/// Worth retrying
	Retry {
		/// Why the attempt failed
		reason: String,
		/// Server-provided delay hint
		retry_after: Option<Duration>,
	},
}

/// HTTP transport that authenticates with a lazily fetched bearer token
pub(crate) struct Transport {
	/// Connection pool
	client: Client,
	/// Retry policy
	retry: RetryPolicy,
	/// How to obtain a token
	token_request: TokenRequest,
	/// Token, fetched on first use
	token: OnceCell<String>,
}

impl std::fmt::Debug for Transport {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Transport")
			.field("retry", &self.retry)
			.field("token_request", &self.token_request)
			.field("token", &self.token.initialized().then_some("***"))
			.finish_non_exhaustive()
	}
}

impl Transport {
	/// Create a transport
	pub(crate) fn new(client: Client, retry: RetryPolicy, token_request: TokenRequest) -> Self {
		Self { client, retry, token_request, token: OnceCell::new() }
	}

	/// GET a JSON document
	pub(crate) async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ProviderError> {
		tracing::debug!("Fetching {}", url);
		let response = self.execute(Method::GET, url, None).await?;
		response.json().await.map_err(|error| ProviderError::Decode(error.to_string()))
	}

	/// Send a request whose response body is not needed
	pub(crate) async fn send(
		&self,
		method: Method,
		url: Url,
		body: Option<&serde_json::Value>,
	) -> Result<(), ProviderError> {
		self.execute(method, url, body).await.map(|_| ())
	}

	/// Bearer token, exchanging the grant on first use
	async fn token(&self) -> Result<&str, ProviderError> {
		self.token.get_or_try_init(|| self.fetch_token()).await.map(String::as_str)
	}

	/// Exchange the configured grant for an access token
	async fn fetch_token(&self) -> Result<String, ProviderError> {
		let response = self
			.with_retry(move || async move {
				let result = self
					.client
					.post(self.token_request.url.clone())
					.form(&self.token_request.form)
					.send()
					.await;
				classify_response(result).await
			})
			.await
			.map_err(|error| match error {
				ProviderError::Rejected { status, code, message } => ProviderError::Unauthorized(
					format!("token exchange refused ({status} {code}): {message}"),
				),
				other => other,
			})?;

		let token: OAuth2Token = response
			.json()
			.await
			.map_err(|error| ProviderError::Decode(format!("invalid token response: {error}")))?;
		tracing::debug!("Obtained provider access token");
		Ok(token.access_token)
	}

	/// Send an authenticated request, retrying transient failures
	async fn execute(
		&self,
		method: Method,
		url: Url,
		body: Option<&serde_json::Value>,
	) -> Result<Response, ProviderError> {
		let token = self.token().await?;
		let (method, url) = (&method, &url);
		self.with_retry(move || async move {
			let mut request = self.client.request(method.clone(), url.clone()).bearer_auth(token);
			if let Some(body) = body {
				request = request.json(body);
			}
			classify_response(request.send().await).await
		})
		.await
	}

	/// Run `attempt` until it succeeds, fails permanently or the retry
	/// budget is exhausted
	async fn with_retry<F, Fut>(&self, attempt: F) -> Result<Response, ProviderError>
	where
		F: Fn() -> Fut,
		Fut: std::future::Future<Output = Attempt>,
	{
		let max_attempts = self.retry.max_attempts.max(1);
		let mut tries = 0;
		loop {
			tries += 1;
			match attempt().await {
				Attempt::Done(result) => return result,
				Attempt::Retry { reason, .. } if tries >= max_attempts => {
					return Err(ProviderError::Transient(format!(
						"{reason} (gave up after {tries} attempts)"
					)));
				}
				Attempt::Retry { reason, retry_after } => {
					let delay = self.retry.backoff(tries, retry_after);
					tracing::warn!(
						"Transient provider failure: {}, retry {}/{} after {:?}",
						reason,
						tries,
						max_attempts - 1,
						delay
					);
					tokio::time::sleep(delay).await;
				}
			}
		}
	}
}

/// Sort a response into success, permanent failure or retryable failure
async fn classify_response(result: Result<Response, reqwest::Error>) -> Attempt {
	let response = match result {
		Ok(response) => response,
		Err(error) if error.is_connect() || error.is_timeout() || error.is_request() => {
			return Attempt::Retry { reason: error.to_string(), retry_after: None };
		}
		Err(error) => return Attempt::Done(Err(ProviderError::Transient(error.to_string()))),
	};

	let status = response.status();
	if status.is_success() {
		return Attempt::Done(Ok(response));
	}
	let retry_after = response
		.headers()
		.get(RETRY_AFTER)
		.and_then(|value| value.to_str().ok())
		.and_then(|value| value.trim().parse::<u64>().ok())
		.map(Duration::from_secs);
	if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
		return Attempt::Retry { reason: format!("status {status}"), retry_after };
	}

	let body = response.text().await.unwrap_or_default();
	let error = rejected(status, &body);
	match status {
		// Google throttles with 403 and a rate-limit reason
		StatusCode::FORBIDDEN if is_rate_limited(&error) => {
			Attempt::Retry { reason: error.to_string(), retry_after }
		}
		StatusCode::FORBIDDEN => Attempt::Done(Err(ProviderError::Forbidden(error.to_string()))),
		StatusCode::UNAUTHORIZED => {
			Attempt::Done(Err(ProviderError::Unauthorized(error.to_string())))
		}
		_ => Attempt::Done(Err(error)),
	}
}

/// Error reasons that signal throttling or an exhausted quota
const RATE_LIMIT_REASONS: &[&str] =
	&["userRateLimitExceeded", "rateLimitExceeded", "quotaExceeded", "dailyLimitExceeded"];

/// Whether a rejection is a rate-limit or quota response
fn is_rate_limited(error: &ProviderError) -> bool {
	match error {
		ProviderError::Rejected { code, .. } => {
			RATE_LIMIT_REASONS.iter().any(|reason| reason.eq_ignore_ascii_case(code))
		}
		_ => false,
	}
}

/// Build a rejection from a status and an error body of either provider
fn rejected(status: StatusCode, body: &str) -> ProviderError {
	match serde_json::from_str::<ErrorEnvelope>(body) {
		Ok(ErrorEnvelope { error }) => {
			let code = match error.code {
				serde_json::Value::String(code) => code,
				_ => error
					.errors
					.first()
					.map(|detail| detail.reason.clone())
					.unwrap_or_else(|| status.canonical_reason().unwrap_or_default().to_owned()),
			};
			ProviderError::Rejected { status, code, message: error.message }
		}
		Err(_) => ProviderError::Rejected {
			status,
			code: status.canonical_reason().unwrap_or_default().to_owned(),
			message: body.to_owned(),
		},
	}
}

/// Append path segments to a base URL, percent-encoding each segment
pub(crate) fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, ProviderError> {
	let mut url = base.clone();
	url.path_segments_mut()
		.map_err(|()| ProviderError::Decode(format!("{base} cannot be used as a base URL")))?
		.pop_if_empty()
		.extend(segments);
	Ok(url)
}

#[cfg(test)]
mod tests {
	#![allow(clippy::expect_used, clippy::unwrap_used)]

	use wiremock::{
		matchers::{body_string_contains, header, method, path},
		Mock, MockServer, ResponseTemplate,
	};

	use super::*;
	use crate::error::SyncError;

	fn transport(server: &MockServer) -> Transport {
		Transport::new(
			Client::new(),
			RetryPolicy { max_attempts: 3, base_delay: Duration::from_millis(5) },
			TokenRequest {
				url: Url::parse(&format!("{}/token", server.uri())).unwrap(),
				form: vec![("grant_type", "client_credentials".to_owned())],
			},
		)
	}

	async fn mount_token(server: &MockServer) {
		Mock::given(method("POST"))
			.and(path("/token"))
			.and(body_string_contains("grant_type=client_credentials"))
			.respond_with(
				ResponseTemplate::new(200)
					.set_body_json(serde_json::json!({"access_token": "mock_token"})),
			)
			.expect(1)
			.mount(server)
			.await;
	}

	#[test]
	fn test_backoff_grows_and_honours_retry_after() {
		let policy = RetryPolicy { max_attempts: 5, base_delay: Duration::from_millis(100) };
		assert_eq!(policy.backoff(1, None), Duration::from_millis(100));
		assert_eq!(policy.backoff(3, None), Duration::from_millis(400));
		assert_eq!(policy.backoff(1, Some(Duration::from_secs(2))), Duration::from_secs(2));
		assert_eq!(policy.backoff(1, Some(Duration::from_secs(600))), MAX_BACKOFF);
	}

	#[test]
	fn test_endpoint_encodes_segments() {
		let base = Url::parse("https://example.com/admin/directory/v1/").unwrap();
		let url = endpoint(&base, &["groups", "a b@example.com", "members"]).unwrap();
		assert_eq!(url.as_str(), "https://example.com/admin/directory/v1/groups/a%20b@example.com/members");
	}

	#[tokio::test]
	async fn test_retries_transient_failures() {
		let server = MockServer::start().await;
		mount_token(&server).await;
		Mock::given(method("GET"))
			.and(path("/users"))
			.respond_with(ResponseTemplate::new(503))
			.up_to_n_times(2)
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/users"))
			.and(header("Authorization", "Bearer mock_token"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
			.mount(&server)
			.await;

		let transport = transport(&server);
		let url = Url::parse(&format!("{}/users", server.uri())).unwrap();
		let body: serde_json::Value = transport.get_json(url).await.expect("request failed");
		assert_eq!(body["ok"], true);
	}

	#[tokio::test]
	async fn test_gives_up_after_max_attempts() {
		let server = MockServer::start().await;
		mount_token(&server).await;
		Mock::given(method("GET"))
			.and(path("/users"))
			.respond_with(ResponseTemplate::new(429))
			.expect(3)
			.mount(&server)
			.await;

		let transport = transport(&server);
		let url = Url::parse(&format!("{}/users", server.uri())).unwrap();
		let error = transport.get_json::<serde_json::Value>(url).await.expect_err("should fail");
		assert!(matches!(error, ProviderError::Transient(_)), "unexpected error: {error:?}");
	}

	#[tokio::test]
	async fn test_auth_and_rejection_errors_are_not_retried() {
		let server = MockServer::start().await;
		mount_token(&server).await;
		Mock::given(method("GET"))
			.and(path("/forbidden"))
			.respond_with(ResponseTemplate::new(403))
			.expect(1)
			.mount(&server)
			.await;
		Mock::given(method("POST"))
			.and(path("/members"))
			.respond_with(ResponseTemplate::new(409).set_body_string(
				r#"{"error": {"code": 409, "message": "Member already exists.", "errors": [{"reason": "duplicate"}]}}"#,
			))
			.expect(1)
			.mount(&server)
			.await;

		let transport = transport(&server);
		let url = Url::parse(&format!("{}/forbidden", server.uri())).unwrap();
		let error = transport.get_json::<serde_json::Value>(url).await.expect_err("should fail");
		assert!(matches!(error, ProviderError::Forbidden(_)), "unexpected error: {error:?}");
		assert_eq!(error.status_code(), Some(403));

		let url = Url::parse(&format!("{}/members", server.uri())).unwrap();
		let error = transport
			.send(Method::POST, url, Some(&serde_json::json!({"id": "u1"})))
			.await
			.expect_err("should fail");
		match error {
			ProviderError::Rejected { status, code, message } => {
				assert_eq!(status, StatusCode::CONFLICT);
				assert_eq!(code, "duplicate");
				assert_eq!(message, "Member already exists.");
			}
			other => panic!("unexpected error: {other:?}"),
		}
	}

	const RATE_LIMITED_BODY: &str = r#"{"error": {"code": 403, "message": "User Rate Limit Exceeded", "errors": [{"reason": "userRateLimitExceeded"}]}}"#;

	#[tokio::test]
	async fn test_rate_limited_forbidden_is_retried() {
		let server = MockServer::start().await;
		mount_token(&server).await;
		Mock::given(method("GET"))
			.and(path("/users"))
			.respond_with(ResponseTemplate::new(403).set_body_string(RATE_LIMITED_BODY))
			.up_to_n_times(2)
			.expect(2)
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/users"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
			.expect(1)
			.mount(&server)
			.await;

		let transport = transport(&server);
		let url = Url::parse(&format!("{}/users", server.uri())).unwrap();
		let body: serde_json::Value = transport.get_json(url).await.expect("request failed");
		assert_eq!(body["ok"], true);
	}

	#[tokio::test]
	async fn test_persistent_rate_limit_is_transient() {
		let server = MockServer::start().await;
		mount_token(&server).await;
		Mock::given(method("GET"))
			.and(path("/users"))
			.respond_with(ResponseTemplate::new(403).set_body_string(RATE_LIMITED_BODY))
			.expect(3)
			.mount(&server)
			.await;

		let transport = transport(&server);
		let url = Url::parse(&format!("{}/users", server.uri())).unwrap();
		let error = transport.get_json::<serde_json::Value>(url).await.expect_err("should fail");
		assert!(matches!(error, ProviderError::Transient(_)), "unexpected error: {error:?}");
		assert!(!SyncError::from(error).is_credential_error());
	}

	#[tokio::test]
	async fn test_refused_token_exchange_is_unauthorized() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/token"))
			.respond_with(ResponseTemplate::new(400).set_body_string(
				r#"{"error": "invalid_grant", "error_description": "Bad Request"}"#,
			))
			.mount(&server)
			.await;

		let transport = transport(&server);
		let url = Url::parse(&format!("{}/users", server.uri())).unwrap();
		let error = transport.get_json::<serde_json::Value>(url).await.expect_err("should fail");
		assert!(matches!(error, ProviderError::Unauthorized(_)), "unexpected error: {error:?}");
	}
}
