use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use secrecy::ExposeSecret;
use tracing::debug;

use crate::store::Provider;

/// Bound applied when a provider declares no timeout of its own.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// How much of an upstream error body we keep for diagnostics.
const ERROR_BODY_LIMIT: usize = 4096;

#[derive(thiserror::Error, Debug, Clone)]
pub enum UpstreamError {
	#[error("transport error calling {provider}: {message}")]
	Transport { provider: String, message: String },
	#[error("{provider} returned HTTP {status}")]
	Http { provider: String, status: StatusCode, body: String },
	#[error("malformed response from {provider}: {message}")]
	Malformed { provider: String, message: String },
}

impl UpstreamError {
	pub fn kind(&self) -> &'static str {
		match self {
			UpstreamError::Transport { .. } => "upstream_transport",
			UpstreamError::Http { .. } => "upstream_http_error",
			UpstreamError::Malformed { .. } => "upstream_malformed",
		}
	}
}

/// Thin wrapper over one shared connection pool. Credentials and base URLs
/// come from the provider entry on every call, so config edits take effect
/// without rebuilding the client.
#[derive(Clone)]
pub struct UpstreamClient {
	http: reqwest::Client,
}

impl Default for UpstreamClient {
	fn default() -> Self {
		UpstreamClient::new()
	}
}

impl UpstreamClient {
	pub fn new() -> Self {
		let http = reqwest::Client::builder()
			.build()
			.expect("default client configuration is valid");
		UpstreamClient { http }
	}

	/// Sends a chat-completions request and returns the raw response once
	/// status and headers have arrived. The body has not been read yet, so
	/// the caller decides between buffering and streaming. Errors here are
	/// always pre-send from the caller's point of view.
	pub async fn call(
		&self,
		name: &str,
		provider: &Provider,
		body: Bytes,
	) -> Result<reqwest::Response, UpstreamError> {
		let url = chat_completions_url(provider);
		let timeout = provider.timeout().unwrap_or(DEFAULT_TIMEOUT);
		let mut auth = HeaderValue::from_str(&format!("Bearer {}", provider.api_key.expose_secret()))
			.map_err(|_| UpstreamError::Malformed {
				provider: name.to_string(),
				message: "api key is not a valid header value".to_string(),
			})?;
		auth.set_sensitive(true);

		let start = Instant::now();
		let fut = self
			.http
			.post(&url)
			.header(AUTHORIZATION, auth)
			.header(CONTENT_TYPE, "application/json")
			.body(body)
			.send();
		let resp = tokio::time::timeout(timeout, fut)
			.await
			.map_err(|_| UpstreamError::Transport {
				provider: name.to_string(),
				message: format!("request timed out after {}s", timeout.as_secs()),
			})?
			.map_err(|e| UpstreamError::Transport {
				provider: name.to_string(),
				message: e.to_string(),
			})?;
		debug!(
			provider = name,
			url = %url,
			status = resp.status().as_u16(),
			duration_ms = start.elapsed().as_millis() as u64,
			"upstream request"
		);

		let status = resp.status();
		if !status.is_success() {
			let mut body = tokio::time::timeout(timeout, resp.text())
				.await
				.ok()
				.and_then(Result::ok)
				.unwrap_or_default();
			truncate_on_char_boundary(&mut body, ERROR_BODY_LIMIT);
			return Err(UpstreamError::Http { provider: name.to_string(), status, body });
		}
		Ok(resp)
	}

	/// Buffers the full response body, bounded by the provider timeout.
	pub async fn read_body(
		&self,
		name: &str,
		provider: &Provider,
		resp: reqwest::Response,
	) -> Result<Bytes, UpstreamError> {
		let timeout = provider.timeout().unwrap_or(DEFAULT_TIMEOUT);
		tokio::time::timeout(timeout, resp.bytes())
			.await
			.map_err(|_| UpstreamError::Transport {
				provider: name.to_string(),
				message: format!("response body timed out after {}s", timeout.as_secs()),
			})?
			.map_err(|e| UpstreamError::Transport {
				provider: name.to_string(),
				message: e.to_string(),
			})
	}
}

fn truncate_on_char_boundary(s: &mut String, max: usize) {
	if s.len() > max {
		let mut cut = max;
		while !s.is_char_boundary(cut) {
			cut -= 1;
		}
		s.truncate(cut);
	}
}

fn chat_completions_url(provider: &Provider) -> String {
	format!(
		"{}/chat/completions",
		provider.base_url.as_str().trim_end_matches('/')
	)
}
