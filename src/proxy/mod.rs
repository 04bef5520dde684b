pub mod sse;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::client::{DEFAULT_TIMEOUT, UpstreamError};
use crate::ledger::{CallStatus, Ledger, UsageRecord};
use crate::ratelimit::{Limiter, Ticket, estimate_tokens};
use crate::selector::{self, Candidate, NoProviderAvailable};
use crate::store::{AUTO_MODEL, Provider};
use self::sse::SseEvent;
use crate::AppState;

/// An OpenAI-shaped chat request. Only the fields the gateway itself needs
/// are typed; everything else rides along in `rest` and is forwarded
/// verbatim, so callers can use any request feature the upstream supports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
	pub model: String,
	#[serde(flatten)]
	pub rest: serde_json::Map<String, Value>,
}

impl ChatRequest {
	pub fn stream(&self) -> bool {
		self.rest.get("stream").and_then(Value::as_bool).unwrap_or(false)
	}

	pub fn max_tokens(&self) -> Option<u64> {
		self
			.rest
			.get("max_tokens")
			.or_else(|| self.rest.get("max_completion_tokens"))
			.and_then(Value::as_u64)
	}

	/// Character count of all message content, the input to the coarse
	/// token estimate.
	pub fn prompt_chars(&self) -> usize {
		let Some(messages) = self.rest.get("messages").and_then(Value::as_array) else {
			return 0;
		};
		messages
			.iter()
			.filter_map(|m| m.get("content"))
			.map(content_chars)
			.sum()
	}

	/// The admission hint: the caller's ceiling when given, otherwise the
	/// prompt estimate. None only when there is nothing to estimate from.
	pub fn tokens_hint(&self) -> Option<u64> {
		if let Some(max) = self.max_tokens() {
			return Some(max);
		}
		match self.prompt_chars() {
			0 => None,
			chars => Some(estimate_tokens(chars)),
		}
	}
}

fn content_chars(content: &Value) -> usize {
	match content {
		Value::String(s) => s.chars().count(),
		// Multi-part content counts its text parts.
		Value::Array(parts) => parts
			.iter()
			.filter_map(|p| p.get("text").and_then(Value::as_str))
			.map(|t| t.chars().count())
			.sum(),
		_ => 0,
	}
}

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error(transparent)]
	NoProvider(#[from] NoProviderAvailable),
	#[error("all providers failed for model {model:?}: {last}")]
	AllFailed { model: String, last: UpstreamError },
	#[error("invalid request: {0}")]
	InvalidRequest(String),
}

impl IntoResponse for ProxyError {
	fn into_response(self) -> Response {
		let (status, body) = match &self {
			ProxyError::NoProvider(e) => (
				StatusCode::SERVICE_UNAVAILABLE,
				json!({"error": {
					"type": "no_provider_available",
					"message": self.to_string(),
					"reasons": e.reasons,
				}}),
			),
			ProxyError::AllFailed { last, .. } => (
				StatusCode::BAD_GATEWAY,
				json!({"error": {
					"type": last.kind(),
					"message": self.to_string(),
				}}),
			),
			ProxyError::InvalidRequest(_) => (
				StatusCode::BAD_REQUEST,
				json!({"error": {
					"type": "invalid_request_error",
					"message": self.to_string(),
				}}),
			),
		};
		(status, axum::Json(body)).into_response()
	}
}

pub fn router() -> Router<AppState> {
	Router::new()
		.route("/v1/chat/completions", post(chat_completions))
		.route("/v1/models", get(models))
}

/// The critical path: selection, reserve, upstream call, relay, accounting,
/// with failover across candidates until a response byte has been committed
/// to the caller.
async fn chat_completions(
	State(state): State<AppState>,
	body: Bytes,
) -> Result<Response, ProxyError> {
	let mut req: ChatRequest = serde_json::from_slice(&body)
		.map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
	if req.model.is_empty() {
		return Err(ProxyError::InvalidRequest("model must not be empty".to_string()));
	}

	let doc = state.stores.config.snapshot();
	let hint = req.tokens_hint();
	let stream = req.stream();
	let model = req.model.clone();
	let candidates = selector::candidates(&doc, &state.stores.limiters, &model, hint)?;

	let mut last_err: Option<UpstreamError> = None;
	for cand in &candidates {
		let Some(provider) = doc.api_provider.get(&cand.provider) else {
			continue;
		};
		match attempt(&state, provider, cand, &model, &mut req, hint, stream).await {
			Ok(resp) => return Ok(resp),
			Err(e) => {
				warn!(model = %model, provider = %cand.provider, error = %e, "attempt failed, trying next candidate");
				last_err = Some(e);
			},
		}
	}
	let last = last_err.unwrap_or(UpstreamError::Transport {
		provider: String::new(),
		message: "no candidate was attempted".to_string(),
	});
	Err(ProxyError::AllFailed { model, last })
}

/// One reserve/call/settle cycle against a single provider. An `Err` here
/// means nothing was relayed to the caller, the reserve has been rolled
/// back, and failover may continue.
pub(crate) async fn attempt(
	state: &AppState,
	provider: &Provider,
	cand: &Candidate,
	logical_model: &str,
	req: &mut ChatRequest,
	hint: Option<u64>,
	stream: bool,
) -> Result<Response, UpstreamError> {
	let started_at = Utc::now();
	let limiter = state.stores.limiters.get(&cand.provider);
	// The guard owns the reserve from here on. Dropping it unsettled (the
	// caller went away mid-call) commits the best estimate, so a reserve can
	// never leak no matter where this future is abandoned.
	let mut acct = CallAccounting {
		ticket: Some(limiter.reserve()),
		limiter,
		ledger: state.stores.ledger.clone(),
		model: logical_model.to_string(),
		provider: cand.provider.clone(),
		started_at,
		hint,
		usage: None,
		delta_chars: 0,
	};

	// The model rewrite is the only change made to the caller's body.
	req.model = cand.upstream_model.clone();
	let body = Bytes::from(
		serde_json::to_vec(req).expect("json object with string keys serializes"),
	);

	let resp = match state.client.call(&cand.provider, provider, body).await {
		Ok(resp) => resp,
		Err(e) => {
			acct.rollback();
			record_failure(state, started_at, logical_model, cand, &e);
			return Err(e);
		},
	};

	if stream {
		let idle = provider.timeout().unwrap_or(DEFAULT_TIMEOUT);
		return Ok(relay_stream(resp, acct, idle));
	}

	let bytes = match state.client.read_body(&cand.provider, provider, resp).await {
		Ok(b) => b,
		Err(e) => {
			acct.rollback();
			record_failure(state, started_at, logical_model, cand, &e);
			return Err(e);
		},
	};
	let parsed: Value = match serde_json::from_slice(&bytes) {
		Ok(v) => v,
		Err(e) => {
			let e = UpstreamError::Malformed {
				provider: cand.provider.clone(),
				message: format!("response body is not JSON: {e}"),
			};
			acct.rollback();
			record_failure(state, started_at, logical_model, cand, &e);
			return Err(e);
		},
	};

	acct.usage = parsed
		.get("usage")
		.cloned()
		.and_then(|u| serde_json::from_value::<Usage>(u).ok());
	acct.delta_chars = response_chars(&parsed);
	let total = acct.total();
	acct.settle(CallStatus::Ok, None);
	debug!(
		model = logical_model,
		provider = %cand.provider,
		total_tokens = total,
		"proxied chat completion"
	);

	Ok(
		Response::builder()
			.status(StatusCode::OK)
			.header(header::CONTENT_TYPE, "application/json")
			.body(Body::from(bytes))
			.expect("builder with known status code should not fail"),
	)
}

fn record_failure(
	state: &AppState,
	started_at: DateTime<Utc>,
	logical_model: &str,
	cand: &Candidate,
	err: &UpstreamError,
) {
	state.stores.ledger.append(UsageRecord {
		started_at,
		finished_at: Utc::now(),
		model: logical_model.to_string(),
		provider: cand.provider.clone(),
		prompt_tokens: None,
		completion_tokens: None,
		total_tokens: 0,
		status: CallStatus::Failed,
		error: Some(format!("{}: {err}", err.kind())),
	});
}

// Sum of choice message content, the fallback completion-size signal when the
// upstream response carries no usage block.
fn response_chars(body: &Value) -> usize {
	let Some(choices) = body.get("choices").and_then(Value::as_array) else {
		return 0;
	};
	choices
		.iter()
		.filter_map(|c| c.pointer("/message/content").and_then(Value::as_str))
		.map(|t| t.chars().count())
		.sum()
}

#[derive(Debug, Clone, Deserialize)]
struct Usage {
	prompt_tokens: Option<u64>,
	completion_tokens: Option<u64>,
	total_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
	#[serde(default)]
	choices: Vec<StreamChoice>,
	usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
	#[serde(default)]
	delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
	content: Option<String>,
}

/// Token bookkeeping for one reserved attempt, streamed or not. Settling
/// commits the reserve exactly once; rollback undoes it on pre-send failure;
/// dropping unsettled (the caller went away) commits whatever was observed
/// so far, so a reserve can never leak.
struct CallAccounting {
	limiter: Arc<Limiter>,
	ticket: Option<Ticket>,
	ledger: Ledger,
	model: String,
	provider: String,
	started_at: DateTime<Utc>,
	hint: Option<u64>,
	usage: Option<Usage>,
	delta_chars: usize,
}

impl CallAccounting {
	fn rollback(&mut self) {
		if let Some(ticket) = self.ticket.take() {
			self.limiter.rollback(ticket);
		}
	}

	fn observe(&mut self, chunk: &StreamChunk) {
		for choice in &chunk.choices {
			if let Some(content) = &choice.delta.content {
				self.delta_chars += content.chars().count();
			}
		}
		if let Some(usage) = &chunk.usage {
			self.usage = Some(usage.clone());
		}
	}

	fn total(&self) -> u64 {
		match self.usage.as_ref().and_then(|u| u.total_tokens) {
			Some(total) => total,
			None => self.hint.unwrap_or(0) + estimate_tokens(self.delta_chars),
		}
	}

	fn settle(&mut self, status: CallStatus, error: Option<String>) {
		let Some(ticket) = self.ticket.take() else {
			return;
		};
		let total = self.total();
		self.limiter.commit(ticket, total);
		self.ledger.append(UsageRecord {
			started_at: self.started_at,
			finished_at: Utc::now(),
			model: self.model.clone(),
			provider: self.provider.clone(),
			prompt_tokens: self.usage.as_ref().and_then(|u| u.prompt_tokens),
			completion_tokens: self.usage.as_ref().and_then(|u| u.completion_tokens),
			total_tokens: total,
			status,
			error,
		});
	}
}

impl Drop for CallAccounting {
	fn drop(&mut self) {
		if self.ticket.is_some() {
			self.settle(
				CallStatus::ClientDisconnect,
				Some("client disconnected before completion".to_string()),
			);
		}
	}
}

fn synthetic_error_event(kind: &str, message: &str) -> Bytes {
	let payload = json!({"error": {"type": kind, "message": message}});
	Bytes::from(format!("data: {payload}\n\n"))
}

/// Forwards upstream SSE bytes to the caller unchanged while watching them
/// for usage and the `[DONE]` marker. Once the first byte is out, there is no
/// failover: mid-stream faults surface as a synthetic error event and the
/// reserve is committed with whatever was observed.
fn relay_stream(
	upstream: reqwest::Response,
	mut acct: CallAccounting,
	idle: Duration,
) -> Response {
	let provider = acct.provider.clone();
	let body = async_stream::stream! {
		let mut upstream = upstream.bytes_stream();
		let mut scanner = sse::SseScanner::new();
		loop {
			let next = tokio::time::timeout(idle, upstream.next()).await;
			let chunk = match next {
				Err(_) => {
					// Idle timeout mid-stream aborts; bytes are already downstream.
					let msg = format!("stream from {provider} idle for {}s", idle.as_secs());
					warn!(provider = %provider, "{msg}");
					acct.settle(CallStatus::StreamAborted, Some(format!("upstream_transport: {msg}")));
					yield Ok::<_, std::convert::Infallible>(synthetic_error_event("upstream_transport", &msg));
					break;
				},
				Ok(None) => {
					// Clean end of stream, with or without a trailing [DONE].
					if let Some(sse::SseEvent::Data(data)) = scanner.finish()
						&& let Ok(chunk) = serde_json::from_str::<StreamChunk>(&data)
					{
						acct.observe(&chunk);
					}
					acct.settle(CallStatus::Ok, None);
					break;
				},
				Ok(Some(Err(e))) => {
					let msg = format!("stream from {provider} failed: {e}");
					warn!(provider = %provider, "{msg}");
					acct.settle(CallStatus::StreamAborted, Some(format!("upstream_transport: {msg}")));
					yield Ok(synthetic_error_event("upstream_transport", &msg));
					break;
				},
				Ok(Some(Ok(chunk))) => chunk,
			};

			let mut malformed: Option<String> = None;
			for event in scanner.push(&chunk) {
				match event {
					SseEvent::Done => {},
					SseEvent::Data(data) => match serde_json::from_str::<StreamChunk>(&data) {
						Ok(parsed) => acct.observe(&parsed),
						Err(e) => {
							malformed = Some(format!("unparseable stream event from {provider}: {e}"));
							break;
						},
					},
				}
			}
			if let Some(msg) = malformed {
				warn!(provider = %provider, "{msg}");
				acct.settle(CallStatus::StreamAborted, Some(format!("upstream_malformed: {msg}")));
				yield Ok(synthetic_error_event("upstream_malformed", &msg));
				break;
			}
			yield Ok(chunk);
		}
	};

	Response::builder()
		.status(StatusCode::OK)
		.header(header::CONTENT_TYPE, "text/event-stream")
		.header(header::CACHE_CONTROL, "no-cache")
		.body(Body::from_stream(body))
		.expect("builder with known status code should not fail")
}

/// Declared logical models plus the `auto` alias.
async fn models(State(state): State<AppState>) -> axum::Json<Value> {
	let doc = state.stores.config.snapshot();
	let data: Vec<Value> = doc
		.model_config
		.keys()
		.map(String::as_str)
		.chain([AUTO_MODEL])
		.map(|id| json!({"id": id, "object": "model", "owned_by": "modelgateway"}))
		.collect();
	axum::Json(json!({"object": "list", "data": data}))
}
