use std::time::Instant;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::AppState;
use crate::proxy::{self, ChatRequest};
use crate::selector::Candidate;

/// Outcome of the latest probe for one (model, provider) binding. Each probe
/// overwrites the previous result.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResult {
	pub last_checked: DateTime<Utc>,
	pub ok: bool,
	pub latency_ms: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

/// model -> provider -> last probe result.
pub type HealthMatrix = IndexMap<String, IndexMap<String, HealthResult>>;

#[derive(Default)]
pub struct HealthStore {
	inner: Mutex<HealthMatrix>,
}

impl HealthStore {
	pub fn record(&self, model: &str, provider: &str, result: HealthResult) {
		let mut matrix = self.inner.lock();
		matrix
			.entry(model.to_string())
			.or_default()
			.insert(provider.to_string(), result);
	}

	pub fn matrix(&self) -> HealthMatrix {
		self.inner.lock().clone()
	}
}

/// Probes every binding, or just the requested (model, provider) pair.
pub async fn probe(state: &AppState, model: Option<&str>, provider: Option<&str>) -> HealthMatrix {
	let doc = state.stores.config.snapshot();
	let pairs: Vec<(String, String, Option<String>)> = doc
		.model_config
		.iter()
		.filter(|(m, _)| model.is_none_or(|want| want == m.as_str()))
		.flat_map(|(m, bindings)| {
			bindings
				.iter()
				.filter(|(p, _)| provider.is_none_or(|want| want == p.as_str()))
				.map(|(p, b)| (m.clone(), p.clone(), b.alias.clone()))
		})
		.collect();

	for (model, provider, alias) in pairs {
		let result = probe_one(state, &model, &provider, alias.as_deref()).await;
		debug!(model = %model, provider = %provider, ok = result.ok, "health probe");
		state.stores.health.record(&model, &provider, result);
	}
	state.stores.health.matrix()
}

/// A minimal one-message chat call through the normal engine path with a
/// single fixed target. It reserves and commits like any other call, so the
/// probe shows up in quota usage.
async fn probe_one(
	state: &AppState,
	model: &str,
	provider: &str,
	alias: Option<&str>,
) -> HealthResult {
	let doc = state.stores.config.snapshot();
	let last_checked = Utc::now();
	let Some(p) = doc.api_provider.get(provider) else {
		return HealthResult {
			last_checked,
			ok: false,
			latency_ms: 0,
			error: Some(format!("provider {provider:?} not configured")),
		};
	};
	let cand = Candidate {
		provider: provider.to_string(),
		upstream_model: alias.unwrap_or(model).to_string(),
	};
	let mut req: ChatRequest = serde_json::from_value(json!({
		"model": model,
		"messages": [{"role": "user", "content": "ping"}],
		"max_tokens": 1,
	}))
	.expect("probe request shape is valid");
	let hint = req.tokens_hint();

	let start = Instant::now();
	let outcome = proxy::attempt(state, p, &cand, model, &mut req, hint, false).await;
	let latency_ms = start.elapsed().as_millis() as u64;
	match outcome {
		Ok(_) => HealthResult { last_checked, ok: true, latency_ms, error: None },
		Err(e) => HealthResult {
			last_checked,
			ok: false,
			latency_ms,
			error: Some(e.to_string()),
		},
	}
}
