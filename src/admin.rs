use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::{get, post};
use indexmap::IndexMap;
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::ratelimit::LimiterStatus;
use crate::serdes::yamlviajson;
use crate::store::{BindingEdit, ConfigError, LimitField, RouteDoc};
use crate::{AppState, health};

#[derive(thiserror::Error, Debug)]
enum AdminError {
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error("unknown provider {0:?}")]
	UnknownProvider(String),
}

impl IntoResponse for AdminError {
	fn into_response(self) -> Response {
		let status = match &self {
			AdminError::UnknownProvider(_)
			| AdminError::Config(ConfigError::UnknownModel(_) | ConfigError::MissingProvider(_)) => {
				StatusCode::NOT_FOUND
			},
			AdminError::Config(_) => StatusCode::BAD_REQUEST,
		};
		(status, Json(json!({"error": self.to_string()}))).into_response()
	}
}

pub fn router() -> Router<AppState> {
	Router::new()
		.route("/healthz", get(|| async { "ok" }))
		.route("/admin", get(admin_page))
		.route("/admin/config", get(get_config).post(put_config))
		.route("/admin/config/binding", post(edit_binding))
		.route("/admin/config/limit", post(edit_limit))
		.route("/admin/config/key", post(edit_key))
		.route("/admin/config/base_url", post(edit_base_url))
		.route("/admin/limits", get(limits_status))
		.route("/admin/limits/{provider}/reset", post(reset_limits))
		.route("/admin/health", get(health_matrix).post(run_probes))
		.route("/api_usage", get(usage_summary))
		.route("/api_usage/recent", get(usage_recent))
		.route("/api_usage/clear", post(usage_clear))
}

async fn admin_page() -> Html<&'static str> {
	Html(include_str!("assets/admin.html"))
}

async fn get_config(State(state): State<AppState>) -> Json<RouteDoc> {
	Json(RouteDoc::clone(&state.stores.config.snapshot()))
}

/// Replaces the whole routing document. The body may be YAML or JSON; both
/// land on the same parse path.
async fn put_config(State(state): State<AppState>, body: String) -> Result<Json<Value>, AdminError> {
	let doc: RouteDoc = yamlviajson::from_str(&body).map_err(ConfigError::Parse)?;
	state.stores.config.replace(doc)?;
	prune_limiters(&state);
	info!("routing document replaced via admin");
	Ok(Json(json!({"ok": true})))
}

#[derive(Debug, Deserialize)]
struct BindingEditRequest {
	model: String,
	provider: String,
	#[serde(flatten)]
	edit: BindingEdit,
}

async fn edit_binding(
	State(state): State<AppState>,
	Json(req): Json<BindingEditRequest>,
) -> Result<Json<Value>, AdminError> {
	state
		.stores
		.config
		.update_binding(&req.model, &req.provider, req.edit)?;
	Ok(Json(json!({"ok": true})))
}

#[derive(Debug, Deserialize)]
struct LimitEditRequest {
	provider: String,
	field: LimitField,
	value: Option<u64>,
}

async fn edit_limit(
	State(state): State<AppState>,
	Json(req): Json<LimitEditRequest>,
) -> Result<Json<Value>, AdminError> {
	state.stores.config.update_limit(&req.provider, req.field, req.value)?;
	Ok(Json(json!({"ok": true})))
}

#[derive(Debug, Deserialize)]
struct KeyEditRequest {
	provider: String,
	value: String,
}

async fn edit_key(
	State(state): State<AppState>,
	Json(req): Json<KeyEditRequest>,
) -> Result<Json<Value>, AdminError> {
	state
		.stores
		.config
		.set_key(&req.provider, SecretString::from(req.value))?;
	Ok(Json(json!({"ok": true})))
}

#[derive(Debug, Deserialize)]
struct BaseUrlEditRequest {
	provider: String,
	value: url::Url,
}

async fn edit_base_url(
	State(state): State<AppState>,
	Json(req): Json<BaseUrlEditRequest>,
) -> Result<Json<Value>, AdminError> {
	state.stores.config.set_base_url(&req.provider, req.value)?;
	Ok(Json(json!({"ok": true})))
}

async fn limits_status(State(state): State<AppState>) -> Json<IndexMap<String, LimiterStatus>> {
	let doc = state.stores.config.snapshot();
	let statuses = doc
		.api_provider
		.iter()
		.map(|(name, p)| (name.clone(), state.stores.limiters.get(name).status(&p.limits)))
		.collect();
	Json(statuses)
}

async fn reset_limits(
	State(state): State<AppState>,
	Path(provider): Path<String>,
) -> Result<Json<Value>, AdminError> {
	if !state.stores.config.snapshot().api_provider.contains_key(&provider) {
		return Err(AdminError::UnknownProvider(provider));
	}
	state.stores.limiters.get(&provider).reset();
	info!(provider = %provider, "counters reset via admin");
	Ok(Json(json!({"ok": true})))
}

#[derive(Debug, Default, Deserialize)]
struct ProbeQuery {
	model: Option<String>,
	provider: Option<String>,
}

async fn health_matrix(State(state): State<AppState>) -> Json<health::HealthMatrix> {
	Json(state.stores.health.matrix())
}

async fn run_probes(
	State(state): State<AppState>,
	Query(q): Query<ProbeQuery>,
) -> Json<health::HealthMatrix> {
	Json(health::probe(&state, q.model.as_deref(), q.provider.as_deref()).await)
}

async fn usage_summary(State(state): State<AppState>) -> Json<Value> {
	Json(json!({"providers": state.stores.ledger.summary_by_provider()}))
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
	#[serde(default = "default_recent")]
	n: usize,
}

fn default_recent() -> usize {
	100
}

async fn usage_recent(State(state): State<AppState>, Query(q): Query<RecentQuery>) -> Json<Value> {
	Json(json!({"records": state.stores.ledger.recent(q.n)}))
}

async fn usage_clear(State(state): State<AppState>) -> Json<Value> {
	state.stores.ledger.clear();
	Json(json!({"ok": true}))
}

// Limiters whose provider disappeared from the document are dropped;
// surviving providers keep their counters.
fn prune_limiters(state: &AppState) {
	let doc = state.stores.config.snapshot();
	state
		.stores
		.limiters
		.retain(doc.api_provider.keys().map(String::as_str));
}
