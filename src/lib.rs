pub mod admin;
pub mod client;
pub mod config;
pub mod health;
pub mod ledger;
pub mod proxy;
pub mod ratelimit;
pub mod selector;
pub mod serdes;
pub mod store;

use std::sync::Arc;

use axum::Router;
use tracing::info;

use crate::client::UpstreamClient;
use crate::health::HealthStore;
use crate::ledger::Ledger;
use crate::ratelimit::Registry;
use crate::store::ConfigStore;

/// All shared mutable state. The config store publishes immutable snapshots;
/// the rest are independently locked, so no request path ever holds more
/// than one lock at a time.
pub struct Stores {
	pub config: ConfigStore,
	pub limiters: Registry,
	pub ledger: Ledger,
	pub health: HealthStore,
}

impl Stores {
	pub fn new(config: ConfigStore) -> Self {
		Stores {
			config,
			limiters: Registry::default(),
			ledger: Ledger::default(),
			health: HealthStore::default(),
		}
	}
}

#[derive(Clone)]
pub struct AppState {
	pub stores: Arc<Stores>,
	pub client: UpstreamClient,
}

impl AppState {
	pub fn new(stores: Stores) -> Self {
		AppState {
			stores: Arc::new(stores),
			client: UpstreamClient::new(),
		}
	}
}

/// The complete HTTP surface: the OpenAI-compatible data plane plus the
/// admin plane, on one listener.
pub fn app(state: AppState) -> Router {
	Router::new()
		.merge(proxy::router())
		.merge(admin::router())
		.with_state(state)
}

pub async fn run(cfg: config::Config) -> anyhow::Result<()> {
	let store = ConfigStore::load(&cfg.document, cfg.document_path)?;
	let state = AppState::new(Stores::new(store));
	let listener = tokio::net::TcpListener::bind(cfg.bind).await?;
	info!(addr = %listener.local_addr()?, "modelgateway listening");
	axum::serve(listener, app(state))
		.with_graceful_shutdown(shutdown_signal())
		.await?;
	info!("shutdown complete");
	Ok(())
}

async fn shutdown_signal() {
	let _ = tokio::signal::ctrl_c().await;
	info!("shutdown signal received");
}
