use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, Serializer};
use tracing::{debug, info};
use url::Url;

use crate::serdes::yamlviajson;

/// The logical model name that resolves to the first enabled binding across
/// the whole document instead of a configured entry.
pub const AUTO_MODEL: &str = "auto";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
	pub base_url: Url,
	#[serde(serialize_with = "expose_key")]
	pub api_key: SecretString,
	#[serde(default, skip_serializing_if = "Limits::is_empty")]
	pub limits: Limits,
	/// Connect and idle-read bound for upstream calls, in seconds.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub timeout: Option<u64>,
}

impl Provider {
	pub fn timeout(&self) -> Option<Duration> {
		self.timeout.map(Duration::from_secs)
	}
}

fn expose_key<S: Serializer>(key: &SecretString, ser: S) -> Result<S::Ok, S::Error> {
	// The document on disk owns the credential, so persisting must write it back out.
	ser.serialize_str(key.expose_secret())
}

/// Per-provider quota ceilings. Absent means unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub rpm: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tpm: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub rpd: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tpr: Option<u64>,
}

impl Limits {
	pub fn is_empty(&self) -> bool {
		*self == Limits::default()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitField {
	Rpm,
	Tpm,
	Rpd,
	Tpr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
	/// Provider-local model name. Absent forwards the logical name unchanged.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub alias: Option<String>,
	#[serde(default = "default_enable")]
	pub enable: bool,
}

fn default_enable() -> bool {
	true
}

/// Field edits accepted by [`ConfigStore::update_binding`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", tag = "field", content = "value")]
pub enum BindingEdit {
	Alias(Option<String>),
	Enable(bool),
}

/// The routing document: providers plus the model routing table.
/// Declaration order of both maps is routing order, so they are index maps.
/// Unknown top-level keys are carried through rewrites untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteDoc {
	#[serde(default)]
	pub api_provider: IndexMap<String, Provider>,
	#[serde(default)]
	pub model_config: IndexMap<String, IndexMap<String, Binding>>,
	#[serde(flatten)]
	pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RouteDoc {
	pub fn validate(&self) -> Result<(), ConfigError> {
		for (name, provider) in &self.api_provider {
			let scheme = provider.base_url.scheme();
			if scheme != "http" && scheme != "https" {
				return Err(ConfigError::InvalidBaseUrl {
					provider: name.clone(),
					reason: format!("unsupported scheme {scheme:?}"),
				});
			}
			if provider.base_url.host_str().is_none() {
				return Err(ConfigError::InvalidBaseUrl {
					provider: name.clone(),
					reason: "missing host".to_string(),
				});
			}
		}
		for (model, bindings) in &self.model_config {
			if model == AUTO_MODEL {
				return Err(ConfigError::ReservedModelName);
			}
			for provider in bindings.keys() {
				if !self.api_provider.contains_key(provider) {
					return Err(ConfigError::UnknownProvider {
						model: model.clone(),
						provider: provider.clone(),
					});
				}
			}
		}
		Ok(())
	}
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
	#[error("failed to parse routing document: {0}")]
	Parse(#[source] anyhow::Error),
	#[error("model {model:?} routes to unknown provider {provider:?}")]
	UnknownProvider { model: String, provider: String },
	#[error("invalid base_url for provider {provider:?}: {reason}")]
	InvalidBaseUrl { provider: String, reason: String },
	#[error("{AUTO_MODEL:?} is a reserved model name")]
	ReservedModelName,
	#[error("unknown model {0:?}")]
	UnknownModel(String),
	#[error("unknown provider {0:?}")]
	MissingProvider(String),
	#[error("failed to persist routing document: {0}")]
	Persist(#[source] std::io::Error),
}

/// Holds the live routing document. Readers capture an immutable snapshot at
/// request entry; writers validate, swap, then persist. A failed disk write
/// reverts the in-memory swap so callers never observe a state the disk
/// does not have.
#[derive(Debug)]
pub struct ConfigStore {
	current: ArcSwap<RouteDoc>,
	path: Option<PathBuf>,
	// Serializes the validate/swap/persist sequence across writers.
	write_lock: Mutex<()>,
}

impl ConfigStore {
	pub fn load(contents: &str, path: Option<PathBuf>) -> Result<Self, ConfigError> {
		let doc: RouteDoc = yamlviajson::from_str(contents).map_err(ConfigError::Parse)?;
		doc.validate()?;
		info!(
			providers = doc.api_provider.len(),
			models = doc.model_config.len(),
			"routing document loaded"
		);
		Ok(ConfigStore {
			current: ArcSwap::from_pointee(doc),
			path,
			write_lock: Mutex::new(()),
		})
	}

	/// An immutable view, safe to hold across a whole request.
	pub fn snapshot(&self) -> Arc<RouteDoc> {
		self.current.load_full()
	}

	/// Validates and atomically publishes a whole new document.
	pub fn replace(&self, doc: RouteDoc) -> Result<(), ConfigError> {
		let _w = self.write_lock.lock();
		self.replace_locked(doc)
	}

	// Caller holds write_lock.
	fn replace_locked(&self, doc: RouteDoc) -> Result<(), ConfigError> {
		doc.validate()?;
		let prev = self.current.load_full();
		let next = Arc::new(doc);
		self.current.store(next.clone());
		if let Err(e) = self.persist(&next) {
			self.current.store(prev);
			return Err(e);
		}
		debug!("routing document replaced");
		Ok(())
	}

	pub fn update_binding(
		&self,
		model: &str,
		provider: &str,
		edit: BindingEdit,
	) -> Result<(), ConfigError> {
		self.edit(|doc| {
			let bindings = doc
				.model_config
				.get_mut(model)
				.ok_or_else(|| ConfigError::UnknownModel(model.to_string()))?;
			let binding = bindings
				.get_mut(provider)
				.ok_or_else(|| ConfigError::MissingProvider(provider.to_string()))?;
			match edit {
				BindingEdit::Alias(alias) => binding.alias = alias,
				BindingEdit::Enable(enable) => binding.enable = enable,
			}
			Ok(())
		})
	}

	pub fn update_limit(
		&self,
		provider: &str,
		field: LimitField,
		value: Option<u64>,
	) -> Result<(), ConfigError> {
		self.edit(|doc| {
			let p = doc
				.api_provider
				.get_mut(provider)
				.ok_or_else(|| ConfigError::MissingProvider(provider.to_string()))?;
			match field {
				LimitField::Rpm => p.limits.rpm = value,
				LimitField::Tpm => p.limits.tpm = value,
				LimitField::Rpd => p.limits.rpd = value,
				LimitField::Tpr => p.limits.tpr = value,
			}
			Ok(())
		})
	}

	pub fn set_base_url(&self, provider: &str, value: Url) -> Result<(), ConfigError> {
		self.edit(|doc| {
			let p = doc
				.api_provider
				.get_mut(provider)
				.ok_or_else(|| ConfigError::MissingProvider(provider.to_string()))?;
			p.base_url = value;
			Ok(())
		})
	}

	pub fn set_key(&self, provider: &str, value: SecretString) -> Result<(), ConfigError> {
		self.edit(|doc| {
			let p = doc
				.api_provider
				.get_mut(provider)
				.ok_or_else(|| ConfigError::MissingProvider(provider.to_string()))?;
			p.api_key = value;
			Ok(())
		})
	}

	// The lock spans the snapshot read as well as the swap, so two
	// concurrent single-field edits cannot clone the same base document and
	// silently drop each other's change.
	fn edit(
		&self,
		f: impl FnOnce(&mut RouteDoc) -> Result<(), ConfigError>,
	) -> Result<(), ConfigError> {
		let _w = self.write_lock.lock();
		let mut doc = RouteDoc::clone(&self.snapshot());
		f(&mut doc)?;
		self.replace_locked(doc)
	}

	fn persist(&self, doc: &RouteDoc) -> Result<(), ConfigError> {
		let Some(path) = &self.path else {
			// Inline documents have no backing file.
			return Ok(());
		};
		let contents = yamlviajson::to_string(doc)
			.map_err(|e| ConfigError::Persist(std::io::Error::other(e)))?;
		write_atomic(path, contents.as_bytes()).map_err(ConfigError::Persist)
	}
}

// Write-to-temp plus rename, so a crashed write never leaves a torn document.
fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
	let tmp = path.with_extension("tmp");
	std::fs::write(&tmp, contents)?;
	std::fs::rename(&tmp, path)
}
