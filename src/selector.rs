use indexmap::IndexMap;

use crate::ratelimit::Registry;
use crate::store::{AUTO_MODEL, RouteDoc};

/// One routable attempt target: the provider to call and the model name to
/// put in the upstream request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
	pub provider: String,
	pub upstream_model: String,
}

#[derive(thiserror::Error, Debug)]
#[error("no provider available for model {model:?}")]
pub struct NoProviderAvailable {
	pub model: String,
	/// Per-provider reason each binding was dropped, for the 503 body.
	pub reasons: IndexMap<String, String>,
}

/// Computes the ordered candidate list for a logical model. Configuration
/// order is authoritative; a healthy earlier provider always wins.
pub fn candidates(
	doc: &RouteDoc,
	limiters: &Registry,
	model: &str,
	tokens_hint: Option<u64>,
) -> Result<Vec<Candidate>, NoProviderAvailable> {
	let mut out = Vec::new();
	let mut reasons = IndexMap::new();

	let bindings: Vec<(&str, &str, Option<&str>, bool)> = if model == AUTO_MODEL {
		// Union of every model's enabled bindings in global declaration
		// order; the first enabled occurrence of a provider wins, so a
		// disabled binding under an earlier model cannot shadow an enabled
		// one declared later.
		let mut seen = std::collections::HashSet::new();
		let enabled: Vec<_> = doc
			.model_config
			.iter()
			.flat_map(|(m, bs)| {
				bs.iter()
					.map(move |(p, b)| (m.as_str(), p.as_str(), b.alias.as_deref(), b.enable))
			})
			.filter(|(_, _, _, enable)| *enable)
			.filter(|(_, p, _, _)| seen.insert(p.to_string()))
			.collect();
		// Providers whose every occurrence is disabled still show up in the
		// deny breakdown.
		for bs in doc.model_config.values() {
			for (p, b) in bs {
				if !b.enable && !seen.contains(p.as_str()) {
					reasons
						.entry(p.clone())
						.or_insert_with(|| "binding disabled".to_string());
				}
			}
		}
		enabled
	} else {
		doc.model_config
			.get(model)
			.map(|bs| {
				bs.iter()
					.map(|(p, b)| (model, p.as_str(), b.alias.as_deref(), b.enable))
					.collect()
			})
			.unwrap_or_default()
	};

	for (logical, provider, alias, enable) in bindings {
		if !enable {
			reasons.insert(provider.to_string(), "binding disabled".to_string());
			continue;
		}
		let Some(p) = doc.api_provider.get(provider) else {
			// Validation rejects this, but selection must not panic on it.
			reasons.insert(provider.to_string(), "provider not configured".to_string());
			continue;
		};
		if let Err(deny) = limiters.get(provider).check(&p.limits, tokens_hint) {
			reasons.insert(provider.to_string(), deny.to_string());
			continue;
		}
		out.push(Candidate {
			provider: provider.to_string(),
			upstream_model: alias.unwrap_or(logical).to_string(),
		});
	}

	if out.is_empty() {
		return Err(NoProviderAvailable { model: model.to_string(), reasons });
	}
	Ok(out)
}
