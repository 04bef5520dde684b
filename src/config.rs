use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;

pub const DEFAULT_BIND: &str = "127.0.0.1:8787";

/// Process-level settings, resolved from CLI flags with env-var overrides.
/// The routing document itself lives in [`crate::store`].
#[derive(Debug)]
pub struct Config {
	pub bind: SocketAddr,
	pub document: String,
	/// Where admin edits are persisted. None for inline documents.
	pub document_path: Option<PathBuf>,
}

impl Config {
	pub fn new(
		bind: Option<SocketAddr>,
		document: String,
		document_path: Option<PathBuf>,
	) -> anyhow::Result<Self> {
		let bind = parse::<SocketAddr>("BIND_ADDR")?
			.or(bind)
			.unwrap_or_else(|| DEFAULT_BIND.parse().expect("default bind address parses"));
		Ok(Config { bind, document, document_path })
	}
}

fn parse<T: FromStr>(env: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: ToString,
{
	match std::env::var(env) {
		Ok(val) => val
			.parse()
			.map(Some)
			.map_err(|e: <T as FromStr>::Err| {
				anyhow::anyhow!("invalid env var {}={} ({})", env, val, e.to_string())
			}),
		Err(_) => Ok(None),
	}
}

pub fn read_document(
	file: Option<PathBuf>,
	inline: Option<String>,
) -> anyhow::Result<(String, Option<PathBuf>)> {
	match (inline, file) {
		(Some(_), Some(_)) => anyhow::bail!("only one of --config or --file"),
		(Some(contents), None) => Ok((contents, None)),
		(None, Some(path)) => {
			let contents = std::fs::read_to_string(&path)
				.with_context(|| format!("reading routing document {}", path.display()))?;
			Ok((contents, Some(path)))
		},
		// An empty document is valid; everything can be added over the admin API.
		(None, None) => Ok(("{}".to_string(), None)),
	}
}
