use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use modelgateway::config;
use modelgateway::store::ConfigStore;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "OpenAI-compatible gateway over multiple upstream LLM providers", long_about = None)]
struct Args {
	/// Routing document file (YAML or JSON)
	#[arg(short, long, value_name = "file")]
	file: Option<PathBuf>,

	/// Routing document passed inline
	#[arg(short, long, value_name = "config")]
	config: Option<String>,

	/// Address to listen on
	#[arg(short, long, value_name = "addr")]
	bind: Option<SocketAddr>,

	/// Validate the routing document and exit
	#[arg(long)]
	validate_only: bool,
}

fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.init();

	let args = Args::parse();
	let (document, path) = config::read_document(args.file, args.config)?;

	if args.validate_only {
		ConfigStore::load(&document, None)?;
		println!("routing document is valid");
		return Ok(());
	}

	let cfg = config::Config::new(args.bind, document, path)?;
	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(modelgateway::run(cfg))
}
