//! graphlink-engine: serves the echo graph to external controllers.
//!
//!   graphlink-engine --listen tcp://127.0.0.1:7400 --echo-pairs 4
//!   graphlink-engine --config engine.toml
//!   graphlink-engine --stdio

use clap::Parser;
use graphlink_engine::{EngineConfig, Listener, serve_stdio};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "graphlink-engine", version, about = "Reference graphlink engine")]
struct Args {
    /// TOML configuration file
    #[arg(long, env = "GRAPHLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Listen URL (tcp://host:port or ws://host:port)
    #[arg(long, env = "GRAPHLINK_LISTEN")]
    listen: Option<String>,

    /// Number of int/ext device pairs
    #[arg(long)]
    echo_pairs: Option<usize>,

    /// Override the graph instance id
    #[arg(long)]
    graph_instance: Option<String>,

    /// Hold `run` until every external device is bound
    #[arg(long)]
    wait_for_all_externals: bool,

    /// Serve one controller over stdin/stdout instead of listening
    #[arg(long)]
    stdio: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout may carry protocol traffic
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("graphlink_engine=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(pairs) = args.echo_pairs {
        config.echo_pairs = pairs;
    }
    if args.graph_instance.is_some() {
        config.graph_instance = args.graph_instance;
    }
    config.wait_for_all_externals |= args.wait_for_all_externals;

    let engine = config.build_engine()?;
    tracing::info!(
        echo_pairs = config.echo_pairs,
        wait_for_all_externals = config.wait_for_all_externals,
        "engine ready"
    );

    if args.stdio {
        serve_stdio(engine).await;
        return Ok(());
    }
    let listener = Listener::bind(&config.listen).await?;
    tokio::select! {
        result = listener.run(engine) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }
    Ok(())
}
