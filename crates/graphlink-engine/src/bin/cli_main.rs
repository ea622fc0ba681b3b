//! graphlink: scripted controller for a graphlink engine.
//!
//!   graphlink echo --connect tcp://127.0.0.1:7400 --device ext0 --count 10
//!   graphlink halt --connect ws://127.0.0.1:7400 --device ext0 --code 3

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use graphlink_client::{Backoff, ClientChannel, UpwardConnection, connect};
use graphlink_core::{BindParams, Endpoint, Event, MulticastMessage};
use std::io::Write;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "graphlink", version, about = "graphlink controller")]
struct Cli {
    /// Engine URL
    #[arg(long, global = true, env = "GRAPHLINK_CONNECT", default_value = "tcp://127.0.0.1:7400")]
    connect: String,

    /// Owner presented when binding
    #[arg(long, global = true, default_value = graphlink_core::protocol::DEFAULT_OWNER)]
    owner: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send COUNT messages from DEVICE:out and wait for their echoes
    Echo {
        #[arg(long, default_value = "ext0")]
        device: String,
        #[arg(long, default_value_t = 1)]
        count: u64,
    },
    /// Bind DEVICE, request a halt and wait for it
    Halt {
        #[arg(long, default_value = "ext0")]
        device: String,
        #[arg(long, default_value_t = 0)]
        code: i64,
        #[arg(long)]
        message: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("graphlink=warn".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut conn = connect(&cli.connect)
        .await
        .with_context(|| format!("connecting to {}", cli.connect))?;

    let outcome = match cli.command {
        Command::Echo { device, count } => echo(&mut conn, &cli.owner, &device, count).await,
        Command::Halt {
            device,
            code,
            message,
        } => halt(&mut conn, &cli.owner, &device, code, message).await,
    };
    conn.close().await;

    let code = outcome?;
    // Exit statuses are a single byte.
    Ok(ExitCode::from(u8::try_from(code & 0xff).unwrap_or(1)))
}

async fn start(
    conn: &mut UpwardConnection<ClientChannel>,
    owner: &str,
    device: &str,
) -> anyhow::Result<()> {
    let bound = conn
        .bind(BindParams::new([device]).owner(owner))
        .await
        .with_context(|| format!("binding {device}"))?;
    tracing::info!(graph = %bound.graph_instance, "bound {device}");
    for (src, dsts) in bound.incoming_edges.iter() {
        tracing::debug!(%src, ?dsts, "incoming edge");
    }
    conn.run().await.context("starting run")?;
    Ok(())
}

async fn echo(
    conn: &mut UpwardConnection<ClientChannel>,
    owner: &str,
    device: &str,
    count: u64,
) -> anyhow::Result<i64> {
    start(conn, owner, device).await?;
    let src = Endpoint::new(device, "out")?;
    let messages = (0..count)
        .map(|i| MulticastMessage::with_data(src.clone(), serde_json::json!([i])))
        .collect();
    conn.send(messages).await.context("sending")?;

    let mut seen = 0;
    let mut backoff = Backoff::default();
    while seen < count {
        let events = conn.poll(None).await.context("polling")?;
        if events.is_empty() {
            backoff.wait().await;
            continue;
        }
        backoff.reset();
        for event in &events {
            print_event(event)?;
            match event {
                Event::Message(_) => seen += 1,
                Event::Halt(halt) => bail!("engine halted after {seen} of {count} echoes (code {})", halt.code),
            }
        }
    }

    conn.halt(0, None).await.context("halting")?;
    drain(conn).await
}

async fn halt(
    conn: &mut UpwardConnection<ClientChannel>,
    owner: &str,
    device: &str,
    code: i64,
    message: Option<String>,
) -> anyhow::Result<i64> {
    start(conn, owner, device).await?;
    conn.halt(code, message).await.context("halting")?;
    drain(conn).await
}

/// Poll until the halt arrives; return its code.
async fn drain(conn: &mut UpwardConnection<ClientChannel>) -> anyhow::Result<i64> {
    let mut backoff = Backoff::default();
    loop {
        let events = conn.poll(None).await.context("polling")?;
        if events.is_empty() {
            backoff.wait().await;
            continue;
        }
        backoff.reset();
        for event in &events {
            print_event(event)?;
            if let Some(halt) = event.as_halt() {
                return Ok(halt.code);
            }
        }
    }
}

fn print_event(event: &Event) -> anyhow::Result<()> {
    let mut out = std::io::stdout().lock();
    serde_json::to_writer(&mut out, event)?;
    writeln!(out)?;
    Ok(())
}
