use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use rustydoc::config::{Config, EmbeddingProvider};
use rustydoc::context::AppContext;
use rustydoc::index::IndexName;
use rustydoc::query::ResponseMode;
use rustydoc::{api, documents, logging};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(
    name = "rustydoc",
    version,
    about = "Ask questions about local documents with an Ollama daemon"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API.
    Serve {
        /// Port to bind; defaults to SERVER_PORT or the first free port in 4100-4199.
        #[arg(long)]
        port: Option<u16>,
    },
    /// List installed models and install suggestions.
    Models,
    /// Index files and directories of `.txt`/`.md` documents.
    Ingest {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Answer a question from the vector index.
    Ask {
        question: String,
        #[arg(long)]
        top_k: Option<usize>,
        /// Retrieve exactly `top_k` candidates instead of a widened pool.
        #[arg(long)]
        no_widen: bool,
        /// Model to answer with.
        #[arg(long)]
        model: Option<String>,
    },
    /// Summarise the summary index.
    Summarize {
        #[arg(long, default_value_t = ResponseMode::TreeSummarize)]
        mode: ResponseMode,
        /// Model to summarise with.
        #[arg(long)]
        model: Option<String>,
        instruction: Option<String>,
    },
    /// Delete one persisted index.
    Evict { name: IndexName },
    /// Delete every persisted index.
    Clear,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing();
    let config = Config::load().context("invalid configuration")?;
    let ctx = Arc::new(AppContext::new(config).context("failed to initialise backends")?);

    let outcome = match cli.command {
        // `serve` drains in-flight requests on its own signal handler.
        command @ Command::Serve { .. } => dispatch(&ctx, command).await,
        command => {
            tokio::select! {
                biased;
                _ = shutdown_signal() => Err(anyhow!("interrupted")),
                outcome = dispatch(&ctx, command) => outcome,
            }
        }
    };
    ctx.shutdown().await;
    outcome
}

async fn dispatch(ctx: &Arc<AppContext>, command: Command) -> Result<()> {
    match command {
        Command::Serve { port } => serve(ctx.clone(), port).await,
        Command::Models => {
            let status = ctx.connect_daemon().await;
            println!("daemon: {status}");
            let listing = ctx.model_listing().await;
            if listing.installed.is_empty() {
                println!("no models installed");
            }
            for model in &listing.installed {
                let marker = if *model == listing.selected { "*" } else { " " };
                println!("{marker} {model}");
            }
            if !listing.suggested.is_empty() {
                println!("suggested (ollama pull <name>): {}", listing.suggested.join(", "));
            }
            Ok(())
        }
        Command::Ingest { paths } => {
            let docs = documents::load_documents(&paths)?;
            if docs.is_empty() {
                bail!("no .txt or .md documents found");
            }
            connect_for_embeddings(ctx).await?;
            let report = ctx.ingest(docs).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.vector_ready || !report.summary_ready {
                bail!("index build failed; see logs for details");
            }
            Ok(())
        }
        Command::Ask {
            question,
            top_k,
            no_widen,
            model,
        } => {
            connect_for_generation(ctx, model.as_deref()).await?;
            let widen = no_widen.then_some(false);
            println!("{}", ctx.ask(&question, top_k, widen).await);
            Ok(())
        }
        Command::Summarize {
            mode,
            model,
            instruction,
        } => {
            connect_for_generation(ctx, model.as_deref()).await?;
            println!("{}", ctx.summarize(Some(mode), instruction.as_deref()).await);
            Ok(())
        }
        Command::Evict { name } => {
            let removed = ctx.evict(&name).await?;
            println!("{}", if removed { "evicted" } else { "not present" });
            Ok(())
        }
        Command::Clear => {
            let removed = ctx.clear_all().await?;
            println!("removed {removed} entries");
            Ok(())
        }
    }
}

async fn connect_for_embeddings(ctx: &AppContext) -> Result<()> {
    if ctx.config().embedding_provider == EmbeddingProvider::Ollama {
        let status = ctx.connect_daemon().await;
        if !status.is_available() {
            bail!("inference daemon unavailable ({status})");
        }
    }
    Ok(())
}

async fn connect_for_generation(ctx: &AppContext, model: Option<&str>) -> Result<()> {
    let status = ctx.connect_daemon().await;
    if !status.is_available() {
        bail!("inference daemon unavailable ({status})");
    }
    if let Some(model) = model {
        ctx.select_model(model).await?;
    }
    Ok(())
}

async fn serve(ctx: Arc<AppContext>, port: Option<u16>) -> Result<()> {
    let status = ctx.connect_daemon().await;
    tracing::info!(%status, "Inference daemon status");

    let (listener, port) = bind_listener(port.or(ctx.config().server_port))
        .await
        .context("failed to bind listener")?;
    tracing::info!("Listening on http://0.0.0.0:{}", port);

    let app = api::create_router(ctx);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received ctrl-c; shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM; shutting down"),
    }
}

async fn bind_listener(port: Option<u16>) -> Result<(TcpListener, u16), std::io::Error> {
    use std::net::Ipv4Addr;

    if let Some(port) = port {
        return TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map(|listener| (listener, port));
    }

    const PORT_RANGE: std::ops::RangeInclusive<u16> = 4100..=4199;
    for port in PORT_RANGE {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => {
                tracing::debug!(port, "Bound server port");
                return Ok((listener, port));
            }
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::debug!(port, "Port already in use; trying next");
                continue;
            }
            Err(err) => return Err(err),
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        "No available port found in range 4100-4199",
    ))
}
