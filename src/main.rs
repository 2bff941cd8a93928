//! keel CLI - drive cluster lifecycle operations from a cluster manifest

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use keel::cluster::Cluster;
use keel::engine::{Engine, EngineConfig};
use keel::exec::SshSessionFactory;
use keel::mount::PreMountedImage;

/// keel - install and manage Kubernetes clusters from cluster images
#[derive(Parser, Debug)]
#[command(name = "keel", version, about, long_about = None)]
struct Cli {
    /// Cluster manifest (YAML)
    #[arg(short = 'f', long, global = true, default_value = "Clusterfile.yaml")]
    manifest: PathBuf,

    /// Controller data root
    #[arg(long, env = "DATA_ROOT", global = true)]
    data_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize the cluster described by the manifest
    Run(ImageArgs),

    /// Join hosts to a running cluster
    Join(ScaleArgs),

    /// Drain and remove hosts from a running cluster
    Delete(DeleteArgs),

    /// Rolling upgrade to the version in the image
    Upgrade(ImageArgs),

    /// Reset every host and tear down cluster state
    Reset,

    /// Print the cluster metadata from master0
    Metadata,
}

/// Arguments naming the cluster image
#[derive(Parser, Debug)]
struct ImageArgs {
    /// Mounted cluster image directory
    #[arg(long)]
    image_dir: PathBuf,
}

/// Arguments for scale-out
#[derive(Parser, Debug)]
struct ScaleArgs {
    /// Mounted cluster image directory
    #[arg(long)]
    image_dir: PathBuf,

    /// Master IPs to add
    #[arg(long, value_delimiter = ',')]
    masters: Vec<IpAddr>,

    /// Worker IPs to add
    #[arg(long, value_delimiter = ',')]
    nodes: Vec<IpAddr>,
}

/// Arguments for scale-in
#[derive(Parser, Debug)]
struct DeleteArgs {
    /// Master IPs to remove
    #[arg(long, value_delimiter = ',')]
    masters: Vec<IpAddr>,

    /// Worker IPs to remove
    #[arg(long, value_delimiter = ',')]
    nodes: Vec<IpAddr>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => {}
        Err(e) => {
            if let Some(keel_err) = e.downcast_ref::<keel::Error>() {
                tracing::error!(
                    kind = keel_err.kind(),
                    hint = keel_err.remediation(),
                    "{keel_err}"
                );
                std::process::exit(keel_err.exit_code());
            }
            tracing::error!("{e:#}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let manifest = tokio::fs::read_to_string(&cli.manifest).await.map_err(|e| {
        anyhow::anyhow!("reading manifest {}: {e}", cli.manifest.display())
    })?;
    let cluster: Cluster = serde_yaml::from_str(&manifest)
        .map_err(|e| anyhow::anyhow!("parsing manifest {}: {e}", cli.manifest.display()))?;

    let config = EngineConfig {
        data_root: cli.data_root.clone(),
        ..EngineConfig::default()
    };

    match cli.command {
        Commands::Run(args) => {
            let engine = build_engine(cluster, &args.image_dir, config)?;
            with_ctrl_c(&engine, engine.init()).await?;
        }
        Commands::Join(args) => {
            let engine = build_engine(cluster, &args.image_dir, config)?;
            with_ctrl_c(&engine, async {
                engine.join_masters(&args.masters).await?;
                engine.join_nodes(&args.nodes).await
            })
            .await?;
        }
        Commands::Delete(args) => {
            let engine = build_engine(cluster, &unused_image_dir(), config)?;
            with_ctrl_c(&engine, async {
                engine.delete_masters(&args.masters).await?;
                engine.delete_nodes(&args.nodes).await
            })
            .await?;
        }
        Commands::Upgrade(args) => {
            let engine = build_engine(cluster, &args.image_dir, config)?;
            with_ctrl_c(&engine, engine.upgrade()).await?;
        }
        Commands::Reset => {
            let engine = build_engine(cluster, &unused_image_dir(), config)?;
            with_ctrl_c(&engine, engine.reset()).await?;
        }
        Commands::Metadata => {
            let engine = build_engine(cluster, &unused_image_dir(), config)?;
            let meta = engine.get_metadata().await?;
            println!("{}", serde_json::to_string_pretty(&meta)?);
        }
    }
    Ok(())
}

fn build_engine(
    cluster: Cluster,
    image_dir: &PathBuf,
    config: EngineConfig,
) -> anyhow::Result<Engine> {
    let image_ref = image_dir.display().to_string();
    let engine = Engine::new(
        cluster,
        Arc::new(PreMountedImage::new(image_dir.clone())),
        image_ref,
        Arc::new(SshSessionFactory::new()),
        config,
    )?;
    Ok(engine)
}

/// Delete, reset, and metadata do not read image content; the mount dir
/// placeholder is never touched for them.
fn unused_image_dir() -> PathBuf {
    PathBuf::from("/nonexistent")
}

/// Run an engine operation, cancelling it on Ctrl-C
async fn with_ctrl_c<F>(engine: &Engine, op: F) -> keel::Result<()>
where
    F: std::future::Future<Output = keel::Result<()>>,
{
    let cancel = engine.cancellation_token();
    tokio::select! {
        r = op => r,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupt received, cancelling");
            cancel.cancel();
            Err(keel::Error::Cancelled)
        }
    }
}
