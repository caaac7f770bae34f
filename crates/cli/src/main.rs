use anyhow::{anyhow, Context, Result};
use clap::Parser;
use futures::StreamExt;
use libp2p::identity;
use peerfs_fetcher::{ContentHandle, FetchConfig, Fetcher, SwarmTransport};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::{fs, sync::Arc};
use tracing::{info, warn};

/// Upper bound on bytes requested per stream read in `cat`.
const CAT_CHUNK: usize = 1 << 20;

#[derive(Parser, Debug)]
#[command(
    name = "peerfs",
    version,
    about = "Block-level reads of content held by remote peers"
)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct CommonArgs {
    /// JSON fetch configuration; flags below override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Persistent libp2p identity, created on first use. Ephemeral if unset.
    #[arg(long, global = true)]
    key_path: Option<PathBuf>,

    #[arg(long, global = true)]
    prefetch_blocks: Option<usize>,

    #[arg(long, global = true)]
    block_size_power: Option<u32>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    Read(ReadArgs),
    Cat(CatArgs),
    Ping(PingArgs),
}

#[derive(Parser, Debug)]
struct ReadArgs {
    #[arg(long)]
    hash: String,

    #[arg(long)]
    size: u64,

    /// Candidate peer as `name@/ip4/.../tcp/.../p2p/<peer id>`.
    #[arg(long, num_args = 1..)]
    peer: Vec<String>,

    #[arg(long, default_value_t = 0)]
    offset: u64,

    #[arg(long)]
    len: usize,

    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct CatArgs {
    #[arg(long)]
    hash: String,

    #[arg(long)]
    size: u64,

    #[arg(long, num_args = 1..)]
    peer: Vec<String>,

    #[arg(long, default_value_t = 0)]
    offset: u64,

    #[arg(long)]
    out: Option<PathBuf>,

    /// Check that the SHA-256 of the content equals --hash.
    #[arg(long)]
    verify: bool,
}

#[derive(Parser, Debug)]
struct PingArgs {
    #[arg(long, num_args = 1..)]
    peer: Vec<String>,
}

#[derive(Debug, Serialize)]
struct PingReport {
    peer: String,
    reachable: bool,
    latency_ms: Option<f64>,
    error: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    let config = resolve_config(&args.common)?;
    let keypair = match &args.common.key_path {
        Some(path) => load_or_create_identity(path)?,
        None => identity::Keypair::generate_ed25519(),
    };
    let transport = SwarmTransport::spawn(
        keypair,
        config.block_size(),
        config.connect_timeout(),
        config.request_timeout(),
    )?;
    let fetcher = Arc::new(Fetcher::new(config, Arc::new(transport))?);

    {
        let fetcher = Arc::clone(&fetcher);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling reads");
                fetcher.shutdown();
            }
        });
    }

    match args.command {
        Commands::Read(read) => run_read(&fetcher, read).await,
        Commands::Cat(cat) => run_cat(&fetcher, cat).await,
        Commands::Ping(ping) => run_ping(&fetcher, ping).await,
    }
}

fn resolve_config(common: &CommonArgs) -> Result<FetchConfig> {
    let mut config = match &common.config {
        Some(path) => FetchConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => FetchConfig::default(),
    };
    if let Some(prefetch) = common.prefetch_blocks {
        config.prefetch_blocks = prefetch;
    }
    if let Some(power) = common.block_size_power {
        config.block_size_power = power;
    }
    config.validate()?;
    Ok(config)
}

fn load_or_create_identity(key_path: &Path) -> Result<identity::Keypair> {
    if key_path.exists() {
        let bytes = fs::read(key_path)
            .with_context(|| format!("failed to read identity {}", key_path.display()))?;
        let keypair = identity::Keypair::from_protobuf_encoding(&bytes)?;
        return Ok(keypair);
    }

    if let Some(parent) = key_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let keypair = identity::Keypair::generate_ed25519();
    let encoded = keypair.to_protobuf_encoding()?;
    fs::write(key_path, encoded)?;
    info!(path = %key_path.display(), "Created client identity");
    Ok(keypair)
}

async fn open_handle(fetcher: &Fetcher, hash: &str, size: u64, peers: &[String]) -> Result<ContentHandle> {
    if peers.is_empty() {
        return Err(anyhow!("at least one --peer is required"));
    }
    fetcher
        .new_handle(hash, size, peers)
        .await
        .with_context(|| format!("unable to open {hash}"))
}

async fn run_read(fetcher: &Fetcher, args: ReadArgs) -> Result<()> {
    let handle = open_handle(fetcher, &args.hash, args.size, &args.peer).await?;
    let data = handle
        .read(&fetcher.shutdown_token().child_token(), args.offset, args.len)
        .await
        .with_context(|| format!("read of {} at offset {} failed", args.hash, args.offset))?;

    let mut sink = open_sink(args.out.as_deref())?;
    sink.write_all(&data)?;
    sink.flush()?;
    eprintln!(
        "read complete bytes={} offset={} requested={}",
        data.len(),
        args.offset,
        args.len
    );
    Ok(())
}

async fn run_cat(fetcher: &Fetcher, args: CatArgs) -> Result<()> {
    if args.verify && args.offset != 0 {
        return Err(anyhow!("--verify needs the whole content, drop --offset"));
    }
    let handle = open_handle(fetcher, &args.hash, args.size, &args.peer).await?;
    let chunk = CAT_CHUNK.max(handle.block_size());
    let mut chunks = std::pin::pin!(handle.stream(args.offset).into_byte_stream(chunk));

    let mut sink = open_sink(args.out.as_deref())?;
    let mut hasher = Sha256::new();
    let mut total = 0u64;
    while let Some(data) = chunks.next().await {
        let data = data.with_context(|| format!("stream of {} failed at byte {total}", args.hash))?;
        hasher.update(&data);
        sink.write_all(&data)?;
        total += data.len() as u64;
    }
    sink.flush()?;

    if args.verify {
        let digest = hex::encode(hasher.finalize());
        if !digest.eq_ignore_ascii_case(&args.hash) {
            return Err(anyhow!(
                "content hash mismatch: expected {}, got {digest}",
                args.hash
            ));
        }
        info!(hash = %args.hash, "Content verified");
    }
    eprintln!("cat complete bytes={total} offset={}", args.offset);
    Ok(())
}

async fn run_ping(fetcher: &Fetcher, args: PingArgs) -> Result<()> {
    if args.peer.is_empty() {
        return Err(anyhow!("at least one --peer is required"));
    }
    let mut reports = Vec::with_capacity(args.peer.len());
    for peer in &args.peer {
        let report = match fetcher.connect(peer).await {
            Ok(link) => PingReport {
                peer: peer.clone(),
                reachable: true,
                latency_ms: link.latency().map(|d| d.as_secs_f64() * 1000.0),
                error: None,
            },
            Err(err) => PingReport {
                peer: peer.clone(),
                reachable: false,
                latency_ms: None,
                error: Some(err.to_string()),
            },
        };
        reports.push(report);
    }
    println!("{}", serde_json::to_string_pretty(&reports)?);

    if reports.iter().all(|r| !r.reachable) {
        return Err(anyhow!("no peer reachable"));
    }
    Ok(())
}

fn open_sink(out: Option<&Path>) -> Result<Box<dyn Write>> {
    Ok(match out {
        Some(path) => Box::new(io::BufWriter::new(
            fs::File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?,
        )),
        None => Box::new(io::stdout().lock()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("peerfs.json");
        fs::write(&path, r#"{ "block_size_power": 12, "prefetch_blocks": 1 }"#).unwrap();

        let args = Args::try_parse_from([
            "peerfs",
            "--config",
            path.to_str().unwrap(),
            "--prefetch-blocks",
            "4",
            "ping",
            "--peer",
            "alice@/ip4/127.0.0.1/tcp/9000",
        ])
        .expect("args should parse");
        let config = resolve_config(&args.common).expect("config");
        assert_eq!(config.block_size(), 4096);
        assert_eq!(config.prefetch_blocks, 4);
    }

    #[test]
    fn invalid_override_is_rejected() {
        let args = Args::try_parse_from([
            "peerfs",
            "read",
            "--hash",
            "abc",
            "--size",
            "10",
            "--len",
            "4",
            "--peer",
            "alice@/ip4/127.0.0.1/tcp/9000",
            "--block-size-power",
            "40",
        ])
        .expect("args should parse");
        assert!(resolve_config(&args.common).is_err());
    }

    #[test]
    fn identity_is_created_once_then_reloaded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("keys").join("client.key");

        let created = load_or_create_identity(&path).expect("create");
        let loaded = load_or_create_identity(&path).expect("reload");
        assert_eq!(created.public().to_peer_id(), loaded.public().to_peer_id());
    }
}
