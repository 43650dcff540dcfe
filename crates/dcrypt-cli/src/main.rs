use std::{collections::HashMap, net::SocketAddr, path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use dcrypt_core::{
    ContentMetadata, Identity, MemoryStore, Node, NodeConfig, PeerAddr, SqliteStore,
    StaticDirectory, Store, TcpTransport,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dcrypt")]
#[command(about = "dcrypt swarm node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a fresh identity secret and the peer address it yields.
    GenIdentity {
        #[arg(long)]
        supernode: bool,
    },
    /// Run a node until interrupted.
    Run(RunArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    /// TOML file with node settings; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    supernode: bool,
    /// SQLite database; state is kept in memory without it.
    #[arg(long)]
    db: Option<PathBuf>,
    #[arg(long, default_value = "0.0.0.0:7400")]
    listen: SocketAddr,
    /// Known peer as ADDRESS=HOST:PORT. Repeatable.
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<(PeerAddr, SocketAddr)>,
    #[arg(long)]
    content_secret: Option<String>,
    /// Publish a file once the node is up.
    #[arg(long)]
    publish: Option<PathBuf>,
    #[arg(long = "tag")]
    tags: Vec<String>,
    /// Retrieve a content hash once the node is up.
    #[arg(long)]
    retrieve: Option<String>,
    #[arg(long, requires = "retrieve")]
    out: Option<PathBuf>,
}

fn parse_peer(value: &str) -> Result<(PeerAddr, SocketAddr), String> {
    let (addr, socket) = value
        .split_once('=')
        .ok_or_else(|| format!("expected ADDRESS=HOST:PORT, got {value}"))?;
    let socket = socket
        .parse::<SocketAddr>()
        .map_err(|err| format!("bad socket address {socket}: {err}"))?;
    if addr.trim().is_empty() {
        return Err("peer address is empty".into());
    }
    Ok((PeerAddr::new(addr.trim()), socket))
}

fn load_config(args: &RunArgs) -> anyhow::Result<NodeConfig> {
    let mut config = match &args.config {
        Some(path) => toml::from_str::<NodeConfig>(&std::fs::read_to_string(path)?)?,
        None => NodeConfig::default(),
    };
    config.supernode |= args.supernode;
    if args.content_secret.is_some() {
        config.content_secret = args.content_secret.clone();
    }
    for (addr, _) in &args.peers {
        if addr.is_supernode() && !config.bootstrap_supernodes.contains(&addr.to_string()) {
            config.bootstrap_supernodes.push(addr.to_string());
        }
    }
    Ok(config)
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    let store: Arc<dyn Store> = match &args.db {
        Some(path) => SqliteStore::open(path)?,
        None => MemoryStore::new(),
    };
    let book = args.peers.iter().cloned().collect::<HashMap<_, _>>();
    let supernodes = book
        .keys()
        .filter(|addr| addr.is_supernode())
        .cloned()
        .collect::<Vec<_>>();
    let transport = Arc::new(TcpTransport::new(Some(args.listen), book));
    let directory = Arc::new(StaticDirectory::new(supernodes));

    let node = Node::start(config, transport, directory, store).await?;
    println!("address: {}", node.local_address());

    if let Some(path) = &args.publish {
        let data = std::fs::read(path)?;
        let file_type = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_string();
        let metadata = ContentMetadata {
            tags: args.tags.clone(),
            ..ContentMetadata::default()
        };
        match node.publish(metadata, &data, &file_type).await {
            Ok(hash) => println!("published: {hash}"),
            Err(err) => warn!(error = %err, path = %path.display(), "publish failed"),
        }
    }

    if let Some(hash) = &args.retrieve {
        match node.retrieve(hash).await {
            Ok(content) => {
                let out = args
                    .out
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(format!("{hash}.{}", content.file_type)));
                std::fs::write(&out, &content.data)?;
                println!("retrieved: {} ({} bytes)", out.display(), content.data.len());
            }
            Err(err) => warn!(error = %err, %hash, "retrieve failed"),
        }
    }

    info!("serving; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    node.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::GenIdentity { supernode } => {
            let identity = Identity::generate(supernode);
            println!("secret: {}", hex::encode(identity.secret_bytes()));
            println!("address: {}", identity.address());
        }
        Command::Run(args) => run(args).await?,
    }

    Ok(())
}
