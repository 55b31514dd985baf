use anyhow::{Context as _, Result};
use clap::Parser;
use quidditch::index::StoreOptions;
use quidditch::NodeConfig;
use quidditch_cluster::client::TarpcRaftTransport;
use quidditch_cluster::consensus::{ConsensusNode, RaftConfig};
use quidditch_cluster::data::DataNode;
use quidditch_cluster::master::MasterService;
use quidditch_cluster::server::{serve_data, serve_master, serve_raft};
use quidditch_cluster::state::{NodeMeta, NodeRole, NodeStatus, StateMachine};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug, Clone)]
#[command(name = "quidditch-server")]
#[command(about = "Quidditch distributed search node")]
#[command(version)]
struct Args {
    /// Configuration file path (env: QUIDDITCH_CONFIG_PATH)
    #[arg(short, long, default_value = "quidditch.toml", env = "QUIDDITCH_CONFIG_PATH")]
    config: String,

    /// Roles this node carries, comma-separated (master, data)
    #[arg(long, default_value = "master,data", env = "QUIDDITCH_ROLES")]
    roles: String,

    /// Master addresses for heartbeating; defaults to this node's own
    /// admin endpoint.
    #[arg(long, env = "QUIDDITCH_MASTERS")]
    masters: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let env_filter = tracing_subscriber::EnvFilter::new(&log_level);
    let registry = tracing_subscriber::registry().with(env_filter);
    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    let config = NodeConfig::load(Path::new(&args.config))
        .with_context(|| format!("loading configuration from {}", args.config))?;
    let is_master = args.roles.contains("master");
    let is_data = args.roles.contains("data");
    if !is_master && !is_data {
        anyhow::bail!("node must carry at least one of the master/data roles");
    }

    tracing::info!(
        node_id = %config.node_id,
        roles = %args.roles,
        data_dir = %config.data_dir.display(),
        "starting quidditch node"
    );
    std::fs::create_dir_all(&config.data_dir)?;

    // The admin surface binds grpc_port; a data role binds grpc_port + 1.
    let admin_addr = config.rpc_addr();
    let data_addr = format!("{}:{}", config.bind_addr, config.grpc_port + 1);

    // Consensus (only meaningful on masters, but a pure data node still
    // runs a single-member group so colocated coordinators can read state).
    let machine = Arc::new(StateMachine::new(uuid::Uuid::new_v4().to_string()));
    let mut raft_config = RaftConfig::new(
        config.raft_addr(),
        admin_addr.clone(),
        config.peers.clone(),
    );
    raft_config.snapshot_threshold = config.snapshot_threshold;
    let transport = Arc::new(TarpcRaftTransport::new(Duration::from_millis(500)));
    let consensus = ConsensusNode::open(
        &config.consensus_dir(),
        raft_config,
        machine,
        transport,
    )?;
    let (_, _raft_server) = serve_raft(&config.raft_addr(), Arc::clone(&consensus)).await?;
    let _raft_ticker = Arc::clone(&consensus).start();

    let master = if is_master {
        let master = MasterService::new(
            Arc::clone(&consensus),
            Duration::from_secs(config.heartbeat_timeout_secs),
        );
        let (_, _admin_server) = serve_master(&admin_addr, Arc::clone(&master)).await?;
        let _master_loop = Arc::clone(&master).start();
        Some(master)
    } else {
        None
    };

    if is_data {
        let node = Arc::new(DataNode::new(
            config.shards_dir(),
            StoreOptions {
                ram_buffer_mb: config.ram_buffer_mb,
                commit_on_close: config.commit_on_close,
            },
        ));
        let (_, _data_server) = serve_data(&data_addr, Arc::clone(&node)).await?;

        let meta = NodeMeta {
            node_id: config.node_id.clone(),
            role: NodeRole::Data,
            address: config.bind_addr.clone(),
            port: config.grpc_port + 1,
            status: NodeStatus::Healthy,
            last_heartbeat_ms: 0,
        };
        let masters = args
            .masters
            .clone()
            .unwrap_or_else(|| admin_addr.clone())
            .split(',')
            .map(str::to_string)
            .collect::<Vec<_>>();
        tokio::spawn(heartbeat_loop(
            meta,
            masters,
            Duration::from_secs((config.heartbeat_timeout_secs / 3).max(1)),
        ));
    }

    // Keep the local master reference alive for the process lifetime.
    let _master = master;
    tracing::info!("node started");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    consensus.stop();
    Ok(())
}

/// Register with a master, then heartbeat on an interval. NotLeader
/// answers redirect via the leader hint; transport errors rotate through
/// the configured master list.
async fn heartbeat_loop(meta: NodeMeta, masters: Vec<String>, interval: Duration) {
    use quidditch_cluster::client::connect_master;
    use quidditch_cluster::ClusterError;
    use tarpc::context;

    let mut target = masters.first().cloned().unwrap_or_default();
    let mut registered = false;
    let mut rotation = 0usize;
    loop {
        let outcome: Result<u64, ClusterError> = async {
            let client = connect_master(&target, Duration::from_secs(2)).await?;
            let version = if registered {
                client
                    .node_heartbeat(context::current(), meta.node_id.clone())
                    .await
                    .map_err(quidditch_cluster::client::rpc_error)??
            } else {
                client
                    .register_node(context::current(), meta.clone())
                    .await
                    .map_err(quidditch_cluster::client::rpc_error)??
            };
            Ok(version)
        }
        .await;

        match outcome {
            Ok(_) => {
                registered = true;
            }
            Err(ClusterError::NotLeader { leader: Some(hint) }) => {
                tracing::debug!(leader = %hint, "following leader hint");
                target = hint;
                continue;
            }
            Err(e) => {
                tracing::warn!(master = %target, error = %e, "heartbeat failed");
                rotation += 1;
                if let Some(next) = masters.get(rotation % masters.len().max(1)) {
                    target = next.clone();
                }
            }
        }
        tokio::time::sleep(interval).await;
    }
}
