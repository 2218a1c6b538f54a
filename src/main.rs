use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::Extension,
    routing::post,
};
use session_cluster::authz::PermissionService;
use session_cluster::config::ServerConfig;
use session_cluster::liveness::LivenessCache;
use session_cluster::membership::service::MembershipService;
use session_cluster::router::SessionRouter;
use session_cluster::session::handlers::*;
use session_cluster::session::protocol::*;
use session_cluster::session::runtime::ActorRuntime;
use session_cluster::writebehind::pipeline;
use session_cluster::writebehind::store::InMemoryExistenceStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!(
            "Usage: {} --bind <addr:port> [--seed <addr:port>] [--config <path>]",
            args[0]
        );
        eprintln!("Example: {} --bind 127.0.0.1:5000", args[0]);
        eprintln!(
            "Example: {} --bind 127.0.0.1:5001 --seed 127.0.0.1:5000",
            args[0]
        );
        std::process::exit(1);
    }

    let mut bind_addr: Option<SocketAddr> = None;
    let mut seed_nodes: Vec<SocketAddr> = vec![];
    let mut config_path: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" => {
                bind_addr = Some(args[i + 1].parse()?);
                i += 2;
            }
            "--seed" => {
                seed_nodes.push(args[i + 1].parse()?);
                i += 2;
            }
            "--config" => {
                config_path = Some(args[i + 1].clone());
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    let bind_addr = bind_addr.expect("--bind is required");

    let config = match config_path {
        Some(path) => ServerConfig::load(&path)?,
        None => {
            let config = ServerConfig::default();
            config.validate()?;
            config
        }
    };
    let config = Arc::new(config);

    tracing::info!("Starting session node on {}", bind_addr);
    tracing::info!(
        "Replication: factor {} ({:?}), section cap {} bytes",
        config.replication_factor,
        config.replication_type,
        config.max_section_size
    );
    if !seed_nodes.is_empty() {
        tracing::info!("Seed nodes: {:?}", seed_nodes);
    } else {
        tracing::info!("Starting as seed node (founder)");
    }

    // Gossip on the bind port, session API one kiloport up.
    let http_addr = SocketAddr::new(bind_addr.ip(), bind_addr.port() + 1000);

    // 1. Membership (UDP gossip):
    let membership = MembershipService::new(bind_addr, http_addr, seed_nodes).await?;
    tracing::info!("Node ID: {:?}", membership.local_node.id);

    // 2. Existence store + write-behind pipeline:
    if let Some(conn) = &config.store_connection_string {
        tracing::info!("Existence store collaborator configured: {}", conn);
    }
    let store = Arc::new(InMemoryExistenceStore::new());
    let writebehind = pipeline::spawn(store.clone(), config.invalidation_callback_url.clone());

    // 3. Actor runtime + client router:
    let liveness = Arc::new(LivenessCache::new());
    let runtime = ActorRuntime::new(
        config.clone(),
        membership.clone(),
        liveness,
        writebehind,
        store,
    );
    let router = Arc::new(SessionRouter::new(config.replication_factor));

    // 4. Authorization policy cache:
    let permissions = PermissionService::new();
    permissions.spawn_refresher(
        config.policy_agent_host.clone(),
        config.policy_refresh_delay(),
    );

    // 5. HTTP surface:
    let app = Router::new()
        .route(ENDPOINT_UPDATE, post(handle_update))
        .route(ENDPOINT_GET, post(handle_get))
        .route(ENDPOINT_INVALIDATE, post(handle_invalidate))
        .route(ENDPOINT_INTERNAL_UPDATE, post(handle_internal_update))
        .route(ENDPOINT_INTERNAL_GET, post(handle_internal_get))
        .route(ENDPOINT_INTERNAL_INVALIDATE, post(handle_internal_invalidate))
        .route(ENDPOINT_INTERNAL_PROBE, post(handle_internal_probe))
        .layer(Extension(runtime.clone()))
        .layer(Extension(router));

    // 6. Spawn membership service:
    let service = membership.clone();
    tokio::spawn(async move {
        service.start().await;
    });

    // 7. Stats reporter:
    let stats_membership = membership.clone();
    let stats_runtime = runtime.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));

        loop {
            interval.tick().await;
            let alive = stats_membership.get_alive_members();
            tracing::info!(
                "Cluster stats: {} alive node(s), {} local actor(s)",
                alive.len(),
                stats_runtime.active_actor_count()
            );
            for node in alive {
                tracing::info!(
                    "  - {:?} gossip={} http={} (inc={})",
                    node.id,
                    node.gossip_addr,
                    node.http_addr,
                    node.incarnation
                );
            }
        }
    });

    // 8. Serve:
    tracing::info!("Session API listening on {}", http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
