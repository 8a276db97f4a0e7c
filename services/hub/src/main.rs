use fabric_protocol::SourceType;
use fabric_registry::HttpRegistry;
use hub::config::HubConfig;
use hub::nexus::Nexus;
use hub::server::AppState;
use hub::{discovery, interconnect, server};
use std::net::SocketAddr;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = HubConfig::from_env();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = cfg.port,
        room_system = cfg.room_system,
        "hub starting"
    );

    let nexus = Nexus::start(cfg.room_system);

    // Room systems mesh with their sibling hubs before accepting peers.
    if cfg.room_system {
        let Some(registry_address) = cfg.registry_address.clone() else {
            error!("ROOM_SYSTEM is set but REGISTRY_ADDRESS is not");
            std::process::exit(1);
        };
        let registry = HttpRegistry::new(registry_address);
        match discovery::sibling_hubs(&registry, &cfg.system_id, cfg.dev_hub).await {
            Ok(peers) => {
                for peer in peers {
                    info!(id = %peer.id, address = %peer.address, "dialling sibling hub");
                    tokio::spawn(interconnect::open_connection_with_retry(
                        discovery::dial_address(&peer.address),
                        "connect/hub".to_owned(),
                        SourceType::Hub,
                        nexus.clone(),
                    ));
                }
            }
            Err(e) => {
                error!(error = %e, "sibling hub discovery failed");
                std::process::exit(1);
            }
        }
    }

    let state = AppState::new(nexus);
    let router = server::build_router(state);

    let bind: SocketAddr = ([0, 0, 0, 0], cfg.port).into();
    let listener = match tokio::net::TcpListener::bind(bind).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %bind, error = %e, "failed to bind");
            std::process::exit(1);
        }
    };
    info!(addr = %bind, "hub listening");

    if let Err(e) = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}
