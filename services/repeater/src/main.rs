use fabric_protocol::SourceType;
use fabric_registry::HttpRegistry;
use messenger::Messenger;
use repeater::config::RepeaterConfig;
use repeater::repeater::Repeater;
use repeater::{send_list, server};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = RepeaterConfig::from_env();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        hub = %cfg.hub_address,
        port = cfg.port,
        "repeater starting"
    );

    let Some(registry_address) = cfg.registry_address.clone() else {
        error!("REGISTRY_ADDRESS is not set");
        std::process::exit(1);
    };
    let registry = HttpRegistry::new(registry_address);

    let send_map = match send_list::build_send_list(&registry, &cfg).await {
        Ok(map) => map,
        Err(e) => {
            error!(error = %e, "couldn't build send list");
            std::process::exit(1);
        }
    };

    let messenger = Messenger::connect(cfg.hub_address.clone(), SourceType::Repeater, 1000);
    let repeater = Repeater::new(
        messenger.clone(),
        send_map,
        registry,
        cfg.system_id.clone(),
    );

    let state = server::AppState {
        ctx: repeater.station_context(),
        connections: repeater.connections(),
        http_buffer: repeater.http_buffer(),
        hub_send: repeater.hub_send(),
        messenger,
        started: Instant::now(),
    };
    tokio::spawn(repeater.run());

    let router = server::build_router(state);
    let bind: SocketAddr = ([0, 0, 0, 0], cfg.port).into();
    let listener = match tokio::net::TcpListener::bind(bind).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %bind, error = %e, "failed to bind");
            std::process::exit(1);
        }
    };
    info!(addr = %bind, "repeater listening");

    if let Err(e) = axum::serve(listener, router).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}
