use event_bus::{
    ConnectionPool, DeliveryTracker, EventBus, InMemoryBus, NatsBus, PublisherClient, SystemClock,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use order_gateway::{
    config::{BusType, Config},
    gateway::OrderGateway,
    jetstream_setup,
    metrics::Metrics,
    routes::{self, AppState},
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let cfg = Config::from_env()?;
    tracing::info!(
        host = %cfg.host,
        port = cfg.port,
        bus_type = ?cfg.bus_type,
        topic = %cfg.topic,
        ack_mode = %cfg.ack_mode,
        "Configuration loaded"
    );

    let metrics = Metrics::new()?;

    // Broker sessions (fail-fast on stream setup)
    let buses: Vec<Arc<dyn EventBus>> = match cfg.bus_type {
        BusType::InMemory => {
            tracing::info!("Using InMemory event bus");
            vec![Arc::new(InMemoryBus::new()) as Arc<dyn EventBus>]
        }
        BusType::Nats => {
            let mut buses: Vec<Arc<dyn EventBus>> = Vec::with_capacity(cfg.pool_size);
            for i in 0..cfg.pool_size {
                let name = format!("order-gateway-{}", i);
                let bus = NatsBus::connect(&cfg.nats_url, &name, cfg.reconnect).await?;
                if i == 0 {
                    jetstream_setup::ensure_stream(
                        bus.client().clone(),
                        &cfg.topic,
                        cfg.stream_max_age,
                        cfg.stream_duplicate_window,
                    )
                    .await?;
                }
                buses.push(Arc::new(bus));
            }
            buses
        }
    };

    let pool = ConnectionPool::new(buses)?;
    metrics
        .dep_up
        .with_label_values(&["broker"])
        .set(i64::from(pool.is_healthy()));

    let publisher = PublisherClient::start(pool, cfg.publisher.clone())?;
    let tracker = DeliveryTracker::new(publisher.clone(), cfg.delivery.clone());
    let gateway = OrderGateway::new(
        tracker,
        Arc::new(SystemClock),
        cfg.topic.clone(),
        cfg.ack_mode,
        metrics.clone(),
    );

    let state = Arc::new(AppState {
        gateway,
        publisher: publisher.clone(),
        metrics,
    });

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Flush whatever the lanes still hold
    publisher.close().await;
    tracing::info!("Order gateway stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
