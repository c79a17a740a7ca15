use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use join_coordinator::{
    config::Config, coordinator::JoinCoordinator, db, handlers, health, housekeeping,
    inbox_consumer::InboxConsumer, metrics, outbox_relay::OutboxRelay,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        #[cfg(debug_assertions)]
        {
            "debug".to_string()
        }
        #[cfg(not(debug_assertions))]
        {
            "warn".to_string()
        }
    });

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_level))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("starting join coordinator");

    let config = Config::from_env();

    let metrics_recorder = metrics::MetricsRecorder::new();
    let metrics_handle = metrics_recorder.handle().clone();
    tracing::info!("metrics initialized");

    let pool = db::init_db(&config.db).await?;
    tracing::info!("database initialized");

    let coordinator = Arc::new(JoinCoordinator::new(pool.clone()));

    let cancel_token = CancellationToken::new();

    let relay = Arc::new(
        OutboxRelay::connect(pool.clone(), &config.broker, config.relay.clone()).await?,
    );
    let relay_handle = {
        let relay = relay.clone();
        let cancel_token = cancel_token.clone();
        tokio::spawn(async move { relay.start(cancel_token).await })
    };
    tracing::info!("outbox relay started");

    let consumer = Arc::new(InboxConsumer::connect(pool.clone(), &config.broker).await?);
    let consumer_handle = {
        let consumer = consumer.clone();
        let cancel_token = cancel_token.clone();
        tokio::spawn(async move {
            if let Err(err) = consumer.start(cancel_token).await {
                tracing::error!(?err, "inbox consumer exited with error");
            }
        })
    };
    tracing::info!("inbox consumer started");

    let housekeeping_handle = {
        let pool = pool.clone();
        let config = config.housekeeping.clone();
        let cancel_token = cancel_token.clone();
        tokio::spawn(async move {
            housekeeping::run_idempotency_sweeper(pool, config, cancel_token).await;
        })
    };
    tracing::info!("idempotency sweeper started");

    let broker_channel: Arc<lapin::Channel> = Arc::new(
        lapin::Connection::connect(&config.broker.amqp_url, lapin::ConnectionProperties::default())
            .await?
            .create_channel()
            .await?,
    );

    let app_state = handlers::AppState {
        coordinator: coordinator.clone(),
        pool: pool.clone(),
    };

    let metrics_router = if matches!(
        std::env::var("ENABLE_METRICS").as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes") | Ok("YES")
    ) {
        Router::new()
            .route("/metrics", get(metrics::metrics_handler))
            .with_state(metrics_handle)
    } else {
        Router::new()
    };

    let health_router = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .with_state(health::HealthState {
            pool: pool.clone(),
            broker_channel: broker_channel.clone(),
        });

    let app = Router::new()
        .route("/events/:event_id/joins", post(handlers::admit))
        .route("/events/:event_id/joins/cancel", post(handlers::cancel))
        .route("/events/:event_id/participants", get(handlers::list_participants))
        .route("/events/:event_id/waitlist", get(handlers::list_waitlist))
        .route("/events/:event_id/stats", get(handlers::get_stats))
        .route("/events/:event_id/kick", post(handlers::kick))
        .route("/events/:event_id/ban", post(handlers::ban))
        .route("/events/:event_id/unban", post(handlers::unban))
        .route("/users/:user_id/joins", get(handlers::list_my_joins))
        .with_state(app_state)
        .merge(health_router)
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let port = std::env::var("SERVER_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse::<u16>()
        .unwrap_or(8080);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    tokio::select! {
        result = axum::serve(listener, app) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received, draining workers");
            cancel_token.cancel();
        }
    }

    let _ = tokio::join!(relay_handle, consumer_handle, housekeeping_handle);
    Ok(())
}
