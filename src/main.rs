use std::sync::Arc;

use axum::http::{HeaderValue, Method};
use dotenvy::dotenv;
use log::{error, info, warn};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use deskserver::auth::configure_auth_routes;
use deskserver::config::AppConfig;
use deskserver::email::{DisabledNotifier, Notifier, SmtpNotifier};
use deskserver::llm::{Classify, TriageClassifier};
use deskserver::network::ConnectivityProbe;
use deskserver::shared::db;
use deskserver::shared::state::AppState;
use deskserver::tickets::configure_ticket_routes;
use deskserver::triage;

#[tokio::main]
async fn main() {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let probe = ConnectivityProbe::new();
    let online = probe.is_online().await;
    if !online {
        warn!("no internet connectivity detected; primary endpoints will be skipped");
    }

    // No database at all is fatal; there is no degraded mode.
    let pool = match db::connect_with_fallback(&config.database, online) {
        Ok(pool) => pool,
        Err(e) => {
            error!("all database endpoints failed: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = db::run_migrations(&pool) {
        error!("failed to run migrations: {e}");
        std::process::exit(1);
    }

    let classifier: Arc<dyn Classify> =
        Arc::new(TriageClassifier::from_config(&config.ai, probe));
    let notifier: Arc<dyn Notifier> = match &config.smtp {
        Some(smtp) => match SmtpNotifier::new(smtp) {
            Ok(notifier) => Arc::new(notifier),
            Err(e) => {
                warn!("mail transport disabled: {e}");
                Arc::new(DisabledNotifier)
            }
        },
        None => {
            warn!("SMTP is not configured; assignment notifications disabled");
            Arc::new(DisabledNotifier)
        }
    };

    let (triage_tx, triage_rx) = mpsc::unbounded_channel();
    let state = Arc::new(AppState {
        conn: pool,
        config: config.clone(),
        classifier,
        notifier,
        triage_tx,
    });
    triage::spawn_worker(state.clone(), triage_rx);

    let cors = match config.server.allowed_origin.parse::<HeaderValue>() {
        Ok(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods([Method::GET, Method::POST, Method::PUT])
            .allow_headers(Any),
        Err(e) => {
            warn!("invalid APP_ORIGIN ({e}); allowing any origin");
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::PUT])
                .allow_headers(Any)
        }
    };

    let app = axum::Router::new()
        .merge(configure_auth_routes())
        .merge(configure_ticket_routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting HTTP server on {addr}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        error!("server error: {e}");
        std::process::exit(1);
    }
}
