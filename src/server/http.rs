//! HTTP server implementation
//!
//! hyper http1 with TokioIo; one spawned task per connection, upgrades
//! enabled for the WebSocket endpoint. Routing is a manual method+path
//! match; /auth/* dispatches through its own handler.

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::signal::{
    ctrl_c,
    unix::{signal, SignalKind},
};
use tracing::{debug, error, info};

use crate::actions::ActionVerifier;
use crate::broadcast::Broadcaster;
use crate::cache::LayeredCache;
use crate::config::Args;
use crate::engine::ScoreEngine;
use crate::error::PodiumError;
use crate::identity::IdentityService;
use crate::routes::{self, BoxBody};
use crate::server::websocket;
use crate::store::ScoreStore;

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub store: Arc<ScoreStore>,
    pub cache: Arc<LayeredCache>,
    pub verifier: Arc<ActionVerifier>,
    pub engine: Arc<ScoreEngine>,
    pub broadcaster: Arc<Broadcaster>,
    pub identity: Arc<IdentityService>,
    pub started_at: Instant,
}

/// Start the HTTP server and serve until a shutdown signal arrives
pub async fn run(state: Arc<AppState>) -> Result<(), PodiumError> {
    let listener = TcpListener::bind(state.args.listen).await?;

    info!(
        "Podium listening on {} as node {}",
        state.args.listen, state.args.node_id
    );

    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("Shutdown signal received, stopping accept loop");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);

                            let service = service_fn(move |req| {
                                let state = Arc::clone(&state);
                                async move { handle_request(state, addr, req).await }
                            });

                            if let Err(err) = http1::Builder::new()
                                .serve_connection(io, service)
                                .with_upgrades()
                                .await
                            {
                                debug!("Connection from {} ended: {:?}", addr, err);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Error accepting connection: {:?}", e);
                    }
                }
            }
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let interrupt = async {
        ctrl_c().await.expect("Failed to install Ctrl+C handler");
        info!("Received Ctrl+C");
    };

    #[cfg(unix)]
    let terminate = async {
        signal(SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
        info!("Received terminate signal");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {},
        _ = terminate => {},
    }
}

/// Route incoming HTTP requests
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!("[{}] {} {}", addr, method, path);

    if path.starts_with("/auth") {
        if let Some(response) = routes::auth_routes::handle_auth_request(req, state, addr).await {
            return Ok(response);
        }
        return Ok(routes::not_found_response(&path));
    }

    let response = match (method, path.as_str()) {
        (Method::GET, "/health") | (Method::GET, "/healthz") => {
            routes::health::health_check(state).await
        }

        (Method::GET, "/ready") | (Method::GET, "/readyz") => {
            routes::health::readiness_check(state).await
        }

        (Method::GET, "/version") => routes::health::version_info(),

        (Method::OPTIONS, _) => routes::cors_preflight(),

        (Method::GET, "/scoreboard") => routes::scoreboard::handle_scoreboard(state).await,

        (Method::POST, "/scoreboard/generate-action") => {
            routes::scoreboard::handle_generate_action(req, state).await
        }

        (Method::POST, "/scoreboard/update") => {
            routes::scoreboard::handle_update(req, state, addr).await
        }

        (Method::GET, p) if p.starts_with("/scoreboard/user/") => {
            let identity = p.strip_prefix("/scoreboard/user/").unwrap_or("").to_string();
            routes::scoreboard::handle_user_rank(req, state, &identity).await
        }

        (Method::GET, "/ws") => {
            if hyper_tungstenite::is_upgrade_request(&req) {
                websocket::handle_ws_upgrade(state, req).await
            } else {
                routes::failure_response(&PodiumError::MissingFields(
                    "WebSocket upgrade required for /ws".into(),
                ))
            }
        }

        (Method::GET, "/cache/stats") => routes::cache_admin::handle_stats(req, state).await,
        (Method::POST, "/cache/warm") => routes::cache_admin::handle_warm(req, state).await,
        (Method::DELETE, "/cache/clear") => routes::cache_admin::handle_clear(req, state).await,

        _ => routes::not_found_response(&path),
    };

    Ok(response)
}
