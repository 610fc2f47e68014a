mod auth;
mod context;
mod errors;
mod relay;
mod rooms;
mod schemas;
mod serialized;
mod sessions;

use std::{io, net::SocketAddr, sync::Arc};

use axum::{extract::State, routing::get, Json};
use log::info;
use tokio::net::TcpListener;
use together_collab::Collab;
use together_core::Health;
use tower_http::cors::{Any, CorsLayer};

pub use context::ServerContext;
pub use errors::*;

pub type Router = axum::Router<ServerContext>;

/// Builds the full router: rooms, clip transfer, sessions and health.
pub fn router(context: ServerContext) -> axum::Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let rooms_router = Router::new()
        .merge(rooms::router())
        .merge(relay::router());

    Router::new()
        .nest("/rooms", rooms_router)
        .nest("/sessions", sessions::router())
        .route("/health", get(health))
        .layer(cors)
        .with_state(context)
}

async fn health(State(context): State<ServerContext>) -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
        rooms: context.collab.rooms.count(),
    })
}

/// Serves the together API on an already bound listener.
pub async fn serve(listener: TcpListener, collab: Arc<Collab>) -> io::Result<()> {
    let router = router(ServerContext { collab });

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

/// Starts the together server on the configured address.
pub async fn run_server(collab: Arc<Collab>) -> io::Result<()> {
    let config = collab.config();
    let addr: SocketAddr = (config.host, config.port).into();

    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on {}", listener.local_addr()?);

    serve(listener, collab).await
}
