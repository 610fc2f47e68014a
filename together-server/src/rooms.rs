use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Path, State},
    routing::post,
    Json,
};
use log::info;
use together_core::{ErrorKind, RoomAccess, RoomCode};

use crate::{
    context::ServerContext,
    errors::{ServerError, ServerResult},
    schemas::{JoinRoomSchema, NewRoomSchema, ValidatedJson},
    serialized::ToSerialized,
    Router,
};

/// Parses a room code from a path, treating anything malformed as unknown.
pub fn parse_code(code: &str) -> ServerResult<RoomCode> {
    RoomCode::parse(code).ok_or_else(|| ServerError::Room {
        kind: ErrorKind::NotFound,
        message: format!("Room {} does not exist", code),
    })
}

async fn create_room(
    State(context): State<ServerContext>,
    ValidatedJson(body): ValidatedJson<NewRoomSchema>,
) -> ServerResult<Json<RoomAccess>> {
    let membership = context
        .collab
        .rooms
        .create_room(body.password, body.display_handle)
        .await?;

    info!("Created room {}", membership.room);

    Ok(Json(membership.to_serialized()))
}

async fn join_room(
    State(context): State<ServerContext>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(code): Path<String>,
    ValidatedJson(body): ValidatedJson<JoinRoomSchema>,
) -> ServerResult<Json<RoomAccess>> {
    let code = parse_code(&code)?;
    let membership = context
        .collab
        .rooms
        .join_room(&code, body.password, body.display_handle, addr.ip())
        .await?;

    Ok(Json(membership.to_serialized()))
}

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_room))
        .route("/:code/join", post(join_room))
}
