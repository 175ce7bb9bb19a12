use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};

use crate::{
    chat::{self, ChatQuery},
    state::AppState,
};

/// `GET /ws?workspaceId=<uuid>`: authorize first, upgrade only on success
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<ChatQuery>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
) -> Response {
    let token = bearer
        .as_ref()
        .map(|TypedHeader(Authorization(bearer))| bearer.token())
        .or(query.token.as_deref());

    match chat::authorize(&state, token, query.workspace_id.as_deref()).await {
        Ok(admitted) => {
            tracing::info!(
                user_id = %admitted.user_id,
                workspace_id = %admitted.workspace_id,
                role = %admitted.role,
                "chat upgrade accepted"
            );
            ws.on_upgrade(move |socket| chat::run(socket, state, admitted))
        }
        Err(rejection) => {
            tracing::info!(
                workspace_id = query.workspace_id.as_deref().unwrap_or("-"),
                reason = %rejection,
                "chat upgrade rejected"
            );
            rejection.into_response()
        }
    }
}
