use std::{net::SocketAddr, sync::Arc};

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State, WebSocketUpgrade},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::Deserialize;
use server_api::{
    add_attachment, add_member, create_chat, delete_message, edit_message, get_chat,
    get_or_create_direct_chat, list_messages, list_user_chats, mark_read, remove_member,
    send_message, set_member_role, toggle_reaction, unread_count, verify_session_token,
    ApiContext, FileDirectory, MissingFileDirectory, Outcome, SessionKeys, DEFAULT_PAGE_SIZE,
};
use shared::{
    domain::{ChatId, MessageId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        AddAttachmentRequest, AddMemberRequest, ChatAction, ChatDetail, ChatSummary,
        EditMessageRequest, MarkReadRequest, MemberSummary, MessagePayload, ReadStateResponse,
        SetMemberRoleRequest, ToggleReactionRequest, ToggleReactionResponse,
    },
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;
mod files;
mod hub;

use app_state::AppState;
use config::{load_settings, prepare_database_url};
use files::HttpFileDirectory;
use hub::ChatHub;

const MAX_BODY_BYTES: usize = 256 * 1024;

type HttpError = (StatusCode, Json<ApiError>);

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: String,
}

#[derive(Debug, Deserialize)]
struct ListMessagesQuery {
    limit: Option<u32>,
    before: Option<i64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let files: Arc<dyn FileDirectory> = match settings.file_service_url.as_deref() {
        Some(url) => Arc::new(HttpFileDirectory::new(url)?),
        None => {
            info!("no file service configured; attachments will be rejected");
            Arc::new(MissingFileDirectory)
        }
    };
    let api = ApiContext {
        storage,
        files,
        session: SessionKeys {
            secret: settings.auth_secret,
            ttl_seconds: settings.session_ttl_seconds,
        },
    };
    let state = AppState {
        api,
        hub: ChatHub::new(settings.event_buffer),
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/chats", get(http_list_chats).post(http_chat_action))
        .route("/chats/direct/:recipient_id", get(http_direct_chat))
        .route("/chats/:chat_id", get(http_get_chat))
        .route("/chats/:chat_id/messages", get(http_list_messages))
        .route("/chats/:chat_id/read", post(http_mark_read))
        .route("/chats/:chat_id/unread", get(http_unread_count))
        .route("/chats/:chat_id/members", post(http_add_member))
        .route(
            "/chats/:chat_id/members/:user_id",
            patch(http_set_member_role).delete(http_remove_member),
        )
        .route(
            "/messages/:message_id",
            patch(http_edit_message).delete(http_delete_message),
        )
        .route("/messages/:message_id/reactions", post(http_toggle_reaction))
        .route("/messages/:message_id/attachments", post(http_add_attachment))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

/// Caller identity taken from `Authorization: Bearer <token>`.
struct AuthUser(UserId);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = HttpError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| http_error(ApiError::unauthorized("missing bearer token")))?;
        verify_session_token(&state.api.session, token.trim())
            .map(AuthUser)
            .map_err(http_error)
    }
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn http_error(err: ApiError) -> HttpError {
    (status_for(err.code), Json(err))
}

/// Fans out the mutation's event, if any, and hands back its value.
fn publish<T>(state: &AppState, origin: UserId, outcome: Outcome<T>) -> T {
    if let Some(event) = outcome.event {
        state.hub.publish(event, Some(origin));
    }
    outcome.value
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, HttpError> {
    state.api.storage.health_check().await.map_err(|e| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new(ErrorCode::Internal, e.to_string())),
        )
    })?;
    Ok("ok")
}

async fn http_list_chats(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Vec<ChatSummary>>, HttpError> {
    let chats = list_user_chats(&state.api, user_id)
        .await
        .map_err(http_error)?;
    Ok(Json(chats))
}

/// `POST /chats` carries either a chat creation or a new message.
async fn http_chat_action(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Json(action): Json<ChatAction>,
) -> Result<Response, HttpError> {
    match action {
        ChatAction::Create(request) => {
            let chat = create_chat(&state.api, user_id, &request)
                .await
                .map_err(http_error)?;
            Ok((StatusCode::CREATED, Json(chat)).into_response())
        }
        ChatAction::Message(request) => {
            let outcome = send_message(&state.api, user_id, &request)
                .await
                .map_err(http_error)?;
            let message = publish(&state, user_id, outcome);
            Ok((StatusCode::CREATED, Json(message)).into_response())
        }
    }
}

async fn http_direct_chat(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(recipient_id): Path<i64>,
) -> Result<Json<ChatSummary>, HttpError> {
    let chat = get_or_create_direct_chat(&state.api, user_id, UserId(recipient_id))
        .await
        .map_err(http_error)?;
    Ok(Json(chat))
}

async fn http_get_chat(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(chat_id): Path<i64>,
) -> Result<Json<ChatDetail>, HttpError> {
    let chat = get_chat(&state.api, user_id, ChatId(chat_id))
        .await
        .map_err(http_error)?;
    Ok(Json(chat))
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(chat_id): Path<i64>,
    Query(q): Query<ListMessagesQuery>,
) -> Result<Json<Vec<MessagePayload>>, HttpError> {
    let messages = list_messages(
        &state.api,
        user_id,
        ChatId(chat_id),
        q.limit.unwrap_or(DEFAULT_PAGE_SIZE),
        q.before.map(MessageId),
    )
    .await
    .map_err(http_error)?;
    Ok(Json(messages))
}

async fn http_mark_read(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(chat_id): Path<i64>,
    body: Option<Json<MarkReadRequest>>,
) -> Result<Json<ReadStateResponse>, HttpError> {
    let up_to = body.and_then(|Json(req)| req.up_to);
    let read_state = mark_read(&state.api, user_id, ChatId(chat_id), up_to)
        .await
        .map_err(http_error)?;
    Ok(Json(read_state))
}

async fn http_unread_count(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(chat_id): Path<i64>,
) -> Result<Json<ReadStateResponse>, HttpError> {
    let read_state = unread_count(&state.api, user_id, ChatId(chat_id))
        .await
        .map_err(http_error)?;
    Ok(Json(read_state))
}

async fn http_add_member(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(chat_id): Path<i64>,
    Json(req): Json<AddMemberRequest>,
) -> Result<Json<MemberSummary>, HttpError> {
    let outcome = add_member(&state.api, user_id, ChatId(chat_id), req.user_id)
        .await
        .map_err(http_error)?;
    Ok(Json(publish(&state, user_id, outcome)))
}

async fn http_remove_member(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path((chat_id, target)): Path<(i64, i64)>,
) -> Result<StatusCode, HttpError> {
    let outcome = remove_member(&state.api, user_id, ChatId(chat_id), UserId(target))
        .await
        .map_err(http_error)?;
    publish(&state, user_id, outcome);
    Ok(StatusCode::NO_CONTENT)
}

async fn http_set_member_role(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path((chat_id, target)): Path<(i64, i64)>,
    Json(req): Json<SetMemberRoleRequest>,
) -> Result<Json<MemberSummary>, HttpError> {
    let member = set_member_role(
        &state.api,
        user_id,
        ChatId(chat_id),
        UserId(target),
        req.role,
    )
    .await
    .map_err(http_error)?;
    Ok(Json(member))
}

async fn http_edit_message(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(message_id): Path<i64>,
    Json(req): Json<EditMessageRequest>,
) -> Result<Json<MessagePayload>, HttpError> {
    let outcome = edit_message(&state.api, user_id, MessageId(message_id), &req.content)
        .await
        .map_err(http_error)?;
    Ok(Json(publish(&state, user_id, outcome)))
}

async fn http_delete_message(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(message_id): Path<i64>,
) -> Result<Json<MessagePayload>, HttpError> {
    let outcome = delete_message(&state.api, user_id, MessageId(message_id))
        .await
        .map_err(http_error)?;
    Ok(Json(publish(&state, user_id, outcome)))
}

async fn http_toggle_reaction(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(message_id): Path<i64>,
    Json(req): Json<ToggleReactionRequest>,
) -> Result<Json<ToggleReactionResponse>, HttpError> {
    let outcome = toggle_reaction(&state.api, user_id, MessageId(message_id), &req.emoji)
        .await
        .map_err(http_error)?;
    Ok(Json(publish(&state, user_id, outcome)))
}

async fn http_add_attachment(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(message_id): Path<i64>,
    Json(req): Json<AddAttachmentRequest>,
) -> Result<Json<MessagePayload>, HttpError> {
    let outcome = add_attachment(&state.api, user_id, MessageId(message_id), req.file_id)
        .await
        .map_err(http_error)?;
    Ok(Json(publish(&state, user_id, outcome)))
}

/// The token rides in the query string because browsers cannot set headers
/// on a websocket upgrade.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> Result<impl IntoResponse, HttpError> {
    let user_id = verify_session_token(&state.api.session, &q.token).map_err(http_error)?;
    let api = state.api.clone();
    let hub = state.hub.clone();
    Ok(ws.on_upgrade(move |socket| hub::run_connection(api, hub, socket, user_id)))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
