use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::header,
    response::{IntoResponse, Response},
    Extension, Json,
};
use bytes::Bytes;
use futures::StreamExt;
use serde::Serialize;

use crate::auth::{Action, Principal};
use crate::protocol::{
    BatchDeleteAllTerminals, CreateTerminal, DeleteAllResponse, DeleteAllTerminals, DeleteTerminal,
    DeleteTerminalResponse, ExecuteTerminal, ListTerminals, TerminalSummary,
};
use crate::target::Target;

use super::error::ApiError;
use super::AppState;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
}

pub(super) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Unwrap a JSON body, reporting malformed input in the API error shape.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError::InvalidRequest(rejection.body_text()))
}

fn authorize(
    state: &AppState,
    principal: &Principal,
    target: Option<&Target>,
    action: Action,
) -> Result<(), ApiError> {
    if state.permissions.check(principal, target, action) {
        Ok(())
    } else {
        tracing::debug!(user = %principal.name, ?action, ?target, "permission denied");
        Err(ApiError::PermissionDenied)
    }
}

pub(super) async fn create_terminal(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    payload: Result<Json<CreateTerminal>, JsonRejection>,
) -> Result<Json<TerminalSummary>, ApiError> {
    let request = body(payload)?;
    authorize(&state, &principal, Some(&request.target), Action::Terminal)?;
    let summary = state.dispatcher.create(&request).await?;
    tracing::info!(user = %principal.name, terminal = %summary.name, target = %summary.target, "terminal created");
    Ok(Json(summary))
}

pub(super) async fn delete_terminal(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    payload: Result<Json<DeleteTerminal>, JsonRejection>,
) -> Result<Json<DeleteTerminalResponse>, ApiError> {
    let request = body(payload)?;
    authorize(&state, &principal, Some(&request.target), Action::Terminal)?;
    let deleted = state
        .dispatcher
        .delete(&request.target, &request.terminal)
        .await?;
    Ok(Json(DeleteTerminalResponse { deleted }))
}

pub(super) async fn delete_all_terminals(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    payload: Result<Json<DeleteAllTerminals>, JsonRejection>,
) -> Result<Json<DeleteAllResponse>, ApiError> {
    let request = body(payload)?;
    let target = Target::server(&request.server);
    authorize(&state, &principal, Some(&target), Action::Admin)?;
    let deleted = state.dispatcher.delete_all(&request.server).await?;
    tracing::info!(user = %principal.name, server = %request.server, deleted, "deleted all terminals");
    Ok(Json(DeleteAllResponse { deleted }))
}

pub(super) async fn batch_delete_all_terminals(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    payload: Result<Json<BatchDeleteAllTerminals>, JsonRejection>,
) -> Result<Json<DeleteAllResponse>, ApiError> {
    let request = body(payload)?;
    authorize(&state, &principal, None, Action::Admin)?;
    let deleted = state.dispatcher.batch_delete(&request).await?;
    tracing::info!(user = %principal.name, servers = ?request.servers, tags = ?request.tags, deleted, "batch deleted terminals");
    Ok(Json(DeleteAllResponse { deleted }))
}

pub(super) async fn list_terminals(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    payload: Result<Json<ListTerminals>, JsonRejection>,
) -> Result<Json<Vec<TerminalSummary>>, ApiError> {
    let request = body(payload)?;
    authorize(&state, &principal, request.target.as_ref(), Action::Read)?;
    Ok(Json(state.dispatcher.list(request.target.as_ref()).await?))
}

/// Stream command output as `text/plain`, one line per `\n`.
///
/// Errors after the first byte cannot change the status; they end the body
/// early and the caller sees no exit-code sentinel.
pub(super) async fn execute_terminal(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    payload: Result<Json<ExecuteTerminal>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request = body(payload)?;
    authorize(&state, &principal, Some(&request.target), Action::Terminal)?;
    let lines = state.dispatcher.execute(&request).await?;
    let stream = lines.map(|line| line.map(|mut l| {
        l.push('\n');
        Bytes::from(l)
    }));
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(stream),
    )
        .into_response())
}
