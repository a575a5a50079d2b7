use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::application::{
    error::HttpError,
    mediator::{MediatorReply, PING_REPLY, RenderQuery},
};

use super::HttpState;

pub(super) async fn render(
    State(state): State<HttpState>,
    Query(query): Query<RenderQuery>,
) -> Result<Response, HttpError> {
    match state.mediator.handle(&query).await? {
        MediatorReply::Pong => Ok((StatusCode::OK, PING_REPLY).into_response()),
        MediatorReply::Rendered(response) => Ok((StatusCode::OK, Json(*response)).into_response()),
    }
}
