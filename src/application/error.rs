use std::error::Error as StdError;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::{
    application::{mediator::ValidationError, pipeline::RenderError},
    domain::error::DomainError,
    infra::error::InfraError,
};

/// Error chain attached to a response so the logging middleware can report it.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    body: String,
    report: ErrorReport,
}

impl HttpError {
    pub fn new(
        source: &'static str,
        status: StatusCode,
        body: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            status,
            body: body.into(),
            report: ErrorReport::from_message(source, status, detail),
        }
    }

    pub fn from_error(
        source: &'static str,
        status: StatusCode,
        body: impl Into<String>,
        error: &dyn StdError,
    ) -> Self {
        Self {
            status,
            body: body.into(),
            report: ErrorReport::from_error(source, status, error),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.body).into_response();
        self.report.attach(&mut response);
        response
    }
}

impl From<ValidationError> for HttpError {
    fn from(error: ValidationError) -> Self {
        HttpError::from_error(
            "infra::http::validation_error_to_http_error",
            StatusCode::BAD_REQUEST,
            error.usage_message(),
            &error,
        )
    }
}

impl From<AppError> for HttpError {
    fn from(error: AppError) -> Self {
        match error {
            AppError::Validation(err) => err.into(),
            AppError::Domain(err @ DomainError::Validation { .. }) => HttpError::from_error(
                "application::error::AppError",
                StatusCode::BAD_REQUEST,
                "Request could not be processed",
                &err,
            ),
            other => HttpError::from_error(
                "application::error::AppError",
                StatusCode::INTERNAL_SERVER_ERROR,
                "Oops, an unexpected error occurred.",
                &other,
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("bad request parameters: {0}")]
    Validation(#[from] ValidationError),
    #[error("render failed: {0}")]
    Render(#[source] RenderError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        HttpError::from(self).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn validation_errors_map_to_bad_request_with_usage() {
        let response = AppError::from(ValidationError::MissingInputPath).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let report = response
            .extensions()
            .get::<ErrorReport>()
            .expect("report attached");
        assert_eq!(report.messages, vec!["missing \"inpath\"".to_string()]);
    }

    #[test]
    fn internal_render_errors_map_to_server_error() {
        let err = AppError::Render(RenderError::Internal("disk vanished".into()));
        let http = HttpError::from(err);
        assert_eq!(http.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let timeout = AppError::Render(RenderError::CompletionTimeout(Duration::from_secs(40)));
        assert_eq!(
            HttpError::from(timeout).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn report_collects_source_chain() {
        let err = AppError::Render(RenderError::Internal("disk vanished".into()));
        let report = ErrorReport::from_error("test", StatusCode::INTERNAL_SERVER_ERROR, &err);
        assert_eq!(report.messages.len(), 2);
        assert!(report.messages[1].contains("disk vanished"));
    }
}
