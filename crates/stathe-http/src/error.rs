use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use stathe_common::error::StatheError;

/// Turns a failed scrape into a complete error response.
pub struct MetricsApiError(pub StatheError);

impl From<StatheError> for MetricsApiError {
    fn from(value: StatheError) -> Self {
        Self(value)
    }
}

impl MetricsApiError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            StatheError::InvalidArgument(_)
            | StatheError::LabelArity { .. }
            | StatheError::InconsistentLabels { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for MetricsApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = format!("An error has occurred while serving metrics:\n\n{}\n", self.0);
        let mut response = (status, body).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }
}
