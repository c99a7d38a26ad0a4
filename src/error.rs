use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};

use crate::ytdlp::ExtractionError;

/// Everything a download request can fail with, as seen by the client.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Missing url parameter")]
    MissingUrl,
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingUrl => StatusCode::BAD_REQUEST,
            Self::Extraction(ExtractionError::DownloadFailed { .. }) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::Extraction(ExtractionError::TimedOut { .. }) => StatusCode::GATEWAY_TIMEOUT,
            Self::Extraction(ExtractionError::ArtifactMissing | ExtractionError::Internal(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut body = serde_json::json!({
            "error": self.to_string()
        });
        if let Self::Extraction(e) = self {
            if let Some(tail) = e.stderr_tail() {
                body["stderr_tail"] = serde_json::Value::from(tail);
            }
        }
        HttpResponse::build(self.status_code()).json(body)
    }
}
