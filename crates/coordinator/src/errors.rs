use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::infra::rpc::RpcError;

/// Every error kind the coordinator can surface, mapped to its HTTP status in `IntoResponse`.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("no funded utxo for order")]
    NoFundedUtxo,
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("outputs mismatch")]
    OutputsMismatch,
    #[error("rbf disabled on input, sequence not replaceable")]
    RbfDisabled,
    #[error("missing input value")]
    MissingInputValue,
    #[error("fee mismatch: decoded {decoded}, computed {computed}")]
    FeeMismatch { decoded: i64, computed: i64 },
    #[error("negative fee: {0}")]
    NegativeFee(i64),
    #[error("outputs+fee exceeds funded total")]
    ExceedsFunding,
    #[error("not enough signatures: {0}")]
    NotEnoughSignatures(String),
    #[error("unexpected change output")]
    UnexpectedChange,
    #[error("upstream error: {0}")]
    UpstreamError(String),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("rate limited")]
    RateLimited,
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl From<RpcError> for AppError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Unavailable(msg) => AppError::UpstreamUnavailable(msg),
            RpcError::Remote(msg) => AppError::UpstreamError(msg),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Unavailable(format!("database error: {err}"))
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl AppError {
    fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "ValidationError",
            AppError::NotFound(_) => "NotFound",
            AppError::Unauthorized(_) => "Unauthorized",
            AppError::InvalidTransition(_) => "InvalidTransition",
            AppError::NoFundedUtxo => "NoFundedUtxo",
            AppError::InsufficientFunds(_) => "InsufficientFunds",
            AppError::OutputsMismatch => "OutputsMismatch",
            AppError::RbfDisabled => "RBFDisabled",
            AppError::MissingInputValue => "MissingInputValue",
            AppError::FeeMismatch { .. } => "FeeMismatch",
            AppError::NegativeFee(_) => "NegativeFee",
            AppError::ExceedsFunding => "ExceedsFunding",
            AppError::NotEnoughSignatures(_) => "NotEnoughSignatures",
            AppError::UnexpectedChange => "UnexpectedChange",
            AppError::UpstreamError(_) => "UpstreamError",
            AppError::UpstreamUnavailable(_) => "UpstreamUnavailable",
            AppError::RateLimited => "RateLimited",
            AppError::Unavailable(_) => "Unavailable",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_)
            | AppError::InvalidTransition(_)
            | AppError::NoFundedUtxo
            | AppError::InsufficientFunds(_)
            | AppError::OutputsMismatch
            | AppError::RbfDisabled
            | AppError::MissingInputValue
            | AppError::FeeMismatch { .. }
            | AppError::NegativeFee(_)
            | AppError::ExceedsFunding
            | AppError::NotEnoughSignatures(_)
            | AppError::UnexpectedChange => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::UpstreamError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
