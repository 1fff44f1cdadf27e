use std::collections::BTreeSet;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    message::Channel,
    phone::PhoneParsingError,
    response::ApiResponse,
    template::VariantKey,
    validation::FieldError,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Persistence operation timed out")]
    Timeout,

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Conflict: {0}")]
    Conflict(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

/// Failure reported by a channel gateway.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SendError {
    pub message: String,
}

impl SendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("At least one valid recipient is required")]
    InvalidRecipients(Vec<FieldError>),

    #[error(transparent)]
    PhoneParsing(#[from] PhoneParsingError),

    #[error("Validation failed")]
    Validation(Vec<FieldError>),

    #[error("Template '{0}' not found")]
    TemplateNotFound(String),

    #[error("Template '{0}' already exists")]
    DuplicateTemplate(String),

    #[error("No variant of template '{template}' resolves for {requested}")]
    VariantUnresolvable { template: String, requested: VariantKey },

    #[error("Variant {key} already exists for template '{template}'")]
    DuplicateVariant { template: String, key: VariantKey },

    #[error("Variant {key} of template '{template}' is referenced by existing messages")]
    VariantInUse { template: String, key: VariantKey },

    #[error("Variant {key} of template '{template}' does not exist")]
    VariantNotFound { template: String, key: VariantKey },

    #[error("The default variant of template '{0}' cannot be deleted")]
    DefaultVariantRequired(String),

    #[error("Missing placeholder values: {}", join(.0))]
    MissingPlaceholder(BTreeSet<String>),

    #[error("No message found for {channel} provider id '{provider_message_id}'")]
    MessageNotFound {
        channel: Channel,
        provider_message_id: String,
    },

    #[error("Message {0} not found")]
    UnknownMessage(Uuid),

    #[error("{detail}")]
    MissingHeaders {
        detail: String,
        missing: BTreeSet<String>,
    },

    #[error("Malformed recipient file: {0}")]
    MalformedFile(String),

    #[error("Batch {0} not found")]
    BatchNotFound(Uuid),

    #[error("Batch {0} is no longer scheduled")]
    BatchNotCancellable(Uuid),

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error(transparent)]
    Storage(#[from] StoreError),
}

fn join(keys: &BTreeSet<String>) -> String {
    keys.iter().cloned().collect::<Vec<_>>().join(", ")
}

impl DispatchError {
    fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::InvalidRecipients(_)
            | DispatchError::PhoneParsing(_)
            | DispatchError::Validation(_)
            | DispatchError::MissingPlaceholder(_)
            | DispatchError::MissingHeaders { .. }
            | DispatchError::MalformedFile(_) => StatusCode::BAD_REQUEST,
            DispatchError::TemplateNotFound(_)
            | DispatchError::VariantNotFound { .. }
            | DispatchError::MessageNotFound { .. }
            | DispatchError::UnknownMessage(_)
            | DispatchError::BatchNotFound(_) => StatusCode::NOT_FOUND,
            DispatchError::VariantUnresolvable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            DispatchError::DuplicateTemplate(_)
            | DispatchError::DuplicateVariant { .. }
            | DispatchError::VariantInUse { .. }
            | DispatchError::DefaultVariantRequired(_)
            | DispatchError::BatchNotCancellable(_) => StatusCode::CONFLICT,
            DispatchError::InvalidSignature => StatusCode::FORBIDDEN,
            DispatchError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn field_errors(&self) -> Option<&[FieldError]> {
        match self {
            DispatchError::InvalidRecipients(errors) | DispatchError::Validation(errors) => {
                Some(errors)
            }
            _ => None,
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let detail = match (&self, self.field_errors()) {
            (_, Some(errors)) => errors
                .iter()
                .map(|e| format!("{}: {}", e.field, e.reason))
                .collect::<Vec<_>>()
                .join("; "),
            (DispatchError::MissingHeaders { missing, .. }, None) => {
                format!("missing headers: {}", join(missing))
            }
            (DispatchError::Storage(_), None) => "internal storage failure".to_string(),
            _ => self.to_string(),
        };

        let body = ApiResponse::<()>::error(detail, self.to_string());
        (status, Json(body)).into_response()
    }
}
