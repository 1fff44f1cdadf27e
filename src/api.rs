use std::{collections::HashMap, sync::Arc};

use anyhow::{Error, Result};
use axum::{
    Form, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Json},
    routing::{delete, get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    batch::BatchIngestor,
    clients::health::HealthChecker,
    dispatcher::MessageDispatcher,
    error::DispatchError,
    models::{
        callback::{MailgunWebhook, StatusCallback},
        health::HealthStatus,
        message::{Channel, DispatchRequest},
        response::ApiResponse,
        status::BatchStatus,
        template::{CreateTemplateRequest, CreateVariantRequest, Template, VariantKey},
        validation::FieldError,
    },
    reconciler::StatusReconciler,
    signature::{verify_email_signature, verify_sms_signature},
    store::MessageStore,
    templates::template_placeholders,
};

pub const TWILIO_SIGNATURE_HEADER: &str = "x-twilio-signature";

/// Secrets and addressing needed to authenticate provider callbacks.
#[derive(Debug, Clone)]
pub struct WebhookSettings {
    pub public_base_url: String,
    pub twilio_auth_token: String,
    pub mailgun_signing_key: Option<String>,
}

pub struct AppState {
    pub dispatcher: Arc<MessageDispatcher>,
    pub reconciler: Arc<StatusReconciler>,
    pub ingestor: Arc<BatchIngestor>,
    pub messages: Arc<dyn MessageStore>,
    pub health_checker: HealthChecker,
    pub webhooks: WebhookSettings,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/messages", post(create_message))
        .route("/api/v1/messages/{id}", get(get_message))
        .route("/api/v1/batches", post(create_batch))
        .route("/api/v1/batches/{id}", get(get_batch).delete(cancel_batch))
        .route("/api/v1/templates", post(create_template))
        .route("/api/v1/templates/{name}", get(get_template))
        .route("/api/v1/templates/{name}/variants", post(create_variant))
        .route(
            "/api/v1/templates/{name}/variants/{language}/{treatment}",
            delete(delete_variant),
        )
        .route("/webhooks/sms/status", post(sms_status_webhook))
        .route("/webhooks/email/status", post(email_status_webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_api_server(state: Arc<AppState>, port: u16) -> Result<(), Error> {
    let app = router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!(address = %addr, "HTTP server started");

    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_checker.check_all().await;

    let status_code = match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn create_message(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DispatchRequest>,
) -> Result<impl IntoResponse, DispatchError> {
    let message = state.dispatcher.dispatch(request).await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(message, "Message dispatched")),
    ))
}

async fn get_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, DispatchError> {
    let message = state
        .messages
        .get_message(id)
        .await?
        .ok_or(DispatchError::UnknownMessage(id))?;

    Ok(Json(ApiResponse::success(message, "Message retrieved")))
}

#[derive(Debug, Deserialize)]
struct BatchQuery {
    template: String,

    #[serde(default)]
    send_at: Option<DateTime<Utc>>,
}

async fn create_batch(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BatchQuery>,
    body: Bytes,
) -> Result<impl IntoResponse, DispatchError> {
    let batch = state
        .ingestor
        .ingest(&body, &query.template, query.send_at)
        .await?;

    let (status_code, message) = match batch.status {
        BatchStatus::Scheduled => (StatusCode::ACCEPTED, "Batch scheduled"),
        _ => (StatusCode::CREATED, "Batch dispatched"),
    };

    Ok((status_code, Json(ApiResponse::success(batch, message))))
}

async fn get_batch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, DispatchError> {
    let batch = state.ingestor.get(id).await?;
    Ok(Json(ApiResponse::success(batch, "Batch retrieved")))
}

async fn cancel_batch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, DispatchError> {
    state.ingestor.cancel(id).await?;
    Ok(Json(ApiResponse::ok("Batch cancelled")))
}

#[derive(Debug, Serialize)]
struct TemplateView {
    #[serde(flatten)]
    template: Template,
    placeholders: Vec<String>,
}

impl From<Template> for TemplateView {
    fn from(template: Template) -> Self {
        let placeholders = template_placeholders(&template, &[Channel::Sms, Channel::Email])
            .into_iter()
            .collect();
        Self {
            template,
            placeholders,
        }
    }
}

async fn create_template(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateTemplateRequest>,
) -> Result<impl IntoResponse, DispatchError> {
    let template = state
        .dispatcher
        .templates()
        .create_template(&request.name, request.default_variant)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(TemplateView::from(template), "Template created")),
    ))
}

async fn get_template(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, DispatchError> {
    let template = state.dispatcher.templates().get(&name).await?;
    Ok(Json(ApiResponse::success(TemplateView::from(template), "Template retrieved")))
}

async fn create_variant(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(request): Json<CreateVariantRequest>,
) -> Result<impl IntoResponse, DispatchError> {
    let variant = state
        .dispatcher
        .templates()
        .create_variant(
            &name,
            VariantKey::new(request.language, request.treatment),
            request.content,
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(variant, "Variant created")),
    ))
}

async fn delete_variant(
    State(state): State<Arc<AppState>>,
    Path((name, language, treatment)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, DispatchError> {
    state
        .dispatcher
        .templates()
        .delete_variant(&name, &VariantKey::new(language, treatment))
        .await?;

    Ok(Json(ApiResponse::ok("Variant deleted")))
}

/// Twilio signs the URL it was configured with, so the canonical URL is
/// rebuilt from the public base rather than the request's Host header.
fn canonical_url(public_base_url: &str, uri: &Uri) -> String {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    format!("{}{}", public_base_url.trim_end_matches('/'), path_and_query)
}

async fn sms_status_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    uri: Uri,
    Form(params): Form<Vec<(String, String)>>,
) -> Result<impl IntoResponse, DispatchError> {
    let signature = headers
        .get(TWILIO_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let url = canonical_url(&state.webhooks.public_base_url, &uri);
    if !verify_sms_signature(&url, &params, signature, &state.webhooks.twilio_auth_token) {
        warn!(%url, "Rejected SMS status callback with invalid signature");
        return Err(DispatchError::InvalidSignature);
    }

    let form: HashMap<String, String> = params.into_iter().collect();
    let callback = StatusCallback::from_twilio_form(&form).ok_or_else(|| {
        DispatchError::Validation(vec![FieldError::new(
            "MessageSid",
            "MessageSid and MessageStatus are required",
        )])
    })?;

    let outcome = state.reconciler.apply_callback(&callback).await?;
    Ok(Json(ApiResponse::success(outcome, "Status callback processed")))
}

async fn email_status_webhook(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<MailgunWebhook>,
) -> Result<impl IntoResponse, DispatchError> {
    if !verify_email_signature(
        state.webhooks.mailgun_signing_key.as_deref(),
        &payload.signature.timestamp,
        &payload.signature.token,
        &payload.signature.signature,
    ) {
        warn!("Rejected email status callback with invalid signature");
        return Err(DispatchError::InvalidSignature);
    }

    let callback = StatusCallback::from_mailgun_event(&payload.event_data).ok_or_else(|| {
        DispatchError::Validation(vec![FieldError::new(
            "event-data.message.headers.message-id",
            "message id is required",
        )])
    })?;

    let outcome = state.reconciler.apply_callback(&callback).await?;
    Ok(Json(ApiResponse::success(outcome, "Status callback processed")))
}
