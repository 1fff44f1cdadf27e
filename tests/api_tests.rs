use std::sync::Arc;

use anyhow::Result;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
    response::Response,
};
use dispatch_service::{
    api::{AppState, TWILIO_SIGNATURE_HEADER, WebhookSettings, router},
    clients::health::HealthChecker,
    models::{
        message::{Channel, DispatchRequest},
        status::{ChannelStatus, MessageStatus},
    },
    reconciler::StatusReconciler,
    signature::{sign_email, sign_sms},
    store::MessageStore,
};
use serde_json::{Value as JsonValue, json};
use tower::ServiceExt;
use uuid::Uuid;

use crate::common::{FakeGateway, Harness};

const PUBLIC_BASE: &str = "https://notify.example.com";
const TWILIO_TOKEN: &str = "twilio-token";
const MAILGUN_KEY: &str = "mailgun-key";

fn app(harness: &Harness) -> Router {
    router(Arc::new(AppState {
        dispatcher: harness.dispatcher.clone(),
        reconciler: Arc::new(StatusReconciler::new(harness.store.clone())),
        ingestor: harness.ingestor.clone(),
        messages: harness.store.clone(),
        health_checker: HealthChecker::new(),
        webhooks: WebhookSettings {
            public_base_url: PUBLIC_BASE.to_string(),
            twilio_auth_token: TWILIO_TOKEN.to_string(),
            mailgun_signing_key: Some(MAILGUN_KEY.to_string()),
        },
    }))
}

fn json_request(method: &str, uri: &str, body: JsonValue) -> Result<Request<Body>> {
    Ok(Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))?)
}

fn sms_callback(params: &[(&str, &str)], signature: &str) -> Result<Request<Body>> {
    let body = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    Ok(Request::builder()
        .method("POST")
        .uri("/webhooks/sms/status")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .header(TWILIO_SIGNATURE_HEADER, signature)
        .body(Body::from(body))?)
}

fn sign(params: &[(&str, &str)]) -> String {
    let owned: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    sign_sms(&format!("{}/webhooks/sms/status", PUBLIC_BASE), &owned, TWILIO_TOKEN).expect("signable")
}

async fn body_json(response: Response) -> Result<JsonValue> {
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn dispatch_sms(harness: &Harness) -> Result<Uuid> {
    harness.seed_template("welcome", "Welcome", "Hi {{n}}").await;
    let response = app(harness)
        .oneshot(json_request(
            "POST",
            "/api/v1/messages",
            json!({ "template_name": "welcome", "phone": "1234567890", "params": { "n": "Jo" } }),
        )?)
        .await?;
    let body = body_json(response).await?;
    Ok(body["data"]["id"].as_str().expect("message id").parse()?)
}

/// Test: Health reports healthy with in-process backends
#[tokio::test]
async fn test_health_endpoint() -> Result<()> {
    let harness = Harness::new();

    let response = app(&harness)
        .oneshot(Request::builder().uri("/health").body(Body::empty())?)
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await?;
    assert_eq!(body["status"], "healthy");

    Ok(())
}

/// Test: Templates are created once; a second create conflicts
#[tokio::test]
async fn test_template_create_and_conflict() -> Result<()> {
    let harness = Harness::new();
    let payload = json!({
        "name": "welcome",
        "default_variant": {
            "email_subject": "Welcome {{n}}",
            "email_body": "Hi {{n}}",
            "sms_body": "Hi {{n}}"
        }
    });

    let created = app(&harness)
        .oneshot(json_request("POST", "/api/v1/templates", payload.clone())?)
        .await?;
    assert_eq!(created.status(), StatusCode::CREATED);
    let body = body_json(created).await?;
    assert_eq!(body["data"]["placeholders"], json!(["n"]));

    let conflict = app(&harness)
        .oneshot(json_request("POST", "/api/v1/templates", payload)?)
        .await?;
    assert_eq!(conflict.status(), StatusCode::CONFLICT);

    Ok(())
}

/// Test: Dispatching a message returns 201 and the message is retrievable
#[tokio::test]
async fn test_dispatch_and_fetch_message() -> Result<()> {
    let harness = Harness::new();
    let id = dispatch_sms(&harness).await?;

    let response = app(&harness)
        .oneshot(Request::builder().uri(format!("/api/v1/messages/{}", id)).body(Body::empty())?)
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await?;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["sms"]["status"], "sent");
    assert_eq!(body["data"]["sms"]["body"], "Hi Jo");

    Ok(())
}

/// Test: Requests without recipients are a 400
#[tokio::test]
async fn test_dispatch_without_recipients_is_bad_request() -> Result<()> {
    let harness = Harness::new();
    harness.seed_template("welcome", "Welcome", "Hi").await;

    let response = app(&harness)
        .oneshot(json_request("POST", "/api/v1/messages", json!({ "template_name": "welcome" }))?)
        .await?;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await?;
    assert_eq!(body["success"], false);

    Ok(())
}

/// Test: Unknown message ids are a 404
#[tokio::test]
async fn test_unknown_message_is_not_found() -> Result<()> {
    let harness = Harness::new();

    let response = app(&harness)
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/messages/{}", Uuid::new_v4()))
                .body(Body::empty())?,
        )
        .await?;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    Ok(())
}

/// Test: A signed SMS callback advances the stored status
#[tokio::test]
async fn test_signed_sms_callback_updates_status() -> Result<()> {
    let harness = Harness::new();
    let id = dispatch_sms(&harness).await?;

    let params = [("MessageSid", "sms-1"), ("MessageStatus", "delivered")];
    let response = app(&harness)
        .oneshot(sms_callback(&params, &sign(&params))?)
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    let message = harness.store.get_message(id).await?.expect("message stored");
    assert_eq!(
        message.sms.map(|r| r.status),
        Some(ChannelStatus::Lifecycle(MessageStatus::Delivered))
    );

    Ok(())
}

/// Test: An SMS callback with a bad signature is rejected and changes nothing
#[tokio::test]
async fn test_sms_callback_with_bad_signature_is_forbidden() -> Result<()> {
    let harness = Harness::new();
    let id = dispatch_sms(&harness).await?;

    let params = [("MessageSid", "sms-1"), ("MessageStatus", "delivered")];
    let response = app(&harness)
        .oneshot(sms_callback(&params, "bm90LWEtc2lnbmF0dXJl")?)
        .await?;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let message = harness.store.get_message(id).await?.expect("message stored");
    assert_eq!(
        message.sms.map(|r| r.status),
        Some(ChannelStatus::Lifecycle(MessageStatus::Sent))
    );

    Ok(())
}

/// Test: A signed callback for an unknown provider id is a 404
#[tokio::test]
async fn test_sms_callback_for_unknown_message_is_not_found() -> Result<()> {
    let harness = Harness::new();

    let params = [("MessageSid", "SM-unknown"), ("MessageStatus", "delivered")];
    let response = app(&harness)
        .oneshot(sms_callback(&params, &sign(&params))?)
        .await?;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    Ok(())
}

/// Test: Email callbacks are verified with the signing key
#[tokio::test]
async fn test_email_callback_signature() -> Result<()> {
    let harness = Harness::with_gateways(
        FakeGateway::accepting(Channel::Sms, "sent"),
        FakeGateway::accepting(Channel::Email, "queued"),
    );
    harness.seed_template("welcome", "Welcome", "Hi").await;
    let message = harness
        .dispatcher
        .dispatch(DispatchRequest::new("welcome").with_email("a@example.com"))
        .await?;

    let payload = |signature: String| {
        json!({
            "signature": { "timestamp": "1700000000", "token": "tok", "signature": signature },
            "event-data": {
                "event": "delivered",
                "message": { "headers": { "message-id": "email-1" } }
            }
        })
    };

    let rejected = app(&harness)
        .oneshot(json_request("POST", "/webhooks/email/status", payload("00".to_string()))?)
        .await?;
    assert_eq!(rejected.status(), StatusCode::FORBIDDEN);

    let signature = sign_email(MAILGUN_KEY, "1700000000", "tok").expect("signable");
    let accepted = app(&harness)
        .oneshot(json_request("POST", "/webhooks/email/status", payload(signature))?)
        .await?;
    assert_eq!(accepted.status(), StatusCode::OK);

    let stored = harness.store.get_message(message.id).await?.expect("message stored");
    assert_eq!(
        stored.email.map(|r| r.status),
        Some(ChannelStatus::Lifecycle(MessageStatus::Delivered))
    );

    Ok(())
}

/// Test: A batch upload without recipient columns is a 400
#[tokio::test]
async fn test_batch_upload_missing_headers_is_bad_request() -> Result<()> {
    let harness = Harness::new();
    harness.seed_template("welcome", "Welcome", "Hi {{n}}").await;

    let response = app(&harness)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/batches?template=welcome")
                .header(header::CONTENT_TYPE, "text/csv")
                .body(Body::from("name,n\nJo,Jo\n"))?,
        )
        .await?;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await?;
    assert!(body["error"].as_str().unwrap_or_default().contains("phone"));

    Ok(())
}

/// Test: A variant delete of the default variant conflicts
#[tokio::test]
async fn test_default_variant_delete_conflicts() -> Result<()> {
    let harness = Harness::new();
    harness.seed_template("welcome", "Welcome", "Hi").await;

    let response = app(&harness)
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/v1/templates/welcome/variants/en/A")
                .body(Body::empty())?,
        )
        .await?;

    assert_eq!(response.status(), StatusCode::CONFLICT);
    Ok(())
}
