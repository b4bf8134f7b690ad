use crate::{errors::ServiceError, services::CallbackOutcome, AppState};
use axum::{extract::State, http::HeaderMap, response::IntoResponse};
use bytes::Bytes;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

// POST /api/v1/payments/webhook
#[utoipa::path(
    post,
    path = "/api/v1/payments/webhook",
    request_body = String,
    responses(
        (status = 200, description = "Webhook accepted"),
        (status = 401, description = "Invalid signature"),
        (status = 400, description = "Invalid payload"),
        (status = 404, description = "Unknown gateway reference; redeliver later")
    ),
    tag = "Payments"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    // Verify signature if configured
    if let Some(secret) = state.config.payment_webhook_secret.clone() {
        let tolerance = state.config.payment_webhook_tolerance_secs.unwrap_or(300);
        if !verify_signature(&headers, &body, &secret, tolerance) {
            warn!("Payment webhook signature verification failed");
            return Err(ServiceError::Unauthorized(
                "invalid webhook signature".to_string(),
            ));
        }
    }

    // Parse JSON
    let json: Value = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::BadRequest(format!("invalid json: {}", e)))?;

    // Skip events already processed (at-least-once delivery)
    let event_id = json.get("id").and_then(|v| v.as_str()).map(str::to_string);
    if let Some(ref event_id) = event_id {
        if already_processed(&state, event_id).await {
            info!("Webhook event {} already processed", event_id);
            return Ok((axum::http::StatusCode::OK, "ok"));
        }
    }

    let event_type = json.get("type").and_then(|v| v.as_str()).unwrap_or("");
    let outcome = match event_type {
        "payment.succeeded" | "charge.succeeded" => Some(CallbackOutcome::Succeeded),
        "payment.failed" | "charge.failed" => Some(CallbackOutcome::Failed),
        _ => {
            info!("Unhandled payment webhook type: {}", event_type);
            None
        }
    };

    if let Some(outcome) = outcome {
        let reference = json
            .get("data")
            .and_then(|d| d.get("object"))
            .and_then(|o| o.get("id"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ServiceError::BadRequest("payload carries no gateway reference".to_string())
            })?;

        state
            .services
            .orders
            .handle_gateway_callback(reference, outcome)
            .await?;
    }

    // Record the event id only after successful handling so a failed
    // delivery is retried by the gateway
    if let Some(event_id) = event_id {
        mark_processed(&state, &event_id).await;
    }

    Ok((axum::http::StatusCode::OK, "ok"))
}

/// Best-effort dedupe: if Redis is unreachable the engine's own attempt
/// idempotence still makes redelivery harmless.
async fn already_processed(state: &AppState, event_id: &str) -> bool {
    let key = format!("wh:{}", event_id);
    if let Ok(mut conn) = state.redis.get_async_connection().await {
        let exists: Result<bool, _> = redis::cmd("EXISTS").arg(&key).query_async(&mut conn).await;
        return matches!(exists, Ok(true));
    }
    false
}

async fn mark_processed(state: &AppState, event_id: &str) {
    let key = format!("wh:{}", event_id);
    if let Ok(mut conn) = state.redis.get_async_connection().await {
        let _: Result<(), _> = redis::cmd("SET")
            .arg(&key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(24 * 3600)
            .query_async(&mut conn)
            .await;
    }
}

fn verify_signature(headers: &HeaderMap, payload: &Bytes, secret: &str, tolerance_secs: u64) -> bool {
    // Generic HMAC: x-timestamp and x-signature headers
    if let (Some(ts), Some(sig)) = (headers.get("x-timestamp"), headers.get("x-signature")) {
        if let (Ok(ts), Ok(sig)) = (ts.to_str(), sig.to_str()) {
            if let Ok(ts_i) = ts.parse::<i64>() {
                let now = chrono::Utc::now().timestamp();
                if (now - ts_i).unsigned_abs() > tolerance_secs {
                    return false;
                }
            }
            return signature_matches(ts, payload, secret, sig);
        }
    }
    // Stripe-like support: Stripe-Signature with t=, v1=
    if let Some(sig) = headers.get("Stripe-Signature").and_then(|h| h.to_str().ok()) {
        let mut ts = "";
        let mut v1 = "";
        for part in sig.split(',') {
            let mut it = part.split('=');
            match (it.next(), it.next()) {
                (Some("t"), Some(val)) => ts = val,
                (Some("v1"), Some(val)) => v1 = val,
                _ => {}
            }
        }
        if !ts.is_empty() && !v1.is_empty() {
            return signature_matches(ts, payload, secret, v1);
        }
    }
    false
}

fn signature_matches(ts: &str, payload: &Bytes, secret: &str, provided: &str) -> bool {
    let signed = format!("{}.{}", ts, std::str::from_utf8(payload).unwrap_or(""));
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(signed.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());
    constant_time_eq(&expected, provided)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}
