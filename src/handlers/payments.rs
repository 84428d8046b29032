use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tracing::{info, warn};

use crate::{
    errors::{CheckoutErrorCode, ServiceError},
    services::{commerce::checkout_service::SettledPayment, payments::CallbackStatus},
    ApiResponse, ApiResult, AppState,
};

type HmacSha256 = Hmac<Sha256>;

const TIMESTAMP_HEADER: &str = "x-timestamp";
const SIGNATURE_HEADER: &str = "x-signature";
const DEFAULT_TOLERANCE_SECS: u64 = 300;

/// Query string the provider appends when sending the shopper back.
#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    #[serde(rename = "Authority", alias = "authority")]
    pub authority: Option<String>,
    #[serde(rename = "Status", alias = "status")]
    pub status: Option<String>,
    #[serde(rename = "ref", alias = "ref_id")]
    pub ref_id: Option<String>,
}

/// GET /api/v1/payments/callback
pub async fn payment_callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> ApiResult<SettledPayment> {
    let authority = params
        .authority
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| ServiceError::BadRequest("Authority is required".to_string()))?;

    let settled = state
        .checkout
        .complete_from_callback(
            &authority,
            params.ref_id,
            CallbackStatus::parse(params.status.as_deref()),
        )
        .await?;
    Ok(Json(ApiResponse::success(settled)))
}

#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    pub authority: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub ref_id: Option<String>,
}

/// POST /api/v1/payments/webhook
///
/// Server-to-server settlement notice. Deliveries are retried by the provider,
/// so an order that is already final is acknowledged rather than rejected.
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    if let Some(secret) = state.config.payment_webhook_secret.as_deref() {
        let tolerance = state
            .config
            .payment_webhook_tolerance_secs
            .unwrap_or(DEFAULT_TOLERANCE_SECS);
        if !verify_signature(&headers, &body, secret, tolerance, chrono::Utc::now().timestamp())
        {
            warn!("payment webhook signature verification failed");
            return Err(ServiceError::Unauthorized(
                "invalid webhook signature".to_string(),
            ));
        }
    }

    let payload: WebhookPayload = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::BadRequest(format!("invalid webhook payload: {}", e)))?;

    let result = state
        .checkout
        .complete_from_callback(
            &payload.authority,
            payload.ref_id,
            CallbackStatus::parse(payload.status.as_deref()),
        )
        .await;

    match result {
        Ok(settled) => Ok((
            StatusCode::OK,
            Json(json!({ "status": "processed", "order_number": settled.order_number })),
        )),
        Err(err) if err.code() == Some(CheckoutErrorCode::OrderAlreadyFinalized) => {
            info!(authority = %payload.authority, "webhook for finalized order acknowledged");
            Ok((StatusCode::OK, Json(json!({ "status": "already_processed" }))))
        }
        Err(err) => Err(err),
    }
}

fn verify_signature(
    headers: &HeaderMap,
    payload: &[u8],
    secret: &str,
    tolerance_secs: u64,
    now: i64,
) -> bool {
    let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());
    let (Some(timestamp), Some(signature)) = (header(TIMESTAMP_HEADER), header(SIGNATURE_HEADER))
    else {
        return false;
    };

    let Ok(sent_at) = timestamp.parse::<i64>() else {
        return false;
    };
    if (now - sent_at).unsigned_abs() > tolerance_secs {
        return false;
    }
    let Ok(signature) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    mac.verify_slice(&signature).is_ok()
}

#[cfg(test)]
fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(format!("{}.", timestamp).as_bytes());
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, Uri};

    const SECRET: &str = "whsec_test";

    fn headers(timestamp: i64, signature: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(TIMESTAMP_HEADER, HeaderValue::from_str(&timestamp.to_string()).unwrap());
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(signature).unwrap());
        headers
    }

    #[test]
    fn accepts_a_fresh_valid_signature() {
        let body = br#"{"authority":"A1","status":"OK"}"#;
        let signature = sign_payload(SECRET, 1_000, body);
        assert!(verify_signature(&headers(1_000, &signature), body, SECRET, 300, 1_100));
    }

    #[test]
    fn rejects_tampered_stale_or_unsigned_payloads() {
        let body = br#"{"authority":"A1","status":"OK"}"#;
        let signature = sign_payload(SECRET, 1_000, body);

        let tampered = br#"{"authority":"A2","status":"OK"}"#;
        assert!(!verify_signature(&headers(1_000, &signature), tampered, SECRET, 300, 1_000));
        assert!(!verify_signature(&headers(1_000, &signature), body, SECRET, 300, 2_000));
        assert!(!verify_signature(&HeaderMap::new(), body, SECRET, 300, 1_000));
        assert!(!verify_signature(&headers(1_000, "zz-not-hex"), body, SECRET, 300, 1_000));
    }

    #[test]
    fn callback_params_accept_both_casings() {
        let uri: Uri = "/payments/callback?Authority=A1&Status=NOK&ref=77".parse().unwrap();
        let Query(upper) = Query::<CallbackParams>::try_from_uri(&uri).unwrap();
        assert_eq!(upper.authority.as_deref(), Some("A1"));
        assert_eq!(upper.status.as_deref(), Some("NOK"));
        assert_eq!(upper.ref_id.as_deref(), Some("77"));

        let uri: Uri = "/payments/callback?authority=A1&status=OK".parse().unwrap();
        let Query(lower) = Query::<CallbackParams>::try_from_uri(&uri).unwrap();
        assert_eq!(lower.authority.as_deref(), Some("A1"));
        assert!(lower.ref_id.is_none());
    }
}
