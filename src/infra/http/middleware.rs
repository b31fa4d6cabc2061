use std::time::Instant;

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{error, warn};

use crate::{
    error::{ErrorReport, HttpError},
    pool::TenantId,
};

pub const TENANT_HEADER: &str = "x-tenant-id";

/// Resolve the tenant from `x-tenant-id` and store it as a request extension.
///
/// Requests without the header carry no tenant; a malformed id is rejected
/// before it can reach storage or key derivation.
pub async fn tenant_context(mut request: Request, next: Next) -> Response {
    let Some(raw) = request.headers().get(TENANT_HEADER) else {
        return next.run(request).await;
    };

    let tenant = match raw.to_str().map(TenantId::parse) {
        Ok(Ok(tenant)) => tenant,
        Ok(Err(err)) => {
            return HttpError::from_error(
                "infra::http::tenant_context",
                StatusCode::BAD_REQUEST,
                "Invalid tenant id",
                &err,
            )
            .into_response();
        }
        Err(_) => {
            return HttpError::new(
                "infra::http::tenant_context",
                StatusCode::BAD_REQUEST,
                "Invalid tenant id",
                "tenant header is not visible ASCII",
            )
            .into_response();
        }
    };

    request.extensions_mut().insert(tenant);
    next.run(request).await
}

pub async fn log_responses(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();
    let tenant = request
        .headers()
        .get(TENANT_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let mut response = next.run(request).await;
    let status = response.status();

    if status.is_client_error() || status.is_server_error() {
        let elapsed_ms = start.elapsed().as_millis();
        let report = response.extensions_mut().remove::<ErrorReport>();
        let (source, messages) = match report {
            Some(report) => (report.source, report.messages),
            None => ("unknown", Vec::new()),
        };
        let detail = messages
            .first()
            .cloned()
            .unwrap_or_else(|| "no diagnostic available".to_string());

        if status.is_server_error() {
            error!(
                status = status.as_u16(),
                method = %method,
                path = %uri.path(),
                tenant_id = tenant,
                elapsed_ms = elapsed_ms,
                source = source,
                detail = %detail,
                chain = ?messages,
                "request failed",
            );
        } else {
            warn!(
                status = status.as_u16(),
                method = %method,
                path = %uri.path(),
                tenant_id = tenant,
                elapsed_ms = elapsed_ms,
                source = source,
                detail = %detail,
                chain = ?messages,
                "client request error",
            );
        }
    }

    response
}
