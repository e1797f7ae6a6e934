use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

/// Accept the contact form and hand it to the mailer.
pub async fn send_email(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<dto::ContactRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(rejection) => return errors::json_rejection_to_response(rejection),
    };
    let message = match body.into_domain() {
        Ok(m) => m,
        Err(resp) => return resp,
    };
    if let Err(e) = message.validate() {
        return errors::domain_error_to_response(e);
    }

    match services.mailer.send(&message).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "message": "Message received" })),
        )
            .into_response(),
        Err(e) => errors::mailer_error_to_response(e),
    }
}
