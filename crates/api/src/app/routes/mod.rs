use axum::{
    routing::{get, post},
    Router,
};

pub mod contact;
pub mod plans;
pub mod services;
pub mod system;

/// Router for the site's JSON endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .nest("/api/services", services::router())
        .route("/api/send-email", post(contact::send_email))
}
