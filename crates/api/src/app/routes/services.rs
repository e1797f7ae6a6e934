use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Extension, Path, Query,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use crate::app::routes::plans;
use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route(
            "/",
            get(list_services)
                .post(create_service)
                .put(update_service)
                .delete(delete_service),
        )
        .route("/:id", get(get_service))
        .route("/:id/plans", get(plans::list_plans).post(plans::create_plan))
}

pub async fn list_services(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    match services.catalog.list_services().await {
        Ok(all) => {
            let items = all.iter().map(dto::service_detail_to_json).collect::<Vec<_>>();
            (StatusCode::OK, Json(items)).into_response()
        }
        Err(e) => errors::store_error_to_response(e, "Failed to fetch services"),
    }
}

/// Returns a one-element array so clients can treat it like the list endpoint.
pub async fn get_service(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match dto::parse_service_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.catalog.get_service(id).await {
        Ok(detail) => (
            StatusCode::OK,
            Json(vec![dto::service_detail_to_json(&detail)]),
        )
            .into_response(),
        Err(e) => errors::store_error_to_response(e, "Failed to fetch service"),
    }
}

pub async fn create_service(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<dto::CreateServiceRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(rejection) => return errors::json_rejection_to_response(rejection),
    };
    let req = match body.into_domain() {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    if let Err(e) = req.validate() {
        return errors::domain_error_to_response(e);
    }

    match services.catalog.create_service(req).await {
        Ok(created) => {
            tracing::info!(
                service_id = %created.service.id,
                features = created.feature_ids.len(),
                plans = created.plan_ids.len(),
                "service created"
            );
            (StatusCode::CREATED, Json(dto::created_service_to_json(&created))).into_response()
        }
        Err(e) => errors::store_error_to_response(e, "Failed to create service"),
    }
}

pub async fn update_service(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<dto::UpdateServiceRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(rejection) => return errors::json_rejection_to_response(rejection),
    };
    let req = match body.into_domain() {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    if let Err(e) = req.validate() {
        return errors::domain_error_to_response(e);
    }

    match services.catalog.update_service(req).await {
        Ok(service) => {
            tracing::info!(service_id = %service.id, "service updated");
            (
                StatusCode::OK,
                Json(serde_json::json!({ "message": "Service updated successfully" })),
            )
                .into_response()
        }
        Err(e) => errors::store_error_to_response(e, "Failed to update service"),
    }
}

pub async fn delete_service(
    Extension(services): Extension<Arc<AppServices>>,
    params: Result<Query<dto::DeleteServiceParams>, QueryRejection>,
) -> axum::response::Response {
    let Query(params) = match params {
        Ok(p) => p,
        Err(rejection) => return errors::query_rejection_to_response(rejection),
    };
    let Some(raw) = params.id.filter(|v| !v.trim().is_empty()) else {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "ID parameter is required",
        );
    };
    let id = match dto::parse_service_id(&raw) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.catalog.delete_service(id).await {
        Ok(()) => {
            tracing::info!(service_id = %id, "service deleted");
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "message": "Service and all related data deleted successfully"
                })),
            )
                .into_response()
        }
        Err(e) => errors::store_error_to_response(e, "Failed to delete service"),
    }
}
