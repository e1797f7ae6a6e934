use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

/// Plans of one service, cheapest first.
pub async fn list_plans(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let service_id = match dto::parse_service_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.catalog.list_plans(service_id).await {
        Ok(plans) if plans.is_empty() => errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            "No plans found for this service",
        ),
        Ok(plans) => {
            let items = plans
                .iter()
                .map(dto::plan_with_feature_names_to_json)
                .collect::<Vec<_>>();
            (StatusCode::OK, Json(items)).into_response()
        }
        Err(e) => errors::store_error_to_response(e, "Failed to fetch service plans"),
    }
}

pub async fn create_plan(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    body: Result<Json<dto::CreatePlanRequest>, JsonRejection>,
) -> axum::response::Response {
    let service_id = match dto::parse_service_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
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

    match services.catalog.create_plan(service_id, req).await {
        Ok(created) => {
            tracing::info!(
                service_id = %service_id,
                plan_id = %created.plan.id,
                features = created.feature_ids.len(),
                "plan created"
            );
            (StatusCode::CREATED, Json(dto::created_plan_to_json(&created))).into_response()
        }
        Err(e) => errors::store_error_to_response(e, "Failed to create service plan"),
    }
}
