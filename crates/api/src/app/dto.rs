use axum::http::StatusCode;
use serde::Deserialize;

use kpcyber_catalog::{
    CreatedPlan, CreatedService, Feature, FeatureChange, NewFeature, NewPlan, NewService,
    NewServicePlan, Plan, PlanWithFeatures, Service, ServiceDetail, UpdateService,
};
use kpcyber_core::{FeatureId, ServiceId};
use kpcyber_infra::mailer::ContactMessage;

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

// Top-level fields are optional so a missing field yields a 400 with a
// readable message instead of a deserialization failure.

#[derive(Debug, Deserialize)]
pub struct FeatureInput {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ServicePlanInput {
    pub name: String,
    pub description: String,
    pub price: f64,
    /// Positions into the request's `features` list.
    #[serde(default)]
    pub features: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateServiceRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<f64>,
    #[serde(default)]
    pub features: Vec<FeatureInput>,
    #[serde(default)]
    pub plans: Vec<ServicePlanInput>,
}

#[derive(Debug, Deserialize)]
pub struct FeatureChangeInput {
    pub id: Option<i64>,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateServiceRequest {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<f64>,
    #[serde(default)]
    pub features: Vec<FeatureChangeInput>,
}

#[derive(Debug, Deserialize)]
pub struct CreatePlanRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<f64>,
    /// Ids of existing features of the same service.
    pub features: Option<Vec<i64>>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteServiceParams {
    pub id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ContactRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub message: Option<String>,
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl CreateServiceRequest {
    pub fn into_domain(self) -> Result<NewService, axum::response::Response> {
        let (Some(name), Some(description), Some(price)) =
            (present(self.name), present(self.description), self.price)
        else {
            return Err(errors::json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                "Name, description, and price are required",
            ));
        };

        Ok(NewService {
            name,
            description,
            price,
            features: self
                .features
                .into_iter()
                .map(|f| NewFeature { name: f.name })
                .collect(),
            plans: self
                .plans
                .into_iter()
                .map(|p| NewServicePlan {
                    name: p.name,
                    description: p.description,
                    price: p.price,
                    features: p.features,
                })
                .collect(),
        })
    }
}

impl UpdateServiceRequest {
    pub fn into_domain(self) -> Result<UpdateService, axum::response::Response> {
        let (Some(id), Some(name), Some(description), Some(price)) = (
            self.id.filter(|id| *id > 0),
            present(self.name),
            present(self.description),
            self.price,
        ) else {
            return Err(errors::json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                "ID, name, description, and price are required",
            ));
        };

        Ok(UpdateService {
            id: ServiceId::new(id),
            name,
            description,
            price,
            features: self
                .features
                .into_iter()
                .map(|f| FeatureChange {
                    id: f.id.map(FeatureId::new),
                    name: f.name,
                })
                .collect(),
        })
    }
}

impl CreatePlanRequest {
    pub fn into_domain(self) -> Result<NewPlan, axum::response::Response> {
        let (Some(name), Some(description), Some(price), Some(features)) = (
            present(self.name),
            present(self.description),
            self.price,
            self.features,
        ) else {
            return Err(errors::json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                "Missing required fields (name, description, price, features)",
            ));
        };

        Ok(NewPlan {
            name,
            description,
            price,
            feature_ids: features.into_iter().map(FeatureId::new).collect(),
        })
    }
}

impl ContactRequest {
    pub fn into_domain(self) -> Result<ContactMessage, axum::response::Response> {
        let (Some(name), Some(email), Some(message)) =
            (present(self.name), present(self.email), present(self.message))
        else {
            return Err(errors::json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                "Name, email, and message are required",
            ));
        };
        Ok(ContactMessage { name, email, message })
    }
}

/// Parse a service id taken from the path or query string.
pub fn parse_service_id(raw: &str) -> Result<ServiceId, axum::response::Response> {
    raw.parse::<ServiceId>().map_err(|_| {
        errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "Invalid service ID")
    })
}

// -------------------------
// JSON mapping helpers
// -------------------------

pub fn service_row_to_json(s: &Service) -> serde_json::Value {
    serde_json::json!({
        "id": s.id,
        "name": s.name,
        "description": s.description,
        "price": s.price,
        "created_at": s.created_at,
        "updated_at": s.updated_at,
    })
}

pub fn feature_to_json(f: &Feature) -> serde_json::Value {
    serde_json::json!({
        "id": f.id,
        "name": f.name,
        "created_at": f.created_at,
        "updated_at": f.updated_at,
    })
}

/// Plan as nested under a service: short field names, feature names.
pub fn plan_summary_to_json(p: &PlanWithFeatures) -> serde_json::Value {
    serde_json::json!({
        "id": p.plan.id,
        "name": p.plan.name,
        "description": p.plan.description,
        "price": p.plan.price,
        "created_at": p.plan.created_at,
        "updated_at": p.plan.updated_at,
        "features": p.feature_names,
    })
}

pub fn service_detail_to_json(d: &ServiceDetail) -> serde_json::Value {
    let mut json = service_row_to_json(&d.service);
    json["features"] = d.features.iter().map(feature_to_json).collect();
    json["plans"] = d.plans.iter().map(plan_summary_to_json).collect();
    json
}

/// Plan as a `service_plans` row plus its `features`.
pub fn plan_row_to_json(p: &Plan, features: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "id": p.id,
        "service_id": p.service_id,
        "plan_name": p.name,
        "plan_description": p.description,
        "plan_price": p.price,
        "created_at": p.created_at,
        "updated_at": p.updated_at,
        "features": features,
    })
}

pub fn plan_with_feature_names_to_json(p: &PlanWithFeatures) -> serde_json::Value {
    plan_row_to_json(&p.plan, serde_json::json!(p.feature_names))
}

pub fn created_plan_to_json(c: &CreatedPlan) -> serde_json::Value {
    plan_row_to_json(&c.plan, serde_json::json!(c.feature_ids))
}

pub fn created_service_to_json(c: &CreatedService) -> serde_json::Value {
    serde_json::json!({
        "message": "Service created successfully",
        "service": service_row_to_json(&c.service),
        "featureIds": c.feature_ids,
        "planIds": c.plan_ids,
    })
}
