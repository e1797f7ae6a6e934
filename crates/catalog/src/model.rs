//! Persisted catalog rows and the aggregated views built from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use kpcyber_core::{FeatureId, PlanId, ServiceId};

/// A sellable service (row of `services`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    pub description: String,
    pub price: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A feature offered by exactly one service (row of `features`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub id: FeatureId,
    pub service_id: ServiceId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A pricing tier of exactly one service (row of `service_plans`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub service_id: ServiceId,
    pub name: String,
    pub description: String,
    pub price: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A plan together with the names of the features it includes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanWithFeatures {
    pub plan: Plan,
    pub feature_names: Vec<String>,
}

/// Everything the site shows for one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDetail {
    pub service: Service,
    pub features: Vec<Feature>,
    pub plans: Vec<PlanWithFeatures>,
}

impl ServiceDetail {
    pub fn id(&self) -> ServiceId {
        self.service.id
    }
}
