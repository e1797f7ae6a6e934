//! Catalog write requests and their validation.
//!
//! Stores call `validate()` before touching any table, so a request that
//! fails here never produces a partial write.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use kpcyber_core::{DomainError, DomainResult, FeatureId, PlanId, ServiceId};

use crate::model::{Plan, Service};

/// Feature to create together with a new service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFeature {
    pub name: String,
}

/// Plan to create together with a new service.
///
/// `features` holds positions into the owning [`NewService::features`] list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewServicePlan {
    pub name: String,
    pub description: String,
    pub price: f64,
    pub features: Vec<i64>,
}

impl NewServicePlan {
    /// Feature positions that resolve against a list of `len` features.
    ///
    /// Out-of-range positions are skipped; repeated positions collapse to
    /// their first occurrence.
    pub fn resolved_feature_indices(&self, len: usize) -> Vec<usize> {
        let mut seen = HashSet::new();
        self.features
            .iter()
            .filter_map(|&idx| usize::try_from(idx).ok())
            .filter(|&idx| idx < len)
            .filter(|idx| seen.insert(*idx))
            .collect()
    }
}

/// Create a service with its features and plans in one write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewService {
    pub name: String,
    pub description: String,
    pub price: f64,
    pub features: Vec<NewFeature>,
    pub plans: Vec<NewServicePlan>,
}

impl NewService {
    pub fn validate(&self) -> DomainResult<()> {
        require_text("name", &self.name)?;
        require_text("description", &self.description)?;
        require_price("price", self.price)?;

        let mut feature_names = HashSet::new();
        for feature in &self.features {
            require_text("feature name", &feature.name)?;
            if !feature_names.insert(feature.name.as_str()) {
                return Err(DomainError::conflict(format!(
                    "Feature '{}' already exists for this service",
                    feature.name
                )));
            }
        }

        let mut plan_names = HashSet::new();
        for plan in &self.plans {
            require_text("plan name", &plan.name)?;
            require_text("plan description", &plan.description)?;
            require_price("plan price", plan.price)?;
            if !plan_names.insert(plan.name.as_str()) {
                return Err(DomainError::conflict(format!(
                    "Plan '{}' already exists for this service",
                    plan.name
                )));
            }
        }

        Ok(())
    }
}

/// Rename an existing feature (`id` set) or add a new one (`id` absent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureChange {
    pub id: Option<FeatureId>,
    pub name: String,
}

/// Update a service's fields and upsert its features.
///
/// Plans are not touched by an update; use the plan endpoints for those.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateService {
    pub id: ServiceId,
    pub name: String,
    pub description: String,
    pub price: f64,
    pub features: Vec<FeatureChange>,
}

impl UpdateService {
    pub fn validate(&self) -> DomainResult<()> {
        if !self.id.is_valid() {
            return Err(DomainError::invalid_id(format!("service id {} is not valid", self.id)));
        }
        require_text("name", &self.name)?;
        require_text("description", &self.description)?;
        require_price("price", self.price)?;
        for change in &self.features {
            require_text("feature name", &change.name)?;
            if let Some(id) = change.id {
                if !id.is_valid() {
                    return Err(DomainError::invalid_id(format!("feature id {id} is not valid")));
                }
            }
        }
        Ok(())
    }
}

/// Add a plan to an existing service, linking features by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPlan {
    pub name: String,
    pub description: String,
    pub price: f64,
    pub feature_ids: Vec<FeatureId>,
}

impl NewPlan {
    pub fn validate(&self) -> DomainResult<()> {
        require_text("name", &self.name)?;
        require_text("description", &self.description)?;
        require_price("price", self.price)?;
        Ok(())
    }

    /// Feature ids with repeats removed, first occurrence wins.
    pub fn distinct_feature_ids(&self) -> Vec<FeatureId> {
        let mut seen = HashSet::new();
        self.feature_ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect()
    }
}

/// Outcome of [`NewService`]: the stored row plus the ids assigned to its children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedService {
    pub service: Service,
    pub feature_ids: Vec<FeatureId>,
    pub plan_ids: Vec<PlanId>,
}

/// Outcome of [`NewPlan`]: the stored row plus the linked feature ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedPlan {
    pub plan: Plan,
    pub feature_ids: Vec<FeatureId>,
}

fn require_text(field: &str, value: &str) -> DomainResult<()> {
    if value.trim().is_empty() {
        return Err(DomainError::validation(format!("{field} is required")));
    }
    Ok(())
}

fn require_price(field: &str, value: f64) -> DomainResult<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(DomainError::validation(format!(
            "{field} must be a non-negative number"
        )));
    }
    Ok(())
}
