//! Catalog data access: the `CatalogStore` contract and its backends.
//!
//! Three interchangeable implementations exist:
//!
//! - [`InMemoryCatalogStore`]: process-local tables for tests/dev.
//! - [`SqliteCatalogStore`]: single-file database, the default for the site.
//! - [`PostgresCatalogStore`]: shared relational database.
//!
//! All of them enforce the same rules: feature and plan names are unique per
//! service, plan-feature links never cross services, deleting a service
//! removes everything hanging off it, and every write either fully applies
//! or leaves the catalog untouched.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use kpcyber_catalog::{
    CreatedPlan, CreatedService, Feature, NewPlan, NewService, Plan, PlanWithFeatures, Service,
    ServiceDetail, UpdateService,
};
use kpcyber_core::{DomainError, PlanId, ServiceId};

pub mod in_memory;
pub mod postgres;
pub mod sqlite;

pub use in_memory::InMemoryCatalogStore;
pub use postgres::PostgresCatalogStore;
pub use sqlite::SqliteCatalogStore;

/// Catalog store failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    /// A uniqueness rule was broken (duplicate feature or plan name).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A referenced row does not exist or belongs to another service.
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("validation failed: {0}")]
    Validation(String),

    /// Driver, connection or schema failure.
    #[error("backend error: {0}")]
    Backend(String),
}

impl From<DomainError> for StoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::NotFound => Self::NotFound,
            DomainError::Conflict(msg) => Self::Conflict(msg),
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => Self::Validation(msg),
        }
    }
}

/// Read/write access to the `services → plans → features` catalog.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Create tables and indexes when missing. Safe to call on every start.
    async fn init_schema(&self) -> Result<(), StoreError>;

    /// All services, newest first, each with its features and plans.
    async fn list_services(&self) -> Result<Vec<ServiceDetail>, StoreError>;

    async fn get_service(&self, id: ServiceId) -> Result<ServiceDetail, StoreError>;

    /// Insert a service with its features, plans and plan-feature links.
    async fn create_service(&self, req: NewService) -> Result<CreatedService, StoreError>;

    /// Update a service's fields and rename/add features.
    ///
    /// A feature change carrying an id that belongs to another service is
    /// ignored.
    async fn update_service(&self, req: UpdateService) -> Result<Service, StoreError>;

    /// Delete a service and everything that belongs to it.
    async fn delete_service(&self, id: ServiceId) -> Result<(), StoreError>;

    /// Plans of a service, cheapest first. Empty when the service has none
    /// (or does not exist).
    async fn list_plans(&self, service_id: ServiceId) -> Result<Vec<PlanWithFeatures>, StoreError>;

    /// Add a plan to an existing service, linking features of that service.
    async fn create_plan(&self, service_id: ServiceId, req: NewPlan) -> Result<CreatedPlan, StoreError>;
}

/// Message used when a feature id does not belong to the target service.
pub(crate) fn foreign_feature_message(feature_id: impl core::fmt::Display) -> String {
    format!("Feature with ID {feature_id} not found or doesn't belong to this service")
}

pub(crate) fn duplicate_feature_message(name: &str) -> String {
    format!("Feature '{name}' already exists for this service")
}

pub(crate) const DUPLICATE_PLAN_MESSAGE: &str = "A plan with this name already exists for this service";

/// Join rows into per-service views.
///
/// `features` and `plans` keep the order they are given in; `links` are
/// `(plan, feature name)` pairs in link order.
pub(crate) fn assemble_details(
    services: Vec<Service>,
    features: Vec<Feature>,
    plans: Vec<Plan>,
    links: Vec<(PlanId, String)>,
) -> Vec<ServiceDetail> {
    let mut names_by_plan: HashMap<PlanId, Vec<String>> = HashMap::new();
    for (plan_id, name) in links {
        names_by_plan.entry(plan_id).or_default().push(name);
    }

    let mut features_by_service: HashMap<ServiceId, Vec<Feature>> = HashMap::new();
    for feature in features {
        features_by_service
            .entry(feature.service_id)
            .or_default()
            .push(feature);
    }

    let mut plans_by_service: HashMap<ServiceId, Vec<PlanWithFeatures>> = HashMap::new();
    for plan in plans {
        let feature_names = names_by_plan.remove(&plan.id).unwrap_or_default();
        plans_by_service
            .entry(plan.service_id)
            .or_default()
            .push(PlanWithFeatures { plan, feature_names });
    }

    services
        .into_iter()
        .map(|service| ServiceDetail {
            features: features_by_service.remove(&service.id).unwrap_or_default(),
            plans: plans_by_service.remove(&service.id).unwrap_or_default(),
            service,
        })
        .collect()
}

/// Attach feature names to plans (in the plans' order).
pub(crate) fn attach_feature_names(
    plans: Vec<Plan>,
    links: Vec<(PlanId, String)>,
) -> Vec<PlanWithFeatures> {
    let mut names_by_plan: HashMap<PlanId, Vec<String>> = HashMap::new();
    for (plan_id, name) in links {
        names_by_plan.entry(plan_id).or_default().push(name);
    }
    plans
        .into_iter()
        .map(|plan| PlanWithFeatures {
            feature_names: names_by_plan.remove(&plan.id).unwrap_or_default(),
            plan,
        })
        .collect()
}

/// Map a sqlx error to a [`StoreError`].
///
/// | sqlx error | StoreError |
/// |------------|------------|
/// | unique violation | `Conflict` |
/// | foreign key violation | `InvalidReference` |
/// | `RowNotFound` | `NotFound` |
/// | anything else | `Backend` |
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            if db_err.is_unique_violation() {
                StoreError::Conflict(msg)
            } else if db_err.is_foreign_key_violation() {
                StoreError::InvalidReference(msg)
            } else {
                StoreError::Backend(msg)
            }
        }
        sqlx::Error::RowNotFound => StoreError::NotFound,
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Like [`map_sqlx_error`], but reports unique violations with `conflict_msg`.
pub(crate) fn map_unique_violation(
    operation: &str,
    err: sqlx::Error,
    conflict_msg: impl FnOnce() -> String,
) -> StoreError {
    if is_unique_violation(&err) {
        StoreError::Conflict(conflict_msg())
    } else {
        map_sqlx_error(operation, err)
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

pub(crate) fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kpcyber_core::FeatureId;

    fn service(id: i64) -> Service {
        let now = Utc::now();
        Service {
            id: ServiceId::new(id),
            name: format!("service {id}"),
            description: "d".to_string(),
            price: 1.0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn assemble_groups_children_under_their_service() {
        let now = Utc::now();
        let features = vec![Feature {
            id: FeatureId::new(10),
            service_id: ServiceId::new(2),
            name: "SEO".to_string(),
            created_at: now,
            updated_at: now,
        }];
        let plans = vec![Plan {
            id: PlanId::new(5),
            service_id: ServiceId::new(2),
            name: "Starter".to_string(),
            description: "d".to_string(),
            price: 3.0,
            created_at: now,
            updated_at: now,
        }];
        let links = vec![(PlanId::new(5), "SEO".to_string())];

        let details = assemble_details(vec![service(2), service(1)], features, plans, links);

        assert_eq!(details.len(), 2);
        assert_eq!(details[0].service.id, ServiceId::new(2));
        assert_eq!(details[0].features.len(), 1);
        assert_eq!(details[0].plans[0].feature_names, vec!["SEO".to_string()]);
        assert!(details[1].features.is_empty());
        assert!(details[1].plans.is_empty());
    }

    #[test]
    fn domain_errors_map_to_store_errors() {
        assert_eq!(StoreError::from(DomainError::NotFound), StoreError::NotFound);
        assert_eq!(
            StoreError::from(DomainError::conflict("dup")),
            StoreError::Conflict("dup".to_string())
        );
        assert_eq!(
            StoreError::from(DomainError::invalid_id("bad")),
            StoreError::Validation("bad".to_string())
        );
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        assert_eq!(map_sqlx_error("get", sqlx::Error::RowNotFound), StoreError::NotFound);
        assert!(matches!(
            map_sqlx_error("get", sqlx::Error::PoolClosed),
            StoreError::Backend(_)
        ));
    }
}
