//! Catalog domain module: services, their features and their plans.
//!
//! This crate contains the catalog read shapes and the write requests with
//! their validation rules, implemented purely as deterministic domain logic
//! (no IO, no HTTP, no storage).

pub mod model;
pub mod request;

pub use model::{Feature, Plan, PlanWithFeatures, Service, ServiceDetail};
pub use request::{
    CreatedPlan, CreatedService, FeatureChange, NewFeature, NewPlan, NewService, NewServicePlan,
    UpdateService,
};
