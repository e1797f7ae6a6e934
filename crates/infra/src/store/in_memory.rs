use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use kpcyber_catalog::{
    CreatedPlan, CreatedService, Feature, NewPlan, NewService, Plan, PlanWithFeatures, Service,
    ServiceDetail, UpdateService,
};
use kpcyber_core::{FeatureId, PlanId, ServiceId};

use super::{
    assemble_details, attach_feature_names, duplicate_feature_message, foreign_feature_message,
    CatalogStore, StoreError, DUPLICATE_PLAN_MESSAGE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PlanFeatureLink {
    plan_id: PlanId,
    feature_id: FeatureId,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    services: BTreeMap<ServiceId, Service>,
    features: BTreeMap<FeatureId, Feature>,
    plans: BTreeMap<PlanId, Plan>,
    links: BTreeMap<i64, PlanFeatureLink>,
    last_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn feature_name_taken(&self, service_id: ServiceId, name: &str, except: Option<FeatureId>) -> bool {
        self.features
            .values()
            .any(|f| f.service_id == service_id && f.name == name && Some(f.id) != except)
    }

    fn plan_name_taken(&self, service_id: ServiceId, name: &str) -> bool {
        self.plans
            .values()
            .any(|p| p.service_id == service_id && p.name == name)
    }

    fn link_names(&self, plan_ids: &[PlanId]) -> Vec<(PlanId, String)> {
        self.links
            .values()
            .filter(|l| plan_ids.contains(&l.plan_id))
            .filter_map(|l| {
                self.features
                    .get(&l.feature_id)
                    .map(|f| (l.plan_id, f.name.clone()))
            })
            .collect()
    }

    fn detail(&self, service: &Service) -> ServiceDetail {
        let features = self
            .features
            .values()
            .filter(|f| f.service_id == service.id)
            .cloned()
            .collect();
        let plans: Vec<Plan> = self
            .plans
            .values()
            .filter(|p| p.service_id == service.id)
            .cloned()
            .collect();
        let plan_ids: Vec<PlanId> = plans.iter().map(|p| p.id).collect();
        let links = self.link_names(&plan_ids);

        assemble_details(vec![service.clone()], features, plans, links)
            .pop()
            .unwrap_or_else(|| ServiceDetail {
                service: service.clone(),
                features: vec![],
                plans: vec![],
            })
    }

    /// Remove a service and every row that hangs off it.
    fn cascade_delete(&mut self, id: ServiceId) {
        self.services.remove(&id);
        self.features.retain(|_, f| f.service_id != id);
        self.plans.retain(|_, p| p.service_id != id);
        let features = &self.features;
        let plans = &self.plans;
        self.links
            .retain(|_, l| plans.contains_key(&l.plan_id) && features.contains_key(&l.feature_id));
    }
}

/// In-memory catalog store.
///
/// Intended for tests/dev. Each write runs against a copy of the tables and
/// swaps it in only on success, so a failed write leaves no trace.
#[derive(Debug, Default)]
pub struct InMemoryCatalogStore {
    tables: RwLock<Tables>,
}

impl InMemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let tables = self
            .tables
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;
        f(&tables)
    }

    fn write<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let mut tables = self
            .tables
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;
        let mut tx = tables.clone();
        let out = f(&mut tx)?;
        *tables = tx;
        Ok(out)
    }
}

#[async_trait]
impl CatalogStore for InMemoryCatalogStore {
    async fn init_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn list_services(&self) -> Result<Vec<ServiceDetail>, StoreError> {
        self.read(|t| {
            let mut services: Vec<&Service> = t.services.values().collect();
            services.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
            Ok(services.into_iter().map(|s| t.detail(s)).collect())
        })
    }

    async fn get_service(&self, id: ServiceId) -> Result<ServiceDetail, StoreError> {
        self.read(|t| {
            t.services
                .get(&id)
                .map(|s| t.detail(s))
                .ok_or(StoreError::NotFound)
        })
    }

    async fn create_service(&self, req: NewService) -> Result<CreatedService, StoreError> {
        req.validate()?;

        self.write(|t| {
            let now = Utc::now();
            let service_id = ServiceId::new(t.next_id());
            let service = Service {
                id: service_id,
                name: req.name.clone(),
                description: req.description.clone(),
                price: req.price,
                created_at: now,
                updated_at: now,
            };
            t.services.insert(service_id, service.clone());

            let mut feature_ids = Vec::with_capacity(req.features.len());
            for feature in &req.features {
                if t.feature_name_taken(service_id, &feature.name, None) {
                    return Err(StoreError::Conflict(duplicate_feature_message(&feature.name)));
                }
                let id = FeatureId::new(t.next_id());
                t.features.insert(
                    id,
                    Feature {
                        id,
                        service_id,
                        name: feature.name.clone(),
                        created_at: now,
                        updated_at: now,
                    },
                );
                feature_ids.push(id);
            }

            let mut plan_ids = Vec::with_capacity(req.plans.len());
            for plan in &req.plans {
                if t.plan_name_taken(service_id, &plan.name) {
                    return Err(StoreError::Conflict(format!(
                        "Plan '{}' already exists for this service",
                        plan.name
                    )));
                }
                let plan_id = PlanId::new(t.next_id());
                t.plans.insert(
                    plan_id,
                    Plan {
                        id: plan_id,
                        service_id,
                        name: plan.name.clone(),
                        description: plan.description.clone(),
                        price: plan.price,
                        created_at: now,
                        updated_at: now,
                    },
                );
                for idx in plan.resolved_feature_indices(feature_ids.len()) {
                    let link_id = t.next_id();
                    t.links.insert(
                        link_id,
                        PlanFeatureLink {
                            plan_id,
                            feature_id: feature_ids[idx],
                        },
                    );
                }
                plan_ids.push(plan_id);
            }

            Ok(CreatedService {
                service,
                feature_ids,
                plan_ids,
            })
        })
    }

    async fn update_service(&self, req: UpdateService) -> Result<Service, StoreError> {
        req.validate()?;

        self.write(|t| {
            let now = Utc::now();
            let service = t.services.get_mut(&req.id).ok_or(StoreError::NotFound)?;
            service.name = req.name.clone();
            service.description = req.description.clone();
            service.price = req.price;
            service.updated_at = now;
            let updated = service.clone();

            for change in &req.features {
                match change.id {
                    Some(feature_id) => {
                        let owned = t
                            .features
                            .get(&feature_id)
                            .is_some_and(|f| f.service_id == req.id);
                        if !owned {
                            continue;
                        }
                        if t.feature_name_taken(req.id, &change.name, Some(feature_id)) {
                            return Err(StoreError::Conflict(duplicate_feature_message(&change.name)));
                        }
                        if let Some(feature) = t.features.get_mut(&feature_id) {
                            feature.name = change.name.clone();
                            feature.updated_at = now;
                        }
                    }
                    None => {
                        if t.feature_name_taken(req.id, &change.name, None) {
                            return Err(StoreError::Conflict(duplicate_feature_message(&change.name)));
                        }
                        let id = FeatureId::new(t.next_id());
                        t.features.insert(
                            id,
                            Feature {
                                id,
                                service_id: req.id,
                                name: change.name.clone(),
                                created_at: now,
                                updated_at: now,
                            },
                        );
                    }
                }
            }

            Ok(updated)
        })
    }

    async fn delete_service(&self, id: ServiceId) -> Result<(), StoreError> {
        self.write(|t| {
            if !t.services.contains_key(&id) {
                return Err(StoreError::NotFound);
            }
            t.cascade_delete(id);
            Ok(())
        })
    }

    async fn list_plans(&self, service_id: ServiceId) -> Result<Vec<PlanWithFeatures>, StoreError> {
        self.read(|t| {
            let mut plans: Vec<Plan> = t
                .plans
                .values()
                .filter(|p| p.service_id == service_id)
                .cloned()
                .collect();
            plans.sort_by(|a, b| a.price.total_cmp(&b.price).then(a.id.cmp(&b.id)));
            let plan_ids: Vec<PlanId> = plans.iter().map(|p| p.id).collect();
            let links = t.link_names(&plan_ids);
            Ok(attach_feature_names(plans, links))
        })
    }

    async fn create_plan(&self, service_id: ServiceId, req: NewPlan) -> Result<CreatedPlan, StoreError> {
        req.validate()?;

        self.write(|t| {
            if !t.services.contains_key(&service_id) {
                return Err(StoreError::NotFound);
            }
            if t.plan_name_taken(service_id, &req.name) {
                return Err(StoreError::Conflict(DUPLICATE_PLAN_MESSAGE.to_string()));
            }

            let now = Utc::now();
            let plan_id = PlanId::new(t.next_id());
            let plan = Plan {
                id: plan_id,
                service_id,
                name: req.name.clone(),
                description: req.description.clone(),
                price: req.price,
                created_at: now,
                updated_at: now,
            };
            t.plans.insert(plan_id, plan.clone());

            let feature_ids = req.distinct_feature_ids();
            for &feature_id in &feature_ids {
                let owned = t
                    .features
                    .get(&feature_id)
                    .is_some_and(|f| f.service_id == service_id);
                if !owned {
                    return Err(StoreError::InvalidReference(foreign_feature_message(feature_id)));
                }
                let link_id = t.next_id();
                t.links.insert(link_id, PlanFeatureLink { plan_id, feature_id });
            }

            Ok(CreatedPlan { plan, feature_ids })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kpcyber_catalog::{FeatureChange, NewFeature, NewServicePlan};

    fn web_service() -> NewService {
        NewService {
            name: "Web Development".to_string(),
            description: "Sites and web apps".to_string(),
            price: 50_000.0,
            features: vec![
                NewFeature { name: "Responsive design".to_string() },
                NewFeature { name: "Basic SEO".to_string() },
                NewFeature { name: "CMS integration".to_string() },
            ],
            plans: vec![
                NewServicePlan {
                    name: "Professional".to_string(),
                    description: "Growing businesses".to_string(),
                    price: 120_000.0,
                    features: vec![0, 1, 2],
                },
                NewServicePlan {
                    name: "Starter".to_string(),
                    description: "Small businesses".to_string(),
                    price: 50_000.0,
                    features: vec![0, 7],
                },
            ],
        }
    }

    fn plan(name: &str, price: f64, feature_ids: Vec<FeatureId>) -> NewPlan {
        NewPlan {
            name: name.to_string(),
            description: format!("{name} tier"),
            price,
            feature_ids,
        }
    }

    #[tokio::test]
    async fn create_then_get_returns_full_detail() {
        let store = InMemoryCatalogStore::new();
        let created = store.create_service(web_service()).await.unwrap();
        assert_eq!(created.feature_ids.len(), 3);
        assert_eq!(created.plan_ids.len(), 2);

        let detail = store.get_service(created.service.id).await.unwrap();
        assert_eq!(detail.service.name, "Web Development");
        assert_eq!(detail.features.len(), 3);
        assert_eq!(detail.plans[0].feature_names.len(), 3);
        // index 7 is out of range and skipped
        assert_eq!(detail.plans[1].feature_names, vec!["Responsive design".to_string()]);
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let store = InMemoryCatalogStore::new();
        let first = store.create_service(web_service()).await.unwrap();
        let mut second_req = web_service();
        second_req.name = "Mobile Development".to_string();
        let second = store.create_service(second_req).await.unwrap();

        let all = store.list_services().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id(), second.service.id);
        assert_eq!(all[1].id(), first.service.id);
    }

    #[tokio::test]
    async fn duplicate_feature_in_request_writes_nothing() {
        let store = InMemoryCatalogStore::new();
        let mut req = web_service();
        req.features.push(NewFeature { name: "Basic SEO".to_string() });

        let err = store.create_service(req).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert!(store.list_services().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_renames_owned_features_and_adds_new_ones() {
        let store = InMemoryCatalogStore::new();
        let web = store.create_service(web_service()).await.unwrap();
        let other = store.create_service(NewService {
            name: "Marketing".to_string(),
            plans: vec![],
            ..web_service()
        })
        .await
        .unwrap();

        let updated = store
            .update_service(UpdateService {
                id: web.service.id,
                name: "Web Dev".to_string(),
                description: "Sites".to_string(),
                price: 60_000.0,
                features: vec![
                    FeatureChange { id: Some(web.feature_ids[1]), name: "Advanced SEO".to_string() },
                    // belongs to another service: ignored
                    FeatureChange { id: Some(other.feature_ids[0]), name: "Hijacked".to_string() },
                    FeatureChange { id: None, name: "Hosting".to_string() },
                ],
            })
            .await
            .unwrap();
        assert_eq!(updated.name, "Web Dev");
        assert!(updated.updated_at >= updated.created_at);

        let detail = store.get_service(web.service.id).await.unwrap();
        let names: Vec<&str> = detail.features.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["Responsive design", "Advanced SEO", "CMS integration", "Hosting"]);

        let other_detail = store.get_service(other.service.id).await.unwrap();
        assert_eq!(other_detail.features[0].name, "Responsive design");
    }

    #[tokio::test]
    async fn update_missing_service_is_not_found() {
        let store = InMemoryCatalogStore::new();
        let err = store
            .update_service(UpdateService {
                id: ServiceId::new(99),
                name: "x".to_string(),
                description: "y".to_string(),
                price: 1.0,
                features: vec![],
            })
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound);
    }

    #[tokio::test]
    async fn update_with_existing_feature_name_conflicts() {
        let store = InMemoryCatalogStore::new();
        let web = store.create_service(web_service()).await.unwrap();
        let err = store
            .update_service(UpdateService {
                id: web.service.id,
                name: "Changed".to_string(),
                description: "Sites".to_string(),
                price: 1.0,
                features: vec![FeatureChange { id: None, name: "Basic SEO".to_string() }],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // rolled back: the service name is unchanged
        let detail = store.get_service(web.service.id).await.unwrap();
        assert_eq!(detail.service.name, "Web Development");
    }

    #[tokio::test]
    async fn delete_cascades_to_children() {
        let store = InMemoryCatalogStore::new();
        let web = store.create_service(web_service()).await.unwrap();
        store.delete_service(web.service.id).await.unwrap();

        assert_eq!(store.get_service(web.service.id).await.unwrap_err(), StoreError::NotFound);
        assert!(store.list_plans(web.service.id).await.unwrap().is_empty());
        let tables = store.tables.read().unwrap();
        assert!(tables.features.is_empty());
        assert!(tables.plans.is_empty());
        assert!(tables.links.is_empty());
    }

    #[tokio::test]
    async fn delete_missing_service_is_not_found() {
        let store = InMemoryCatalogStore::new();
        assert_eq!(store.delete_service(ServiceId::new(1)).await.unwrap_err(), StoreError::NotFound);
    }

    #[tokio::test]
    async fn plans_are_listed_cheapest_first() {
        let store = InMemoryCatalogStore::new();
        let web = store.create_service(web_service()).await.unwrap();
        let plans = store.list_plans(web.service.id).await.unwrap();
        let names: Vec<&str> = plans.iter().map(|p| p.plan.name.as_str()).collect();
        assert_eq!(names, vec!["Starter", "Professional"]);
    }

    #[tokio::test]
    async fn create_plan_links_features_of_the_same_service() {
        let store = InMemoryCatalogStore::new();
        let web = store.create_service(web_service()).await.unwrap();

        let created = store
            .create_plan(
                web.service.id,
                plan("Enterprise", 300_000.0, vec![web.feature_ids[2], web.feature_ids[0]]),
            )
            .await
            .unwrap();
        assert_eq!(created.plan.service_id, web.service.id);
        assert_eq!(created.feature_ids, vec![web.feature_ids[2], web.feature_ids[0]]);

        let plans = store.list_plans(web.service.id).await.unwrap();
        assert_eq!(plans.last().unwrap().plan.name, "Enterprise");
        assert_eq!(plans.last().unwrap().feature_names.len(), 2);
    }

    #[tokio::test]
    async fn create_plan_rejects_foreign_feature_and_rolls_back() {
        let store = InMemoryCatalogStore::new();
        let web = store.create_service(web_service()).await.unwrap();
        let other = store.create_service(NewService {
            name: "Marketing".to_string(),
            plans: vec![],
            ..web_service()
        })
        .await
        .unwrap();

        let err = store
            .create_plan(web.service.id, plan("Mixed", 1.0, vec![other.feature_ids[0]]))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::InvalidReference(foreign_feature_message(other.feature_ids[0]))
        );
        assert_eq!(store.list_plans(web.service.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn create_plan_errors() {
        let store = InMemoryCatalogStore::new();
        let err = store
            .create_plan(ServiceId::new(42), plan("Solo", 1.0, vec![]))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound);

        let web = store.create_service(web_service()).await.unwrap();
        let err = store
            .create_plan(web.service.id, plan("Starter", 1.0, vec![]))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Conflict(DUPLICATE_PLAN_MESSAGE.to_string()));
    }
}
