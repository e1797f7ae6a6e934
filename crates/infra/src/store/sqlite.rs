//! SQLite-backed catalog store.
//!
//! Single-file database (`database.sqlite` by default). Foreign keys are
//! switched on for every pooled connection so `ON DELETE CASCADE` does the
//! cleanup when a service is removed.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use kpcyber_catalog::{
    CreatedPlan, CreatedService, Feature, NewPlan, NewService, Plan, PlanWithFeatures, Service,
    ServiceDetail, UpdateService,
};
use kpcyber_core::{FeatureId, PlanId, ServiceId};

use super::{
    assemble_details, attach_feature_names, duplicate_feature_message, foreign_feature_message,
    is_foreign_key_violation, map_sqlx_error, map_unique_violation, CatalogStore, StoreError,
    DUPLICATE_PLAN_MESSAGE,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS services (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    price REAL NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS features (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    service_id INTEGER NOT NULL,
    feature_name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (service_id) REFERENCES services(id) ON DELETE CASCADE,
    UNIQUE(service_id, feature_name)
);

CREATE TABLE IF NOT EXISTS service_plans (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    service_id INTEGER NOT NULL,
    plan_name TEXT NOT NULL,
    plan_description TEXT NOT NULL,
    plan_price REAL NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (service_id) REFERENCES services(id) ON DELETE CASCADE,
    UNIQUE(service_id, plan_name)
);

CREATE TABLE IF NOT EXISTS service_plan_features (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    service_plan_id INTEGER NOT NULL,
    feature_id INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (service_plan_id) REFERENCES service_plans(id) ON DELETE CASCADE,
    FOREIGN KEY (feature_id) REFERENCES features(id) ON DELETE CASCADE,
    UNIQUE(service_plan_id, feature_id)
);

CREATE INDEX IF NOT EXISTS idx_features_service_id ON features(service_id);
CREATE INDEX IF NOT EXISTS idx_service_plans_service_id ON service_plans(service_id);
CREATE INDEX IF NOT EXISTS idx_service_plan_features_plan_id ON service_plan_features(service_plan_id);
CREATE INDEX IF NOT EXISTS idx_service_plan_features_feature_id ON service_plan_features(feature_id);
"#;

/// SQLite-backed catalog store.
#[derive(Debug, Clone)]
pub struct SqliteCatalogStore {
    pool: SqlitePool,
}

impl SqliteCatalogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database file at `path`.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Private in-memory database (one connection, so every query sees the same data).
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| map_sqlx_error("connect", e))?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    async fn load_links(&self, service_id: Option<ServiceId>) -> Result<Vec<(PlanId, String)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT spf.service_plan_id, f.feature_name
            FROM service_plan_features spf
            JOIN features f ON f.id = spf.feature_id
            WHERE ?1 IS NULL OR f.service_id = ?1
            ORDER BY spf.id ASC
            "#,
        )
        .bind(service_id.map(|id| id.get()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_plan_features", e))?;

        rows.iter()
            .map(|r| -> Result<(PlanId, String), StoreError> {
                Ok((
                    PlanId::new(r.try_get("service_plan_id").map_err(|e| map_sqlx_error("decode_link", e))?),
                    r.try_get("feature_name").map_err(|e| map_sqlx_error("decode_link", e))?,
                ))
            })
            .collect()
    }
}

fn service_from_row(row: &SqliteRow) -> Result<Service, sqlx::Error> {
    Ok(Service {
        id: ServiceId::new(row.try_get("id")?),
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        price: row.try_get("price")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn feature_from_row(row: &SqliteRow) -> Result<Feature, sqlx::Error> {
    Ok(Feature {
        id: FeatureId::new(row.try_get("id")?),
        service_id: ServiceId::new(row.try_get("service_id")?),
        name: row.try_get("feature_name")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn plan_from_row(row: &SqliteRow) -> Result<Plan, sqlx::Error> {
    Ok(Plan {
        id: PlanId::new(row.try_get("id")?),
        service_id: ServiceId::new(row.try_get("service_id")?),
        name: row.try_get("plan_name")?,
        description: row.try_get("plan_description")?,
        price: row.try_get("plan_price")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn decode_all<T>(
    operation: &str,
    rows: &[SqliteRow],
    f: fn(&SqliteRow) -> Result<T, sqlx::Error>,
) -> Result<Vec<T>, StoreError> {
    rows.iter()
        .map(|r| f(r).map_err(|e| map_sqlx_error(operation, e)))
        .collect()
}

#[async_trait]
impl CatalogStore for SqliteCatalogStore {
    #[instrument(skip(self), err)]
    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("init_schema", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list_services(&self) -> Result<Vec<ServiceDetail>, StoreError> {
        let services = sqlx::query("SELECT * FROM services ORDER BY created_at DESC, id DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_services", e))?;
        let features = sqlx::query("SELECT * FROM features ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_features", e))?;
        let plans = sqlx::query("SELECT * FROM service_plans ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_plans", e))?;
        let links = self.load_links(None).await?;

        Ok(assemble_details(
            decode_all("decode_service", &services, service_from_row)?,
            decode_all("decode_feature", &features, feature_from_row)?,
            decode_all("decode_plan", &plans, plan_from_row)?,
            links,
        ))
    }

    #[instrument(skip(self), fields(service_id = %id), err)]
    async fn get_service(&self, id: ServiceId) -> Result<ServiceDetail, StoreError> {
        let service = sqlx::query("SELECT * FROM services WHERE id = ?")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_service", e))?
            .ok_or(StoreError::NotFound)?;
        let features = sqlx::query("SELECT * FROM features WHERE service_id = ? ORDER BY id ASC")
            .bind(id.get())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_features", e))?;
        let plans = sqlx::query("SELECT * FROM service_plans WHERE service_id = ? ORDER BY id ASC")
            .bind(id.get())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_plans", e))?;
        let links = self.load_links(Some(id)).await?;

        let service = service_from_row(&service).map_err(|e| map_sqlx_error("decode_service", e))?;
        assemble_details(
            vec![service],
            decode_all("decode_feature", &features, feature_from_row)?,
            decode_all("decode_plan", &plans, plan_from_row)?,
            links,
        )
        .pop()
        .ok_or(StoreError::NotFound)
    }

    #[instrument(skip(self, req), fields(name = %req.name), err)]
    async fn create_service(&self, req: NewService) -> Result<CreatedService, StoreError> {
        req.validate()?;

        let now = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(
            r#"
            INSERT INTO services (name, description, price, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&req.name)
        .bind(&req.description)
        .bind(req.price)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_service", e))?;
        let service = service_from_row(&row).map_err(|e| map_sqlx_error("decode_service", e))?;

        let mut feature_ids = Vec::with_capacity(req.features.len());
        for feature in &req.features {
            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO features (service_id, feature_name, created_at, updated_at)
                VALUES (?, ?, ?, ?)
                RETURNING id
                "#,
            )
            .bind(service.id.get())
            .bind(&feature.name)
            .bind(now)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                map_unique_violation("insert_feature", e, || duplicate_feature_message(&feature.name))
            })?;
            feature_ids.push(FeatureId::new(id));
        }

        let mut plan_ids = Vec::with_capacity(req.plans.len());
        for plan in &req.plans {
            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO service_plans
                    (service_id, plan_name, plan_description, plan_price, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                RETURNING id
                "#,
            )
            .bind(service.id.get())
            .bind(&plan.name)
            .bind(&plan.description)
            .bind(plan.price)
            .bind(now)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                map_unique_violation("insert_plan", e, || {
                    format!("Plan '{}' already exists for this service", plan.name)
                })
            })?;

            for idx in plan.resolved_feature_indices(feature_ids.len()) {
                sqlx::query(
                    "INSERT INTO service_plan_features (service_plan_id, feature_id, created_at) VALUES (?, ?, ?)",
                )
                .bind(id)
                .bind(feature_ids[idx].get())
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("insert_plan_feature", e))?;
            }
            plan_ids.push(PlanId::new(id));
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(CreatedService {
            service,
            feature_ids,
            plan_ids,
        })
    }

    #[instrument(skip(self, req), fields(service_id = %req.id), err)]
    async fn update_service(&self, req: UpdateService) -> Result<Service, StoreError> {
        req.validate()?;

        let now = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(
            r#"
            UPDATE services
            SET name = ?, description = ?, price = ?, updated_at = ?
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(&req.name)
        .bind(&req.description)
        .bind(req.price)
        .bind(now)
        .bind(req.id.get())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_service", e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::NotFound);
        };
        let service = service_from_row(&row).map_err(|e| map_sqlx_error("decode_service", e))?;

        for change in &req.features {
            let result = match change.id {
                Some(feature_id) => {
                    sqlx::query(
                        r#"
                        UPDATE features
                        SET feature_name = ?, updated_at = ?
                        WHERE id = ? AND service_id = ?
                        "#,
                    )
                    .bind(&change.name)
                    .bind(now)
                    .bind(feature_id.get())
                    .bind(req.id.get())
                    .execute(&mut *tx)
                    .await
                }
                None => {
                    sqlx::query(
                        r#"
                        INSERT INTO features (service_id, feature_name, created_at, updated_at)
                        VALUES (?, ?, ?, ?)
                        "#,
                    )
                    .bind(req.id.get())
                    .bind(&change.name)
                    .bind(now)
                    .bind(now)
                    .execute(&mut *tx)
                    .await
                }
            };
            // Early return drops `tx`, which rolls it back.
            result.map_err(|e| {
                map_unique_violation("upsert_feature", e, || duplicate_feature_message(&change.name))
            })?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(service)
    }

    #[instrument(skip(self), fields(service_id = %id), err)]
    async fn delete_service(&self, id: ServiceId) -> Result<(), StoreError> {
        // Single statement; children go through ON DELETE CASCADE.
        let result = sqlx::query("DELETE FROM services WHERE id = ?")
            .bind(id.get())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_service", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(service_id = %service_id), err)]
    async fn list_plans(&self, service_id: ServiceId) -> Result<Vec<PlanWithFeatures>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM service_plans WHERE service_id = ? ORDER BY plan_price ASC, id ASC",
        )
        .bind(service_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_plans", e))?;
        let plans = decode_all("decode_plan", &rows, plan_from_row)?;
        let links = self.load_links(Some(service_id)).await?;
        Ok(attach_feature_names(plans, links))
    }

    #[instrument(skip(self, req), fields(service_id = %service_id, name = %req.name), err)]
    async fn create_plan(&self, service_id: ServiceId, req: NewPlan) -> Result<CreatedPlan, StoreError> {
        req.validate()?;

        let now = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // The INSERT comes first so the transaction takes the write lock
        // before it reads; a missing service surfaces as a foreign key error.
        let row = sqlx::query(
            r#"
            INSERT INTO service_plans
                (service_id, plan_name, plan_description, plan_price, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(service_id.get())
        .bind(&req.name)
        .bind(&req.description)
        .bind(req.price)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                StoreError::NotFound
            } else {
                map_unique_violation("insert_plan", e, || DUPLICATE_PLAN_MESSAGE.to_string())
            }
        })?;
        let plan = plan_from_row(&row).map_err(|e| map_sqlx_error("decode_plan", e))?;

        let feature_ids = req.distinct_feature_ids();
        for &feature_id in &feature_ids {
            let owned = sqlx::query("SELECT 1 FROM features WHERE id = ? AND service_id = ?")
                .bind(feature_id.get())
                .bind(service_id.get())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("check_feature", e))?;
            if owned.is_none() {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(StoreError::InvalidReference(foreign_feature_message(feature_id)));
            }

            sqlx::query(
                "INSERT INTO service_plan_features (service_plan_id, feature_id, created_at) VALUES (?, ?, ?)",
            )
            .bind(plan.id.get())
            .bind(feature_id.get())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_plan_feature", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(CreatedPlan { plan, feature_ids })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kpcyber_catalog::{FeatureChange, NewFeature, NewServicePlan};

    async fn store() -> SqliteCatalogStore {
        let store = SqliteCatalogStore::in_memory().await.unwrap();
        store.init_schema().await.unwrap();
        store
    }

    fn seo_service(name: &str) -> NewService {
        NewService {
            name: name.to_string(),
            description: "Search engine optimisation".to_string(),
            price: 30_000.0,
            features: vec![
                NewFeature { name: "Keyword research".to_string() },
                NewFeature { name: "Monthly report".to_string() },
            ],
            plans: vec![
                NewServicePlan {
                    name: "Growth".to_string(),
                    description: "Ongoing".to_string(),
                    price: 60_000.0,
                    features: vec![0, 1],
                },
                NewServicePlan {
                    name: "Audit".to_string(),
                    description: "One-off".to_string(),
                    price: 30_000.0,
                    features: vec![0],
                },
            ],
        }
    }

    #[tokio::test]
    async fn schema_init_is_idempotent() {
        let store = store().await;
        store.init_schema().await.unwrap();
        assert!(store.list_services().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_and_read_back() {
        let store = store().await;
        let created = store.create_service(seo_service("SEO")).await.unwrap();

        let detail = store.get_service(created.service.id).await.unwrap();
        assert_eq!(detail.service.id, created.service.id);
        assert_eq!(detail.service.name, "SEO");
        assert_eq!(detail.features.len(), 2);
        assert_eq!(
            detail.plans[0].feature_names,
            vec!["Keyword research".to_string(), "Monthly report".to_string()]
        );

        let plans = store.list_plans(created.service.id).await.unwrap();
        assert_eq!(plans[0].plan.name, "Audit");
        assert_eq!(plans[1].plan.name, "Growth");
    }

    #[tokio::test]
    async fn missing_service_is_not_found() {
        let store = store().await;
        assert_eq!(store.get_service(ServiceId::new(1)).await.unwrap_err(), StoreError::NotFound);
        assert_eq!(store.delete_service(ServiceId::new(1)).await.unwrap_err(), StoreError::NotFound);
    }

    #[tokio::test]
    async fn delete_cascades_through_foreign_keys() {
        let store = store().await;
        let created = store.create_service(seo_service("SEO")).await.unwrap();
        store.delete_service(created.service.id).await.unwrap();

        let remaining: i64 = sqlx::query_scalar(
            "SELECT (SELECT COUNT(*) FROM features) + (SELECT COUNT(*) FROM service_plans) + (SELECT COUNT(*) FROM service_plan_features)",
        )
        .fetch_one(&store.pool)
        .await
        .unwrap();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn update_conflict_rolls_back() {
        let store = store().await;
        let created = store.create_service(seo_service("SEO")).await.unwrap();

        let err = store
            .update_service(UpdateService {
                id: created.service.id,
                name: "Renamed".to_string(),
                description: "d".to_string(),
                price: 1.0,
                features: vec![FeatureChange { id: None, name: "Monthly report".to_string() }],
            })
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Conflict(duplicate_feature_message("Monthly report")));

        let detail = store.get_service(created.service.id).await.unwrap();
        assert_eq!(detail.service.name, "SEO");
    }

    #[tokio::test]
    async fn create_plan_validates_feature_ownership() {
        let store = store().await;
        let seo = store.create_service(seo_service("SEO")).await.unwrap();
        let ads = store.create_service(seo_service("Ads")).await.unwrap();

        let err = store
            .create_plan(
                seo.service.id,
                NewPlan {
                    name: "Mixed".to_string(),
                    description: "d".to_string(),
                    price: 5.0,
                    feature_ids: vec![seo.feature_ids[0], ads.feature_ids[0]],
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::InvalidReference(foreign_feature_message(ads.feature_ids[0])));
        assert_eq!(store.list_plans(seo.service.id).await.unwrap().len(), 2);

        let err = store
            .create_plan(
                seo.service.id,
                NewPlan {
                    name: "Growth".to_string(),
                    description: "d".to_string(),
                    price: 5.0,
                    feature_ids: vec![],
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Conflict(DUPLICATE_PLAN_MESSAGE.to_string()));
    }

    #[tokio::test]
    async fn create_plan_on_missing_service_is_not_found() {
        let store = store().await;
        let err = store
            .create_plan(
                ServiceId::new(99),
                NewPlan {
                    name: "Solo".to_string(),
                    description: "d".to_string(),
                    price: 1.0,
                    feature_ids: vec![],
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_on_a_file_database_do_not_fail() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCatalogStore::connect(dir.path().join("catalog.sqlite"))
            .await
            .unwrap();
        store.init_schema().await.unwrap();
        let seo = store.create_service(seo_service("SEO")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..40 {
            let store = store.clone();
            let feature = seo.feature_ids[0];
            handles.push(tokio::spawn(async move {
                store
                    .create_plan(
                        seo.service.id,
                        NewPlan {
                            name: format!("Tier {i}"),
                            description: "d".to_string(),
                            price: i as f64,
                            feature_ids: vec![feature],
                        },
                    )
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.list_plans(seo.service.id).await.unwrap().len(), 42);

        let mut ids = Vec::new();
        for i in 0..40 {
            ids.push(store.create_service(seo_service(&format!("S{i}"))).await.unwrap().service.id);
        }
        let mut handles = Vec::new();
        for id in ids {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.delete_service(id).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.list_services().await.unwrap().len(), 1);
    }
}
