//! Postgres-backed catalog store.
//!
//! ## Error Mapping
//!
//! | PostgreSQL error code | StoreError | Scenario |
//! |-----------------------|------------|----------|
//! | `23505` unique violation | `Conflict` | duplicate feature/plan name within a service |
//! | `23503` foreign key violation | `InvalidReference` | row points at a missing parent |
//! | anything else | `Backend` | connectivity, schema, etc. |
//!
//! ## Thread Safety
//!
//! `PostgresCatalogStore` is `Send + Sync`; the SQLx pool handles connection
//! sharing. Every write runs inside one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use kpcyber_catalog::{
    CreatedPlan, CreatedService, Feature, NewPlan, NewService, Plan, PlanWithFeatures, Service,
    ServiceDetail, UpdateService,
};
use kpcyber_core::{FeatureId, PlanId, ServiceId};

use super::{
    assemble_details, attach_feature_names, duplicate_feature_message, foreign_feature_message,
    map_sqlx_error, map_unique_violation, CatalogStore, StoreError, DUPLICATE_PLAN_MESSAGE,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS services (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    price DOUBLE PRECISION NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS features (
    id BIGSERIAL PRIMARY KEY,
    service_id BIGINT NOT NULL REFERENCES services(id) ON DELETE CASCADE,
    feature_name TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (service_id, feature_name)
);

CREATE TABLE IF NOT EXISTS service_plans (
    id BIGSERIAL PRIMARY KEY,
    service_id BIGINT NOT NULL REFERENCES services(id) ON DELETE CASCADE,
    plan_name TEXT NOT NULL,
    plan_description TEXT NOT NULL,
    plan_price DOUBLE PRECISION NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (service_id, plan_name)
);

CREATE TABLE IF NOT EXISTS service_plan_features (
    id BIGSERIAL PRIMARY KEY,
    service_plan_id BIGINT NOT NULL REFERENCES service_plans(id) ON DELETE CASCADE,
    feature_id BIGINT NOT NULL REFERENCES features(id) ON DELETE CASCADE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (service_plan_id, feature_id)
);

CREATE INDEX IF NOT EXISTS idx_features_service_id ON features(service_id);
CREATE INDEX IF NOT EXISTS idx_service_plans_service_id ON service_plans(service_id);
CREATE INDEX IF NOT EXISTS idx_service_plan_features_plan_id ON service_plan_features(service_plan_id);
CREATE INDEX IF NOT EXISTS idx_service_plan_features_feature_id ON service_plan_features(feature_id);
"#;

/// Postgres-backed catalog store.
#[derive(Debug, Clone)]
pub struct PostgresCatalogStore {
    pool: PgPool,
}

impl PostgresCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect using a `postgresql://` connection string.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
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
            WHERE ($1::BIGINT IS NULL OR f.service_id = $1)
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

fn service_from_row(row: &PgRow) -> Result<Service, sqlx::Error> {
    Ok(Service {
        id: ServiceId::new(row.try_get("id")?),
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        price: row.try_get("price")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn feature_from_row(row: &PgRow) -> Result<Feature, sqlx::Error> {
    Ok(Feature {
        id: FeatureId::new(row.try_get("id")?),
        service_id: ServiceId::new(row.try_get("service_id")?),
        name: row.try_get("feature_name")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn plan_from_row(row: &PgRow) -> Result<Plan, sqlx::Error> {
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
    rows: &[PgRow],
    f: fn(&PgRow) -> Result<T, sqlx::Error>,
) -> Result<Vec<T>, StoreError> {
    rows.iter()
        .map(|r| f(r).map_err(|e| map_sqlx_error(operation, e)))
        .collect()
}

/// Lock the service row for the rest of the transaction.
///
/// Returns `false` when the service does not exist.
async fn lock_service(tx: &mut Transaction<'_, Postgres>, id: ServiceId) -> Result<bool, StoreError> {
    let row = sqlx::query("SELECT 1 FROM services WHERE id = $1 FOR UPDATE")
        .bind(id.get())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_service", e))?;
    Ok(row.is_some())
}

#[async_trait]
impl CatalogStore for PostgresCatalogStore {
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
        let service = sqlx::query("SELECT * FROM services WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_service", e))?
            .ok_or(StoreError::NotFound)?;
        let features = sqlx::query("SELECT * FROM features WHERE service_id = $1 ORDER BY id ASC")
            .bind(id.get())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_features", e))?;
        let plans = sqlx::query("SELECT * FROM service_plans WHERE service_id = $1 ORDER BY id ASC")
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
            VALUES ($1, $2, $3, $4, $4)
            RETURNING *
            "#,
        )
        .bind(&req.name)
        .bind(&req.description)
        .bind(req.price)
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
                VALUES ($1, $2, $3, $3)
                RETURNING id
                "#,
            )
            .bind(service.id.get())
            .bind(&feature.name)
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
                VALUES ($1, $2, $3, $4, $5, $5)
                RETURNING id
                "#,
            )
            .bind(service.id.get())
            .bind(&plan.name)
            .bind(&plan.description)
            .bind(plan.price)
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
                    "INSERT INTO service_plan_features (service_plan_id, feature_id, created_at) VALUES ($1, $2, $3)",
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
            SET name = $1, description = $2, price = $3, updated_at = $4
            WHERE id = $5
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
                        SET feature_name = $1, updated_at = $2
                        WHERE id = $3 AND service_id = $4
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
                        VALUES ($1, $2, $3, $3)
                        "#,
                    )
                    .bind(req.id.get())
                    .bind(&change.name)
                    .bind(now)
                    .execute(&mut *tx)
                    .await
                }
            };
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
        let result = sqlx::query("DELETE FROM services WHERE id = $1")
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
            "SELECT * FROM service_plans WHERE service_id = $1 ORDER BY plan_price ASC, id ASC",
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

        if !lock_service(&mut tx, service_id).await? {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::NotFound);
        }

        let row = sqlx::query(
            r#"
            INSERT INTO service_plans
                (service_id, plan_name, plan_description, plan_price, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            RETURNING *
            "#,
        )
        .bind(service_id.get())
        .bind(&req.name)
        .bind(&req.description)
        .bind(req.price)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_unique_violation("insert_plan", e, || DUPLICATE_PLAN_MESSAGE.to_string()))?;
        let plan = plan_from_row(&row).map_err(|e| map_sqlx_error("decode_plan", e))?;

        let feature_ids = req.distinct_feature_ids();
        for &feature_id in &feature_ids {
            let owned = sqlx::query("SELECT 1 FROM features WHERE id = $1 AND service_id = $2")
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
                "INSERT INTO service_plan_features (service_plan_id, feature_id, created_at) VALUES ($1, $2, $3)",
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
    use kpcyber_catalog::{NewFeature, NewServicePlan};

    /// Connects to `POSTGRES_URL` when set; these tests are skipped otherwise.
    async fn store() -> Option<PostgresCatalogStore> {
        let url = std::env::var("POSTGRES_URL").ok()?;
        let store = PostgresCatalogStore::connect(&url).await.ok()?;
        store.init_schema().await.ok()?;
        Some(store)
    }

    #[tokio::test]
    async fn create_plan_and_cascade_delete() {
        let Some(store) = store().await else {
            return;
        };

        let created = store
            .create_service(NewService {
                name: format!("Branding {}", Utc::now().timestamp_nanos_opt().unwrap_or_default()),
                description: "Logos and identity".to_string(),
                price: 20_000.0,
                features: vec![NewFeature { name: "Logo".to_string() }],
                plans: vec![NewServicePlan {
                    name: "Basic".to_string(),
                    description: "One logo".to_string(),
                    price: 20_000.0,
                    features: vec![0],
                }],
            })
            .await
            .unwrap();

        let plan = store
            .create_plan(
                created.service.id,
                NewPlan {
                    name: "Full identity".to_string(),
                    description: "Logo + guide".to_string(),
                    price: 45_000.0,
                    feature_ids: vec![created.feature_ids[0]],
                },
            )
            .await
            .unwrap();
        assert_eq!(plan.feature_ids, created.feature_ids);

        let plans = store.list_plans(created.service.id).await.unwrap();
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].plan.name, "Basic");

        store.delete_service(created.service.id).await.unwrap();
        assert!(store.list_plans(created.service.id).await.unwrap().is_empty());
        assert_eq!(
            store.get_service(created.service.id).await.unwrap_err(),
            StoreError::NotFound
        );
    }
}
