//! Component health registry and the `/health` route.
//!
//! Components mark themselves ok on start; a fatal error (substrate loss)
//! marks them failed and `/health` answers 503 from then on.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use metrics::gauge;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ComponentStatus {
    Ok { since: DateTime<Utc> },
    Failed { since: DateTime<Utc>, reason: String },
}

#[derive(Debug, Clone, Default)]
pub struct Health {
    components: Arc<RwLock<BTreeMap<String, ComponentStatus>>>,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub components: BTreeMap<String, ComponentStatus>,
}

impl Health {
    pub fn new() -> Self {
        Self::default()
    }

    /// Failed components stay failed.
    pub fn mark_ok(&self, component: &str) {
        if let Ok(mut g) = self.components.write() {
            g.entry(component.to_string())
                .or_insert_with(|| ComponentStatus::Ok { since: Utc::now() });
        }
    }

    pub fn mark_failed(&self, component: &str, reason: impl Into<String>) {
        if let Ok(mut g) = self.components.write() {
            g.insert(
                component.to_string(),
                ComponentStatus::Failed {
                    since: Utc::now(),
                    reason: reason.into(),
                },
            );
        }
        gauge!("pipeline_healthy").set(0.0);
    }

    pub fn is_healthy(&self) -> bool {
        self.components
            .read()
            .map(|g| g.values().all(|s| matches!(s, ComponentStatus::Ok { .. })))
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> HealthReport {
        let components = self
            .components
            .read()
            .map(|g| g.clone())
            .unwrap_or_default();
        HealthReport {
            healthy: components
                .values()
                .all(|s| matches!(s, ComponentStatus::Ok { .. })),
            components,
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .with_state(self.clone())
    }
}

async fn health_handler(State(health): State<Health>) -> (StatusCode, Json<HealthReport>) {
    let report = health.snapshot();
    let code = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}
