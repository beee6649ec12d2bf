//! REST handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::health::ClusterSnapshot;
use crate::http::error::ApiError;
use crate::http::server::AppState;
use crate::model::{ConfigEntry, ConfigKey, ConfigMetadata, ConfigValue, Scope, Version};

#[derive(Debug, Serialize)]
pub struct HealthBody {
    pub status: &'static str,
    pub usable_endpoints: usize,
    pub endpoints: usize,
}

/// 200 while any endpoint is usable, 503 otherwise.
pub async fn health(State(state): State<AppState>) -> Response {
    let endpoints = state.runtime.gateway().endpoints();
    let usable = endpoints.iter().filter(|e| e.is_usable()).count();
    let (status, label) = if usable > 0 {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    };
    let body = HealthBody {
        status: label,
        usable_endpoints: usable,
        endpoints: endpoints.len(),
    };
    (status, Json(body)).into_response()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoredValue {
    pub value: ConfigValue,
    pub version: Version,
    pub metadata: ConfigMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScopeBody {
    pub namespace: String,
    pub environment: String,
    pub configs: BTreeMap<String, StoredValue>,
}

pub async fn get_scope(
    State(state): State<AppState>,
    Path((namespace, environment)): Path<(String, String)>,
) -> Result<Json<ScopeBody>, ApiError> {
    let scope = Scope::new(namespace, environment)?;
    let entries = state.runtime.gateway().get_all(&scope).await?;
    let configs = entries
        .into_iter()
        .map(|e| {
            (
                e.key,
                StoredValue {
                    value: e.value,
                    version: e.version,
                    metadata: e.metadata,
                },
            )
        })
        .collect();
    Ok(Json(ScopeBody {
        namespace: scope.namespace().to_string(),
        environment: scope.environment().to_string(),
        configs,
    }))
}

pub async fn get_key(
    State(state): State<AppState>,
    Path((namespace, environment, key)): Path<(String, String, String)>,
) -> Result<Json<ConfigEntry>, ApiError> {
    let key = ConfigKey::parse(&namespace, &environment, &key)?;
    Ok(Json(state.runtime.gateway().get(&key).await?))
}

#[derive(Debug, Deserialize)]
pub struct MetadataBody {
    pub created_by: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub approved_by: Option<String>,
    #[serde(default)]
    pub git_commit: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PutBody {
    pub value: ConfigValue,
    #[serde(default)]
    pub metadata: Option<MetadataBody>,
    /// Write only if the current version matches.
    #[serde(default)]
    pub expected_version: Option<u64>,
    /// Write only if the key does not exist yet.
    #[serde(default)]
    pub create_only: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WriteBody {
    pub namespace: String,
    pub environment: String,
    pub key: String,
    pub version: Version,
}

impl WriteBody {
    fn new(key: &ConfigKey, version: Version) -> Self {
        Self {
            namespace: key.scope().namespace().to_string(),
            environment: key.scope().environment().to_string(),
            key: key.key().to_string(),
            version,
        }
    }
}

pub async fn put_key(
    State(state): State<AppState>,
    Path((namespace, environment, key)): Path<(String, String, String)>,
    Json(body): Json<PutBody>,
) -> Result<Json<WriteBody>, ApiError> {
    let key = ConfigKey::parse(&namespace, &environment, &key)?;
    let metadata = match body.metadata {
        Some(m) => {
            let mut metadata = ConfigMetadata::new(m.created_by, m.source.unwrap_or_else(|| "api".into()));
            metadata.approved_by = m.approved_by;
            metadata.git_commit = m.git_commit;
            metadata
        }
        None => ConfigMetadata::new("", "api"),
    };

    let gateway = state.runtime.gateway();
    let version = match (body.create_only, body.expected_version) {
        (true, _) => gateway.put_if(&key, body.value, metadata, None).await?,
        (false, Some(expected)) => {
            gateway
                .put_if(&key, body.value, metadata, Some(Version::new(expected)))
                .await?
        }
        (false, None) => gateway.put(&key, body.value, metadata).await?,
    };
    tracing::info!(key = %key, %version, "Configuration updated via API");
    Ok(Json(WriteBody::new(&key, version)))
}

pub async fn delete_key(
    State(state): State<AppState>,
    Path((namespace, environment, key)): Path<(String, String, String)>,
) -> Result<Json<WriteBody>, ApiError> {
    let key = ConfigKey::parse(&namespace, &environment, &key)?;
    let version = state.runtime.gateway().delete(&key).await?;
    tracing::info!(key = %key, %version, "Configuration deleted via API");
    Ok(Json(WriteBody::new(&key, version)))
}

/// Last completed probe round.
pub async fn cluster(State(state): State<AppState>) -> Json<ClusterSnapshot> {
    Json(state.runtime.monitor().snapshot().as_ref().clone())
}
