//! Per-kind routing of queue items onto backend endpoints.

use async_trait::async_trait;
use fieldreg_core::{DocumentUpload, MutationKind, QueueItem};
use fieldreg_storage::http::{HOUSEHOLDS_PATH, PERSONS_PATH, SURVEY_SESSIONS_PATH};
use fieldreg_storage::{ApiClient, Method, RemoteError};
use serde_json::Value as JsonValue;

/// Delivers one queue item. Implementations must tolerate duplicate delivery
/// of the same item id.
#[async_trait]
pub trait SyncBackend: Send + Sync {
    async fn submit(&self, item: &QueueItem) -> Result<(), RemoteError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Json { method: Method, path: String },
    Upload(DocumentUpload),
}

fn payload_id(payload: &JsonValue) -> Option<String> {
    match payload.get("id")? {
        JsonValue::String(id) if !id.trim().is_empty() => Some(id.clone()),
        JsonValue::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

pub fn route(item: &QueueItem) -> Result<Route, RemoteError> {
    let json = |method: Method, path: &str| Route::Json {
        method,
        path: path.to_string(),
    };

    match item.kind {
        MutationKind::CreatePerson => Ok(json(Method::POST, PERSONS_PATH)),
        MutationKind::UpdatePerson => {
            let id = payload_id(&item.payload).ok_or_else(|| {
                RemoteError::InvalidRequest(format!("{} payload has no `id`", item.kind))
            })?;
            Ok(Route::Json {
                method: Method::PATCH,
                path: format!("{PERSONS_PATH}{id}/"),
            })
        }
        MutationKind::CreateHousehold => Ok(json(Method::POST, HOUSEHOLDS_PATH)),
        MutationKind::SubmitSurvey => Ok(json(Method::POST, SURVEY_SESSIONS_PATH)),
        MutationKind::UploadDocument => serde_json::from_value(item.payload.clone())
            .map(Route::Upload)
            .map_err(|err| RemoteError::InvalidRequest(format!("{} payload: {err}", item.kind))),
    }
}

#[async_trait]
impl SyncBackend for ApiClient {
    async fn submit(&self, item: &QueueItem) -> Result<(), RemoteError> {
        let idempotency_key = item.id.to_string();
        match route(item)? {
            Route::Json { method, path } => {
                self.send_json(method, &path, &item.payload, &idempotency_key)
                    .await
            }
            Route::Upload(upload) => self.upload_document(&upload, &idempotency_key).await,
        }
    }
}
