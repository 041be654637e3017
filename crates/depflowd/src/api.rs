//! HTTP surface of the service.
//!
//! `POST /subscriptions/:id/trigger?bar-build-id=N` validates the request
//! against the catalog and enqueues a `TriggerSubscription` item. The
//! response is `202 Accepted` as soon as the item is on the queue; whether
//! the update later succeeds is only visible in the logs.
//!
//! `POST /builds?channel=N` ingests a build reported by CI and announces it
//! on its channels. If announcing fails after the build was stored, the
//! error names the build id and `POST /builds/:id/publish` finishes the job.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use depflow_core::{BuildIngestor, Dispatcher, ErrorClass, FlowError};
use flow_state::{
    Build, BuildId, Catalog, ChannelId, NewBuild, StorageError, Subscription, SubscriptionId,
    UpdateWorkItem,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

#[derive(Clone)]
pub struct ApiState {
    pub catalog: Arc<dyn Catalog>,
    pub dispatcher: Dispatcher,
    pub ingestor: Arc<BuildIngestor>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        if err.is_transient() {
            ApiError::Unavailable(err.to_string())
        } else {
            ApiError::Internal(err.to_string())
        }
    }
}

impl From<FlowError> for ApiError {
    fn from(err: FlowError) -> Self {
        match err {
            FlowError::Storage(e) => e.into(),
            other if other.class() == ErrorClass::Transient => {
                ApiError::Unavailable(other.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TriggerQuery {
    /// `0` or absent means the latest build on the channel.
    #[serde(rename = "bar-build-id", default)]
    pub bar_build_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ChannelQuery {
    /// Channel to place the build on in addition to its default channels.
    pub channel: Option<u32>,
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    pending: usize,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/subscriptions/:id/trigger", post(trigger_subscription))
        .route("/builds", post(ingest_build))
        .route("/builds/:id/publish", post(publish_build))
        .with_state(state)
}

async fn health(State(state): State<ApiState>) -> Result<Json<Health>, ApiError> {
    let pending = state.dispatcher.queue().pending().await?;
    Ok(Json(Health {
        status: "ok",
        pending,
    }))
}

async fn ingest_build(
    State(state): State<ApiState>,
    Query(query): Query<ChannelQuery>,
    Json(new): Json<NewBuild>,
) -> Result<(StatusCode, Json<Build>), ApiError> {
    let channel = query.channel.map(ChannelId);
    if let Some(channel_id) = channel {
        match state.catalog.get_channel(channel_id).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                return Err(ApiError::BadRequest(format!("channel {channel_id} not found")))
            }
            Err(e) => return Err(e.into()),
        }
    }
    let build = state.ingestor.create_build(new, channel).await?;
    Ok((StatusCode::CREATED, Json(build)))
}

async fn publish_build(
    State(state): State<ApiState>,
    Path(id): Path<u64>,
    Query(query): Query<ChannelQuery>,
) -> Result<Json<Build>, ApiError> {
    match state
        .ingestor
        .publish_build(BuildId(id), query.channel.map(ChannelId))
        .await
    {
        Ok(build) => Ok(Json(build)),
        Err(FlowError::Storage(e)) if e.is_not_found() => Err(ApiError::NotFound(e.to_string())),
        Err(e) => Err(e.into()),
    }
}

async fn trigger_subscription(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Query(query): Query<TriggerQuery>,
) -> Result<(StatusCode, Json<Subscription>), ApiError> {
    let subscription_id = SubscriptionId(id);
    let subscription = match state.catalog.get_subscription(subscription_id).await {
        Ok(sub) => sub,
        Err(e) if e.is_not_found() => {
            return Err(ApiError::NotFound(format!(
                "subscription {subscription_id} not found"
            )))
        }
        Err(e) => return Err(e.into()),
    };

    let build_id = query.bar_build_id.filter(|id| *id != 0).map(BuildId);
    if let Some(build_id) = build_id {
        let build = match state.catalog.get_build(build_id).await {
            Ok(build) => build,
            Err(e) if e.is_not_found() => {
                return Err(ApiError::BadRequest(format!("build {build_id} was not found")))
            }
            Err(e) => return Err(e.into()),
        };
        if !build.repository.matches(&subscription.source_repository) {
            return Err(ApiError::BadRequest(format!(
                "build {build_id} does not match source repository {}",
                subscription.source_repository
            )));
        }
    }

    let outcome = state
        .dispatcher
        .enqueue(UpdateWorkItem::TriggerSubscription {
            subscription_id,
            build_id,
        })
        .await?;
    info!(
        subscription_id = %subscription_id,
        build_id = ?build_id.map(|b| b.0),
        outcome = ?outcome,
        "subscription trigger accepted"
    );
    Ok((StatusCode::ACCEPTED, Json(subscription)))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use flow_state::fakes::{MemoryCatalog, MemoryWorkQueue};
    use flow_state::{Channel, RepoAddress, SubscriptionPolicy, UpdateFrequency};

    use super::*;

    const SOURCE: &str = "https://github.com/org/runtime";

    struct Fixture {
        base: String,
        queue: MemoryWorkQueue,
        subscription: Subscription,
    }

    async fn serve() -> Fixture {
        let catalog = Arc::new(MemoryCatalog::new());
        let subscription = Subscription {
            id: SubscriptionId::new(),
            channel_id: ChannelId(1),
            source_repository: SOURCE.into(),
            target_repository: "https://github.com/org/sdk".into(),
            target_branch: "main".into(),
            enabled: true,
            policy: SubscriptionPolicy {
                update_frequency: UpdateFrequency::EveryDay,
                batchable: false,
            },
            last_applied_build_id: None,
        };
        catalog.insert_subscription(subscription.clone());
        for (id, repo) in [
            (10, SOURCE),
            (11, "https://github.com/org/other"),
            (12, "https://github.com/Org/Runtime"),
        ] {
            catalog.insert_build(Build {
                id: BuildId(id),
                repository: RepoAddress::github(repo),
                branch: "main".into(),
                commit: "abc".into(),
                date_produced: Utc::now(),
                channels: vec![],
                assets: vec![],
                dependencies: vec![],
                incoherencies: vec![],
            });
        }

        catalog.insert_channel(Channel {
            id: ChannelId(1),
            name: ".NET 9".into(),
            classification: "product".into(),
        });

        let queue = MemoryWorkQueue::new();
        let dispatcher = Dispatcher::new(Arc::new(queue.clone()));
        let state = ApiState {
            catalog: catalog.clone(),
            ingestor: Arc::new(BuildIngestor::new(catalog, dispatcher.clone())),
            dispatcher,
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        Fixture {
            base: format!("http://{addr}"),
            queue,
            subscription,
        }
    }

    #[tokio::test]
    async fn trigger_latest_is_accepted_and_enqueued() {
        let f = serve().await;
        let resp = reqwest::Client::new()
            .post(format!("{}/subscriptions/{}/trigger", f.base, f.subscription.id))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["source_repository"], SOURCE);
        assert_eq!(
            f.queue.ready_items(),
            vec![UpdateWorkItem::TriggerSubscription {
                subscription_id: f.subscription.id,
                build_id: None,
            }]
        );
    }

    #[tokio::test]
    async fn explicit_build_must_exist_and_match_the_source() {
        let f = serve().await;
        let client = reqwest::Client::new();
        let url = format!("{}/subscriptions/{}/trigger", f.base, f.subscription.id);

        let missing = client
            .post(format!("{url}?bar-build-id=99"))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::BAD_REQUEST);

        let foreign = client
            .post(format!("{url}?bar-build-id=11"))
            .send()
            .await
            .unwrap();
        assert_eq!(foreign.status(), reqwest::StatusCode::BAD_REQUEST);
        assert!(f.queue.ready_items().is_empty());

        let ok = client
            .post(format!("{url}?bar-build-id=10"))
            .send()
            .await
            .unwrap();
        assert_eq!(ok.status(), reqwest::StatusCode::ACCEPTED);
        assert_eq!(
            f.queue.ready_items(),
            vec![UpdateWorkItem::TriggerSubscription {
                subscription_id: f.subscription.id,
                build_id: Some(BuildId(10)),
            }]
        );
    }

    #[tokio::test]
    async fn build_whose_url_differs_only_in_case_is_accepted() {
        let f = serve().await;
        let resp = reqwest::Client::new()
            .post(format!(
                "{}/subscriptions/{}/trigger?bar-build-id=12",
                f.base, f.subscription.id
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn ingested_build_is_announced_on_its_channel() {
        let f = serve().await;
        let client = reqwest::Client::new();
        let new = NewBuild {
            repository: RepoAddress::github(SOURCE),
            branch: "main".into(),
            commit: "def".into(),
            date_produced: Utc::now(),
            assets: vec![],
            dependencies: vec![],
        };

        let unknown = client
            .post(format!("{}/builds?channel=404", f.base))
            .json(&new)
            .send()
            .await
            .unwrap();
        assert_eq!(unknown.status(), reqwest::StatusCode::BAD_REQUEST);

        let resp = client
            .post(format!("{}/builds?channel=1", f.base))
            .json(&new)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::CREATED);
        let build: Build = resp.json().await.unwrap();
        assert!(build.is_on_channel(ChannelId(1)));
        assert_eq!(
            f.queue.ready_items(),
            vec![UpdateWorkItem::BuildAdded {
                build_id: build.id,
                channel_id: ChannelId(1),
            }]
        );

        // Publishing again is harmless while the announcement is pending.
        let again = client
            .post(format!("{}/builds/{}/publish", f.base, build.id))
            .send()
            .await
            .unwrap();
        assert_eq!(again.status(), reqwest::StatusCode::OK);
        assert_eq!(f.queue.ready_items().len(), 1);

        let missing = client
            .post(format!("{}/builds/999/publish", f.base))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_subscription_is_not_found() {
        let f = serve().await;
        let resp = reqwest::Client::new()
            .post(format!(
                "{}/subscriptions/{}/trigger",
                f.base,
                SubscriptionId::new()
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn health_reports_queue_depth() {
        let f = serve().await;
        let body: serde_json::Value = reqwest::get(format!("{}/health", f.base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["pending"], 0);
    }
}
