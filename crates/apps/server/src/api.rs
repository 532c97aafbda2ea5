//! HTTP surface over the render queue and the asset resolver.
//!
//! Routes:
//! - `POST /api/jobs`, `GET /api/jobs/:id`, `GET /api/jobs/:id/result`,
//!   `POST /api/jobs/:id/cancel`
//! - `GET /api/cache/stats`, `GET /api/queue/stats`
//! - `GET /api/assets/:id` (diagnostics: runs the fallback chain directly)

use assets::{CacheStats, ResolveError, ResolverStats};
use axum::body::Body;
use axum::extract::{Path as AxumPath, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use catalog::AssetFormat;
use foundation::{AssetId, CancelFlag, JobId, Timestamp};
use render::{RenderError, RenderMetadata, ServiceContext};
use runtime::{JobFailure, JobOptions, JobState, RenderJob};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

pub fn router(ctx: ServiceContext) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/jobs", post(submit_job))
        .route("/api/jobs/:id", get(job_status))
        .route("/api/jobs/:id/result", get(job_result))
        .route("/api/jobs/:id/cancel", post(cancel_job))
        .route("/api/cache/stats", get(cache_stats))
        .route("/api/queue/stats", get(queue_stats))
        .route("/api/assets/:id", get(fetch_asset))
        .with_state(ctx)
}

/// Wire form of a [`RenderError`].
pub struct ApiError(RenderError);

impl From<RenderError> for ApiError {
    fn from(err: RenderError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RenderError::Validation(_) => StatusCode::BAD_REQUEST,
            RenderError::NotFound(_) => StatusCode::NOT_FOUND,
            RenderError::NotReady { .. } | RenderError::NotCancellable { .. } => StatusCode::CONFLICT,
            RenderError::JobFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            RenderError::Cancelled(_) => StatusCode::GONE,
            RenderError::QueueFull { .. } | RenderError::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        let body = json!({
            "error": self.0.code(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError(RenderError::Validation(format!("invalid job id {raw:?}"))))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub avatar_id: String,
    pub product_ids: Vec<AssetId>,
    #[serde(default)]
    pub options: JobOptions,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub job_id: JobId,
    pub avatar_id: String,
    pub product_ids: Vec<AssetId>,
    pub state: JobState,
    pub progress: u8,
    pub current_stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<JobFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub is_batch: bool,
    pub submitted_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub estimated_duration_seconds: f64,
}

impl From<&RenderJob> for JobStatusResponse {
    fn from(job: &RenderJob) -> Self {
        Self {
            job_id: job.id(),
            avatar_id: job.avatar_id().to_string(),
            product_ids: job.product_ids().to_vec(),
            state: job.state(),
            progress: job.progress(),
            current_stage: job.current_stage().to_string(),
            message: job.message().map(str::to_string),
            failure: job.failure().cloned(),
            label: job.options().label.clone(),
            is_batch: job.options().is_batch,
            submitted_at: job.submitted_at(),
            started_at: job.started_at(),
            completed_at: job.completed_at(),
            estimated_duration_seconds: job.estimated_duration().as_secs_f64(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResultResponse<'a> {
    pub job_id: JobId,
    /// Base64 of the first (for non-batch jobs, only) frame.
    pub result_payload: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub frames: Vec<String>,
    pub metadata: &'a RenderMetadata,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatsResponse {
    #[serde(flatten)]
    pub cache: CacheStats,
    #[serde(flatten)]
    pub resolver: ResolverStats,
}

async fn health() -> Response {
    (StatusCode::OK, Json(json!({"status": "ok"}))).into_response()
}

async fn submit_job(
    State(ctx): State<ServiceContext>,
    Json(req): Json<SubmitRequest>,
) -> Result<Response, ApiError> {
    let receipt = ctx
        .queue
        .submit(&req.avatar_id, req.product_ids, req.options)?;
    Ok((StatusCode::ACCEPTED, Json(receipt)).into_response())
}

async fn job_status(
    State(ctx): State<ServiceContext>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job = ctx.queue.status(parse_job_id(&id)?)?;
    Ok(Json(JobStatusResponse::from(&job)))
}

async fn job_result(
    State(ctx): State<ServiceContext>,
    AxumPath(id): AxumPath<String>,
) -> Result<Response, ApiError> {
    let result = ctx.queue.result(parse_job_id(&id)?)?;
    let frames = if result.metadata.is_batch {
        result.frames.iter().map(|f| BASE64.encode(f)).collect()
    } else {
        Vec::new()
    };
    let body = JobResultResponse {
        job_id: result.job_id,
        result_payload: BASE64.encode(result.payload()),
        frames,
        metadata: &result.metadata,
    };
    Ok(Json(body).into_response())
}

async fn cancel_job(
    State(ctx): State<ServiceContext>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job_id = parse_job_id(&id)?;
    let state = ctx.queue.cancel(job_id)?;
    info!("cancel requested for job {job_id}");
    Ok(Json(json!({"ok": true, "state": state})))
}

async fn cache_stats(State(ctx): State<ServiceContext>) -> Json<CacheStatsResponse> {
    Json(CacheStatsResponse {
        cache: ctx.cache.stats(),
        resolver: ctx.resolver.stats(),
    })
}

async fn queue_stats(State(ctx): State<ServiceContext>) -> Response {
    Json(ctx.queue.snapshot()).into_response()
}

fn content_type(payload: &[u8]) -> &'static str {
    if AssetFormat::Glb.accepts(payload) {
        "model/gltf-binary"
    } else if AssetFormat::Png.accepts(payload) {
        "image/png"
    } else if AssetFormat::Jpeg.accepts(payload) {
        "image/jpeg"
    } else {
        "application/octet-stream"
    }
}

async fn fetch_asset(
    State(ctx): State<ServiceContext>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let asset_id = AssetId::new(id);
    match ctx.resolver.resolve_id(&asset_id, &CancelFlag::new()).await {
        Ok(r) => {
            let mut headers = HeaderMap::new();
            headers.insert(
                http::header::CONTENT_TYPE,
                HeaderValue::from_static(content_type(&r.payload)),
            );
            headers.insert(
                "x-source-used",
                HeaderValue::from_static(r.source_used.as_str()),
            );
            headers.insert(
                "x-from-cache",
                HeaderValue::from_static(if r.from_cache { "true" } else { "false" }),
            );
            if let Some(reason) = r.fallback_reason {
                headers.insert("x-fallback-reason", HeaderValue::from_static(reason.as_str()));
            }
            (StatusCode::OK, headers, Body::from(r.payload)).into_response()
        }
        Err(err @ ResolveError::PlaceholderUnavailable { .. }) => {
            warn!("asset fetch failed: {err}");
            let body = json!({"error": "placeholderFailed", "message": err.to_string()});
            (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
        }
        Err(err @ ResolveError::Cancelled(_)) => {
            (StatusCode::GONE, Json(json!({"error": "cancelled", "message": err.to_string()})))
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use assets::MemoryLoader;
    use axum::body::to_bytes;
    use axum::extract::{Path as AxumPath, State};
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::Json;
    use catalog::{AssetDescriptor, InMemoryCatalog, PlaceholderSet};
    use foundation::AssetId;
    use render::ServiceContext;
    use runtime::JobOptions;

    use super::{
        cache_stats, cancel_job, fetch_asset, job_result, job_status, queue_stats, submit_job,
        SubmitRequest,
    };

    const GLB: &[u8] = b"glTF\x02\x00\x00\x00body";
    const PNG: &[u8] = b"\x89PNG\r\n\x1a\ngeneric";

    fn context() -> ServiceContext {
        let loader = Arc::new(MemoryLoader::new());
        loader.insert("avatars/a1.glb", GLB);
        loader.insert("garments/p1.glb", GLB);
        loader.insert("placeholders/generic.png", PNG);
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.insert(AssetDescriptor::new("a1", "slim").with_primary("avatars/a1.glb"));
        catalog.insert(AssetDescriptor::new("p1", "slim").with_primary("garments/p1.glb"));

        ServiceContext::builder()
            .loader(loader)
            .catalog(catalog)
            .placeholders(PlaceholderSet::new("placeholders/generic.png"))
            .build()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn submit(ctx: &ServiceContext, products: &[&str]) -> Response {
        let req = SubmitRequest {
            avatar_id: "a1".to_string(),
            product_ids: products.iter().map(|p| AssetId::new(*p)).collect(),
            options: JobOptions::default(),
        };
        submit_job(State(ctx.clone()), Json(req)).await.into_response()
    }

    async fn wait_for(ctx: &ServiceContext, id: &str, state: &str) {
        for _ in 0..200 {
            let resp = job_status(State(ctx.clone()), AxumPath(id.to_string()))
                .await
                .into_response();
            if json_body(resp).await["state"] == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {id} never reached {state}");
    }

    #[tokio::test]
    async fn submit_poll_and_fetch_result() {
        let ctx = context();
        let resp = submit(&ctx, &["p1"]).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let receipt = json_body(resp).await;
        assert_eq!(receipt["state"], "queued");
        let id = receipt["jobId"].as_str().unwrap().to_string();

        wait_for(&ctx, &id, "completed").await;
        let resp = job_result(State(ctx.clone()), AxumPath(id.clone()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert!(body["resultPayload"].as_str().is_some_and(|s| !s.is_empty()));
        assert_eq!(body["metadata"]["degraded"], false);
        assert_eq!(body["metadata"]["assets"][1]["sourceUsed"], "primary");

        let stats = json_body(queue_stats(State(ctx.clone())).await).await;
        assert_eq!(stats["completed"], 1);
        assert_eq!(stats["successRate"], 1.0);
    }

    #[tokio::test]
    async fn validation_and_lookup_errors_map_to_status_codes() {
        let ctx = context();
        assert_eq!(submit(&ctx, &[]).await.status(), StatusCode::BAD_REQUEST);
        assert_eq!(submit(&ctx, &["p1", "p1"]).await.status(), StatusCode::BAD_REQUEST);

        let resp = job_status(State(ctx.clone()), AxumPath("not-a-uuid".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let unknown = foundation::JobId::generate().to_string();
        let resp = job_status(State(ctx.clone()), AxumPath(unknown))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(resp).await["error"], "notFound");
    }

    #[tokio::test]
    async fn cancelled_job_result_is_gone() {
        let ctx = context();
        let receipt = json_body(submit(&ctx, &["p1"]).await).await;
        let id = receipt["jobId"].as_str().unwrap().to_string();

        let resp = cancel_job(State(ctx.clone()), AxumPath(id.clone()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["state"], "cancelled");

        let resp = job_result(State(ctx.clone()), AxumPath(id.clone()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::GONE);

        let resp = cancel_job(State(ctx.clone()), AxumPath(id))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn asset_fetch_reports_provenance_headers() {
        let ctx = context();
        let resp = fetch_asset(State(ctx.clone()), AxumPath("nope".to_string())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["x-source-used"], "genericPlaceholder");
        assert_eq!(resp.headers()["x-from-cache"], "false");
        assert_eq!(resp.headers()["x-fallback-reason"], "fileNotFound");
        assert_eq!(resp.headers()["content-type"], "image/png");

        let resp = fetch_asset(State(ctx.clone()), AxumPath("nope".to_string())).await;
        assert_eq!(resp.headers()["x-from-cache"], "true");
        assert_eq!(resp.headers()["x-fallback-reason"], "fileNotFound");

        let stats = cache_stats(State(ctx.clone())).await.into_response();
        let stats = json_body(stats).await;
        assert_eq!(stats["hits"], 1);
        assert_eq!(stats["servedGenericPlaceholder"], 2);
        assert!(stats["entryCount"].as_u64().is_some_and(|n| n >= 1));
    }
}
