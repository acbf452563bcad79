//! Operator routes mounted under `/v1/admin`, guarded by a bearer token.

use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use axum_extra::headers::{authorization::Bearer, Authorization, HeaderMapExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use super::metrics::metrics_handler;
use super::state::*;
use crate::background_jobs::JobError;
use crate::broadcast::{BroadcastError, PostNotification};
use crate::deliverability::{load_email_stats, reset_email_stats};
use crate::newsletter_store::{
    QueueFilter, QueueOrderBy, QueueStatusFilter, SubscriberFilter, SubscriberOrderBy,
};
use crate::tokens::constant_time_eq;

const DEFAULT_ACTIVITY_LIMIT: usize = 50;
const MAX_ACTIVITY_LIMIT: usize = 500;
const DEFAULT_HISTORY_LIMIT: usize = 20;

async fn require_admin(State(state): State<ServerState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.config.admin_token.as_deref() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match request.headers().typed_get::<Authorization<Bearer>>() {
        None => StatusCode::UNAUTHORIZED.into_response(),
        Some(auth) if constant_time_eq(auth.token(), expected) => {
            next.run(request).await
        }
        Some(_) => {
            warn!("Rejected admin request to {} with a wrong token", request.uri().path());
            StatusCode::FORBIDDEN.into_response()
        }
    }
}

fn internal_error(context: &str, err: anyhow::Error) -> Response {
    error!("{}: {:#}", context, err);
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{}", err)).into_response()
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "snake_case")]
enum SubscriberBulkAction {
    Delete,
    Verify,
    Unverify,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "snake_case")]
enum QueueBulkAction {
    Delete,
    Resend,
}

#[derive(Deserialize, Debug)]
struct BulkBody<A> {
    pub action: A,
    pub ids: Vec<i64>,
}

#[derive(Serialize)]
struct AffectedResponse {
    pub affected: usize,
}

fn affected(count: usize) -> Response {
    Json(AffectedResponse { affected: count }).into_response()
}

fn is_descending(order: Option<&str>) -> bool {
    !matches!(order.map(str::to_ascii_lowercase).as_deref(), Some("asc"))
}

// =============================================================================
// Subscribers
// =============================================================================

#[derive(Deserialize, Debug, Default)]
struct SubscriberListQuery {
    pub search: Option<String>,
    pub verified: Option<bool>,
    pub order_by: Option<String>,
    pub order: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl SubscriberListQuery {
    fn into_filter(self) -> SubscriberFilter {
        let defaults = SubscriberFilter::default();
        SubscriberFilter {
            search: self.search,
            verified: self.verified,
            order_by: self
                .order_by
                .as_deref()
                .and_then(SubscriberOrderBy::parse)
                .unwrap_or_default(),
            descending: is_descending(self.order.as_deref()),
            limit: self.limit.filter(|l| *l > 0).unwrap_or(defaults.limit),
            offset: self.offset.unwrap_or(0),
        }
    }
}

async fn list_subscribers(
    State(store): State<GuardedNewsletterStore>,
    Query(query): Query<SubscriberListQuery>,
) -> Response {
    let filter = query.into_filter();
    let subscribers = match store.list_subscribers(&filter) {
        Ok(subscribers) => subscribers,
        Err(err) => return internal_error("Listing subscribers failed", err),
    };
    match store.count_subscribers(&filter) {
        Ok(total) => Json(json!({ "subscribers": subscribers, "total": total })).into_response(),
        Err(err) => internal_error("Counting subscribers failed", err),
    }
}

async fn bulk_subscribers(
    State(store): State<GuardedNewsletterStore>,
    Json(body): Json<BulkBody<SubscriberBulkAction>>,
) -> Response {
    if body.ids.is_empty() {
        return (StatusCode::BAD_REQUEST, "No subscribers selected").into_response();
    }
    let result = match body.action {
        SubscriberBulkAction::Delete => store.delete_subscribers(&body.ids),
        SubscriberBulkAction::Verify => store.set_verified(&body.ids, true),
        SubscriberBulkAction::Unverify => store.set_verified(&body.ids, false),
    };
    match result {
        Ok(count) => {
            info!("Bulk {:?} applied to {} subscribers", body.action, count);
            affected(count)
        }
        Err(err) => internal_error("Bulk subscriber action failed", err),
    }
}

async fn delete_unverified_subscribers(State(store): State<GuardedNewsletterStore>) -> Response {
    match store.delete_unverified() {
        Ok(count) => {
            info!("Deleted {} unverified subscribers", count);
            affected(count)
        }
        Err(err) => internal_error("Deleting unverified subscribers failed", err),
    }
}

// =============================================================================
// Queue
// =============================================================================

#[derive(Deserialize, Debug, Default)]
struct QueueListQuery {
    pub status: Option<String>,
    pub order_by: Option<String>,
    pub order: Option<String>,
    pub per_page: Option<usize>,
    pub page: Option<usize>,
}

impl QueueListQuery {
    fn into_filter(self) -> QueueFilter {
        let limit = QueueFilter::page_size(self.per_page);
        let page = self.page.unwrap_or(1).max(1);
        QueueFilter {
            status: self.status.as_deref().and_then(QueueStatusFilter::parse),
            order_by: self
                .order_by
                .as_deref()
                .and_then(QueueOrderBy::parse)
                .unwrap_or_default(),
            descending: is_descending(self.order.as_deref()),
            limit,
            offset: (page - 1).saturating_mul(limit),
        }
    }
}

async fn list_queue(
    State(store): State<GuardedNewsletterStore>,
    Query(query): Query<QueueListQuery>,
) -> Response {
    let filter = query.into_filter();
    let emails = match store.list_queue(&filter) {
        Ok(emails) => emails,
        Err(err) => return internal_error("Listing queue failed", err),
    };
    match store.count_queue(filter.status) {
        Ok(total) => Json(json!({
            "emails": emails,
            "total": total,
            "per_page": filter.limit,
        }))
        .into_response(),
        Err(err) => internal_error("Counting queue failed", err),
    }
}

async fn bulk_queue(
    State(state): State<ServerState>,
    Json(body): Json<BulkBody<QueueBulkAction>>,
) -> Response {
    if body.ids.is_empty() {
        return (StatusCode::BAD_REQUEST, "No emails selected").into_response();
    }
    let store = &state.newsletter_store;
    let result = match body.action {
        QueueBulkAction::Delete => store.delete_emails(&body.ids),
        QueueBulkAction::Resend => store.resend_emails(&body.ids, state.clock.now()),
    };
    match result {
        Ok(count) => {
            info!("Bulk {:?} applied to {} queued emails", body.action, count);
            affected(count)
        }
        Err(err) => internal_error("Bulk queue action failed", err),
    }
}

async fn delete_pending_queue(State(store): State<GuardedNewsletterStore>) -> Response {
    match store.delete_pending() {
        Ok(count) => {
            info!("Cleared {} pending emails", count);
            affected(count)
        }
        Err(err) => internal_error("Clearing pending emails failed", err),
    }
}

#[derive(Deserialize, Debug)]
struct BroadcastBody {
    #[serde(flatten)]
    pub post: PostNotification,
    /// Restricts the broadcast to these addresses.
    #[serde(default)]
    pub recipients: Option<Vec<String>>,
}

async fn broadcast(State(services): State<Services>, Json(body): Json<BroadcastBody>) -> Response {
    let broadcast = services.broadcast.clone();
    let result = super::server::run_blocking(move || {
        broadcast.queue_post_notification(&body.post, body.recipients.as_deref())
    })
    .await;

    match result {
        Ok(Ok(outcome)) => Json(outcome).into_response(),
        Ok(Err(e @ (BroadcastError::NoValidSelection | BroadcastError::NoSubscribers))) => {
            (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()).into_response()
        }
        Ok(Err(BroadcastError::Store(err))) => internal_error("Broadcast failed", err),
        Err(status) => status.into_response(),
    }
}

// =============================================================================
// Deliverability
// =============================================================================

async fn get_stats(State(state): State<ServerState>) -> Response {
    let now = state.clock.now();
    let queue = match state.newsletter_store.queue_stats(now) {
        Ok(queue) => queue,
        Err(err) => return internal_error("Reading queue stats failed", err),
    };
    let email_stats = match load_email_stats(state.server_store.as_ref()) {
        Ok(stats) => stats,
        Err(err) => return internal_error("Reading email stats failed", err),
    };
    let processor = &state.services.queue_processor;
    let batch = processor
        .base_batch_size()
        .and_then(|base| Ok((base, processor.effective_batch_size(base, now)?)));
    let (base_batch_size, effective_batch_size) = match batch {
        Ok(sizes) => sizes,
        Err(err) => return internal_error("Reading batch size failed", err),
    };

    Json(json!({
        "queue": queue,
        "emails": email_stats,
        "reputation": email_stats.reputation(),
        "base_batch_size": base_batch_size,
        "effective_batch_size": effective_batch_size,
    }))
    .into_response()
}

async fn reset_stats(State(state): State<ServerState>) -> Response {
    match reset_email_stats(state.server_store.as_ref(), state.clock.now()) {
        Ok(()) => {
            info!("Email stats reset by admin");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => internal_error("Resetting email stats failed", err),
    }
}

#[derive(Deserialize, Debug)]
struct ActivityQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

async fn get_activity(
    State(server_store): State<GuardedServerStore>,
    Query(query): Query<ActivityQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_ACTIVITY_LIMIT)
        .clamp(1, MAX_ACTIVITY_LIMIT);
    match server_store.get_email_activity(limit, query.offset.unwrap_or(0)) {
        Ok(activity) => Json(activity).into_response(),
        Err(err) => internal_error("Reading email activity failed", err),
    }
}

// =============================================================================
// Background jobs
// =============================================================================

fn scheduler_unavailable() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "Job scheduler not available").into_response()
}

async fn list_jobs(State(scheduler): State<OptionalSchedulerHandle>) -> Response {
    let Some(scheduler) = scheduler else {
        return scheduler_unavailable();
    };
    match scheduler.list_jobs().await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(err) => internal_error("Listing jobs failed", err),
    }
}

async fn get_job(
    State(scheduler): State<OptionalSchedulerHandle>,
    Path(job_id): Path<String>,
) -> Response {
    let Some(scheduler) = scheduler else {
        return scheduler_unavailable();
    };
    match scheduler.get_job(&job_id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => internal_error("Reading job failed", err),
    }
}

async fn trigger_job(
    State(scheduler): State<OptionalSchedulerHandle>,
    Path(job_id): Path<String>,
) -> Response {
    let Some(scheduler) = scheduler else {
        return scheduler_unavailable();
    };
    match scheduler.trigger_job(&job_id).await {
        Ok(()) => {
            info!("Job {} triggered by admin", job_id);
            (StatusCode::ACCEPTED, Json(json!({ "job_id": job_id }))).into_response()
        }
        Err(JobError::NotFound) => StatusCode::NOT_FOUND.into_response(),
        Err(JobError::AlreadyRunning) => {
            (StatusCode::CONFLICT, JobError::AlreadyRunning.to_string()).into_response()
        }
        Err(e) => {
            error!("Triggering job {} failed: {}", job_id, e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[derive(Deserialize, Debug)]
struct HistoryQuery {
    pub limit: Option<usize>,
}

async fn get_job_history(
    State(scheduler): State<OptionalSchedulerHandle>,
    Path(job_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let Some(scheduler) = scheduler else {
        return scheduler_unavailable();
    };
    if !scheduler.job_exists(&job_id).await {
        return StatusCode::NOT_FOUND.into_response();
    }
    match scheduler.get_job_history(&job_id, query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT)) {
        Ok(history) => Json(history).into_response(),
        Err(err) => internal_error("Reading job history failed", err),
    }
}

pub fn admin_routes(state: ServerState) -> Router {
    Router::new()
        .route("/subscribers", get(list_subscribers))
        .route("/subscribers/bulk", post(bulk_subscribers))
        .route("/subscribers/unverified", delete(delete_unverified_subscribers))
        .route("/queue", get(list_queue))
        .route("/queue/bulk", post(bulk_queue))
        .route("/queue/pending", delete(delete_pending_queue))
        .route("/broadcast", post(broadcast))
        .route("/stats", get(get_stats))
        .route("/stats/reset", post(reset_stats))
        .route("/activity", get(get_activity))
        .route("/jobs", get(list_jobs))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/trigger", post(trigger_job))
        .route("/jobs/{id}/history", get(get_job_history))
        .route("/metrics", get(metrics_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin))
        .with_state(state)
}
