use anyhow::Result;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use axum::{
    extract::{FromRequest, Query, Request, State},
    http::{header, StatusCode},
    middleware,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{admin_routes::admin_routes, log_requests, state::*, ServerConfig};
use crate::downloads::{DownloadError, DownloadVerifyOutcome};
use crate::unsubscribe::UnsubscribeError;
use crate::verification::{SubscribeOutcome, VerificationError, VerificationOutcome};

const SERVER_ERROR_MESSAGE: &str = "Server error. Please try again in a moment.";

#[derive(Serialize)]
struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub hash: String,
    pub uptime: String,
}

fn format_uptime(duration: Duration) -> String {
    let total_seconds = duration.as_secs();

    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
}

/// Outcome of a public form submission.
#[derive(Serialize, Deserialize, Debug)]
pub struct SubmitResponse {
    pub success: bool,
    pub message: String,
}

fn submit_response(status: StatusCode, success: bool, message: &str) -> Response {
    (
        status,
        Json(SubmitResponse {
            success,
            message: message.to_string(),
        }),
    )
        .into_response()
}

/// Accepts either a JSON body or an urlencoded form, picked by content type.
pub(super) struct JsonOrForm<T>(pub T);

impl<S, T> FromRequest<S> for JsonOrForm<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Send + 'static,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_json = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("application/json"))
            .unwrap_or(false);

        if is_json {
            let Json(payload) = Json::<T>::from_request(req, state)
                .await
                .map_err(IntoResponse::into_response)?;
            Ok(Self(payload))
        } else {
            let Form(payload) = Form::<T>::from_request(req, state)
                .await
                .map_err(IntoResponse::into_response)?;
            Ok(Self(payload))
        }
    }
}

/// Runs store and mail work off the async runtime.
pub(super) async fn run_blocking<T, F>(f: F) -> Result<T, StatusCode>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        error!("Blocking task failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// 302 like a classic web redirect.
fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

fn page(state: &ServerState, status: StatusCode, headline: &str, message: &str) -> Response {
    match state.templates.page(
        headline,
        message,
        Some((state.config.site_url.as_str(), "Back to the site")),
    ) {
        Ok(html) => (status, Html(html)).into_response(),
        Err(e) => {
            error!("Failed to render page '{}': {}", headline, e);
            (StatusCode::INTERNAL_SERVER_ERROR, SERVER_ERROR_MESSAGE).into_response()
        }
    }
}

async fn health(State(state): State<ServerState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        hash: state.hash.clone(),
        uptime: format_uptime(state.start_time.elapsed()),
    })
}

// =============================================================================
// Subscription
// =============================================================================

#[derive(Deserialize, Debug)]
struct SubscribeBody {
    #[serde(alias = "EMAIL")]
    pub email: String,
}

async fn subscribe(
    State(state): State<ServerState>,
    JsonOrForm(body): JsonOrForm<SubscribeBody>,
) -> Response {
    let verification = state.services.verification.clone();
    let result = match run_blocking(move || verification.subscribe(&body.email)).await {
        Ok(result) => result,
        Err(status) => return submit_response(status, false, SERVER_ERROR_MESSAGE),
    };

    match result {
        Ok(SubscribeOutcome::VerificationSent) => submit_response(
            StatusCode::OK,
            true,
            "Thanks! Please check your email to confirm your subscription.",
        ),
        Ok(SubscribeOutcome::VerificationPending) => submit_response(
            StatusCode::OK,
            true,
            "A confirmation email was sent recently. Please check your inbox.",
        ),
        Ok(SubscribeOutcome::AlreadySubscribed) => {
            submit_response(StatusCode::OK, true, "You are already subscribed.")
        }
        Err(VerificationError::InvalidEmail) => {
            submit_response(StatusCode::BAD_REQUEST, false, "Invalid email address.")
        }
        Err(VerificationError::Store(e)) => {
            error!("Subscribe failed: {:#}", e);
            submit_response(StatusCode::INTERNAL_SERVER_ERROR, false, SERVER_ERROR_MESSAGE)
        }
    }
}

#[derive(Deserialize, Debug)]
struct VerifyQuery {
    pub verify_email: Option<String>,
    pub token: Option<String>,
}

async fn verify_subscription(
    State(state): State<ServerState>,
    Query(query): Query<VerifyQuery>,
) -> Response {
    let redirect = |outcome: VerificationOutcome| {
        found(&format!(
            "{}/?verified={}",
            state.config.site_url,
            outcome.as_str()
        ))
    };

    let (email, token) = match (query.verify_email, query.token) {
        (Some(email), Some(token)) => (email, token),
        _ => return redirect(VerificationOutcome::Invalid),
    };

    let verification = state.services.verification.clone();
    match run_blocking(move || verification.handle_verification_request(&email, &token)).await {
        Ok(Ok(outcome)) => redirect(outcome),
        Ok(Err(e)) => {
            error!("Verification failed: {:#}", e);
            redirect(VerificationOutcome::Invalid)
        }
        Err(_) => redirect(VerificationOutcome::Invalid),
    }
}

#[derive(Deserialize, Debug)]
struct UnsubscribeQuery {
    pub email: Option<String>,
    pub token: Option<String>,
}

/// Serves both the footer link (GET) and one-click List-Unsubscribe (POST).
async fn unsubscribe(
    State(state): State<ServerState>,
    Query(query): Query<UnsubscribeQuery>,
) -> Response {
    let (email, token) = match (query.email, query.token) {
        (Some(email), Some(token)) => (email, token),
        _ => {
            return page(
                &state,
                StatusCode::BAD_REQUEST,
                "Invalid link",
                "This unsubscribe link is invalid.",
            )
        }
    };

    let unsubscribe = state.services.unsubscribe.clone();
    match run_blocking(move || unsubscribe.unsubscribe(&email, &token)).await {
        Ok(Ok(())) => page(
            &state,
            StatusCode::OK,
            "You have been unsubscribed",
            "You will no longer receive emails from us.",
        ),
        Ok(Err(UnsubscribeError::InvalidToken)) => page(
            &state,
            StatusCode::BAD_REQUEST,
            "Invalid link",
            "This unsubscribe link is invalid.",
        ),
        Ok(Err(UnsubscribeError::Store(e))) => {
            error!("Unsubscribe failed: {:#}", e);
            page(
                &state,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Something went wrong",
                SERVER_ERROR_MESSAGE,
            )
        }
        Err(status) => page(&state, status, "Something went wrong", SERVER_ERROR_MESSAGE),
    }
}

// =============================================================================
// Gated downloads
// =============================================================================

#[derive(Deserialize, Debug)]
struct DownloadForm {
    #[serde(rename = "EMAIL", alias = "email", default)]
    pub email: String,
    #[serde(rename = "postId", alias = "post_id", default)]
    pub post_id: String,
    #[serde(rename = "blockId", alias = "block_id", default)]
    pub block_id: String,
    #[serde(rename = "fileUrl", alias = "file_url", default)]
    pub file_url: Option<String>,
}

async fn request_download(
    State(state): State<ServerState>,
    JsonOrForm(form): JsonOrForm<DownloadForm>,
) -> Response {
    // Non-numeric ids behave like a missing post
    let post_id = form.post_id.trim().parse::<i64>().unwrap_or(0);
    let block_id = form.block_id.trim().to_string();
    let file_url = form.file_url.filter(|u| !u.trim().is_empty());

    let downloads = state.services.downloads.clone();
    let result = run_blocking(move || {
        downloads.request_download(
            &form.email,
            post_id,
            Some(block_id.as_str()).filter(|b| !b.is_empty()),
            file_url.as_deref(),
        )
    })
    .await;

    match result {
        Ok(Ok(outcome)) => submit_response(StatusCode::OK, true, outcome.message()),
        Ok(Err(DownloadError::Store(e))) => {
            error!("Download request failed: {:#}", e);
            submit_response(StatusCode::INTERNAL_SERVER_ERROR, false, SERVER_ERROR_MESSAGE)
        }
        Ok(Err(e)) => {
            if let DownloadError::Mail(ref mail_error) = e {
                warn!("Download email could not be sent: {}", mail_error);
            }
            submit_response(StatusCode::OK, false, &e.to_string())
        }
        Err(status) => submit_response(status, false, SERVER_ERROR_MESSAGE),
    }
}

#[derive(Deserialize, Debug)]
struct DownloadQuery {
    pub token: Option<String>,
    pub email: Option<String>,
}

impl DownloadQuery {
    fn into_parts(self) -> Option<(String, String)> {
        match (self.token, self.email) {
            (Some(token), Some(email)) if !token.is_empty() && !email.is_empty() => {
                Some((token, email))
            }
            _ => None,
        }
    }
}

async fn verify_download(
    State(state): State<ServerState>,
    Query(query): Query<DownloadQuery>,
) -> Response {
    let (token, email) = match query.into_parts() {
        Some(parts) => parts,
        None => {
            return page(
                &state,
                StatusCode::BAD_REQUEST,
                "Invalid request",
                "Invalid verification request.",
            )
        }
    };

    let downloads = state.services.downloads.clone();
    match run_blocking(move || downloads.verify_download(&token, &email)).await {
        Ok(Ok(outcome)) => {
            if outcome == DownloadVerifyOutcome::InProgress {
                info!("Download verification already in progress");
            }
            found(&format!(
                "{}/?download_verified=success",
                state.config.site_url
            ))
        }
        Ok(Err(DownloadError::InvalidLink)) => page(
            &state,
            StatusCode::BAD_REQUEST,
            "Link expired",
            "Verification link has expired or is invalid.",
        ),
        Ok(Err(DownloadError::Mail(e))) => {
            warn!("Download email could not be sent: {}", e);
            page(
                &state,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Email not sent",
                &DownloadError::Mail(e).to_string(),
            )
        }
        Ok(Err(e)) => {
            error!("Download verification failed: {:#}", e);
            page(
                &state,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Something went wrong",
                SERVER_ERROR_MESSAGE,
            )
        }
        Err(status) => page(&state, status, "Something went wrong", SERVER_ERROR_MESSAGE),
    }
}

async fn redeem_download(
    State(state): State<ServerState>,
    Query(query): Query<DownloadQuery>,
) -> Response {
    let (token, email) = match query.into_parts() {
        Some(parts) => parts,
        None => {
            return page(
                &state,
                StatusCode::BAD_REQUEST,
                "Invalid request",
                "Invalid download request.",
            )
        }
    };

    let downloads = state.services.downloads.clone();
    match run_blocking(move || downloads.redeem_download(&token, &email)).await {
        Ok(Ok(file_url)) => found(&file_url),
        Ok(Err(e @ (DownloadError::InvalidLink | DownloadError::InvalidOrUnverifiedLink))) => {
            page(&state, StatusCode::NOT_FOUND, "Link expired", &e.to_string())
        }
        Ok(Err(e)) => {
            error!("Download redeem failed: {:#}", e);
            page(
                &state,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Something went wrong",
                SERVER_ERROR_MESSAGE,
            )
        }
        Err(status) => page(&state, status, "Something went wrong", SERVER_ERROR_MESSAGE),
    }
}

// =============================================================================
// App
// =============================================================================

impl ServerState {
    pub fn new(
        config: ServerConfig,
        newsletter_store: GuardedNewsletterStore,
        server_store: GuardedServerStore,
        services: Services,
        templates: GuardedTemplates,
        clock: std::sync::Arc<dyn crate::clock::Clock>,
        scheduler_handle: OptionalSchedulerHandle,
    ) -> ServerState {
        ServerState {
            config,
            start_time: Instant::now(),
            hash: env!("GIT_HASH").to_owned(),
            newsletter_store,
            server_store,
            services,
            templates,
            clock,
            scheduler_handle,
        }
    }
}

pub fn make_app(state: ServerState) -> Router {
    let public_routes: Router = Router::new()
        .route("/health", get(health))
        .route("/subscribe", post(subscribe))
        .route("/verify", get(verify_subscription))
        .route("/unsubscribe", get(unsubscribe).post(unsubscribe))
        .route("/download", get(redeem_download).post(request_download))
        .route("/download/verify", get(verify_download))
        .with_state(state.clone());

    let mut app = public_routes;
    if state.config.admin_token.is_some() {
        app = app.nest("/v1/admin", admin_routes(state.clone()));
    }

    app.layer(middleware::from_fn_with_state(state, log_requests))
}

pub async fn run_server(state: ServerState, shutdown_token: CancellationToken) -> Result<()> {
    let port = state.config.port;
    let app = make_app(state);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown_token.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
pub(super) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{AppConfig, DownloadFile};
    use crate::mailer::RecordingMailer;
    use crate::newsletter_store::{SqliteNewsletterStore, SubscriberStore};
    use crate::server::RequestsLoggingLevel;
    use crate::server_store::SqliteServerStore;
    use crate::templates::Templates;
    use axum::body::Body;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tower::ServiceExt;

    pub const NOW: i64 = 1_700_000_000;
    pub const ADMIN_TOKEN: &str = "admin-secret-token";

    pub struct TestApp {
        pub app: Router,
        pub store: Arc<SqliteNewsletterStore>,
        pub server_store: Arc<SqliteServerStore>,
        pub mailer: Arc<RecordingMailer>,
    }

    pub fn test_app() -> TestApp {
        let store = Arc::new(SqliteNewsletterStore::in_memory().unwrap());
        let server_store = Arc::new(SqliteServerStore::in_memory().unwrap());
        let mailer = Arc::new(RecordingMailer::new());
        let clock = Arc::new(ManualClock::new(NOW));

        let mut config = AppConfig::with_defaults(PathBuf::from("."), "0123456789abcdef");
        config.site.url = "https://news.example.com".to_string();
        config.admin_token = Some(ADMIN_TOKEN.to_string());
        config.logging_level = RequestsLoggingLevel::None;
        config.downloads.files = vec![DownloadFile {
            post_id: 7,
            block_id: None,
            file_url: "https://files.example.com/guide.pdf".to_string(),
        }];

        let services = Services::new(
            &config,
            store.clone(),
            server_store.clone(),
            mailer.clone(),
            clock.clone(),
            None,
        );
        let state = ServerState::new(
            ServerConfig::from(&config),
            store.clone(),
            server_store.clone(),
            services,
            Arc::new(Templates::new(&config.site)),
            clock,
            None,
        );

        TestApp {
            app: make_app(state),
            store,
            server_store,
            mailer,
        }
    }

    fn form_request(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn location(response: &Response) -> String {
        response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn health_reports_version() {
        let t = test_app();
        let response = t.app.oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn subscribe_accepts_form_and_json() {
        let t = test_app();

        let response = t
            .app
            .clone()
            .oneshot(form_request("/subscribe", "email=Reader%40Example.com"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["success"], true);
        assert!(t.store.get_subscriber("reader@example.com").unwrap().is_some());

        let request = Request::builder()
            .method("POST")
            .uri("/subscribe")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"email":"other@example.com"}"#))
            .unwrap();
        let response = t.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(t.store.get_subscriber("other@example.com").unwrap().is_some());
    }

    #[tokio::test]
    async fn subscribe_rejects_invalid_email() {
        let t = test_app();
        let response = t
            .app
            .oneshot(form_request("/subscribe", "email=not-an-email"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "Invalid email address.");
    }

    #[tokio::test]
    async fn verify_with_bad_token_redirects_invalid() {
        let t = test_app();
        let response = t
            .app
            .oneshot(get_request(
                "/verify?verify_email=reader%40example.com&token=abc",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            location(&response),
            "https://news.example.com/?verified=invalid"
        );
    }

    #[tokio::test]
    async fn unsubscribe_requires_valid_token() {
        let t = test_app();
        t.store
            .add_or_update_subscriber("reader@example.com", Some(true), NOW)
            .unwrap();

        let response = t
            .app
            .clone()
            .oneshot(get_request(
                "/unsubscribe?email=reader%40example.com&token=nope",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(t.store.get_subscriber("reader@example.com").unwrap().is_some());
    }

    #[tokio::test]
    async fn download_request_mails_link_and_redeems() {
        let t = test_app();
        let response = t
            .app
            .clone()
            .oneshot(form_request(
                "/download",
                "EMAIL=reader%40example.com&postId=7&blockId=",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["success"], true);

        let sent = t.mailer.sent_to("reader@example.com");
        assert_eq!(sent.len(), 1);
        let link_start = sent[0].html_body.find("/download?token=").unwrap();
        let rest = &sent[0].html_body[link_start..];
        let link_end = rest.find(|c: char| c == '<' || c.is_whitespace()).unwrap();
        let link = rest[..link_end].replace("&amp;", "&");

        let response = t
            .app
            .oneshot(get_request(&link))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "https://files.example.com/guide.pdf");
    }

    #[tokio::test]
    async fn download_for_unknown_post_is_not_available() {
        let t = test_app();
        let response = t
            .app
            .oneshot(form_request(
                "/download",
                "EMAIL=reader%40example.com&postId=99",
            ))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "Download is not available yet.");
        assert!(t.mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn redeem_with_unknown_token_is_not_found() {
        let t = test_app();
        let response = t
            .app
            .oneshot(get_request(
                "/download?token=missing&email=reader%40example.com",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
