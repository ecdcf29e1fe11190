//! Axum JSON surface over the catalog controller.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use skillswap_adapters::{BackendError, SkillSwapBackend};
use skillswap_catalog::{
    build_backend, load_catalog_config, sign_in, sign_up, AdminStats, CatalogConfig, CatalogController,
    CatalogError, CatalogPhase, CatalogView, ClientConfig, FetchOutcome, FetchTrigger, Inbox, Notice,
    NoticeLevel, RequestBook,
};
use skillswap_core::{Registration, Session, SkillKind, SwapRequest, SwapRequestDraft, UserProfile, ValidationError};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "skillswap-web";

/// Shared server state. The controller lock is only ever held for synchronous
/// controller calls, never across a backend request.
pub struct AppState {
    controller: Mutex<CatalogController>,
    /// Signed-in clients keyed by the session id handed out at login.
    sessions: RwLock<HashMap<String, Session>>,
    backend: Arc<dyn SkillSwapBackend>,
    config: CatalogConfig,
}

/// Session id from `Authorization: Bearer <id>`.
fn session_id(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|id| !id.is_empty())
}

impl AppState {
    pub fn new(backend: Arc<dyn SkillSwapBackend>, config: CatalogConfig, requests: RequestBook) -> Self {
        Self {
            controller: Mutex::new(CatalogController::new(config.clone()).with_requests(requests)),
            sessions: RwLock::new(HashMap::new()),
            backend,
            config,
        }
    }

    /// Unknown or missing ids resolve to an anonymous session.
    async fn session_for(&self, headers: &HeaderMap) -> Session {
        let Some(id) = session_id(headers) else {
            return Session::anonymous();
        };
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .unwrap_or_else(Session::anonymous)
    }

    async fn open_session(&self, session: Session) -> String {
        let id = Uuid::new_v4().to_string();
        self.sessions.write().await.insert(id.clone(), session);
        let sessions = self.sessions.read().await.len();
        debug!(sessions, "session opened");
        id
    }

    async fn close_session(&self, headers: &HeaderMap) {
        if let Some(id) = session_id(headers) {
            self.sessions.write().await.remove(id);
        }
    }

    async fn edit_profile<F>(&self, headers: &HeaderMap, edit: F) -> Result<Session, ApiError>
    where
        F: FnOnce(UserProfile) -> Result<UserProfile, ApiError>,
    {
        let id = session_id(headers).ok_or(CatalogError::AuthRequired)?;
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(id).ok_or(CatalogError::AuthRequired)?;
        let current = session.user().cloned().ok_or(CatalogError::AuthRequired)?;
        *session = session.with_profile(edit(current)?);
        Ok(session.clone())
    }

    /// Pull the user's requests from the backend; the local book stays as it
    /// is when the backend cannot be reached.
    async fn refresh_requests(&self, session: &Session) {
        let Some(token) = session.token() else {
            return;
        };
        let remote = self
            .backend
            .my_requests(token)
            .instrument(info_span!("requests_refresh", backend = self.backend.backend_id()))
            .await;
        match remote {
            Ok(remote) => {
                if let Err(err) = self.controller.lock().await.sync_requests(session, remote) {
                    warn!(error = %err, "swap request sync skipped");
                }
            }
            Err(err) => warn!(error = %err, "swap request refresh failed, serving local requests"),
        }
    }

    /// begin under the lock, fetch unlocked, complete under the lock
    pub async fn refetch(&self, trigger: FetchTrigger) -> FetchOutcome {
        let (ticket, tags) = {
            let mut controller = self.controller.lock().await;
            (controller.begin_fetch(trigger), controller.interest_tags().to_vec())
        };
        let result = self
            .backend
            .match_users(&tags)
            .instrument(info_span!("catalog_fetch", seq = ticket.seq(), backend = self.backend.backend_id()))
            .await;
        self.controller.lock().await.complete_fetch(ticket, result)
    }

    async fn notify(&self, level: NoticeLevel, message: &str) {
        self.controller.lock().await.notify(level, message);
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/catalog", get(catalog_handler))
        .route("/catalog/search", post(search_handler))
        .route("/catalog/page", post(page_handler))
        .route("/session", get(session_handler))
        .route("/session/login", post(login_handler))
        .route("/session/register", post(register_handler))
        .route("/session/logout", post(logout_handler))
        .route("/session/profile", put(profile_handler))
        .route("/session/profile/skills", post(add_skill_handler))
        .route("/session/profile/skills/{kind}/{index}", delete(remove_skill_handler))
        .route("/swaps", get(inbox_handler).post(send_swap_handler))
        .route("/swaps/{id}", delete(delete_swap_handler))
        .route("/swaps/{id}/accept", post(accept_swap_handler))
        .route("/swaps/{id}/reject", post(reject_swap_handler))
        .route("/admin/stats", get(admin_stats_handler))
        .route("/notices", get(notices_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let client = ClientConfig::from_env();
    serve(&client, client.web_port).await
}

pub async fn serve(client: &ClientConfig, port: u16) -> anyhow::Result<()> {
    let config = load_catalog_config(&client.catalog_config_path)?;
    let backend = build_backend(client)?;
    let requests = match &client.requests_fixture_path {
        Some(path) => RequestBook::from_path(path)?,
        None => RequestBook::default(),
    };
    let state = AppState::new(backend, config, requests);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving skill swap catalog");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<ValidationError>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ApiErrorBody,
}

impl ApiError {
    fn invalid(errors: Vec<ValidationError>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            body: ApiErrorBody {
                error: "validation failed".to_string(),
                errors,
            },
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            body: ApiErrorBody {
                error: message.into(),
                errors: Vec::new(),
            },
        }
    }
}

impl From<CatalogError> for ApiError {
    fn from(err: CatalogError) -> Self {
        let status = match &err {
            CatalogError::AuthRequired => StatusCode::UNAUTHORIZED,
            CatalogError::Forbidden => StatusCode::FORBIDDEN,
            CatalogError::ValidationFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CatalogError::UnknownRecord(_) | CatalogError::UnknownRequest(_) => StatusCode::NOT_FOUND,
            CatalogError::InvalidTransition { .. } => StatusCode::CONFLICT,
            CatalogError::Backend(BackendError::InvalidCredentials) => StatusCode::UNAUTHORIZED,
            CatalogError::Backend(BackendError::Rejected(_)) => StatusCode::CONFLICT,
            CatalogError::Backend(_) => StatusCode::BAD_GATEWAY,
        };
        if status.is_server_error() {
            warn!(error = %err, "backend failure");
        }
        let error = err.to_string();
        let errors = match err {
            CatalogError::ValidationFailed(errors) => errors,
            _ => Vec::new(),
        };
        Self {
            status,
            body: ApiErrorBody { error, errors },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
struct CatalogParams {
    search: Option<String>,
    availability: Option<String>,
}

fn apply_criteria(controller: &mut CatalogController, params: CatalogParams) {
    if let Some(term) = params.search {
        controller.set_search_term(term);
    }
    if let Some(availability) = params.availability {
        controller.set_availability_filter(availability);
    }
}

async fn catalog_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<CatalogParams>,
) -> Json<CatalogView> {
    let idle = state.controller.lock().await.phase() == CatalogPhase::Idle;
    if idle {
        state.refetch(FetchTrigger::Mount).await;
    }
    let session = state.session_for(&headers).await;
    let mut controller = state.controller.lock().await;
    apply_criteria(&mut controller, params);
    Json(controller.view(&session))
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(params): Json<CatalogParams>,
) -> Json<CatalogView> {
    apply_criteria(&mut *state.controller.lock().await, params);
    state.refetch(FetchTrigger::Search).await;
    let session = state.session_for(&headers).await;
    let view = state.controller.lock().await.view(&session);
    Json(view)
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum PageAction {
    Previous,
    Next,
    Select,
}

#[derive(Debug, Deserialize)]
struct PageCommand {
    action: PageAction,
    page: Option<usize>,
}

async fn page_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(command): Json<PageCommand>,
) -> Result<Json<CatalogView>, ApiError> {
    let session = state.session_for(&headers).await;
    let mut controller = state.controller.lock().await;
    match (command.action, command.page) {
        (PageAction::Previous, _) => controller.previous_page(),
        (PageAction::Next, _) => controller.next_page(),
        (PageAction::Select, Some(page)) => controller.select_page(page),
        (PageAction::Select, None) => {
            return Err(ApiError::invalid(vec![ValidationError::new(
                "page",
                "page is required for select",
            )]))
        }
    }
    Ok(Json(controller.view(&session)))
}

async fn session_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Json<Session> {
    Json(state.session_for(&headers).await)
}

#[derive(Debug, Deserialize)]
struct LoginForm {
    email: String,
    password: String,
}

/// Returned by login and register; clients send `session_id` back as a bearer token.
#[derive(Debug, Serialize)]
struct SignedIn {
    session_id: String,
    session: Session,
}

fn login_failure_message(err: &CatalogError) -> String {
    match err {
        CatalogError::Backend(BackendError::InvalidCredentials) => "Invalid email or password".to_string(),
        CatalogError::ValidationFailed(errors) => errors
            .first()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "Please enter email and password".to_string()),
        _ => "Login failed, please try again later".to_string(),
    }
}

async fn login_handler(
    State(state): State<Arc<AppState>>,
    Json(form): Json<LoginForm>,
) -> Result<Json<SignedIn>, ApiError> {
    match sign_in(&*state.backend, &state.config, &form.email, &form.password).await {
        Ok(session) => {
            state.refresh_requests(&session).await;
            let session_id = state.open_session(session.clone()).await;
            state.notify(NoticeLevel::Success, "Login successful!").await;
            Ok(Json(SignedIn { session_id, session }))
        }
        Err(err) => {
            state.notify(NoticeLevel::Error, &login_failure_message(&err)).await;
            Err(err.into())
        }
    }
}

async fn register_handler(
    State(state): State<Arc<AppState>>,
    Json(registration): Json<Registration>,
) -> Result<(StatusCode, Json<SignedIn>), ApiError> {
    match sign_up(&*state.backend, &state.config, &registration).await {
        Ok(session) => {
            state.refresh_requests(&session).await;
            let session_id = state.open_session(session.clone()).await;
            state.notify(NoticeLevel::Success, "Registration successful!").await;
            Ok((StatusCode::CREATED, Json(SignedIn { session_id, session })))
        }
        Err(err) => {
            if let CatalogError::Backend(BackendError::Rejected(reason)) = &err {
                state.notify(NoticeLevel::Error, reason).await;
            }
            Err(err.into())
        }
    }
}

async fn logout_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Json<Session> {
    state.close_session(&headers).await;
    Json(Session::anonymous())
}

#[derive(Debug, Deserialize)]
struct ProfileEdit {
    name: String,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    bio: Option<String>,
    #[serde(default)]
    availability: Vec<String>,
    #[serde(default = "default_true")]
    is_public: bool,
}

fn default_true() -> bool {
    true
}

async fn profile_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(edit): Json<ProfileEdit>,
) -> Result<Json<Session>, ApiError> {
    let session = state
        .edit_profile(&headers, |current| {
            let profile = UserProfile {
                name: edit.name.trim().to_string(),
                location: edit.location,
                bio: edit.bio,
                availability: edit.availability,
                is_public: edit.is_public,
                ..current
            };
            profile.validate().map_err(ApiError::invalid)?;
            Ok(profile)
        })
        .await?;
    Ok(Json(session))
}

#[derive(Debug, Deserialize)]
struct SkillEdit {
    kind: SkillKind,
    skill: String,
}

async fn add_skill_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(edit): Json<SkillEdit>,
) -> Result<Json<Session>, ApiError> {
    let session = state
        .edit_profile(&headers, |mut profile| {
            if !profile.add_skill(edit.kind, &edit.skill) {
                return Err(ApiError::invalid(vec![ValidationError::new(
                    "skill",
                    "Skill is empty or already listed",
                )]));
            }
            Ok(profile)
        })
        .await?;
    Ok(Json(session))
}

async fn remove_skill_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath((kind, index)): AxumPath<(SkillKind, usize)>,
) -> Result<Json<Session>, ApiError> {
    let session = state
        .edit_profile(&headers, |mut profile| {
            if profile.remove_skill(kind, index).is_none() {
                return Err(ApiError::not_found(format!("no skill at index {index}")));
            }
            Ok(profile)
        })
        .await?;
    Ok(Json(session))
}

#[derive(Debug, Deserialize)]
struct SwapForm {
    key: String,
    #[serde(default)]
    skill_offered: String,
    #[serde(default)]
    skill_wanted: String,
    #[serde(default)]
    message: String,
}

async fn send_swap_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(form): Json<SwapForm>,
) -> Result<(StatusCode, Json<SwapRequest>), ApiError> {
    let session = state.session_for(&headers).await;
    let draft = SwapRequestDraft {
        receiver_id: String::new(),
        skill_offered: form.skill_offered,
        skill_wanted: form.skill_wanted,
        message: form.message,
    };
    let prepared = state
        .controller
        .lock()
        .await
        .prepare_swap_request(&session, &form.key, draft)?;
    let result = state
        .backend
        .submit_swap_request(&prepared.token, &prepared.draft)
        .await;
    let request = state.controller.lock().await.finish_swap_request(prepared, result)?;
    Ok((StatusCode::CREATED, Json(request)))
}

async fn inbox_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Result<Json<Inbox>, ApiError> {
    let session = state.session_for(&headers).await;
    if !session.is_logged_in() {
        return Err(CatalogError::AuthRequired.into());
    }
    state.refresh_requests(&session).await;
    let inbox = state.controller.lock().await.inbox(&session)?;
    Ok(Json(inbox))
}

async fn accept_swap_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<SwapRequest>, ApiError> {
    respond(&state, &headers, &id, true).await
}

async fn reject_swap_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<SwapRequest>, ApiError> {
    respond(&state, &headers, &id, false).await
}

async fn respond(
    state: &AppState,
    headers: &HeaderMap,
    id: &str,
    accept: bool,
) -> Result<Json<SwapRequest>, ApiError> {
    let session = state.session_for(headers).await;
    let updated = state
        .controller
        .lock()
        .await
        .respond_to_request(&session, id, accept)?;
    Ok(Json(updated))
}

async fn delete_swap_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<SwapRequest>, ApiError> {
    let session = state.session_for(&headers).await;
    let removed = state.controller.lock().await.delete_request(&session, &id)?;
    Ok(Json(removed))
}

async fn admin_stats_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<AdminStats>, ApiError> {
    let session = state.session_for(&headers).await;
    let stats = state.controller.lock().await.admin_stats(&session)?;
    Ok(Json(stats))
}

async fn notices_handler(State(state): State<Arc<AppState>>) -> Json<Vec<Notice>> {
    Json(state.controller.lock().await.drain_notices())
}
