//! Backend adapter contracts + HTTP and fixture-first implementations.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value as JsonValue;
use skillswap_core::{
    join_comma_list, normalize_batch, normalize_raw_user, CatalogRecord, MalformedRecord,
    NormalizedBatch, Registration, SwapRequest, SwapRequestDraft, SwapStatus, UserProfile,
    ValidationError,
};
use skillswap_http::{join_url, FetchError, HttpClientConfig, HttpFetcher};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "skillswap-adapters";

pub const MATCH_PATH: &str = "/match/";
pub const LOGIN_PATH: &str = "/auth/login/";
pub const REGISTER_PATH: &str = "/auth/register";
pub const SWAP_REQUEST_PATH: &str = "/swaps/request";
pub const MY_REQUESTS_PATH: &str = "/swaps/my-requests";

/// Normalized `/match/` response.
pub type MatchBatch = NormalizedBatch;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("rejected by backend: {0}")]
    Rejected(String),
    #[error("validation failed: {}", join_validation(.0))]
    Validation(Vec<ValidationError>),
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

fn join_validation(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoginOutcome {
    pub token: AuthToken,
    pub profile: UserProfile,
}

#[async_trait]
pub trait SkillSwapBackend: Send + Sync {
    fn backend_id(&self) -> &'static str;

    async fn match_users(&self, interested_skills: &[String]) -> Result<MatchBatch, BackendError>;

    async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome, BackendError>;

    async fn register(&self, registration: &Registration) -> Result<UserProfile, BackendError>;

    async fn submit_swap_request(
        &self,
        token: &str,
        draft: &SwapRequestDraft,
    ) -> Result<(), BackendError>;

    /// Every swap request the token's user sent or received.
    async fn my_requests(&self, token: &str) -> Result<Vec<SwapRequest>, BackendError>;
}

#[derive(Serialize)]
struct MatchRequestBody<'a> {
    interested_skills: &'a [String],
}

#[derive(Serialize)]
struct LoginRequestBody<'a> {
    email: &'a str,
    password: &'a str,
}

/// The backend stores availability as one comma-joined column, so the register
/// payload is the only place the list is flattened.
#[derive(Serialize)]
struct RegisterRequestBody<'a> {
    name: &'a str,
    email: &'a str,
    password: &'a str,
    location: &'a str,
    skills_offered: &'a [String],
    skills_wanted: &'a [String],
    #[serde(serialize_with = "serialize_comma_joined")]
    availability: &'a [String],
}

fn serialize_comma_joined<S: Serializer>(items: &&[String], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&join_comma_list(items))
}

#[derive(Serialize)]
struct SwapRequestBody<'a> {
    receiver_id: JsonValue,
    skill_offered: &'a str,
    skill_wanted: &'a str,
    message: &'a str,
}

/// Backend ids are integers; anything non-numeric is sent through as a string.
fn receiver_id_value(id: &str) -> JsonValue {
    match id.parse::<i64>() {
        Ok(n) => JsonValue::from(n),
        Err(_) => JsonValue::from(id),
    }
}

fn log_malformed(backend: &str, malformed: &[MalformedRecord]) {
    for item in malformed {
        warn!(backend, index = item.index, reason = %item.reason, "dropping malformed match record");
    }
}

/// Ids arrive as integers from the backend and as strings from fixtures.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireId {
    Text(String),
    Number(i64),
}

impl From<WireId> for String {
    fn from(id: WireId) -> Self {
        match id {
            WireId::Text(s) => s,
            WireId::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawSwapRequest {
    id: WireId,
    #[serde(alias = "requester_id")]
    from_user_id: WireId,
    #[serde(alias = "receiver_id")]
    to_user_id: WireId,
    #[serde(default)]
    from_name: String,
    #[serde(default)]
    to_name: String,
    skill_offered: String,
    skill_wanted: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

fn parse_status(label: &str) -> Option<SwapStatus> {
    match label.trim().to_ascii_lowercase().as_str() {
        "pending" => Some(SwapStatus::Pending),
        "accepted" => Some(SwapStatus::Accepted),
        "rejected" => Some(SwapStatus::Rejected),
        _ => None,
    }
}

/// Map one swap-request row. The backend has no timestamp column, so rows
/// without `created_at` are stamped with `fetched_at`.
pub fn swap_request_from_raw(raw: &JsonValue, fetched_at: DateTime<Utc>) -> Result<SwapRequest, BackendError> {
    let row: RawSwapRequest = serde_json::from_value(raw.clone())
        .map_err(|err| BackendError::UnexpectedResponse(format!("swap request row: {err}")))?;
    let status = match row.status.as_deref() {
        None => SwapStatus::Pending,
        Some(label) => parse_status(label)
            .ok_or_else(|| BackendError::UnexpectedResponse(format!("unknown swap status `{label}`")))?,
    };
    Ok(SwapRequest {
        id: row.id.into(),
        from_user_id: row.from_user_id.into(),
        to_user_id: row.to_user_id.into(),
        from_name: row.from_name,
        to_name: row.to_name,
        skill_offered: row.skill_offered,
        skill_wanted: row.skill_wanted,
        message: row.message.unwrap_or_default(),
        status,
        created_at: row.created_at.unwrap_or(fetched_at),
    })
}

fn swap_requests_from_rows(backend: &str, rows: &[JsonValue], fetched_at: DateTime<Utc>) -> Vec<SwapRequest> {
    rows.iter()
        .enumerate()
        .filter_map(|(index, raw)| match swap_request_from_raw(raw, fetched_at) {
            Ok(request) => Some(request),
            Err(err) => {
                warn!(backend, index, error = %err, "dropping malformed swap request");
                None
            }
        })
        .collect()
}

/// The `sub` claim of a JWT access token, read without verifying the signature.
/// The backend puts the user id there and exposes it nowhere else.
pub fn token_subject(token: &str) -> Option<String> {
    let payload = token.split('.').nth(1)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: JsonValue = serde_json::from_slice(&bytes).ok()?;
    match claims.get("sub")? {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Build a profile from a backend user row plus the email it was looked up by.
pub fn profile_from_raw(raw: &JsonValue, fallback_email: &str) -> Result<UserProfile, BackendError> {
    let record = normalize_raw_user(0, raw)
        .map_err(|err| BackendError::UnexpectedResponse(err.to_string()))?;
    let email = raw
        .get("email")
        .and_then(JsonValue::as_str)
        .unwrap_or(fallback_email)
        .to_string();
    let bio = raw.get("bio").and_then(JsonValue::as_str).map(ToString::to_string);
    Ok(profile_from_record(record, email, bio))
}

fn profile_from_record(record: CatalogRecord, email: String, bio: Option<String>) -> UserProfile {
    UserProfile {
        id: record.id.unwrap_or_else(|| email.clone()),
        name: record.name,
        email,
        location: record.location,
        profile_photo_url: record.profile_photo_url,
        skills_offered: record.skills_offered,
        skills_wanted: record.skills_wanted,
        availability: record.availability,
        bio,
        is_public: record.is_public,
    }
}

/// Profile used when the backend only hands back a token.
pub fn minimal_profile(email: &str) -> UserProfile {
    let name = email.split('@').next().filter(|s| !s.is_empty()).unwrap_or(email);
    UserProfile::new(email, name, email)
}

#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Talks to the external skill-swap API.
#[derive(Debug)]
pub struct HttpBackend {
    base_url: String,
    http: HttpFetcher,
    profiles: RwLock<HashMap<String, UserProfile>>,
}

impl HttpBackend {
    pub fn new(config: HttpBackendConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.timeout,
            user_agent: config.user_agent.clone(),
            ..Default::default()
        })?;
        Ok(Self::with_fetcher(config.base_url, http))
    }

    pub fn with_fetcher(base_url: impl Into<String>, http: HttpFetcher) -> Self {
        Self {
            base_url: base_url.into(),
            http,
            profiles: RwLock::new(HashMap::new()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }
}

#[async_trait]
impl SkillSwapBackend for HttpBackend {
    fn backend_id(&self) -> &'static str {
        "http"
    }

    async fn match_users(&self, interested_skills: &[String]) -> Result<MatchBatch, BackendError> {
        let url = self.url(MATCH_PATH);
        let span = info_span!("match_users", tags = interested_skills.len());
        async {
            let resp = self
                .http
                .post_json(&url, &MatchRequestBody { interested_skills }, None)
                .await?;
            let items: Vec<JsonValue> = resp.json()?;
            let batch = normalize_batch(&items);
            log_malformed(self.backend_id(), &batch.malformed);
            info!(records = batch.records.len(), dropped = batch.malformed.len(), "match batch received");
            Ok::<_, BackendError>(batch)
        }
        .instrument(span)
        .await
    }

    async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome, BackendError> {
        let url = self.url(LOGIN_PATH);
        let resp = self
            .http
            .post_json_once(&url, &LoginRequestBody { email, password }, None)
            .instrument(info_span!("login"))
            .await;
        let resp = match resp {
            Ok(resp) => resp,
            Err(err) if matches!(err.status(), Some(400 | 401 | 403)) => {
                return Err(BackendError::InvalidCredentials)
            }
            Err(err) => return Err(err.into()),
        };
        let token: AuthToken = resp.json()?;
        let mut profile = self
            .profiles
            .read()
            .await
            .get(email)
            .cloned()
            .unwrap_or_else(|| minimal_profile(email));
        if let Some(subject) = token_subject(&token.access_token) {
            profile.id = subject;
        }
        Ok(LoginOutcome { token, profile })
    }

    async fn register(&self, registration: &Registration) -> Result<UserProfile, BackendError> {
        registration.validate().map_err(BackendError::Validation)?;

        let url = self.url(REGISTER_PATH);
        let body = RegisterRequestBody {
            name: registration.name.trim(),
            email: registration.email.trim(),
            password: &registration.password,
            location: registration.location.trim(),
            skills_offered: &registration.skills_offered,
            skills_wanted: &registration.skills_wanted,
            availability: &registration.availability,
        };
        let resp = match self
            .http
            .post_json_once(&url, &body, None)
            .instrument(info_span!("register"))
            .await
        {
            Ok(resp) => resp,
            Err(FetchError::HttpStatus { status: 400, body, .. }) => {
                return Err(BackendError::Rejected(detail_message(&body)))
            }
            Err(err) => return Err(err.into()),
        };
        let raw: JsonValue = resp.json()?;
        let profile = profile_from_raw(&raw, body.email)?;
        self.profiles
            .write()
            .await
            .insert(profile.email.clone(), profile.clone());
        Ok(profile)
    }

    async fn submit_swap_request(
        &self,
        token: &str,
        draft: &SwapRequestDraft,
    ) -> Result<(), BackendError> {
        let url = self.url(SWAP_REQUEST_PATH);
        let body = SwapRequestBody {
            receiver_id: receiver_id_value(&draft.receiver_id),
            skill_offered: &draft.skill_offered,
            skill_wanted: &draft.skill_wanted,
            message: draft.message.trim(),
        };
        match self
            .http
            .post_json_once(&url, &body, Some(token))
            .instrument(info_span!("submit_swap_request", receiver = %draft.receiver_id))
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.status() == Some(401) => Err(BackendError::InvalidCredentials),
            Err(err) => Err(err.into()),
        }
    }

    async fn my_requests(&self, token: &str) -> Result<Vec<SwapRequest>, BackendError> {
        let url = self.url(MY_REQUESTS_PATH);
        let resp = match self
            .http
            .get_json(&url, Some(token))
            .instrument(info_span!("my_requests"))
            .await
        {
            Ok(resp) => resp,
            Err(err) if err.status() == Some(401) => return Err(BackendError::InvalidCredentials),
            Err(err) => return Err(err.into()),
        };
        let rows: Vec<JsonValue> = resp.json()?;
        let requests = swap_requests_from_rows(self.backend_id(), &rows, Utc::now());
        info!(requests = requests.len(), "swap requests received");
        Ok(requests)
    }
}

/// Pulls `detail` out of a FastAPI-style error body, falling back to the raw text.
fn detail_message(body: &str) -> String {
    serde_json::from_str::<JsonValue>(body)
        .ok()
        .and_then(|v| v.get("detail").and_then(JsonValue::as_str).map(ToString::to_string))
        .unwrap_or_else(|| body.to_string())
}

/// Demo dataset: the signed-in persona plus the users the match endpoint returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureDataset {
    pub current_user: UserProfile,
    pub users: Vec<JsonValue>,
}

pub fn load_fixture_dataset(path: impl AsRef<Path>) -> Result<FixtureDataset> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

pub fn load_fixture_requests(path: impl AsRef<Path>) -> Result<Vec<SwapRequest>> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let rows: Vec<JsonValue> =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    Ok(swap_requests_from_rows("fixture", &rows, Utc::now()))
}

const FIXTURE_TOKEN_PREFIX: &str = "fixture-token:";

/// Offline backend over a fixture file.
#[derive(Debug)]
pub struct FixtureBackend {
    dataset: FixtureDataset,
    registered: RwLock<Vec<UserProfile>>,
    requests: RwLock<Vec<SwapRequest>>,
}

impl FixtureBackend {
    pub fn new(dataset: FixtureDataset) -> Self {
        Self {
            dataset,
            registered: RwLock::new(Vec::new()),
            requests: RwLock::new(Vec::new()),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_fixture_dataset(path)?))
    }

    /// Seed the swap requests `my_requests` serves.
    pub fn with_requests(mut self, requests: Vec<SwapRequest>) -> Self {
        self.requests = RwLock::new(requests);
        self
    }

    pub fn dataset(&self) -> &FixtureDataset {
        &self.dataset
    }

    fn fixture_user_by_email(&self, email: &str) -> Option<&JsonValue> {
        self.dataset
            .users
            .iter()
            .find(|u| u.get("email").and_then(JsonValue::as_str) == Some(email))
    }

    /// Registered users first, then fixture users; anyone else signs in as
    /// the demo persona under their own email.
    async fn profile_for_email(&self, email: &str) -> Result<UserProfile, BackendError> {
        if let Some(profile) = self.registered.read().await.iter().find(|p| p.email == email) {
            return Ok(profile.clone());
        }
        match self.fixture_user_by_email(email) {
            Some(raw) => profile_from_raw(raw, email),
            None => Ok(UserProfile {
                email: email.to_string(),
                ..self.dataset.current_user.clone()
            }),
        }
    }

    async fn profile_for_token(&self, token: &str) -> Result<UserProfile, BackendError> {
        match token.strip_prefix(FIXTURE_TOKEN_PREFIX) {
            Some(email) if !email.is_empty() => self.profile_for_email(email).await,
            _ => Err(BackendError::InvalidCredentials),
        }
    }

    fn record_by_id(&self, id: &str) -> Option<CatalogRecord> {
        normalize_batch(&self.dataset.users)
            .records
            .into_iter()
            .find(|r| r.id.as_deref() == Some(id))
    }
}

#[async_trait]
impl SkillSwapBackend for FixtureBackend {
    fn backend_id(&self) -> &'static str {
        "fixture"
    }

    /// Returns every fixture user; tag matching is the server's job.
    async fn match_users(&self, _interested_skills: &[String]) -> Result<MatchBatch, BackendError> {
        let batch = normalize_batch(&self.dataset.users);
        log_malformed(self.backend_id(), &batch.malformed);
        Ok(batch)
    }

    async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome, BackendError> {
        let email = email.trim();
        if email.is_empty() || password.is_empty() {
            return Err(BackendError::InvalidCredentials);
        }
        let token = AuthToken {
            access_token: format!("{FIXTURE_TOKEN_PREFIX}{email}"),
            token_type: default_token_type(),
        };
        let profile = self.profile_for_email(email).await?;
        Ok(LoginOutcome { token, profile })
    }

    async fn register(&self, registration: &Registration) -> Result<UserProfile, BackendError> {
        registration.validate().map_err(BackendError::Validation)?;
        let email = registration.email.trim();
        let mut registered = self.registered.write().await;
        if self.fixture_user_by_email(email).is_some() || registered.iter().any(|p| p.email == email) {
            return Err(BackendError::Rejected("Email already registered".to_string()));
        }
        let location = registration.location.trim();
        let profile = UserProfile {
            location: (!location.is_empty()).then(|| location.to_string()),
            skills_offered: registration.skills_offered.clone(),
            skills_wanted: registration.skills_wanted.clone(),
            availability: registration.availability.clone(),
            ..UserProfile::new(
                format!("fixture-{}", self.dataset.users.len() + registered.len() + 1),
                registration.name.trim(),
                email,
            )
        };
        registered.push(profile.clone());
        Ok(profile)
    }

    async fn submit_swap_request(
        &self,
        token: &str,
        draft: &SwapRequestDraft,
    ) -> Result<(), BackendError> {
        let requester = self.profile_for_token(token).await?;
        let target = self
            .record_by_id(&draft.receiver_id)
            .ok_or_else(|| BackendError::Rejected("Receiver not found".to_string()))?;
        let request = SwapRequest::pending_from_draft(&requester, &target, draft, Utc::now());
        info!(receiver = %draft.receiver_id, id = %request.id, "fixture swap request stored");
        self.requests.write().await.push(request);
        Ok(())
    }

    async fn my_requests(&self, token: &str) -> Result<Vec<SwapRequest>, BackendError> {
        let user = self.profile_for_token(token).await?;
        Ok(self
            .requests
            .read()
            .await
            .iter()
            .filter(|r| r.from_user_id == user.id || r.to_user_id == user.id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use axum::{
        http::{HeaderMap, StatusCode},
        routing::{get, post},
        Json, Router,
    };
    use base64::Engine as _;
    use serde_json::json;
    use skillswap_http::BackoffPolicy;
    use tokio::net::TcpListener;

    fn workspace_fixture() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/users.json")
    }

    async fn match_handler(Json(body): Json<JsonValue>) -> Json<JsonValue> {
        assert_eq!(body, json!({"interested_skills": ["js"]}));
        Json(json!([
            {"id": 1, "name": "Sarah Chen", "skills_offered": ["React", "TypeScript"], "score": 0.91},
            {"id": 2, "skills_offered": ["Photography"], "score": 0.7},
            {"id": 3, "name": "Elena", "skills_offered": ["Spanish"], "score": 0.6}
        ]))
    }

    async fn login_handler(Json(body): Json<JsonValue>) -> (StatusCode, Json<JsonValue>) {
        if body["password"] == "right-pass" {
            (StatusCode::OK, Json(json!({"access_token": "jwt.abc", "token_type": "bearer"})))
        } else if body["password"] == "signed-pass" {
            (StatusCode::OK, Json(json!({"access_token": jwt_with_subject("7"), "token_type": "bearer"})))
        } else {
            (StatusCode::UNAUTHORIZED, Json(json!({"detail": "Invalid credentials"})))
        }
    }

    async fn register_handler(Json(body): Json<JsonValue>) -> (StatusCode, Json<JsonValue>) {
        if body["email"] == "taken@example.com" {
            return (StatusCode::BAD_REQUEST, Json(json!({"detail": "Email already registered"})));
        }
        assert!(body["availability"].is_string());
        assert!(body["skills_offered"].is_array());
        (
            StatusCode::OK,
            Json(json!({
                "id": 42,
                "name": body["name"],
                "email": body["email"],
                "location": body["location"],
                "is_public": true,
                "availability": body["availability"],
                "skills_offered": body["skills_offered"].as_array().unwrap().iter()
                    .map(|v| v.as_str().unwrap().to_string()).collect::<Vec<_>>().join(", "),
                "skills_wanted": "Spanish"
            })),
        )
    }

    async fn swap_handler(headers: HeaderMap, Json(body): Json<JsonValue>) -> StatusCode {
        if bearer(&headers) != "Bearer jwt.abc" {
            return StatusCode::UNAUTHORIZED;
        }
        assert_eq!(body["receiver_id"], json!(1));
        StatusCode::OK
    }

    fn bearer(headers: &HeaderMap) -> &str {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    }

    async fn my_requests_handler(headers: HeaderMap) -> (StatusCode, Json<JsonValue>) {
        if bearer(&headers) != "Bearer jwt.abc" {
            return (StatusCode::UNAUTHORIZED, Json(json!({"detail": "Could not validate credentials"})));
        }
        (
            StatusCode::OK,
            Json(json!([
                {"id": 11, "requester_id": 7, "receiver_id": 1, "skill_offered": "Guitar",
                 "skill_wanted": "React", "message": "hi", "status": "Pending"},
                {"id": 12, "requester_id": 2, "receiver_id": 7, "skill_offered": "Photography",
                 "skill_wanted": "Guitar", "message": null, "status": "Accepted"},
                {"id": 13, "requester_id": 3, "receiver_id": 7, "status": "Pending"}
            ])),
        )
    }

    fn jwt_with_subject(sub: &str) -> String {
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(&json!({"sub": sub, "exp": 1_900_000_000})).unwrap());
        format!("eyJhbGciOiJIUzI1NiJ9.{payload}.sig")
    }

    async fn spawn_stub_backend() -> HttpBackend {
        let app = Router::new()
            .route(MATCH_PATH, post(match_handler))
            .route(LOGIN_PATH, post(login_handler))
            .route(REGISTER_PATH, post(register_handler))
            .route(SWAP_REQUEST_PATH, post(swap_handler))
            .route(MY_REQUESTS_PATH, get(my_requests_handler));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            backoff: BackoffPolicy {
                max_retries: 0,
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
        HttpBackend::with_fetcher(format!("http://{addr}"), http)
    }

    fn registration(email: &str) -> Registration {
        Registration {
            name: "Jo".into(),
            email: email.into(),
            password: "secret1".into(),
            confirm_password: "secret1".into(),
            location: "Austin, TX".into(),
            skills_offered: vec!["Guitar".into(), "Cooking".into()],
            skills_wanted: vec!["Spanish".into()],
            availability: vec!["Weekends".into(), "Evenings".into()],
        }
    }

    #[tokio::test]
    async fn http_match_normalizes_and_drops_malformed_rows() {
        let backend = spawn_stub_backend().await;
        let batch = backend.match_users(&["js".to_string()]).await.unwrap();
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.records[0].id.as_deref(), Some("1"));
        assert_eq!(batch.records[0].score, Some(0.91));
        assert!(batch.records[0].availability.is_empty());
        assert_eq!(batch.records[1].name, "Elena");
        assert_eq!(batch.malformed.len(), 1);
        assert_eq!(batch.malformed[0].index, 1);
    }

    #[tokio::test]
    async fn http_login_maps_unauthorized_to_invalid_credentials() {
        let backend = spawn_stub_backend().await;
        let err = backend.login("jo@example.com", "wrong").await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidCredentials));

        let ok = backend.login("jo@example.com", "right-pass").await.unwrap();
        assert_eq!(ok.token.access_token, "jwt.abc");
        assert_eq!(ok.profile.name, "jo");
    }

    #[tokio::test]
    async fn http_register_flattens_availability_and_remembers_profile() {
        let backend = spawn_stub_backend().await;
        let profile = backend.register(&registration("jo@example.com")).await.unwrap();
        assert_eq!(profile.id, "42");
        assert_eq!(profile.availability, vec!["Weekends", "Evenings"]);
        assert_eq!(profile.skills_offered, vec!["Guitar", "Cooking"]);

        let login = backend.login("jo@example.com", "right-pass").await.unwrap();
        assert_eq!(login.profile, profile);

        let err = backend.register(&registration("taken@example.com")).await.unwrap_err();
        match err {
            BackendError::Rejected(msg) => assert_eq!(msg, "Email already registered"),
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn http_register_validates_before_sending() {
        let backend = spawn_stub_backend().await;
        let mut bad = registration("jo@example.com");
        bad.availability.clear();
        let err = backend.register(&bad).await.unwrap_err();
        assert!(matches!(err, BackendError::Validation(ref e) if e.len() == 1));
    }

    #[tokio::test]
    async fn http_swap_request_sends_bearer_token() {
        let backend = spawn_stub_backend().await;
        let draft = SwapRequestDraft {
            receiver_id: "1".into(),
            skill_offered: "Guitar".into(),
            skill_wanted: "React".into(),
            message: "hi".into(),
        };
        backend.submit_swap_request("jwt.abc", &draft).await.unwrap();
        let err = backend.submit_swap_request("stale", &draft).await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidCredentials));
    }

    #[tokio::test]
    async fn http_login_takes_user_id_from_token_subject() {
        let backend = spawn_stub_backend().await;
        let login = backend.login("jo@example.com", "signed-pass").await.unwrap();
        assert_eq!(login.profile.id, "7");
        assert_eq!(login.profile.email, "jo@example.com");

        assert_eq!(token_subject("jwt.abc"), None);
        assert_eq!(token_subject("not-a-jwt"), None);
    }

    #[tokio::test]
    async fn http_my_requests_maps_rows_and_requires_token() {
        let backend = spawn_stub_backend().await;
        let requests = backend.my_requests("jwt.abc").await.unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].id, "11");
        assert_eq!(requests[0].from_user_id, "7");
        assert_eq!(requests[0].to_user_id, "1");
        assert_eq!(requests[0].status, SwapStatus::Pending);
        assert_eq!(requests[1].status, SwapStatus::Accepted);
        assert_eq!(requests[1].message, "");
        assert!(requests[1].from_name.is_empty());

        let err = backend.my_requests("stale").await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidCredentials));
    }

    #[test]
    fn swap_rows_reject_unknown_status() {
        let now = Utc::now();
        let err = swap_request_from_raw(
            &json!({"id": 1, "requester_id": 1, "receiver_id": 2, "skill_offered": "a",
                    "skill_wanted": "b", "status": "Withdrawn"}),
            now,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Withdrawn"));

        let row = swap_request_from_raw(
            &json!({"id": "req9", "from_user_id": "current", "to_user_id": "1", "skill_offered": "a",
                    "skill_wanted": "b", "status": "rejected", "created_at": "2023-11-15T10:30:00Z"}),
            now,
        )
        .unwrap();
        assert_eq!(row.status, SwapStatus::Rejected);
        assert_eq!(row.created_at.to_rfc3339(), "2023-11-15T10:30:00+00:00");
    }

    #[test]
    fn receiver_ids_prefer_numbers() {
        assert_eq!(receiver_id_value("12"), json!(12));
        assert_eq!(receiver_id_value("u-12"), json!("u-12"));
    }

    #[test]
    fn detail_message_extracts_fastapi_detail() {
        assert_eq!(detail_message(r#"{"detail":"nope"}"#), "nope");
        assert_eq!(detail_message("plain"), "plain");
    }

    #[tokio::test]
    async fn workspace_fixture_loads_and_matches() {
        let backend = FixtureBackend::from_path(workspace_fixture()).expect("fixture loads");
        let batch = backend.match_users(&[]).await.unwrap();
        assert_eq!(batch.records.len(), 5);
        assert!(batch.malformed.is_empty());
        assert_eq!(backend.dataset().current_user.id, "current");
    }

    #[tokio::test]
    async fn fixture_login_and_register() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        fs::write(
            &path,
            serde_json::to_string(&json!({
                "current_user": {"id": "current", "name": "John Doe", "email": "john@example.com"},
                "users": [{"id": "1", "name": "Sarah", "email": "sarah@example.com", "skills_offered": ["React"]}]
            }))
            .unwrap(),
        )
        .unwrap();
        let backend = FixtureBackend::from_path(&path).unwrap();

        assert!(matches!(
            backend.login("", "x").await.unwrap_err(),
            BackendError::InvalidCredentials
        ));

        let sarah = backend.login("sarah@example.com", "pw").await.unwrap();
        assert_eq!(sarah.profile.id, "1");
        assert_eq!(sarah.profile.skills_offered, vec!["React"]);

        let demo = backend.login("demo@example.com", "demo123").await.unwrap();
        assert_eq!(demo.profile.id, "current");
        assert_eq!(demo.profile.email, "demo@example.com");

        let created = backend.register(&registration("jo@example.com")).await.unwrap();
        assert_eq!(created.location.as_deref(), Some("Austin, TX"));
        let again = backend.register(&registration("jo@example.com")).await.unwrap_err();
        assert!(matches!(again, BackendError::Rejected(_)));
        let login = backend.login("jo@example.com", "secret1").await.unwrap();
        assert_eq!(login.profile, created);
    }

    #[tokio::test]
    async fn fixture_requests_follow_the_token_user() {
        let requests = load_fixture_requests(
            Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/requests.json"),
        )
        .unwrap();
        let seeded = requests.len();
        let backend = FixtureBackend::from_path(workspace_fixture())
            .unwrap()
            .with_requests(requests);

        let demo = backend.login("demo@example.com", "demo123").await.unwrap();
        let mine = backend.my_requests(&demo.token.access_token).await.unwrap();
        assert_eq!(mine.len(), seeded);
        assert!(mine.iter().all(|r| r.from_user_id == "current" || r.to_user_id == "current"));

        assert!(matches!(
            backend.my_requests("jwt.abc").await.unwrap_err(),
            BackendError::InvalidCredentials
        ));

        let draft = SwapRequestDraft {
            receiver_id: "1".into(),
            skill_offered: "Guitar".into(),
            skill_wanted: "React".into(),
            message: " see you ".into(),
        };
        backend.submit_swap_request(&demo.token.access_token, &draft).await.unwrap();
        let mine = backend.my_requests(&demo.token.access_token).await.unwrap();
        assert_eq!(mine.len(), seeded + 1);
        let stored = mine.last().unwrap();
        assert_eq!(stored.to_name, "Sarah Chen");
        assert_eq!(stored.message, "see you");
        assert_eq!(stored.status, SwapStatus::Pending);

        let sarah = backend.login("sarah@example.com", "pw").await.unwrap();
        let received = backend.my_requests(&sarah.token.access_token).await.unwrap();
        assert!(received.iter().any(|r| r.id == stored.id));

        let unknown = SwapRequestDraft {
            receiver_id: "nobody".into(),
            ..draft
        };
        assert!(matches!(
            backend.submit_swap_request(&demo.token.access_token, &unknown).await.unwrap_err(),
            BackendError::Rejected(_)
        ));
    }
}
