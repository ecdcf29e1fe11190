//! Catalog controller: fetch, filter and paginate the swap-partner catalog, plus the
//! swap-request inbox and admin aggregates that hang off it.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use skillswap_adapters::{
    load_fixture_requests, BackendError, FixtureBackend, HttpBackend, HttpBackendConfig, MatchBatch,
    SkillSwapBackend,
};
use skillswap_core::{
    CatalogQuery, CatalogRecord, Paginator, QueryState, Registration, Session, SwapRequest,
    SwapRequestDraft, SwapStatus, UserProfile, ValidationError, DEFAULT_AVAILABILITY_OPTIONS, DEFAULT_PAGE_SIZE,
};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "skillswap-catalog";

pub const FETCH_FAILED_MESSAGE: &str = "Failed to fetch users";
pub const AUTH_REQUIRED_MESSAGE: &str = "Please login to send swap requests";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Tags sent to the match endpoint. The search box never feeds into these;
    /// it only refines the returned batch locally.
    #[serde(default = "default_interest_tags")]
    pub interest_tags: Vec<String>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_availability_options")]
    pub availability_options: Vec<String>,
    #[serde(default = "default_admin_email")]
    pub admin_email: String,
}

fn default_interest_tags() -> Vec<String> {
    vec!["js".to_string()]
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_availability_options() -> Vec<String> {
    DEFAULT_AVAILABILITY_OPTIONS.iter().map(|s| s.to_string()).collect()
}

fn default_admin_email() -> String {
    "admin@skillswap.com".to_string()
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            interest_tags: default_interest_tags(),
            page_size: default_page_size(),
            availability_options: default_availability_options(),
            admin_email: default_admin_email(),
        }
    }
}

/// Missing file means defaults; a present but broken file is an error.
pub fn load_catalog_config(path: impl AsRef<Path>) -> Result<CatalogConfig> {
    let path = path.as_ref();
    if !path.exists() {
        debug!(path = %path.display(), "catalog config not found, using defaults");
        return Ok(CatalogConfig::default());
    }
    let yaml = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut config: CatalogConfig =
        serde_yaml::from_str(&yaml).with_context(|| format!("parsing {}", path.display()))?;
    config.page_size = config.page_size.max(1);
    Ok(config)
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub web_port: u16,
    pub catalog_config_path: PathBuf,
    pub fixtures_path: Option<PathBuf>,
    pub requests_fixture_path: Option<PathBuf>,
    pub log_level: String,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self {
            api_base_url: std::env::var("SKILLSWAP_API_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8000".to_string()),
            http_timeout_secs: std::env::var("SKILLSWAP_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: std::env::var("SKILLSWAP_USER_AGENT")
                .unwrap_or_else(|_| "skillswap-client/0.1".to_string()),
            web_port: std::env::var("SKILLSWAP_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            catalog_config_path: std::env::var("SKILLSWAP_CATALOG_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./catalog.yaml")),
            fixtures_path: std::env::var("SKILLSWAP_FIXTURES").ok().map(PathBuf::from),
            requests_fixture_path: std::env::var("SKILLSWAP_REQUESTS_FIXTURE").ok().map(PathBuf::from),
            log_level: std::env::var("SKILLSWAP_LOG").unwrap_or_else(|_| "info".to_string()),
        }
    }
}

/// Fixture backend when a fixture path is configured, HTTP otherwise.
pub fn build_backend(config: &ClientConfig) -> Result<Arc<dyn SkillSwapBackend>> {
    if let Some(path) = &config.fixtures_path {
        info!(path = %path.display(), "using fixture backend");
        let mut backend = FixtureBackend::from_path(path)?;
        if let Some(requests) = &config.requests_fixture_path {
            backend = backend.with_requests(load_fixture_requests(requests)?);
        }
        return Ok(Arc::new(backend));
    }
    info!(base_url = %config.api_base_url, "using http backend");
    Ok(Arc::new(HttpBackend::new(HttpBackendConfig {
        base_url: config.api_base_url.clone(),
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
    })?))
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("login required")]
    AuthRequired,
    #[error("not allowed for this account")]
    Forbidden,
    #[error("validation failed: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    ValidationFailed(Vec<ValidationError>),
    #[error("no catalog record with key {0}")]
    UnknownRecord(String),
    #[error("no swap request with id {0}")]
    UnknownRequest(String),
    #[error("swap request {id} is already {status:?}")]
    InvalidTransition { id: String, status: SwapStatus },
    #[error(transparent)]
    Backend(BackendError),
}

impl From<BackendError> for CatalogError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Validation(errors) => Self::ValidationFailed(errors),
            other => Self::Backend(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogPhase {
    Idle,
    Loading,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchTrigger {
    Mount,
    Search,
}

/// Handle for one outstanding fetch. Only the most recently issued ticket may
/// replace the records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    seq: u64,
    trigger: FetchTrigger,
}

impl FetchTicket {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn trigger(&self) -> FetchTrigger {
        self.trigger
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Applied { records: usize, dropped: usize },
    FetchFailed { reason: String },
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Success,
    Error,
}

/// Transient user-facing message; the outer surface decides how to show it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogCard {
    pub key: String,
    pub record: CatalogRecord,
    pub request_disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogView {
    pub phase: CatalogPhase,
    pub cards: Vec<CatalogCard>,
    /// Skeleton cards to draw while loading.
    pub placeholders: usize,
    pub current_page: usize,
    pub total_pages: usize,
    pub total_matches: usize,
    pub showing: usize,
    pub query: QueryState,
    pub availability_options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwapTarget {
    pub key: String,
    pub record: CatalogRecord,
}

/// Validated swap request waiting for the backend round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedSwap {
    pub token: String,
    pub draft: SwapRequestDraft,
    pub request: SwapRequest,
}

#[derive(Debug)]
pub struct CatalogController {
    config: CatalogConfig,
    records: Vec<CatalogRecord>,
    query: CatalogQuery,
    paginator: Paginator,
    phase: CatalogPhase,
    latest_seq: u64,
    notices: VecDeque<Notice>,
    requests: RequestBook,
}

impl CatalogController {
    pub fn new(config: CatalogConfig) -> Self {
        let paginator = Paginator::new(config.page_size);
        Self {
            config,
            records: Vec::new(),
            query: CatalogQuery::default(),
            paginator,
            phase: CatalogPhase::Idle,
            latest_seq: 0,
            notices: VecDeque::new(),
            requests: RequestBook::default(),
        }
    }

    pub fn with_requests(mut self, requests: RequestBook) -> Self {
        self.requests = requests;
        self
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    pub fn phase(&self) -> CatalogPhase {
        self.phase
    }

    pub fn records(&self) -> &[CatalogRecord] {
        &self.records
    }

    pub fn interest_tags(&self) -> &[String] {
        &self.config.interest_tags
    }

    pub fn begin_fetch(&mut self, trigger: FetchTrigger) -> FetchTicket {
        self.latest_seq += 1;
        self.phase = CatalogPhase::Loading;
        if trigger == FetchTrigger::Search {
            self.paginator.reset();
        }
        debug!(seq = self.latest_seq, ?trigger, "catalog fetch started");
        FetchTicket {
            seq: self.latest_seq,
            trigger,
        }
    }

    /// Apply a fetch result unless a newer fetch has been issued since.
    pub fn complete_fetch(
        &mut self,
        ticket: FetchTicket,
        result: Result<MatchBatch, BackendError>,
    ) -> FetchOutcome {
        if ticket.seq != self.latest_seq {
            warn!(seq = ticket.seq, latest = self.latest_seq, "discarding stale catalog response");
            return FetchOutcome::Stale;
        }

        self.phase = CatalogPhase::Ready;
        match result {
            Ok(batch) => {
                let records = batch.records.len();
                let dropped = batch.malformed.len();
                self.records = batch.records;
                debug!(seq = ticket.seq, records, dropped, "catalog fetch applied");
                FetchOutcome::Applied { records, dropped }
            }
            Err(err) => {
                warn!(seq = ticket.seq, error = %err, "catalog fetch failed");
                self.records.clear();
                self.notify(NoticeLevel::Error, FETCH_FAILED_MESSAGE);
                FetchOutcome::FetchFailed {
                    reason: err.to_string(),
                }
            }
        }
    }

    pub async fn mount(&mut self, backend: &dyn SkillSwapBackend) -> FetchOutcome {
        self.run_fetch(backend, FetchTrigger::Mount).await
    }

    /// Explicit search: refetch and return to page 1.
    pub async fn search(&mut self, backend: &dyn SkillSwapBackend) -> FetchOutcome {
        self.run_fetch(backend, FetchTrigger::Search).await
    }

    async fn run_fetch(&mut self, backend: &dyn SkillSwapBackend, trigger: FetchTrigger) -> FetchOutcome {
        let ticket = self.begin_fetch(trigger);
        let tags = self.config.interest_tags.clone();
        let result = backend.match_users(&tags).await;
        self.complete_fetch(ticket, result)
    }

    /// Criteria changes re-filter immediately but keep the current page.
    pub fn set_search_term(&mut self, term: impl Into<String>) {
        self.query.search_term = term.into();
    }

    pub fn set_availability_filter(&mut self, availability: impl Into<String>) {
        self.query.availability = availability.into();
    }

    pub fn query_state(&self) -> QueryState {
        QueryState {
            search_term: self.query.search_term.clone(),
            availability_filter: self.query.availability.clone(),
            current_page: self.paginator.current_page(),
        }
    }

    pub fn filtered(&self) -> Vec<(usize, &CatalogRecord)> {
        self.query.filter(&self.records)
    }

    pub fn total_pages(&self) -> usize {
        self.paginator.total_pages(self.filtered().len())
    }

    pub fn previous_page(&mut self) {
        self.paginator.previous();
    }

    pub fn next_page(&mut self) {
        let total = self.filtered().len();
        self.paginator.next(total);
    }

    pub fn select_page(&mut self, page: usize) {
        self.paginator.select(page);
    }

    pub fn view(&self, session: &Session) -> CatalogView {
        let filtered = self.filtered();
        let loading = self.phase == CatalogPhase::Loading;
        let cards: Vec<CatalogCard> = if loading {
            Vec::new()
        } else {
            self.paginator
                .slice(&filtered)
                .iter()
                .map(|(position, record)| CatalogCard {
                    key: record.record_key(*position),
                    record: (*record).clone(),
                    request_disabled: !session.is_logged_in(),
                })
                .collect()
        };

        CatalogView {
            phase: self.phase,
            placeholders: if loading { self.paginator.page_size() } else { 0 },
            showing: cards.len(),
            cards,
            current_page: self.paginator.current_page(),
            total_pages: self.paginator.total_pages(filtered.len()),
            total_matches: filtered.len(),
            query: self.query_state(),
            availability_options: self.config.availability_options.clone(),
        }
    }

    pub fn find_record(&self, key: &str) -> Option<&CatalogRecord> {
        self.records
            .iter()
            .enumerate()
            .find(|(position, record)| record.record_key(*position) == key)
            .map(|(_, record)| record)
    }

    /// Gate for the swap-request workflow; logged-out callers get a notice and nothing else.
    pub fn request_swap(&mut self, session: &Session, key: &str) -> Result<SwapTarget, CatalogError> {
        if !session.is_logged_in() {
            self.notify(NoticeLevel::Error, AUTH_REQUIRED_MESSAGE);
            return Err(CatalogError::AuthRequired);
        }
        let record = self
            .find_record(key)
            .cloned()
            .ok_or_else(|| CatalogError::UnknownRecord(key.to_string()))?;
        Ok(SwapTarget {
            key: key.to_string(),
            record,
        })
    }

    pub fn prepare_swap_request(
        &mut self,
        session: &Session,
        key: &str,
        draft: SwapRequestDraft,
    ) -> Result<PreparedSwap, CatalogError> {
        let target = self.request_swap(session, key)?;
        let (Some(requester), Some(token)) = (session.user(), session.token()) else {
            return Err(CatalogError::AuthRequired);
        };

        let draft = SwapRequestDraft {
            receiver_id: target.record.id.clone().unwrap_or_else(|| target.key.clone()),
            ..draft
        };
        if let Err(errors) = draft.validate(requester, &target.record) {
            if let Some(first) = errors.first() {
                self.notify(NoticeLevel::Error, first.message.clone());
            }
            return Err(CatalogError::ValidationFailed(errors));
        }

        let request = SwapRequest::pending_from_draft(requester, &target.record, &draft, Utc::now());
        Ok(PreparedSwap {
            token: token.to_string(),
            draft,
            request,
        })
    }

    pub fn finish_swap_request(
        &mut self,
        prepared: PreparedSwap,
        result: Result<(), BackendError>,
    ) -> Result<SwapRequest, CatalogError> {
        match result {
            Ok(()) => {
                info!(id = %prepared.request.id, to = %prepared.request.to_user_id, "swap request sent");
                self.notify(NoticeLevel::Success, "Swap request sent successfully!");
                self.requests.push(prepared.request.clone());
                Ok(prepared.request)
            }
            Err(err) => {
                warn!(error = %err, "swap request failed");
                self.notify(NoticeLevel::Error, "Failed to send swap request");
                Err(err.into())
            }
        }
    }

    pub async fn send_swap_request(
        &mut self,
        backend: &dyn SkillSwapBackend,
        session: &Session,
        key: &str,
        draft: SwapRequestDraft,
    ) -> Result<SwapRequest, CatalogError> {
        let prepared = self.prepare_swap_request(session, key, draft)?;
        let result = backend.submit_swap_request(&prepared.token, &prepared.draft).await;
        self.finish_swap_request(prepared, result)
    }

    pub fn requests(&self) -> &RequestBook {
        &self.requests
    }

    /// Merge the backend's copy of the signed-in user's requests. Rows come
    /// without names, so they are filled from the session and the catalog.
    pub fn sync_requests(&mut self, session: &Session, remote: Vec<SwapRequest>) -> Result<usize, CatalogError> {
        let user = session.user().ok_or(CatalogError::AuthRequired)?;
        let remote: Vec<SwapRequest> = remote
            .into_iter()
            .map(|mut request| {
                if request.from_name.is_empty() {
                    request.from_name = self.display_name(user, &request.from_user_id).unwrap_or_default();
                }
                if request.to_name.is_empty() {
                    request.to_name = self.display_name(user, &request.to_user_id).unwrap_or_default();
                }
                request
            })
            .collect();
        let added = self.requests.merge_remote(remote);
        debug!(user = %user.id, added, total = self.requests.all().len(), "swap requests synced");
        Ok(added)
    }

    pub async fn refresh_requests(
        &mut self,
        backend: &dyn SkillSwapBackend,
        session: &Session,
    ) -> Result<usize, CatalogError> {
        let token = session.token().ok_or(CatalogError::AuthRequired)?;
        let remote = backend.my_requests(token).await?;
        self.sync_requests(session, remote)
    }

    fn display_name(&self, user: &UserProfile, id: &str) -> Option<String> {
        if user.id == id {
            return Some(user.name.clone());
        }
        self.records
            .iter()
            .find(|r| r.id.as_deref() == Some(id))
            .map(|r| r.name.clone())
    }

    pub fn inbox(&self, session: &Session) -> Result<Inbox, CatalogError> {
        let user = session.user().ok_or(CatalogError::AuthRequired)?;
        Ok(Inbox {
            received: self.requests.received(&user.id).into_iter().cloned().collect(),
            sent: self.requests.sent(&user.id).into_iter().cloned().collect(),
        })
    }

    /// Only the receiver may accept or reject.
    pub fn respond_to_request(
        &mut self,
        session: &Session,
        id: &str,
        accept: bool,
    ) -> Result<SwapRequest, CatalogError> {
        let user = session.user().ok_or(CatalogError::AuthRequired)?;
        let request = self.requests.get(id).ok_or_else(|| CatalogError::UnknownRequest(id.to_string()))?;
        if request.to_user_id != user.id {
            return Err(CatalogError::Forbidden);
        }
        let updated = if accept {
            self.requests.accept(id)?
        } else {
            self.requests.reject(id)?
        };
        let message = if accept { "Request accepted!" } else { "Request rejected" };
        self.notify(NoticeLevel::Success, message);
        Ok(updated)
    }

    /// Either side may delete.
    pub fn delete_request(&mut self, session: &Session, id: &str) -> Result<SwapRequest, CatalogError> {
        let user = session.user().ok_or(CatalogError::AuthRequired)?;
        let request = self.requests.get(id).ok_or_else(|| CatalogError::UnknownRequest(id.to_string()))?;
        if request.to_user_id != user.id && request.from_user_id != user.id {
            return Err(CatalogError::Forbidden);
        }
        let removed = self.requests.delete(id)?;
        self.notify(NoticeLevel::Success, "Request deleted");
        Ok(removed)
    }

    pub fn admin_stats(&self, session: &Session) -> Result<AdminStats, CatalogError> {
        if !session.is_logged_in() {
            return Err(CatalogError::AuthRequired);
        }
        if !session.is_admin() {
            return Err(CatalogError::Forbidden);
        }
        Ok(AdminStats::from_records(&self.records, &self.requests))
    }

    pub fn notify(&mut self, level: NoticeLevel, message: impl Into<String>) {
        self.notices.push_back(Notice {
            level,
            message: message.into(),
        });
    }

    pub fn drain_notices(&mut self) -> Vec<Notice> {
        self.notices.drain(..).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Inbox {
    pub received: Vec<SwapRequest>,
    pub sent: Vec<SwapRequest>,
}

/// In-memory store of swap requests the signed-in user has sent or received.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestBook {
    requests: Vec<SwapRequest>,
    /// Deleted ids; a later merge must not bring them back.
    dismissed: HashSet<String>,
}

fn same_proposal(a: &SwapRequest, b: &SwapRequest) -> bool {
    a.from_user_id == b.from_user_id
        && a.to_user_id == b.to_user_id
        && a.skill_offered == b.skill_offered
        && a.skill_wanted == b.skill_wanted
}

/// The backend has no accept or reject endpoint, so a remote row that is still
/// pending never overrides a decision made here.
fn absorb(local: &mut SwapRequest, incoming: SwapRequest) {
    if incoming.status != SwapStatus::Pending || local.status == SwapStatus::Pending {
        local.status = incoming.status;
    }
    if !incoming.from_name.is_empty() {
        local.from_name = incoming.from_name;
    }
    if !incoming.to_name.is_empty() {
        local.to_name = incoming.to_name;
    }
    local.from_user_id = incoming.from_user_id;
    local.to_user_id = incoming.to_user_id;
    local.skill_offered = incoming.skill_offered;
    local.skill_wanted = incoming.skill_wanted;
    local.message = incoming.message;
}

impl RequestBook {
    pub fn new(requests: Vec<SwapRequest>) -> Self {
        Self {
            requests,
            dismissed: HashSet::new(),
        }
    }

    /// Fold remote rows into the book and return how many were new. Rows are
    /// matched by id first; a locally sent pending request then adopts the
    /// backend id of the row carrying the same proposal.
    pub fn merge_remote(&mut self, remote: Vec<SwapRequest>) -> usize {
        let mut matched = HashSet::new();
        let mut unmatched = Vec::new();
        for incoming in remote {
            if self.dismissed.contains(&incoming.id) {
                continue;
            }
            match self.requests.iter_mut().find(|r| r.id == incoming.id) {
                Some(local) => {
                    matched.insert(local.id.clone());
                    absorb(local, incoming);
                }
                None => unmatched.push(incoming),
            }
        }

        let mut added = 0;
        for incoming in unmatched {
            let local = self.requests.iter_mut().find(|r| {
                !matched.contains(&r.id) && r.status == SwapStatus::Pending && same_proposal(r, &incoming)
            });
            match local {
                Some(local) => {
                    debug!(local = %local.id, remote = %incoming.id, "swap request adopted backend id");
                    local.id = incoming.id.clone();
                    matched.insert(incoming.id.clone());
                    absorb(local, incoming);
                }
                None => {
                    matched.insert(incoming.id.clone());
                    self.requests.push(incoming);
                    added += 1;
                }
            }
        }
        added
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let requests = serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(requests))
    }

    pub fn all(&self) -> &[SwapRequest] {
        &self.requests
    }

    pub fn get(&self, id: &str) -> Option<&SwapRequest> {
        self.requests.iter().find(|r| r.id == id)
    }

    pub fn push(&mut self, request: SwapRequest) {
        self.requests.push(request);
    }

    pub fn received(&self, user_id: &str) -> Vec<&SwapRequest> {
        self.requests.iter().filter(|r| r.to_user_id == user_id).collect()
    }

    pub fn sent(&self, user_id: &str) -> Vec<&SwapRequest> {
        self.requests.iter().filter(|r| r.from_user_id == user_id).collect()
    }

    pub fn accept(&mut self, id: &str) -> Result<SwapRequest, CatalogError> {
        self.transition(id, SwapStatus::Accepted)
    }

    pub fn reject(&mut self, id: &str) -> Result<SwapRequest, CatalogError> {
        self.transition(id, SwapStatus::Rejected)
    }

    fn transition(&mut self, id: &str, to: SwapStatus) -> Result<SwapRequest, CatalogError> {
        let request = self
            .requests
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| CatalogError::UnknownRequest(id.to_string()))?;
        if request.status != SwapStatus::Pending {
            return Err(CatalogError::InvalidTransition {
                id: id.to_string(),
                status: request.status,
            });
        }
        request.status = to;
        Ok(request.clone())
    }

    pub fn delete(&mut self, id: &str) -> Result<SwapRequest, CatalogError> {
        let pos = self
            .requests
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| CatalogError::UnknownRequest(id.to_string()))?;
        self.dismissed.insert(id.to_string());
        Ok(self.requests.remove(pos))
    }

    pub fn count_with_status(&self, status: SwapStatus) -> usize {
        self.requests.iter().filter(|r| r.status == status).count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdminStats {
    pub total_users: usize,
    pub public_users: usize,
    pub average_rating: f64,
    pub pending_requests: usize,
    pub accepted_requests: usize,
    pub rejected_requests: usize,
    pub users_by_availability: BTreeMap<String, usize>,
}

impl AdminStats {
    pub fn from_records(records: &[CatalogRecord], requests: &RequestBook) -> Self {
        let mut users_by_availability = BTreeMap::<String, usize>::new();
        for record in records {
            for slot in &record.availability {
                *users_by_availability.entry(slot.clone()).or_default() += 1;
            }
        }
        let average_rating = if records.is_empty() {
            0.0
        } else {
            records.iter().map(|r| r.rating).sum::<f64>() / records.len() as f64
        };
        Self {
            total_users: records.len(),
            public_users: records.iter().filter(|r| r.is_public).count(),
            average_rating,
            pending_requests: requests.count_with_status(SwapStatus::Pending),
            accepted_requests: requests.count_with_status(SwapStatus::Accepted),
            rejected_requests: requests.count_with_status(SwapStatus::Rejected),
            users_by_availability,
        }
    }
}

/// Log in and build a fresh session; admin rights follow the configured email.
pub async fn sign_in(
    backend: &dyn SkillSwapBackend,
    config: &CatalogConfig,
    email: &str,
    password: &str,
) -> Result<Session, CatalogError> {
    let email = email.trim();
    let mut errors = Vec::new();
    if email.is_empty() {
        errors.push(ValidationError::new("email", "Email is required"));
    }
    if password.is_empty() {
        errors.push(ValidationError::new("password", "Password is required"));
    }
    if !errors.is_empty() {
        return Err(CatalogError::ValidationFailed(errors));
    }

    let outcome = backend.login(email, password).await?;
    let is_admin = email.eq_ignore_ascii_case(&config.admin_email);
    info!(email, is_admin, "signed in");
    Ok(Session::logged_in(outcome.profile, outcome.token.access_token, is_admin))
}

/// Register, then sign in with the same credentials.
pub async fn sign_up(
    backend: &dyn SkillSwapBackend,
    config: &CatalogConfig,
    registration: &Registration,
) -> Result<Session, CatalogError> {
    registration.validate().map_err(CatalogError::ValidationFailed)?;
    let profile = backend.register(registration).await?;
    info!(id = %profile.id, "registered");
    sign_in(backend, config, &registration.email, &registration.password).await
}
