//! Core domain model for the skill-swap catalog: records, filtering, paging and sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "skillswap-core";

/// Number of catalog cards shown per page.
pub const DEFAULT_PAGE_SIZE: usize = 6;

pub const DEFAULT_AVAILABILITY_OPTIONS: [&str; 6] = [
    "Weekdays",
    "Weekends",
    "Evenings",
    "Mornings",
    "Afternoons",
    "Flexible",
];

pub const MIN_PASSWORD_LEN: usize = 6;

/// One candidate swap partner as shown in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub id: Option<String>,
    pub name: String,
    pub location: Option<String>,
    pub profile_photo_url: String,
    pub skills_offered: Vec<String>,
    pub skills_wanted: Vec<String>,
    pub availability: Vec<String>,
    pub rating: f64,
    pub is_public: bool,
    pub join_date: String,
    pub score: Option<f64>,
}

impl CatalogRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            location: None,
            profile_photo_url: String::new(),
            skills_offered: Vec::new(),
            skills_wanted: Vec::new(),
            availability: Vec::new(),
            rating: 0.0,
            is_public: true,
            join_date: String::new(),
            score: None,
        }
    }

    /// Stable key within one fetched batch. Records without an id fall back to
    /// their batch position, which is not stable across re-fetches.
    pub fn record_key(&self, position: usize) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => format!("#{position}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("record {index} is malformed: {reason}")]
pub struct MalformedRecord {
    pub index: usize,
    pub reason: String,
}

impl MalformedRecord {
    fn new(index: usize, reason: impl Into<String>) -> Self {
        Self {
            index,
            reason: reason.into(),
        }
    }
}

/// Result of normalizing one server response: usable records in input order plus
/// the items that were rejected.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    pub records: Vec<CatalogRecord>,
    pub malformed: Vec<MalformedRecord>,
}

/// Map one raw backend user object into a [`CatalogRecord`], applying a default
/// for every optional field.
pub fn normalize_raw_user(index: usize, raw: &JsonValue) -> Result<CatalogRecord, MalformedRecord> {
    let obj = raw
        .as_object()
        .ok_or_else(|| MalformedRecord::new(index, format!("expected object, got {}", json_kind(raw))))?;

    let name = optional_string(obj, "name", index)?
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| MalformedRecord::new(index, "missing or empty `name`"))?;

    Ok(CatalogRecord {
        id: optional_id(obj, index)?,
        name,
        location: optional_string(obj, "location", index)?,
        profile_photo_url: optional_string(obj, "profile_photo", index)?.unwrap_or_default(),
        skills_offered: string_list(obj, "skills_offered", index)?,
        skills_wanted: string_list(obj, "skills_wanted", index)?,
        availability: string_list(obj, "availability", index)?,
        rating: optional_f64(obj, "rating", index)?.unwrap_or(0.0),
        is_public: match optional_bool(obj, "isPublic", index)? {
            Some(v) => v,
            None => optional_bool(obj, "is_public", index)?.unwrap_or(true),
        },
        join_date: optional_string(obj, "joinDate", index)?.unwrap_or_default(),
        score: optional_f64(obj, "score", index)?,
    })
}

pub fn normalize_batch(items: &[JsonValue]) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    for (index, item) in items.iter().enumerate() {
        match normalize_raw_user(index, item) {
            Ok(record) => batch.records.push(record),
            Err(err) => batch.malformed.push(err),
        }
    }
    batch
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn present<'a>(obj: &'a Map<String, JsonValue>, key: &str) -> Option<&'a JsonValue> {
    obj.get(key).filter(|v| !v.is_null())
}

fn optional_string(
    obj: &Map<String, JsonValue>,
    key: &str,
    index: usize,
) -> Result<Option<String>, MalformedRecord> {
    match present(obj, key) {
        None => Ok(None),
        Some(JsonValue::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(MalformedRecord::new(
            index,
            format!("`{key}` must be a string, got {}", json_kind(other)),
        )),
    }
}

fn optional_id(obj: &Map<String, JsonValue>, index: usize) -> Result<Option<String>, MalformedRecord> {
    match present(obj, "id") {
        None => Ok(None),
        Some(JsonValue::String(s)) if s.is_empty() => Ok(None),
        Some(JsonValue::String(s)) => Ok(Some(s.clone())),
        Some(JsonValue::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(MalformedRecord::new(
            index,
            format!("`id` must be a string or number, got {}", json_kind(other)),
        )),
    }
}

fn optional_f64(
    obj: &Map<String, JsonValue>,
    key: &str,
    index: usize,
) -> Result<Option<f64>, MalformedRecord> {
    match present(obj, key) {
        None => Ok(None),
        Some(JsonValue::Number(n)) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| MalformedRecord::new(index, format!("`{key}` is not representable as f64"))),
        Some(other) => Err(MalformedRecord::new(
            index,
            format!("`{key}` must be a number, got {}", json_kind(other)),
        )),
    }
}

fn optional_bool(
    obj: &Map<String, JsonValue>,
    key: &str,
    index: usize,
) -> Result<Option<bool>, MalformedRecord> {
    match present(obj, key) {
        None => Ok(None),
        Some(JsonValue::Bool(b)) => Ok(Some(*b)),
        Some(other) => Err(MalformedRecord::new(
            index,
            format!("`{key}` must be a bool, got {}", json_kind(other)),
        )),
    }
}

/// Accepts a JSON array of strings, copied as received, or a comma-joined
/// string, which is split and trimmed.
fn string_list(
    obj: &Map<String, JsonValue>,
    key: &str,
    index: usize,
) -> Result<Vec<String>, MalformedRecord> {
    match present(obj, key) {
        None => Ok(Vec::new()),
        Some(JsonValue::String(s)) => Ok(split_comma_list(s)),
        Some(JsonValue::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    JsonValue::String(s) => out.push(s.clone()),
                    other => {
                        return Err(MalformedRecord::new(
                            index,
                            format!("`{key}` entries must be strings, got {}", json_kind(other)),
                        ))
                    }
                }
            }
            Ok(out)
        }
        Some(other) => Err(MalformedRecord::new(
            index,
            format!("`{key}` must be a list or string, got {}", json_kind(other)),
        )),
    }
}

pub fn split_comma_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

pub fn join_comma_list(items: &[String]) -> String {
    items.join(", ")
}

/// Search and availability criteria applied to the fetched catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogQuery {
    #[serde(default)]
    pub search_term: String,
    #[serde(default)]
    pub availability: String,
}

impl CatalogQuery {
    pub fn new(search_term: impl Into<String>, availability: impl Into<String>) -> Self {
        Self {
            search_term: search_term.into(),
            availability: availability.into(),
        }
    }

    /// Availability is exact, case-sensitive membership. Search is a
    /// case-insensitive substring over the name and both skill lists.
    pub fn matches(&self, record: &CatalogRecord) -> bool {
        let match_availability =
            self.availability.is_empty() || record.availability.iter().any(|a| *a == self.availability);
        if !match_availability {
            return false;
        }
        if self.search_term.is_empty() {
            return true;
        }

        let needle = self.search_term.to_lowercase();
        let hit = |s: &String| s.to_lowercase().contains(&needle);
        hit(&record.name) || record.skills_offered.iter().any(hit) || record.skills_wanted.iter().any(hit)
    }

    /// Matching records with their batch positions, in input order.
    pub fn filter<'a>(&self, records: &'a [CatalogRecord]) -> Vec<(usize, &'a CatalogRecord)> {
        records
            .iter()
            .enumerate()
            .filter(|(_, r)| self.matches(r))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Paginator {
    page_size: usize,
    current_page: usize,
}

impl Default for Paginator {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}

impl Paginator {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            current_page: 1,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn current_page(&self) -> usize {
        self.current_page
    }

    /// Never below 1, so an empty result still reads "Page 1 of 1".
    pub fn total_pages(&self, total_items: usize) -> usize {
        total_items.div_ceil(self.page_size).max(1)
    }

    /// Out-of-range pages yield an empty slice.
    pub fn slice<'a, T>(&self, items: &'a [T]) -> &'a [T] {
        let start = (self.current_page - 1).saturating_mul(self.page_size);
        if start >= items.len() {
            return &[];
        }
        let end = start.saturating_add(self.page_size).min(items.len());
        &items[start..end]
    }

    pub fn previous(&mut self) {
        self.current_page = self.current_page.saturating_sub(1).max(1);
    }

    pub fn next(&mut self, total_items: usize) {
        self.current_page = (self.current_page + 1).min(self.total_pages(total_items));
    }

    pub fn select(&mut self, page: usize) {
        self.current_page = page.max(1);
    }

    pub fn reset(&mut self) {
        self.current_page = 1;
    }
}

/// Snapshot of the controller's mutable query state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryState {
    pub search_term: String,
    pub availability_filter: String,
    pub current_page: usize,
}

impl Default for QueryState {
    fn default() -> Self {
        Self {
            search_term: String::new(),
            availability_filter: String::new(),
            current_page: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

fn finish(errors: Vec<ValidationError>) -> Result<(), Vec<ValidationError>> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Trim and append unless blank or already present.
pub fn push_unique_skill(list: &mut Vec<String>, skill: &str) -> bool {
    let skill = skill.trim();
    if skill.is_empty() || list.iter().any(|s| s == skill) {
        return false;
    }
    list.push(skill.to_string());
    true
}

pub fn toggle_slot(list: &mut Vec<String>, slot: &str) {
    if let Some(pos) = list.iter().position(|s| s == slot) {
        list.remove(pos);
    } else {
        list.push(slot.to_string());
    }
}

/// Sign-up form state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub name: String,
    pub email: String,
    pub password: String,
    pub confirm_password: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub skills_offered: Vec<String>,
    #[serde(default)]
    pub skills_wanted: Vec<String>,
    #[serde(default)]
    pub availability: Vec<String>,
}

impl Registration {
    pub fn add_skill_offered(&mut self, skill: &str) -> bool {
        push_unique_skill(&mut self.skills_offered, skill)
    }

    pub fn add_skill_wanted(&mut self, skill: &str) -> bool {
        push_unique_skill(&mut self.skills_wanted, skill)
    }

    pub fn remove_skill_offered(&mut self, skill: &str) {
        self.skills_offered.retain(|s| s != skill);
    }

    pub fn remove_skill_wanted(&mut self, skill: &str) {
        self.skills_wanted.retain(|s| s != skill);
    }

    pub fn toggle_availability(&mut self, slot: &str) {
        toggle_slot(&mut self.availability, slot);
    }

    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        if self.name.trim().is_empty() {
            errors.push(ValidationError::new("name", "Name is required"));
        }
        let email = self.email.trim();
        if email.is_empty() {
            errors.push(ValidationError::new("email", "Email is required"));
        } else if !email.contains('@') {
            errors.push(ValidationError::new("email", "Email must contain @"));
        }
        if self.password.is_empty() {
            errors.push(ValidationError::new("password", "Password is required"));
        } else if self.password.chars().count() < MIN_PASSWORD_LEN {
            errors.push(ValidationError::new(
                "password",
                format!("Password must be at least {MIN_PASSWORD_LEN} characters"),
            ));
        }
        if self.password != self.confirm_password {
            errors.push(ValidationError::new("confirm_password", "Passwords do not match"));
        }
        if self.skills_offered.is_empty() {
            errors.push(ValidationError::new(
                "skills_offered",
                "Please add at least one skill you can offer",
            ));
        }
        if self.skills_wanted.is_empty() {
            errors.push(ValidationError::new(
                "skills_wanted",
                "Please add at least one skill you want to learn",
            ));
        }
        if self.availability.is_empty() {
            errors.push(ValidationError::new("availability", "Please select your availability"));
        }
        finish(errors)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillKind {
    Offered,
    Wanted,
}

/// The signed-in user's own profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub profile_photo_url: String,
    #[serde(default)]
    pub skills_offered: Vec<String>,
    #[serde(default)]
    pub skills_wanted: Vec<String>,
    #[serde(default)]
    pub availability: Vec<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default = "default_true")]
    pub is_public: bool,
}

fn default_true() -> bool {
    true
}

impl UserProfile {
    pub fn new(id: impl Into<String>, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: email.into(),
            location: None,
            profile_photo_url: String::new(),
            skills_offered: Vec::new(),
            skills_wanted: Vec::new(),
            availability: Vec::new(),
            bio: None,
            is_public: true,
        }
    }

    fn skills_mut(&mut self, kind: SkillKind) -> &mut Vec<String> {
        match kind {
            SkillKind::Offered => &mut self.skills_offered,
            SkillKind::Wanted => &mut self.skills_wanted,
        }
    }

    /// Profile edits keep duplicates out, unlike server-provided records.
    pub fn add_skill(&mut self, kind: SkillKind, skill: &str) -> bool {
        push_unique_skill(self.skills_mut(kind), skill)
    }

    pub fn remove_skill(&mut self, kind: SkillKind, index: usize) -> Option<String> {
        let list = self.skills_mut(kind);
        (index < list.len()).then(|| list.remove(index))
    }

    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        if self.name.trim().is_empty() {
            errors.push(ValidationError::new("name", "Name is required"));
        }
        finish(errors)
    }
}

/// Explicitly passed authentication context. Replaced wholesale on login and logout.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Session {
    user: Option<UserProfile>,
    #[serde(skip_serializing)]
    token: Option<String>,
    is_admin: bool,
}

impl Session {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn logged_in(user: UserProfile, token: impl Into<String>, is_admin: bool) -> Self {
        Self {
            user: Some(user),
            token: Some(token.into()),
            is_admin,
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.user.is_some()
    }

    pub fn is_admin(&self) -> bool {
        self.is_logged_in() && self.is_admin
    }

    pub fn user(&self) -> Option<&UserProfile> {
        self.user.as_ref()
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Same session with the profile replaced; anonymous sessions stay anonymous.
    pub fn with_profile(&self, profile: UserProfile) -> Self {
        if !self.is_logged_in() {
            return self.clone();
        }
        Self {
            user: Some(profile),
            token: self.token.clone(),
            is_admin: self.is_admin,
        }
    }
}

/// Proposal to trade one of the requester's skills for one of the target's.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapRequestDraft {
    pub receiver_id: String,
    pub skill_offered: String,
    pub skill_wanted: String,
    pub message: String,
}

impl SwapRequestDraft {
    pub fn validate(
        &self,
        requester: &UserProfile,
        target: &CatalogRecord,
    ) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        if self.skill_offered.is_empty() {
            errors.push(ValidationError::new("skill_offered", "Select a skill you offer"));
        } else if !requester.skills_offered.contains(&self.skill_offered) {
            errors.push(ValidationError::new(
                "skill_offered",
                format!("`{}` is not one of your offered skills", self.skill_offered),
            ));
        }
        if self.skill_wanted.is_empty() {
            errors.push(ValidationError::new("skill_wanted", "Select a skill they offer"));
        } else if !target.skills_offered.contains(&self.skill_wanted) {
            errors.push(ValidationError::new(
                "skill_wanted",
                format!("{} does not offer `{}`", target.name, self.skill_wanted),
            ));
        }
        if self.message.trim().is_empty() {
            errors.push(ValidationError::new("message", "Message is required"));
        }
        finish(errors)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapStatus {
    Pending,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapRequest {
    pub id: String,
    pub from_user_id: String,
    pub to_user_id: String,
    pub from_name: String,
    pub to_name: String,
    pub skill_offered: String,
    pub skill_wanted: String,
    pub message: String,
    pub status: SwapStatus,
    pub created_at: DateTime<Utc>,
}

impl SwapRequest {
    pub fn pending_from_draft(
        requester: &UserProfile,
        target: &CatalogRecord,
        draft: &SwapRequestDraft,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from_user_id: requester.id.clone(),
            to_user_id: draft.receiver_id.clone(),
            from_name: requester.name.clone(),
            to_name: target.name.clone(),
            skill_offered: draft.skill_offered.clone(),
            skill_wanted: draft.skill_wanted.clone(),
            message: draft.message.trim().to_string(),
            status: SwapStatus::Pending,
            created_at,
        }
    }
}
