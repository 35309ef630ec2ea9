//! Adaptive-pacing, token-managed, run-caching client for the game catalog
//! service.
//!
//! One `GatewayClient` instance corresponds to one sync run: its caches are
//! append-only and never invalidated, so every deterministic lookup is paid
//! for at most once per run.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::Hash;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "gamedex-gateway";

/// Refresh the bearer token when it is within this margin of expiry, so a
/// request never departs with a token about to lapse mid-flight.
pub const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

const GAME_FIELDS: &str = "id,name,summary,first_release_date,aggregated_rating,rating_count,category,game_status,cover,url,genres,platforms,franchises,collections,game_modes,themes,multiplayer_modes,involved_companies,websites";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub auth_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub user_agent: Option<String>,
    pub timeout: Duration,
    pub pacing: PacingConfig,
    pub retry: RetryConfig,
}

impl GatewayConfig {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            base_url: "https://api.igdb.com/v4".to_string(),
            auth_url: "https://id.twitch.tv/oauth2/token".to_string(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            user_agent: None,
            timeout: Duration::from_secs(20),
            pacing: PacingConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// Adaptive inter-request delay parameters.
#[derive(Debug, Clone, Copy)]
pub struct PacingConfig {
    pub initial_delay: Duration,
    /// Floor once more than 3 consecutive requests succeeded.
    pub relaxed_floor: Duration,
    /// Tighter floor once more than 10 consecutive requests succeeded.
    pub fast_floor: Duration,
    pub coarse_step: Duration,
    pub fine_step: Duration,
    pub failure_penalty: Duration,
    pub max_delay: Duration,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(800),
            relaxed_floor: Duration::from_millis(500),
            fast_floor: Duration::from_millis(300),
            coarse_step: Duration::from_millis(100),
            fine_step: Duration::from_millis(50),
            failure_penalty: Duration::from_millis(300),
            max_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

impl RetryConfig {
    /// Rate-limit backoff: `2^attempt` seconds; sub-second jitter is added at
    /// the call site.
    pub fn rate_limit_wait(&self, attempt: usize) -> Duration {
        let secs = 1u64.checked_shl(attempt as u32).unwrap_or(u64::MAX).min(60);
        Duration::from_secs(secs)
    }

    /// Linear backoff for other failures: `1 + 0.5 * attempt` seconds.
    pub fn error_wait(&self, attempt: usize) -> Duration {
        Duration::from_millis(1_000 + 500 * attempt as u64)
    }
}

/// Sub-second jitter derived from the clock, good enough to decorrelate
/// concurrent workers backing off from the same 429.
fn subsecond_jitter() -> Duration {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    Duration::from_millis(u64::from(nanos % 1_000))
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("token exchange failed: {0}")]
    Auth(String),
    #[error("rate limited after {retries} retries at {url}")]
    RateLimited { retries: usize, url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed after retries: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("decoding {endpoint} response: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
struct AuthToken {
    bearer: String,
    expires_at: Instant,
}

impl AuthToken {
    fn needs_refresh(&self, margin: Duration, now: Instant) -> bool {
        now + margin >= self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// Adaptive pacer. Admission is a single serialized wait-then-stamp critical
/// section, so concurrent workers line up rather than stampede.
#[derive(Debug)]
pub struct Pacer {
    config: PacingConfig,
    state: Mutex<PacerState>,
}

#[derive(Debug, Clone, Copy)]
struct PacerState {
    delay: Duration,
    streak: u32,
    last_request: Option<Instant>,
}

impl Pacer {
    pub fn new(config: PacingConfig) -> Self {
        Self {
            state: Mutex::new(PacerState {
                delay: config.initial_delay,
                streak: 0,
                last_request: None,
            }),
            config,
        }
    }

    pub async fn admit(&self) {
        let mut state = self.state.lock().await;
        if let Some(last) = state.last_request {
            let elapsed = last.elapsed();
            if elapsed < state.delay {
                // Sleeping with the lock held is what serializes admission.
                tokio::time::sleep(state.delay - elapsed).await;
            }
        }
        state.last_request = Some(Instant::now());
    }

    pub async fn record(&self, success: bool) {
        let mut state = self.state.lock().await;
        Self::adjust(&self.config, &mut state, success);
    }

    pub async fn current_delay(&self) -> Duration {
        self.state.lock().await.delay
    }

    fn adjust(config: &PacingConfig, state: &mut PacerState, success: bool) {
        if success {
            state.streak += 1;
            if state.streak > 10 && state.delay > config.fast_floor {
                state.delay = state.delay.saturating_sub(config.fine_step).max(config.fast_floor);
            } else if state.streak > 3 && state.delay > config.relaxed_floor {
                state.delay = state
                    .delay
                    .saturating_sub(config.coarse_step)
                    .max(config.relaxed_floor);
            }
        } else {
            state.streak = 0;
            state.delay = (state.delay + config.failure_penalty).min(config.max_delay);
        }
    }
}

/// Run-scoped memo table: concurrent readers, append-only writers, first
/// insert wins. Never invalidated within a run.
#[derive(Debug)]
pub struct RunCache<K, V> {
    inner: Mutex<HashMap<K, V>>,
}

impl<K, V> Default for RunCache<K, V> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash, V: Clone> RunCache<K, V> {
    pub async fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().await.get(key).cloned()
    }

    /// Inserts unless the key is already present; returns the value that ended
    /// up stored. Duplicate in-flight lookups may both compute, but the cache
    /// itself never corrupts.
    pub async fn insert_first(&self, key: K, value: V) -> V {
        let mut map = self.inner.lock().await;
        map.entry(key).or_insert(value).clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

/// Canonical cache key for an id set: sorted and deduplicated, so equivalent
/// requests coalesce regardless of order.
pub fn normalize_ids(ids: &[u64]) -> Vec<u64> {
    let mut ids = ids.to_vec();
    ids.sort_unstable();
    ids.dedup();
    ids
}

fn join_ids(ids: &[u64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn escape_search(term: &str) -> String {
    term.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Catalog game row, decoded once at the wire boundary and immutable within a
/// run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameRow {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub first_release_date: Option<i64>,
    #[serde(default)]
    pub aggregated_rating: Option<f64>,
    #[serde(default)]
    pub rating_count: Option<u64>,
    #[serde(default)]
    pub category: Option<u32>,
    #[serde(default)]
    pub game_status: Option<u32>,
    #[serde(default)]
    pub cover: Option<u64>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub genres: Vec<u64>,
    #[serde(default)]
    pub platforms: Vec<u64>,
    #[serde(default)]
    pub franchises: Vec<u64>,
    #[serde(default)]
    pub collections: Vec<u64>,
    #[serde(default)]
    pub game_modes: Vec<u64>,
    #[serde(default)]
    pub themes: Vec<u64>,
    #[serde(default)]
    pub multiplayer_modes: Vec<u64>,
    #[serde(default)]
    pub involved_companies: Vec<u64>,
    #[serde(default)]
    pub websites: Vec<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedRow {
    pub id: u64,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformRow {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub platform_family: Option<u64>,
    #[serde(default)]
    pub platform_type: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvolvedCompanyRow {
    pub id: u64,
    #[serde(default)]
    pub company: Option<u64>,
    #[serde(default)]
    pub developer: bool,
    #[serde(default)]
    pub publisher: bool,
}

/// Multiplayer capability row. Flags outside the typed set land in `extra`
/// and fall back to the humanized label rule.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MultiplayerModeRow {
    pub id: u64,
    #[serde(default)]
    pub campaigncoop: bool,
    #[serde(default)]
    pub dropin: bool,
    #[serde(default)]
    pub lancoop: bool,
    #[serde(default)]
    pub offlinecoop: bool,
    #[serde(default)]
    pub onlinecoop: bool,
    #[serde(default)]
    pub splitscreen: bool,
    #[serde(default)]
    pub offlinemax: Option<u32>,
    #[serde(default)]
    pub onlinemax: Option<u32>,
    #[serde(default)]
    pub offlinecoopmax: Option<u32>,
    #[serde(default)]
    pub onlinecoopmax: Option<u32>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoverRow {
    pub id: u64,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebsiteRow {
    pub id: u64,
    #[serde(default)]
    pub category: Option<u32>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionRow {
    pub game_id: u64,
    #[serde(default)]
    pub normally: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompanyRoles {
    pub developers: Vec<String>,
    pub publishers: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultiplayerSummary {
    pub features: Vec<String>,
    pub offline_max: Option<u32>,
    pub online_max: Option<u32>,
    pub offline_coop_max: Option<u32>,
    pub online_coop_max: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlatformFacets {
    pub names: Vec<String>,
    pub families: Vec<String>,
    pub types: Vec<String>,
}

/// Fully resolved view of one game: every reference id replaced by display
/// data, ready for formatting.
#[derive(Debug, Clone, Default)]
pub struct EnrichedGame {
    pub game: GameRow,
    pub genres: Vec<String>,
    pub platforms: PlatformFacets,
    pub franchises: Vec<String>,
    pub collections: Vec<String>,
    pub game_modes: Vec<String>,
    pub themes: Vec<String>,
    pub companies: CompanyRoles,
    pub multiplayer: MultiplayerSummary,
    pub completion_hours: Option<f64>,
    pub cover_url: Option<String>,
    pub website: Option<String>,
}

/// Cover image urls arrive scheme-relative and thumb-sized; upgrade to the
/// original-size asset with an absolute scheme.
pub fn upgrade_cover_url(raw: &str) -> String {
    let mut url = raw.to_string();
    for segment in ["t_thumb", "t_cover_small", "t_cover_big"] {
        url = url.replace(segment, "t_original");
    }
    if url.starts_with("//") {
        url = format!("https:{url}");
    }
    url
}

/// Completion seconds to hours, one decimal.
pub fn seconds_to_hours(seconds: u64) -> f64 {
    (seconds as f64 / 3600.0 * 10.0).round() / 10.0
}

/// Collapse multiplayer rows into a feature list plus per-kind player maxima.
/// Known flags use the closed label table; unknown truthy boolean flags fall
/// back to the humanized label rule.
pub fn summarize_multiplayer(rows: &[MultiplayerModeRow]) -> MultiplayerSummary {
    let mut features = Vec::new();
    let mut seen = BTreeSet::new();
    let mut summary = MultiplayerSummary::default();

    for row in rows {
        let typed_flags = [
            ("campaigncoop", row.campaigncoop),
            ("dropin", row.dropin),
            ("lancoop", row.lancoop),
            ("offlinecoop", row.offlinecoop),
            ("onlinecoop", row.onlinecoop),
            ("splitscreen", row.splitscreen),
        ];
        for (flag, set) in typed_flags {
            if !set {
                continue;
            }
            if let Some(label) = gamedex_core::labels::multiplayer_feature(flag) {
                if seen.insert(label.to_string()) {
                    features.push(label.to_string());
                }
            }
        }
        for (flag, value) in &row.extra {
            if matches!(flag.as_str(), "id" | "game" | "platform" | "checksum") {
                continue;
            }
            if value.as_bool() == Some(true) {
                let label = gamedex_core::labels::humanize_flag(flag);
                if seen.insert(label.clone()) {
                    features.push(label);
                }
            }
        }

        summary.offline_max = summary.offline_max.max(row.offlinemax);
        summary.online_max = summary.online_max.max(row.onlinemax);
        summary.offline_coop_max = summary.offline_coop_max.max(row.offlinecoopmax);
        summary.online_coop_max = summary.online_coop_max.max(row.onlinecoopmax);
    }

    summary.features = features;
    summary
}

pub struct GatewayClient {
    http: reqwest::Client,
    config: GatewayConfig,
    pacer: Pacer,
    token: Mutex<Option<AuthToken>>,
    named: RunCache<(&'static str, Vec<u64>), Vec<String>>,
    platform_facets_cache: RunCache<Vec<u64>, PlatformFacets>,
    companies: RunCache<Vec<u64>, CompanyRoles>,
    multiplayer: RunCache<Vec<u64>, MultiplayerSummary>,
    covers: RunCache<u64, Option<String>>,
    websites: RunCache<Vec<u64>, Option<String>>,
    completion: RunCache<u64, Option<f64>>,
    games: RunCache<u64, Option<GameRow>>,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let http = builder.build()?;
        Ok(Self {
            http,
            pacer: Pacer::new(config.pacing),
            config,
            token: Mutex::new(None),
            named: RunCache::default(),
            platform_facets_cache: RunCache::default(),
            companies: RunCache::default(),
            multiplayer: RunCache::default(),
            covers: RunCache::default(),
            websites: RunCache::default(),
            completion: RunCache::default(),
            games: RunCache::default(),
        })
    }

    pub fn pacer(&self) -> &Pacer {
        &self.pacer
    }

    /// Force a token exchange up front so a bad credential fails the run
    /// before any record is touched.
    pub async fn authenticate(&self) -> Result<(), GatewayError> {
        let token = self.exchange_token().await?;
        *self.token.lock().await = Some(token);
        Ok(())
    }

    async fn bearer(&self) -> Result<String, GatewayError> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            if !token.needs_refresh(TOKEN_EXPIRY_MARGIN, Instant::now()) {
                return Ok(token.bearer.clone());
            }
            debug!("bearer token within expiry margin, refreshing");
        }
        let token = self.exchange_token().await?;
        let bearer = token.bearer.clone();
        *guard = Some(token);
        Ok(bearer)
    }

    async fn exchange_token(&self) -> Result<AuthToken, GatewayError> {
        let response = self
            .http
            .post(&self.config.auth_url)
            .query(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .map_err(|err| GatewayError::Auth(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Auth(format!(
                "token endpoint returned {status}"
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|err| GatewayError::Auth(err.to_string()))?;
        info!(expires_in = body.expires_in, "obtained bearer token");
        Ok(AuthToken {
            bearer: body.access_token,
            expires_at: Instant::now() + Duration::from_secs(body.expires_in),
        })
    }

    /// POST a structured query to one catalog endpoint and decode the ordered
    /// row list. Pacing admission, outcome recording, and the bounded retry
    /// policy all live here; higher-level lookups never retry themselves.
    pub async fn query<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &str,
    ) -> Result<Vec<T>, GatewayError> {
        let bearer = self.bearer().await?;
        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), endpoint);
        let mut attempt = 0usize;

        loop {
            self.pacer.admit().await;
            let result = self
                .http
                .post(&url)
                .header("Client-ID", &self.config.client_id)
                .header(reqwest::header::ACCEPT, "application/json")
                .bearer_auth(&bearer)
                .body(body.to_string())
                .send()
                .await;

            match result {
                Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                    self.pacer.record(false).await;
                    if attempt >= self.config.retry.max_retries {
                        return Err(GatewayError::RateLimited {
                            retries: attempt,
                            url,
                        });
                    }
                    let wait = self.config.retry.rate_limit_wait(attempt) + subsecond_jitter();
                    warn!(endpoint, attempt, wait_ms = wait.as_millis() as u64, "rate limited");
                    tokio::time::sleep(wait).await;
                }
                Ok(response) if !response.status().is_success() => {
                    self.pacer.record(false).await;
                    let status = response.status().as_u16();
                    if attempt >= self.config.retry.max_retries {
                        return Err(GatewayError::HttpStatus { status, url });
                    }
                    warn!(endpoint, attempt, status, "request failed, retrying");
                    tokio::time::sleep(self.config.retry.error_wait(attempt)).await;
                }
                Ok(response) => {
                    self.pacer.record(true).await;
                    let text = response.text().await?;
                    return serde_json::from_str(&text).map_err(|source| GatewayError::Decode {
                        endpoint: endpoint.to_string(),
                        source,
                    });
                }
                Err(err) => {
                    self.pacer.record(false).await;
                    if attempt >= self.config.retry.max_retries {
                        return Err(GatewayError::Transport(err));
                    }
                    warn!(endpoint, attempt, error = %err, "transport failure, retrying");
                    tokio::time::sleep(self.config.retry.error_wait(attempt)).await;
                }
            }
            attempt += 1;
        }
    }

    pub async fn search_games(&self, title: &str) -> Result<Vec<GameRow>, GatewayError> {
        let body = format!(
            "search \"{}\"; fields {GAME_FIELDS}; limit 20;",
            escape_search(title)
        );
        self.query("games", &body).await
    }

    pub async fn game_by_id(&self, id: u64) -> Result<Option<GameRow>, GatewayError> {
        if let Some(hit) = self.games.get(&id).await {
            return Ok(hit);
        }
        let body = format!("fields {GAME_FIELDS}; where id = {id};");
        let rows: Vec<GameRow> = self.query("games", &body).await?;
        Ok(self.games.insert_first(id, rows.into_iter().next()).await)
    }

    /// Resolve an id list against a name-bearing endpoint, preserving the
    /// service's row order.
    async fn named_lookup(
        &self,
        endpoint: &'static str,
        ids: &[u64],
    ) -> Result<Vec<String>, GatewayError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let key = (endpoint, normalize_ids(ids));
        if let Some(hit) = self.named.get(&key).await {
            return Ok(hit);
        }
        let body = format!("fields name; where id = ({}); limit 500;", join_ids(&key.1));
        let rows: Vec<NamedRow> = self.query(endpoint, &body).await?;
        let names = rows.into_iter().map(|row| row.name).collect();
        Ok(self.named.insert_first(key, names).await)
    }

    pub async fn genre_names(&self, ids: &[u64]) -> Result<Vec<String>, GatewayError> {
        self.named_lookup("genres", ids).await
    }

    pub async fn franchise_names(&self, ids: &[u64]) -> Result<Vec<String>, GatewayError> {
        self.named_lookup("franchises", ids).await
    }

    pub async fn collection_names(&self, ids: &[u64]) -> Result<Vec<String>, GatewayError> {
        self.named_lookup("collections", ids).await
    }

    pub async fn game_mode_names(&self, ids: &[u64]) -> Result<Vec<String>, GatewayError> {
        self.named_lookup("game_modes", ids).await
    }

    pub async fn theme_names(&self, ids: &[u64]) -> Result<Vec<String>, GatewayError> {
        self.named_lookup("themes", ids).await
    }

    /// Platform names plus their family and type facets, resolved together
    /// because they share one platforms query.
    pub async fn platform_facets(&self, ids: &[u64]) -> Result<PlatformFacets, GatewayError> {
        if ids.is_empty() {
            return Ok(PlatformFacets::default());
        }
        let key = normalize_ids(ids);
        if let Some(hit) = self.platform_facets_cache.get(&key).await {
            return Ok(hit);
        }

        let body = format!(
            "fields name,platform_family,platform_type; where id = ({}); limit 500;",
            join_ids(&key)
        );
        let rows: Vec<PlatformRow> = self.query("platforms", &body).await?;
        let names = rows.iter().map(|row| row.name.clone()).collect();
        let family_ids: Vec<u64> = rows.iter().filter_map(|row| row.platform_family).collect();
        let families = self.named_lookup("platform_families", &family_ids).await?;

        let mut seen = BTreeSet::new();
        let mut types = Vec::new();
        for code in rows.iter().filter_map(|row| row.platform_type) {
            let label = gamedex_core::labels::platform_type(code);
            if seen.insert(label.clone()) {
                types.push(label);
            }
        }

        let facets = PlatformFacets {
            names,
            families,
            types,
        };
        Ok(self.platform_facets_cache.insert_first(key, facets).await)
    }

    pub async fn company_roles(&self, involved_ids: &[u64]) -> Result<CompanyRoles, GatewayError> {
        if involved_ids.is_empty() {
            return Ok(CompanyRoles::default());
        }
        let key = normalize_ids(involved_ids);
        if let Some(hit) = self.companies.get(&key).await {
            return Ok(hit);
        }

        let body = format!(
            "fields company,developer,publisher; where id = ({}); limit 500;",
            join_ids(&key)
        );
        let involvements: Vec<InvolvedCompanyRow> = self.query("involved_companies", &body).await?;
        let company_ids: Vec<u64> = involvements.iter().filter_map(|row| row.company).collect();

        let mut names: HashMap<u64, String> = HashMap::new();
        if !company_ids.is_empty() {
            let ids = normalize_ids(&company_ids);
            let body = format!("fields name; where id = ({}); limit 500;", join_ids(&ids));
            let rows: Vec<NamedRow> = self.query("companies", &body).await?;
            names = rows.into_iter().map(|row| (row.id, row.name)).collect();
        }

        let mut roles = CompanyRoles::default();
        for involvement in &involvements {
            let name = involvement.company.and_then(|id| names.get(&id).cloned());
            let Some(name) = name else { continue };
            if involvement.developer && !roles.developers.contains(&name) {
                roles.developers.push(name.clone());
            }
            if involvement.publisher && !roles.publishers.contains(&name) {
                roles.publishers.push(name);
            }
        }
        Ok(self.companies.insert_first(key, roles).await)
    }

    pub async fn multiplayer_summary(
        &self,
        ids: &[u64],
    ) -> Result<MultiplayerSummary, GatewayError> {
        if ids.is_empty() {
            return Ok(MultiplayerSummary::default());
        }
        let key = normalize_ids(ids);
        if let Some(hit) = self.multiplayer.get(&key).await {
            return Ok(hit);
        }
        let body = format!("fields *; where id = ({}); limit 500;", join_ids(&key));
        let rows: Vec<MultiplayerModeRow> = self.query("multiplayer_modes", &body).await?;
        let summary = summarize_multiplayer(&rows);
        Ok(self.multiplayer.insert_first(key, summary).await)
    }

    pub async fn cover_url(&self, cover_id: u64) -> Result<Option<String>, GatewayError> {
        if let Some(hit) = self.covers.get(&cover_id).await {
            return Ok(hit);
        }
        let body = format!("fields url; where id = {cover_id};");
        let rows: Vec<CoverRow> = self.query("covers", &body).await?;
        let url = rows
            .into_iter()
            .next()
            .and_then(|row| row.url)
            .map(|raw| upgrade_cover_url(&raw));
        Ok(self.covers.insert_first(cover_id, url).await)
    }

    /// Official website when one exists (category 1), otherwise the first
    /// listed site.
    pub async fn website_url(&self, ids: &[u64]) -> Result<Option<String>, GatewayError> {
        if ids.is_empty() {
            return Ok(None);
        }
        let key = normalize_ids(ids);
        if let Some(hit) = self.websites.get(&key).await {
            return Ok(hit);
        }
        let body = format!("fields category,url; where id = ({}); limit 500;", join_ids(&key));
        let rows: Vec<WebsiteRow> = self.query("websites", &body).await?;
        let official = rows
            .iter()
            .find(|row| row.category == Some(1))
            .and_then(|row| row.url.clone());
        let url = official.or_else(|| rows.into_iter().find_map(|row| row.url));
        Ok(self.websites.insert_first(key, url).await)
    }

    pub async fn completion_hours(&self, game_id: u64) -> Result<Option<f64>, GatewayError> {
        if let Some(hit) = self.completion.get(&game_id).await {
            return Ok(hit);
        }
        let body = format!("fields game_id,normally; where game_id = {game_id};");
        let rows: Vec<CompletionRow> = self.query("game_time_to_beats", &body).await?;
        let hours = rows
            .into_iter()
            .next()
            .and_then(|row| row.normally)
            .map(seconds_to_hours);
        Ok(self.completion.insert_first(game_id, hours).await)
    }

    /// Resolve every reference list on the row to display data.
    pub async fn enrich(&self, game: &GameRow) -> Result<EnrichedGame, GatewayError> {
        let genres = self.genre_names(&game.genres).await?;
        let platforms = self.platform_facets(&game.platforms).await?;
        let franchises = self.franchise_names(&game.franchises).await?;
        let collections = self.collection_names(&game.collections).await?;
        let game_modes = self.game_mode_names(&game.game_modes).await?;
        let themes = self.theme_names(&game.themes).await?;
        let companies = self.company_roles(&game.involved_companies).await?;
        let multiplayer = self.multiplayer_summary(&game.multiplayer_modes).await?;
        let completion_hours = self.completion_hours(game.id).await?;
        let cover_url = match game.cover {
            Some(cover_id) => self.cover_url(cover_id).await?,
            None => None,
        };
        let website = self.website_url(&game.websites).await?;

        Ok(EnrichedGame {
            game: game.clone(),
            genres,
            platforms,
            franchises,
            collections,
            game_modes,
            themes,
            companies,
            multiplayer,
            completion_hours,
            cover_url,
            website,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(delay_ms: u64, streak: u32) -> PacerState {
        PacerState {
            delay: Duration::from_millis(delay_ms),
            streak,
            last_request: None,
        }
    }

    #[test]
    fn pacing_steps_down_after_streaks() {
        let config = PacingConfig::default();

        let mut s = state(800, 3);
        Pacer::adjust(&config, &mut s, true);
        assert_eq!(s.streak, 4);
        assert_eq!(s.delay, Duration::from_millis(700));

        // At the relaxed floor the coarse step stops.
        let mut s = state(500, 8);
        Pacer::adjust(&config, &mut s, true);
        assert_eq!(s.delay, Duration::from_millis(500));

        // A long streak unlocks the fine step toward the fast floor.
        let mut s = state(500, 10);
        Pacer::adjust(&config, &mut s, true);
        assert_eq!(s.delay, Duration::from_millis(450));

        let mut s = state(320, 20);
        Pacer::adjust(&config, &mut s, true);
        assert_eq!(s.delay, Duration::from_millis(300));
    }

    #[test]
    fn pacing_failure_resets_streak_and_penalizes() {
        let config = PacingConfig::default();
        let mut s = state(500, 12);
        Pacer::adjust(&config, &mut s, false);
        assert_eq!(s.streak, 0);
        assert_eq!(s.delay, Duration::from_millis(800));

        let mut s = state(1900, 0);
        Pacer::adjust(&config, &mut s, false);
        assert_eq!(s.delay, Duration::from_secs(2));
    }

    #[test]
    fn retry_waits_match_policy() {
        let retry = RetryConfig::default();
        assert_eq!(retry.rate_limit_wait(0), Duration::from_secs(1));
        assert_eq!(retry.rate_limit_wait(2), Duration::from_secs(4));
        assert_eq!(retry.error_wait(0), Duration::from_millis(1_000));
        assert_eq!(retry.error_wait(2), Duration::from_millis(2_000));
    }

    #[test]
    fn token_refresh_honors_margin() {
        let now = Instant::now();
        let fresh = AuthToken {
            bearer: "t".into(),
            expires_at: now + Duration::from_secs(3600),
        };
        assert!(!fresh.needs_refresh(TOKEN_EXPIRY_MARGIN, now));

        let expiring = AuthToken {
            bearer: "t".into(),
            expires_at: now + Duration::from_secs(30),
        };
        assert!(expiring.needs_refresh(TOKEN_EXPIRY_MARGIN, now));
    }

    #[test]
    fn id_normalization_is_order_and_duplicate_insensitive() {
        assert_eq!(normalize_ids(&[3, 1, 2, 1]), vec![1, 2, 3]);
        assert_eq!(normalize_ids(&[]), Vec::<u64>::new());
    }

    #[tokio::test]
    async fn cache_first_insert_wins() {
        let cache: RunCache<Vec<u64>, Vec<String>> = RunCache::default();
        let key = normalize_ids(&[2, 1]);
        let stored = cache
            .insert_first(key.clone(), vec!["Action".to_string()])
            .await;
        assert_eq!(stored, vec!["Action".to_string()]);

        let second = cache
            .insert_first(key.clone(), vec!["Racing".to_string()])
            .await;
        assert_eq!(second, vec!["Action".to_string()]);
        assert_eq!(cache.get(&key).await, Some(vec!["Action".to_string()]));
        assert_eq!(cache.len().await, 1);
    }

    #[test]
    fn cover_urls_are_upgraded_and_absolutized() {
        assert_eq!(
            upgrade_cover_url("//images.example.com/upload/t_thumb/co1wyy.jpg"),
            "https://images.example.com/upload/t_original/co1wyy.jpg"
        );
        assert_eq!(
            upgrade_cover_url("https://images.example.com/upload/t_cover_big/co2abc.jpg"),
            "https://images.example.com/upload/t_original/co2abc.jpg"
        );
    }

    #[test]
    fn completion_hours_round_to_one_decimal() {
        assert_eq!(seconds_to_hours(3600), 1.0);
        assert_eq!(seconds_to_hours(5400), 1.5);
        assert_eq!(seconds_to_hours(100_000), 27.8);
    }

    #[test]
    fn game_row_decodes_with_sparse_fields() {
        let json = r#"[{"id": 1234, "name": "Portal", "genres": [8, 31], "cover": 99}]"#;
        let rows: Vec<GameRow> = serde_json::from_str(json).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, 1234);
        assert_eq!(rows[0].genres, vec![8, 31]);
        assert!(rows[0].platforms.is_empty());
        assert!(rows[0].aggregated_rating.is_none());
    }

    #[test]
    fn multiplayer_summary_uses_table_then_fallback() {
        let json = r#"[
            {"id": 1, "lancoop": true, "splitscreen": true, "onlinemax": 4, "crossplay": true, "game": 9},
            {"id": 2, "lancoop": true, "onlinemax": 8, "offlinemax": 2}
        ]"#;
        let rows: Vec<MultiplayerModeRow> = serde_json::from_str(json).unwrap();
        let summary = summarize_multiplayer(&rows);
        assert_eq!(
            summary.features,
            vec!["LAN Co-op", "Split Screen", "Crossplay"]
        );
        assert_eq!(summary.online_max, Some(8));
        assert_eq!(summary.offline_max, Some(2));
        assert_eq!(summary.offline_coop_max, None);
    }
}
