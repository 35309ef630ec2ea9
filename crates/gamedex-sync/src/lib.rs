//! Reconciliation pipeline: the destination seam, property formatting,
//! per-record reconciliation, and the bounded-concurrency run engine.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use gamedex_core::{
    FieldBehavior, FieldBinding, LibraryRecord, LogicalField, MappingConfig, PropertyId,
    PropertyMap, PropertyValue, SyncOutcome,
};
use gamedex_gateway::{EnrichedGame, GameRow, GatewayClient, GatewayError, PlatformFacets};
use gamedex_match::Matcher;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gamedex-sync";

pub const DEFAULT_WORKERS: usize = 3;

/// Run-level configuration, independent of per-invocation options.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub library_id: String,
    pub mapping_path: PathBuf,
    /// Emoji or image url stamped onto updated records.
    pub icon: Option<String>,
    pub worker_warn_threshold: usize,
    /// When no formal status code exists, infer Released/Announced from the
    /// release date.
    pub infer_status_from_release: bool,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            library_id: std::env::var("GAMEDEX_LIBRARY_ID").unwrap_or_default(),
            mapping_path: std::env::var("GAMEDEX_MAPPING_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("mapping.yaml")),
            icon: std::env::var("GAMEDEX_ICON")
                .ok()
                .or_else(|| Some("\u{1F3AE}".to_string())),
            worker_warn_threshold: 4,
            infer_status_from_release: std::env::var("GAMEDEX_INFER_STATUS")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
        }
    }
}

pub fn load_mapping_config(path: &Path) -> anyhow::Result<MappingConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Destination(#[from] DestinationError),
}

/// Minimal write against one destination record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    pub properties: BTreeMap<PropertyId, PropertyValue>,
    pub cover_url: Option<String>,
    pub icon: Option<String>,
}

/// Raw CRUD seam over the destination store. Implementations own pagination
/// and the wire property format; the pipeline only sees typed records.
#[async_trait]
pub trait DestinationStore: Send + Sync {
    /// Property id -> property display name for the library.
    async fn schema(&self, library_id: &str)
        -> Result<BTreeMap<PropertyId, String>, DestinationError>;
    async fn list_records(&self, library_id: &str)
        -> Result<Vec<LibraryRecord>, DestinationError>;
    async fn fetch_record(&self, record_id: &str) -> Result<LibraryRecord, DestinationError>;
    async fn update_record(
        &self,
        record_id: &str,
        patch: RecordPatch,
    ) -> Result<(), DestinationError>;
}

/// Catalog-side seam the reconciler drives; `GatewayClient` is the production
/// implementation.
#[async_trait]
pub trait ReferenceGateway: Send + Sync {
    async fn authenticate(&self) -> Result<(), GatewayError>;
    async fn entity_by_id(&self, id: u64) -> Result<Option<GameRow>, GatewayError>;
    async fn resolve_title(&self, title: &str) -> Result<Option<GameRow>, GatewayError>;
    async fn enrich(&self, game: &GameRow) -> Result<EnrichedGame, GatewayError>;
    async fn platform_facets(&self, ids: &[u64]) -> Result<PlatformFacets, GatewayError>;
    /// Current adaptive inter-request delay, used to derive the courtesy gap
    /// between result collections.
    async fn pacing_delay(&self) -> Duration;
}

#[async_trait]
impl ReferenceGateway for GatewayClient {
    async fn authenticate(&self) -> Result<(), GatewayError> {
        GatewayClient::authenticate(self).await
    }

    async fn entity_by_id(&self, id: u64) -> Result<Option<GameRow>, GatewayError> {
        self.game_by_id(id).await
    }

    async fn resolve_title(&self, title: &str) -> Result<Option<GameRow>, GatewayError> {
        Matcher::new(self).resolve(title).await
    }

    async fn enrich(&self, game: &GameRow) -> Result<EnrichedGame, GatewayError> {
        GatewayClient::enrich(self, game).await
    }

    async fn platform_facets(&self, ids: &[u64]) -> Result<PlatformFacets, GatewayError> {
        GatewayClient::platform_facets(self, ids).await
    }

    async fn pacing_delay(&self) -> Duration {
        self.pacer().current_delay().await
    }
}

/// Record ids compare dash-insensitively and case-insensitively across
/// transports.
pub fn normalize_record_id(id: &str) -> String {
    id.chars()
        .filter(|c| *c != '-')
        .collect::<String>()
        .to_lowercase()
}

/// Resolve the mapping file against the live destination schema. Bindings
/// whose property id is missing from the schema are dropped with a warning;
/// a run without a title binding cannot resolve anything and is rejected.
pub fn build_property_map(
    config: &MappingConfig,
    schema: &BTreeMap<PropertyId, String>,
) -> Result<PropertyMap, SyncError> {
    let mut bindings = BTreeMap::new();
    for (field, mapping) in &config.fields {
        let Some(property_id) = &mapping.property else {
            continue;
        };
        if !schema.contains_key(property_id) {
            warn!(
                field = ?field,
                property_id = %property_id,
                "mapped property missing from destination schema, dropping"
            );
            continue;
        }
        bindings.insert(
            *field,
            FieldBinding {
                property_id: property_id.clone(),
                behavior: mapping.behavior,
            },
        );
    }

    let map = PropertyMap::from_bindings(bindings);
    if !map.is_bound(LogicalField::Title) {
        return Err(SyncError::Precondition(
            "no title field configured in the mapping".to_string(),
        ));
    }
    Ok(map)
}

pub fn unix_to_date(ts: i64) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp(ts, 0).map(|dt| dt.date_naive())
}

/// Sanitize one multi-select option: separator characters become spaces,
/// whitespace collapses, length caps at 100.
pub fn clean_facet(value: &str) -> String {
    let replaced: String = value
        .chars()
        .map(|c| if matches!(c, ',' | ';') { ' ' } else { c })
        .collect();
    replaced
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(100)
        .collect()
}

fn facet_values(values: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for value in values {
        let cleaned = clean_facet(value);
        if !cleaned.is_empty() && !out.contains(&cleaned) {
            out.push(cleaned);
        }
    }
    out
}

fn multi_select(values: &[String]) -> Option<PropertyValue> {
    let values = facet_values(values);
    if values.is_empty() {
        None
    } else {
        Some(PropertyValue::MultiSelect(values))
    }
}

/// Map an enriched entity into destination-shaped values for every bound
/// logical field with data. Pure: same enriched entity and mapping, same
/// output. The destination title stays authoritative and is never emitted;
/// the last-synchronized stamp belongs to the reconciler.
pub fn format_properties(
    enriched: &EnrichedGame,
    mapping: &PropertyMap,
    infer_status_from_release: bool,
) -> BTreeMap<LogicalField, PropertyValue> {
    let game = &enriched.game;
    let mut out = BTreeMap::new();
    let mut put = |field: LogicalField, value: Option<PropertyValue>| {
        if let Some(value) = value {
            if mapping.is_bound(field) {
                out.insert(field, value);
            }
        }
    };

    put(
        LogicalField::Description,
        game.summary
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(|s| PropertyValue::Text(s.to_string())),
    );
    put(
        LogicalField::ReleaseDate,
        game.first_release_date
            .and_then(unix_to_date)
            .map(PropertyValue::Date),
    );
    put(
        LogicalField::Rating,
        game.aggregated_rating
            .map(|r| PropertyValue::Number(r / 100.0)),
    );
    put(
        LogicalField::RatingCount,
        game.rating_count.map(|c| PropertyValue::Number(c as f64)),
    );
    put(
        LogicalField::Playtime,
        enriched.completion_hours.map(PropertyValue::Number),
    );
    put(LogicalField::ExternalId, Some(PropertyValue::Number(game.id as f64)));

    put(LogicalField::Genres, multi_select(&enriched.genres));
    put(LogicalField::Platforms, multi_select(&enriched.platforms.names));
    put(
        LogicalField::PlatformFamily,
        multi_select(&enriched.platforms.families),
    );
    put(
        LogicalField::PlatformType,
        multi_select(&enriched.platforms.types),
    );
    put(
        LogicalField::Developers,
        multi_select(&enriched.companies.developers),
    );
    put(
        LogicalField::Publishers,
        multi_select(&enriched.companies.publishers),
    );
    put(LogicalField::Franchises, multi_select(&enriched.franchises));
    put(LogicalField::Collections, multi_select(&enriched.collections));
    put(LogicalField::GameModes, multi_select(&enriched.game_modes));
    put(LogicalField::Themes, multi_select(&enriched.themes));
    put(
        LogicalField::MultiplayerModes,
        multi_select(&enriched.multiplayer.features),
    );

    let status = match game.game_status {
        Some(code) => Some(gamedex_core::labels::release_status(code)),
        None if infer_status_from_release => game.first_release_date.map(|ts| {
            if ts > Utc::now().timestamp() {
                "Announced".to_string()
            } else {
                "Released".to_string()
            }
        }),
        None => None,
    };
    put(LogicalField::GameStatus, status.map(PropertyValue::Status));
    put(
        LogicalField::GameType,
        game.category
            .map(|code| PropertyValue::MultiSelect(vec![gamedex_core::labels::category(code)])),
    );

    put(
        LogicalField::Website,
        enriched.website.clone().map(PropertyValue::Url),
    );
    put(
        LogicalField::Homepage,
        game.url.clone().map(PropertyValue::Url),
    );
    put(
        LogicalField::CoverImage,
        enriched.cover_url.clone().map(PropertyValue::Url),
    );

    put(
        LogicalField::OfflinePlayers,
        enriched
            .multiplayer
            .offline_max
            .map(|n| PropertyValue::Number(f64::from(n))),
    );
    put(
        LogicalField::OnlinePlayers,
        enriched
            .multiplayer
            .online_max
            .map(|n| PropertyValue::Number(f64::from(n))),
    );
    put(
        LogicalField::OfflineCoopPlayers,
        enriched
            .multiplayer
            .offline_coop_max
            .map(|n| PropertyValue::Number(f64::from(n))),
    );
    put(
        LogicalField::OnlineCoopPlayers,
        enriched
            .multiplayer
            .online_coop_max
            .map(|n| PropertyValue::Number(f64::from(n))),
    );

    out
}

/// Per-invocation options.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub force_icons: bool,
    pub force_full: bool,
    pub workers: usize,
    pub most_recent_only: bool,
    pub record_id: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            force_icons: false,
            force_full: false,
            workers: DEFAULT_WORKERS,
            most_recent_only: false,
            record_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub success: bool,
    pub total: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub message: Option<String>,
}

impl RunResult {
    fn failure(run_id: Uuid, started_at: DateTime<Utc>, message: String) -> Self {
        Self {
            run_id,
            success: false,
            total: 0,
            updated: 0,
            skipped: 0,
            failed: 0,
            started_at,
            finished_at: Utc::now(),
            message: Some(message),
        }
    }

    pub fn counts_reconcile(&self) -> bool {
        self.total == self.updated + self.skipped + self.failed
    }
}

/// Per-record state machine. Cheap to clone; one clone per worker task.
#[derive(Clone)]
pub struct Reconciler {
    gateway: Arc<dyn ReferenceGateway>,
    store: Arc<dyn DestinationStore>,
    mapping: Arc<PropertyMap>,
    config: Arc<SyncConfig>,
    options: RunOptions,
}

impl Reconciler {
    pub fn new(
        gateway: Arc<dyn ReferenceGateway>,
        store: Arc<dyn DestinationStore>,
        mapping: Arc<PropertyMap>,
        config: Arc<SyncConfig>,
        options: RunOptions,
    ) -> Self {
        Self {
            gateway,
            store,
            mapping,
            config,
            options,
        }
    }

    /// Reconcile one record. Errors never escape: anything that goes wrong
    /// maps to a Failed outcome for this record alone.
    pub async fn process(&self, record: &LibraryRecord) -> SyncOutcome {
        match self.process_inner(record).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(record_id = %record.id, error = %err, "record reconciliation failed");
                SyncOutcome::Failed(err.to_string())
            }
        }
    }

    fn title_of(&self, record: &LibraryRecord) -> Option<String> {
        self.mapping
            .property_id(LogicalField::Title)
            .and_then(|pid| record.property(pid))
            .and_then(|value| value.as_text())
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .map(ToString::to_string)
    }

    fn stored_external_id(&self, record: &LibraryRecord) -> Option<u64> {
        self.mapping
            .property_id(LogicalField::ExternalId)
            .and_then(|pid| record.property(pid))
            .and_then(|value| value.as_number())
            .filter(|n| *n >= 1.0)
            .map(|n| n as u64)
    }

    async fn process_inner(&self, record: &LibraryRecord) -> Result<SyncOutcome, SyncError> {
        let Some(title) = self.title_of(record) else {
            return Ok(SyncOutcome::Skipped("no title to resolve".to_string()));
        };
        let stored_id = self.stored_external_id(record);

        // Fast path: one detail fetch plus a narrow essential-field check.
        if let Some(id) = stored_id {
            if !self.options.force_full && !self.options.force_icons {
                if let Some(snapshot) = self.gateway.entity_by_id(id).await? {
                    if self.essentials_match(record, &snapshot).await? {
                        return Ok(SyncOutcome::Skipped(
                            "essential fields already current".to_string(),
                        ));
                    }
                }
            }
        }

        let resolved = match stored_id {
            Some(id) => match self.gateway.entity_by_id(id).await? {
                Some(game) => Some(game),
                // Stored id no longer resolves; fall back to the title.
                None => self.gateway.resolve_title(&title).await?,
            },
            None => self.gateway.resolve_title(&title).await?,
        };
        let Some(game) = resolved else {
            return Ok(SyncOutcome::Failed(format!(
                "no catalog entity found for '{title}'"
            )));
        };

        let enriched = self.gateway.enrich(&game).await?;
        let formatted = format_properties(
            &enriched,
            &self.mapping,
            self.config.infer_status_from_release,
        );

        let mut properties = BTreeMap::new();
        for (field, fresh) in formatted {
            let Some(binding) = self.mapping.binding(field) else {
                continue;
            };
            let stored = record.property(&binding.property_id);
            let next = match binding.behavior {
                FieldBehavior::Skip => continue,
                FieldBehavior::Preserve => {
                    if stored.is_some_and(|v| !v.is_empty()) {
                        continue;
                    }
                    fresh
                }
                FieldBehavior::Merge => fresh.merged_with(stored),
                FieldBehavior::Default => {
                    if fresh.is_empty() && stored.is_some_and(|v| !v.is_empty()) {
                        continue;
                    }
                    fresh
                }
            };
            if stored.map_or(true, |v| !v.same_as(&next)) {
                properties.insert(binding.property_id.clone(), next);
            }
        }

        let changed_fields = properties.len();
        if changed_fields == 0 && !self.options.force_icons {
            return Ok(SyncOutcome::Skipped("no changes detected".to_string()));
        }

        let mut patch = RecordPatch {
            properties,
            cover_url: enriched.cover_url.clone(),
            icon: self.config.icon.clone(),
        };
        if changed_fields > 0 {
            if let Some(pid) = self.mapping.property_id(LogicalField::LastSynced) {
                patch
                    .properties
                    .insert(pid.clone(), PropertyValue::Timestamp(Utc::now()));
            }
        }

        self.store.update_record(&record.id, patch).await?;
        if changed_fields > 0 {
            Ok(SyncOutcome::Updated(format!(
                "{changed_fields} properties updated"
            )))
        } else {
            Ok(SyncOutcome::Updated("icon refreshed".to_string()))
        }
    }

    /// Narrow essential subset: release date, rating on the destination
    /// scale, and platform facets as sets. A value the catalog has but the
    /// record lacks counts as drift; the reverse does not.
    async fn essentials_match(
        &self,
        record: &LibraryRecord,
        snapshot: &GameRow,
    ) -> Result<bool, SyncError> {
        if let Some(expected) = snapshot.first_release_date.and_then(unix_to_date) {
            if !self.stored_matches(record, LogicalField::ReleaseDate, &PropertyValue::Date(expected)) {
                return Ok(false);
            }
        }
        if let Some(rating) = snapshot.aggregated_rating {
            let expected = PropertyValue::Number(rating / 100.0);
            if !self.stored_matches(record, LogicalField::Rating, &expected) {
                return Ok(false);
            }
        }
        if !snapshot.platforms.is_empty() {
            let facets = self.gateway.platform_facets(&snapshot.platforms).await?;
            for (field, values) in [
                (LogicalField::Platforms, &facets.names),
                (LogicalField::PlatformFamily, &facets.families),
                (LogicalField::PlatformType, &facets.types),
            ] {
                let Some(expected) = multi_select(values) else {
                    continue;
                };
                if !self.stored_matches(record, field, &expected) {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn stored_matches(
        &self,
        record: &LibraryRecord,
        field: LogicalField,
        expected: &PropertyValue,
    ) -> bool {
        match self.mapping.property_id(field) {
            Some(pid) => record
                .property(pid)
                .is_some_and(|stored| stored.same_as(expected)),
            // An unbound field cannot drift.
            None => true,
        }
    }
}

/// Batch driver: validates options, authenticates, resolves the mapping,
/// selects records for the requested mode, and fans work across a bounded
/// pool.
pub struct SyncEngine {
    gateway: Arc<dyn ReferenceGateway>,
    store: Arc<dyn DestinationStore>,
    mapping_config: MappingConfig,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(
        gateway: Arc<dyn ReferenceGateway>,
        store: Arc<dyn DestinationStore>,
        mapping_config: MappingConfig,
        config: SyncConfig,
    ) -> Self {
        Self {
            gateway,
            store,
            mapping_config,
            config,
        }
    }

    pub async fn run(&self, options: RunOptions) -> RunResult {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        match self.try_run(run_id, started_at, &options).await {
            Ok(result) => result,
            Err(err) => {
                error!(%run_id, error = %err, "run aborted");
                RunResult::failure(run_id, started_at, err.to_string())
            }
        }
    }

    async fn try_run(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        options: &RunOptions,
    ) -> Result<RunResult, SyncError> {
        if options.workers < 1 {
            return Err(SyncError::Validation(
                "worker count must be at least 1".to_string(),
            ));
        }
        if options.workers > self.config.worker_warn_threshold {
            warn!(
                workers = options.workers,
                threshold = self.config.worker_warn_threshold,
                "worker count above recommended maximum"
            );
        }
        if options.record_id.is_some() && options.most_recent_only {
            return Err(SyncError::Validation(
                "single-record and most-recent-only modes are mutually exclusive".to_string(),
            ));
        }

        // Fail the run before touching any record when the credential is bad.
        self.gateway
            .authenticate()
            .await
            .map_err(|err| SyncError::Auth(err.to_string()))?;

        let schema = self
            .store
            .schema(&self.config.library_id)
            .await
            .map_err(|err| SyncError::Precondition(format!("reading destination schema: {err}")))?;
        let mapping = Arc::new(build_property_map(&self.mapping_config, &schema)?);

        let records = self.collect_records(options).await?;
        if records.is_empty() {
            return Err(SyncError::Precondition(
                "no records found to process".to_string(),
            ));
        }

        let total = records.len();
        info!(%run_id, total, workers = options.workers, "starting reconciliation run");

        let reconciler = Reconciler::new(
            Arc::clone(&self.gateway),
            Arc::clone(&self.store),
            mapping,
            Arc::new(self.config.clone()),
            options.clone(),
        );

        let courtesy = self.gateway.pacing_delay().await / (2 * options.workers as u32);
        let semaphore = Arc::new(Semaphore::new(options.workers));
        let mut join_set = JoinSet::new();
        for record in records {
            let reconciler = reconciler.clone();
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore not closed");
                let outcome = reconciler.process(&record).await;
                (record.id, outcome)
            });
        }

        let (mut updated, mut skipped, mut failed) = (0usize, 0usize, 0usize);
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((record_id, outcome)) => {
                    info!(%run_id, record_id, %outcome, "record finished");
                    match outcome {
                        SyncOutcome::Updated(_) => updated += 1,
                        SyncOutcome::Skipped(_) => skipped += 1,
                        SyncOutcome::Failed(_) => failed += 1,
                    }
                }
                Err(err) => {
                    error!(%run_id, error = %err, "worker task panicked");
                    failed += 1;
                }
            }
            if courtesy > Duration::ZERO {
                tokio::time::sleep(courtesy).await;
            }
        }

        // In single-record mode that one failure is the whole run.
        let success = if options.record_id.is_some() {
            failed == 0
        } else {
            true
        };
        info!(%run_id, total, updated, skipped, failed, "run finished");
        Ok(RunResult {
            run_id,
            success,
            total,
            updated,
            skipped,
            failed,
            started_at,
            finished_at: Utc::now(),
            message: None,
        })
    }

    async fn collect_records(
        &self,
        options: &RunOptions,
    ) -> Result<Vec<LibraryRecord>, SyncError> {
        if let Some(record_id) = &options.record_id {
            let record = self.store.fetch_record(record_id).await?;
            if normalize_record_id(&record.library_id)
                != normalize_record_id(&self.config.library_id)
            {
                return Err(SyncError::Validation(format!(
                    "record {record_id} belongs to a different library"
                )));
            }
            return Ok(vec![record]);
        }

        let mut records = self.store.list_records(&self.config.library_id).await?;
        if options.most_recent_only {
            records.sort_by_key(|record| std::cmp::Reverse(record.last_edited));
            records.truncate(1);
        }
        Ok(records)
    }
}
