//! Core domain model for the gamedex reconciliation pipeline.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "gamedex-core";

/// Logical fields a destination library can bind to concrete properties.
///
/// The mapping file speaks in these names; destination property ids stay an
/// implementation detail of each library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalField {
    Title,
    Description,
    ReleaseDate,
    Rating,
    RatingCount,
    Playtime,
    Genres,
    Platforms,
    PlatformFamily,
    PlatformType,
    ExternalId,
    CoverImage,
    LastSynced,
    Developers,
    Publishers,
    Franchises,
    Collections,
    GameModes,
    GameStatus,
    GameType,
    MultiplayerModes,
    Themes,
    Website,
    Homepage,
    OfflinePlayers,
    OnlinePlayers,
    OfflineCoopPlayers,
    OnlineCoopPlayers,
}

impl LogicalField {
    pub const ALL: &'static [LogicalField] = &[
        LogicalField::Title,
        LogicalField::Description,
        LogicalField::ReleaseDate,
        LogicalField::Rating,
        LogicalField::RatingCount,
        LogicalField::Playtime,
        LogicalField::Genres,
        LogicalField::Platforms,
        LogicalField::PlatformFamily,
        LogicalField::PlatformType,
        LogicalField::ExternalId,
        LogicalField::CoverImage,
        LogicalField::LastSynced,
        LogicalField::Developers,
        LogicalField::Publishers,
        LogicalField::Franchises,
        LogicalField::Collections,
        LogicalField::GameModes,
        LogicalField::GameStatus,
        LogicalField::GameType,
        LogicalField::MultiplayerModes,
        LogicalField::Themes,
        LogicalField::Website,
        LogicalField::Homepage,
        LogicalField::OfflinePlayers,
        LogicalField::OnlinePlayers,
        LogicalField::OfflineCoopPlayers,
        LogicalField::OnlineCoopPlayers,
    ];
}

/// Per-field write policy, fixed for the duration of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldBehavior {
    /// Replace the stored value, but never clobber a non-empty stored value
    /// with an empty fresh one.
    #[default]
    Default,
    /// Union of stored and fresh value sets, deduplicated.
    Merge,
    /// Only written when the stored value is absent or empty.
    Preserve,
    /// Never written.
    Skip,
}

/// Opaque destination-side property identifier, stable across label renames.
pub type PropertyId = String;

/// Typed destination property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    Text(String),
    Number(f64),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    MultiSelect(Vec<String>),
    Status(String),
    Url(String),
    Checkbox(bool),
}

impl PropertyValue {
    pub fn is_empty(&self) -> bool {
        match self {
            PropertyValue::Text(s) | PropertyValue::Status(s) | PropertyValue::Url(s) => {
                s.trim().is_empty()
            }
            PropertyValue::MultiSelect(values) => values.is_empty(),
            _ => false,
        }
    }

    /// Value equality with set semantics for multi-selects: option order in
    /// the destination is presentation, not data.
    pub fn same_as(&self, other: &PropertyValue) -> bool {
        match (self, other) {
            (PropertyValue::MultiSelect(a), PropertyValue::MultiSelect(b)) => {
                a.iter().collect::<BTreeSet<_>>() == b.iter().collect::<BTreeSet<_>>()
            }
            (a, b) => a == b,
        }
    }

    /// Merge-policy combination: fresh values keep their fetch order, stored
    /// extras follow, duplicates dropped. Non-set values pass through as the
    /// fresh value.
    pub fn merged_with(&self, stored: Option<&PropertyValue>) -> PropertyValue {
        match (self, stored) {
            (PropertyValue::MultiSelect(fresh), Some(PropertyValue::MultiSelect(old))) => {
                let mut seen: BTreeSet<&str> = BTreeSet::new();
                let mut merged = Vec::new();
                for value in fresh.iter().chain(old.iter()) {
                    if seen.insert(value.as_str()) {
                        merged.push(value.clone());
                    }
                }
                PropertyValue::MultiSelect(merged)
            }
            _ => self.clone(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(s) | PropertyValue::Status(s) | PropertyValue::Url(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            PropertyValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

/// A destination record as read from the library, keyed by property id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryRecord {
    pub id: String,
    pub library_id: String,
    pub last_edited: DateTime<Utc>,
    pub properties: BTreeMap<PropertyId, PropertyValue>,
}

impl LibraryRecord {
    pub fn property(&self, id: &str) -> Option<&PropertyValue> {
        self.properties.get(id)
    }
}

/// One logical field entry in the mapping file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    #[serde(default)]
    pub property: Option<PropertyId>,
    #[serde(default)]
    pub behavior: FieldBehavior,
}

/// Deserialized mapping file: logical field -> destination binding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappingConfig {
    #[serde(default)]
    pub fields: BTreeMap<LogicalField, FieldMapping>,
}

/// A resolved binding: the destination property id plus its write policy.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldBinding {
    pub property_id: PropertyId,
    pub behavior: FieldBehavior,
}

/// Immutable per-run view of the mapping, validated against the destination
/// schema before any record is processed.
#[derive(Debug, Clone, Default)]
pub struct PropertyMap {
    bindings: BTreeMap<LogicalField, FieldBinding>,
}

impl PropertyMap {
    pub fn from_bindings(bindings: BTreeMap<LogicalField, FieldBinding>) -> Self {
        Self { bindings }
    }

    pub fn binding(&self, field: LogicalField) -> Option<&FieldBinding> {
        self.bindings.get(&field)
    }

    pub fn property_id(&self, field: LogicalField) -> Option<&PropertyId> {
        self.bindings.get(&field).map(|b| &b.property_id)
    }

    pub fn behavior(&self, field: LogicalField) -> FieldBehavior {
        self.bindings
            .get(&field)
            .map(|b| b.behavior)
            .unwrap_or_default()
    }

    pub fn is_bound(&self, field: LogicalField) -> bool {
        self.bindings.contains_key(&field)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Terminal outcome of reconciling one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum SyncOutcome {
    Updated(String),
    Skipped(String),
    Failed(String),
}

impl SyncOutcome {
    pub fn reason(&self) -> &str {
        match self {
            SyncOutcome::Updated(r) | SyncOutcome::Skipped(r) | SyncOutcome::Failed(r) => r,
        }
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::Updated(r) => write!(f, "updated: {r}"),
            SyncOutcome::Skipped(r) => write!(f, "skipped: {r}"),
            SyncOutcome::Failed(r) => write!(f, "failed: {r}"),
        }
    }
}

pub mod labels {
    //! Closed lookup tables for catalog codes. Unrecognized codes render as
    //! an explicit placeholder instead of being dropped, so a table gap shows
    //! up in the destination rather than as silently missing data.

    pub fn unrecognized(code: impl std::fmt::Display) -> String {
        format!("Unrecognized code {code}")
    }

    pub fn release_status(code: u32) -> String {
        match code {
            0 => "Released".to_string(),
            2 => "Alpha".to_string(),
            3 => "Beta".to_string(),
            4 => "Early Access".to_string(),
            5 => "Offline".to_string(),
            6 => "Cancelled".to_string(),
            7 => "Rumored".to_string(),
            8 => "Delisted".to_string(),
            other => unrecognized(other),
        }
    }

    pub fn category(code: u32) -> String {
        match code {
            0 => "Main Game".to_string(),
            1 => "DLC".to_string(),
            2 => "Expansion".to_string(),
            3 => "Bundle".to_string(),
            4 => "Standalone Expansion".to_string(),
            5 => "Mod".to_string(),
            6 => "Episode".to_string(),
            7 => "Season".to_string(),
            8 => "Remake".to_string(),
            9 => "Remaster".to_string(),
            10 => "Expanded Game".to_string(),
            11 => "Port".to_string(),
            12 => "Fork".to_string(),
            13 => "Pack".to_string(),
            14 => "Update".to_string(),
            other => unrecognized(other),
        }
    }

    pub fn platform_type(code: u32) -> String {
        match code {
            1 => "Console".to_string(),
            2 => "Arcade".to_string(),
            3 => "Platform".to_string(),
            4 => "Computer".to_string(),
            5 => "Operating System".to_string(),
            6 => "Portable Console".to_string(),
            other => unrecognized(other),
        }
    }

    /// Known multiplayer capability flags and their display labels.
    pub fn multiplayer_feature(flag: &str) -> Option<&'static str> {
        match flag {
            "campaigncoop" => Some("Campaign Co-op"),
            "dropin" => Some("Drop-in"),
            "lancoop" => Some("LAN Co-op"),
            "offlinecoop" => Some("Offline Co-op"),
            "onlinecoop" => Some("Online Co-op"),
            "splitscreen" => Some("Split Screen"),
            _ => None,
        }
    }

    /// Fallback humanization for boolean flags outside the closed table:
    /// underscores become spaces, `coop` becomes `Co-op`, words title-cased.
    pub fn humanize_flag(flag: &str) -> String {
        flag.replace('_', " ")
            .replace("coop", " co-op")
            .split_whitespace()
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => {
                        let rest: String = chars.collect();
                        format!("{}{}", first.to_uppercase(), rest)
                    }
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn multi_select_equality_ignores_order() {
        let a = PropertyValue::MultiSelect(vec!["RPG".into(), "Action".into()]);
        let b = PropertyValue::MultiSelect(vec!["Action".into(), "RPG".into()]);
        assert!(a.same_as(&b));

        let c = PropertyValue::MultiSelect(vec!["Action".into()]);
        assert!(!a.same_as(&c));
    }

    #[test]
    fn merge_keeps_fresh_order_and_stored_extras() {
        let fresh = PropertyValue::MultiSelect(vec!["Action".into(), "Adventure".into()]);
        let stored = PropertyValue::MultiSelect(vec!["Indie".into(), "Action".into()]);
        let merged = fresh.merged_with(Some(&stored));
        assert_eq!(
            merged,
            PropertyValue::MultiSelect(vec!["Action".into(), "Adventure".into(), "Indie".into()])
        );
    }

    #[test]
    fn merge_without_stored_value_is_fresh() {
        let fresh = PropertyValue::MultiSelect(vec!["Action".into()]);
        assert_eq!(fresh.merged_with(None), fresh);
    }

    #[test]
    fn emptiness_per_value_kind() {
        assert!(PropertyValue::Text("  ".into()).is_empty());
        assert!(PropertyValue::MultiSelect(vec![]).is_empty());
        assert!(!PropertyValue::Number(0.0).is_empty());
        assert!(!PropertyValue::Checkbox(false).is_empty());
        assert!(!PropertyValue::Timestamp(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap()).is_empty());
    }

    #[test]
    fn unbound_field_defaults_to_default_behavior() {
        let map = PropertyMap::default();
        assert_eq!(map.behavior(LogicalField::Genres), FieldBehavior::Default);
        assert!(map.property_id(LogicalField::Genres).is_none());
    }

    #[test]
    fn closed_tables_and_placeholder() {
        assert_eq!(labels::release_status(0), "Released");
        assert_eq!(labels::release_status(8), "Delisted");
        assert_eq!(labels::release_status(42), "Unrecognized code 42");
        assert_eq!(labels::category(8), "Remake");
        assert_eq!(labels::category(99), "Unrecognized code 99");
        assert_eq!(labels::platform_type(6), "Portable Console");
    }

    #[test]
    fn multiplayer_flag_humanization() {
        assert_eq!(labels::multiplayer_feature("lancoop"), Some("LAN Co-op"));
        assert_eq!(labels::humanize_flag("couch_coop"), "Couch Co-op");
        assert_eq!(labels::humanize_flag("crossplay"), "Crossplay");
    }

    #[test]
    fn mapping_config_round_trips_field_keys() {
        let yaml = "fields:\n  genres:\n    property: prop_1\n    behavior: merge\n  rating:\n    property: prop_2\n";
        let config: MappingConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            config.fields[&LogicalField::Genres].behavior,
            FieldBehavior::Merge
        );
        assert_eq!(
            config.fields[&LogicalField::Rating].behavior,
            FieldBehavior::Default
        );
    }
}
