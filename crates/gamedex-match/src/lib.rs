//! Title-to-entity matching: exact search, ordered fuzzy variants, and
//! deterministic candidate scoring.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gamedex_gateway::{GameRow, GatewayClient, GatewayError};
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "gamedex-match";

pub const CATEGORY_MAIN_GAME: u32 = 0;
pub const CATEGORY_REMAKE: u32 = 8;

/// Names carrying these fragments are almost always compilations riding on a
/// popular title's search rank.
const BUNDLE_KEYWORDS: &[&str] = &[
    "bundle",
    "pack",
    "collection",
    "double pack",
    "+",
    "&",
    "edition",
];

/// Ordered substring substitutions tried when the exact title finds nothing.
/// An expanding pair (replacement contains the pattern) is skipped when the
/// expanded form is already present, so `Marvel` -> `Marvel's` never yields
/// `Marvel's's`.
const SUBSTITUTIONS: &[(&str, &str)] = &[
    ("Spiderman", "Spider-Man"),
    ("Spider-Man", "Spiderman"),
    ("Spider Man", "Spiderman"),
    ("Marvel's", "Marvel"),
    ("Marvel", "Marvel's"),
    ("The ", ""),
    (": ", " "),
    (" - ", " "),
    (" & ", " and "),
    (" and ", " & "),
];

const LEADING_WORDS: &[&str] = &["The", "A", "An", "Marvel's", "Marvel"];

/// Seam over the catalog search so the matcher is testable without a live
/// service.
#[async_trait]
pub trait EntitySearch: Send + Sync {
    async fn search(&self, title: &str) -> Result<Vec<GameRow>, GatewayError>;
}

#[async_trait]
impl EntitySearch for GatewayClient {
    async fn search(&self, title: &str) -> Result<Vec<GameRow>, GatewayError> {
        self.search_games(title).await
    }
}

/// Alternate spellings for a title, most-conservative first, deduplicated,
/// never including the original.
pub fn fuzzy_variants(title: &str) -> Vec<String> {
    let mut variants: Vec<String> = Vec::new();
    let mut push = |candidate: String| {
        let candidate = collapse_whitespace(&candidate);
        if !candidate.is_empty() && candidate != title && !variants.contains(&candidate) {
            variants.push(candidate);
        }
    };

    for (from, to) in SUBSTITUTIONS {
        if !title.contains(from) {
            continue;
        }
        if to.contains(from) && title.contains(to) {
            continue;
        }
        push(title.replace(from, to));
    }

    for word in LEADING_WORDS {
        if let Some(rest) = title.strip_prefix(&format!("{word} ")) {
            push(rest.to_string());
        }
    }

    push(
        title
            .chars()
            .map(|c| if matches!(c, ':' | ';' | ',' | '-') { ' ' } else { c })
            .collect(),
    );
    push(title.replace(": ", " ").replace(':', ""));

    variants
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Score one candidate against the searched title. Pure and deterministic
/// for a fixed `now`.
pub fn score_candidate(game: &GameRow, search_title: &str, now: DateTime<Utc>) -> f64 {
    let name = game.name.to_lowercase();
    let wanted = search_title.to_lowercase();
    let mut score = 0.0;

    if name == wanted {
        score += 1000.0;
    } else if name.starts_with(&wanted) {
        score += 500.0;
    } else if name.contains(&wanted) {
        score += 200.0;
    }

    if let Some(count) = game.rating_count {
        score += (count as f64 / 10.0).min(100.0);
    }
    if let Some(rating) = game.aggregated_rating {
        if rating > 0.0 {
            score += (rating / 2.0).min(50.0);
        }
    }
    if BUNDLE_KEYWORDS.iter().any(|keyword| name.contains(keyword)) {
        score -= 100.0;
    }
    match game.category {
        Some(CATEGORY_MAIN_GAME) => score += 50.0,
        Some(CATEGORY_REMAKE) => score += 25.0,
        _ => {}
    }
    if let Some(released) = game.first_release_date {
        const TWENTY_YEARS_SECS: i64 = 20 * 365 * 24 * 3600;
        if now.timestamp() - released > TWENTY_YEARS_SECS {
            score -= 20.0;
        }
    }

    score
}

/// Pick the best candidate: primary categories (main game, remake, or
/// uncategorized) when any exist, then highest score, earliest candidate on
/// ties. Never fails on empty input.
pub fn select_best<'a>(candidates: &'a [GameRow], search_title: &str) -> Option<&'a GameRow> {
    let primary: Vec<&GameRow> = candidates
        .iter()
        .filter(|game| {
            matches!(
                game.category,
                None | Some(CATEGORY_MAIN_GAME) | Some(CATEGORY_REMAKE)
            )
        })
        .collect();
    let pool = if primary.is_empty() {
        candidates.iter().collect::<Vec<_>>()
    } else {
        primary
    };

    let now = Utc::now();
    let mut best: Option<(&GameRow, f64)> = None;
    for game in pool {
        let score = score_candidate(game, search_title, now);
        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((game, score)),
        }
    }
    best.map(|(game, _)| game)
}

pub struct Matcher<'a, S: EntitySearch + ?Sized> {
    search: &'a S,
}

impl<'a, S: EntitySearch + ?Sized> Matcher<'a, S> {
    pub fn new(search: &'a S) -> Self {
        Self { search }
    }

    /// Exact search first; when it finds nothing, each fuzzy variant in
    /// order, stopping at the first that yields candidates. Selection always
    /// scores against the original title. A failed variant query logs and
    /// falls through; a failed exact query surfaces to the caller.
    pub async fn resolve(&self, title: &str) -> Result<Option<GameRow>, GatewayError> {
        let title = title.trim();
        if title.is_empty() {
            return Ok(None);
        }

        let exact = self.search.search(title).await?;
        if !exact.is_empty() {
            return Ok(select_best(&exact, title).cloned());
        }

        for variant in fuzzy_variants(title) {
            match self.search.search(&variant).await {
                Ok(rows) if !rows.is_empty() => {
                    debug!(title, variant, candidates = rows.len(), "fuzzy variant matched");
                    return Ok(select_best(&rows, title).cloned());
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(title, variant, error = %err, "variant search failed, trying next");
                }
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn candidate(name: &str) -> GameRow {
        GameRow {
            id: 1,
            name: name.to_string(),
            ..GameRow::default()
        }
    }

    #[test]
    fn variants_are_ordered_and_deduplicated() {
        let variants = fuzzy_variants("Marvel's Spider-Man");
        assert_eq!(variants[0], "Marvel's Spiderman");
        assert!(variants.contains(&"Marvel Spider-Man".to_string()));
        assert!(variants.contains(&"Spider-Man".to_string()));

        let unique: std::collections::BTreeSet<_> = variants.iter().collect();
        assert_eq!(unique.len(), variants.len());
        assert!(!variants.contains(&"Marvel's Spider-Man".to_string()));
    }

    #[test]
    fn variants_strip_articles_and_punctuation() {
        let variants = fuzzy_variants("The Witcher 3: Wild Hunt");
        assert!(variants.contains(&"Witcher 3: Wild Hunt".to_string()));
        assert!(variants.contains(&"The Witcher 3 Wild Hunt".to_string()));
    }

    #[test]
    fn empty_title_has_no_variants() {
        assert!(fuzzy_variants("").is_empty());
    }

    #[test]
    fn main_game_outranks_bundle_despite_popularity() {
        let mut main = candidate("Marvel's Spider-Man");
        main.category = Some(CATEGORY_MAIN_GAME);
        main.aggregated_rating = Some(90.0);
        main.rating_count = Some(500);

        let mut bundle = candidate("Spiderman Double Pack");
        bundle.rating_count = Some(300);

        let rows = vec![bundle, main.clone()];
        let best = select_best(&rows, "Marvel's Spiderman").unwrap();
        assert_eq!(best.name, main.name);
    }

    #[test]
    fn exact_name_wins_over_prefix() {
        let mut exact = candidate("Portal");
        exact.id = 10;
        let mut prefix = candidate("Portal 2");
        prefix.id = 20;
        prefix.rating_count = Some(900);
        prefix.aggregated_rating = Some(95.0);

        let rows = vec![prefix, exact];
        assert_eq!(select_best(&rows, "Portal").unwrap().id, 10);
    }

    #[test]
    fn ties_keep_the_earliest_candidate() {
        let mut first = candidate("Same Game");
        first.id = 1;
        let mut second = candidate("Same Game");
        second.id = 2;
        let rows = vec![first, second];
        assert_eq!(select_best(&rows, "Same Game").unwrap().id, 1);
    }

    #[test]
    fn non_primary_pool_is_used_when_no_primary_exists() {
        let mut dlc = candidate("Some Game: The DLC");
        dlc.category = Some(1);
        let rows = vec![dlc];
        assert!(select_best(&rows, "Some Game").is_some());
    }

    #[test]
    fn empty_candidates_select_nothing() {
        assert!(select_best(&[], "anything").is_none());
    }

    struct FakeSearch {
        queries: Mutex<Vec<String>>,
        matching: String,
        fail_on: Option<String>,
    }

    impl FakeSearch {
        fn matching(term: &str) -> Self {
            Self {
                queries: Mutex::new(Vec::new()),
                matching: term.to_string(),
                fail_on: None,
            }
        }
    }

    #[async_trait]
    impl EntitySearch for FakeSearch {
        async fn search(&self, title: &str) -> Result<Vec<GameRow>, GatewayError> {
            self.queries.lock().unwrap().push(title.to_string());
            if self.fail_on.as_deref() == Some(title) {
                return Err(GatewayError::HttpStatus {
                    status: 500,
                    url: "fake".to_string(),
                });
            }
            if title == self.matching {
                let mut row = candidate("Marvel's Spider-Man");
                row.id = 1234;
                row.category = Some(CATEGORY_MAIN_GAME);
                Ok(vec![row])
            } else {
                Ok(Vec::new())
            }
        }
    }

    #[tokio::test]
    async fn matcher_falls_back_to_first_matching_variant() {
        let search = FakeSearch::matching("Marvel's Spiderman");
        let matcher = Matcher::new(&search);
        let resolved = matcher.resolve("Marvel's Spider-Man").await.unwrap();
        assert_eq!(resolved.unwrap().id, 1234);

        let queries = search.queries.lock().unwrap();
        assert_eq!(queries[0], "Marvel's Spider-Man");
        assert_eq!(queries[1], "Marvel's Spiderman");
    }

    #[tokio::test]
    async fn matcher_skips_failing_variants() {
        let mut search = FakeSearch::matching("Marvel Spider-Man");
        search.fail_on = Some("Marvel's Spiderman".to_string());
        let matcher = Matcher::new(&search);
        let resolved = matcher.resolve("Marvel's Spider-Man").await.unwrap();
        assert!(resolved.is_some());
    }

    #[tokio::test]
    async fn matcher_resolves_nothing_for_blank_titles() {
        let search = FakeSearch::matching("never");
        let matcher = Matcher::new(&search);
        assert!(matcher.resolve("   ").await.unwrap().is_none());
        assert!(search.queries.lock().unwrap().is_empty());
    }
}
