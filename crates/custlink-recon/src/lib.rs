//! Reconciliation pipeline: load ERP customers and CRM companies, index the
//! companies, match customers against them, and write accepted links back.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use custlink_core::{
    normalized_address, LinkUpdate, MalformedRecord, MatchReport, MatchResult, MatchStats,
    MatchType, SourceRecord, TargetRecord,
};
use custlink_storage::{
    JsonFileStore, PgRecordStore, PgStoreConfig, RecordStore, StoreError, StoredDocument,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "custlink-recon";

pub const DEFAULT_APPLY_BATCH_SIZE: usize = 500;
pub const DEFAULT_MIN_ADDRESS_LEN: usize = 5;

/// Strategy order. The first strategy that finds a target wins.
pub const STRATEGY_ORDER: [MatchType; 3] =
    [MatchType::IdentifierA, MatchType::IdentifierB, MatchType::Address];

#[derive(Debug, Clone)]
pub struct ReconConfig {
    /// Postgres backend when set, JSON fixtures otherwise.
    pub database_url: Option<String>,
    pub fixtures_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub apply_batch_size: usize,
    /// Normalized addresses must be strictly longer than this to be used.
    pub min_address_len: usize,
    /// Lock each target to the first source that claims it within a run.
    pub claim_targets: bool,
    /// Drop sources that already carry a link before matching.
    pub skip_linked: bool,
    pub db_max_connections: u32,
    pub db_timeout_secs: u64,
}

impl Default for ReconConfig {
    fn default() -> Self {
        Self::from_vars(|_| None)
    }
}

impl ReconConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            database_url: var("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            fixtures_dir: var("CUSTLINK_FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./fixtures")),
            reports_dir: var("CUSTLINK_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
            apply_batch_size: parse_or(var("CUSTLINK_APPLY_BATCH_SIZE"), DEFAULT_APPLY_BATCH_SIZE)
                .max(1),
            min_address_len: parse_or(var("CUSTLINK_MIN_ADDRESS_LEN"), DEFAULT_MIN_ADDRESS_LEN),
            claim_targets: flag(var("CUSTLINK_CLAIM_TARGETS")),
            skip_linked: flag(var("CUSTLINK_SKIP_LINKED")),
            db_max_connections: parse_or(var("CUSTLINK_DB_MAX_CONNECTIONS"), 4),
            db_timeout_secs: parse_or(var("CUSTLINK_DB_TIMEOUT_SECS"), 30),
        }
    }

    pub fn pg_store_config(&self) -> Option<PgStoreConfig> {
        self.database_url.as_ref().map(|url| PgStoreConfig {
            database_url: url.clone(),
            max_connections: self.db_max_connections,
            acquire_timeout: Duration::from_secs(self.db_timeout_secs),
        })
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn flag(value: Option<String>) -> bool {
    value
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

/// Build the record store named by the config. Called once per process; the
/// store is then shared through the returned `Arc`.
pub async fn open_store(config: &ReconConfig) -> Result<Arc<dyn RecordStore>> {
    match config.pg_store_config() {
        Some(pg) => {
            let store = PgRecordStore::connect(&pg)
                .await
                .context("connecting to DATABASE_URL")?;
            info!("using postgres record store");
            Ok(Arc::new(store))
        }
        None => {
            info!(dir = %config.fixtures_dir.display(), "using JSON fixture record store");
            Ok(Arc::new(JsonFileStore::new(config.fixtures_dir.clone())))
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconError {
    #[error("failed to load {collection}: {source}")]
    LoadFailure {
        collection: &'static str,
        #[source]
        source: StoreError,
    },
    #[error(
        "apply stopped after {committed_batches} of {total_batches} batches \
         ({updated} of {requested} records updated): {source}"
    )]
    ApplyPartialFailure {
        committed_batches: usize,
        total_batches: usize,
        updated: usize,
        requested: usize,
        #[source]
        source: StoreError,
    },
}

impl ReconError {
    /// Records durably written before the error.
    pub fn updated(&self) -> usize {
        match self {
            Self::LoadFailure { .. } => 0,
            Self::ApplyPartialFailure { updated, .. } => *updated,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadedSnapshot {
    pub sources: Vec<SourceRecord>,
    pub targets: Vec<TargetRecord>,
    pub skipped_sources: usize,
    pub skipped_targets: usize,
}

/// Read both collections in full. Any read error fails the whole load;
/// individual malformed documents are skipped and counted.
pub async fn load_snapshot(store: &dyn RecordStore) -> Result<LoadedSnapshot, ReconError> {
    let started = Instant::now();
    let source_docs = store
        .load_source_documents()
        .await
        .map_err(|source| ReconError::LoadFailure {
            collection: "source records",
            source,
        })?;
    let target_docs = store
        .load_target_documents()
        .await
        .map_err(|source| ReconError::LoadFailure {
            collection: "target records",
            source,
        })?;

    let (sources, skipped_sources) = decode_all(&source_docs, SourceRecord::from_document, "source");
    let (targets, skipped_targets) = decode_all(&target_docs, TargetRecord::from_document, "target");

    if skipped_sources + skipped_targets > 0 {
        warn!(skipped_sources, skipped_targets, "skipped malformed documents");
    }
    info!(
        sources = sources.len(),
        targets = targets.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "loaded reconciliation snapshot"
    );

    Ok(LoadedSnapshot {
        sources,
        targets,
        skipped_sources,
        skipped_targets,
    })
}

fn decode_all<T>(
    docs: &[StoredDocument],
    decode: impl Fn(&str, &JsonValue) -> Result<T, MalformedRecord>,
    kind: &'static str,
) -> (Vec<T>, usize) {
    let mut records = Vec::with_capacity(docs.len());
    let mut skipped = 0usize;
    for doc in docs {
        match decode(&doc.key, &doc.body) {
            Ok(record) => records.push(record),
            Err(err) => {
                skipped += 1;
                debug!(kind, key = %doc.key, error = %err, "skipping malformed document");
            }
        }
    }
    (records, skipped)
}

/// Key overwrites seen while building the index. Later targets replace
/// earlier ones under the same key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexCollisions {
    pub identifier_a: usize,
    pub identifier_c: usize,
    pub address: usize,
}

impl IndexCollisions {
    pub fn total(&self) -> usize {
        self.identifier_a + self.identifier_c + self.address
    }
}

/// Read-only lookup tables over one run's targets.
#[derive(Debug)]
pub struct TargetIndex<'a> {
    by_identifier_a: HashMap<&'a str, &'a TargetRecord>,
    by_identifier_c: HashMap<&'a str, &'a TargetRecord>,
    by_normalized_address: HashMap<String, &'a TargetRecord>,
    min_address_len: usize,
    total_targets: usize,
    collisions: IndexCollisions,
}

impl<'a> TargetIndex<'a> {
    pub fn build(targets: &'a [TargetRecord], min_address_len: usize) -> Self {
        let started = Instant::now();
        let mut by_identifier_a = HashMap::with_capacity(targets.len());
        let mut by_identifier_c = HashMap::new();
        let mut by_normalized_address = HashMap::new();
        let mut collisions = IndexCollisions::default();

        for target in targets {
            if let Some(key) = target.identifier_a_key() {
                if by_identifier_a.insert(key, target).is_some() {
                    collisions.identifier_a += 1;
                }
            }
            if let Some(key) = target.identifier_c_key() {
                if by_identifier_c.insert(key, target).is_some() {
                    collisions.identifier_c += 1;
                }
            }
            if let Some(address) = target.address_line.as_deref() {
                let key = normalized_address(address);
                if key.len() > min_address_len && by_normalized_address.insert(key, target).is_some() {
                    collisions.address += 1;
                }
            }
        }

        info!(
            identifier_a = by_identifier_a.len(),
            identifier_c = by_identifier_c.len(),
            addresses = by_normalized_address.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "built target index"
        );
        if collisions.total() > 0 {
            warn!(
                identifier_a = collisions.identifier_a,
                identifier_c = collisions.identifier_c,
                address = collisions.address,
                "target index keys collided; later targets replaced earlier ones"
            );
        }

        Self {
            by_identifier_a,
            by_identifier_c,
            by_normalized_address,
            min_address_len,
            total_targets: targets.len(),
            collisions,
        }
    }

    pub fn total_targets(&self) -> usize {
        self.total_targets
    }

    pub fn collisions(&self) -> IndexCollisions {
        self.collisions
    }

    pub fn lookup_identifier_a(&self, key: &str) -> Option<&'a TargetRecord> {
        self.by_identifier_a.get(key.trim()).copied()
    }

    pub fn lookup_identifier_c(&self, key: &str) -> Option<&'a TargetRecord> {
        self.by_identifier_c.get(key.trim()).copied()
    }

    /// Lookup by an already-normalized address key.
    pub fn lookup_address(&self, normalized: &str) -> Option<&'a TargetRecord> {
        self.by_normalized_address.get(normalized).copied()
    }

    pub fn address_keys(&self) -> Vec<&str> {
        self.by_normalized_address.keys().map(String::as_str).collect()
    }

    /// Target the given strategy finds for `source`, with the key that hit.
    fn candidate(
        &self,
        strategy: MatchType,
        source: &SourceRecord,
    ) -> Option<(&'a TargetRecord, String)> {
        match strategy {
            MatchType::IdentifierA => {
                let key = source.identifier_a_key()?;
                self.by_identifier_a
                    .get(key)
                    .map(|target| (*target, key.to_string()))
            }
            MatchType::IdentifierB => {
                let key = source.identifier_b_key()?;
                self.by_identifier_c
                    .get(key)
                    .map(|target| (*target, key.to_string()))
            }
            MatchType::Address => {
                let key = normalized_address(source.address_line.as_deref()?);
                if key.len() <= self.min_address_len {
                    return None;
                }
                self.by_normalized_address
                    .get(key.as_str())
                    .map(|target| (*target, key))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MatchOptions {
    pub claim_targets: bool,
}

/// Link each source to at most one target. Strategies run as passes in
/// [`STRATEGY_ORDER`]; a pass only considers sources no earlier pass matched.
///
/// Without `claim_targets`, several sources may land on the same target.
pub fn match_records(
    sources: &[SourceRecord],
    index: &TargetIndex<'_>,
    options: MatchOptions,
) -> MatchReport {
    let mut matches = Vec::new();
    let mut matched_sources: HashSet<&str> = HashSet::new();
    let mut claimed_targets: HashSet<&str> = HashSet::new();

    for strategy in STRATEGY_ORDER {
        let before = matches.len();
        for source in sources {
            if matched_sources.contains(source.source_id.as_str()) {
                continue;
            }
            let Some((target, key)) = index.candidate(strategy, source) else {
                continue;
            };
            if options.claim_targets && !claimed_targets.insert(target.target_id.as_str()) {
                continue;
            }
            matched_sources.insert(source.source_id.as_str());
            matches.push(MatchResult {
                source_id: source.source_id.clone(),
                source_display_name: source.display_name.clone(),
                target_id: target.target_id.clone(),
                target_display_name: target.display_name.clone(),
                match_type: strategy,
                confidence: strategy.confidence(),
                matched_identifier_value: Some(key),
            });
        }
        info!(
            strategy = strategy.as_str(),
            matched = matches.len() - before,
            total = matches.len(),
            "strategy pass complete"
        );
    }

    let matched_count = matches.len();
    MatchReport {
        matches,
        stats: MatchStats {
            total_source: sources.len(),
            total_target: index.total_targets(),
            matched_count,
            unmatched_count: sources.len().saturating_sub(matched_count),
            skipped_source: 0,
            skipped_target: 0,
            index_collisions: index.collisions().total(),
        },
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplySummary {
    pub requested: usize,
    pub updated: usize,
    /// Rows without a usable source or target id.
    pub skipped: usize,
    pub batches: usize,
}

/// Merge-write accepted matches onto their source documents, `batch_size`
/// rows per commit, one commit at a time. Batches committed before a failure
/// stay committed.
pub async fn apply_matches(
    store: &dyn RecordStore,
    matches: &[MatchResult],
    matched_at: DateTime<Utc>,
    batch_size: usize,
) -> Result<ApplySummary, ReconError> {
    let batch_size = batch_size.max(1);
    let updates = matches
        .iter()
        .filter(|m| !m.source_id.trim().is_empty() && !m.target_id.trim().is_empty())
        .map(|m| LinkUpdate::from_match(m, matched_at))
        .collect::<Vec<_>>();
    let skipped = matches.len() - updates.len();
    if skipped > 0 {
        warn!(skipped, "ignoring match rows without a source or target id");
    }

    let total_batches = updates.len().div_ceil(batch_size);
    let mut summary = ApplySummary {
        requested: matches.len(),
        updated: 0,
        skipped,
        batches: 0,
    };

    for batch in updates.chunks(batch_size) {
        if let Err(source) = store.commit_link_batch(batch).await {
            return Err(ReconError::ApplyPartialFailure {
                committed_batches: summary.batches,
                total_batches,
                updated: summary.updated,
                requested: summary.requested,
                source,
            });
        }
        summary.batches += 1;
        summary.updated += batch.len();
        info!(
            batch = summary.batches,
            total_batches,
            updated = summary.updated,
            "committed link batch"
        );
    }

    Ok(summary)
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub report: MatchReport,
}

pub struct Reconciler {
    store: Arc<dyn RecordStore>,
    config: ReconConfig,
}

impl Reconciler {
    pub fn new(store: Arc<dyn RecordStore>, config: ReconConfig) -> Self {
        Self { store, config }
    }

    /// Loader, index builder and matcher over a fresh snapshot. Read-only.
    pub async fn run_match(&self) -> Result<MatchRun, ReconError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let report = self
            .match_snapshot()
            .instrument(info_span!("reconcile_match", %run_id))
            .await?;
        Ok(MatchRun {
            run_id,
            started_at,
            finished_at: Utc::now(),
            report,
        })
    }

    /// Apply `matches`, or a fresh match when none are given.
    pub async fn apply(&self, matches: Option<Vec<MatchResult>>) -> Result<ApplySummary, ReconError> {
        let matches = match matches {
            Some(matches) if !matches.is_empty() => matches,
            _ => {
                info!("no matches supplied; running a fresh match before applying");
                self.run_match().await?.report.matches
            }
        };
        let run_id = Uuid::new_v4();
        apply_matches(
            self.store.as_ref(),
            &matches,
            Utc::now(),
            self.config.apply_batch_size,
        )
        .instrument(info_span!("reconcile_apply", %run_id, requested = matches.len()))
        .await
    }

    async fn match_snapshot(&self) -> Result<MatchReport, ReconError> {
        let started = Instant::now();
        let LoadedSnapshot {
            sources,
            targets,
            skipped_sources,
            skipped_targets,
        } = load_snapshot(self.store.as_ref()).await?;

        let sources = if self.config.skip_linked {
            let before = sources.len();
            let unlinked = sources
                .into_iter()
                .filter(|s| !s.is_linked())
                .collect::<Vec<_>>();
            info!(dropped = before - unlinked.len(), "skipping already linked sources");
            unlinked
        } else {
            sources
        };

        let index = TargetIndex::build(&targets, self.config.min_address_len);
        let mut report = match_records(
            &sources,
            &index,
            MatchOptions {
                claim_targets: self.config.claim_targets,
            },
        );
        report.stats.skipped_source = skipped_sources;
        report.stats.skipped_target = skipped_targets;

        info!(
            matched = report.stats.matched_count,
            unmatched = report.stats.unmatched_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "matching complete"
        );
        Ok(report)
    }
}

pub async fn reconciler_from_env() -> Result<Reconciler> {
    let config = ReconConfig::from_env();
    let store = open_store(&config).await?;
    Ok(Reconciler::new(store, config))
}

/// Write `matches.json` and `summary.md` for manual review under
/// `<reports_root>/<run_id>/`.
pub async fn write_match_report(reports_root: &Path, run: &MatchRun) -> Result<PathBuf> {
    let run_dir = reports_root.join(run.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let matches_json =
        serde_json::to_vec_pretty(&run.report).context("serializing match report")?;
    fs::write(run_dir.join("matches.json"), matches_json)
        .await
        .context("writing matches.json")?;

    fs::write(run_dir.join("summary.md"), render_summary(run))
        .await
        .context("writing summary.md")?;

    Ok(run_dir)
}

fn render_summary(run: &MatchRun) -> String {
    let stats = &run.report.stats;
    let mut by_strategy: BTreeMap<&str, usize> = BTreeMap::new();
    for m in &run.report.matches {
        *by_strategy.entry(m.match_type.as_str()).or_default() += 1;
    }

    format!(
        "# Customer Link Review\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Source records: {} ({} skipped)\n- Target records: {} ({} skipped)\n- Matched: {}\n- Unmatched: {}\n- Index key collisions: {}\n\n## Matches by strategy\n{}\n",
        run.run_id,
        run.started_at,
        run.finished_at,
        stats.total_source,
        stats.skipped_source,
        stats.total_target,
        stats.skipped_target,
        stats.matched_count,
        stats.unmatched_count,
        stats.index_collisions,
        by_strategy
            .iter()
            .map(|(k, v)| format!("- {k}: {v}"))
            .collect::<Vec<_>>()
            .join("\n")
    )
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MatchListFile {
    Report { matches: Vec<MatchResult> },
    Rows(Vec<MatchResult>),
}

/// Read a reviewed match list: a full `matches.json` report or a bare array.
pub async fn load_match_list(path: &Path) -> Result<Vec<MatchResult>> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let parsed: MatchListFile =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(match parsed {
        MatchListFile::Report { matches } | MatchListFile::Rows(matches) => matches,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use custlink_core::Confidence;
    use custlink_storage::MemoryStore;
    use serde_json::json;
    use tempfile::tempdir;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap()
    }

    fn run(sources: &[SourceRecord], targets: &[TargetRecord]) -> MatchReport {
        let index = TargetIndex::build(targets, DEFAULT_MIN_ADDRESS_LEN);
        match_records(sources, &index, MatchOptions::default())
    }

    fn mk_match(i: usize) -> MatchResult {
        MatchResult {
            source_id: format!("S{i}"),
            source_display_name: format!("Customer {i}"),
            target_id: format!("T{i}"),
            target_display_name: format!("Company {i}"),
            match_type: MatchType::IdentifierA,
            confidence: Confidence::High,
            matched_identifier_value: Some(format!("C{i}")),
        }
    }

    #[test]
    fn identifier_a_match_is_high_confidence() {
        let sources = [SourceRecord::new("S1", "Acme").with_identifier_a("C104")];
        let targets = [TargetRecord::new("T9", "Acme Co").with_identifier_a("C104")];
        let report = run(&sources, &targets);
        assert_eq!(report.matches.len(), 1);
        let m = &report.matches[0];
        assert_eq!((m.source_id.as_str(), m.target_id.as_str()), ("S1", "T9"));
        assert_eq!(m.match_type, MatchType::IdentifierA);
        assert_eq!(m.confidence, Confidence::High);
        assert_eq!(m.matched_identifier_value.as_deref(), Some("C104"));
    }

    #[test]
    fn identifier_b_matches_target_identifier_c() {
        let sources = [SourceRecord::new("S2", "Harbor").with_identifier_b(" 55102 ")];
        let targets = [
            TargetRecord::new("T1", "Other").with_identifier_a("C1"),
            TargetRecord::new("T3", "Harbor Foods").with_identifier_c("55102"),
        ];
        let report = run(&sources, &targets);
        assert_eq!(report.matches.len(), 1);
        assert_eq!(report.matches[0].target_id, "T3");
        assert_eq!(report.matches[0].match_type, MatchType::IdentifierB);
        assert_eq!(report.matches[0].confidence, Confidence::High);
    }

    #[test]
    fn address_match_is_medium_confidence() {
        let sources = [SourceRecord::new("S3", "Main Co").with_address("123 Main Street")];
        let targets = [TargetRecord::new("T4", "Main Company").with_address("123 MAIN ST")];
        let report = run(&sources, &targets);
        assert_eq!(report.matches.len(), 1);
        assert_eq!(report.matches[0].match_type, MatchType::Address);
        assert_eq!(report.matches[0].confidence, Confidence::Medium);
        assert_eq!(report.matches[0].matched_identifier_value.as_deref(), Some("123 main"));
    }

    #[test]
    fn short_addresses_never_index_or_match() {
        let sources = [SourceRecord::new("S4", "Elm").with_address("5 Elm")];
        let targets = [TargetRecord::new("T5", "Elm").with_address("5 Elm")];
        let index = TargetIndex::build(&targets, DEFAULT_MIN_ADDRESS_LEN);
        assert!(index.address_keys().is_empty());
        assert!(index.lookup_address("5 elm").is_none());

        let report = match_records(&sources, &index, MatchOptions::default());
        assert!(report.matches.is_empty());
        assert_eq!(report.stats.unmatched_count, 1);
    }

    #[test]
    fn identifier_a_wins_over_address() {
        let sources = [SourceRecord::new("S1", "Acme")
            .with_identifier_a("C104")
            .with_address("900 Industrial Parkway")];
        let targets = [
            TargetRecord::new("T-addr", "By Address").with_address("900 Industrial Parkway"),
            TargetRecord::new("T-id", "By Id").with_identifier_a("C104"),
        ];
        let report = run(&sources, &targets);
        assert_eq!(report.matches.len(), 1);
        assert_eq!(report.matches[0].match_type, MatchType::IdentifierA);
        assert_eq!(report.matches[0].target_id, "T-id");
    }

    #[test]
    fn each_source_matches_at_most_once() {
        let sources = [SourceRecord::new("S1", "Acme")
            .with_identifier_a("C1")
            .with_identifier_b("77")
            .with_address("41 Harbor Way West")];
        let targets = [
            TargetRecord::new("T1", "A").with_identifier_a("C1"),
            TargetRecord::new("T2", "B").with_identifier_c("77"),
            TargetRecord::new("T3", "C").with_address("41 harbor way west"),
        ];
        let report = run(&sources, &targets);
        assert_eq!(report.matches.len(), 1);
        assert_eq!(report.stats.matched_count, 1);
        assert_eq!(report.stats.unmatched_count, 0);
    }

    #[test]
    fn blank_identifiers_never_match() {
        let sources = [
            SourceRecord::new("S1", "Blank").with_identifier_a(""),
            SourceRecord::new("S2", "Spaces").with_identifier_a("   "),
            SourceRecord::new("S3", "Missing"),
        ];
        let targets = [
            TargetRecord::new("T1", "Blank").with_identifier_a(""),
            TargetRecord::new("T2", "Spaces").with_identifier_a("  "),
        ];
        let index = TargetIndex::build(&targets, DEFAULT_MIN_ADDRESS_LEN);
        assert!(index.lookup_identifier_a("").is_none());
        let report = match_records(&sources, &index, MatchOptions::default());
        assert!(report.matches.is_empty());
        assert_eq!(report.stats.unmatched_count, 3);
    }

    #[test]
    fn identifier_comparison_is_case_sensitive() {
        let sources = [SourceRecord::new("S1", "Acme").with_identifier_a("c104")];
        let targets = [TargetRecord::new("T9", "Acme").with_identifier_a("C104")];
        assert!(run(&sources, &targets).matches.is_empty());
    }

    #[test]
    fn colliding_keys_keep_the_last_target_and_are_counted() {
        let targets = [
            TargetRecord::new("T1", "First")
                .with_identifier_a("C1")
                .with_address("10 Long Harbor Road"),
            TargetRecord::new("T2", "Second")
                .with_identifier_a("C1")
                .with_address("10 long harbor rd"),
            TargetRecord::new("T3", "Third").with_identifier_c("88"),
        ];
        let index = TargetIndex::build(&targets, DEFAULT_MIN_ADDRESS_LEN);
        assert_eq!(index.lookup_identifier_a("C1").unwrap().target_id, "T2");
        assert_eq!(index.lookup_address("10 long harbor").unwrap().target_id, "T2");
        assert_eq!(index.lookup_identifier_c(" 88 ").unwrap().target_id, "T3");
        assert_eq!(
            index.collisions(),
            IndexCollisions {
                identifier_a: 1,
                identifier_c: 0,
                address: 1
            }
        );

        let report = match_records(&[], &index, MatchOptions::default());
        assert_eq!(report.stats.index_collisions, 2);
        assert_eq!(report.stats.total_target, 3);
    }

    #[test]
    fn shared_target_is_not_deduplicated_by_default() {
        let sources = [
            SourceRecord::new("S1", "Acme East").with_identifier_a("C1"),
            SourceRecord::new("S2", "Acme West").with_address("500 Commerce Center"),
        ];
        let targets = [TargetRecord::new("T1", "Acme")
            .with_identifier_a("C1")
            .with_address("500 Commerce Center")];
        let report = run(&sources, &targets);
        assert_eq!(report.matches.len(), 2);
        assert!(report.matches.iter().all(|m| m.target_id == "T1"));
    }

    #[test]
    fn claim_mode_locks_targets_and_falls_through() {
        let sources = [
            SourceRecord::new("S1", "Acme East").with_identifier_a("C1"),
            SourceRecord::new("S2", "Acme West")
                .with_identifier_b("900")
                .with_address("500 Commerce Center"),
        ];
        let targets = [
            TargetRecord::new("T1", "Acme")
                .with_identifier_a("C1")
                .with_identifier_c("900"),
            TargetRecord::new("T2", "Acme West").with_address("500 Commerce Center"),
        ];
        let index = TargetIndex::build(&targets, DEFAULT_MIN_ADDRESS_LEN);
        let report = match_records(&sources, &index, MatchOptions { claim_targets: true });
        assert_eq!(report.matches.len(), 2);
        assert_eq!(report.matches[0].target_id, "T1");
        assert_eq!(report.matches[1].source_id, "S2");
        assert_eq!(report.matches[1].target_id, "T2");
        assert_eq!(report.matches[1].match_type, MatchType::Address);
    }

    #[test]
    fn config_reads_overrides_and_defaults() {
        let defaults = ReconConfig::default();
        assert_eq!(defaults.apply_batch_size, 500);
        assert_eq!(defaults.min_address_len, 5);
        assert!(defaults.database_url.is_none());
        assert!(!defaults.claim_targets);

        let vars = BTreeMap::from([
            ("DATABASE_URL", "postgres://u:p@localhost/custlink"),
            ("CUSTLINK_APPLY_BATCH_SIZE", "0"),
            ("CUSTLINK_CLAIM_TARGETS", "true"),
            ("CUSTLINK_SKIP_LINKED", "1"),
            ("CUSTLINK_DB_TIMEOUT_SECS", "not-a-number"),
        ]);
        let config = ReconConfig::from_vars(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.apply_batch_size, 1);
        assert!(config.claim_targets);
        assert!(config.skip_linked);
        assert_eq!(config.db_timeout_secs, 30);
        let pg = config.pg_store_config().unwrap();
        assert_eq!(pg.database_url, "postgres://u:p@localhost/custlink");
    }

    #[tokio::test]
    async fn loader_skips_malformed_documents() {
        let store = MemoryStore::new()
            .with_source_document("S1", json!({"name": "Good", "accountId": "C1"}))
            .with_source_document("S2", json!(["not", "an", "object"]))
            .with_target_document("doc-1", json!({"id": "T1", "accountId": "C1"}))
            .with_target_document("doc-2", json!({"Name": "No id"}));
        let snapshot = load_snapshot(&store).await.unwrap();
        assert_eq!(snapshot.sources.len(), 1);
        assert_eq!(snapshot.targets.len(), 1);
        assert_eq!(snapshot.skipped_sources, 1);
        assert_eq!(snapshot.skipped_targets, 1);
    }

    #[tokio::test]
    async fn load_failure_aborts_the_run() {
        let store = MemoryStore::new();
        store.fail_reads("deadline exceeded").await;
        let err = load_snapshot(&store).await.unwrap_err();
        assert!(matches!(err, ReconError::LoadFailure { .. }));
        assert_eq!(err.updated(), 0);
    }

    #[tokio::test]
    async fn target_read_failure_after_sources_load_aborts() {
        let store = MemoryStore::new()
            .with_source(&SourceRecord::new("S1", "Acme").with_identifier_a("C1"))
            .with_target("k1", &TargetRecord::new("T1", "Acme").with_identifier_a("C1"));
        store.fail_target_reads("quota exceeded").await;
        let err = load_snapshot(&store).await.unwrap_err();
        assert!(matches!(
            err,
            ReconError::LoadFailure {
                collection: "target records",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn batch_boundaries_commit_every_row() {
        for (count, expected_batches) in [(500, 1), (501, 2), (1000, 2), (1200, 3)] {
            let store = MemoryStore::new();
            let matches = (0..count).map(mk_match).collect::<Vec<_>>();
            let summary = apply_matches(&store, &matches, fixed_time(), DEFAULT_APPLY_BATCH_SIZE)
                .await
                .unwrap();
            assert_eq!(summary.updated, count, "count {count}");
            assert_eq!(summary.batches, expected_batches, "count {count}");
            assert_eq!(store.committed_batches(), expected_batches);
            assert_eq!(store.source_documents().await.len(), count);
        }
    }

    #[tokio::test]
    async fn empty_match_list_commits_nothing() {
        let store = MemoryStore::new();
        let summary = apply_matches(&store, &[], fixed_time(), 500).await.unwrap();
        assert_eq!(summary, ApplySummary::default());
        assert_eq!(store.committed_batches(), 0);
    }

    #[tokio::test]
    async fn applying_twice_yields_the_same_documents() {
        let store = MemoryStore::new()
            .with_source(&SourceRecord::new("S0", "Customer 0").with_identifier_a("C0"));
        let matches = (0..3).map(mk_match).collect::<Vec<_>>();

        apply_matches(&store, &matches, fixed_time(), 2).await.unwrap();
        let once = store.source_documents().await;
        apply_matches(&store, &matches, fixed_time(), 2).await.unwrap();
        let twice = store.source_documents().await;

        assert_eq!(once, twice);
        assert_eq!(twice["S0"]["identifierA"], "C0");
        assert_eq!(twice["S0"]["linkedTargetId"], "T0");
        assert_eq!(twice["S0"]["linkedTargetName"], "Company 0");
        assert_eq!(twice["S0"]["matchConfidence"], "high");
    }

    #[tokio::test]
    async fn partial_failure_reports_committed_batches() {
        let store = MemoryStore::new();
        store.fail_commit_at(2).await;
        let matches = (0..1200).map(mk_match).collect::<Vec<_>>();

        let err = apply_matches(&store, &matches, fixed_time(), 500)
            .await
            .unwrap_err();
        match &err {
            ReconError::ApplyPartialFailure {
                committed_batches,
                total_batches,
                updated,
                requested,
                ..
            } => {
                assert_eq!(*committed_batches, 2);
                assert_eq!(*total_batches, 3);
                assert_eq!(*updated, 1000);
                assert_eq!(*requested, 1200);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(err.updated(), 1000);
        assert_eq!(store.source_documents().await.len(), 1000);

        let summary = apply_matches(&store, &matches, fixed_time(), 500).await.unwrap();
        assert_eq!(summary.updated, 1200);
        assert_eq!(store.source_documents().await.len(), 1200);
    }

    #[tokio::test]
    async fn rows_without_ids_are_skipped_on_apply() {
        let store = MemoryStore::new();
        let mut blank = mk_match(1);
        blank.source_id = "  ".into();
        let summary = apply_matches(&store, &[mk_match(0), blank], fixed_time(), 500)
            .await
            .unwrap();
        assert_eq!(summary.requested, 2);
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.skipped, 1);
    }

    #[tokio::test]
    async fn padded_ids_write_to_the_existing_document() {
        let store = MemoryStore::new()
            .with_source(&SourceRecord::new("S1", "Acme").with_identifier_a("C104"));
        let mut padded = mk_match(1);
        padded.source_id = " S1 ".into();
        padded.target_id = " T9\t".into();
        let summary = apply_matches(&store, &[padded], fixed_time(), 500)
            .await
            .unwrap();
        assert_eq!(summary.updated, 1);

        let docs = store.source_documents().await;
        assert_eq!(docs.keys().map(String::as_str).collect::<Vec<_>>(), vec!["S1"]);
        assert_eq!(docs["S1"]["linkedTargetId"], "T9");
        assert_eq!(docs["S1"]["identifierA"], "C104");
    }

    #[tokio::test]
    async fn skip_linked_drops_linked_sources_before_matching() {
        let mut linked = SourceRecord::new("S1", "Linked").with_identifier_a("C1");
        linked.linked_target_id = Some("T1".into());
        let store = MemoryStore::new()
            .with_source(&linked)
            .with_source(&SourceRecord::new("S2", "Fresh").with_identifier_a("C2"))
            .with_target("k1", &TargetRecord::new("T1", "One").with_identifier_a("C1"))
            .with_target("k2", &TargetRecord::new("T2", "Two").with_identifier_a("C2"));
        let store = Arc::new(store);

        let reevaluate = Reconciler::new(store.clone(), ReconConfig::default());
        assert_eq!(reevaluate.run_match().await.unwrap().report.matches.len(), 2);

        let config = ReconConfig {
            skip_linked: true,
            ..ReconConfig::default()
        };
        let report = Reconciler::new(store, config).run_match().await.unwrap().report;
        assert_eq!(report.matches.len(), 1);
        assert_eq!(report.matches[0].source_id, "S2");
        assert_eq!(report.stats.total_source, 1);
    }

    #[tokio::test]
    async fn report_files_round_trip_through_review() {
        let dir = tempdir().expect("tempdir");
        let run = MatchRun {
            run_id: Uuid::new_v4(),
            started_at: fixed_time(),
            finished_at: fixed_time(),
            report: MatchReport {
                matches: vec![mk_match(1), mk_match(2)],
                stats: MatchStats {
                    total_source: 3,
                    total_target: 2,
                    matched_count: 2,
                    unmatched_count: 1,
                    ..MatchStats::default()
                },
            },
        };
        let run_dir = write_match_report(dir.path(), &run).await.unwrap();
        let summary = std::fs::read_to_string(run_dir.join("summary.md")).unwrap();
        assert!(summary.contains("- identifierA: 2"));

        let loaded = load_match_list(&run_dir.join("matches.json")).await.unwrap();
        assert_eq!(loaded, run.report.matches);

        let edited = dir.path().join("edited.json");
        std::fs::write(
            &edited,
            r#"[{"sourceId": "S1", "targetId": "T1", "matchType": "identifierA", "confidence": "high"}]"#,
        )
        .unwrap();
        let rows = load_match_list(&edited).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].target_id, "T1");
    }
}
