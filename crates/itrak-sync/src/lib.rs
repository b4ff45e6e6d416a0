//! Scan pipeline orchestration: change detection, extraction, persistence,
//! queue seeding, and report writing.
//!
//! A scan is one synchronous pass over every monitored source. Each source is
//! isolated: a fetch-level failure is recorded on that source's scan result
//! and leaves its processed position untouched, so the next scan retries the
//! same range. Re-running a scan is the retry mechanism; every stage is
//! idempotent end to end.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use git2::build::RepoBuilder;
use git2::{ObjectType, Oid, Repository, TreeWalkMode, TreeWalkResult};
use itrak_core::FilterConfig;
use itrak_parse::{segment_document, SegmentConfig, SourceFormat};
use itrak_queue::{WorkQueue, DEFAULT_QUEUE_KEY, DEFAULT_SEEN_SET_KEY};
use itrak_store::{OpportunityRow, Store};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "itrak-sync";

/// A change summary qualifies for document inspection when it contains one of
/// these (case-insensitive). Deliberately broad; the posting filter downstream
/// does the precise work.
const TRIGGER_WORDS: &[&str] = &[
    "add", "new", "update", "intern", "role", "position", "company", "job", "opening", "hiring",
];

pub fn is_relevant_change(summary: &str) -> bool {
    let lower = summary.to_lowercase();
    TRIGGER_WORDS.iter().any(|word| lower.contains(word))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    pub source_id: String,
    pub repo_url: String,
}

/// Runtime configuration: monitored sources, storage/queue locations, and the
/// extraction knobs. Defaults describe a working deployment; a YAML file
/// replaces the whole document, then env vars override deployment paths.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub sources: Vec<SourceSpec>,
    pub repos_dir: PathBuf,
    pub database_path: PathBuf,
    pub output_csv: PathBuf,
    /// Document fetched from each qualifying change, matched case-insensitively.
    pub document_name: String,
    /// Most-recent changes inspected when a source has never been scanned.
    pub backfill_count: usize,
    pub section_keywords: Vec<String>,
    pub carry_forward_organization: bool,
    pub filter: FilterConfig,
    pub redis_url: String,
    pub queue_key: String,
    pub seen_set_key: String,
    pub dequeue_timeout_secs: u64,
    /// Upper bound on companies seeded into the queue per scan, to pace the
    /// rate-limited people-search stage.
    pub max_companies_per_cycle: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sources: vec![
                SourceSpec {
                    source_id: "SimplifyJobs-Summer2026-Internships".to_string(),
                    repo_url: "https://github.com/SimplifyJobs/Summer2026-Internships.git"
                        .to_string(),
                },
                SourceSpec {
                    source_id: "speedyapply-2026-SWE-College-Jobs".to_string(),
                    repo_url: "https://github.com/speedyapply/2026-SWE-College-Jobs.git"
                        .to_string(),
                },
            ],
            repos_dir: PathBuf::from("monitored_repos"),
            database_path: PathBuf::from("internship_tracker.db"),
            output_csv: PathBuf::from("found_opportunities.csv"),
            document_name: "README.md".to_string(),
            backfill_count: 10,
            section_keywords: ["software", "data", "engineer"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            carry_forward_organization: false,
            filter: FilterConfig::default(),
            redis_url: "redis://localhost:6379/0".to_string(),
            queue_key: DEFAULT_QUEUE_KEY.to_string(),
            seen_set_key: DEFAULT_SEEN_SET_KEY.to_string(),
            dequeue_timeout_secs: 5,
            max_companies_per_cycle: 10,
        }
    }
}

impl MonitorConfig {
    /// Load from an optional YAML file, then apply env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                serde_yaml::from_str(&raw)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("REDIS_URL") {
            self.redis_url = url;
        }
        if let Ok(path) = std::env::var("ITRAK_DATABASE_PATH") {
            self.database_path = PathBuf::from(path);
        }
        if let Ok(dir) = std::env::var("ITRAK_REPOS_DIR") {
            self.repos_dir = PathBuf::from(dir);
        }
        if let Ok(path) = std::env::var("ITRAK_OUTPUT_CSV") {
            self.output_csv = PathBuf::from(path);
        }
    }

    pub fn segment_config(&self) -> SegmentConfig {
        SegmentConfig {
            section_keywords: self.section_keywords.clone(),
            carry_forward_organization: self.carry_forward_organization,
        }
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_secs(self.dequeue_timeout_secs)
    }
}

/// One change in a monitored source's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub id: String,
    pub summary: String,
}

/// Where changes come from. The pipeline only ever sees this trait; the git
/// plumbing below is one implementation of it.
pub trait ChangeSource {
    fn source_id(&self) -> &str;

    /// Bring the local copy up to date and return the current head change id.
    fn sync(&self) -> Result<String>;

    /// Changes reachable from `new_id` but not from `old_id`. Order is not
    /// guaranteed; callers treat the result as a set.
    fn changes_between(&self, old_id: &str, new_id: &str) -> Result<Vec<ChangeRecord>>;

    /// The `limit` most recent changes from the head.
    fn recent_changes(&self, limit: usize) -> Result<Vec<ChangeRecord>>;

    /// Snapshot of the named document at a change, matched case-insensitively
    /// anywhere in the tree. `None` when the change has no such document.
    fn document(&self, change_id: &str, file_name: &str) -> Result<Option<String>>;
}

/// Bare-clone git mirror of one monitored repository.
pub struct GitChangeSource {
    source_id: String,
    repo_url: String,
    local_path: PathBuf,
}

impl GitChangeSource {
    pub fn new(source_id: &str, repo_url: &str, repos_dir: &Path) -> Self {
        Self {
            source_id: source_id.to_string(),
            repo_url: repo_url.to_string(),
            local_path: repos_dir.join(source_id),
        }
    }

    fn open_or_clone(&self) -> Result<(Repository, bool)> {
        if self.local_path.exists() {
            let repo = Repository::open(&self.local_path)
                .with_context(|| format!("opening mirror {}", self.local_path.display()))?;
            Ok((repo, false))
        } else {
            let repo = RepoBuilder::new()
                .bare(true)
                .clone(&self.repo_url, &self.local_path)
                .with_context(|| format!("cloning {}", self.repo_url))?;
            Ok((repo, true))
        }
    }

    fn open(&self) -> Result<Repository> {
        Repository::open(&self.local_path)
            .with_context(|| format!("opening mirror {}", self.local_path.display()))
    }
}

impl ChangeSource for GitChangeSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn sync(&self) -> Result<String> {
        let (repo, fresh) = self.open_or_clone()?;
        if !fresh {
            let mut remote = repo.find_remote("origin")?;
            remote
                .fetch(&[] as &[&str], None, None)
                .with_context(|| format!("fetching {}", self.repo_url))?;
        }
        // FETCH_HEAD exists after a fetch; a fresh clone only has HEAD.
        let head = match repo.refname_to_id("FETCH_HEAD") {
            Ok(oid) => oid,
            Err(_) => repo.head()?.peel_to_commit()?.id(),
        };
        Ok(head.to_string())
    }

    fn changes_between(&self, old_id: &str, new_id: &str) -> Result<Vec<ChangeRecord>> {
        let repo = self.open()?;
        let mut walk = repo.revwalk()?;
        walk.push(Oid::from_str(new_id)?)?;
        walk.hide(Oid::from_str(old_id)?)?;

        let mut changes = Vec::new();
        for oid in walk {
            let oid = oid?;
            let commit = repo.find_commit(oid)?;
            changes.push(ChangeRecord {
                id: oid.to_string(),
                summary: commit.summary().unwrap_or_default().to_string(),
            });
        }
        Ok(changes)
    }

    fn recent_changes(&self, limit: usize) -> Result<Vec<ChangeRecord>> {
        let repo = self.open()?;
        let mut walk = repo.revwalk()?;
        walk.push_head()?;

        let mut changes = Vec::new();
        for oid in walk.take(limit) {
            let oid = oid?;
            let commit = repo.find_commit(oid)?;
            changes.push(ChangeRecord {
                id: oid.to_string(),
                summary: commit.summary().unwrap_or_default().to_string(),
            });
        }
        Ok(changes)
    }

    fn document(&self, change_id: &str, file_name: &str) -> Result<Option<String>> {
        let repo = self.open()?;
        let commit = repo.find_commit(Oid::from_str(change_id)?)?;
        let tree = commit.tree()?;
        let wanted = file_name.to_lowercase();

        let mut found: Option<Oid> = None;
        tree.walk(TreeWalkMode::PreOrder, |_, entry| {
            if found.is_none()
                && entry.kind() == Some(ObjectType::Blob)
                && entry
                    .name()
                    .map(|name| name.to_lowercase() == wanted)
                    .unwrap_or(false)
            {
                found = Some(entry.id());
            }
            TreeWalkResult::Ok
        })?;

        match found {
            Some(oid) => {
                let blob = repo.find_blob(oid)?;
                Ok(Some(String::from_utf8_lossy(blob.content()).into_owned()))
            }
            None => Ok(None),
        }
    }
}

/// Build a git source per configured entry.
pub fn git_sources(config: &MonitorConfig) -> Vec<GitChangeSource> {
    config
        .sources
        .iter()
        .map(|spec| GitChangeSource::new(&spec.source_id, &spec.repo_url, &config.repos_dir))
        .collect()
}

/// Outcome of scanning one source. `error` set means the source's processed
/// position was left as it was.
#[derive(Debug, Clone, Serialize)]
pub struct SourceScan {
    pub source_id: String,
    pub changes_inspected: usize,
    pub new_postings: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scans: Vec<SourceScan>,
    pub companies_enqueued: usize,
}

impl ScanSummary {
    pub fn new_postings(&self) -> usize {
        self.scans.iter().map(|s| s.new_postings).sum()
    }

    pub fn changes_inspected(&self) -> usize {
        self.scans.iter().map(|s| s.changes_inspected).sum()
    }

    pub fn failed_sources(&self) -> usize {
        self.scans.iter().filter(|s| s.error.is_some()).count()
    }
}

pub struct ScanPipeline<'a> {
    store: &'a Store,
    queue: &'a dyn WorkQueue,
    config: &'a MonitorConfig,
}

impl<'a> ScanPipeline<'a> {
    pub fn new(store: &'a Store, queue: &'a dyn WorkQueue, config: &'a MonitorConfig) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    /// One full pass: scan every source, then seed the queue from the store's
    /// recently-active organizations. Per-source failures are recorded, not
    /// propagated; queue transport failures are.
    pub fn run(&self, sources: &[&dyn ChangeSource]) -> Result<ScanSummary> {
        let started_at = Utc::now();
        let mut scans = Vec::with_capacity(sources.len());
        for source in sources {
            scans.push(self.scan_source(*source));
        }
        let companies_enqueued = self.enqueue_recent_companies()?;
        Ok(ScanSummary {
            started_at,
            finished_at: Utc::now(),
            scans,
            companies_enqueued,
        })
    }

    pub fn scan_source(&self, source: &dyn ChangeSource) -> SourceScan {
        match self.try_scan(source) {
            Ok(scan) => scan,
            Err(err) => {
                let reason = format!("{err:#}");
                warn!(
                    source = source.source_id(),
                    error = %reason,
                    "scan failed; processed position unchanged"
                );
                SourceScan {
                    source_id: source.source_id().to_string(),
                    changes_inspected: 0,
                    new_postings: 0,
                    error: Some(reason),
                }
            }
        }
    }

    fn try_scan(&self, source: &dyn ChangeSource) -> Result<SourceScan> {
        let source_id = source.source_id();
        let previous = self.store.processed_position(source_id)?;
        let head = source.sync()?;

        let changes = if previous.as_deref() == Some(head.as_str()) {
            Vec::new()
        } else {
            match &previous {
                Some(prev) => source.changes_between(prev, &head)?,
                None => source.recent_changes(self.config.backfill_count)?,
            }
        };

        let format = SourceFormat::for_source(source_id);
        if format.is_none() && !changes.is_empty() {
            warn!(source = source_id, "no registered document format; skipping extraction");
        }
        let segment_config = self.config.segment_config();

        let mut new_postings = 0;
        for change in &changes {
            if !is_relevant_change(&change.summary) {
                continue;
            }
            let Some(format) = format else { continue };
            let Some(content) = source.document(&change.id, &self.config.document_name)? else {
                debug!(
                    source = source_id,
                    change = %change.id,
                    document = %self.config.document_name,
                    "document absent at change; skipping"
                );
                continue;
            };
            let kept: Vec<_> =
                segment_document(format, &content, source_id, &change.id, &segment_config)
                    .into_iter()
                    .filter(|posting| self.config.filter.keeps_posting(posting))
                    .collect();
            new_postings += self.store.insert_postings(&kept)?;
        }

        self.store.set_processed_position(source_id, &head)?;
        Ok(SourceScan {
            source_id: source_id.to_string(),
            changes_inspected: changes.len(),
            new_postings,
            error: None,
        })
    }

    /// Seed the work queue with organizations that had a posting discovered in
    /// the trailing day, up to the per-cycle cap. Returns how many were newly
    /// enqueued.
    pub fn enqueue_recent_companies(&self) -> Result<usize> {
        let mut enqueued = 0;
        for organization in self.store.organizations_with_recent_postings()? {
            if enqueued >= self.config.max_companies_per_cycle {
                break;
            }
            if self.queue.enqueue(&organization)? {
                debug!(%organization, "queued for people search");
                enqueued += 1;
            }
        }
        Ok(enqueued)
    }
}

/// Blocking consumer loop. Each dequeue waits up to `timeout` so the shutdown
/// flag is re-checked at that cadence. Handler failures are logged and the
/// entry is not requeued. Returns the number of companies handled.
pub fn run_worker(
    queue: &dyn WorkQueue,
    timeout: Duration,
    shutdown: &AtomicBool,
    mut handler: impl FnMut(&str) -> Result<()>,
) -> Result<usize> {
    let mut handled = 0;
    while !shutdown.load(Ordering::SeqCst) {
        let Some(company) = queue.dequeue(true, timeout)? else {
            continue;
        };
        match handler(&company) {
            Ok(()) => handled += 1,
            Err(err) => {
                let reason = format!("{err:#}");
                warn!(%company, error = %reason, "company handler failed; entry dropped");
            }
        }
    }
    Ok(handled)
}

const CSV_HEADER: &str = "Company,Role,Location,Application Link,Posting Found,\
Contact Name,Contact Headline,Contact Profile,Contact Found";

/// Write the joined postings/people rows as CSV, newest posting first.
pub fn write_opportunity_csv(path: &Path, rows: &[OpportunityRow]) -> Result<()> {
    let mut out = String::with_capacity(rows.len() * 128 + CSV_HEADER.len());
    out.push_str(CSV_HEADER);
    out.push('\n');
    for row in rows {
        let fields = [
            csv_field(&row.organization),
            csv_field(&row.role),
            csv_field(&row.location),
            csv_field(&row.application_link),
            csv_field(&format_report_ts(row.posting_discovered_at)),
            csv_field(row.person_name.as_deref().unwrap_or_default()),
            csv_field(row.person_headline.as_deref().unwrap_or_default()),
            csv_field(row.person_profile_url.as_deref().unwrap_or_default()),
            csv_field(
                &row.person_discovered_at
                    .map(format_report_ts)
                    .unwrap_or_default(),
            ),
        ];
        out.push_str(&fields.join(","));
        out.push('\n');
    }
    std::fs::write(path, out).with_context(|| format!("writing report {}", path.display()))?;
    Ok(())
}

fn format_report_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
