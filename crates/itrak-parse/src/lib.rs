//! Markdown table extraction: per-source row parsing + document segmentation.
//!
//! The monitored listing documents are semi-structured Markdown tables
//! maintained by external parties. Parsing is line-oriented and best-effort:
//! a line either matches a known source format's row convention and yields a
//! [`Posting`] candidate, or it is ignored. Unknown source formats yield no
//! candidates at all (fail closed).

use std::sync::LazyLock;

use chrono::Utc;
use itrak_core::Posting;
use regex::Regex;

pub const CRATE_NAME: &str = "itrak-parse";

static ORG_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*\[(.*?)\]").expect("org link pattern"));
static APPLY_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[Apply\]\((.*?)\)").expect("apply link pattern"));

/// Row-leading token meaning "same organization as the previous row".
pub const CONTINUATION_MARKER: &str = "↳";

/// Literal substituted for a continuation row when no previous organization is
/// supplied; see [`RowContext::previous_organization`].
pub const CONTINUATION_PLACEHOLDER: &str = "Previous Company";

/// Known document layouts, one variant per monitored source family.
///
/// Adding a monitored source means adding a variant and its [`RowLayout`];
/// the dispatch below never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// `| **[Company](url)** | Role | Location | [Apply](url) | Age |` tables.
    SimplifyJobs,
    /// Registered but without an implemented row layout: every line yields no
    /// candidate. Documented incompleteness, not an error.
    SpeedyApply,
}

impl SourceFormat {
    /// Source-identifier to format lookup. Unknown sources return `None` and
    /// are skipped entirely by the segmenter.
    pub fn for_source(source_id: &str) -> Option<SourceFormat> {
        if source_id.contains("SimplifyJobs") {
            Some(SourceFormat::SimplifyJobs)
        } else if source_id.contains("speedyapply") {
            Some(SourceFormat::SpeedyApply)
        } else {
            None
        }
    }

    fn layout(self) -> Option<&'static RowLayout> {
        match self {
            SourceFormat::SimplifyJobs => Some(&SIMPLIFY_JOBS_LAYOUT),
            SourceFormat::SpeedyApply => None,
        }
    }
}

/// Field positions and row conventions for one table format.
#[derive(Debug, Clone)]
pub struct RowLayout {
    pub delimiter: char,
    pub min_fields: usize,
    pub row_prefixes: &'static [&'static str],
    pub organization_field: usize,
    pub role_field: usize,
    pub location_field: usize,
    pub application_field: usize,
}

static SIMPLIFY_JOBS_LAYOUT: RowLayout = RowLayout {
    delimiter: '|',
    min_fields: 5,
    row_prefixes: &["| **[", "| ↳"],
    organization_field: 1,
    role_field: 2,
    location_field: 3,
    application_field: 4,
};

/// Contextual metadata threaded into per-line parsing.
#[derive(Debug, Clone, Copy)]
pub struct RowContext<'a> {
    pub source_id: &'a str,
    pub change_id: &'a str,
    pub section: &'a str,
    /// Organization of the previous accepted row, used to resolve
    /// continuation rows. With `None`, continuation rows get
    /// [`CONTINUATION_PLACEHOLDER`] instead.
    pub previous_organization: Option<&'a str>,
}

/// Parse one line into a posting candidate, or `None` if the line is not a
/// row under the given format. Missing apply links become empty strings;
/// role and location are trimmed raw field text.
pub fn parse_row(format: SourceFormat, line: &str, ctx: &RowContext<'_>) -> Option<Posting> {
    let layout = format.layout()?;

    if !layout.row_prefixes.iter().any(|p| line.starts_with(p)) {
        return None;
    }

    let fields: Vec<&str> = line.split(layout.delimiter).map(str::trim).collect();
    if fields.len() < layout.min_fields {
        return None;
    }

    let organization_field = fields[layout.organization_field];
    let organization = if organization_field == CONTINUATION_MARKER {
        ctx.previous_organization
            .unwrap_or(CONTINUATION_PLACEHOLDER)
            .to_string()
    } else {
        ORG_LINK_RE
            .captures(organization_field)
            .map(|caps| caps[1].to_string())
            .unwrap_or_else(|| organization_field.to_string())
    };

    let application_link = APPLY_LINK_RE
        .captures(fields[layout.application_field])
        .map(|caps| caps[1].to_string())
        .unwrap_or_default();

    Some(Posting {
        organization,
        role: fields[layout.role_field].to_string(),
        location: fields[layout.location_field].to_string(),
        application_link,
        source_id: ctx.source_id.to_string(),
        change_id: ctx.change_id.to_string(),
        section: ctx.section.to_string(),
        discovered_at: Utc::now(),
    })
}

/// Section tracking and continuation carry-forward knobs for the segmenter.
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    /// A `##` heading replaces the current section only when it contains one
    /// of these keywords (case-insensitive).
    pub section_keywords: Vec<String>,
    /// When true, continuation rows resolve to the previous accepted row's
    /// organization instead of [`CONTINUATION_PLACEHOLDER`].
    pub carry_forward_organization: bool,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            section_keywords: ["software", "data", "engineer"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            carry_forward_organization: false,
        }
    }
}

impl SegmentConfig {
    fn is_section_heading(&self, line: &str) -> bool {
        if !line.starts_with("##") {
            return false;
        }
        let lower = line.to_lowercase();
        self.section_keywords
            .iter()
            .any(|kw| lower.contains(&kw.to_lowercase()))
    }
}

/// Walk a document's lines in order, threading (current section, previous
/// organization) forward as an explicit accumulator, and collect every row
/// the parser accepts. Output order matches document line order.
///
/// The section starts empty and is overwritten only by a heading line that
/// passes the keyword filter; non-matching headings leave it untouched.
pub fn segment_document(
    format: SourceFormat,
    content: &str,
    source_id: &str,
    change_id: &str,
    config: &SegmentConfig,
) -> Vec<Posting> {
    let walk = content.lines().fold(Walk::default(), |mut walk, line| {
        if config.is_section_heading(line) {
            walk.section = line.trim().to_string();
        }

        let ctx = RowContext {
            source_id,
            change_id,
            section: &walk.section,
            previous_organization: if config.carry_forward_organization {
                walk.previous_organization.as_deref()
            } else {
                None
            },
        };
        if let Some(posting) = parse_row(format, line, &ctx) {
            walk.previous_organization = Some(posting.organization.clone());
            walk.postings.push(posting);
        }
        walk
    });
    walk.postings
}

#[derive(Debug, Default)]
struct Walk {
    section: String,
    previous_organization: Option<String>,
    postings: Vec<Posting>,
}
