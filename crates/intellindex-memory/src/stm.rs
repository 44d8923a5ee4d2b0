//! Short-Term Memory (STM) Consolidator.
//!
//! Maintains one bounded report per namespace, split into a **Dated** section
//! of time buckets and an **Undated** section of durable generalizations.
//!
//! ## Rollup model
//!
//! New information always lands in today's day bucket.  On every update each
//! bucket is re-evaluated by age (days between its last day and today) and
//! coarsened to the granularity its age calls for:
//!
//! ```text
//! age <  day_window      → Day
//! age <  week_window     → Week
//! age <  month_window    → Month
//! age <  quarter_window  → Quarter
//! otherwise              → Year
//! ```
//!
//! Buckets that coarsen onto the same period are merged and, when the merge
//! exceeds the granularity's entry cap, condensed by a [`Condenser`].  An
//! entry that recurs in at least `promotion_threshold` distinct buckets is
//! promoted to the Undated section.  Finally the dated-entry budget is
//! enforced by condensing the oldest buckets first, then by folding the two
//! oldest buckets into a multi-year span.
//!
//! Every cap is applied after condensation as well, so the rendered report
//! never exceeds [`RollupPolicy::size_ceiling`] no matter what a
//! generation-backed condenser returns.
//!
//! ## Report format
//!
//! ```markdown
//! # Short-Term Report
//!
//! ## Section 1: Dated Data
//!
//! ### 2025-03-29
//! - Observed unusual spike in user logins during late evening.
//!
//! ### Week of 2025-03-17 to 2025-03-23 (summarized)
//! - Login patterns stable.
//!
//! ## Section 2: Undated (General Knowledge)
//! - Peak activity is typically observed between 12 PM-2 PM local time.
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, Duration, Month, NaiveDate, Utc};
use intellindex_types::{ChatMessage, Generator, IndexError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::store::{KeyedStore, StoreError, StoreWrite};

/// Top-level namespace segment for STM reports.
pub const STM: &str = "stm";

const REPORT_TITLE: &str = "# Short-Term Report";
const DATED_HEADING: &str = "## Section 1: Dated Data";
const UNDATED_HEADING: &str = "## Section 2: Undated (General Knowledge)";
const SUMMARIZED_SUFFIX: &str = " (summarized)";

// ─────────────────────────────────────────────────────────────────────────────
// Periods
// ─────────────────────────────────────────────────────────────────────────────

/// Time resolution of a dated bucket, finest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Granularity {
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

/// The span of time a dated bucket covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Period {
    Day(NaiveDate),
    /// ISO week, identified by its Monday.
    Week(NaiveDate),
    Month { year: i32, month: u32 },
    Quarter { year: i32, quarter: u32 },
    Year(i32),
    /// Several consecutive years folded together once the budget is tight.
    Years { from: i32, to: i32 },
}

fn ymd(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or_default()
}

fn monday_of(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    ymd(ny, nm, 1) - Duration::days(1)
}

fn month_name(month: u32) -> &'static str {
    u8::try_from(month)
        .ok()
        .and_then(|m| Month::try_from(m).ok())
        .map(|m| m.name())
        .unwrap_or("Unknown")
}

impl Period {
    pub fn granularity(&self) -> Granularity {
        match self {
            Period::Day(_) => Granularity::Day,
            Period::Week(_) => Granularity::Week,
            Period::Month { .. } => Granularity::Month,
            Period::Quarter { .. } => Granularity::Quarter,
            Period::Year(_) | Period::Years { .. } => Granularity::Year,
        }
    }

    /// First day covered.
    pub fn start(&self) -> NaiveDate {
        match *self {
            Period::Day(d) => d,
            Period::Week(monday) => monday,
            Period::Month { year, month } => ymd(year, month, 1),
            Period::Quarter { year, quarter } => ymd(year, (quarter - 1) * 3 + 1, 1),
            Period::Year(year) => ymd(year, 1, 1),
            Period::Years { from, .. } => ymd(from, 1, 1),
        }
    }

    /// Last day covered (inclusive).
    pub fn end(&self) -> NaiveDate {
        match *self {
            Period::Day(d) => d,
            Period::Week(monday) => monday + Duration::days(6),
            Period::Month { year, month } => last_day_of_month(year, month),
            Period::Quarter { year, quarter } => last_day_of_month(year, quarter * 3),
            Period::Year(year) => ymd(year, 12, 31),
            Period::Years { to, .. } => ymd(to, 12, 31),
        }
    }

    /// The period of granularity `target` that contains this period's start.
    /// Never refines: a target at or below the current granularity returns
    /// `self`.
    pub fn coarsen_to(&self, target: Granularity) -> Period {
        if target <= self.granularity() {
            return *self;
        }
        let s = self.start();
        match target {
            Granularity::Day => Period::Day(s),
            Granularity::Week => Period::Week(monday_of(s)),
            Granularity::Month => Period::Month { year: s.year(), month: s.month() },
            Granularity::Quarter => Period::Quarter { year: s.year(), quarter: (s.month() - 1) / 3 + 1 },
            Granularity::Year => Period::Year(s.year()),
        }
    }

    pub fn label(&self) -> String {
        match *self {
            Period::Day(d) => d.format("%Y-%m-%d").to_string(),
            Period::Week(monday) => format!(
                "Week of {} to {}",
                monday.format("%Y-%m-%d"),
                (monday + Duration::days(6)).format("%Y-%m-%d")
            ),
            Period::Month { year, month } => format!("{} {year}", month_name(month)),
            Period::Quarter { year, quarter } => format!("Q{quarter} {year}"),
            Period::Year(year) => year.to_string(),
            Period::Years { from, to } => format!("Years {from} to {to}"),
        }
    }

    /// Parse a bucket heading produced by [`label`][Self::label], with or
    /// without the `(summarized)` suffix.
    pub fn parse_label(raw: &str) -> Option<Period> {
        let s = raw.trim();
        let s = s.strip_suffix(SUMMARIZED_SUFFIX).unwrap_or(s).trim();

        if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return Some(Period::Day(d));
        }
        if let Some(rest) = s.strip_prefix("Week of ") {
            let first = rest.split_whitespace().next()?;
            let d = NaiveDate::parse_from_str(first, "%Y-%m-%d").ok()?;
            return Some(Period::Week(monday_of(d)));
        }
        if let Some(rest) = s.strip_prefix("Years ") {
            let (from, to) = rest.split_once(" to ")?;
            let from: i32 = from.trim().parse().ok()?;
            let to: i32 = to.trim().parse().ok()?;
            return (from <= to).then_some(Period::Years { from, to });
        }
        if let Some(rest) = s.strip_prefix('Q') {
            let (q, year) = rest.split_once(' ')?;
            let quarter: u32 = q.parse().ok()?;
            let year: i32 = year.trim().parse().ok()?;
            return (1..=4).contains(&quarter).then_some(Period::Quarter { year, quarter });
        }
        if let Some((name, year)) = s.split_once(' ') {
            let month = name.parse::<Month>().ok()?;
            let year: i32 = year.trim().parse().ok()?;
            return Some(Period::Month { year, month: month.number_from_month() });
        }
        if s.len() == 4 {
            return s.parse::<i32>().ok().map(Period::Year);
        }
        None
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Report model
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatedBucket {
    pub period: Period,
    pub entries: Vec<String>,
}

/// Parsed STM report.  Dated buckets are kept newest first; undated entries
/// most recently promoted first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StmReport {
    pub dated: Vec<DatedBucket>,
    pub undated: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Preamble,
    Dated,
    Undated,
}

fn strip_bullet(line: &str) -> &str {
    let t = line.trim();
    for marker in ["- ", "* ", "+ ", "• "] {
        if let Some(rest) = t.strip_prefix(marker) {
            return rest.trim();
        }
    }
    t
}

/// Normalised form used to detect repeated entries.
fn normalize(entry: &str) -> String {
    entry
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches('.')
        .to_lowercase()
}

fn dedupe(entries: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    entries.into_iter().filter(|e| seen.insert(normalize(e))).collect()
}

/// Split `text` into sentence-level clauses, breaking any clause longer than
/// `max_piece` characters at word boundaries.
fn split_clauses(text: &str, max_piece: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?' | ';') && chars.peek().is_none_or(|n| n.is_whitespace()) {
            push_piece(&mut pieces, &current, max_piece);
            current.clear();
        }
    }
    push_piece(&mut pieces, &current, max_piece);
    pieces
}

fn push_piece(pieces: &mut Vec<String>, piece: &str, max_piece: usize) {
    let piece = piece.trim();
    if piece.is_empty() {
        return;
    }
    if piece.chars().count() <= max_piece {
        pieces.push(piece.to_string());
        return;
    }
    let mut chunk = String::new();
    for word in piece.split_whitespace() {
        if !chunk.is_empty() && chunk.chars().count() + 1 + word.chars().count() > max_piece {
            pieces.push(std::mem::take(&mut chunk));
        }
        if !chunk.is_empty() {
            chunk.push(' ');
        }
        chunk.push_str(word);
    }
    if !chunk.is_empty() {
        pieces.push(chunk);
    }
}

fn clip(entry: &str, max_chars: usize) -> String {
    if entry.chars().count() <= max_chars {
        return entry.to_string();
    }
    let mut out: String = entry.chars().take(max_chars.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

impl StmReport {
    /// Parse a rendered report.  Text outside the known layout is kept as
    /// undated entries so nothing a reviewer wrote by hand is lost.
    pub fn parse(text: &str) -> StmReport {
        let mut report = StmReport::default();
        let mut section = Section::Preamble;
        let mut current: Option<usize> = None;

        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Some(heading) = trimmed.strip_prefix("## ") {
                current = None;
                section = if heading.contains("Undated") {
                    Section::Undated
                } else if heading.contains("Dated") {
                    Section::Dated
                } else {
                    section
                };
                continue;
            }
            if let Some(heading) = trimmed.strip_prefix("### ") {
                current = match Period::parse_label(heading) {
                    Some(period) => {
                        section = Section::Dated;
                        Some(report.bucket_index(period))
                    }
                    None => None,
                };
                continue;
            }
            if trimmed.starts_with("# ") {
                continue;
            }

            let entry = strip_bullet(trimmed).to_string();
            if entry.is_empty() {
                continue;
            }
            match (section, current) {
                (Section::Dated, Some(idx)) => report.dated[idx].entries.push(entry),
                _ => report.undated.push(entry),
            }
        }
        report.sort_buckets();
        report
    }

    /// Render in the canonical markdown layout.  An empty report renders as
    /// an empty string.
    pub fn render(&self) -> String {
        if self.dated.is_empty() && self.undated.is_empty() {
            return String::new();
        }
        let mut out = String::new();
        out.push_str(REPORT_TITLE);
        out.push_str("\n\n");
        out.push_str(DATED_HEADING);
        out.push('\n');
        for bucket in &self.dated {
            out.push_str("\n### ");
            out.push_str(&bucket.period.label());
            if bucket.period.granularity() != Granularity::Day {
                out.push_str(SUMMARIZED_SUFFIX);
            }
            out.push('\n');
            for entry in &bucket.entries {
                out.push_str("- ");
                out.push_str(entry);
                out.push('\n');
            }
        }
        out.push('\n');
        out.push_str(UNDATED_HEADING);
        out.push('\n');
        for entry in &self.undated {
            out.push_str("- ");
            out.push_str(entry);
            out.push('\n');
        }
        out
    }

    pub fn dated_entry_count(&self) -> usize {
        self.dated.iter().map(|b| b.entries.len()).sum()
    }

    fn bucket_index(&mut self, period: Period) -> usize {
        match self.dated.iter().position(|b| b.period == period) {
            Some(idx) => idx,
            None => {
                self.dated.push(DatedBucket { period, entries: Vec::new() });
                self.dated.len() - 1
            }
        }
    }

    fn sort_buckets(&mut self) {
        self.dated.retain(|b| !b.entries.is_empty());
        self.dated.sort_by(|a, b| {
            b.period
                .end()
                .cmp(&a.period.end())
                .then_with(|| a.period.granularity().cmp(&b.period.granularity()))
        });
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Policy
// ─────────────────────────────────────────────────────────────────────────────

/// Thresholds and caps governing the rollup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollupPolicy {
    /// Buckets younger than this many days stay at day resolution.
    pub day_window_days: i64,
    pub week_window_days: i64,
    pub month_window_days: i64,
    pub quarter_window_days: i64,
    pub max_day_entries: usize,
    pub max_week_entries: usize,
    pub max_month_entries: usize,
    pub max_quarter_entries: usize,
    pub max_year_entries: usize,
    /// Upper bound on entries across the whole Dated section.
    pub max_dated_entries: usize,
    pub max_undated_entries: usize,
    pub max_entry_chars: usize,
    /// Distinct buckets an entry must recur in before it is promoted.
    pub promotion_threshold: usize,
}

impl Default for RollupPolicy {
    fn default() -> Self {
        Self {
            day_window_days: 7,
            week_window_days: 35,
            month_window_days: 92,
            quarter_window_days: 366,
            max_day_entries: 12,
            max_week_entries: 10,
            max_month_entries: 8,
            max_quarter_entries: 6,
            max_year_entries: 5,
            max_dated_entries: 60,
            max_undated_entries: 15,
            max_entry_chars: 400,
            promotion_threshold: 3,
        }
    }
}

impl RollupPolicy {
    /// Granularity a bucket whose last day is `age_days` old belongs at.
    pub fn target_granularity(&self, age_days: i64) -> Granularity {
        if age_days < self.day_window_days {
            Granularity::Day
        } else if age_days < self.week_window_days {
            Granularity::Week
        } else if age_days < self.month_window_days {
            Granularity::Month
        } else if age_days < self.quarter_window_days {
            Granularity::Quarter
        } else {
            Granularity::Year
        }
    }

    pub fn cap_for(&self, g: Granularity) -> usize {
        let cap = match g {
            Granularity::Day => self.max_day_entries,
            Granularity::Week => self.max_week_entries,
            Granularity::Month => self.max_month_entries,
            Granularity::Quarter => self.max_quarter_entries,
            Granularity::Year => self.max_year_entries,
        };
        cap.max(1)
    }

    /// Hard upper bound on the rendered size of any consolidated report, in
    /// characters.  Each dated bucket holds at least one entry, so the bucket
    /// count is bounded by the dated-entry budget.
    pub fn size_ceiling(&self) -> usize {
        const HEADING_CHARS: usize = 64;
        const BULLET_CHARS: usize = 3;
        let entries = self.max_dated_entries.max(1) + self.max_undated_entries;
        entries * (self.max_entry_chars + BULLET_CHARS)
            + self.max_dated_entries.max(1) * HEADING_CHARS
            + REPORT_TITLE.len()
            + DATED_HEADING.len()
            + UNDATED_HEADING.len()
            + 16
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Condensers
// ─────────────────────────────────────────────────────────────────────────────

/// Collapses a list of observations into at most `max_entries` entries while
/// preserving key facts, anomalies, and trends.
#[async_trait]
pub trait Condenser: Send + Sync {
    async fn condense(
        &self,
        label: &str,
        entries: &[String],
        max_entries: usize,
    ) -> Result<Vec<String>, IndexError>;

    /// Rewrite one over-long entry into at most `max_chars` characters,
    /// keeping its salient facts.
    async fn shorten(&self, _label: &str, entry: &str, max_chars: usize) -> Result<String, IndexError> {
        Ok(SalienceCondenser::shorten_now(entry, max_chars))
    }
}

const SALIENT_TERMS: &[&str] = &[
    "anomal", "spike", "drop", "outage", "error", "fail", "alert", "critical", "unusual",
    "increase", "decrease", "peak", "trend", "degrad", "incident", "warning",
];

/// Deterministic condenser: deduplicates, then keeps the most salient entries
/// (numbers and anomaly vocabulary score highest) in their original order.
#[derive(Debug, Clone, Default)]
pub struct SalienceCondenser;

impl SalienceCondenser {
    fn salience(entry: &str) -> usize {
        let lower = entry.to_lowercase();
        let terms = SALIENT_TERMS.iter().filter(|t| lower.contains(*t)).count();
        let has_number = entry.chars().any(|c| c.is_ascii_digit());
        terms * 2 + usize::from(has_number)
    }

    pub fn condense_now(entries: &[String], max_entries: usize) -> Vec<String> {
        let unique = dedupe(entries.to_vec());
        if unique.len() <= max_entries {
            return unique;
        }
        let mut ranked: Vec<(usize, usize)> = unique
            .iter()
            .enumerate()
            .map(|(i, e)| (i, Self::salience(e)))
            .collect();
        // Highest salience first; earlier (newer) entries win ties.
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let mut keep: Vec<usize> = ranked.into_iter().take(max_entries).map(|(i, _)| i).collect();
        keep.sort_unstable();
        keep.into_iter().map(|i| unique[i].clone()).collect()
    }

    /// Drop the least salient clauses of `entry` until it fits in
    /// `max_chars`.  Kept clauses stay in their original order.
    pub fn shorten_now(entry: &str, max_chars: usize) -> String {
        if entry.chars().count() <= max_chars {
            return entry.to_string();
        }
        let clauses = dedupe(split_clauses(entry, (max_chars / 2).max(1)));
        let mut ranked: Vec<(usize, usize)> = clauses
            .iter()
            .enumerate()
            .map(|(i, c)| (i, Self::salience(c)))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut keep = Vec::new();
        let mut used = 0;
        for (i, _) in ranked {
            let len = clauses[i].chars().count();
            let cost = if keep.is_empty() { len } else { len + 1 };
            if used + cost <= max_chars {
                keep.push(i);
                used += cost;
            }
        }
        keep.sort_unstable();
        let out = keep.iter().map(|&i| clauses[i].as_str()).collect::<Vec<_>>().join(" ");
        if out.is_empty() { clip(entry, max_chars) } else { out }
    }
}

#[async_trait]
impl Condenser for SalienceCondenser {
    async fn condense(
        &self,
        _label: &str,
        entries: &[String],
        max_entries: usize,
    ) -> Result<Vec<String>, IndexError> {
        Ok(Self::condense_now(entries, max_entries))
    }
}

/// Generation-backed condenser using the memory model.
pub struct GenerativeCondenser {
    llm: Arc<dyn Generator>,
}

impl GenerativeCondenser {
    pub fn new(llm: Arc<dyn Generator>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Condenser for GenerativeCondenser {
    async fn condense(
        &self,
        label: &str,
        entries: &[String],
        max_entries: usize,
    ) -> Result<Vec<String>, IndexError> {
        let system = format!(
            "You are a Short-Term Memory Manager. Condense the observations for \
             \"{label}\" into at most {max_entries} bullet points.\n\
             - Combine related entries where possible.\n\
             - Eliminate redundant or obsolete details.\n\
             - Preserve key insights, trends, and anomalies.\n\
             Reply with the bullet points only, one per line, each starting with \"- \"."
        );
        let listing = entries.iter().map(|e| format!("- {e}")).collect::<Vec<_>>().join("\n");
        let raw = self.llm.generate(&system, &[ChatMessage::user(listing)]).await?;
        let condensed: Vec<String> = raw
            .lines()
            .map(strip_bullet)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect();
        if condensed.is_empty() {
            warn!(label, "condenser reply had no bullet points; using salience ranking");
            return Ok(SalienceCondenser::condense_now(entries, max_entries));
        }
        Ok(condensed)
    }

    async fn shorten(&self, label: &str, entry: &str, max_chars: usize) -> Result<String, IndexError> {
        let system = format!(
            "You are a Short-Term Memory Manager. Rewrite the observation for \
             \"{label}\" in at most {max_chars} characters.\n\
             - Preserve key facts, numbers, trends, and anomalies.\n\
             Reply with the rewritten observation only, on a single line."
        );
        let raw = self.llm.generate(&system, &[ChatMessage::user(entry)]).await?;
        let rewritten = raw
            .lines()
            .map(strip_bullet)
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if rewritten.is_empty() {
            warn!(label, "condenser returned an empty rewrite; using salience ranking");
            return Ok(SalienceCondenser::shorten_now(entry, max_chars));
        }
        Ok(SalienceCondenser::shorten_now(&rewritten, max_chars))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// StmConsolidator
// ─────────────────────────────────────────────────────────────────────────────

/// Folds new information into a namespace's STM report under a
/// [`RollupPolicy`].
pub struct StmConsolidator {
    policy: RollupPolicy,
    condenser: Arc<dyn Condenser>,
}

impl StmConsolidator {
    pub fn new(policy: RollupPolicy, condenser: Arc<dyn Condenser>) -> Self {
        Self { policy, condenser }
    }

    /// Consolidator with the default policy and the deterministic condenser.
    pub fn deterministic() -> Self {
        Self::new(RollupPolicy::default(), Arc::new(SalienceCondenser))
    }

    pub fn policy(&self) -> &RollupPolicy {
        &self.policy
    }

    /// Fold `new_information` into `current_report` as of today (UTC).
    pub async fn update(
        &self,
        namespace: &str,
        current_report: &str,
        new_information: &str,
    ) -> Result<String, IndexError> {
        self.update_on(namespace, current_report, new_information, Utc::now().date_naive())
            .await
    }

    /// Fold `new_information` into `current_report` as of `today`.
    pub async fn update_on(
        &self,
        namespace: &str,
        current_report: &str,
        new_information: &str,
        today: NaiveDate,
    ) -> Result<String, IndexError> {
        let mut report = StmReport::parse(current_report);

        // 1. Today's bucket.
        let incoming = StmReport::parse(new_information);
        let today_label = Period::Day(today).label();
        let mut fresh = Vec::new();
        for entry in incoming.dated.into_iter().flat_map(|b| b.entries).chain(incoming.undated) {
            fresh.push(self.fit(&today_label, entry).await?);
        }
        if !fresh.is_empty() {
            let idx = report.bucket_index(Period::Day(today));
            let mut merged = fresh;
            merged.append(&mut report.dated[idx].entries);
            report.dated[idx].entries = dedupe(merged);
        }

        // 2. Coarsen by age and merge buckets that land on the same period.
        self.roll_up(&mut report, today);

        // 3. Condense buckets over their cap.
        for bucket in &mut report.dated {
            let cap = self.policy.cap_for(bucket.period.granularity());
            if bucket.entries.len() > cap {
                bucket.entries = self.condense(&bucket.period.label(), &bucket.entries, cap).await?;
            }
        }

        // 4. Promote recurring patterns.
        self.promote(&mut report);

        // 5. Undated cap.
        let undated_cap = self.policy.max_undated_entries;
        if report.undated.len() > undated_cap {
            report.undated = self.condense("General Knowledge", &report.undated, undated_cap).await?;
        }

        // 6. Dated budget.
        self.enforce_budget(&mut report).await?;

        // 7. Entry length, for whatever the condenser returned.
        for bucket in &mut report.dated {
            let label = bucket.period.label();
            let mut fitted = Vec::with_capacity(bucket.entries.len());
            for entry in std::mem::take(&mut bucket.entries) {
                fitted.push(self.fit(&label, entry).await?);
            }
            bucket.entries = dedupe(fitted);
        }
        let mut fitted = Vec::with_capacity(report.undated.len());
        for entry in std::mem::take(&mut report.undated) {
            fitted.push(self.fit("General Knowledge", entry).await?);
        }
        report.undated = dedupe(fitted);
        report.sort_buckets();

        let rendered = report.render();
        debug!(
            namespace,
            buckets = report.dated.len(),
            dated_entries = report.dated_entry_count(),
            undated_entries = report.undated.len(),
            chars = rendered.len(),
            "stm consolidated"
        );
        Ok(rendered)
    }

    /// `entry` itself when it is within the length cap, otherwise the
    /// condenser's shortened rewrite.  Clipping only applies if the rewrite
    /// still overruns.
    async fn fit(&self, label: &str, entry: String) -> Result<String, IndexError> {
        let max_chars = self.policy.max_entry_chars;
        if entry.chars().count() <= max_chars {
            return Ok(entry);
        }
        let shortened = self.condenser.shorten(label, &entry, max_chars).await?;
        Ok(clip(&shortened, max_chars))
    }

    /// Condense, then enforce the cap on whatever came back.
    async fn condense(
        &self,
        label: &str,
        entries: &[String],
        cap: usize,
    ) -> Result<Vec<String>, IndexError> {
        let mut out = dedupe(self.condenser.condense(label, entries, cap).await?);
        out.truncate(cap.max(1));
        Ok(out)
    }

    fn roll_up(&self, report: &mut StmReport, today: NaiveDate) {
        let mut merged: Vec<DatedBucket> = Vec::new();
        let mut index: HashMap<Period, usize> = HashMap::new();
        report.sort_buckets();
        for bucket in std::mem::take(&mut report.dated) {
            let age = (today - bucket.period.end()).num_days();
            let target = bucket.period.coarsen_to(self.policy.target_granularity(age));
            match index.get(&target) {
                Some(&i) => merged[i].entries.extend(bucket.entries),
                None => {
                    index.insert(target, merged.len());
                    merged.push(DatedBucket { period: target, entries: bucket.entries });
                }
            }
        }
        for bucket in &mut merged {
            bucket.entries = dedupe(std::mem::take(&mut bucket.entries));
        }
        report.dated = merged;
        report.sort_buckets();
    }

    fn promote(&self, report: &mut StmReport) {
        let threshold = self.policy.promotion_threshold;
        if threshold < 2 {
            return;
        }
        let mut occurrences: HashMap<String, (usize, String)> = HashMap::new();
        for bucket in &report.dated {
            let unique: HashSet<String> = bucket.entries.iter().map(|e| normalize(e)).collect();
            for key in unique {
                let original = bucket
                    .entries
                    .iter()
                    .find(|e| normalize(e) == key)
                    .cloned()
                    .unwrap_or_default();
                occurrences.entry(key).or_insert((0, original)).0 += 1;
            }
        }
        // Buckets are newest first, so the stored original is the most
        // recent wording of the pattern.
        let mut promoted: Vec<(String, String)> = occurrences
            .into_iter()
            .filter(|(_, (count, _))| *count >= threshold)
            .map(|(key, (_, original))| (key, original))
            .collect();
        if promoted.is_empty() {
            return;
        }
        promoted.sort();
        let keys: HashSet<&String> = promoted.iter().map(|(k, _)| k).collect();
        for bucket in &mut report.dated {
            bucket.entries.retain(|e| !keys.contains(&normalize(e)));
        }
        report.undated.retain(|e| !keys.contains(&normalize(e)));
        let mut undated: Vec<String> = promoted.iter().map(|(_, original)| original.clone()).collect();
        undated.append(&mut report.undated);
        report.undated = undated;
        report.sort_buckets();
        debug!(count = promoted.len(), "promoted recurring entries to undated");
    }

    async fn enforce_budget(&self, report: &mut StmReport) -> Result<(), IndexError> {
        let budget = self.policy.max_dated_entries.max(1);
        while report.dated_entry_count() > budget {
            // Oldest bucket that can still shrink.
            if let Some(idx) = report.dated.iter().rposition(|b| b.entries.len() > 1) {
                let bucket = &report.dated[idx];
                let excess = report.dated_entry_count() - budget;
                let target = bucket.entries.len().saturating_sub(excess).max(bucket.entries.len() / 2).max(1);
                let label = bucket.period.label();
                let entries = bucket.entries.clone();
                report.dated[idx].entries = self.condense(&label, &entries, target).await?;
                continue;
            }
            // Every bucket holds one entry: fold the two oldest together.
            if report.dated.len() < 2 {
                break;
            }
            let older = report.dated.remove(report.dated.len() - 1);
            let newer = report.dated.remove(report.dated.len() - 1);
            let from = older.period.start().year();
            let to = newer.period.end().year().max(from);
            let mut entries = newer.entries;
            entries.extend(older.entries);
            let period = Period::Years { from, to };
            let entries = self.condense(&period.label(), &entries, 1).await?;
            report.dated.push(DatedBucket { period, entries });
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ShortTermMemory accessor
// ─────────────────────────────────────────────────────────────────────────────

/// Read/write access to the stored STM report, `("stm",)` keyed by namespace
/// as `{"report": <text>}`.
#[derive(Clone)]
pub struct ShortTermMemory {
    store: Arc<dyn KeyedStore>,
}

impl ShortTermMemory {
    pub fn new(store: Arc<dyn KeyedStore>) -> Self {
        Self { store }
    }

    /// Stored report, or `None` if the namespace has none.
    pub fn get(&self, namespace: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .store
            .get(&[STM], namespace)?
            .and_then(|item| item.value.get("report").and_then(|r| r.as_str()).map(str::to_string)))
    }

    /// Stored report, or the empty string.
    pub fn get_or_empty(&self, namespace: &str) -> Result<String, StoreError> {
        Ok(self.get(namespace)?.unwrap_or_default())
    }

    pub fn set(&self, namespace: &str, report: &str) -> Result<(), StoreError> {
        self.store.put(&[STM], namespace, &json!({ "report": report }))
    }

    pub fn write(namespace: &str, report: &str) -> StoreWrite {
        StoreWrite::new(&[STM], namespace, json!({ "report": report }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    // ── Period ───────────────────────────────────────────────────────────────

    #[test]
    fn period_labels_parse_back() {
        let periods = [
            Period::Day(date("2025-03-29")),
            Period::Week(date("2025-03-17")),
            Period::Month { year: 2025, month: 2 },
            Period::Quarter { year: 2024, quarter: 4 },
            Period::Year(2023),
            Period::Years { from: 2019, to: 2021 },
        ];
        for p in periods {
            assert_eq!(Period::parse_label(&p.label()), Some(p), "label {}", p.label());
        }
    }

    #[test]
    fn parse_label_accepts_summarized_suffix_and_normalises_week() {
        assert_eq!(
            Period::parse_label("February 2025 (summarized)"),
            Some(Period::Month { year: 2025, month: 2 })
        );
        // 2025-03-19 is a Wednesday; the week is identified by its Monday.
        assert_eq!(
            Period::parse_label("Week of 2025-03-19 to 2025-03-25"),
            Some(Period::Week(date("2025-03-17")))
        );
        assert_eq!(Period::parse_label("Observations"), None);
        assert_eq!(Period::parse_label("Q7 2025"), None);
    }

    #[test]
    fn period_bounds() {
        let q = Period::Quarter { year: 2024, quarter: 1 };
        assert_eq!(q.start(), date("2024-01-01"));
        assert_eq!(q.end(), date("2024-03-31"));
        let m = Period::Month { year: 2024, month: 12 };
        assert_eq!(m.end(), date("2024-12-31"));
        assert_eq!(Period::Week(date("2025-03-17")).end(), date("2025-03-23"));
    }

    #[test]
    fn coarsen_never_refines() {
        let month = Period::Month { year: 2025, month: 5 };
        assert_eq!(month.coarsen_to(Granularity::Day), month);
        assert_eq!(month.coarsen_to(Granularity::Quarter), Period::Quarter { year: 2025, quarter: 2 });
        assert_eq!(Period::Day(date("2025-05-14")).coarsen_to(Granularity::Week), Period::Week(date("2025-05-12")));
    }

    #[test]
    fn target_granularity_by_age() {
        let p = RollupPolicy::default();
        assert_eq!(p.target_granularity(-3), Granularity::Day);
        assert_eq!(p.target_granularity(0), Granularity::Day);
        assert_eq!(p.target_granularity(7), Granularity::Week);
        assert_eq!(p.target_granularity(40), Granularity::Month);
        assert_eq!(p.target_granularity(100), Granularity::Quarter);
        assert_eq!(p.target_granularity(400), Granularity::Year);
    }

    // ── StmReport ────────────────────────────────────────────────────────────

    #[test]
    fn parse_and_render_canonical_report() {
        let text = "# Short-Term Report\n\n## Section 1: Dated Data\n\n### 2025-03-29\n- Spike in logins.\n\n### February 2025 (summarized)\n- 3 outages resolved.\n\n## Section 2: Undated (General Knowledge)\n- Peak at noon.\n";
        let report = StmReport::parse(text);
        assert_eq!(report.dated.len(), 2);
        assert_eq!(report.dated[0].period, Period::Day(date("2025-03-29")));
        assert_eq!(report.undated, vec!["Peak at noon.".to_string()]);
        assert_eq!(report.render(), text);
    }

    #[test]
    fn parse_free_text_keeps_lines_as_undated() {
        let report = StmReport::parse("just a note\nanother one");
        assert!(report.dated.is_empty());
        assert_eq!(report.undated.len(), 2);
    }

    #[test]
    fn empty_report_renders_empty() {
        assert_eq!(StmReport::parse("").render(), "");
    }

    // ── Consolidation ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn update_places_new_information_under_today() {
        let stm = StmConsolidator::deterministic();
        let out = stm
            .update_on("n1", "", "# Report\n- CPU spike at 14:00\n- Memory stable", date("2025-05-01"))
            .await
            .unwrap();
        let report = StmReport::parse(&out);
        assert_eq!(report.dated.len(), 1);
        assert_eq!(report.dated[0].period, Period::Day(date("2025-05-01")));
        assert!(report.dated[0].entries.contains(&"CPU spike at 14:00".to_string()));
    }

    #[tokio::test]
    async fn empty_information_does_not_grow_report() {
        let stm = StmConsolidator::deterministic();
        let today = date("2025-05-10");
        let r0 = stm.update_on("n1", "", "- a fact\n- another fact", today).await.unwrap();
        let r1 = stm.update_on("n1", &r0, "", today).await.unwrap();
        let r2 = stm.update_on("n1", &r1, "", today).await.unwrap();
        assert!(r1.len() <= r0.len());
        assert_eq!(r1, r2);
        assert_eq!(stm.update_on("n1", "", "", today).await.unwrap(), "");
    }

    #[tokio::test]
    async fn old_days_roll_up_into_weeks_and_months() {
        let stm = StmConsolidator::deterministic();
        let mut report = String::new();
        let start = date("2025-01-01");
        for i in 0..60 {
            let day = start + Duration::days(i);
            report = stm
                .update_on("n1", &report, &format!("- reading {i} recorded"), day)
                .await
                .unwrap();
        }
        let parsed = StmReport::parse(&report);
        let grans: HashSet<Granularity> = parsed.dated.iter().map(|b| b.period.granularity()).collect();
        assert!(grans.contains(&Granularity::Day));
        assert!(grans.contains(&Granularity::Week));
        assert!(grans.contains(&Granularity::Month));
        let days = parsed.dated.iter().filter(|b| b.period.granularity() == Granularity::Day).count();
        assert!(days <= 7, "only the last week stays at day resolution, got {days}");
    }

    #[tokio::test]
    async fn recurring_entries_are_promoted_to_undated() {
        let stm = StmConsolidator::deterministic();
        let mut report = String::new();
        for (i, d) in ["2025-05-01", "2025-05-02", "2025-05-03"].iter().enumerate() {
            report = stm
                .update_on("n1", &report, &format!("- Backups complete at 02:00\n- day {i} note"), date(d))
                .await
                .unwrap();
        }
        let parsed = StmReport::parse(&report);
        assert!(parsed.undated.iter().any(|e| e == "Backups complete at 02:00"));
        assert!(
            parsed
                .dated
                .iter()
                .all(|b| b.entries.iter().all(|e| e != "Backups complete at 02:00"))
        );
    }

    #[tokio::test]
    async fn report_stays_bounded_over_200_daily_updates() {
        let stm = StmConsolidator::deterministic();
        let ceiling = stm.policy().size_ceiling();
        let mut report = String::new();
        let start = date("2024-01-01");
        for i in 0..200 {
            let day = start + Duration::days(i);
            let info = format!(
                "# Daily report\n- Throughput {} req/s\n- Error rate {}%\n- Host h{} restarted\n- Queue depth {}\n- Latency p99 {} ms",
                1000 + i,
                i % 7,
                i,
                i * 3,
                200 + i % 50
            );
            report = stm.update_on("n1", &report, &info, day).await.unwrap();
            assert!(report.len() <= ceiling, "day {i}: {} > {ceiling}", report.len());
        }
        let parsed = StmReport::parse(&report);
        assert!(parsed.dated_entry_count() <= stm.policy().max_dated_entries);
        assert!(parsed.undated.len() <= stm.policy().max_undated_entries);
        assert!(parsed.dated.iter().any(|b| b.period.granularity() >= Granularity::Quarter));
    }

    #[tokio::test]
    async fn budget_folds_oldest_buckets_when_every_bucket_is_minimal() {
        let policy = RollupPolicy { max_dated_entries: 3, promotion_threshold: 0, ..RollupPolicy::default() };
        let stm = StmConsolidator::new(policy, Arc::new(SalienceCondenser));
        let text = "## Section 1: Dated Data\n### 2019\n- a\n### 2020\n- b\n### 2021\n- c\n### 2022\n- d\n";
        let out = stm.update_on("n1", text, "", date("2025-05-01")).await.unwrap();
        let parsed = StmReport::parse(&out);
        assert!(parsed.dated_entry_count() <= 3);
        assert!(parsed.dated.iter().any(|b| matches!(b.period, Period::Years { .. })));
    }

    #[test]
    fn salience_condenser_keeps_anomalies() {
        let entries: Vec<String> = vec![
            "routine check".into(),
            "Unusual spike of 500 errors".into(),
            "routine check".into(),
            "all good".into(),
            "Outage in region eu-1".into(),
        ];
        let kept = SalienceCondenser::condense_now(&entries, 2);
        assert_eq!(kept, vec!["Unusual spike of 500 errors".to_string(), "Outage in region eu-1".to_string()]);
    }

    fn padded_with_routine_lines(fact: &str) -> String {
        let filler: Vec<String> = [
            "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india",
            "juliet", "kilo", "lima", "mike", "november", "oscar", "papa", "quebec", "romeo",
        ]
        .iter()
        .map(|w| format!("Routine {w} sync completed normally."))
        .collect();
        format!("- {} {fact}", filler.join(" "))
    }

    #[tokio::test]
    async fn long_entry_is_condensed_not_truncated() {
        let stm = StmConsolidator::deterministic();
        let input = padded_with_routine_lines("CRITICAL: disk failure on node 7.");
        assert!(input.chars().count() > 600);

        let out = stm.update_on("n1", "", &input, date("2025-05-01")).await.unwrap();
        let report = StmReport::parse(&out);
        let entries = &report.dated[0].entries;
        assert_eq!(entries.len(), 1);
        assert!(entries[0].contains("CRITICAL: disk failure on node 7."), "{}", entries[0]);
        assert!(entries[0].chars().count() <= stm.policy().max_entry_chars);
        assert!(!entries[0].ends_with("..."));
    }

    #[test]
    fn shorten_keeps_salient_tail_of_unpunctuated_text() {
        let text = format!("{}CRITICAL: disk failure on node 7.", "status nominal ".repeat(45));
        let short = SalienceCondenser::shorten_now(&text, 400);
        assert!(short.chars().count() <= 400);
        assert!(short.contains("disk failure on node 7"), "{short}");
        assert_eq!(SalienceCondenser::shorten_now("short", 400), "short");
    }

    /// Memory model that answers rewrite requests with a fixed summary.
    struct Rewriter;

    #[async_trait]
    impl Generator for Rewriter {
        async fn generate(&self, system: &str, history: &[ChatMessage]) -> Result<String, IndexError> {
            if system.contains("Rewrite the observation") {
                return Ok("- Disk failure on node 7 after 18 routine syncs.".into());
            }
            Ok(history.last().map(|m| m.content.clone()).unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn generative_condenser_rewrites_long_entries() {
        let condenser = GenerativeCondenser::new(Arc::new(Rewriter));
        let stm = StmConsolidator::new(RollupPolicy::default(), Arc::new(condenser));
        let input = padded_with_routine_lines("CRITICAL: disk failure on node 7.");

        let out = stm.update_on("n1", "", &input, date("2025-05-01")).await.unwrap();
        let report = StmReport::parse(&out);
        assert_eq!(report.dated[0].entries, vec!["Disk failure on node 7 after 18 routine syncs.".to_string()]);
    }

    #[test]
    fn clip_limits_entry_length() {
        let long = "x".repeat(50);
        assert_eq!(clip(&long, 10).chars().count(), 10);
        assert_eq!(clip("short", 10), "short");
    }

    // ── ShortTermMemory ──────────────────────────────────────────────────────

    #[test]
    fn short_term_memory_get_set() {
        let stm = ShortTermMemory::new(Arc::new(SqliteStore::open_in_memory().unwrap()));
        assert!(stm.get("n1").unwrap().is_none());
        assert_eq!(stm.get_or_empty("n1").unwrap(), "");
        stm.set("n1", "report").unwrap();
        assert_eq!(stm.get("n1").unwrap().as_deref(), Some("report"));
    }
}
