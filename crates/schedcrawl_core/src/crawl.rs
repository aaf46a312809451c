//! Sequential traversal forms → institutes → groups → lessons.
//!
//! Each level is fetched, normalized and written before the crawler descends,
//! so a reader of the store never sees a group before its institute.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use serde::Serialize;

use crate::error::{IngestError, Result};
use crate::model::{Institute, MAX_WEEK_OFFSET, StudyForm};
use crate::normalize::{normalize_group, normalize_institute, normalize_lessons};
use crate::remote::{RawInstitute, ScheduleApi};
use crate::store::Store;

pub const DEFAULT_WEEK_OFFSETS: [u8; 2] = [1, 2];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlScope {
    pub forms: Vec<StudyForm>,
    /// Institute id (case-insensitive) or a fragment of its name.
    pub institute_filter: Option<String>,
    pub week_offsets: Vec<u8>,
    /// Replace each (group, week) and prune vanished groups instead of upserting additively.
    pub reconcile: bool,
}

impl Default for CrawlScope {
    fn default() -> Self {
        Self {
            forms: StudyForm::ALL.to_vec(),
            institute_filter: None,
            week_offsets: DEFAULT_WEEK_OFFSETS.to_vec(),
            reconcile: false,
        }
    }
}

impl CrawlScope {
    /// Check the scope and return it with duplicates removed.
    pub fn validated(&self) -> Result<CrawlScope> {
        if self.forms.is_empty() {
            return Err(IngestError::config("no study forms selected"));
        }
        if self.week_offsets.is_empty() {
            return Err(IngestError::config("no week offsets selected"));
        }
        if let Some(offset) = self
            .week_offsets
            .iter()
            .find(|offset| **offset > MAX_WEEK_OFFSET)
        {
            return Err(IngestError::config(format!(
                "week offset {offset} is out of range 0..={MAX_WEEK_OFFSET}"
            )));
        }
        let institute_filter = match self.institute_filter.as_deref().map(str::trim) {
            Some("") => return Err(IngestError::config("institute filter is blank")),
            Some(filter) => Some(filter.to_string()),
            None => None,
        };
        Ok(CrawlScope {
            forms: dedup(&self.forms),
            institute_filter,
            week_offsets: dedup(&self.week_offsets),
            reconcile: self.reconcile,
        })
    }

    fn matches_institute(&self, raw: &RawInstitute) -> bool {
        let Some(filter) = self.institute_filter.as_deref() else {
            return true;
        };
        let filter = filter.to_lowercase();
        let id_matches = raw
            .id
            .as_deref()
            .is_some_and(|id| id.trim().to_lowercase() == filter);
        let name_matches = raw
            .name
            .as_deref()
            .is_some_and(|name| name.to_lowercase().contains(&filter));
        id_matches || name_matches
    }
}

/// Parse numeric form codes from the command line or config.
pub fn forms_from_codes(codes: &[i64]) -> Result<Vec<StudyForm>> {
    codes.iter().map(|code| StudyForm::from_code(*code)).collect()
}

fn dedup<T: Copy + PartialEq>(values: &[T]) -> Vec<T> {
    let mut output = Vec::with_capacity(values.len());
    for value in values {
        if !output.contains(value) {
            output.push(*value);
        }
    }
    output
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub enum CrawlState {
    #[default]
    Idle,
    EnumeratingForms,
    EnumeratingInstitutes(StudyForm),
    EnumeratingGroups(String),
    FetchingLessons(String),
    Done,
    AbortedWithErrors,
}

impl fmt::Display for CrawlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::EnumeratingForms => write!(f, "enumerating_forms"),
            Self::EnumeratingInstitutes(form) => {
                write!(f, "enumerating_institutes({})", form.as_str())
            }
            Self::EnumeratingGroups(institute) => write!(f, "enumerating_groups({institute})"),
            Self::FetchingLessons(group) => write!(f, "fetching_lessons({group})"),
            Self::Done => write!(f, "done"),
            Self::AbortedWithErrors => write!(f, "aborted_with_errors"),
        }
    }
}

/// Cooperative cancellation flag, checked between institutes.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrawlFailure {
    pub form: StudyForm,
    pub institute_id: Option<String>,
    pub institute_name: Option<String>,
    pub group_id: Option<String>,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CrawlReport {
    pub final_state: CrawlState,
    pub cancelled: bool,
    pub forms: usize,
    /// Distinct institutes stored, however many forms listed them.
    pub institutes: usize,
    pub groups: usize,
    pub lessons: usize,
    pub lessons_inserted: usize,
    pub lessons_updated: usize,
    pub lessons_unchanged: usize,
    pub lessons_removed: usize,
    pub groups_pruned: usize,
    pub request_count: usize,
    pub failures: Vec<CrawlFailure>,
    pub abort_reason: Option<String>,
}

impl CrawlReport {
    /// Distinct ids of institutes with at least one recorded failure.
    pub fn failed_institutes(&self) -> Vec<String> {
        self.failures
            .iter()
            .filter_map(|failure| failure.institute_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn success(&self) -> bool {
        self.final_state == CrawlState::Done && self.failures.is_empty() && !self.cancelled
    }
}

/// Crawl `scope` through `api` into `store`.
///
/// Only an invalid scope is returned as `Err`, before any request is made.
/// Everything that goes wrong afterwards ends up in the report.
pub fn run_crawl<A: ScheduleApi>(
    api: &mut A,
    store: &mut Store,
    scope: &CrawlScope,
    cancel: &CancelToken,
) -> Result<CrawlReport> {
    let scope = scope.validated()?;
    let mut crawler = Crawler {
        api,
        store,
        scope,
        cancel,
        state: CrawlState::Idle,
        report: CrawlReport::default(),
        seen_institutes: BTreeSet::new(),
    };
    crawler.run();
    crawler.report.final_state = crawler.state.clone();
    crawler.report.request_count = crawler.api.request_count();
    Ok(crawler.report)
}

struct Crawler<'a, A: ScheduleApi> {
    api: &'a mut A,
    store: &'a mut Store,
    scope: CrawlScope,
    cancel: &'a CancelToken,
    state: CrawlState,
    report: CrawlReport,
    seen_institutes: BTreeSet<String>,
}

impl<A: ScheduleApi> Crawler<'_, A> {
    fn transition(&mut self, next: CrawlState) {
        debug!("crawl state {} -> {}", self.state, next);
        self.state = next;
    }

    fn abort(&mut self, reason: String) {
        warn!("crawl aborted: {reason}");
        self.report.abort_reason = Some(reason);
        self.transition(CrawlState::AbortedWithErrors);
    }

    fn run(&mut self) {
        self.transition(CrawlState::EnumeratingForms);
        let available = match self.api.list_forms() {
            Ok(forms) => forms,
            Err(error) => {
                self.abort(format!("listing study forms failed: {error}"));
                return;
            }
        };
        let forms = self
            .scope
            .forms
            .iter()
            .copied()
            .filter(|form| {
                let listed = available.contains(form);
                if !listed {
                    warn!("study form {} is not offered remotely; skipping", form.as_str());
                }
                listed
            })
            .collect::<Vec<_>>();

        for form in forms {
            if self.cancel.is_cancelled() {
                self.report.cancelled = true;
                break;
            }
            if !self.crawl_form(form) {
                return;
            }
        }
        if self.report.cancelled {
            info!("crawl cancelled");
        }
        self.transition(CrawlState::Done);
    }

    /// Returns false when the crawl was aborted.
    fn crawl_form(&mut self, form: StudyForm) -> bool {
        self.transition(CrawlState::EnumeratingInstitutes(form));
        let raws = match self.api.list_institutes(form) {
            Ok(raws) => raws,
            Err(error) => {
                self.abort(format!(
                    "listing institutes for {} failed: {error}",
                    form.as_str()
                ));
                return false;
            }
        };
        self.report.forms += 1;
        info!("{}: {} institutes listed", form.as_str(), raws.len());

        let selected = raws
            .into_iter()
            .filter(|raw| self.scope.matches_institute(raw))
            .collect::<Vec<_>>();
        for raw in &selected {
            if self.cancel.is_cancelled() {
                self.report.cancelled = true;
                break;
            }
            let institute = match normalize_institute(raw, form) {
                Ok(institute) => institute,
                Err(error) => {
                    self.record_raw(form, raw, None, &error);
                    continue;
                }
            };
            if let Err(error) = self.store.upsert_institute(&institute) {
                self.record(form, &institute, None, &error);
                continue;
            }
            if self.seen_institutes.insert(institute.id.clone()) {
                self.report.institutes += 1;
            }
            self.crawl_institute(form, &institute);
        }
        true
    }

    fn crawl_institute(&mut self, form: StudyForm, institute: &Institute) {
        info!("crawling institute {} ({})", institute.name, institute.id);
        self.transition(CrawlState::EnumeratingGroups(institute.id.clone()));
        let raws = match self.api.list_groups(&institute.id, form) {
            Ok(raws) => raws,
            Err(error) => {
                self.record(form, institute, None, &error);
                return;
            }
        };

        // Every listed id survives a prune, even when its record was rejected.
        let listed_ids = raws
            .iter()
            .filter_map(|raw| raw.id.as_deref().map(str::trim))
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();
        for raw in &raws {
            let group = match normalize_group(raw, &institute.id, form) {
                Ok(group) => group,
                Err(error) => {
                    self.record(form, institute, raw.id.as_deref(), &error);
                    continue;
                }
            };
            if let Err(error) = self.store.upsert_group(&group) {
                self.record(form, institute, Some(&group.id), &error);
                continue;
            }
            self.report.groups += 1;

            self.transition(CrawlState::FetchingLessons(group.id.clone()));
            for week_offset in self.scope.week_offsets.clone() {
                self.crawl_lessons(form, institute, &group.id, week_offset);
            }
            self.transition(CrawlState::EnumeratingGroups(institute.id.clone()));
        }

        if self.scope.reconcile {
            match self.store.prune_groups(&institute.id, form, &listed_ids) {
                Ok(0) => {}
                Ok(pruned) => {
                    info!("pruned {pruned} groups no longer listed in {}", institute.id);
                    self.report.groups_pruned += pruned;
                }
                Err(error) => self.record(form, institute, None, &error),
            }
        }
    }

    fn crawl_lessons(
        &mut self,
        form: StudyForm,
        institute: &Institute,
        group_id: &str,
        week_offset: u8,
    ) {
        let raws = match self.api.list_lessons(group_id, week_offset) {
            Ok(raws) => raws,
            Err(error) => {
                self.record(form, institute, Some(group_id), &error);
                return;
            }
        };
        let batch = normalize_lessons(&raws, group_id, week_offset);
        for error in &batch.rejected {
            self.record(form, institute, Some(group_id), error);
        }

        // A batch with rejected records is not a complete picture of the week.
        if self.scope.reconcile && batch.rejected.is_empty() {
            match self
                .store
                .replace_lessons(group_id, week_offset, &batch.slots)
            {
                Ok(counts) => {
                    self.report.lessons += counts.inserted;
                    self.report.lessons_inserted += counts.inserted;
                    self.report.lessons_removed += counts.removed;
                }
                Err(error) => self.record(form, institute, Some(group_id), &error),
            }
        } else {
            match self.store.upsert_lessons(&batch.slots) {
                Ok(counts) => {
                    self.report.lessons += counts.total();
                    self.report.lessons_inserted += counts.inserted;
                    self.report.lessons_updated += counts.updated;
                    self.report.lessons_unchanged += counts.unchanged;
                }
                Err(error) => self.record(form, institute, Some(group_id), &error),
            }
        }
        debug!(
            "group {group_id} week {week_offset}: {} slots, {} rejected",
            batch.slots.len(),
            batch.rejected.len()
        );
    }

    fn record(
        &mut self,
        form: StudyForm,
        institute: &Institute,
        group_id: Option<&str>,
        error: &IngestError,
    ) {
        self.push_failure(CrawlFailure {
            form,
            institute_id: Some(institute.id.clone()),
            institute_name: Some(institute.name.clone()),
            group_id: group_id.map(str::to_string),
            kind: error.kind().to_string(),
            message: error.to_string(),
        });
    }

    fn record_raw(
        &mut self,
        form: StudyForm,
        raw: &RawInstitute,
        group_id: Option<&str>,
        error: &IngestError,
    ) {
        self.push_failure(CrawlFailure {
            form,
            institute_id: raw.id.clone(),
            institute_name: raw.name.clone(),
            group_id: group_id.map(str::to_string),
            kind: error.kind().to_string(),
            message: error.to_string(),
        });
    }

    fn push_failure(&mut self, failure: CrawlFailure) {
        warn!(
            "[{}] institute {} group {}: {}",
            failure.kind,
            failure.institute_id.as_deref().unwrap_or("?"),
            failure.group_id.as_deref().unwrap_or("-"),
            failure.message
        );
        self.report.failures.push(failure);
    }
}
