use std::{fmt, path::PathBuf, sync::{Arc, atomic::{AtomicBool, AtomicU64, Ordering}}, time::Duration};

use tracing::{debug, error, info, warn};

use crate::{
    checkpoint::{Checkpoint, CheckpointStore},
    config::DelayRange,
    duplicates::{DuplicateFilter, DuplicateListing, DuplicatePolicy},
    fetcher::PageFetcher,
    output::OutputStore,
    page_scrapers::{FieldExtractor, Page},
    record::JobRecord
};


/// Flags and counters shared between a running loop and whoever is watching it.
///
/// Pause and stop only take effect between units of work.
#[derive(Debug, Default)]
pub(crate) struct RunControl {
    paused: AtomicBool,
    stopped: AtomicBool,
    current: AtomicU64,
    total: AtomicU64,
    records: AtomicU64
}


/// A point-in-time copy of [`RunControl`]'s counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Progress {
    pub(crate) current: u64,
    /// Zero while the number of units is unknown.
    pub(crate) total: u64,
    pub(crate) records: u64,
    pub(crate) paused: bool,
    pub(crate) stopped: bool
}


impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.stopped {
            "stopping"
        } else if self.paused {
            "paused"
        } else {
            "running"
        };
        if self.total == 0 {
            write!(f, "{state}: unit {}, {} records", self.current, self.records)
        } else {
            write!(f, "{state}: unit {}/{}, {} records", self.current, self.total, self.records)
        }
    }
}


impl RunControl {
    pub(crate) fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub(crate) fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Clears the counters before a scheduled run starts. A requested stop stays requested.
    pub(crate) fn begin(&self) {
        self.current.store(0, Ordering::Relaxed);
        self.total.store(0, Ordering::Relaxed);
        self.records.store(0, Ordering::Relaxed);
    }

    fn set_current(&self, current: u64) {
        self.current.store(current, Ordering::Relaxed);
    }

    fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    fn set_records(&self, records: u64) {
        self.records.store(records, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> Progress {
        Progress {
            current: self.current.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
            records: self.records.load(Ordering::Relaxed),
            paused: self.is_paused(),
            stopped: self.is_stopped()
        }
    }
}


/// The sequence of units a run walks through.
pub(crate) enum WorkUnits {
    /// Posting links. The cursor is a zero based row index.
    Links(Vec<String>),
    /// Numbered listing pages. The cursor is a one based page number.
    Pages {
        url_for: Box<dyn Fn(u64) -> String + Send + Sync>,
        /// Never go past this page, whatever the site reports.
        max_pages: Option<u64>,
        /// Stop once the run has written this many records.
        max_records: Option<u64>
    }
}


impl WorkUnits {
    fn first_cursor(&self) -> u64 {
        match self {
            WorkUnits::Links(_) => 0,
            WorkUnits::Pages { .. } => 1
        }
    }
}


/// How candidates are checked against postings that are already known.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deduplication {
    pub(crate) filter: DuplicateFilter,
    pub(crate) policy: DuplicatePolicy,
    /// End the run after this many duplicates in a row.
    pub(crate) stop_after: u32
}


#[derive(Debug, Clone)]
pub(crate) struct LoopSettings {
    pub(crate) max_attempts: u32,
    pub(crate) retry_backoff: DelayRange,
    pub(crate) between_units: DelayRange,
    pub(crate) pause_poll: Duration,
    pub(crate) backup_every: u64,
    pub(crate) backup_dir: PathBuf,
    /// Failed listing pages in a row that end a walk whose last page is unknown.
    pub(crate) give_up_after: u64,
    /// What to do with an input link that is already in the output.
    pub(crate) known_links: DuplicatePolicy
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Every unit was processed.
    Completed,
    /// A listing page came back without postings.
    Exhausted,
    /// Enough known postings in a row were seen to assume nothing newer is left.
    CaughtUp,
    /// The configured number of records was reached.
    RecordLimit,
    /// Listing pages kept failing to load before the last page was known.
    Unreachable,
    /// A stop was requested.
    Stopped
}


impl Outcome {
    /// Whether the run is over for good, so its checkpoint is no longer needed.
    pub(crate) fn is_clean(self) -> bool {
        !matches!(self, Outcome::Stopped | Outcome::Unreachable)
    }
}


#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RunSummary {
    pub(crate) outcome: Outcome,
    /// Units processed by this invocation.
    pub(crate) units: u64,
    /// Records added across every attempt of this run, resumed ones included.
    pub(crate) records_added: u64,
    pub(crate) duplicates: u64,
    pub(crate) placeholders: u64,
    pub(crate) cursor: u64
}


/// Drives fetch, extract, deduplicate, append, checkpoint and delay over a sequence of
/// units, one unit at a time.
pub(crate) struct ScrapeLoop {
    fetcher: Arc<dyn PageFetcher>,
    extractor: Arc<dyn FieldExtractor>,
    settings: LoopSettings,
    control: Arc<RunControl>
}


enum Step {
    Continue,
    Finish(Outcome)
}


impl ScrapeLoop {
    pub(crate) fn new(
        fetcher: Arc<dyn PageFetcher>,
        extractor: Arc<dyn FieldExtractor>,
        settings: LoopSettings,
        control: Arc<RunControl>
    ) -> Self {
        Self { fetcher, extractor, settings, control }
    }

    /// Runs from `checkpoint.cursor` until the units run out or a termination condition
    /// is met.
    ///
    /// Errors only for fatal problems: the browser cannot start, or a duplicate (or an
    /// input link already in the output) was met under [`DuplicatePolicy::Strict`]. The checkpoint is left alone in that case so
    /// the next run picks up where this one failed.
    pub(crate) async fn run(
        &self,
        units: WorkUnits,
        mut checkpoint: Checkpoint,
        output: &mut OutputStore,
        checkpoints: &CheckpointStore,
        dedup: Option<Deduplication>
    ) -> anyhow::Result<RunSummary> {
        let mut summary = RunSummary {
            outcome: Outcome::Completed,
            units: 0,
            records_added: checkpoint.records_added,
            duplicates: 0,
            placeholders: 0,
            cursor: checkpoint.cursor.max(units.first_cursor())
        };
        // Links written earlier, by this run or before it.
        let mut seen = output.known_links();
        let mut reported_pages: Option<u64> = None;
        let mut failed_in_a_row = 0u64;

        if let WorkUnits::Links(links) = &units {
            self.control.set_total(links.len() as u64);
        }
        self.control.set_records(summary.records_added);
        info!(cursor = summary.cursor, known = seen.len(), "Scrape loop starting");

        loop {
            if self.stopped_after_pause().await {
                summary.outcome = Outcome::Stopped;
                break;
            }

            let cursor = summary.cursor;
            let (url, number) = match &units {
                WorkUnits::Links(links) => match links.get(cursor as usize) {
                    Some(link) if seen.contains(link) => {
                        if self.settings.known_links == DuplicatePolicy::Strict {
                            return Err(DuplicateListing { link: link.clone() }.into());
                        }
                        debug!(%link, "Already in the output, skipping");
                        summary.duplicates += 1;
                        summary.cursor += 1;
                        continue;
                    }
                    Some(link) => (link.clone(), None),
                    None => break
                },
                WorkUnits::Pages { url_for, max_pages, .. } => {
                    let past_limit = max_pages.is_some_and(|max| cursor > max);
                    let past_reported = reported_pages.is_some_and(|last| cursor > last);
                    if past_limit || past_reported {
                        break;
                    }
                    (url_for(cursor), Some(cursor))
                }
            };
            self.control.set_current(cursor);
            info!(cursor, %url, "Scraping");

            let fetched = self.fetch_with_retry(&url).await?;
            let fetch_failed = fetched.is_none();
            failed_in_a_row = if fetch_failed { failed_in_a_row + 1 } else { 0 };
            let mut records = match fetched {
                Some(html) => {
                    let (records, page_count) = self.extract(html, &url, number).await;
                    if let Some(count) = page_count {
                        if reported_pages.map_or(true, |known| count > known) {
                            debug!(count, "Listing reports a page count");
                            reported_pages = Some(count);
                            if let WorkUnits::Pages { max_pages, .. } = &units {
                                self.control.set_total(max_pages.map_or(count, |max| max.min(count)));
                            }
                        }
                    }
                    records
                }
                None => Vec::new()
            };

            let is_listing = matches!(units, WorkUnits::Pages { .. });
            let mut step = Step::Continue;
            if records.is_empty() {
                if is_listing && !fetch_failed {
                    info!(page = cursor, "Listing page has no postings, the listing is exhausted");
                    summary.outcome = Outcome::Exhausted;
                    break;
                }
                warn!(%url, "Nothing extracted, writing a placeholder");
                records.push(JobRecord::placeholder(url.as_str(), number));
                summary.placeholders += 1;

                let unbounded = matches!(units, WorkUnits::Pages { max_pages: None, .. }) && reported_pages.is_none();
                if unbounded && failed_in_a_row >= self.settings.give_up_after {
                    warn!(failed = failed_in_a_row, "Listing pages keep failing and the last page is unknown, giving up");
                    step = Step::Finish(Outcome::Unreachable);
                }
            }

            let mut fresh = Vec::with_capacity(records.len());
            for record in records {
                if record.is_placeholder() {
                    fresh.push(record);
                    continue;
                }
                if let Some(dedup) = dedup {
                    let known = dedup.filter.is_duplicate(&record, output.existing());
                    if known || seen.contains(&record.link) {
                        if dedup.policy == DuplicatePolicy::Strict {
                            return Err(DuplicateListing { link: record.link }.into());
                        }
                        summary.duplicates += 1;
                        if known {
                            checkpoint.consecutive_duplicates += 1;
                            debug!(link = %record.link, run = checkpoint.consecutive_duplicates, "Known posting");
                            if checkpoint.consecutive_duplicates >= dedup.stop_after {
                                info!(run = checkpoint.consecutive_duplicates, "Reached postings seen before");
                                step = Step::Finish(Outcome::CaughtUp);
                                break;
                            }
                        }
                        continue;
                    }
                    checkpoint.consecutive_duplicates = 0;
                }
                seen.insert(record.link.clone());
                fresh.push(record);
            }

            if let WorkUnits::Pages { max_records: Some(max), .. } = &units {
                let room = max.saturating_sub(summary.records_added) as usize;
                if fresh.len() >= room {
                    fresh.truncate(room);
                    if matches!(step, Step::Continue) {
                        step = Step::Finish(Outcome::RecordLimit);
                    }
                }
            }

            let added = fresh.len() as u64;
            let appends_before = output.appends();
            let saved = match output.append(fresh) {
                Ok(()) => true,
                Err(e) => {
                    error!(error = %format!("{e:#}"), "Failed to write the output file, keeping records in memory");
                    false
                }
            };
            summary.records_added += added;
            summary.units += 1;
            // An unreachable listing resumes from the first page of the failed run.
            summary.cursor = match step {
                Step::Finish(Outcome::Unreachable) => cursor + 1 - failed_in_a_row,
                _ => cursor + 1
            };
            self.control.set_records(summary.records_added);

            if saved {
                self.snapshot_if_due(output, appends_before);
                checkpoint.cursor = summary.cursor;
                checkpoint.records_added = summary.records_added;
                if let Err(e) = checkpoints.save(&mut checkpoint) {
                    warn!(error = %format!("{e:#}"), "Failed to save checkpoint");
                }
            }

            if let Step::Finish(outcome) = step {
                summary.outcome = outcome;
                break;
            }
            tokio::time::sleep(self.settings.between_units.sample()).await;
        }

        info!(
            outcome = ?summary.outcome,
            units = summary.units,
            records = summary.records_added,
            duplicates = summary.duplicates,
            placeholders = summary.placeholders,
            "Scrape loop finished"
        );
        Ok(summary)
    }

    /// Waits out a pause. Returns whether a stop was requested.
    async fn stopped_after_pause(&self) -> bool {
        if self.control.is_paused() && !self.control.is_stopped() {
            info!("Paused");
            while self.control.is_paused() && !self.control.is_stopped() {
                tokio::time::sleep(self.settings.pause_poll).await;
            }
            info!("Resumed");
        }
        self.control.is_stopped()
    }

    /// Fetches `url` on the rayon pool, retrying transient failures. `None` means every
    /// attempt failed.
    async fn fetch_with_retry(&self, url: &str) -> anyhow::Result<Option<String>> {
        let ready = self.extractor.ready_selector();

        for attempt in 1..=self.settings.max_attempts {
            let fetcher = self.fetcher.clone();
            let target = url.to_string();
            match tokio_rayon::spawn(move || fetcher.fetch(&target, ready)).await {
                Ok(html) => return Ok(Some(html)),
                Err(e) if e.is_transient() => {
                    warn!(attempt, max = self.settings.max_attempts, error = %e, "Fetch failed");
                    if attempt < self.settings.max_attempts {
                        tokio::time::sleep(self.settings.retry_backoff.sample()).await;
                    }
                }
                Err(e) => return Err(e.into())
            }
        }
        Ok(None)
    }

    async fn extract(&self, html: String, url: &str, number: Option<u64>) -> (Vec<JobRecord>, Option<u64>) {
        let extractor = self.extractor.clone();
        let target = url.to_string();
        let extracted = tokio_rayon::spawn(move || -> anyhow::Result<_> {
            let page = Page::new(html, &target, number)?;
            Ok((extractor.extract(&page), extractor.page_count(&page)))
        })
        .await;

        match extracted {
            Ok((records, count)) => {
                debug!(extractor = self.extractor.name(), records = records.len(), "Extracted");
                (records, count)
            }
            Err(e) => {
                warn!(%url, error = %format!("{e:#}"), "Could not parse page");
                (Vec::new(), None)
            }
        }
    }

    fn snapshot_if_due(&self, output: &OutputStore, appends_before: u64) {
        let appends = output.appends();
        if appends == appends_before || appends % self.settings.backup_every != 0 {
            return;
        }
        if let Err(e) = output.snapshot(&self.settings.backup_dir) {
            warn!(error = %format!("{e:#}"), "Failed to write backup");
        }
    }
}
