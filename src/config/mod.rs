use std::{path::{Path, PathBuf}, time::Duration};

use anyhow::Context;
use rand::Rng;
use serde::Deserialize;
use validator::{Validate, ValidationError};

use crate::{duplicates::DuplicatePolicy, fetcher::BrowserSettings, page_scrapers::Site, schedule::Schedule};


/// Contents of `config.toml`.
#[derive(Debug, Deserialize, Validate)]
#[validate(schema(function = "valid_schedule"))]
pub(crate) struct Config {
    /// Which job board to scrape.
    pub(crate) site: Site,
    /// The CSV file results are written to.
    pub(crate) output: PathBuf,
    /// Where run progress is kept between runs.
    #[serde(default = "default_checkpoint")]
    pub(crate) checkpoint: PathBuf,
    /// Pick up from the checkpoint when it belongs to the same run.
    #[serde(default = "default_true")]
    pub(crate) resume: bool,
    /// Replaces the site's default listing address, e.g. to scrape a search result.
    #[validate(url)]
    pub(crate) base_url: Option<String>,
    pub(crate) mode: ModeConfig,
    #[serde(default)]
    #[validate]
    pub(crate) browser: BrowserSettings,
    #[serde(default)]
    #[validate]
    pub(crate) delays: Delays,
    #[serde(default)]
    #[validate]
    pub(crate) retry: RetrySettings,
    #[serde(default)]
    #[validate]
    pub(crate) duplicates: DuplicateSettings,
    #[serde(default)]
    #[validate]
    pub(crate) backup: BackupSettings,
    #[serde(default)]
    pub(crate) schedule: Schedule
}


/// What a run walks through.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub(crate) enum ModeConfig {
    /// Visit every posting link listed in a CSV file.
    UrlList {
        input: PathBuf,
        /// Header of the column holding the links. The last column when unset.
        #[serde(default)]
        link_column: Option<String>
    },
    /// Walk the listing pages from the first to the last.
    AllPages {
        #[serde(default)]
        max_pages: Option<u64>,
        /// Stop once this many records have been written by the run.
        #[serde(default)]
        max_records: Option<u64>
    },
    /// Walk the listing pages until postings already in `reference` keep showing up.
    NewOnly {
        reference: PathBuf,
        #[serde(default)]
        max_pages: Option<u64>
    }
}


impl ModeConfig {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            ModeConfig::UrlList { .. } => "url-list",
            ModeConfig::AllPages { .. } => "all-pages",
            ModeConfig::NewOnly { .. } => "new-only"
        }
    }

    /// The file the run reads from, if any.
    pub(crate) fn input(&self) -> Option<&Path> {
        match self {
            ModeConfig::UrlList { input, .. } => Some(input),
            ModeConfig::NewOnly { reference, .. } => Some(reference),
            ModeConfig::AllPages { .. } => None
        }
    }
}


/// A random delay between `min_secs` and `max_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub(crate) struct DelayRange {
    pub(crate) min_secs: f64,
    pub(crate) max_secs: f64
}


impl DelayRange {
    pub(crate) const fn new(min_secs: f64, max_secs: f64) -> Self {
        Self { min_secs, max_secs }
    }

    pub(crate) fn sample(&self) -> Duration {
        let secs = if self.max_secs > self.min_secs {
            rand::thread_rng().gen_range(self.min_secs..=self.max_secs)
        } else {
            self.min_secs
        };
        Duration::from_secs_f64(secs.max(0.0))
    }
}


#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "ordered_delays"))]
pub(crate) struct Delays {
    /// Waited after every page or link.
    pub(crate) between_units: DelayRange,
    /// Waited between failed attempts at the same page.
    pub(crate) retry_backoff: DelayRange,
    /// How often a paused run checks whether it may continue.
    #[validate(range(min = 10, max = 60000))]
    pub(crate) pause_poll_ms: u64
}


impl Default for Delays {
    fn default() -> Self {
        Self {
            between_units: DelayRange::new(3.0, 7.0),
            retry_backoff: DelayRange::new(5.0, 10.0),
            pause_poll_ms: 1000
        }
    }
}


#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub(crate) struct RetrySettings {
    #[validate(range(min = 1, max = 20))]
    pub(crate) max_attempts: u32,
    /// A listing walk with no known last page ends after this many pages in a row
    /// failed to load.
    #[validate(range(min = 1, max = 100))]
    pub(crate) give_up_after: u32
}


impl Default for RetrySettings {
    fn default() -> Self {
        Self { max_attempts: 3, give_up_after: 3 }
    }
}


#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub(crate) struct DuplicateSettings {
    /// How many of the newest known postings each candidate is compared with.
    #[validate(range(min = 1))]
    pub(crate) window: usize,
    /// New-only runs end after this many duplicates in a row.
    #[validate(range(min = 1))]
    pub(crate) stop_after: u32,
    pub(crate) policy: DuplicatePolicy
}


impl Default for DuplicateSettings {
    fn default() -> Self {
        Self { window: 5, stop_after: 5, policy: DuplicatePolicy::Skip }
    }
}


#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub(crate) struct BackupSettings {
    /// Copy the output file aside after this many appends.
    #[validate(range(min = 1))]
    pub(crate) every: u64,
    /// Defaults to `backups` next to the output file.
    pub(crate) dir: Option<PathBuf>
}


impl Default for BackupSettings {
    fn default() -> Self {
        Self { every: 5, dir: None }
    }
}


impl BackupSettings {
    pub(crate) fn dir_for(&self, output: &Path) -> PathBuf {
        match &self.dir {
            Some(dir) => dir.clone(),
            None => output.parent().unwrap_or(Path::new("")).join("backups")
        }
    }
}


impl Config {
    pub(crate) fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub(crate) fn parse(text: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        if matches!(config.mode, ModeConfig::UrlList { .. }) {
            anyhow::ensure!(
                config.site.posting_extractor().is_some(),
                "url-list mode is not available for {}",
                config.site.name()
            );
        }
        Ok(config)
    }

    /// Identifies the kind of run in checkpoints, e.g. `jobinja/new-only`.
    pub(crate) fn run_key(&self) -> String {
        format!("{}/{}", self.site.name(), self.mode.name())
    }

    pub(crate) fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.delays.pause_poll_ms)
    }
}


fn default_checkpoint() -> PathBuf {
    PathBuf::from("scrape.checkpoint")
}


fn default_true() -> bool {
    true
}


fn ordered_delays(delays: &Delays) -> Result<(), ValidationError> {
    for range in [&delays.between_units, &delays.retry_backoff] {
        if range.min_secs < 0.0 || range.max_secs < range.min_secs {
            return Err(ValidationError::new("delay_range"));
        }
    }
    Ok(())
}


fn valid_schedule(config: &Config) -> Result<(), ValidationError> {
    match config.schedule {
        Schedule::Every { hours: 0 } => Err(ValidationError::new("schedule_interval")),
        _ => Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        site = "jobinja"
        output = "out/jobs.csv"
        resume = false

        [mode]
        kind = "new-only"
        reference = "out/previous.csv"

        [delays]
        between_units = { min_secs = 1.0, max_secs = 2.5 }
        retry_backoff = { min_secs = 0.0, max_secs = 0.0 }
        pause_poll_ms = 250

        [retry]
        max_attempts = 5
        give_up_after = 4

        [duplicates]
        window = 10
        policy = "strict"

        [schedule]
        kind = "every"
        hours = 6
    "#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = Config::parse("site = \"jobvision\"\noutput = \"jobs.csv\"\n[mode]\nkind = \"all-pages\"\n").unwrap();
        assert_eq!(config.checkpoint, PathBuf::from("scrape.checkpoint"));
        assert!(config.resume);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.give_up_after, 3);
        assert_eq!(config.duplicates.window, 5);
        assert_eq!(config.duplicates.stop_after, 5);
        assert_eq!(config.backup.every, 5);
        assert_eq!(config.schedule, Schedule::Immediate);
        assert_eq!(config.run_key(), "jobvision/all-pages");
        assert_eq!(config.backup.dir_for(&config.output), PathBuf::from("backups"));
    }

    #[test]
    fn full_config_parses() {
        let config = Config::parse(FULL).unwrap();
        assert!(!config.resume);
        assert_eq!(config.delays.between_units, DelayRange::new(1.0, 2.5));
        assert_eq!(config.pause_poll(), Duration::from_millis(250));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.give_up_after, 4);
        assert_eq!(config.duplicates.policy, DuplicatePolicy::Strict);
        assert_eq!(config.schedule, Schedule::Every { hours: 6 });
        assert_eq!(config.mode.input(), Some(Path::new("out/previous.csv")));
        assert_eq!(config.backup.dir_for(&config.output), PathBuf::from("out/backups"));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let too_many = FULL.replace("max_attempts = 5", "max_attempts = 0");
        assert!(Config::parse(&too_many).is_err());

        let never_give_up = FULL.replace("give_up_after = 4", "give_up_after = 0");
        assert!(Config::parse(&never_give_up).is_err());

        let bad_url = format!("base_url = \"not a url\"\n{FULL}");
        assert!(Config::parse(&bad_url).is_err());
    }

    #[test]
    fn delay_ranges_must_run_forwards() {
        let backwards = FULL.replace("max_secs = 2.5", "max_secs = 0.5");
        assert!(Config::parse(&backwards).is_err());

        let negative = FULL.replace("retry_backoff = { min_secs = 0.0", "retry_backoff = { min_secs = -1.0");
        assert!(Config::parse(&negative).is_err());

        let delays = Delays { retry_backoff: DelayRange::new(2.0, 1.0), ..Delays::default() };
        assert!(delays.validate().is_err());
        assert!(Delays::default().validate().is_ok());
    }

    #[test]
    fn zero_hour_interval_is_rejected() {
        let never = FULL.replace("hours = 6", "hours = 0");
        let err = Config::parse(&never).unwrap_err();
        let errors = err.downcast_ref::<validator::ValidationErrors>().unwrap();
        assert!(errors.errors().contains_key("__all__"));
        assert!(Config::parse(&FULL.replace("hours = 6", "hours = 1")).is_ok());
    }

    #[test]
    fn url_lists_need_a_posting_extractor() {
        let text = "site = \"jobvision\"\noutput = \"jobs.csv\"\n[mode]\nkind = \"url-list\"\ninput = \"links.csv\"\n";
        assert!(Config::parse(text).is_err());
        let text = text.replace("jobvision", "jobinja");
        assert!(Config::parse(&text).is_ok());
    }

    #[test]
    fn delay_samples_stay_in_range() {
        let range = DelayRange::new(0.01, 0.02);
        for _ in 0..50 {
            let d = range.sample();
            assert!(d >= Duration::from_secs_f64(0.01) && d <= Duration::from_secs_f64(0.02));
        }
        assert_eq!(DelayRange::new(0.0, 0.0).sample(), Duration::ZERO);
    }
}
