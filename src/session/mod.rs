use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use url::Url;

use crate::{
    checkpoint::{Checkpoint, CheckpointStore},
    config::{Config, ModeConfig},
    duplicates::DuplicateFilter,
    fetcher::{ChromeFetcher, PageFetcher},
    output::{OutputStore, Placement, read_links, read_records},
    page_scrapers::FieldExtractor,
    scrape_loop::{Deduplication, LoopSettings, RunControl, RunSummary, ScrapeLoop, WorkUnits}
};


/// Everything a run needs besides the fetcher, built from the configuration.
pub(crate) struct Prepared {
    pub(crate) extractor: Arc<dyn FieldExtractor>,
    pub(crate) units: WorkUnits,
    pub(crate) output: OutputStore,
    pub(crate) checkpoint: Checkpoint,
    pub(crate) dedup: Option<Deduplication>
}


/// Reads the run's inputs and decides where it starts.
///
/// Missing input files are errors. A checkpoint is only used when resuming is enabled,
/// `fresh` is not set, and it was written by the same kind of run.
pub(crate) fn prepare(config: &Config, checkpoints: &CheckpointStore, fresh: bool) -> anyhow::Result<Prepared> {
    let expected = Checkpoint::new(&config.output, config.mode.input(), config.run_key());
    let resumed = if config.resume && !fresh {
        checkpoints.resume_point(&expected)
    } else {
        None
    };
    if let Some(checkpoint) = &resumed {
        info!(cursor = checkpoint.cursor, records = checkpoint.records_added, "Resuming from checkpoint");
    }

    let base_url = config
        .base_url
        .as_deref()
        .map(Url::parse)
        .transpose()
        .context("base_url is not a valid URL")?;

    let prepared = match &config.mode {
        ModeConfig::UrlList { input, link_column } => {
            let extractor = config
                .site
                .posting_extractor()
                .with_context(|| format!("url-list mode is not available for {}", config.site.name()))?;
            let links = read_links(input, link_column.as_deref())?
                .into_iter()
                .filter_map(|link| match Url::parse(&link) {
                    Ok(url) => Some(url.to_string()),
                    Err(e) => {
                        warn!(%link, error = %e, "Skipping input row that is not a URL");
                        None
                    }
                })
                .collect::<Vec<_>>();
            info!(input = %input.display(), links = links.len(), "Loaded input links");

            Prepared {
                extractor,
                units: WorkUnits::Links(links),
                output: OutputStore::open(&config.output, Placement::Tail, 0)?,
                checkpoint: resumed.unwrap_or(expected),
                dedup: None
            }
        }
        ModeConfig::AllPages { max_pages, max_records } => Prepared {
            extractor: config.site.listing_extractor(),
            units: WorkUnits::Pages {
                url_for: Box::new(config.site.listing_urls(base_url.as_ref())?),
                max_pages: *max_pages,
                max_records: *max_records
            },
            output: OutputStore::open(&config.output, Placement::Tail, 0)?,
            checkpoint: resumed.unwrap_or(expected),
            dedup: None
        },
        ModeConfig::NewOnly { reference, max_pages } => {
            let output = match &resumed {
                Some(checkpoint) => OutputStore::open(&config.output, Placement::Head, checkpoint.records_added as usize)?,
                None => {
                    let known = read_records(reference)
                        .with_context(|| format!("Failed to load reference file {}", reference.display()))?;
                    info!(reference = %reference.display(), rows = known.len(), "Loaded reference postings");
                    OutputStore::seeded(&config.output, Placement::Head, known)
                }
            };

            Prepared {
                extractor: config.site.listing_extractor(),
                units: WorkUnits::Pages {
                    url_for: Box::new(config.site.listing_urls(base_url.as_ref())?),
                    max_pages: *max_pages,
                    max_records: None
                },
                output,
                checkpoint: resumed.unwrap_or(expected),
                dedup: Some(Deduplication {
                    filter: DuplicateFilter::new(config.duplicates.window),
                    policy: config.duplicates.policy,
                    stop_after: config.duplicates.stop_after
                })
            }
        }
    };

    prepared.output.ensure_file()?;
    Ok(prepared)
}


/// Runs one scrape with `fetcher` and deletes the checkpoint if the run finished.
pub(crate) async fn execute(
    config: &Config,
    fetcher: Arc<dyn PageFetcher>,
    control: Arc<RunControl>,
    fresh: bool
) -> anyhow::Result<RunSummary> {
    let checkpoints = CheckpointStore::new(&config.checkpoint);
    let Prepared { extractor, units, mut output, checkpoint, dedup } = prepare(config, &checkpoints, fresh)?;

    let settings = LoopSettings {
        max_attempts: config.retry.max_attempts,
        retry_backoff: config.delays.retry_backoff,
        between_units: config.delays.between_units,
        pause_poll: config.pause_poll(),
        backup_every: config.backup.every,
        backup_dir: config.backup.dir_for(&config.output),
        give_up_after: u64::from(config.retry.give_up_after),
        known_links: config.duplicates.policy
    };
    let summary = ScrapeLoop::new(fetcher, extractor, settings, control)
        .run(units, checkpoint, &mut output, &checkpoints, dedup)
        .await?;

    if summary.outcome.is_clean() {
        checkpoints.clear()?;
        info!(output = %output.path().display(), rows = output.len(), "Run complete");
    } else {
        info!(checkpoint = %checkpoints.path().display(), cursor = summary.cursor, "Run stopped, checkpoint kept for the next run");
    }
    Ok(summary)
}


/// Starts Chrome and runs one scrape with it.
pub(crate) async fn run(config: &Config, control: Arc<RunControl>, fresh: bool) -> anyhow::Result<RunSummary> {
    let settings = config.browser.clone();
    let fetcher = tokio_rayon::spawn(move || ChromeFetcher::launch(settings)).await?;
    execute(config, Arc::new(fetcher), control, fresh).await
}


#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::{
        duplicates::DuplicateListing,
        fetcher::FetchError,
        record::JobRecord,
        scrape_loop::Outcome,
        test_support::{ScriptedFetcher, scratch_dir}
    };

    const FAST: &str = r#"
        [delays]
        between_units = { min_secs = 0.0, max_secs = 0.0 }
        retry_backoff = { min_secs = 0.0, max_secs = 0.0 }
        pause_poll_ms = 10
    "#;

    fn config(dir: &Path, site: &str, mode: &str) -> Config {
        let text = format!(
            "site = '{site}'\noutput = '{}'\ncheckpoint = '{}'\n[mode]\n{mode}\n{FAST}",
            dir.join("out.csv").display(),
            dir.join("run.checkpoint").display()
        );
        Config::parse(&text).unwrap()
    }

    fn posting(n: u32) -> String {
        format!("https://jobinja.ir/companies/acme/jobs/A{n}/job-{n}")
    }

    fn jobinja_listing(links: &[String]) -> String {
        let cards: String = links
            .iter()
            .map(|link| format!(r#"<div class="o-listView__itemInfo"><a class="c-jobListView__titleLink" href="{link}">Job {link}</a></div>"#))
            .collect();
        format!("<html><body>{cards}</body></html>")
    }

    fn page_of(url: &str) -> u32 {
        Url::parse(url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == "page")
            .map_or(1, |(_, v)| v.parse().unwrap())
    }

    fn write_rows(path: &Path, rows: Vec<JobRecord>) {
        OutputStore::seeded(path, Placement::Tail, rows).ensure_file().unwrap();
    }

    fn output_links(config: &Config) -> Vec<String> {
        read_records(&config.output).unwrap().into_iter().map(|r| r.link).collect()
    }

    #[tokio::test]
    async fn new_only_puts_new_postings_above_the_reference() {
        let dir = scratch_dir("session-new-only");
        let reference = dir.join("reference.csv");
        write_rows(&reference, (1..=5).map(|n| JobRecord::new(posting(n))).collect());
        let config = config(&dir, "jobinja", &format!("kind = 'new-only'\nreference = '{}'", reference.display()));

        let fetcher = ScriptedFetcher::new(|url| {
            Ok(match page_of(url) {
                1 => jobinja_listing(&[posting(10), posting(11), posting(1), posting(2), posting(3)]),
                2 => jobinja_listing(&[posting(4), posting(5), posting(6)]),
                _ => jobinja_listing(&[posting(7)])
            })
        });

        let summary = execute(&config, fetcher.clone(), Arc::new(RunControl::default()), false).await.unwrap();

        assert_eq!(summary.outcome, Outcome::CaughtUp);
        assert_eq!(fetcher.calls().len(), 2);
        let expected: Vec<String> = [10, 11, 1, 2, 3, 4, 5].into_iter().map(posting).collect();
        assert_eq!(output_links(&config), expected);
        assert!(!config.checkpoint.exists());
    }

    #[tokio::test]
    async fn url_list_normalizes_and_skips_links() {
        let dir = scratch_dir("session-url-list");
        let input = dir.join("links.csv");
        std::fs::write(&input, format!("name,url\na,{}\nb,not a link\nc,{}\n", posting(1), posting(2))).unwrap();
        let config = config(&dir, "jobinja", &format!("kind = 'url-list'\ninput = '{}'\nlink_column = 'url'", input.display()));
        write_rows(&config.output, vec![JobRecord::new(posting(1))]);

        let fetcher = ScriptedFetcher::new(|_| Ok("<html><body><h1>Developer</h1></body></html>".to_string()));
        let summary = execute(&config, fetcher.clone(), Arc::new(RunControl::default()), false).await.unwrap();

        assert_eq!(summary.outcome, Outcome::Completed);
        assert_eq!(fetcher.calls(), vec![posting(2)]);
        assert_eq!(output_links(&config), vec![posting(1), posting(2)]);
    }

    #[tokio::test]
    async fn strict_url_list_aborts_on_a_link_already_written() {
        let dir = scratch_dir("session-url-list-strict");
        let input = dir.join("links.csv");
        std::fs::write(&input, format!("url\n{}\n{}\n", posting(1), posting(2))).unwrap();
        let mode = format!("kind = 'url-list'\ninput = '{}'\n[duplicates]\npolicy = 'strict'", input.display());
        let config = config(&dir, "jobinja", &mode);
        write_rows(&config.output, vec![JobRecord::new(posting(1))]);

        let fetcher = ScriptedFetcher::new(|_| Ok("<html><body><h1>Developer</h1></body></html>".to_string()));
        let err = execute(&config, fetcher.clone(), Arc::new(RunControl::default()), false).await.unwrap_err();

        assert_eq!(err.downcast_ref::<DuplicateListing>().unwrap().link, posting(1));
        assert!(fetcher.calls().is_empty());
        assert_eq!(output_links(&config), vec![posting(1)]);
    }

    #[tokio::test]
    async fn unreachable_listing_keeps_the_checkpoint() {
        let dir = scratch_dir("session-unreachable");
        let config = config(&dir, "jobvision", "kind = 'all-pages'\n[retry]\nmax_attempts = 1\ngive_up_after = 2");

        let fetcher = ScriptedFetcher::new(|url| Err(FetchError::Page { url: url.to_string(), reason: "refused".into() }));
        let summary = execute(&config, fetcher.clone(), Arc::new(RunControl::default()), false).await.unwrap();

        assert_eq!(summary.outcome, Outcome::Unreachable);
        assert_eq!(fetcher.calls().len(), 2);
        assert!(config.checkpoint.exists());
        assert_eq!(CheckpointStore::new(&config.checkpoint).load().unwrap().cursor, 1);
    }

    #[tokio::test]
    async fn missing_input_is_fatal() {
        let dir = scratch_dir("session-missing-input");
        let config = config(&dir, "jobinja", &format!("kind = 'url-list'\ninput = '{}'", dir.join("nope.csv").display()));

        let fetcher = ScriptedFetcher::new(|url| Ok(url.to_string()));
        let result = execute(&config, fetcher.clone(), Arc::new(RunControl::default()), false).await;

        assert!(result.is_err());
        assert!(fetcher.calls().is_empty());
    }

    fn interrupted_url_list(name: &str) -> (Config, CheckpointStore) {
        let dir = scratch_dir(name);
        let input = dir.join("links.csv");
        std::fs::write(&input, format!("url\n{}\n{}\n", posting(1), posting(2))).unwrap();
        let config = config(&dir, "jobinja", &format!("kind = 'url-list'\ninput = '{}'", input.display()));
        write_rows(&config.output, Vec::new());

        let checkpoints = CheckpointStore::new(&config.checkpoint);
        let mut checkpoint = Checkpoint::new(&config.output, config.mode.input(), config.run_key());
        checkpoint.cursor = 1;
        checkpoints.save(&mut checkpoint).unwrap();
        (config, checkpoints)
    }

    #[test]
    fn checkpoint_sets_the_starting_row() {
        let (config, checkpoints) = interrupted_url_list("session-resume");
        assert_eq!(prepare(&config, &checkpoints, false).unwrap().checkpoint.cursor, 1);
    }

    #[test]
    fn fresh_start_ignores_the_checkpoint() {
        let (config, checkpoints) = interrupted_url_list("session-fresh");
        assert_eq!(prepare(&config, &checkpoints, true).unwrap().checkpoint.cursor, 0);
    }

    #[test]
    fn listing_modes_walk_pages_from_one() {
        let dir = scratch_dir("session-pages");
        let config = config(&dir, "jobvision", "kind = 'all-pages'\nmax_pages = 3");
        let prepared = prepare(&config, &CheckpointStore::new(&config.checkpoint), false).unwrap();

        let WorkUnits::Pages { url_for, max_pages, .. } = prepared.units else {
            panic!("expected listing pages");
        };
        assert_eq!(url_for(1), "https://jobvision.ir/jobs?page=1&sort=0");
        assert_eq!(max_pages, Some(3));
        assert!(prepared.dedup.is_none());
        assert!(config.output.exists());
    }
}
