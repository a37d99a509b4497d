use std::{ffi::OsString, sync::{Arc, Mutex, PoisonError, atomic::{AtomicU64, Ordering}}, time::Duration};

use headless_chrome::{Browser, LaunchOptions, Tab};
use rand::seq::SliceRandom;
use serde::Deserialize;
use tracing::{debug, info, warn};
use validator::Validate;


const USER_AGENTS: [&str; 4] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];


#[derive(Debug, thiserror::Error)]
pub(crate) enum FetchError {
    /// The browser could not be started. Nothing can be fetched after this.
    #[error("failed to launch the browser: {0:#}")]
    Launch(anyhow::Error),
    /// One page failed to load. Worth another attempt.
    #[error("failed to load {url}: {reason}")]
    Page {
        url: String,
        reason: String
    }
}


impl FetchError {
    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, FetchError::Page { .. })
    }
}


/// Turns a URL into rendered page HTML.
pub(crate) trait PageFetcher: Send + Sync {
    /// Loads `url` and returns its HTML once `ready_selector` (if any) is present.
    fn fetch(&self, url: &str, ready_selector: Option<&str>) -> Result<String, FetchError>;
}


/// Settings for the Chrome instance behind [`ChromeFetcher`].
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub(crate) struct BrowserSettings {
    /// Run without a visible window.
    pub(crate) headless: bool,
    #[validate(range(min = 1, max = 600))]
    pub(crate) page_load_timeout_secs: u64,
    /// How long to wait for the page's listing markup after navigation.
    #[validate(range(min = 1, max = 600))]
    pub(crate) ready_timeout_secs: u64,
    /// Chrome is shut down after this long without a command, so it must outlast the
    /// longest pause an operator is likely to take.
    #[validate(range(min = 30))]
    pub(crate) idle_timeout_secs: u64,
    /// Switch to a different user agent after this many pages. Zero disables rotation.
    pub(crate) rotate_user_agent_every: u64
}


impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            page_load_timeout_secs: 30,
            ready_timeout_secs: 20,
            idle_timeout_secs: 3600,
            rotate_user_agent_every: 5
        }
    }
}


/// Fetches pages through a single headless Chrome tab.
pub(crate) struct ChromeFetcher {
    // Keeps the Chrome process alive for as long as the fetcher lives.
    browser: Browser,
    tab: Mutex<Option<Arc<Tab>>>,
    user_agent: Mutex<&'static str>,
    settings: BrowserSettings,
    fetches: AtomicU64
}


impl ChromeFetcher {
    pub(crate) fn launch(settings: BrowserSettings) -> Result<Self, FetchError> {
        let user_agent = *USER_AGENTS.choose(&mut rand::thread_rng()).unwrap_or(&USER_AGENTS[0]);
        let args: Vec<OsString> = [
            "--disable-gpu",
            "--disable-extensions",
            "--disable-dev-shm-usage",
            "--disable-blink-features=AutomationControlled",
            "--blink-settings=imagesEnabled=false",
        ]
            .into_iter()
            .map(OsString::from)
            .chain(std::iter::once(OsString::from(format!("--user-agent={user_agent}"))))
            .collect();

        let options = LaunchOptions {
            headless: settings.headless,
            window_size: Some((1920, 1080)),
            idle_browser_timeout: Duration::from_secs(settings.idle_timeout_secs),
            args: args.iter().map(|a| a.as_os_str()).collect(),
            ..Default::default()
        };
        let browser = Browser::new(options).map_err(FetchError::Launch)?;
        info!(headless = settings.headless, "Browser launched");

        Ok(Self {
            browser,
            tab: Mutex::new(None),
            user_agent: Mutex::new(user_agent),
            settings,
            fetches: AtomicU64::new(0)
        })
    }

    fn tab(&self) -> anyhow::Result<Arc<Tab>> {
        let mut slot = self.tab.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tab) = slot.as_ref() {
            return Ok(tab.clone());
        }
        let tab = self.browser.new_tab()?;
        tab.set_default_timeout(Duration::from_secs(self.settings.page_load_timeout_secs));
        let user_agent = *self.user_agent.lock().unwrap_or_else(PoisonError::into_inner);
        tab.set_user_agent(user_agent, Some("fa-IR,fa;q=0.9,en;q=0.8"), None)?;
        *slot = Some(tab.clone());
        Ok(tab)
    }

    fn discard_tab(&self) {
        if let Some(tab) = self.tab.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = tab.close(false);
        }
    }

    fn rotate_user_agent(&self, tab: &Tab) -> anyhow::Result<()> {
        let mut current = self.user_agent.lock().unwrap_or_else(PoisonError::into_inner);
        let candidates: Vec<&'static str> = USER_AGENTS.into_iter().filter(|ua| *ua != *current).collect();
        if let Some(&next) = candidates.choose(&mut rand::thread_rng()) {
            tab.set_user_agent(next, Some("fa-IR,fa;q=0.9,en;q=0.8"), None)?;
            *current = next;
            info!(user_agent = &next[..50.min(next.len())], "Rotated user agent");
        }
        Ok(())
    }

    fn load(&self, url: &str, ready_selector: Option<&str>) -> anyhow::Result<String> {
        let tab = self.tab()?;

        let fetched = self.fetches.fetch_add(1, Ordering::Relaxed);
        let every = self.settings.rotate_user_agent_every;
        if every > 0 && fetched > 0 && fetched % every == 0 {
            self.rotate_user_agent(&tab)?;
        }

        debug!(url, "Navigating");
        tab.navigate_to(url)?.wait_until_navigated()?;
        if let Some(selector) = ready_selector {
            tab.wait_for_element_with_custom_timeout(
                selector,
                Duration::from_secs(self.settings.ready_timeout_secs)
            )?;
        }
        // Some boards only render the lower cards once they scroll into view.
        tab.evaluate("window.scrollTo(0, document.body.scrollHeight);", false)?;
        tab.get_content()
    }
}


impl PageFetcher for ChromeFetcher {
    fn fetch(&self, url: &str, ready_selector: Option<&str>) -> Result<String, FetchError> {
        self.load(url, ready_selector).map_err(|e| {
            warn!(url, error = %e, "Page load failed, the tab will be reopened");
            self.discard_tab();
            FetchError::Page { url: url.to_string(), reason: format!("{e:#}") }
        })
    }
}
