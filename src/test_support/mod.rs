use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::fetcher::{FetchError, PageFetcher};

static NEXT: AtomicUsize = AtomicUsize::new(0);

/// A fresh, empty directory under the system temp dir.
pub(crate) fn scratch_dir(name: &str) -> PathBuf {
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("job-board-scraper-{}-{name}-{n}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}


type Respond = Box<dyn Fn(&str) -> Result<String, FetchError> + Send + Sync>;

/// Answers from a closure and remembers every URL it was asked for.
pub(crate) struct ScriptedFetcher {
    respond: Respond,
    calls: Mutex<Vec<String>>
}

impl ScriptedFetcher {
    pub(crate) fn new(respond: impl Fn(&str) -> Result<String, FetchError> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self { respond: Box::new(respond), calls: Mutex::new(Vec::new()) })
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl PageFetcher for ScriptedFetcher {
    fn fetch(&self, url: &str, _ready_selector: Option<&str>) -> Result<String, FetchError> {
        self.calls.lock().unwrap().push(url.to_string());
        (self.respond)(url)
    }
}
