use std::sync::{Arc, OnceLock};

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use url::Url;

use crate::record::{Field, JobRecord};

pub(crate) use self::jobinja::{JobinjaListing, JobinjaPosting};
pub(crate) use self::jobvision::JobvisionListing;

mod jobinja;
mod jobvision;


/// A fetched page, ready for extraction.
pub(crate) struct Page {
    pub(crate) html: String,
    pub(crate) url: Arc<Url>,
    /// Listing page number, when the page is one of a numbered sequence.
    pub(crate) number: Option<u64>
}


impl Page {
    pub(crate) fn new(html: String, url: &str, number: Option<u64>) -> anyhow::Result<Self> {
        Ok(Self { html, url: Arc::new(Url::parse(url)?), number })
    }

    pub(crate) fn document(&self) -> Html {
        Html::parse_document(&self.html)
    }
}


/// Pulls job records out of one kind of page.
///
/// Extraction never fails as a whole: a missing element leaves its field
/// [`Field::Absent`], and a card without a link is skipped.
pub(crate) trait FieldExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// CSS selector the fetcher waits for before handing the page over.
    fn ready_selector(&self) -> Option<&'static str> {
        None
    }

    /// Returns every record on the page. An empty result on a listing page means the
    /// listing has run out.
    fn extract(&self, page: &Page) -> Vec<JobRecord>;

    /// The number of listing pages the site reports, if the page shows it.
    fn page_count(&self, _page: &Page) -> Option<u64> {
        None
    }
}


/// The job boards there are extractors for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum Site {
    Jobinja,
    Jobvision
}


impl Site {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Site::Jobinja => "jobinja",
            Site::Jobvision => "jobvision"
        }
    }

    pub(crate) fn listing_extractor(self) -> Arc<dyn FieldExtractor> {
        match self {
            Site::Jobinja => Arc::new(JobinjaListing),
            Site::Jobvision => Arc::new(JobvisionListing)
        }
    }

    /// Extractor for a single posting page, if the site has one.
    pub(crate) fn posting_extractor(self) -> Option<Arc<dyn FieldExtractor>> {
        match self {
            Site::Jobinja => Some(Arc::new(JobinjaPosting)),
            Site::Jobvision => None
        }
    }

    /// Listing page URLs, newest postings first. `base_url` replaces the site's default
    /// listing address.
    pub(crate) fn listing_urls(self, base_url: Option<&Url>) -> anyhow::Result<impl Fn(u64) -> String + Send + Sync + 'static> {
        let mut base = match (self, base_url) {
            (_, Some(base)) => base.clone(),
            (Site::Jobinja, None) => Url::parse(jobinja::LISTING_URL)?,
            (Site::Jobvision, None) => Url::parse(jobvision::LISTING_URL)?
        };
        // Paging and sorting are always set per page, so drop any the base already has.
        if base.query().is_some() {
            let kept: Vec<(String, String)> = base
                .query_pairs()
                .filter(|(key, _)| !matches!(key.as_ref(), "page" | "sort_by" | "sort"))
                .map(|(key, value)| (key.into_owned(), value.into_owned()))
                .collect();
            if kept.is_empty() {
                base.set_query(None);
            } else {
                base.query_pairs_mut().clear().extend_pairs(kept);
            }
        }
        Ok(move |page: u64| {
            let mut url = base.clone();
            {
                let mut query = url.query_pairs_mut();
                match self {
                    Site::Jobinja => {
                        if page > 1 {
                            query.append_pair("page", &page.to_string());
                        }
                        query.append_pair("sort_by", "published_at_desc");
                    }
                    Site::Jobvision => {
                        query.append_pair("page", &page.to_string());
                        query.append_pair("sort", "0");
                    }
                }
            }
            url.to_string()
        })
    }
}


pub(super) fn css(selector: &'static str) -> Selector {
    Selector::parse(selector).expect("Static selector should have been valid")
}


/// Visible text of an element with non-breaking spaces flattened and runs of
/// whitespace collapsed.
pub(super) fn text_of(element: ElementRef) -> String {
    let text: String = element.text().map(|x| x.replace('\u{a0}', " ")).collect();
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}


pub(super) fn first_text(scope: ElementRef, selector: &Selector) -> Field {
    scope.select(selector).next().map(text_of).map(Field::from_text).unwrap_or_default()
}


/// Resolves `href` against the page and drops tracking query strings.
pub(super) fn clean_link(base: &Url, href: &str) -> Option<String> {
    let mut link = base.join(href.trim()).ok()?;
    link.set_query(None);
    link.set_fragment(None);
    Some(link.to_string())
}


/// Largest plain number among the texts, used for paginators. Persian and Arabic-Indic
/// digits count as numbers too.
pub(super) fn max_number(texts: impl Iterator<Item = String>) -> Option<u64> {
    static DIGITS: OnceLock<Regex> = OnceLock::new();
    let digits = DIGITS.get_or_init(|| Regex::new(r"^[0-9]+$").expect("Static regex should have been valid"));
    texts
        .map(|t| to_ascii_digits(t.trim()))
        .filter(|t| digits.is_match(t))
        .filter_map(|t| t.parse().ok())
        .max()
}


fn to_ascii_digits(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{06F0}'..='\u{06F9}' => char::from(b'0' + (c as u32 - 0x06F0) as u8),
            '\u{0660}'..='\u{0669}' => char::from(b'0' + (c as u32 - 0x0660) as u8),
            other => other
        })
        .collect()
}
