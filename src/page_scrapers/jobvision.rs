use std::sync::OnceLock;

use regex::Regex;

use crate::record::{Field, JobRecord};

use super::{clean_link, css, first_text, text_of, FieldExtractor, Page};

pub(super) const LISTING_URL: &str = "https://jobvision.ir/jobs";

const NEGOTIABLE: &str = "Negotiable";


/// A scraper for Jobvision listing pages
#[derive(Default)]
pub(crate) struct JobvisionListing;

impl FieldExtractor for JobvisionListing {
    fn name(&self) -> &'static str {
        "jobvision-listing"
    }

    fn ready_selector(&self) -> Option<&'static str> {
        Some("job-card")
    }

    fn extract(&self, page: &Page) -> Vec<JobRecord> {
        let document = page.document();
        let job_anchor = css("a[href*='/jobs/']");
        let salary = css("span.font-size-12px:not(.text-secondary)");
        let salary_block = css("div.d-flex.flex-wrap");
        let urgent = css(".urgent-tag");

        document
            .select(&css("job-card"))
            .filter_map(|card| {
                let href = card
                    .value()
                    .attr("href")
                    .or_else(|| card.select(&job_anchor).next()?.value().attr("href"))?;
                let link = clean_link(&page.url, href)?;

                let mut record = JobRecord::new(link).with_page(page.number);
                record.title = first_text(card, &css(".job-card-title"));
                record.company = first_text(card, &css("a.text-black.line-height-24"));
                record.location = first_text(card, &css("span.text-secondary.pointer-events-none"));

                record.salary = match first_text(card, &salary) {
                    Field::Value(value) => Field::Value(value),
                    _ => card
                        .select(&salary_block)
                        .map(text_of)
                        .find_map(|text| salary_from_block(&text))
                        .map(Field::from_text)
                        .unwrap_or_else(|| Field::Value(NEGOTIABLE.to_string()))
                };

                let is_urgent = card.select(&urgent).next().is_some();
                record.urgency = Field::Value(if is_urgent { "Urgent" } else { "Normal" }.to_string());
                Some(record)
            })
            .collect()
    }
}


/// The salary part of a card's meta line, which mentions millions or tomans and is the
/// last `|` separated segment.
fn salary_from_block(text: &str) -> Option<String> {
    static MONEY: OnceLock<Regex> = OnceLock::new();
    let money = MONEY.get_or_init(|| Regex::new("میلیون|تومان").expect("Static regex should have been valid"));
    if !money.is_match(text) {
        return None;
    }
    text.rsplit('|').next().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}
