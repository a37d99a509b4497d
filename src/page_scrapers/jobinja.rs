use scraper::ElementRef;

use crate::record::{Field, JobRecord};

use super::{clean_link, css, first_text, max_number, text_of, FieldExtractor, Page};

/// "Latest job posts" listing, newest first.
pub(super) const LISTING_URL: &str = "https://jobinja.ir/jobs/latest-job-post-%D8%A7%D8%B3%D8%AA%D8%AE%D8%AF%D8%A7%D9%85%DB%8C-%D8%AC%D8%AF%DB%8C%D8%AF";


/// A scraper for Jobinja listing pages
#[derive(Default)]
pub(crate) struct JobinjaListing;

impl FieldExtractor for JobinjaListing {
    fn name(&self) -> &'static str {
        "jobinja-listing"
    }

    fn ready_selector(&self) -> Option<&'static str> {
        Some(".o-listView__itemInfo, .paginator")
    }

    fn extract(&self, page: &Page) -> Vec<JobRecord> {
        let document = page.document();
        let title_link = css(".c-jobListView__titleLink");
        let span = css("span");

        document
            .select(&css(".o-listView__itemInfo"))
            .filter_map(|card| {
                let anchor = card.select(&title_link).next()?;
                let link = clean_link(&page.url, anchor.value().attr("href")?)?;

                // The meta spans carry no classes, only their punctuation tells them apart.
                let spans: Vec<String> = card.select(&span).map(text_of).collect();
                let span_with = |marker: &str| {
                    spans
                        .iter()
                        .find(|s| s.contains(marker))
                        .map(|s| Field::from_text(s.trim_matches(|c: char| c == '|' || c.is_whitespace())))
                        .unwrap_or_default()
                };

                let mut record = JobRecord::new(link).with_page(page.number);
                record.title = Field::from_text(text_of(anchor));
                record.company = span_with("|");
                record.location = span_with("،");
                record.contract_type = span_with("قرارداد");
                Some(record)
            })
            .collect()
    }

    fn page_count(&self, page: &Page) -> Option<u64> {
        let document = page.document();
        let paginator = css(".paginator li a");
        let numbers = document.select(&paginator).map(text_of);
        max_number(numbers)
    }
}


/// A scraper for a single Jobinja job posting
#[derive(Default)]
pub(crate) struct JobinjaPosting;

impl FieldExtractor for JobinjaPosting {
    fn name(&self) -> &'static str {
        "jobinja-posting"
    }

    fn ready_selector(&self) -> Option<&'static str> {
        Some("h1")
    }

    fn extract(&self, page: &Page) -> Vec<JobRecord> {
        let document = page.document();
        let root = document.root_element();

        let mut record = JobRecord::new(page.url.as_str()).with_page(page.number);
        record.title = first_text(root, &css("h1"));

        for heading in root.select(&css("h4")) {
            let label = label_key(&text_of(heading));
            let Some(block) = heading.next_siblings().find_map(ElementRef::wrap) else {
                continue;
            };
            let values = block_values(block);

            match label.as_str() {
                "دستهبندیشغلی" => record.category = first_value(&values),
                "موقعیتمکانی" => record.location = first_value(&values),
                "نوعهمکاری" => record.contract_type = first_value(&values),
                "حداقلسابقهکار" => record.experience = first_value(&values),
                "حقوق" => record.salary = first_value(&values),
                "مهارتهایموردنیاز" => record.skills = Field::from_text(values.join(", ")),
                "زبانهایموردنیاز" => record.languages = Field::from_text(values.join(", ")),
                "جنسیت" => record.gender = first_value(&values),
                "وضعیتنظاموظیفه" => record.military_status = first_value(&values),
                "حداقلمدرکتحصیلی" => record.education = first_value(&values),
                _ => {}
            }
        }

        record.description = first_text(root, &css(".o-box__text.s-jobDesc"));
        record.company_intro = first_text(root, &css(".o-box__text:not(.s-jobDesc)"));
        record.company = first_text(root, &css(".c-companyHeader__name"));
        vec![record]
    }
}


/// Heading text with spaces and zero-width non-joiners removed, so both spellings of
/// compound Persian words compare equal.
fn label_key(label: &str) -> String {
    label.chars().filter(|c| !c.is_whitespace() && *c != '\u{200c}').collect()
}


fn block_values(block: ElementRef) -> Vec<String> {
    let spans: Vec<String> = block
        .select(&css("span"))
        .map(text_of)
        .filter(|s| !s.is_empty())
        .collect();
    if spans.is_empty() {
        vec![text_of(block)]
    } else {
        spans
    }
}


fn first_value(values: &[String]) -> Field {
    values.first().cloned().map(Field::from_text).unwrap_or_default()
}
