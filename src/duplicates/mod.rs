use std::borrow::Cow;

use percent_encoding::percent_decode_str;
use serde::Deserialize;

use crate::record::{Field, JobRecord};


/// What a run does when it meets a listing it already knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum DuplicatePolicy {
    /// Drop the listing and keep going.
    #[default]
    Skip,
    /// Abort the run with [`DuplicateListing`].
    Strict
}


#[derive(Debug, thiserror::Error)]
#[error("listing already present in the known set: {link}")]
pub(crate) struct DuplicateListing {
    pub(crate) link: String
}


/// Decodes the human readable part of a listing link.
///
/// `https://jobinja.ir/companies/ceres/jobs/AEXN/%D8%A7...?_ref=16` becomes the
/// decoded text after the job id. Links without a `/jobs/` segment come back whole.
pub(crate) fn listing_slug(link: &str) -> Cow<'_, str> {
    let Some((_, after)) = link.split_once("/jobs/") else {
        return Cow::Borrowed(link);
    };
    let path = after.split(['?', '#']).next().unwrap_or_default();
    let slug = match path.split_once('/') {
        Some((_, rest)) => rest.split('/').next().unwrap_or_default(),
        None => path
    };
    percent_decode_str(slug).decode_utf8_lossy()
}


/// Checks candidates against the newest few known records.
///
/// Only the first `window` known records are consulted, so the known set must be
/// ordered newest first. Placeholders for pages that never loaded take no slot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DuplicateFilter {
    window: usize
}


impl DuplicateFilter {
    pub(crate) fn new(window: usize) -> Self {
        Self { window }
    }

    pub(crate) fn is_duplicate(&self, candidate: &JobRecord, known: &[JobRecord]) -> bool {
        let slug = listing_slug(&candidate.link);

        known.iter().filter(|r| !r.is_placeholder()).take(self.window).any(|existing| {
            slug == listing_slug(&existing.link)
                || (same_text(&candidate.title, &existing.title)
                    && same_text(&candidate.company, &existing.company))
                || candidate.link == existing.link
        })
    }
}


fn same_text(a: &Field, b: &Field) -> bool {
    match (a.value(), b.value()) {
        (Some(a), Some(b)) => a.to_lowercase() == b.to_lowercase(),
        _ => false
    }
}
