//! Field-level diffing of publications and staff statistics.

use gsync_core::{
    PatchValue, PublicationDetail, PublicationField, PublicationPatch, ShapeError,
    StaffStatistics, StatisticsPatch, StatsField, StoredPublication, NON_BMP_TITLE_PLACEHOLDER,
};

use crate::similarity::SimilarityScorer;

/// Replaces titles holding characters outside the Basic Multilingual Plane.
pub fn sanitize_title(title: &str) -> String {
    if title.chars().any(|c| u32::from(c) > 0xFFFF) {
        NON_BMP_TITLE_PLACEHOLDER.to_string()
    } else {
        title.to_string()
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// What one sync pass observed for a publication.
#[derive(Debug, Clone, Copy)]
pub struct PublicationObservation<'a> {
    pub title: &'a str,
    pub citations: i64,
    pub detail: &'a PublicationDetail,
    pub author_order: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatisticsPlan {
    Insert(StaffStatistics),
    Patch(StatisticsPatch),
    Unchanged,
}

#[derive(Debug, Clone, Copy)]
pub struct RecordReconciler {
    /// Authors are rewritten when their whole-string score drops below this.
    pub author_change_threshold: f64,
}

impl Default for RecordReconciler {
    fn default() -> Self {
        Self {
            author_change_threshold: 80.0,
        }
    }
}

impl RecordReconciler {
    pub fn plan_publication(
        &self,
        scorer: &dyn SimilarityScorer,
        observed: &PublicationObservation<'_>,
        stored: &StoredPublication,
    ) -> PublicationPatch {
        let mut patch = PublicationPatch::new();
        let detail = observed.detail;

        // The placeholder title is sticky.
        if stored.title != NON_BMP_TITLE_PLACEHOLDER {
            let title = sanitize_title(observed.title);
            if title != stored.title {
                patch.set(PublicationField::Title, PatchValue::Text(Some(title)));
            }
        }

        if self.authors_changed(scorer, &detail.authors, &stored.authors) {
            patch.set(
                PublicationField::Authors,
                PatchValue::Text(non_empty(&detail.authors).map(str::to_string)),
            );
        }

        if let Some(date) = detail.publication_date {
            if stored.publication_date != Some(date) {
                patch.set(PublicationField::PublicationDate, PatchValue::Date(Some(date)));
            }
        }

        for (field, scraped, current) in [
            (PublicationField::Journal, &detail.journal, &stored.journal),
            (PublicationField::Publisher, &detail.publisher, &stored.publisher),
        ] {
            let scraped = non_empty(scraped);
            if scraped != non_empty(current) {
                patch.set(field, PatchValue::Text(scraped.map(str::to_string)));
            }
        }

        if observed.citations != stored.citations {
            patch.set(PublicationField::Citations, PatchValue::Int(observed.citations));
        }

        if stored.author_order != Some(observed.author_order) {
            patch.set(
                PublicationField::AuthorOrder,
                PatchValue::Int(i64::from(observed.author_order)),
            );
        }

        patch
    }

    fn authors_changed(
        &self,
        scorer: &dyn SimilarityScorer,
        scraped: &Option<String>,
        stored: &Option<String>,
    ) -> bool {
        match (non_empty(scraped), non_empty(stored)) {
            (None, None) => false,
            (scraped, stored) => {
                scorer.ratio(scraped.unwrap_or_default(), stored.unwrap_or_default())
                    < self.author_change_threshold
            }
        }
    }

    /// Compares the 14 statistics slots positionally against what is stored.
    pub fn plan_statistics(
        &self,
        scraped: &[i64],
        stored: Option<&StaffStatistics>,
    ) -> Result<StatisticsPlan, ShapeError> {
        let scraped = StaffStatistics::from_slots(scraped)?;
        let Some(stored) = stored else {
            return Ok(StatisticsPlan::Insert(scraped));
        };

        let mut patch = StatisticsPatch::new();
        for field in StatsField::ALL {
            let value = scraped.get(field);
            if value != stored.get(field) {
                patch.set(field, PatchValue::Int(value));
            }
        }

        Ok(if patch.is_empty() {
            StatisticsPlan::Unchanged
        } else {
            StatisticsPlan::Patch(patch)
        })
    }
}
