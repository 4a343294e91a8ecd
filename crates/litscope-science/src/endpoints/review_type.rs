use litscope_core::registry::bind_settings;
use litscope_core::settings::PrepRound;
use litscope_core::endpoints::ReviewTypeEndpoint;
use litscope_core::{PackageEndpoint, Result, Settings};
use serde::Deserialize;

pub const LITERATURE_REVIEW: &str = "colrev.literature_review";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LiteratureReviewSettings {
    /// Link records to Crossref metadata during prep (needs network).
    pub crossref_prep: bool,
}

impl Default for LiteratureReviewSettings {
    fn default() -> Self {
        Self { crossref_prep: false }
    }
}

/// A narrative literature review: offline prep, table-based prescreen and
/// screen, a bibliography and a PRISMA summary.
pub struct LiteratureReview {
    settings: LiteratureReviewSettings,
}

pub fn factory(params: &toml::Table) -> Result<Box<dyn ReviewTypeEndpoint>> {
    let settings = bind_settings(LITERATURE_REVIEW, params)?;
    Ok(Box::new(LiteratureReview { settings }))
}

impl ReviewTypeEndpoint for LiteratureReview {
    fn initialize(&self, settings: &mut Settings) -> Result<()> {
        settings.project.review_type = LITERATURE_REVIEW.to_string();

        let mut prep = vec![
            PackageEndpoint::new("colrev.source_specific_prep"),
            PackageEndpoint::new("colrev.exclude_languages"),
            PackageEndpoint::new("colrev.journal_polish"),
        ];
        if self.settings.crossref_prep {
            prep.push(PackageEndpoint::new("colrev.crossref_metadata"));
        }
        settings.prep.prep_rounds = vec![PrepRound {
            name: "prep".to_string(),
            prep_package_endpoints: prep,
        }];
        settings.prep.prep_man_package_endpoints = vec![PackageEndpoint::new("colrev.prep_man_export")];
        settings.dedupe.dedupe_package_endpoints = vec![PackageEndpoint::new("colrev.dedupe")];
        settings.prescreen.prescreen_package_endpoints = vec![
            PackageEndpoint::new("colrev.scope_prescreen"),
            PackageEndpoint::new("colrev.prescreen_table"),
        ];
        settings.pdf_get.pdf_get_package_endpoints = vec![PackageEndpoint::new("colrev.local_pdfs")];
        settings.pdf_get.pdf_get_man_package_endpoints = vec![PackageEndpoint::new("colrev.pdf_get_man")];
        settings.pdf_prep.pdf_prep_package_endpoints = vec![PackageEndpoint::new("colrev.pdf_check")];
        settings.pdf_prep.pdf_prep_man_package_endpoints = vec![PackageEndpoint::new("colrev.pdf_prep_man")];
        settings.screen.screen_package_endpoints = vec![PackageEndpoint::new("colrev.screen_table")];
        settings.data.data_package_endpoints = vec![
            PackageEndpoint::new("colrev.bibliography_export"),
            PackageEndpoint::new("colrev.prisma"),
        ];
        Ok(())
    }
}
