//! The built-in `colrev` endpoint package.

pub mod bibtex_source;
pub mod crossref_source;
pub mod data;
pub mod dedupe;
pub mod pdf;
pub mod prep;
pub mod prep_man;
pub mod prescreen;
pub mod review_type;
pub mod screen;

use litscope_core::registry::{Capability, EndpointDescriptor, EndpointFactory, PackageManifest, ENDPOINT_GROUP};
use litscope_core::SearchType;

pub const PACKAGE: &str = "litscope-science";

fn endpoint(
    identifier: &'static str,
    description: &'static str,
    ci_supported: bool,
    factory: EndpointFactory,
) -> EndpointDescriptor {
    EndpointDescriptor {
        identifier,
        capability: factory.capability(),
        description,
        ci_supported,
        search_types: &[],
        requirements: Vec::new(),
        factory,
    }
}

fn search_source(
    identifier: &'static str,
    description: &'static str,
    search_types: &'static [SearchType],
    factory: EndpointFactory,
) -> EndpointDescriptor {
    EndpointDescriptor {
        search_types,
        ..endpoint(identifier, description, true, factory)
    }
}

/// Every endpoint this crate ships.
pub fn manifest() -> PackageManifest {
    use EndpointFactory as F;

    let endpoints = vec![
        endpoint(
            review_type::LITERATURE_REVIEW,
            "Narrative literature review",
            true,
            F::ReviewType(review_type::factory),
        ),
        search_source(
            bibtex_source::BIBTEX,
            "BibTeX export from a database",
            &[SearchType::Db],
            F::SearchSource(bibtex_source::factory),
        ),
        search_source(
            crossref_source::CROSSREF,
            "Crossref works API",
            &[SearchType::Api, SearchType::Md],
            F::SearchSource(crossref_source::factory),
        ),
        endpoint(
            prep::SOURCE_SPECIFIC_PREP,
            "Source-specific cleanup of loaded records",
            true,
            F::Prep(prep::source_specific_factory),
        ),
        endpoint(
            prep::EXCLUDE_LANGUAGES,
            "Prescreen-exclude records in other languages",
            true,
            F::Prep(prep::exclude_languages_factory),
        ),
        endpoint(
            prep::JOURNAL_POLISH,
            "Expand journal abbreviations and fix capitals",
            true,
            F::Prep(prep::journal_polish_factory),
        ),
        endpoint(
            prep::CROSSREF_METADATA,
            "Link records to Crossref metadata",
            true,
            F::Prep(prep::crossref_metadata_factory),
        ),
        endpoint(
            prep_man::PREP_MAN_EXPORT,
            "Manual preparation through a BibTeX file",
            false,
            F::PrepMan(prep_man::factory),
        ),
        endpoint(
            dedupe::DEDUPE,
            "Identifier blocking and fuzzy matching",
            true,
            F::Dedupe(dedupe::factory),
        ),
        endpoint(
            prescreen::SCOPE_PRESCREEN,
            "Exclude records outside years, languages or entrytypes",
            true,
            F::Prescreen(prescreen::scope_factory),
        ),
        endpoint(
            prescreen::PRESCREEN_TABLE,
            "Prescreen through a CSV table",
            false,
            F::Prescreen(prescreen::table_factory),
        ),
        endpoint(
            prescreen::CONDITIONAL_PRESCREEN,
            "Include every record",
            true,
            F::Prescreen(prescreen::conditional_factory),
        ),
        endpoint(
            pdf::LOCAL_PDFS,
            "PDFs from a local directory",
            true,
            F::PdfGet(pdf::local_pdfs_factory),
        ),
        endpoint(
            pdf::PDF_GET_MAN,
            "Pick up PDFs placed by hand",
            false,
            F::PdfGetMan(pdf::pdf_get_man_factory),
        ),
        endpoint(pdf::PDF_CHECK, "Check PDF files", true, F::PdfPrep(pdf::pdf_check_factory)),
        endpoint(
            pdf::PDF_PREP_MAN,
            "Accept PDFs fixed by hand",
            false,
            F::PdfPrepMan(pdf::pdf_prep_man_factory),
        ),
        endpoint(
            screen::SCREEN_TABLE,
            "Screen through a CSV table",
            false,
            F::Screen(screen::factory),
        ),
        endpoint(
            data::BIBLIOGRAPHY_EXPORT,
            "BibTeX bibliography of included records",
            true,
            F::Data(data::bibliography_factory),
        ),
        endpoint(data::PRISMA, "PRISMA flow counts", true, F::Data(data::prisma_factory)),
    ];

    PackageManifest {
        name: PACKAGE,
        group: ENDPOINT_GROUP,
        endpoints,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use litscope_core::EndpointRegistry;

    #[test]
    fn every_builtin_endpoint_is_discovered() {
        let manifest = manifest();
        let count = manifest.endpoints.len();
        let registry = EndpointRegistry::discover(vec![manifest]);
        assert!(registry.discovery_errors().is_empty(), "{:?}", registry.discovery_errors());
        assert_eq!(registry.descriptors().count(), count);
        assert_eq!(registry.identifiers_for(Capability::Prescreen).len(), 3);
    }

    #[test]
    fn bib_files_rank_the_bibtex_source_first() {
        let registry = EndpointRegistry::discover(vec![manifest()]);
        let ranked = registry.heuristic_search_sources(std::path::Path::new("wos.bib"), "@article{A, title={T}}");
        assert_eq!(ranked.first().map(|(id, _)| *id), Some(bibtex_source::BIBTEX));
    }
}
