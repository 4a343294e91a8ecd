//! Litscope Science — identifiers, BibTeX, Crossref and the built-in endpoints.

pub mod error;
pub mod http;
pub mod identifiers;
pub mod formats;
pub mod dedup;
pub mod sources;
pub mod endpoints;

use std::sync::Arc;

use litscope_core::{EndpointRegistry, PackageManifest};

pub use error::{Result, ScienceError};
pub use dedup::{DuplicateFinder, DuplicateGroup, DedupStrategy};
pub use identifiers::{Doi, Isbn};

/// Manifest of the endpoints shipped with this crate.
pub fn builtin_manifest() -> PackageManifest {
    endpoints::manifest()
}

/// Registry holding the built-in endpoints.
pub fn builtin_registry() -> Arc<EndpointRegistry> {
    Arc::new(EndpointRegistry::discover(vec![builtin_manifest()]))
}
