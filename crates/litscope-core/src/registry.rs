//! Endpoint discovery and instantiation by dotted identifier.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::endpoints::{
    DataEndpoint, DedupeEndpoint, PdfGetEndpoint, PdfGetManEndpoint, PdfPrepEndpoint,
    PdfPrepManEndpoint, PrepEndpoint, PrepManEndpoint, PrescreenEndpoint, ReviewTypeEndpoint,
    ScreenEndpoint, SearchSourceEndpoint,
};
use crate::error::{LitscopeError, Result};
use crate::settings::SearchType;
use crate::state::Stage;

/// Plugin group whose manifests are accepted.
pub const ENDPOINT_GROUP: &str = "colrev";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ReviewType,
    SearchSource,
    Prep,
    PrepMan,
    Dedupe,
    Prescreen,
    PdfGet,
    PdfGetMan,
    PdfPrep,
    PdfPrepMan,
    Screen,
    Data,
}

impl Capability {
    pub fn for_stage(stage: Stage) -> Self {
        match stage {
            Stage::Search | Stage::Load => Self::SearchSource,
            Stage::Prep => Self::Prep,
            Stage::PrepMan => Self::PrepMan,
            Stage::Dedupe => Self::Dedupe,
            Stage::Prescreen => Self::Prescreen,
            Stage::PdfGet => Self::PdfGet,
            Stage::PdfGetMan => Self::PdfGetMan,
            Stage::PdfPrep => Self::PdfPrep,
            Stage::PdfPrepMan => Self::PdfPrepMan,
            Stage::Screen => Self::Screen,
            Stage::Data => Self::Data,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ReviewType => "review_type",
            Self::SearchSource => "search_source",
            Self::Prep => "prep",
            Self::PrepMan => "prep_man",
            Self::Dedupe => "dedupe",
            Self::Prescreen => "prescreen",
            Self::PdfGet => "pdf_get",
            Self::PdfGetMan => "pdf_get_man",
            Self::PdfPrep => "pdf_prep",
            Self::PdfPrepMan => "pdf_prep_man",
            Self::Screen => "screen",
            Self::Data => "data",
        };
        f.write_str(s)
    }
}

/// Constructor of an endpoint from its parameter table.
pub type Factory<T> = fn(&toml::Table) -> Result<T>;

/// Constructor tagged with the capability it yields.
#[derive(Clone, Copy)]
pub enum EndpointFactory {
    ReviewType(Factory<Box<dyn ReviewTypeEndpoint>>),
    SearchSource(Factory<Arc<dyn SearchSourceEndpoint>>),
    Prep(Factory<Box<dyn PrepEndpoint>>),
    PrepMan(Factory<Box<dyn PrepManEndpoint>>),
    Dedupe(Factory<Box<dyn DedupeEndpoint>>),
    Prescreen(Factory<Box<dyn PrescreenEndpoint>>),
    PdfGet(Factory<Box<dyn PdfGetEndpoint>>),
    PdfGetMan(Factory<Box<dyn PdfGetManEndpoint>>),
    PdfPrep(Factory<Box<dyn PdfPrepEndpoint>>),
    PdfPrepMan(Factory<Box<dyn PdfPrepManEndpoint>>),
    Screen(Factory<Box<dyn ScreenEndpoint>>),
    Data(Factory<Box<dyn DataEndpoint>>),
}

impl EndpointFactory {
    pub fn capability(&self) -> Capability {
        match self {
            Self::ReviewType(_) => Capability::ReviewType,
            Self::SearchSource(_) => Capability::SearchSource,
            Self::Prep(_) => Capability::Prep,
            Self::PrepMan(_) => Capability::PrepMan,
            Self::Dedupe(_) => Capability::Dedupe,
            Self::Prescreen(_) => Capability::Prescreen,
            Self::PdfGet(_) => Capability::PdfGet,
            Self::PdfGetMan(_) => Capability::PdfGetMan,
            Self::PdfPrep(_) => Capability::PdfPrep,
            Self::PdfPrepMan(_) => Capability::PdfPrepMan,
            Self::Screen(_) => Capability::Screen,
            Self::Data(_) => Capability::Data,
        }
    }
}

impl fmt::Debug for EndpointFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EndpointFactory({})", self.capability())
    }
}

/// Something an endpoint needs from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Executable(&'static str),
    EnvVar(&'static str),
}

impl Requirement {
    pub fn is_met(&self) -> bool {
        match self {
            Self::Executable(name) => executable_on_path(name),
            Self::EnvVar(name) => std::env::var(name).is_ok_and(|v| !v.is_empty()),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Executable(name) => write!(f, "executable '{name}'"),
            Self::EnvVar(name) => write!(f, "environment variable {name}"),
        }
    }
}

fn executable_on_path(name: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| {
        let candidate = dir.join(name);
        candidate.is_file() || candidate.with_extension("exe").is_file()
    })
}

/// What an endpoint declares about itself.
#[derive(Debug, Clone)]
pub struct EndpointDescriptor {
    pub identifier: &'static str,
    pub capability: Capability,
    pub description: &'static str,
    /// Safe to run unattended.
    pub ci_supported: bool,
    pub search_types: &'static [SearchType],
    pub requirements: Vec<Requirement>,
    pub factory: EndpointFactory,
}

/// A set of endpoints shipped together.
#[derive(Debug, Clone)]
pub struct PackageManifest {
    pub name: &'static str,
    pub group: &'static str,
    pub endpoints: Vec<EndpointDescriptor>,
}

/// A problem found while discovering endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryError {
    pub package: String,
    pub endpoint: String,
    pub message: String,
}

impl fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}: {}", self.package, self.endpoint, self.message)
    }
}

/// Binds an endpoint's parameter table to its settings type. Unknown keys
/// are rejected when the type denies them; missing keys take the type's
/// defaults.
pub fn bind_settings<S: DeserializeOwned>(endpoint: &str, params: &toml::Table) -> Result<S> {
    toml::Value::Table(params.clone())
        .try_into::<S>()
        .map_err(|e| LitscopeError::PackageParameter {
            endpoint: endpoint.to_string(),
            message: e.to_string().trim().to_string(),
        })
}

/// Registered endpoints keyed by identifier.
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    endpoints: BTreeMap<&'static str, EndpointDescriptor>,
    errors: Vec<DiscoveryError>,
}

macro_rules! instantiate_fn {
    ($(#[$doc:meta])* $name:ident, $variant:ident, $out:ty) => {
        $(#[$doc])*
        pub fn $name(&self, identifier: &str, params: &toml::Table) -> Result<$out> {
            match self.descriptor(identifier)?.factory {
                EndpointFactory::$variant(factory) => factory(params),
                _ => Err(LitscopeError::CapabilityMismatch(identifier.to_string())),
            }
        }
    };
}

impl EndpointRegistry {
    /// Registers every endpoint of every manifest in the `colrev` group.
    ///
    /// Endpoints with unmet requirements, a factory that contradicts the
    /// declared capability, or a duplicate identifier are left out and
    /// reported through [`EndpointRegistry::discovery_errors`].
    pub fn discover(manifests: Vec<PackageManifest>) -> Self {
        let mut registry = Self::default();
        for manifest in manifests {
            if manifest.group != ENDPOINT_GROUP {
                debug!(package = manifest.name, group = manifest.group, "ignoring package");
                continue;
            }
            for descriptor in manifest.endpoints {
                if let Err(message) = registry.validate(&descriptor) {
                    warn!(package = manifest.name, endpoint = descriptor.identifier, "{message}");
                    registry.errors.push(DiscoveryError {
                        package: manifest.name.to_string(),
                        endpoint: descriptor.identifier.to_string(),
                        message,
                    });
                    continue;
                }
                registry.endpoints.insert(descriptor.identifier, descriptor);
            }
        }
        registry
    }

    fn validate(&self, descriptor: &EndpointDescriptor) -> std::result::Result<(), String> {
        if self.endpoints.contains_key(descriptor.identifier) {
            return Err("duplicate endpoint identifier".to_string());
        }
        if !descriptor.identifier.contains('.') {
            return Err("identifier must be dotted".to_string());
        }
        if descriptor.factory.capability() != descriptor.capability {
            return Err(LitscopeError::CapabilityMismatch(descriptor.identifier.to_string()).to_string());
        }
        if let Some(missing) = descriptor.requirements.iter().find(|r| !r.is_met()) {
            return Err(LitscopeError::MissingDependency {
                endpoint: descriptor.identifier.to_string(),
                requirement: missing.to_string(),
            }
            .to_string());
        }
        Ok(())
    }

    pub fn discovery_errors(&self) -> &[DiscoveryError] {
        &self.errors
    }

    pub fn descriptor(&self, identifier: &str) -> Result<&EndpointDescriptor> {
        if let Some(descriptor) = self.endpoints.get(identifier) {
            return Ok(descriptor);
        }
        match self.errors.iter().find(|e| e.endpoint == identifier) {
            Some(err) => Err(LitscopeError::MissingDependency {
                endpoint: identifier.to_string(),
                requirement: err.message.clone(),
            }),
            None => Err(LitscopeError::UnknownEndpoint(identifier.to_string())),
        }
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.endpoints.contains_key(identifier)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &EndpointDescriptor> {
        self.endpoints.values()
    }

    pub fn identifiers_for(&self, capability: Capability) -> Vec<&'static str> {
        self.endpoints
            .values()
            .filter(|d| d.capability == capability)
            .map(|d| d.identifier)
            .collect()
    }

    instantiate_fn!(review_type, ReviewType, Box<dyn ReviewTypeEndpoint>);
    instantiate_fn!(search_source, SearchSource, Arc<dyn SearchSourceEndpoint>);
    instantiate_fn!(prep, Prep, Box<dyn PrepEndpoint>);
    instantiate_fn!(prep_man, PrepMan, Box<dyn PrepManEndpoint>);
    instantiate_fn!(dedupe, Dedupe, Box<dyn DedupeEndpoint>);
    instantiate_fn!(prescreen, Prescreen, Box<dyn PrescreenEndpoint>);
    instantiate_fn!(pdf_get, PdfGet, Box<dyn PdfGetEndpoint>);
    instantiate_fn!(pdf_get_man, PdfGetMan, Box<dyn PdfGetManEndpoint>);
    instantiate_fn!(pdf_prep, PdfPrep, Box<dyn PdfPrepEndpoint>);
    instantiate_fn!(pdf_prep_man, PdfPrepMan, Box<dyn PdfPrepManEndpoint>);
    instantiate_fn!(screen, Screen, Box<dyn ScreenEndpoint>);
    instantiate_fn!(data, Data, Box<dyn DataEndpoint>);

    /// SearchSource endpoints ranked by their confidence that `filename`
    /// belongs to them. Zero-confidence candidates are dropped.
    pub fn heuristic_search_sources(&self, filename: &Path, content: &str) -> Vec<(&'static str, f64)> {
        let mut ranked: Vec<(&'static str, f64)> = self
            .endpoints
            .values()
            .filter_map(|d| match d.factory {
                EndpointFactory::SearchSource(factory) => factory(&toml::Table::new())
                    .ok()
                    .map(|endpoint| (d.identifier, endpoint.heuristic(filename, content).clamp(0.0, 1.0))),
                _ => None,
            })
            .filter(|(_, confidence)| *confidence > 0.0)
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::record::Record;
    use crate::operation::Operation;
    use crate::endpoints::PrepContext;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, Default)]
    #[serde(default, deny_unknown_fields)]
    struct UpperSettings {
        field: String,
    }

    struct Upper {
        settings: UpperSettings,
    }

    impl PrepEndpoint for Upper {
        fn prepare(&self, _ctx: &PrepContext<'_>, record: &mut Record) -> Result<()> {
            if let Some(v) = record.get(&self.settings.field).map(str::to_uppercase) {
                record.update_field(&self.settings.field, v, "test.upper");
            }
            Ok(())
        }
    }

    struct Noop;

    impl PrepManEndpoint for Noop {
        fn prepare_manual(&self, _op: &Operation<'_>, _records: &mut crate::models::record::RecordMap) -> Result<()> {
            Ok(())
        }
    }

    fn upper_factory(params: &toml::Table) -> Result<Box<dyn PrepEndpoint>> {
        let settings: UpperSettings = bind_settings("test.upper", params)?;
        Ok(Box::new(Upper { settings }))
    }

    fn noop_factory(_: &toml::Table) -> Result<Box<dyn PrepManEndpoint>> {
        Ok(Box::new(Noop))
    }

    fn descriptor(id: &'static str, capability: Capability, factory: EndpointFactory) -> EndpointDescriptor {
        EndpointDescriptor {
            identifier: id,
            capability,
            description: "",
            ci_supported: true,
            search_types: &[],
            requirements: Vec::new(),
            factory,
        }
    }

    fn manifest(endpoints: Vec<EndpointDescriptor>) -> PackageManifest {
        PackageManifest {
            name: "test",
            group: ENDPOINT_GROUP,
            endpoints,
        }
    }

    #[test]
    fn discovery_reports_problems_without_aborting() {
        let mut missing = descriptor("test.needs_tool", Capability::PrepMan, EndpointFactory::PrepMan(noop_factory));
        missing.requirements.push(Requirement::Executable("litscope-definitely-not-installed"));

        let registry = EndpointRegistry::discover(vec![manifest(vec![
            descriptor("test.upper", Capability::Prep, EndpointFactory::Prep(upper_factory)),
            descriptor("test.mismatch", Capability::Prep, EndpointFactory::PrepMan(noop_factory)),
            missing,
        ])]);

        assert!(registry.contains("test.upper"));
        assert!(!registry.contains("test.mismatch"));
        assert_eq!(registry.discovery_errors().len(), 2);
        assert!(matches!(
            registry.descriptor("test.needs_tool"),
            Err(LitscopeError::MissingDependency { .. })
        ));
        assert!(matches!(
            registry.descriptor("test.unknown"),
            Err(LitscopeError::UnknownEndpoint(_))
        ));
    }

    #[test]
    fn settings_binding_rejects_unknown_keys() {
        let registry = EndpointRegistry::discover(vec![manifest(vec![descriptor(
            "test.upper",
            Capability::Prep,
            EndpointFactory::Prep(upper_factory),
        )])]);

        let ok = toml::Table::from_iter([("field".to_string(), toml::Value::from("title"))]);
        assert!(registry.prep("test.upper", &ok).is_ok());
        assert!(registry.prep("test.upper", &toml::Table::new()).is_ok());

        let bad = toml::Table::from_iter([("colour".to_string(), toml::Value::from("red"))]);
        assert!(matches!(
            registry.prep("test.upper", &bad),
            Err(LitscopeError::PackageParameter { .. })
        ));
        assert!(matches!(
            registry.prep_man("test.upper", &ok),
            Err(LitscopeError::CapabilityMismatch(_))
        ));
    }

    #[test]
    fn foreign_groups_are_ignored() {
        let mut other = manifest(vec![descriptor(
            "other.upper",
            Capability::Prep,
            EndpointFactory::Prep(upper_factory),
        )]);
        other.group = "elsewhere";
        let registry = EndpointRegistry::discover(vec![other]);
        assert_eq!(registry.descriptors().count(), 0);
    }
}
