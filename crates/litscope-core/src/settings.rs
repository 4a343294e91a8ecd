//! Project settings stored in `settings.toml` at the project root.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{LitscopeError, Result};
use crate::quality::DefectPolicy;
use crate::state::Stage;

/// One configured endpoint: its dotted identifier plus free parameters that
/// are bound to the endpoint's own settings type at instantiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageEndpoint {
    pub endpoint: String,
    #[serde(flatten)]
    pub params: toml::Table,
}

impl PackageEndpoint {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            params: toml::Table::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<toml::Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SearchType {
    Api,
    Db,
    Md,
    Toc,
    ForwardSearch,
    BackwardSearch,
    Other,
}

impl SearchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "API",
            Self::Db => "DB",
            Self::Md => "MD",
            Self::Toc => "TOC",
            Self::ForwardSearch => "FORWARD_SEARCH",
            Self::BackwardSearch => "BACKWARD_SEARCH",
            Self::Other => "OTHER",
        }
    }
}

impl fmt::Display for SearchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchType {
    type Err = LitscopeError;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_uppercase().replace('-', "_");
        [
            Self::Api,
            Self::Db,
            Self::Md,
            Self::Toc,
            Self::ForwardSearch,
            Self::BackwardSearch,
            Self::Other,
        ]
        .into_iter()
        .find(|t| t.as_str() == upper)
        .ok_or_else(|| LitscopeError::InvalidQuery(format!("unknown search type '{s}'")))
    }
}

/// A search source: one feed file produced by one SearchSource endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSourceSettings {
    pub endpoint: String,
    /// Feed file, relative to the project root.
    pub filename: PathBuf,
    pub search_type: SearchType,
    #[serde(default)]
    pub search_parameters: toml::Table,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl SearchSourceSettings {
    /// Feed name used as origin prefix (`feed-1` for `data/search/feed-1.bib`).
    pub fn feed_name(&self) -> String {
        self.filename
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShareStatReq {
    #[default]
    None,
    Processed,
    Screened,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectSettings {
    pub title: String,
    pub review_type: String,
    pub id_pattern: String,
    pub share_stat_req: ShareStatReq,
    pub is_curated_masterdata_repo: bool,
    pub is_curated_repo: bool,
    /// Admit records on manual branches when checking process order.
    pub allow_parallel_stages: bool,
    pub colrev_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrepRound {
    pub name: String,
    pub prep_package_endpoints: Vec<PackageEndpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrepSettings {
    pub defect_policy: DefectPolicy,
    pub prep_rounds: Vec<PrepRound>,
    pub prep_man_package_endpoints: Vec<PackageEndpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupeSettings {
    /// Origin prefixes whose masterdata wins merges, most preferred first.
    pub preferred_masterdata_sources: Vec<String>,
    pub dedupe_package_endpoints: Vec<PackageEndpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrescreenSettings {
    pub explanation: String,
    pub criteria: String,
    pub prescreen_package_endpoints: Vec<PackageEndpoint>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PdfPathType {
    Symlink,
    #[default]
    Copy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PdfGetSettings {
    pub pdf_required_for_screen_and_synthesis: bool,
    pub pdf_path_type: PdfPathType,
    pub pdf_get_package_endpoints: Vec<PackageEndpoint>,
    pub pdf_get_man_package_endpoints: Vec<PackageEndpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PdfPrepSettings {
    pub pdf_prep_package_endpoints: Vec<PackageEndpoint>,
    pub pdf_prep_man_package_endpoints: Vec<PackageEndpoint>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionType {
    #[default]
    InclusionCriterion,
    ExclusionCriterion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenCriterion {
    pub explanation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default)]
    pub criterion_type: CriterionType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    pub criteria: BTreeMap<String, ScreenCriterion>,
    pub screen_package_endpoints: Vec<PackageEndpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSettings {
    pub data_package_endpoints: Vec<PackageEndpoint>,
}

/// Root project settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub project: ProjectSettings,
    pub sources: Vec<SearchSourceSettings>,
    pub prep: PrepSettings,
    pub dedupe: DedupeSettings,
    pub prescreen: PrescreenSettings,
    pub pdf_get: PdfGetSettings,
    pub pdf_prep: PdfPrepSettings,
    pub screen: ScreenSettings,
    pub data: DataSettings,
}

// ─── Defaults ──────────────────────────────────────────────

impl Default for Settings {
    fn default() -> Self {
        Self {
            project: ProjectSettings::default(),
            sources: Vec::new(),
            prep: PrepSettings::default(),
            dedupe: DedupeSettings::default(),
            prescreen: PrescreenSettings::default(),
            pdf_get: PdfGetSettings::default(),
            pdf_prep: PdfPrepSettings::default(),
            screen: ScreenSettings::default(),
            data: DataSettings::default(),
        }
    }
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            title: "Literature review".to_string(),
            review_type: "colrev.literature_review".to_string(),
            id_pattern: "author_year".to_string(),
            share_stat_req: ShareStatReq::None,
            is_curated_masterdata_repo: false,
            is_curated_repo: false,
            allow_parallel_stages: false,
            colrev_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl Default for PrepRound {
    fn default() -> Self {
        Self {
            name: "prep".to_string(),
            prep_package_endpoints: Vec::new(),
        }
    }
}

impl Default for PrepSettings {
    fn default() -> Self {
        Self {
            defect_policy: DefectPolicy::Retain,
            prep_rounds: Vec::new(),
            prep_man_package_endpoints: Vec::new(),
        }
    }
}

impl Default for DedupeSettings {
    fn default() -> Self {
        Self {
            preferred_masterdata_sources: Vec::new(),
            dedupe_package_endpoints: Vec::new(),
        }
    }
}

impl Default for PrescreenSettings {
    fn default() -> Self {
        Self {
            explanation: String::new(),
            criteria: String::new(),
            prescreen_package_endpoints: Vec::new(),
        }
    }
}

impl Default for PdfGetSettings {
    fn default() -> Self {
        Self {
            pdf_required_for_screen_and_synthesis: true,
            pdf_path_type: PdfPathType::Copy,
            pdf_get_package_endpoints: Vec::new(),
            pdf_get_man_package_endpoints: Vec::new(),
        }
    }
}

impl Default for PdfPrepSettings {
    fn default() -> Self {
        Self {
            pdf_prep_package_endpoints: Vec::new(),
            pdf_prep_man_package_endpoints: Vec::new(),
        }
    }
}

impl Default for ScreenSettings {
    fn default() -> Self {
        Self {
            explanation: None,
            criteria: BTreeMap::new(),
            screen_package_endpoints: Vec::new(),
        }
    }
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            data_package_endpoints: Vec::new(),
        }
    }
}

// ─── Load / Save ───────────────────────────────────────────

impl Settings {
    /// Loads settings. Unlike the user config, a missing file is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            let root = path.parent().unwrap_or(path);
            return Err(LitscopeError::ProjectNotFound(root.display().to_string()));
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Enabled endpoints of a stage in execution order. Search and load are
    /// driven by `sources` instead.
    pub fn stage_endpoints(&self, stage: Stage) -> Vec<&PackageEndpoint> {
        match stage {
            Stage::Search | Stage::Load => Vec::new(),
            Stage::Prep => self
                .prep
                .prep_rounds
                .iter()
                .flat_map(|round| round.prep_package_endpoints.iter())
                .collect(),
            Stage::PrepMan => self.prep.prep_man_package_endpoints.iter().collect(),
            Stage::Dedupe => self.dedupe.dedupe_package_endpoints.iter().collect(),
            Stage::Prescreen => self.prescreen.prescreen_package_endpoints.iter().collect(),
            Stage::PdfGet => self.pdf_get.pdf_get_package_endpoints.iter().collect(),
            Stage::PdfGetMan => self.pdf_get.pdf_get_man_package_endpoints.iter().collect(),
            Stage::PdfPrep => self.pdf_prep.pdf_prep_package_endpoints.iter().collect(),
            Stage::PdfPrepMan => self.pdf_prep.pdf_prep_man_package_endpoints.iter().collect(),
            Stage::Screen => self.screen.screen_package_endpoints.iter().collect(),
            Stage::Data => self.data.data_package_endpoints.iter().collect(),
        }
    }

    pub fn source_by_filename(&self, filename: &Path) -> Option<&SearchSourceSettings> {
        self.sources.iter().find(|s| s.filename == filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn sample() -> Settings {
        let mut settings = Settings::default();
        settings.sources.push(SearchSourceSettings {
            endpoint: "colrev.crossref".to_string(),
            filename: PathBuf::from("data/search/crossref.json"),
            search_type: SearchType::Api,
            search_parameters: toml::Table::from_iter([(
                "query".to_string(),
                toml::Value::from("digital platforms"),
            )]),
            comment: None,
        });
        settings.prep.prep_rounds.push(PrepRound {
            name: "polish".to_string(),
            prep_package_endpoints: vec![PackageEndpoint::new("colrev.journal_polish")
                .with_param("abbreviations", toml::Table::from_iter([(
                    "MISQ".to_string(),
                    toml::Value::from("MIS Quarterly"),
                )]))],
        });
        settings.screen.criteria.insert(
            "focus".to_string(),
            ScreenCriterion {
                explanation: "Studies digital platforms".to_string(),
                comment: None,
                criterion_type: CriterionType::InclusionCriterion,
            },
        );
        settings
    }

    #[test]
    fn settings_toml_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.toml");
        let settings = sample();
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.sources, settings.sources);
        assert_eq!(loaded.prep.prep_rounds, settings.prep.prep_rounds);
        assert_eq!(loaded.screen.criteria, settings.screen.criteria);
        assert!(loaded.pdf_get.pdf_required_for_screen_and_synthesis);
    }

    #[test]
    fn missing_settings_is_project_not_found() {
        let dir = TempDir::new().unwrap();
        let err = Settings::load(&dir.path().join("settings.toml")).unwrap_err();
        assert!(matches!(err, LitscopeError::ProjectNotFound(_)));
    }

    #[test]
    fn endpoint_params_are_flattened() {
        let toml_str = r#"
            [[dedupe.dedupe_package_endpoints]]
            endpoint = "colrev.dedupe"
            title_threshold = 0.9
        "#;
        let settings: Settings = toml::from_str(toml_str).unwrap();
        let endpoints = settings.stage_endpoints(Stage::Dedupe);
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].endpoint, "colrev.dedupe");
        assert_eq!(
            endpoints[0].params.get("title_threshold"),
            Some(&toml::Value::Float(0.9))
        );
    }

    #[test]
    fn feed_name_is_file_stem() {
        let settings = sample();
        assert_eq!(settings.sources[0].feed_name(), "crossref");
        assert_eq!("forward-search".parse::<SearchType>().unwrap(), SearchType::ForwardSearch);
    }
}
