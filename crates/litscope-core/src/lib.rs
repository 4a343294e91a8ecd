//! Litscope core: records, lifecycle, git-backed dataset, operations,
//! endpoint registry, search feeds and the pipeline driver.

pub mod config;
pub mod driver;
pub mod endpoints;
pub mod error;
pub mod feed;
pub mod logging;
pub mod models;
pub mod operation;
pub mod quality;
pub mod registry;
pub mod settings;
pub mod state;
pub mod storage;

pub use config::UserConfig;
pub use driver::{EndpointFailure, PipelineDriver, SkipSummary, StageReport};
pub use error::{ExitCode, LitscopeError, PreconditionViolation, Result};
pub use feed::{FeedHandle, FeedPager, FeedUpdate, KeyCase, Page, PageRequest, Pagination, SearchFeed, SearchSummary};
pub use models::*;
pub use operation::{CancellationFlag, Operation, OperationOptions};
pub use quality::{DefectCode, DefectPolicy, QualityModel};
pub use registry::{
    Capability, EndpointDescriptor, EndpointFactory, EndpointRegistry, PackageManifest, Requirement,
    ENDPOINT_GROUP,
};
pub use settings::{PackageEndpoint, SearchSourceSettings, SearchType, Settings};
pub use state::{RecordState, Stage};
pub use storage::{init_project, Dataset, GitRepo, InitOptions, ProjectRoot, StatusReport};
