pub mod dataset;
pub mod git;
pub mod init;
pub mod project_root;
pub mod status;

pub use dataset::{Dataset, RecordHeader, RecordHistory};
pub use git::{GitIdentity, GitRepo};
pub use init::{init_project, InitOptions};
pub use project_root::ProjectRoot;
pub use status::StatusReport;
