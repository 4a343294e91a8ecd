pub mod fields;
pub mod ids;
pub mod merge;
pub mod provenance;
pub mod record;

pub use ids::IdSetter;
pub use merge::{preference_rank, MergeOptions, SourceAuthority};
pub use provenance::{FieldProvenance, ProvenanceMap};
pub use record::{FieldEdit, Record, RecordMap};
