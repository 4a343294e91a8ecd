//! Clients for upstream bibliographic services.

pub mod crossref;

pub use crossref::{CrossrefClient, WorksPage, WorksQuery};
