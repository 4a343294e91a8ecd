pub mod bibtex;
pub mod table;
