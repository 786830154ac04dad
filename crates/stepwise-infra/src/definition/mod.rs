//! Definition document storage.

pub mod json_file;

pub use json_file::JsonFileDefinitionRepository;
