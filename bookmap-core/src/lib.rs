// Bookmap Core Library
//
// Discovers the division structure of a print-formatted Arabic book from its
// normalized pages and source markup, then cuts it into passages for the
// extraction stage.

pub mod types;
pub mod error;
pub mod text;
pub mod vocabulary;
pub mod config;
pub mod sources;
pub mod rules;
pub mod oracle;
pub mod tree;
pub mod passages;
pub mod overrides;
pub mod report;
pub mod storage;
pub mod cache;
pub mod processor;

// Re-export main types and functions for easy use
pub use types::*;
pub use config::StructureConfig;
pub use error::{PreflightError, SourceError};
pub use oracle::{HttpOracle, ScriptedOracle, StructureOracle};
pub use overrides::OverrideFile;
pub use processor::{BookInput, StructureOutput, StructureProcessor};
pub use tree::DivisionTree;
