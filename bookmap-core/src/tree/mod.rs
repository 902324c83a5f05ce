pub mod builder;
pub mod division_tree;
pub mod serialization;

pub use builder::{BuildReport, ParentRef, PlannedDivision, TreeBuilder};
pub use division_tree::{DivisionTree, StabilizationReport};
pub use serialization::DivisionsArtifact;
