use super::division_tree::DivisionTree;
use crate::types::*;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// On-disk form of a division tree: `divisions.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DivisionsArtifact {
    pub schema_version: String,
    pub book: BookMetadata,
    pub first_seq_index: usize,
    pub last_seq_index: usize,
    #[serde(default)]
    pub toc_entries: Vec<TocEntry>,
    pub divisions: Vec<DivisionNode>,
}

impl DivisionTree {
    pub fn to_artifact(&self, book: &BookMetadata, toc_entries: &[TocEntry]) -> DivisionsArtifact {
        DivisionsArtifact {
            schema_version: SCHEMA_VERSION.to_string(),
            book: book.clone(),
            first_seq_index: self.first_seq,
            last_seq_index: self.last_seq,
            toc_entries: toc_entries.to_vec(),
            divisions: self.nodes.clone(),
        }
    }

    pub fn save_to_json(&self, path: &Path, book: &BookMetadata, toc_entries: &[TocEntry]) -> Result<()> {
        self.to_artifact(book, toc_entries).save_to_json(path)
    }
}

impl DivisionsArtifact {
    pub fn save_to_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write divisions artifact {}", path.display()))?;
        Ok(())
    }

    pub fn load_from_json(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read divisions artifact {}", path.display()))?;
        let artifact: DivisionsArtifact = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse divisions artifact {}", path.display()))?;
        artifact.validate()?;
        Ok(artifact)
    }

    fn validate(&self) -> Result<()> {
        let major = |v: &str| v.split('.').next().map(str::to_string);
        if major(&self.schema_version) != major(SCHEMA_VERSION) {
            bail!(
                "Divisions artifact has schema {} but this build reads {}",
                self.schema_version,
                SCHEMA_VERSION
            );
        }
        for (index, node) in self.divisions.iter().enumerate() {
            if node.id != index {
                bail!("Division at position {} carries id {}", index, node.id);
            }
        }
        Ok(())
    }

    pub fn into_tree(self) -> (DivisionTree, BookMetadata, Vec<TocEntry>) {
        let tree = DivisionTree::new(self.divisions, (self.first_seq_index, self.last_seq_index));
        (tree, self.book, self.toc_entries)
    }
}
