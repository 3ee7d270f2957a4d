//! Notebook documents on disk.
//!
//! ```json
//! { "cells": [ { "kind": "code", "language": "sql", "value": "SELECT 1", "metadata": {} } ] }
//! ```

use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use cellflow_core::{Cell, CellKind, CellMetadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentCellKind {
    Code,
    Markup,
}

#[derive(Debug, Deserialize)]
pub struct DocumentCell {
    pub kind: DocumentCellKind,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub metadata: CellMetadata,
}

#[derive(Debug, Deserialize)]
pub struct NotebookDocument {
    #[serde(default)]
    pub cells: Vec<DocumentCell>,
}

impl NotebookDocument {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Convert code cells to engine cells, keeping document positions as
    /// indices.
    pub fn into_cells(self) -> anyhow::Result<Vec<Cell>> {
        let mut cells = Vec::new();
        for (index, doc) in self.cells.into_iter().enumerate() {
            if doc.kind == DocumentCellKind::Markup {
                continue;
            }
            let kind = CellKind::from_language(&doc.language).ok_or_else(|| {
                anyhow::anyhow!(
                    "Cell {} has unsupported language '{}' (expected sql, json or javascript)",
                    index,
                    doc.language
                )
            })?;
            cells.push(Cell::new(index, kind, doc.value).with_metadata(doc.metadata));
        }
        Ok(cells)
    }
}

/// Load the code cells of the notebook at `path`.
pub fn load(path: &Path) -> anyhow::Result<Vec<Cell>> {
    if !path.exists() {
        anyhow::bail!("Notebook not found: {}", path.display());
    }
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    NotebookDocument::parse(&text)
        .with_context(|| format!("Invalid notebook {}", path.display()))?
        .into_cells()
}

/// Keep cells whose index lies within `from..=to`.
pub fn select_range(cells: Vec<Cell>, from: Option<usize>, to: Option<usize>) -> Vec<Cell> {
    cells
        .into_iter()
        .filter(|cell| from.is_none_or(|from| cell.index >= from))
        .filter(|cell| to.is_none_or(|to| cell.index <= to))
        .collect()
}
