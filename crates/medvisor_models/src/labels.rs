//! Class label sets.

use std::path::Path;

use crate::error::{ModelError, Result};

/// Human-readable names for a classifier's output classes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Labels {
    names: Vec<String>,
}

impl Labels {
    /// Labels from an explicit list, indexed by class id.
    pub fn from_vec(names: Vec<String>) -> Self {
        Self { names }
    }

    /// `class_0` … `class_{n-1}`.
    pub fn generic(n: usize) -> Self {
        Self::from_vec((0..n).map(|i| format!("class_{i}")).collect())
    }

    /// Read one label per line.
    ///
    /// Blank lines are skipped. A leading WordNet id (`n01440764 tench`)
    /// is dropped.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ModelError::NotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    fn parse(text: &str) -> Self {
        let names = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| match line.split_once(' ') {
                Some((id, rest)) if is_wordnet_id(id) => rest.trim().to_string(),
                _ => line.to_string(),
            })
            .collect();
        Self { names }
    }

    /// Label for `class_id`, or `class_<id>` when there is none.
    pub fn get(&self, class_id: usize) -> String {
        self.names
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{class_id}"))
    }

    /// Number of known labels.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether no labels are known.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// All labels in class order.
    pub fn as_slice(&self) -> &[String] {
        &self.names
    }
}

fn is_wordnet_id(token: &str) -> bool {
    token.len() == 9
        && token.starts_with('n')
        && token[1..].bytes().all(|b| b.is_ascii_digit())
}
