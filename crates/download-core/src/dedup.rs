//! Name-based deduplication against files already in local storage.

use crate::transport::FolderListingItem;
use std::collections::HashSet;

/// Snapshot of the filenames present in local storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalFileSet {
    names: HashSet<String>,
}

impl LocalFileSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for LocalFileSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            names: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// Returns false iff a local file already carries exactly `item.name`.
///
/// Case-sensitive name equality only; contents are never compared.
pub fn should_download(item: &FolderListingItem, local: &LocalFileSet) -> bool {
    !local.contains(&item.name)
}
