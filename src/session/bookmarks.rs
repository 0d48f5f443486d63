//! Bookmarks: opaque tokens naming a point in the database's history.

use std::collections::BTreeSet;

/// The bookmarks a session waits for before running its next transaction.
///
/// The set only grows: every committed bookmark is added to what the session
/// already holds, so the next transaction waits for all of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bookmarks {
    values: BTreeSet<String>,
}

impl Bookmarks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn contains(&self, bookmark: &str) -> bool {
        self.values.contains(bookmark)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(String::as_str)
    }

    /// The bookmarks in the order they are sent to the server.
    pub fn to_vec(&self) -> Vec<String> {
        self.values.iter().cloned().collect()
    }

    /// Adds the bookmark of a just-finished transaction.
    pub fn advance(&mut self, bookmark: impl Into<String>) {
        let bookmark = bookmark.into();
        if !bookmark.is_empty() {
            self.values.insert(bookmark);
        }
    }

    /// Adds `other`'s bookmarks, e.g. to chain work from several sessions.
    pub fn merge(&mut self, other: &Bookmarks) {
        self.values.extend(other.values.iter().cloned());
    }
}

impl<S: Into<String>> FromIterator<S> for Bookmarks {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(Into::into)
                .filter(|b: &String| !b.is_empty())
                .collect(),
        }
    }
}

impl IntoIterator for Bookmarks {
    type Item = String;
    type IntoIter = std::collections::btree_set::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_accumulates() {
        let mut bookmarks: Bookmarks = ["a", "b"].into_iter().collect();
        assert_eq!(bookmarks.len(), 2);
        bookmarks.advance("c");
        assert_eq!(bookmarks.to_vec(), vec!["a", "b", "c"]);
        bookmarks.advance("");
        bookmarks.advance("c");
        assert_eq!(bookmarks.len(), 3);
    }

    #[test]
    fn merge_is_a_union() {
        let mut left: Bookmarks = ["a", "b"].into_iter().collect();
        let right: Bookmarks = ["b", "c", ""].into_iter().collect();
        left.merge(&right);
        assert_eq!(left.to_vec(), vec!["a", "b", "c"]);
    }
}
