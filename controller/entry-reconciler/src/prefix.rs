// Copyright (c) Microsoft. All rights reserved.

//! Entry-ID prefixing. A controller configured with a prefix owns exactly
//! the entries whose id starts with `<prefix>.`; everything else on the
//! server is foreign and untouched, except ids matched by the cleanup rule,
//! which are deleted unconditionally (a previous tenant being evicted).

use uuid::Uuid;

/// A prefix in stored form: the configured value with a trailing dot
/// appended when absent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryIdPrefix(String);

impl EntryIdPrefix {
    #[must_use]
    pub fn new(value: &str) -> Self {
        if value.ends_with('.') {
            EntryIdPrefix(value.to_string())
        } else {
            EntryIdPrefix(format!("{value}."))
        }
    }

    #[must_use]
    pub fn matches(&self, id: &str) -> bool {
        id.starts_with(&self.0)
    }

    #[must_use]
    pub fn generate_id(&self) -> String {
        format!("{}{}", self.0, Uuid::new_v4())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The cleanup rule: either a literal prefix, or, when configured as the
/// empty string, every id containing no dot at all.
#[derive(Clone, Debug)]
pub enum CleanupMatcher {
    Prefix(EntryIdPrefix),
    Undotted,
}

impl CleanupMatcher {
    #[must_use]
    pub fn from_config(value: &str) -> Self {
        if value.is_empty() {
            CleanupMatcher::Undotted
        } else {
            CleanupMatcher::Prefix(EntryIdPrefix::new(value))
        }
    }

    #[must_use]
    pub fn matches(&self, id: &str) -> bool {
        match self {
            CleanupMatcher::Prefix(prefix) => prefix.matches(id),
            CleanupMatcher::Undotted => !id.contains('.'),
        }
    }
}

/// How one server entry relates to this controller instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ownership {
    /// Candidate for update and delete.
    Ours,
    /// Invisible to this controller.
    Foreign,
    /// Never updated, always removed.
    DeleteOnly,
}

#[must_use]
pub fn classify(
    id: &str,
    prefix: Option<&EntryIdPrefix>,
    cleanup: Option<&CleanupMatcher>,
) -> Ownership {
    match prefix {
        None => Ownership::Ours,
        Some(prefix) if prefix.matches(id) => Ownership::Ours,
        Some(_) => match cleanup {
            Some(cleanup) if cleanup.matches(id) => Ownership::DeleteOnly,
            _ => Ownership::Foreign,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_stores_with_trailing_dot() {
        assert_eq!(EntryIdPrefix::new("blue").as_str(), "blue.");
        assert_eq!(EntryIdPrefix::new("blue.").as_str(), "blue.");
    }

    #[test]
    fn generated_ids_match_their_prefix() {
        let prefix = EntryIdPrefix::new("blue");
        let id = prefix.generate_id();
        assert!(prefix.matches(&id));
        assert!(id.len() > "blue.".len());
    }

    #[test]
    fn classification_without_prefix_owns_everything() {
        assert_eq!(classify("anything", None, None), Ownership::Ours);
        assert_eq!(classify("", None, None), Ownership::Ours);
    }

    #[test]
    fn classification_with_prefix_and_cleanup() {
        let prefix = EntryIdPrefix::new("blue");
        let cleanup = CleanupMatcher::from_config("green");

        assert_eq!(
            classify("blue.123", Some(&prefix), Some(&cleanup)),
            Ownership::Ours
        );
        assert_eq!(
            classify("green.123", Some(&prefix), Some(&cleanup)),
            Ownership::DeleteOnly
        );
        assert_eq!(
            classify("red.123", Some(&prefix), Some(&cleanup)),
            Ownership::Foreign
        );
        assert_eq!(
            classify("server-uuid", Some(&prefix), Some(&cleanup)),
            Ownership::Foreign
        );
    }

    #[test]
    fn empty_cleanup_matches_undotted_ids() {
        let prefix = EntryIdPrefix::new("blue");
        let cleanup = CleanupMatcher::from_config("");

        assert_eq!(
            classify("c7b9c2a0aa", Some(&prefix), Some(&cleanup)),
            Ownership::DeleteOnly
        );
        assert_eq!(
            classify("has.dot", Some(&prefix), Some(&cleanup)),
            Ownership::Foreign
        );
        assert_eq!(
            classify("blue.1", Some(&prefix), Some(&cleanup)),
            Ownership::Ours
        );
    }
}
