// Copyright (c) Microsoft. All rights reserved.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A Kubernetes-style label selector. An empty selector matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LabelSelector {
    pub match_labels: BTreeMap<String, String>,
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: String,
    pub values: Vec<String>,
}

const OPERATOR_IN: &str = "In";
const OPERATOR_NOT_IN: &str = "NotIn";
const OPERATOR_EXISTS: &str = "Exists";
const OPERATOR_DOES_NOT_EXIST: &str = "DoesNotExist";

impl LabelSelector {
    pub fn validate(&self) -> Result<(), Error> {
        for requirement in &self.match_expressions {
            if requirement.key.is_empty() {
                return Err(Error::LabelSelector("empty key".to_string()));
            }

            match requirement.operator.as_str() {
                OPERATOR_IN | OPERATOR_NOT_IN => {
                    if requirement.values.is_empty() {
                        return Err(Error::LabelSelector(format!(
                            "operator {} requires values",
                            requirement.operator
                        )));
                    }
                }
                OPERATOR_EXISTS | OPERATOR_DOES_NOT_EXIST => {
                    if !requirement.values.is_empty() {
                        return Err(Error::LabelSelector(format!(
                            "operator {} takes no values",
                            requirement.operator
                        )));
                    }
                }
                other => {
                    return Err(Error::LabelSelector(format!("unknown operator {other}")));
                }
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        for (key, value) in &self.match_labels {
            if labels.get(key) != Some(value) {
                return false;
            }
        }

        for requirement in &self.match_expressions {
            let actual = labels.get(&requirement.key);
            let matched = match requirement.operator.as_str() {
                OPERATOR_IN => actual.is_some_and(|v| requirement.values.contains(v)),
                OPERATOR_NOT_IN => !actual.is_some_and(|v| requirement.values.contains(v)),
                OPERATOR_EXISTS => actual.is_some(),
                OPERATOR_DOES_NOT_EXIST => actual.is_none(),
                _ => false,
            };
            if !matched {
                return false;
            }
        }

        true
    }

    /// The selector in Kubernetes list-parameter syntax, for server-side
    /// filtering. `None` when the selector is empty (match everything).
    #[must_use]
    pub fn selector_string(&self) -> Option<String> {
        let mut parts = Vec::new();

        for (key, value) in &self.match_labels {
            parts.push(format!("{key}={value}"));
        }

        for requirement in &self.match_expressions {
            match requirement.operator.as_str() {
                OPERATOR_IN => parts.push(format!(
                    "{} in ({})",
                    requirement.key,
                    requirement.values.join(",")
                )),
                OPERATOR_NOT_IN => parts.push(format!(
                    "{} notin ({})",
                    requirement.key,
                    requirement.values.join(",")
                )),
                OPERATOR_EXISTS => parts.push(requirement.key.clone()),
                OPERATOR_DOES_NOT_EXIST => parts.push(format!("!{}", requirement.key)),
                _ => {}
            }
        }

        if parts.is_empty() {
            None
        } else {
            Some(parts.join(","))
        }
    }
}

#[cfg(test)]
mod tests {
    use matches::assert_matches;

    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn requirement(key: &str, operator: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.to_string(),
            operator: operator.to_string(),
            values: values.iter().map(|v| (*v).to_string()).collect(),
        }
    }

    #[test]
    fn empty_selector_matches_everything() {
        let selector = LabelSelector::default();
        assert!(selector.matches(&labels(&[])));
        assert!(selector.matches(&labels(&[("app", "api")])));
        assert_eq!(selector.selector_string(), None);
    }

    #[test]
    fn match_labels_and_expressions() {
        let selector = LabelSelector {
            match_labels: labels(&[("app", "api")]),
            match_expressions: vec![
                requirement("tier", "In", &["prod", "staging"]),
                requirement("legacy", "DoesNotExist", &[]),
            ],
        };

        assert!(selector.matches(&labels(&[("app", "api"), ("tier", "prod")])));
        assert!(!selector.matches(&labels(&[("app", "api"), ("tier", "dev")])));
        assert!(!selector.matches(&labels(&[("app", "web"), ("tier", "prod")])));
        assert!(!selector.matches(&labels(&[
            ("app", "api"),
            ("tier", "prod"),
            ("legacy", "yes")
        ])));
    }

    #[test]
    fn not_in_matches_missing_key() {
        let selector = LabelSelector {
            match_labels: BTreeMap::new(),
            match_expressions: vec![requirement("tier", "NotIn", &["dev"])],
        };
        assert!(selector.matches(&labels(&[])));
        assert!(selector.matches(&labels(&[("tier", "prod")])));
        assert!(!selector.matches(&labels(&[("tier", "dev")])));
    }

    #[test]
    fn validation_rejects_bad_operators() {
        let selector = LabelSelector {
            match_labels: BTreeMap::new(),
            match_expressions: vec![requirement("k", "Sometimes", &[])],
        };
        assert_matches!(selector.validate(), Err(Error::LabelSelector(_)));

        let missing_values = LabelSelector {
            match_labels: BTreeMap::new(),
            match_expressions: vec![requirement("k", "In", &[])],
        };
        assert_matches!(missing_values.validate(), Err(Error::LabelSelector(_)));

        let extra_values = LabelSelector {
            match_labels: BTreeMap::new(),
            match_expressions: vec![requirement("k", "Exists", &["v"])],
        };
        assert_matches!(extra_values.validate(), Err(Error::LabelSelector(_)));
    }

    #[test]
    fn selector_string_round_trip() {
        let selector = LabelSelector {
            match_labels: labels(&[("app", "api")]),
            match_expressions: vec![
                requirement("tier", "In", &["prod"]),
                requirement("legacy", "DoesNotExist", &[]),
            ],
        };
        assert_eq!(
            selector.selector_string().unwrap(),
            "app=api,tier in (prod),!legacy"
        );
    }
}
