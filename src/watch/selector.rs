use std::collections::BTreeMap;

use regex::Regex;

/// Wildcard accepted both as a label key and as an expected value
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("invalid expression {expression:?} for label {key:?}: {reason}")]
    InvalidExpression {
        key: String,
        expression: String,
        reason: String,
    },
}

#[derive(Debug)]
enum ValueMatcher {
    Any,
    Exact(String),
    Pattern(Regex),
}

impl ValueMatcher {
    fn matches(
        &self,
        value: &str,
    ) -> bool {
        match self {
            ValueMatcher::Any => true,
            ValueMatcher::Exact(expected) => expected == value,
            ValueMatcher::Pattern(re) => re.is_match(value),
        }
    }
}

/// Compiled label filter.
///
/// Every `key -> expected` pair must hold for a resource to match:
/// - `*` requires the label to exist with any value;
/// - `^...$` is an anchored regular expression;
/// - anything else is compared literally.
///
/// The pair `* -> *` matches every resource, labelled or not.
#[derive(Debug, Default)]
pub struct LabelSelector {
    terms: Vec<(String, ValueMatcher)>,
    match_all: bool,
}

impl LabelSelector {
    pub fn compile(filter: &BTreeMap<String, String>) -> Result<Self, SelectorError> {
        let mut selector = LabelSelector::default();
        for (key, expected) in filter {
            if key == WILDCARD && expected == WILDCARD {
                selector.match_all = true;
                continue;
            }
            let matcher = if expected == WILDCARD {
                ValueMatcher::Any
            } else if expected.starts_with('^') && expected.ends_with('$') {
                let re = Regex::new(expected).map_err(|e| SelectorError::InvalidExpression {
                    key: key.clone(),
                    expression: expected.clone(),
                    reason: e.to_string(),
                })?;
                ValueMatcher::Pattern(re)
            } else {
                ValueMatcher::Exact(expected.clone())
            };
            selector.terms.push((key.clone(), matcher));
        }
        Ok(selector)
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn matches(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> bool {
        if self.match_all {
            return true;
        }
        self.terms.iter().all(|(key, matcher)| {
            labels
                .get(key)
                .is_some_and(|value| matcher.matches(value))
        })
    }
}
