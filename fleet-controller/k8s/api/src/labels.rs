use std::{collections::BTreeMap, fmt};

pub type Map = BTreeMap<String, String>;

/// Requires that a label key is present, with any value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Expression {
    key: String,
}

/// Selects cached objects by label.
///
/// An empty selector matches everything.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct Selector {
    match_labels: Option<Map>,
    match_expressions: Option<Vec<Expression>>,
}

// === Selector ===

impl Selector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn matches(&self, labels: &Map) -> bool {
        for expr in self.match_expressions.iter().flatten() {
            if !expr.matches(labels) {
                return false;
            }
        }

        if let Some(match_labels) = self.match_labels.as_ref() {
            for (k, v) in match_labels.iter() {
                if labels.get(k) != Some(v) {
                    return false;
                }
            }
        }

        true
    }
}

/// Renders the selector in the API server's query syntax.
impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut terms = Vec::new();
        for (k, v) in self.match_labels.iter().flatten() {
            terms.push(format!("{k}={v}"));
        }
        for expr in self.match_expressions.iter().flatten() {
            terms.push(expr.to_string());
        }
        f.write_str(&terms.join(","))
    }
}

impl<'a> std::iter::FromIterator<(&'a str, &'a str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'a str, &'a str)>>(iter: T) -> Self {
        Self {
            match_labels: Some(
                iter.into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            match_expressions: None,
        }
    }
}

impl std::iter::FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self {
            match_labels: None,
            match_expressions: Some(iter.into_iter().collect()),
        }
    }
}

// === Expression ===

impl Expression {
    pub fn exists(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    fn matches(&self, labels: &Map) -> bool {
        labels.contains_key(&self.key)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::iter::FromIterator;

    fn labels(pairs: &[(&str, &str)]) -> Map {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_matches() {
        for (selector, labels, matches, msg) in &[
            (Selector::default(), labels(&[]), true, "empty match"),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                labels(&[("foo", "bar")]),
                true,
                "exact label match",
            ),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                labels(&[("foo", "bar"), ("bah", "baz")]),
                true,
                "sufficient label match",
            ),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                labels(&[("foo", "baz")]),
                false,
                "label value mismatch",
            ),
            (
                Selector::from_iter(Some(Expression::exists("foo"))),
                labels(&[("foo", "")]),
                true,
                "exists with empty value",
            ),
            (
                Selector::from_iter(Some(Expression::exists("foo"))),
                labels(&[("bah", "baz")]),
                false,
                "exists with missing key",
            ),
        ] {
            assert_eq!(selector.matches(labels), *matches, "{}", msg);
        }
    }

    #[test]
    fn test_query_string() {
        let selector = Selector {
            match_labels: Some(labels(&[("fleet.io/owned", "true")])),
            match_expressions: Some(vec![Expression::exists("fleet.io/cluster")]),
        };
        assert_eq!(selector.to_string(), "fleet.io/owned=true,fleet.io/cluster");
        assert_eq!(Selector::everything().to_string(), "");
    }

    #[test]
    fn spaces_need_not_be_owned() {
        let selector = crate::space_selector();
        assert!(selector.matches(&labels(&[("fleet.io/cluster", "a")])));
        assert!(selector.matches(&labels(&[
            ("fleet.io/cluster", "a"),
            ("fleet.io/owned", "true"),
        ])));
        assert!(!selector.matches(&labels(&[("fleet.io/owned", "true")])));
        assert_eq!(selector.to_string(), "fleet.io/cluster");
    }
}
