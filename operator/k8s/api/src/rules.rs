//! Traffic match rules attached to a bridge.
//!
//! A rule matches a request when all of its predicates match. A bridge
//! receives a request when any of its rules matches. The same types are
//! written verbatim into the interception proxy's configuration document.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub struct Rule {
    #[serde(rename = "match")]
    pub matches: Vec<Match>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum Match {
    MatchHeader(HeaderMatch),
    MatchPath(PathMatch),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub struct HeaderMatch {
    pub name: String,
    pub value: String,
    #[serde(default, rename = "type")]
    pub kind: MatchType,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub struct PathMatch {
    pub path: String,
    #[serde(default, rename = "type")]
    pub kind: MatchType,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    #[default]
    Exact,
    Prefix,
    Regex,
}

impl Match {
    pub fn header(name: impl Into<String>, value: impl Into<String>, kind: MatchType) -> Self {
        Self::MatchHeader(HeaderMatch {
            name: name.into(),
            value: value.into(),
            kind,
        })
    }

    pub fn path(path: impl Into<String>, kind: MatchType) -> Self {
        Self::MatchPath(PathMatch {
            path: path.into(),
            kind,
        })
    }

    /// The pattern to compile when this predicate is a regex.
    pub fn regex(&self) -> Option<&str> {
        match self {
            Self::MatchHeader(HeaderMatch {
                value,
                kind: MatchType::Regex,
                ..
            }) => Some(value),
            Self::MatchPath(PathMatch {
                path,
                kind: MatchType::Regex,
            }) => Some(path),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn match_wire_format() {
        let rule: Rule = serde_json::from_value(serde_json::json!({
            "match": [
                {"matchHeader": {"name": "x-gefyra", "value": "peer"}},
                {"matchPath": {"path": "/api", "type": "prefix"}},
            ]
        }))
        .unwrap();
        assert_eq!(
            rule.matches,
            vec![
                Match::header("x-gefyra", "peer", MatchType::Exact),
                Match::path("/api", MatchType::Prefix),
            ]
        );

        let value = serde_json::to_value(&rule).unwrap();
        assert_eq!(value["match"][0]["matchHeader"]["type"], "exact");
        assert_eq!(value["match"][1]["matchPath"]["type"], "prefix");
    }

    #[test]
    fn only_regex_predicates_expose_patterns() {
        assert_eq!(Match::path("^/v[0-9]+", MatchType::Regex).regex(), Some("^/v[0-9]+"));
        assert_eq!(Match::header("a", "b", MatchType::Prefix).regex(), None);
    }
}
