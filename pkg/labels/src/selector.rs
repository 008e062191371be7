use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A selector string failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid selector {input:?}: {reason}")]
pub struct SelectorError {
    pub input: String,
    pub reason: String,
}

impl SelectorError {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// Comparison applied by one requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// One `key <operator> values` clause of a selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,
    pub values: Vec<String>,
}

impl Requirement {
    /// Whether a label map satisfies this requirement.
    ///
    /// The negative operators (`NotEquals`, `NotIn`, `DoesNotExist`) also
    /// match entities that do not carry the key at all.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self.operator {
            Operator::Equals | Operator::In => labels
                .get(&self.key)
                .is_some_and(|v| self.values.iter().any(|want| want == v)),
            Operator::NotEquals | Operator::NotIn => labels
                .get(&self.key)
                .is_none_or(|v| !self.values.iter().any(|want| want == v)),
            Operator::Exists => labels.contains_key(&self.key),
            Operator::DoesNotExist => !labels.contains_key(&self.key),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operator {
            Operator::Equals => write!(f, "{}={}", self.key, self.values[0]),
            Operator::NotEquals => write!(f, "{}!={}", self.key, self.values[0]),
            Operator::In => write!(f, "{} in ({})", self.key, self.values.join(",")),
            Operator::NotIn => write!(f, "{} notin ({})", self.key, self.values.join(",")),
            Operator::Exists => write!(f, "{}", self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}

/// A label-expression predicate: requirements joined by implicit AND.
/// The empty selector (`everything`) matches all entities.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    /// The selector that matches every entity.
    pub fn everything() -> Self {
        Self::default()
    }

    /// Append a requirement, consuming and returning the selector so calls
    /// chain: `Selector::everything().add("nodeQuality", Operator::Equals, &["good"])`.
    pub fn add(mut self, key: &str, operator: Operator, values: &[&str]) -> Self {
        self.requirements.push(Requirement {
            key: key.to_string(),
            operator,
            values: values.iter().map(|v| v.to_string()).collect(),
        });
        self
    }

    pub fn is_everything(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    /// Whether a label map satisfies every requirement.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        write!(f, "{}", rendered.join(","))
    }
}

impl FromStr for Selector {
    type Err = SelectorError;

    /// Parse the selector grammar: comma-joined requirements of the forms
    /// `k=v`, `k==v`, `k!=v`, `k in (a,b)`, `k notin (a,b)`, `k`, `!k`.
    /// The empty string parses to the everything selector.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut requirements = Vec::new();
        for clause in split_clauses(input)? {
            let clause = clause.trim();
            if clause.is_empty() {
                continue;
            }
            requirements.push(parse_requirement(input, clause)?);
        }
        Ok(Selector { requirements })
    }
}

/// Split on commas that are not inside an `in (...)` value list.
fn split_clauses(input: &str) -> Result<Vec<&str>, SelectorError> {
    let mut clauses = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| SelectorError::new(input, "unbalanced parenthesis"))?;
            }
            ',' if depth == 0 => {
                clauses.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(SelectorError::new(input, "unbalanced parenthesis"));
    }
    clauses.push(&input[start..]);
    Ok(clauses)
}

fn parse_requirement(input: &str, clause: &str) -> Result<Requirement, SelectorError> {
    if let Some(key) = clause.strip_prefix('!') {
        return Ok(Requirement {
            key: validate_key(input, key.trim())?,
            operator: Operator::DoesNotExist,
            values: Vec::new(),
        });
    }
    if let Some((key, values)) = parse_set_clause(clause, " notin ") {
        return Ok(Requirement {
            key: validate_key(input, key)?,
            operator: Operator::NotIn,
            values: parse_value_list(input, values)?,
        });
    }
    if let Some((key, values)) = parse_set_clause(clause, " in ") {
        return Ok(Requirement {
            key: validate_key(input, key)?,
            operator: Operator::In,
            values: parse_value_list(input, values)?,
        });
    }
    if let Some((key, value)) = clause.split_once("!=") {
        return Ok(Requirement {
            key: validate_key(input, key.trim())?,
            operator: Operator::NotEquals,
            values: vec![value.trim().to_string()],
        });
    }
    if let Some((key, value)) = clause.split_once("==").or_else(|| clause.split_once('=')) {
        return Ok(Requirement {
            key: validate_key(input, key.trim())?,
            operator: Operator::Equals,
            values: vec![value.trim().to_string()],
        });
    }
    Ok(Requirement {
        key: validate_key(input, clause)?,
        operator: Operator::Exists,
        values: Vec::new(),
    })
}

/// Split `key <word> (a,b)` into the key and the parenthesized list.
fn parse_set_clause<'a>(clause: &'a str, word: &str) -> Option<(&'a str, &'a str)> {
    let (key, rest) = clause.split_once(word)?;
    let rest = rest.trim();
    let inner = rest.strip_prefix('(')?.strip_suffix(')')?;
    Some((key.trim(), inner))
}

fn parse_value_list(input: &str, inner: &str) -> Result<Vec<String>, SelectorError> {
    let values: Vec<String> = inner
        .split(',')
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
    if values.is_empty() {
        return Err(SelectorError::new(input, "empty value list"));
    }
    Ok(values)
}

fn validate_key(input: &str, key: &str) -> Result<String, SelectorError> {
    if key.is_empty() {
        return Err(SelectorError::new(input, "empty key"));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
    {
        return Err(SelectorError::new(
            input,
            format!("key {:?} contains invalid characters", key),
        ));
    }
    Ok(key.to_string())
}

// Selectors persist inside daemon-set records in their string form.

impl Serialize for Selector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Selector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn everything_matches_anything() {
        let selector = Selector::everything();
        assert!(selector.is_everything());
        assert!(selector.matches(&labels(&[])));
        assert!(selector.matches(&labels(&[("nodeQuality", "good")])));
    }

    #[test]
    fn equals_and_not_equals() {
        let selector = Selector::everything().add("nodeQuality", Operator::Equals, &["good"]);
        assert!(selector.matches(&labels(&[("nodeQuality", "good")])));
        assert!(!selector.matches(&labels(&[("nodeQuality", "bad")])));
        assert!(!selector.matches(&labels(&[])));

        let selector = Selector::everything().add("nodeQuality", Operator::NotEquals, &["good"]);
        assert!(!selector.matches(&labels(&[("nodeQuality", "good")])));
        assert!(selector.matches(&labels(&[("nodeQuality", "bad")])));
        // A missing key satisfies the negative operators.
        assert!(selector.matches(&labels(&[])));
    }

    #[test]
    fn requirements_are_anded() {
        let selector = Selector::everything()
            .add("nodeQuality", Operator::Equals, &["good"])
            .add("cherry", Operator::Equals, &["pick"]);
        assert!(selector.matches(&labels(&[("nodeQuality", "good"), ("cherry", "pick")])));
        assert!(!selector.matches(&labels(&[("nodeQuality", "good")])));
    }

    #[test]
    fn set_operators() {
        let selector = Selector::everything().add("az", Operator::In, &["us-east", "us-west"]);
        assert!(selector.matches(&labels(&[("az", "us-east")])));
        assert!(!selector.matches(&labels(&[("az", "eu-west")])));
        assert!(!selector.matches(&labels(&[])));

        let selector = Selector::everything().add("az", Operator::NotIn, &["us-east"]);
        assert!(!selector.matches(&labels(&[("az", "us-east")])));
        assert!(selector.matches(&labels(&[("az", "eu-west")])));
        assert!(selector.matches(&labels(&[])));
    }

    #[test]
    fn existence_operators() {
        let selector = Selector::everything().add("cherry", Operator::Exists, &[]);
        assert!(selector.matches(&labels(&[("cherry", "pick")])));
        assert!(!selector.matches(&labels(&[])));

        let selector = Selector::everything().add("cherry", Operator::DoesNotExist, &[]);
        assert!(!selector.matches(&labels(&[("cherry", "pick")])));
        assert!(selector.matches(&labels(&[])));
    }

    #[test]
    fn parse_all_forms() {
        let parsed: Selector = "nodeQuality=good,az in (us-east,us-west),!drained,ssd,env!=prod,region notin (ap-south)"
            .parse()
            .expect("selector should parse");
        let ops: Vec<Operator> = parsed.requirements().iter().map(|r| r.operator).collect();
        assert_eq!(
            ops,
            vec![
                Operator::Equals,
                Operator::In,
                Operator::DoesNotExist,
                Operator::Exists,
                Operator::NotEquals,
                Operator::NotIn,
            ]
        );
        assert_eq!(parsed.requirements()[1].values, vec!["us-east", "us-west"]);
    }

    #[test]
    fn parse_empty_is_everything() {
        let parsed: Selector = "".parse().expect("empty selector should parse");
        assert!(parsed.is_everything());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("az in (us-east".parse::<Selector>().is_err());
        assert!("=value".parse::<Selector>().is_err());
        assert!("bad key=1".parse::<Selector>().is_err());
        assert!("az in ()".parse::<Selector>().is_err());
    }

    #[test]
    fn display_roundtrips() {
        let raw = "nodeQuality=good,az in (us-east,us-west),!drained,env!=prod";
        let parsed: Selector = raw.parse().expect("selector should parse");
        assert_eq!(parsed.to_string(), raw);
        let reparsed: Selector = parsed.to_string().parse().expect("round trip");
        assert_eq!(parsed, reparsed);
    }

    #[test]
    fn serde_as_string() {
        let selector = Selector::everything().add("nodeQuality", Operator::Equals, &["good"]);
        let json = serde_json::to_string(&selector).expect("serialize");
        assert_eq!(json, "\"nodeQuality=good\"");
        let back: Selector = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, selector);
    }
}
