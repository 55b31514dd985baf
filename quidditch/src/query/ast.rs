//! Query abstract syntax tree and its JSON parser.
//!
//! The algebra is a closed set: term, match, match_all, phrase, range,
//! prefix, wildcard, fuzzy and bool. A query object carries exactly one
//! kind key; anything else is a `BadQuery` so silent misconfiguration is
//! impossible.

use crate::error::{Error, Result};
use serde_json::Value;

/// Default and maximum Levenshtein distance for fuzzy queries.
pub const DEFAULT_FUZZINESS: u8 = 2;
pub const MAX_FUZZINESS: u8 = 2;

/// One side-pair of numeric range bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeBounds {
    pub lower: Option<(serde_json::Number, bool)>,
    pub upper: Option<(serde_json::Number, bool)>,
}

/// Query abstract syntax tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryNode {
    /// Exact single-term match on one field, BM25-scored.
    Term { field: String, value: Value },

    /// Tokenized union match; summed BM25 contributions.
    Match { field: String, text: String },

    /// Every document, uniform score 1.0.
    MatchAll,

    /// Ordered consecutive tokens over positional postings.
    Phrase { field: String, text: String },

    /// Numeric comparison with inclusive/exclusive bounds.
    Range { field: String, bounds: RangeBounds },

    /// All terms starting with the prefix.
    Prefix { field: String, prefix: String },

    /// `*` and `?` pattern over the field's terms.
    Wildcard { field: String, pattern: String },

    /// Levenshtein distance match.
    Fuzzy {
        field: String,
        value: String,
        fuzziness: u8,
    },

    /// Composite clause lists.
    Bool {
        must: Vec<QueryNode>,
        should: Vec<QueryNode>,
        filter: Vec<QueryNode>,
        must_not: Vec<QueryNode>,
        minimum_should_match: Option<usize>,
    },
}

impl QueryNode {
    /// Parse a JSON query tree, rejecting unknown kinds and malformed
    /// operands.
    pub fn parse(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::BadQuery("query must be a JSON object".to_string()))?;
        if obj.len() != 1 {
            return Err(Error::BadQuery(format!(
                "query object must have exactly one kind key, found {}",
                obj.len()
            )));
        }
        let (kind, body) = obj.iter().next().unwrap();
        match kind.as_str() {
            "term" => {
                let (field, value) = single_field(body, "term")?;
                if !value.is_string() && !value.is_number() && !value.is_boolean() {
                    return Err(Error::BadQuery(
                        "term value must be a scalar".to_string(),
                    ));
                }
                Ok(QueryNode::Term {
                    field,
                    value: value.clone(),
                })
            }
            "match" => {
                let (field, value) = single_field(body, "match")?;
                let text = value
                    .as_str()
                    .ok_or_else(|| Error::BadQuery("match value must be a string".to_string()))?;
                Ok(QueryNode::Match {
                    field,
                    text: text.to_string(),
                })
            }
            "match_all" => {
                let body = body.as_object().ok_or_else(|| {
                    Error::BadQuery("match_all body must be an object".to_string())
                })?;
                if !body.is_empty() {
                    return Err(Error::BadQuery(
                        "match_all takes no parameters".to_string(),
                    ));
                }
                Ok(QueryNode::MatchAll)
            }
            "phrase" => {
                let (field, value) = single_field(body, "phrase")?;
                let text = value
                    .as_str()
                    .ok_or_else(|| Error::BadQuery("phrase value must be a string".to_string()))?;
                Ok(QueryNode::Phrase {
                    field,
                    text: text.to_string(),
                })
            }
            "range" => {
                let (field, value) = single_field(body, "range")?;
                Ok(QueryNode::Range {
                    field,
                    bounds: parse_range_bounds(value)?,
                })
            }
            "prefix" => {
                let (field, value) = single_field(body, "prefix")?;
                let prefix = value
                    .as_str()
                    .ok_or_else(|| Error::BadQuery("prefix value must be a string".to_string()))?;
                Ok(QueryNode::Prefix {
                    field,
                    prefix: prefix.to_string(),
                })
            }
            "wildcard" => {
                let (field, value) = single_field(body, "wildcard")?;
                let pattern = value.as_str().ok_or_else(|| {
                    Error::BadQuery("wildcard pattern must be a string".to_string())
                })?;
                Ok(QueryNode::Wildcard {
                    field,
                    pattern: pattern.to_string(),
                })
            }
            "fuzzy" => {
                let (field, value) = single_field(body, "fuzzy")?;
                let (term, fuzziness) = parse_fuzzy_body(value)?;
                Ok(QueryNode::Fuzzy {
                    field,
                    value: term,
                    fuzziness,
                })
            }
            "bool" => parse_bool(body),
            other => Err(Error::BadQuery(format!("unknown query kind: {other}"))),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            QueryNode::Term { .. } => "term",
            QueryNode::Match { .. } => "match",
            QueryNode::MatchAll => "match_all",
            QueryNode::Phrase { .. } => "phrase",
            QueryNode::Range { .. } => "range",
            QueryNode::Prefix { .. } => "prefix",
            QueryNode::Wildcard { .. } => "wildcard",
            QueryNode::Fuzzy { .. } => "fuzzy",
            QueryNode::Bool { .. } => "bool",
        }
    }

    /// The caller-supplied document id this query pins down, when it is an
    /// exact id predicate. Used by the router to collapse fan-out to a
    /// single shard.
    pub fn exact_id_predicate(&self) -> Option<&str> {
        match self {
            QueryNode::Term { field, value } if field == crate::schema::ID_FIELD => {
                value.as_str()
            }
            _ => None,
        }
    }
}

/// Unwrap a `{"field": operand}` body.
fn single_field<'v>(body: &'v Value, kind: &str) -> Result<(String, &'v Value)> {
    let obj = body
        .as_object()
        .ok_or_else(|| Error::BadQuery(format!("{kind} body must be an object")))?;
    if obj.len() != 1 {
        return Err(Error::BadQuery(format!(
            "{kind} must name exactly one field"
        )));
    }
    let (field, value) = obj.iter().next().unwrap();
    Ok((field.clone(), value))
}

fn parse_range_bounds(value: &Value) -> Result<RangeBounds> {
    let obj = value
        .as_object()
        .ok_or_else(|| Error::BadQuery("range operand must be an object".to_string()))?;

    let mut bounds = RangeBounds {
        lower: None,
        upper: None,
    };
    for (key, bound) in obj {
        let number = bound
            .as_number()
            .ok_or_else(|| Error::BadQuery(format!("range bound {key} must be numeric")))?
            .clone();
        match key.as_str() {
            "gte" => bounds.lower = Some((number, true)),
            "gt" => bounds.lower = Some((number, false)),
            "lte" => bounds.upper = Some((number, true)),
            "lt" => bounds.upper = Some((number, false)),
            other => {
                return Err(Error::BadQuery(format!("unknown range bound: {other}")));
            }
        }
    }
    if bounds.lower.is_none() && bounds.upper.is_none() {
        return Err(Error::BadQuery(
            "range requires at least one bound".to_string(),
        ));
    }
    Ok(bounds)
}

fn parse_fuzzy_body(value: &Value) -> Result<(String, u8)> {
    match value {
        Value::String(s) => Ok((s.clone(), DEFAULT_FUZZINESS)),
        Value::Object(obj) => {
            let mut term = None;
            let mut fuzziness = DEFAULT_FUZZINESS;
            for (key, v) in obj {
                match key.as_str() {
                    "value" => {
                        term = Some(
                            v.as_str()
                                .ok_or_else(|| {
                                    Error::BadQuery("fuzzy value must be a string".to_string())
                                })?
                                .to_string(),
                        )
                    }
                    "fuzziness" => {
                        let f = v.as_u64().ok_or_else(|| {
                            Error::BadQuery("fuzziness must be an integer".to_string())
                        })?;
                        if f > MAX_FUZZINESS as u64 {
                            return Err(Error::BadQuery(format!(
                                "fuzziness {f} exceeds maximum {MAX_FUZZINESS}"
                            )));
                        }
                        fuzziness = f as u8;
                    }
                    other => {
                        return Err(Error::BadQuery(format!("unknown fuzzy key: {other}")));
                    }
                }
            }
            let term =
                term.ok_or_else(|| Error::BadQuery("fuzzy requires a value".to_string()))?;
            Ok((term, fuzziness))
        }
        _ => Err(Error::BadQuery(
            "fuzzy operand must be a string or object".to_string(),
        )),
    }
}

fn parse_bool(body: &Value) -> Result<QueryNode> {
    let obj = body
        .as_object()
        .ok_or_else(|| Error::BadQuery("bool body must be an object".to_string()))?;

    let mut must = Vec::new();
    let mut should = Vec::new();
    let mut filter = Vec::new();
    let mut must_not = Vec::new();
    let mut minimum_should_match = None;

    for (key, value) in obj {
        match key.as_str() {
            "must" => must = parse_clause_list(value)?,
            "should" => should = parse_clause_list(value)?,
            "filter" => filter = parse_clause_list(value)?,
            "must_not" => must_not = parse_clause_list(value)?,
            "minimum_should_match" => {
                let n = value.as_u64().ok_or_else(|| {
                    Error::BadQuery("minimum_should_match must be an integer".to_string())
                })?;
                minimum_should_match = Some(n as usize);
            }
            other => {
                return Err(Error::BadQuery(format!("unknown bool key: {other}")));
            }
        }
    }

    Ok(QueryNode::Bool {
        must,
        should,
        filter,
        must_not,
        minimum_should_match,
    })
}

/// A clause list may be a single query object or an array of them.
fn parse_clause_list(value: &Value) -> Result<Vec<QueryNode>> {
    match value {
        Value::Array(items) => items.iter().map(QueryNode::parse).collect(),
        Value::Object(_) => Ok(vec![QueryNode::parse(value)?]),
        _ => Err(Error::BadQuery(
            "bool clause must be a query or array of queries".to_string(),
        )),
    }
}
