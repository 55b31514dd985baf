//! Query execution against a shard's index store.
//!
//! Leaves evaluate to scored document sets through the embedded engine;
//! the bool combinator applies a set algebra with score accumulation on
//! top. Candidates pass the optional expression filter before they are
//! ranked. Ordering is score-descending with ascending internal doc id as
//! the tie-break, so results are deterministic across runs and replicas.

use crate::aggregations::{self, AggPartial, AggSpec};
use crate::analysis::{normalize_term, tokenize};
use crate::error::{Error, Result};
use crate::filter::DocumentFilter;
use crate::index::{IndexStore, InternalDocId};
use crate::query::ast::QueryNode;
use crate::schema::{FieldKind, ID_FIELD};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use tantivy::collector::TopDocs;
use tantivy::query::{
    AllQuery, BooleanQuery, BoostQuery, FuzzyTermQuery, Occur, PhraseQuery,
    Query as EngineQuery, RangeQuery, RegexQuery, TermQuery,
};
use tantivy::schema::{Field, IndexRecordOption, Type};
use tantivy::{Searcher, Term};

/// Multiplier lifting phrase matches above their single-term parts.
const PHRASE_BOOST: f32 = 2.0;

/// One shard-level search request.
pub struct SearchRequest {
    pub query: QueryNode,
    pub from: usize,
    pub size: usize,
    pub filter: Option<DocumentFilter>,
    pub aggs: BTreeMap<String, AggSpec>,
}

impl SearchRequest {
    pub fn new(query: QueryNode) -> Self {
        Self {
            query,
            from: 0,
            size: 10,
            filter: None,
            aggs: BTreeMap::new(),
        }
    }
}

/// A ranked, hydrated hit.
#[derive(Debug, Clone)]
pub struct Hit {
    pub internal_id: InternalDocId,
    pub doc_id: String,
    pub score: f32,
    pub fields: Value,
}

/// Shard-local search result: one page of hits plus mergeable aggregation
/// partials over the full matched set.
#[derive(Debug)]
pub struct ShardSearchResult {
    pub total_hits: usize,
    pub max_score: f32,
    pub hits: Vec<Hit>,
    pub aggregations: BTreeMap<String, AggPartial>,
    pub filter_evaluated: u64,
    pub filter_matched: u64,
}

/// Executes parsed query trees against one [`IndexStore`].
pub struct QueryEngine<'a> {
    store: &'a IndexStore,
}

impl<'a> QueryEngine<'a> {
    pub fn new(store: &'a IndexStore) -> Self {
        Self { store }
    }

    #[tracing::instrument(name = "shard_search", skip_all, fields(kind = request.query.kind()))]
    pub fn search(&self, request: &SearchRequest) -> Result<ShardSearchResult> {
        let searcher = self.store.searcher();
        let matched = self.scored_set(&searcher, &request.query)?;

        // Hydrate candidates once; the filter and the aggregations both
        // consume stored fields.
        let mut candidates: Vec<(InternalDocId, f32, Value)> = Vec::with_capacity(matched.len());
        for (id, score) in matched {
            let fields = self.store.fields_of(&searcher, id)?;
            if let Some(filter) = &request.filter {
                if !filter.matches(&fields) {
                    continue;
                }
            }
            candidates.push((id, score, fields));
        }

        candidates.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        let total_hits = candidates.len();
        let max_score = candidates.first().map(|(_, s, _)| *s).unwrap_or(0.0);
        let aggregations =
            aggregations::compute_partials(&request.aggs, candidates.iter().map(|(_, _, f)| f));

        let hits = candidates
            .into_iter()
            .skip(request.from)
            .take(request.size)
            .map(|(internal_id, score, fields)| Hit {
                internal_id,
                doc_id: fields
                    .get(ID_FIELD)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                score,
                fields,
            })
            .collect();

        let (filter_evaluated, filter_matched) = request
            .filter
            .as_ref()
            .map(|f| (f.stats().evaluated(), f.stats().matched()))
            .unwrap_or((0, 0));

        Ok(ShardSearchResult {
            total_hits,
            max_score,
            hits,
            aggregations,
            filter_evaluated,
            filter_matched,
        })
    }

    /// Evaluate a query node into its full matched set with scores.
    fn scored_set(
        &self,
        searcher: &Searcher,
        node: &QueryNode,
    ) -> Result<HashMap<InternalDocId, f32>> {
        match node {
            QueryNode::Bool {
                must,
                should,
                filter,
                must_not,
                minimum_should_match,
            } => self.bool_set(
                searcher,
                must,
                should,
                filter,
                must_not,
                *minimum_should_match,
            ),
            QueryNode::Match { field, text } => {
                let tokens = tokenize(text);
                if tokens.is_empty() {
                    return Ok(HashMap::new());
                }
                let query = self.match_query(field, &tokens)?;
                self.run_leaf(searcher, &*query)
            }
            leaf => {
                let query = self.leaf_query(leaf)?;
                self.run_leaf(searcher, &*query)
            }
        }
    }

    fn run_leaf(
        &self,
        searcher: &Searcher,
        query: &dyn EngineQuery,
    ) -> Result<HashMap<InternalDocId, f32>> {
        let limit = (searcher.num_docs() as usize).max(1);
        let hits = searcher.search(query, &TopDocs::with_limit(limit))?;
        Ok(hits
            .into_iter()
            .map(|(score, addr)| (crate::index::internal_doc_id(addr), score))
            .collect())
    }

    fn bool_set(
        &self,
        searcher: &Searcher,
        must: &[QueryNode],
        should: &[QueryNode],
        filter: &[QueryNode],
        must_not: &[QueryNode],
        minimum_should_match: Option<usize>,
    ) -> Result<HashMap<InternalDocId, f32>> {
        if must.is_empty() && should.is_empty() && filter.is_empty() && must_not.is_empty() {
            return self.scored_set(searcher, &QueryNode::MatchAll);
        }

        let msm =
            minimum_should_match.unwrap_or(if must.is_empty() && filter.is_empty() { 1 } else { 0 });

        let must_sets: Vec<_> = must
            .iter()
            .map(|n| self.scored_set(searcher, n))
            .collect::<Result<_>>()?;
        let filter_sets: Vec<_> = filter
            .iter()
            .map(|n| self.scored_set(searcher, n))
            .collect::<Result<_>>()?;
        let should_sets: Vec<_> = should
            .iter()
            .map(|n| self.scored_set(searcher, n))
            .collect::<Result<_>>()?;
        let must_not_sets: Vec<_> = must_not
            .iter()
            .map(|n| self.scored_set(searcher, n))
            .collect::<Result<_>>()?;

        // Per-document should hit count and score sum, independent of
        // clause order.
        let mut should_count: HashMap<InternalDocId, usize> = HashMap::new();
        let mut should_score: HashMap<InternalDocId, f32> = HashMap::new();
        for set in &should_sets {
            for (&id, &score) in set {
                *should_count.entry(id).or_insert(0) += 1;
                *should_score.entry(id).or_insert(0.0) += score;
            }
        }

        let mut candidates: HashMap<InternalDocId, f32> =
            if !must_sets.is_empty() || !filter_sets.is_empty() {
                // Intersection of every must and filter set; only must
                // clauses contribute score.
                let seed = must_sets.first().or_else(|| filter_sets.first()).unwrap();
                let mut out = HashMap::new();
                'candidate: for &id in seed.keys() {
                    let mut score = 0.0;
                    for set in &must_sets {
                        match set.get(&id) {
                            Some(s) => score += s,
                            None => continue 'candidate,
                        }
                    }
                    for set in &filter_sets {
                        if !set.contains_key(&id) {
                            continue 'candidate;
                        }
                    }
                    out.insert(id, score);
                }
                out
            } else {
                // Pure should query: the union is the candidate set.
                should_count.keys().map(|&id| (id, 0.0)).collect()
            };

        if !should_sets.is_empty() && msm > 0 {
            candidates.retain(|id, _| should_count.get(id).copied().unwrap_or(0) >= msm);
        }
        for (id, score) in candidates.iter_mut() {
            if let Some(s) = should_score.get(id) {
                *score += s;
            }
        }
        for set in &must_not_sets {
            candidates.retain(|id, _| !set.contains_key(id));
        }

        Ok(candidates)
    }

    /// Build the engine query for a non-bool leaf.
    fn leaf_query(&self, node: &QueryNode) -> Result<Box<dyn EngineQuery>> {
        match node {
            QueryNode::MatchAll => Ok(Box::new(AllQuery)),
            QueryNode::Term { field, value } => self.term_query(field, value),
            QueryNode::Phrase { field, text } => self.phrase_query(field, text),
            QueryNode::Range { field, bounds } => self.range_query(field, bounds),
            QueryNode::Prefix { field, prefix } => {
                let (handle, kind) = self.text_field(field, "prefix")?;
                let prefix = match kind {
                    FieldKind::Text => normalize_term(prefix),
                    _ => prefix.clone(),
                };
                let mut pattern = String::new();
                for c in prefix.chars() {
                    push_escaped(c, &mut pattern);
                }
                pattern.push_str(".*");
                let query = RegexQuery::from_pattern(&pattern, handle)
                    .map_err(|e| Error::BadQuery(e.to_string()))?;
                Ok(Box::new(query))
            }
            QueryNode::Wildcard { field, pattern } => {
                let (handle, kind) = self.text_field(field, "wildcard")?;
                let pattern = match kind {
                    FieldKind::Text => normalize_term(pattern),
                    _ => pattern.clone(),
                };
                let regex = wildcard_to_regex(&pattern);
                let query = RegexQuery::from_pattern(&regex, handle)
                    .map_err(|e| Error::BadQuery(e.to_string()))?;
                Ok(Box::new(query))
            }
            QueryNode::Fuzzy {
                field,
                value,
                fuzziness,
            } => {
                let (handle, kind) = self.text_field(field, "fuzzy")?;
                let value = match kind {
                    FieldKind::Text => normalize_term(value),
                    _ => value.clone(),
                };
                let term = Term::from_field_text(handle, &value);
                Ok(Box::new(FuzzyTermQuery::new(term, *fuzziness, true)))
            }
            QueryNode::Match { .. } | QueryNode::Bool { .. } => Err(Error::BadQuery(
                "internal: composite node reached leaf builder".to_string(),
            )),
        }
    }

    fn match_query(&self, field: &str, tokens: &[String]) -> Result<Box<dyn EngineQuery>> {
        let (handle, kind) = self.text_field(field, "match")?;
        if kind != FieldKind::Text {
            return Err(Error::BadQuery(format!(
                "match requires an analyzed text field, {field} is not one"
            )));
        }
        let mut clauses: Vec<(Occur, Box<dyn EngineQuery>)> = Vec::with_capacity(tokens.len());
        for token in tokens {
            let term = Term::from_field_text(handle, token);
            clauses.push((
                Occur::Should,
                Box::new(TermQuery::new(term, IndexRecordOption::WithFreqs)),
            ));
        }
        if clauses.len() == 1 {
            Ok(clauses.pop().unwrap().1)
        } else {
            Ok(Box::new(BooleanQuery::new(clauses)))
        }
    }

    fn term_query(&self, field: &str, value: &Value) -> Result<Box<dyn EngineQuery>> {
        let (handle, kind) = self.resolve_field(field)?;
        let query: Box<dyn EngineQuery> = match kind {
            FieldKind::Text => {
                let raw = scalar_string(value).ok_or_else(|| {
                    Error::BadQuery(format!("term on text field {field} needs a string"))
                })?;
                let term = Term::from_field_text(handle, &normalize_term(&raw));
                Box::new(TermQuery::new(term, IndexRecordOption::WithFreqs))
            }
            FieldKind::Keyword => {
                let raw = scalar_string(value).ok_or_else(|| {
                    Error::BadQuery(format!("term on keyword field {field} needs a scalar"))
                })?;
                let term = Term::from_field_text(handle, &raw);
                Box::new(TermQuery::new(term, IndexRecordOption::Basic))
            }
            FieldKind::I64 => {
                let v = value.as_i64().ok_or_else(|| {
                    Error::BadQuery(format!("term on integer field {field} needs an integer"))
                })?;
                let term = Term::from_field_i64(handle, v);
                Box::new(TermQuery::new(term, IndexRecordOption::Basic))
            }
            FieldKind::F64 => {
                let v = value.as_f64().ok_or_else(|| {
                    Error::BadQuery(format!("term on float field {field} needs a number"))
                })?;
                let term = Term::from_field_f64(handle, v);
                Box::new(TermQuery::new(term, IndexRecordOption::Basic))
            }
            FieldKind::Bool => {
                let v = value.as_bool().ok_or_else(|| {
                    Error::BadQuery(format!("term on bool field {field} needs a boolean"))
                })?;
                let term = Term::from_field_bool(handle, v);
                Box::new(TermQuery::new(term, IndexRecordOption::Basic))
            }
            FieldKind::Stored => {
                return Err(Error::BadQuery(format!(
                    "field {field} is stored-only and cannot be queried"
                )));
            }
        };
        Ok(query)
    }

    fn phrase_query(&self, field: &str, text: &str) -> Result<Box<dyn EngineQuery>> {
        let (handle, kind) = self.text_field(field, "phrase")?;
        if kind != FieldKind::Text {
            return Err(Error::BadQuery(format!(
                "phrase requires an analyzed text field, {field} is not one"
            )));
        }
        let tokens = tokenize(text);
        match tokens.len() {
            0 => Err(Error::BadQuery("phrase has no tokens".to_string())),
            1 => {
                let term = Term::from_field_text(handle, &tokens[0]);
                Ok(Box::new(TermQuery::new(term, IndexRecordOption::WithFreqs)))
            }
            _ => {
                let terms: Vec<Term> = tokens
                    .iter()
                    .map(|t| Term::from_field_text(handle, t))
                    .collect();
                let phrase = PhraseQuery::new(terms);
                Ok(Box::new(BoostQuery::new(Box::new(phrase), PHRASE_BOOST)))
            }
        }
    }

    fn range_query(
        &self,
        field: &str,
        bounds: &crate::query::ast::RangeBounds,
    ) -> Result<Box<dyn EngineQuery>> {
        let (handle, kind) = self.resolve_field(field)?;
        let value_type = match kind {
            FieldKind::I64 => Type::I64,
            FieldKind::F64 => Type::F64,
            _ => {
                return Err(Error::BadQuery(format!(
                    "range requires a numeric field, {field} is not one"
                )));
            }
        };
        let (lower, upper) = match kind {
            FieldKind::I64 => {
                let to_term = |n: &serde_json::Number| -> Result<Term> {
                    n.as_i64()
                        .map(|v| Term::from_field_i64(handle, v))
                        .ok_or_else(|| {
                            Error::BadQuery(format!(
                                "range bound on integer field {field} must be an integer"
                            ))
                        })
                };
                (
                    bound_term(&bounds.lower, to_term)?,
                    bound_term(&bounds.upper, to_term)?,
                )
            }
            FieldKind::F64 => {
                let to_term = |n: &serde_json::Number| -> Result<Term> {
                    n.as_f64()
                        .map(|v| Term::from_field_f64(handle, v))
                        .ok_or_else(|| {
                            Error::BadQuery(format!("range bound on {field} must be numeric"))
                        })
                };
                (
                    bound_term(&bounds.lower, to_term)?,
                    bound_term(&bounds.upper, to_term)?,
                )
            }
            _ => {
                return Err(Error::BadQuery(format!(
                    "range requires a numeric field, {field} is not one"
                )));
            }
        };
        Ok(Box::new(RangeQuery::new_term_bounds(
            field.to_string(),
            value_type,
            &lower,
            &upper,
        )))
    }

    /// Resolve any queryable field.
    fn resolve_field(&self, name: &str) -> Result<(Field, FieldKind)> {
        if name == ID_FIELD {
            let handle = self
                .store
                .field(ID_FIELD)
                .ok_or_else(|| Error::BadQuery("missing id field".to_string()))?;
            return Ok((handle, FieldKind::Keyword));
        }
        let def = self
            .store
            .schema()
            .field(name)
            .ok_or_else(|| Error::BadQuery(format!("unknown field: {name}")))?;
        let handle = self
            .store
            .field(name)
            .ok_or_else(|| Error::BadQuery(format!("unknown field: {name}")))?;
        Ok((handle, def.kind))
    }

    /// Resolve a field expected to hold terms (text or keyword).
    fn text_field(&self, name: &str, kind_name: &str) -> Result<(Field, FieldKind)> {
        let (handle, kind) = self.resolve_field(name)?;
        match kind {
            FieldKind::Text | FieldKind::Keyword => Ok((handle, kind)),
            _ => Err(Error::BadQuery(format!(
                "{kind_name} requires a text or keyword field, {name} is not one"
            ))),
        }
    }
}

fn bound_term(
    side: &Option<(serde_json::Number, bool)>,
    to_term: impl Fn(&serde_json::Number) -> Result<Term>,
) -> Result<Bound<Term>> {
    match side {
        None => Ok(Bound::Unbounded),
        Some((number, true)) => Ok(Bound::Included(to_term(number)?)),
        Some((number, false)) => Ok(Bound::Excluded(to_term(number)?)),
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Translate a `*`/`?` wildcard pattern into an anchored regex.
fn wildcard_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() * 2);
    for c in pattern.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => push_escaped(other, &mut out),
        }
    }
    out
}

fn push_escaped(c: char, out: &mut String) {
    if "\\^$.|?*+()[]{}#&-~\"".contains(c) {
        out.push('\\');
    }
    out.push(c);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_to_regex() {
        assert_eq!(wildcard_to_regex("serv*"), "serv.*");
        assert_eq!(wildcard_to_regex("w?dget"), "w.dget");
        assert_eq!(wildcard_to_regex("a.b*"), "a\\.b.*");
        assert_eq!(wildcard_to_regex("x+y"), "x\\+y");
    }

    #[test]
    fn test_scalar_string() {
        assert_eq!(scalar_string(&Value::from("a")), Some("a".to_string()));
        assert_eq!(scalar_string(&Value::from(4)), Some("4".to_string()));
        assert_eq!(scalar_string(&Value::from(true)), Some("true".to_string()));
        assert_eq!(scalar_string(&Value::Array(vec![])), None);
    }
}
