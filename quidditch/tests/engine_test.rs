//! End-to-end tests of the shard query engine: ranking, the bool algebra,
//! term expansion queries, filters and aggregations.

use quidditch::filter::{encode, BinaryOp, Expr, ExprValue, ResultType};
use quidditch::schema::{FieldDef, FieldKind, IndexSchema};
use quidditch::shard::{open_shard, Shard};
use serde_json::{json, Value};

fn products_schema() -> IndexSchema {
    IndexSchema::new(vec![
        FieldDef::new("text", FieldKind::Text),
        FieldDef::new("name", FieldKind::Text),
        FieldDef::new("category", FieldKind::Keyword),
        FieldDef::new("price", FieldKind::F64),
        FieldDef::new("stock", FieldKind::I64),
        FieldDef::new("active", FieldKind::Bool),
    ])
}

fn shard_with(docs: &[(&str, Value)]) -> (tempfile::TempDir, Shard) {
    let dir = tempfile::tempdir().unwrap();
    let shard = open_shard(dir.path(), "products", 0, products_schema()).unwrap();
    for (id, doc) in docs {
        shard.index_document(id, doc).unwrap();
    }
    shard.refresh().unwrap();
    (dir, shard)
}

fn search(shard: &Shard, query: Value) -> Vec<(String, f32)> {
    shard
        .search_raw(&query, None, 0, 100, None)
        .unwrap()
        .hits
        .into_iter()
        .map(|h| (h.doc_id, h.score))
        .collect()
}

fn ids(hits: &[(String, f32)]) -> Vec<&str> {
    hits.iter().map(|(id, _)| id.as_str()).collect()
}

#[test]
fn test_term_ranking_by_frequency() {
    // Higher term frequency outranks lower at the same field-length ratio.
    let (_dir, shard) = shard_with(&[
        ("a", json!({"text": "go go go"})),
        ("b", json!({"text": "go go"})),
        ("c", json!({"text": "go"})),
    ]);
    let hits = search(&shard, json!({"term": {"text": "go"}}));
    assert_eq!(ids(&hits), vec!["a", "b", "c"]);
    assert!(hits[0].1 > hits[1].1 && hits[1].1 > hits[2].1);
}

#[test]
fn test_bm25_prefers_shorter_field_at_equal_tf() {
    let (_dir, shard) = shard_with(&[
        ("short", json!({"text": "go go"})),
        ("long", json!({"text": "go go filler filler filler filler"})),
    ]);
    let hits = search(&shard, json!({"term": {"text": "go"}}));
    assert_eq!(ids(&hits), vec!["short", "long"]);
    assert!(hits[0].1 >= hits[1].1);
}

#[test]
fn test_bool_filter_does_not_score() {
    // Five widgets at prices 10..50; the range filter narrows the set but
    // must not move any score.
    let docs: Vec<(String, Value)> = (1..=5)
        .map(|i| {
            (
                format!("p{i}"),
                json!({"name": "widget", "price": (i * 10) as f64}),
            )
        })
        .collect();
    let doc_refs: Vec<(&str, Value)> =
        docs.iter().map(|(id, d)| (id.as_str(), d.clone())).collect();
    let (_dir, shard) = shard_with(&doc_refs);

    let must_only = search(&shard, json!({"bool": {"must": [{"term": {"name": "widget"}}]}}));
    assert_eq!(must_only.len(), 5);
    let base_score = must_only[0].1;

    let filtered = search(
        &shard,
        json!({"bool": {
            "must": [{"term": {"name": "widget"}}],
            "filter": [{"range": {"price": {"gte": 20, "lte": 40}}}]
        }}),
    );
    assert_eq!(filtered.len(), 3);
    let mut prices: Vec<&str> = ids(&filtered);
    prices.sort();
    assert_eq!(prices, vec!["p2", "p3", "p4"]);
    for (_, score) in &filtered {
        assert!((score - base_score).abs() < 1e-6, "filter leaked into score");
    }
}

#[test]
fn test_bool_clause_order_is_irrelevant() {
    let (_dir, shard) = shard_with(&[
        ("a", json!({"text": "alpha beta", "category": "x"})),
        ("b", json!({"text": "alpha", "category": "x"})),
        ("c", json!({"text": "beta", "category": "y"})),
    ]);

    let forward = search(
        &shard,
        json!({"bool": {"must": [{"term": {"text": "alpha"}}, {"term": {"category": "x"}}]}}),
    );
    let reversed = search(
        &shard,
        json!({"bool": {"must": [{"term": {"category": "x"}}, {"term": {"text": "alpha"}}]}}),
    );
    assert_eq!(forward, reversed);

    let should_fwd = search(
        &shard,
        json!({"bool": {"should": [{"term": {"text": "alpha"}}, {"term": {"text": "beta"}}]}}),
    );
    let should_rev = search(
        &shard,
        json!({"bool": {"should": [{"term": {"text": "beta"}}, {"term": {"text": "alpha"}}]}}),
    );
    assert_eq!(should_fwd, should_rev);
    // Both clauses hit doc a, so it accumulates both contributions.
    assert_eq!(should_fwd[0].0, "a");
}

#[test]
fn test_bool_must_not_and_minimum_should_match() {
    let (_dir, shard) = shard_with(&[
        ("a", json!({"text": "red green blue"})),
        ("b", json!({"text": "red green"})),
        ("c", json!({"text": "red"})),
        ("d", json!({"text": "yellow"})),
    ]);

    let hits = search(
        &shard,
        json!({"bool": {
            "should": [
                {"term": {"text": "red"}},
                {"term": {"text": "green"}},
                {"term": {"text": "blue"}}
            ],
            "minimum_should_match": 2
        }}),
    );
    let mut matched = ids(&hits);
    matched.sort();
    assert_eq!(matched, vec!["a", "b"]);

    let hits = search(
        &shard,
        json!({"bool": {
            "must": [{"term": {"text": "red"}}],
            "must_not": [{"term": {"text": "blue"}}]
        }}),
    );
    let mut matched = ids(&hits);
    matched.sort();
    assert_eq!(matched, vec!["b", "c"]);
}

#[test]
fn test_match_sums_token_contributions() {
    let (_dir, shard) = shard_with(&[
        ("both", json!({"text": "quick fox"})),
        ("one", json!({"text": "quick snail"})),
        ("none", json!({"text": "slow snail"})),
    ]);
    let hits = search(&shard, json!({"match": {"text": "Quick, Fox!"}}));
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].0, "both");
    assert!(hits[0].1 > hits[1].1);
}

#[test]
fn test_phrase_requires_adjacent_order() {
    let (_dir, shard) = shard_with(&[
        ("exact", json!({"text": "brown fox jumps"})),
        ("gap", json!({"text": "brown lazy fox"})),
        ("reversed", json!({"text": "fox brown"})),
    ]);
    let hits = search(&shard, json!({"phrase": {"text": "brown fox"}}));
    assert_eq!(ids(&hits), vec!["exact"]);

    // The phrase hit outscores what a single constituent term gives the
    // same document.
    let term_hits = search(&shard, json!({"term": {"text": "brown"}}));
    let exact_term_score = term_hits
        .iter()
        .find(|(id, _)| id == "exact")
        .map(|(_, score)| *score)
        .unwrap();
    assert!(hits[0].1 > exact_term_score);
}

#[test]
fn test_prefix_wildcard_fuzzy() {
    let (_dir, shard) = shard_with(&[
        ("w", json!({"text": "widget"})),
        ("g", json!({"text": "gadget"})),
        ("wi", json!({"text": "wizard"})),
    ]);

    let hits = search(&shard, json!({"prefix": {"text": "wi"}}));
    let mut matched = ids(&hits);
    matched.sort();
    assert_eq!(matched, vec!["w", "wi"]);

    let hits = search(&shard, json!({"wildcard": {"text": "*dget"}}));
    let mut matched = ids(&hits);
    matched.sort();
    assert_eq!(matched, vec!["g", "w"]);

    let hits = search(&shard, json!({"wildcard": {"text": "w?dget"}}));
    assert_eq!(ids(&hits), vec!["w"]);

    let hits = search(&shard, json!({"fuzzy": {"text": "widgit"}}));
    assert_eq!(ids(&hits), vec!["w"]);

    let hits = search(&shard, json!({"fuzzy": {"text": {"value": "wadget", "fuzziness": 2}}}));
    let mut matched = ids(&hits);
    matched.sort();
    assert_eq!(matched, vec!["g", "w"]);
}

#[test]
fn test_range_bounds_inclusive_exclusive() {
    let (_dir, shard) = shard_with(&[
        ("s1", json!({"stock": 1})),
        ("s5", json!({"stock": 5})),
        ("s9", json!({"stock": 9})),
    ]);
    let hits = search(&shard, json!({"range": {"stock": {"gt": 1, "lte": 9}}}));
    let mut matched = ids(&hits);
    matched.sort();
    assert_eq!(matched, vec!["s5", "s9"]);

    let hits = search(&shard, json!({"range": {"stock": {"gte": 1, "lt": 9}}}));
    let mut matched = ids(&hits);
    matched.sort();
    assert_eq!(matched, vec!["s1", "s5"]);
}

#[test]
fn test_range_on_text_field_is_bad_query() {
    let (_dir, shard) = shard_with(&[("a", json!({"text": "x"}))]);
    let err = shard
        .search_raw(&json!({"range": {"text": {"gte": 1}}}), None, 0, 10, None)
        .unwrap_err();
    assert!(matches!(err, quidditch::Error::BadQuery(_)));
}

#[test]
fn test_pagination_is_deterministic() {
    let docs: Vec<(String, Value)> = (0..20)
        .map(|i| (format!("d{i:02}"), json!({"text": "same token"})))
        .collect();
    let doc_refs: Vec<(&str, Value)> =
        docs.iter().map(|(id, d)| (id.as_str(), d.clone())).collect();
    let (_dir, shard) = shard_with(&doc_refs);

    // Identical scores everywhere: pages must tile the id space without
    // overlap, in ascending internal-id order.
    let query = json!({"term": {"text": "token"}});
    let mut seen = Vec::new();
    for page in 0..4 {
        let result = shard.search_raw(&query, None, page * 5, 5, None).unwrap();
        assert_eq!(result.total_hits, 20);
        seen.extend(result.hits.into_iter().map(|h| h.doc_id));
    }
    let mut unique = seen.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 20);
}

#[test]
fn test_expression_filter_gates_candidates() {
    let (_dir, shard) = shard_with(&[
        ("cheap", json!({"name": "widget", "price": 5.0})),
        ("mid", json!({"name": "widget", "price": 50.0})),
        ("dear", json!({"name": "widget", "price": 500.0})),
    ]);

    // price >= 10 && price <= 100
    let expr = Expr::Binary {
        op: BinaryOp::And,
        lhs: Box::new(Expr::Binary {
            op: BinaryOp::Ge,
            lhs: Box::new(Expr::Field {
                name: "price".into(),
                ty: ResultType::Float,
            }),
            rhs: Box::new(Expr::Const(ExprValue::Float(10.0))),
        }),
        rhs: Box::new(Expr::Binary {
            op: BinaryOp::Le,
            lhs: Box::new(Expr::Field {
                name: "price".into(),
                ty: ResultType::Float,
            }),
            rhs: Box::new(Expr::Const(ExprValue::Float(100.0))),
        }),
    };
    let bytes = encode(&expr);

    let result = shard
        .search_raw(
            &json!({"term": {"name": "widget"}}),
            Some(&bytes),
            0,
            10,
            None,
        )
        .unwrap();
    assert_eq!(result.total_hits, 1);
    assert_eq!(result.hits[0].doc_id, "mid");
    assert_eq!(result.filter_evaluated, 3);
    assert_eq!(result.filter_matched, 1);
}

#[test]
fn test_aggregations_cover_matched_set_not_page() {
    let docs: Vec<(String, Value)> = (0..12)
        .map(|i| {
            (
                format!("d{i}"),
                json!({
                    "name": "widget",
                    "category": if i % 3 == 0 { "a" } else { "b" },
                    "price": i as f64,
                }),
            )
        })
        .collect();
    let doc_refs: Vec<(&str, Value)> =
        docs.iter().map(|(id, d)| (id.as_str(), d.clone())).collect();
    let (_dir, shard) = shard_with(&doc_refs);

    let result = shard
        .search_raw(
            &json!({"term": {"name": "widget"}}),
            None,
            0,
            2, // page far smaller than the matched set
            Some(&json!({
                "by_cat": {"terms": {"field": "category"}},
                "price_stats": {"stats": {"field": "price"}}
            })),
        )
        .unwrap();

    assert_eq!(result.hits.len(), 2);
    assert_eq!(result.total_hits, 12);

    let by_cat = result.aggregations["by_cat"].finalize();
    assert_eq!(by_cat["buckets"][0]["key"], "b");
    assert_eq!(by_cat["buckets"][0]["doc_count"], 8);
    assert_eq!(by_cat["buckets"][1]["doc_count"], 4);

    let stats = result.aggregations["price_stats"].finalize();
    assert_eq!(stats["count"], 12);
    assert_eq!(stats["min"], 0.0);
    assert_eq!(stats["max"], 11.0);
}

#[test]
fn test_keyword_field_is_not_tokenized() {
    let (_dir, shard) = shard_with(&[("a", json!({"category": "Home & Garden"}))]);
    // Exact verbatim value matches.
    let hits = search(&shard, json!({"term": {"category": "Home & Garden"}}));
    assert_eq!(ids(&hits), vec!["a"]);
    // A fragment does not.
    let hits = search(&shard, json!({"term": {"category": "Home"}}));
    assert!(hits.is_empty());
}

#[test]
fn test_term_by_id_field() {
    let (_dir, shard) = shard_with(&[
        ("a", json!({"text": "x"})),
        ("b", json!({"text": "x"})),
    ]);
    let hits = search(&shard, json!({"term": {"_id": "b"}}));
    assert_eq!(ids(&hits), vec!["b"]);
}
