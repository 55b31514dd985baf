//! Aggregation framework.
//!
//! Aggregations are computed over the matched document set of a query
//! (pagination never affects them). Each shard produces a mergeable
//! [`AggPartial`]; the coordinator merges partials across shards and
//! finalizes them into JSON. Keeping the partial/finalize split here, next
//! to the compute path, is what makes the cross-shard merge exact.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Default bucket count for `terms`.
const DEFAULT_TERMS_SIZE: usize = 10;

/// Default percentile points.
const DEFAULT_PERCENTS: [f64; 3] = [50.0, 95.0, 99.0];

/// Exact-set size above which cardinality switches to a sketch.
const CARDINALITY_EXACT_THRESHOLD: usize = 1024;

/// One aggregation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggSpec {
    Terms { field: String, size: usize },
    Stats { field: String },
    ExtendedStats { field: String },
    Histogram { field: String, interval: f64 },
    DateHistogram { field: String, interval_ms: i64 },
    Percentiles { field: String, percents: Vec<f64> },
    Cardinality { field: String },
    Avg { field: String },
    Min { field: String },
    Max { field: String },
    Sum { field: String },
    ValueCount { field: String },
}

impl AggSpec {
    /// Parse a mapping of agg-name to agg-spec. Unknown kinds and unknown
    /// parameters are rejected.
    pub fn parse_map(value: &Value) -> Result<BTreeMap<String, AggSpec>> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::BadQuery("aggs must be a JSON object".to_string()))?;
        let mut specs = BTreeMap::new();
        for (name, spec) in obj {
            specs.insert(name.clone(), Self::parse(spec)?);
        }
        Ok(specs)
    }

    pub fn parse(value: &Value) -> Result<AggSpec> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::BadQuery("agg spec must be a JSON object".to_string()))?;
        if obj.len() != 1 {
            return Err(Error::BadQuery(
                "agg spec must have exactly one kind key".to_string(),
            ));
        }
        let (kind, body) = obj.iter().next().unwrap();
        let body = body
            .as_object()
            .ok_or_else(|| Error::BadQuery(format!("{kind} body must be an object")))?;

        let field = |allowed: &[&str]| -> Result<String> {
            for key in body.keys() {
                if !allowed.contains(&key.as_str()) {
                    return Err(Error::BadQuery(format!("unknown {kind} key: {key}")));
                }
            }
            body.get("field")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::BadQuery(format!("{kind} requires a field")))
        };

        match kind.as_str() {
            "terms" => {
                let field = field(&["field", "size"])?;
                let size = match body.get("size") {
                    Some(v) => v
                        .as_u64()
                        .ok_or_else(|| Error::BadQuery("terms size must be an integer".into()))?
                        as usize,
                    None => DEFAULT_TERMS_SIZE,
                };
                Ok(AggSpec::Terms { field, size })
            }
            "stats" => Ok(AggSpec::Stats {
                field: field(&["field"])?,
            }),
            "extended_stats" => Ok(AggSpec::ExtendedStats {
                field: field(&["field"])?,
            }),
            "histogram" => {
                let field = field(&["field", "interval"])?;
                let interval = body
                    .get("interval")
                    .and_then(Value::as_f64)
                    .ok_or_else(|| Error::BadQuery("histogram requires an interval".into()))?;
                if interval <= 0.0 {
                    return Err(Error::BadQuery(
                        "histogram interval must be positive".to_string(),
                    ));
                }
                Ok(AggSpec::Histogram { field, interval })
            }
            "date_histogram" => {
                let field = field(&["field", "interval"])?;
                let raw = body
                    .get("interval")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        Error::BadQuery("date_histogram requires an interval".into())
                    })?;
                Ok(AggSpec::DateHistogram {
                    field,
                    interval_ms: parse_date_interval(raw)?,
                })
            }
            "percentiles" => {
                let field = field(&["field", "percents"])?;
                let percents = match body.get("percents") {
                    Some(Value::Array(items)) => {
                        let mut ps = Vec::with_capacity(items.len());
                        for item in items {
                            let p = item.as_f64().ok_or_else(|| {
                                Error::BadQuery("percents must be numeric".into())
                            })?;
                            if !(0.0..=100.0).contains(&p) {
                                return Err(Error::BadQuery(format!(
                                    "percent {p} outside [0, 100]"
                                )));
                            }
                            ps.push(p);
                        }
                        ps
                    }
                    Some(_) => {
                        return Err(Error::BadQuery("percents must be an array".to_string()))
                    }
                    None => DEFAULT_PERCENTS.to_vec(),
                };
                Ok(AggSpec::Percentiles { field, percents })
            }
            "cardinality" => Ok(AggSpec::Cardinality {
                field: field(&["field"])?,
            }),
            "avg" => Ok(AggSpec::Avg {
                field: field(&["field"])?,
            }),
            "min" => Ok(AggSpec::Min {
                field: field(&["field"])?,
            }),
            "max" => Ok(AggSpec::Max {
                field: field(&["field"])?,
            }),
            "sum" => Ok(AggSpec::Sum {
                field: field(&["field"])?,
            }),
            "value_count" => Ok(AggSpec::ValueCount {
                field: field(&["field"])?,
            }),
            other => Err(Error::BadQuery(format!("unknown aggregation kind: {other}"))),
        }
    }
}

/// Parse a time interval with a `ms`/`s`/`m`/`h`/`d` suffix into millis.
pub fn parse_date_interval(raw: &str) -> Result<i64> {
    let (digits, unit) = raw
        .find(|c: char| !c.is_ascii_digit())
        .map(|pos| raw.split_at(pos))
        .ok_or_else(|| Error::BadQuery(format!("interval {raw} is missing a unit")))?;
    let amount: i64 = digits
        .parse()
        .map_err(|_| Error::BadQuery(format!("bad interval amount in {raw}")))?;
    if amount <= 0 {
        return Err(Error::BadQuery(format!("interval {raw} must be positive")));
    }
    let unit_ms = match unit {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        other => {
            return Err(Error::BadQuery(format!("unknown interval unit: {other}")));
        }
    };
    Ok(amount * unit_ms)
}

// ============================================================================
// Partial results
// ============================================================================

/// Running sums shared by stats and the single-metric aggregations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsPartial {
    pub count: u64,
    pub sum: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl StatsPartial {
    pub fn observe(&mut self, v: f64) {
        self.count += 1;
        self.sum += v;
        self.min = Some(self.min.map_or(v, |m| m.min(v)));
        self.max = Some(self.max.map_or(v, |m| m.max(v)));
    }

    pub fn merge(&mut self, other: &StatsPartial) {
        self.count += other.count;
        self.sum += other.sum;
        self.min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    pub fn avg(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }
}

/// Which single metric a `Metric` partial finalizes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Avg,
    Min,
    Max,
    Sum,
    ValueCount,
}

/// Cardinality state: exact below the threshold, sketch above.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CardinalityPartial {
    Exact(BTreeSet<String>),
    Sketch(HllSketch),
}

impl CardinalityPartial {
    fn observe(&mut self, value: &str) {
        match self {
            CardinalityPartial::Exact(set) => {
                set.insert(value.to_string());
                if set.len() > CARDINALITY_EXACT_THRESHOLD {
                    let mut sketch = HllSketch::new();
                    for v in set.iter() {
                        sketch.add(v);
                    }
                    *self = CardinalityPartial::Sketch(sketch);
                }
            }
            CardinalityPartial::Sketch(sketch) => sketch.add(value),
        }
    }

    fn merge(&mut self, other: &CardinalityPartial) {
        match (&mut *self, other) {
            (CardinalityPartial::Exact(set), CardinalityPartial::Exact(other_set)) => {
                set.extend(other_set.iter().cloned());
                if set.len() > CARDINALITY_EXACT_THRESHOLD {
                    let mut sketch = HllSketch::new();
                    for v in set.iter() {
                        sketch.add(v);
                    }
                    *self = CardinalityPartial::Sketch(sketch);
                }
            }
            (CardinalityPartial::Sketch(sketch), CardinalityPartial::Exact(other_set)) => {
                for v in other_set {
                    sketch.add(v);
                }
            }
            (CardinalityPartial::Exact(set), CardinalityPartial::Sketch(other_sketch)) => {
                let mut sketch = other_sketch.clone();
                for v in set.iter() {
                    sketch.add(v);
                }
                *self = CardinalityPartial::Sketch(sketch);
            }
            (CardinalityPartial::Sketch(sketch), CardinalityPartial::Sketch(other_sketch)) => {
                sketch.merge(other_sketch);
            }
        }
    }

    fn estimate(&self) -> u64 {
        match self {
            CardinalityPartial::Exact(set) => set.len() as u64,
            CardinalityPartial::Sketch(sketch) => sketch.estimate(),
        }
    }
}

/// Fixed-register HyperLogLog sketch (2^10 registers, FNV-1a hashed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HllSketch {
    registers: Vec<u8>,
}

const HLL_BITS: u32 = 10;
const HLL_REGISTERS: usize = 1 << HLL_BITS;

impl Default for HllSketch {
    fn default() -> Self {
        Self::new()
    }
}

impl HllSketch {
    pub fn new() -> Self {
        Self {
            registers: vec![0; HLL_REGISTERS],
        }
    }

    pub fn add(&mut self, value: &str) {
        let hash = fnv1a_64(value.as_bytes());
        let idx = (hash & (HLL_REGISTERS as u64 - 1)) as usize;
        let rest = hash >> HLL_BITS;
        // Rank = position of the first set bit in the remaining 54 bits.
        let rank = (rest.trailing_zeros().min(64 - HLL_BITS) + 1) as u8;
        if rank > self.registers[idx] {
            self.registers[idx] = rank;
        }
    }

    pub fn merge(&mut self, other: &HllSketch) {
        for (mine, theirs) in self.registers.iter_mut().zip(&other.registers) {
            if *theirs > *mine {
                *mine = *theirs;
            }
        }
    }

    pub fn estimate(&self) -> u64 {
        let m = HLL_REGISTERS as f64;
        let alpha = 0.7213 / (1.0 + 1.079 / m);
        let harmonic: f64 = self
            .registers
            .iter()
            .map(|&r| 2f64.powi(-(r as i32)))
            .sum();
        let raw = alpha * m * m / harmonic;

        let zeros = self.registers.iter().filter(|&&r| r == 0).count();
        if raw <= 2.5 * m && zeros > 0 {
            (m * (m / zeros as f64).ln()).round() as u64
        } else {
            raw.round() as u64
        }
    }
}

fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// A shard-local aggregation result, mergeable across shards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggPartial {
    Terms {
        size: usize,
        counts: BTreeMap<String, u64>,
    },
    Stats(StatsPartial),
    ExtendedStats {
        stats: StatsPartial,
        sum_of_squares: f64,
    },
    Histogram {
        interval: f64,
        counts: BTreeMap<i64, u64>,
    },
    DateHistogram {
        interval_ms: i64,
        counts: BTreeMap<i64, u64>,
    },
    Percentiles {
        percents: Vec<f64>,
        samples: Vec<f64>,
    },
    Cardinality(CardinalityPartial),
    Metric {
        kind: MetricKind,
        stats: StatsPartial,
    },
}

impl AggPartial {
    /// Empty partial for a spec; merging partials of different shapes is an
    /// Internal error surfaced as BadRequest upstream.
    pub fn empty(spec: &AggSpec) -> AggPartial {
        match spec {
            AggSpec::Terms { size, .. } => AggPartial::Terms {
                size: *size,
                counts: BTreeMap::new(),
            },
            AggSpec::Stats { .. } => AggPartial::Stats(StatsPartial::default()),
            AggSpec::ExtendedStats { .. } => AggPartial::ExtendedStats {
                stats: StatsPartial::default(),
                sum_of_squares: 0.0,
            },
            AggSpec::Histogram { interval, .. } => AggPartial::Histogram {
                interval: *interval,
                counts: BTreeMap::new(),
            },
            AggSpec::DateHistogram { interval_ms, .. } => AggPartial::DateHistogram {
                interval_ms: *interval_ms,
                counts: BTreeMap::new(),
            },
            AggSpec::Percentiles { percents, .. } => AggPartial::Percentiles {
                percents: percents.clone(),
                samples: Vec::new(),
            },
            AggSpec::Cardinality { .. } => {
                AggPartial::Cardinality(CardinalityPartial::Exact(BTreeSet::new()))
            }
            AggSpec::Avg { .. } => AggPartial::Metric {
                kind: MetricKind::Avg,
                stats: StatsPartial::default(),
            },
            AggSpec::Min { .. } => AggPartial::Metric {
                kind: MetricKind::Min,
                stats: StatsPartial::default(),
            },
            AggSpec::Max { .. } => AggPartial::Metric {
                kind: MetricKind::Max,
                stats: StatsPartial::default(),
            },
            AggSpec::Sum { .. } => AggPartial::Metric {
                kind: MetricKind::Sum,
                stats: StatsPartial::default(),
            },
            AggSpec::ValueCount { .. } => AggPartial::Metric {
                kind: MetricKind::ValueCount,
                stats: StatsPartial::default(),
            },
        }
    }

    /// Fold one document's field value into the partial.
    fn observe(&mut self, value: &Value) {
        match self {
            AggPartial::Terms { counts, .. } => {
                if let Some(key) = bucket_key(value) {
                    *counts.entry(key).or_insert(0) += 1;
                }
            }
            AggPartial::Stats(stats) => {
                if let Some(v) = numeric(value) {
                    stats.observe(v);
                }
            }
            AggPartial::ExtendedStats {
                stats,
                sum_of_squares,
            } => {
                if let Some(v) = numeric(value) {
                    stats.observe(v);
                    *sum_of_squares += v * v;
                }
            }
            AggPartial::Histogram { interval, counts } => {
                if let Some(v) = numeric(value) {
                    let bucket = (v / *interval).floor() as i64;
                    *counts.entry(bucket).or_insert(0) += 1;
                }
            }
            AggPartial::DateHistogram {
                interval_ms,
                counts,
            } => {
                if let Some(ms) = value.as_i64() {
                    let bucket = ms.div_euclid(*interval_ms);
                    *counts.entry(bucket).or_insert(0) += 1;
                }
            }
            AggPartial::Percentiles { samples, .. } => {
                if let Some(v) = numeric(value) {
                    samples.push(v);
                }
            }
            AggPartial::Cardinality(partial) => {
                if let Some(key) = bucket_key(value) {
                    partial.observe(&key);
                }
            }
            AggPartial::Metric { stats, .. } => {
                if let Some(v) = numeric(value) {
                    stats.observe(v);
                }
            }
        }
    }

    /// Merge another shard's partial into this one.
    pub fn merge(&mut self, other: &AggPartial) -> Result<()> {
        match (self, other) {
            (
                AggPartial::Terms { counts, size },
                AggPartial::Terms {
                    counts: other_counts,
                    size: other_size,
                },
            ) => {
                *size = (*size).max(*other_size);
                for (key, n) in other_counts {
                    *counts.entry(key.clone()).or_insert(0) += n;
                }
            }
            (AggPartial::Stats(stats), AggPartial::Stats(other_stats)) => {
                stats.merge(other_stats)
            }
            (
                AggPartial::ExtendedStats {
                    stats,
                    sum_of_squares,
                },
                AggPartial::ExtendedStats {
                    stats: other_stats,
                    sum_of_squares: other_squares,
                },
            ) => {
                stats.merge(other_stats);
                *sum_of_squares += other_squares;
            }
            (
                AggPartial::Histogram { counts, .. },
                AggPartial::Histogram {
                    counts: other_counts,
                    ..
                },
            ) => {
                for (bucket, n) in other_counts {
                    *counts.entry(*bucket).or_insert(0) += n;
                }
            }
            (
                AggPartial::DateHistogram { counts, .. },
                AggPartial::DateHistogram {
                    counts: other_counts,
                    ..
                },
            ) => {
                for (bucket, n) in other_counts {
                    *counts.entry(*bucket).or_insert(0) += n;
                }
            }
            (
                AggPartial::Percentiles { samples, .. },
                AggPartial::Percentiles {
                    samples: other_samples,
                    ..
                },
            ) => samples.extend_from_slice(other_samples),
            (AggPartial::Cardinality(partial), AggPartial::Cardinality(other_partial)) => {
                partial.merge(other_partial)
            }
            (
                AggPartial::Metric { stats, .. },
                AggPartial::Metric {
                    stats: other_stats, ..
                },
            ) => stats.merge(other_stats),
            _ => {
                return Err(Error::BadRequest(
                    "mismatched aggregation partials".to_string(),
                ))
            }
        }
        Ok(())
    }

    /// Finalize into the response JSON.
    pub fn finalize(&self) -> Value {
        match self {
            AggPartial::Terms { size, counts } => {
                let mut buckets: Vec<(&String, &u64)> = counts.iter().collect();
                buckets.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
                let buckets: Vec<Value> = buckets
                    .into_iter()
                    .take(*size)
                    .map(|(key, n)| json!({"key": key, "doc_count": n}))
                    .collect();
                json!({ "buckets": buckets })
            }
            AggPartial::Stats(stats) => json!({
                "count": stats.count,
                "min": stats.min,
                "max": stats.max,
                "avg": stats.avg(),
                "sum": stats.sum,
            }),
            AggPartial::ExtendedStats {
                stats,
                sum_of_squares,
            } => {
                let variance = if stats.count == 0 {
                    None
                } else {
                    let mean = stats.sum / stats.count as f64;
                    Some((sum_of_squares / stats.count as f64 - mean * mean).max(0.0))
                };
                let std_deviation = variance.map(f64::sqrt);
                let bounds = match (stats.avg(), std_deviation) {
                    (Some(avg), Some(sd)) => {
                        json!({"upper": avg + 2.0 * sd, "lower": avg - 2.0 * sd})
                    }
                    _ => json!({"upper": null, "lower": null}),
                };
                json!({
                    "count": stats.count,
                    "min": stats.min,
                    "max": stats.max,
                    "avg": stats.avg(),
                    "sum": stats.sum,
                    "sum_of_squares": sum_of_squares,
                    "variance": variance,
                    "std_deviation": std_deviation,
                    "std_deviation_bounds": bounds,
                })
            }
            AggPartial::Histogram { interval, counts } => {
                let buckets: Vec<Value> = counts
                    .iter()
                    .map(|(bucket, n)| {
                        json!({"key": *bucket as f64 * interval, "doc_count": n})
                    })
                    .collect();
                json!({ "buckets": buckets })
            }
            AggPartial::DateHistogram {
                interval_ms,
                counts,
            } => {
                let buckets: Vec<Value> = counts
                    .iter()
                    .map(|(bucket, n)| {
                        let key_ms = bucket * interval_ms;
                        let key_string = chrono::DateTime::from_timestamp_millis(key_ms)
                            .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true));
                        json!({"key": key_ms, "key_as_string": key_string, "doc_count": n})
                    })
                    .collect();
                json!({ "buckets": buckets })
            }
            AggPartial::Percentiles { percents, samples } => {
                let mut sorted = samples.clone();
                sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let mut values = serde_json::Map::new();
                for &p in percents {
                    values.insert(format!("{p}"), json!(percentile(&sorted, p)));
                }
                json!({ "values": values })
            }
            AggPartial::Cardinality(partial) => json!({"value": partial.estimate()}),
            AggPartial::Metric { kind, stats } => {
                let value = match kind {
                    MetricKind::Avg => stats.avg().map(Value::from).unwrap_or(Value::Null),
                    MetricKind::Min => stats.min.map(Value::from).unwrap_or(Value::Null),
                    MetricKind::Max => stats.max.map(Value::from).unwrap_or(Value::Null),
                    MetricKind::Sum => Value::from(stats.sum),
                    MetricKind::ValueCount => Value::from(stats.count),
                };
                json!({ "value": value })
            }
        }
    }
}

/// Percentile via linear interpolation between sorted samples.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    if sorted.len() == 1 {
        return Some(sorted[0]);
    }
    let rank = (p / 100.0) * (sorted.len() as f64 - 1.0);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper || upper >= sorted.len() {
        Some(sorted[lower.min(sorted.len() - 1)])
    } else {
        let frac = rank - lower as f64;
        Some(sorted[lower] * (1.0 - frac) + sorted[upper] * frac)
    }
}

fn numeric(value: &Value) -> Option<f64> {
    value.as_f64()
}

/// Bucket key representation for terms/cardinality: strings verbatim,
/// numbers and booleans by display form.
fn bucket_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Compute the partials for `specs` over the stored fields of every matched
/// document.
pub fn compute_partials<'a>(
    specs: &BTreeMap<String, AggSpec>,
    docs: impl Iterator<Item = &'a Value>,
) -> BTreeMap<String, AggPartial> {
    let mut partials: BTreeMap<String, AggPartial> = specs
        .iter()
        .map(|(name, spec)| (name.clone(), AggPartial::empty(spec)))
        .collect();

    for doc in docs {
        for (name, spec) in specs {
            let field = spec_field(spec);
            let partial = partials.get_mut(name).expect("partial seeded above");
            match doc.get(field) {
                Some(Value::Array(items)) => {
                    for item in items {
                        partial.observe(item);
                    }
                }
                Some(value) => partial.observe(value),
                None => {}
            }
        }
    }

    partials
}

fn spec_field(spec: &AggSpec) -> &str {
    match spec {
        AggSpec::Terms { field, .. }
        | AggSpec::Stats { field }
        | AggSpec::ExtendedStats { field }
        | AggSpec::Histogram { field, .. }
        | AggSpec::DateHistogram { field, .. }
        | AggSpec::Percentiles { field, .. }
        | AggSpec::Cardinality { field }
        | AggSpec::Avg { field }
        | AggSpec::Min { field }
        | AggSpec::Max { field }
        | AggSpec::Sum { field }
        | AggSpec::ValueCount { field } => field,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn docs(values: &[Value]) -> Vec<Value> {
        values.to_vec()
    }

    #[test]
    fn test_parse_terms_defaults() {
        let specs = AggSpec::parse_map(&json!({"by_cat": {"terms": {"field": "cat"}}})).unwrap();
        assert_eq!(
            specs["by_cat"],
            AggSpec::Terms {
                field: "cat".into(),
                size: DEFAULT_TERMS_SIZE
            }
        );
    }

    #[test]
    fn test_parse_unknown_kind() {
        assert!(AggSpec::parse_map(&json!({"x": {"median": {"field": "a"}}})).is_err());
    }

    #[test]
    fn test_parse_unknown_param() {
        assert!(
            AggSpec::parse_map(&json!({"x": {"terms": {"field": "a", "shard_size": 5}}})).is_err()
        );
    }

    #[test]
    fn test_parse_date_interval() {
        assert_eq!(parse_date_interval("500ms").unwrap(), 500);
        assert_eq!(parse_date_interval("30s").unwrap(), 30_000);
        assert_eq!(parse_date_interval("5m").unwrap(), 300_000);
        assert_eq!(parse_date_interval("2h").unwrap(), 7_200_000);
        assert_eq!(parse_date_interval("1d").unwrap(), 86_400_000);
        assert!(parse_date_interval("1w").is_err());
        assert!(parse_date_interval("d").is_err());
    }

    #[test]
    fn test_terms_counts_and_top_n() {
        let specs =
            AggSpec::parse_map(&json!({"t": {"terms": {"field": "color", "size": 2}}})).unwrap();
        let docs = docs(&[
            json!({"color": "red"}),
            json!({"color": "red"}),
            json!({"color": "blue"}),
            json!({"color": "green"}),
            json!({"color": "blue"}),
            json!({"color": "red"}),
        ]);
        let partials = compute_partials(&specs, docs.iter());
        let out = partials["t"].finalize();
        let buckets = out["buckets"].as_array().unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0]["key"], "red");
        assert_eq!(buckets[0]["doc_count"], 3);
        assert_eq!(buckets[1]["key"], "blue");
    }

    #[test]
    fn test_stats() {
        let specs = AggSpec::parse_map(&json!({"s": {"stats": {"field": "price"}}})).unwrap();
        let docs = docs(&[
            json!({"price": 10.0}),
            json!({"price": 20.0}),
            json!({"price": 30.0}),
        ]);
        let out = compute_partials(&specs, docs.iter())["s"].finalize();
        assert_eq!(out["count"], 3);
        assert_eq!(out["min"], 10.0);
        assert_eq!(out["max"], 30.0);
        assert_eq!(out["sum"], 60.0);
        assert_eq!(out["avg"], 20.0);
    }

    #[test]
    fn test_histogram_floors_keys() {
        let specs =
            AggSpec::parse_map(&json!({"h": {"histogram": {"field": "v", "interval": 10.0}}}))
                .unwrap();
        let docs = docs(&[
            json!({"v": 3}),
            json!({"v": 9}),
            json!({"v": 10}),
            json!({"v": 27}),
            json!({"v": -4}),
        ]);
        let out = compute_partials(&specs, docs.iter())["h"].finalize();
        let buckets = out["buckets"].as_array().unwrap();
        let keys: Vec<f64> = buckets.iter().map(|b| b["key"].as_f64().unwrap()).collect();
        assert_eq!(keys, vec![-10.0, 0.0, 10.0, 20.0]);
        assert_eq!(buckets[1]["doc_count"], 2);
    }

    #[test]
    fn test_date_histogram_buckets() {
        let specs = AggSpec::parse_map(
            &json!({"d": {"date_histogram": {"field": "ts", "interval": "1h"}}}),
        )
        .unwrap();
        let hour = 3_600_000i64;
        let docs = docs(&[
            json!({"ts": hour + 5}),
            json!({"ts": hour + 100}),
            json!({"ts": 3 * hour}),
        ]);
        let out = compute_partials(&specs, docs.iter())["d"].finalize();
        let buckets = out["buckets"].as_array().unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0]["key"], hour);
        assert_eq!(buckets[0]["doc_count"], 2);
        assert!(buckets[0]["key_as_string"].as_str().unwrap().starts_with("1970-01-01T01"));
    }

    #[test]
    fn test_percentiles_interpolation() {
        let sorted: Vec<f64> = (1..=100).map(|i| i as f64).collect();
        assert_eq!(percentile(&sorted, 50.0), Some(50.5));
        assert_eq!(percentile(&sorted, 0.0), Some(1.0));
        assert_eq!(percentile(&sorted, 100.0), Some(100.0));
        assert_eq!(percentile(&[], 50.0), None);
        assert_eq!(percentile(&[7.0], 95.0), Some(7.0));
    }

    #[test]
    fn test_extended_stats_variance() {
        let specs =
            AggSpec::parse_map(&json!({"e": {"extended_stats": {"field": "v"}}})).unwrap();
        let docs = docs(&[json!({"v": 2.0}), json!({"v": 4.0}), json!({"v": 6.0})]);
        let out = compute_partials(&specs, docs.iter())["e"].finalize();
        let variance = out["variance"].as_f64().unwrap();
        assert!((variance - 8.0 / 3.0).abs() < 1e-9);
        let sd = out["std_deviation"].as_f64().unwrap();
        assert!((sd - variance.sqrt()).abs() < 1e-9);
        let upper = out["std_deviation_bounds"]["upper"].as_f64().unwrap();
        assert!((upper - (4.0 + 2.0 * sd)).abs() < 1e-9);
    }

    #[test]
    fn test_cardinality_exact_small() {
        let specs = AggSpec::parse_map(&json!({"c": {"cardinality": {"field": "u"}}})).unwrap();
        let docs: Vec<Value> = (0..100).map(|i| json!({"u": format!("user-{}", i % 25)})).collect();
        let out = compute_partials(&specs, docs.iter())["c"].finalize();
        assert_eq!(out["value"], 25);
    }

    #[test]
    fn test_cardinality_sketch_approximates() {
        let specs = AggSpec::parse_map(&json!({"c": {"cardinality": {"field": "u"}}})).unwrap();
        let docs: Vec<Value> = (0..5000).map(|i| json!({"u": format!("user-{i}")})).collect();
        let partials = compute_partials(&specs, docs.iter());
        assert!(matches!(
            partials["c"],
            AggPartial::Cardinality(CardinalityPartial::Sketch(_))
        ));
        let value = partials["c"].finalize()["value"].as_u64().unwrap();
        // ~3% standard error at 1024 registers; allow a wide margin.
        assert!((4250..=5750).contains(&value), "estimate {value} too far off");
    }

    #[test]
    fn test_merge_terms_across_shards() {
        let specs =
            AggSpec::parse_map(&json!({"t": {"terms": {"field": "c", "size": 10}}})).unwrap();
        let shard1 = compute_partials(
            &specs,
            docs(&[json!({"c": "a"}), json!({"c": "b"})]).iter(),
        );
        let shard2 = compute_partials(
            &specs,
            docs(&[json!({"c": "a"}), json!({"c": "a"})]).iter(),
        );
        let mut merged = shard1["t"].clone();
        merged.merge(&shard2["t"]).unwrap();
        let out = merged.finalize();
        assert_eq!(out["buckets"][0]["key"], "a");
        assert_eq!(out["buckets"][0]["doc_count"], 3);
    }

    #[test]
    fn test_merge_stats_and_metric() {
        let specs = AggSpec::parse_map(
            &json!({"s": {"stats": {"field": "v"}}, "a": {"avg": {"field": "v"}}}),
        )
        .unwrap();
        let shard1 = compute_partials(&specs, docs(&[json!({"v": 1.0})]).iter());
        let shard2 =
            compute_partials(&specs, docs(&[json!({"v": 3.0}), json!({"v": 5.0})]).iter());
        let mut stats = shard1["s"].clone();
        stats.merge(&shard2["s"]).unwrap();
        let out = stats.finalize();
        assert_eq!(out["count"], 3);
        assert_eq!(out["avg"], 3.0);

        let mut avg = shard1["a"].clone();
        avg.merge(&shard2["a"]).unwrap();
        assert_eq!(avg.finalize()["value"], 3.0);
    }

    #[test]
    fn test_merge_mismatched_shapes_rejected() {
        let mut stats = AggPartial::Stats(StatsPartial::default());
        let terms = AggPartial::Terms {
            size: 10,
            counts: BTreeMap::new(),
        };
        assert!(stats.merge(&terms).is_err());
    }

    #[test]
    fn test_hll_merge_commutes() {
        let mut a = HllSketch::new();
        let mut b = HllSketch::new();
        for i in 0..2000 {
            a.add(&format!("a-{i}"));
            b.add(&format!("b-{i}"));
        }
        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab.estimate(), ba.estimate());
        assert!(ab.estimate() > a.estimate());
    }

    #[test]
    fn test_missing_field_ignored() {
        let specs = AggSpec::parse_map(&json!({"s": {"sum": {"field": "v"}}})).unwrap();
        let docs = docs(&[json!({"other": 1}), json!({"v": 2.5})]);
        let out = compute_partials(&specs, docs.iter())["s"].finalize();
        assert_eq!(out["value"], 2.5);
    }
}
