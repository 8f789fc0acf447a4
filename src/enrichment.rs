//! Two-group enrichment of annotation counts (EC, PFAM, COG, KO...) between
//! samples split on a biosample property.

use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::collection::Record;
use crate::error::NmdcError;
use crate::export::ExportFormat;
use crate::fs_util::write_atomic;
use crate::gff::{GffFeature, GffReader};

/// One sample: its biosample properties plus annotation counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    #[serde(default)]
    pub annotations: BTreeMap<String, u64>,
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

/// Samples keyed by biosample id.
pub type Samples = BTreeMap<String, Sample>;

pub fn parse_samples(json: &str) -> Result<Samples, NmdcError> {
    serde_json::from_str(json).map_err(|err| NmdcError::ConfigParse(err.to_string()))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum FdrMethod {
    #[default]
    BenjaminiHochberg,
    Bonferroni,
}

impl FromStr for FdrMethod {
    type Err = NmdcError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "benjamini-hochberg" | "fdr_bh" | "bh" => Ok(FdrMethod::BenjaminiHochberg),
            "bonferroni" => Ok(FdrMethod::Bonferroni),
            other => Err(NmdcError::Enrichment(format!("unknown FDR method: {other}"))),
        }
    }
}

/// How samples are split into the two comparison groups.
#[derive(Debug, Clone, PartialEq)]
pub enum Grouping {
    /// `value <= t` versus `value > t`.
    Threshold(f64),
    /// Threshold at the median of the numeric values.
    Median,
    /// Equal-width bins between min and max; only 2 is accepted.
    Bins(u32),
    /// Exactly these category values, in this order.
    Categories(Vec<String>),
    /// Categories when the property is textual, median split otherwise.
    Auto,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichmentResult {
    pub feature_id: String,
    pub feature_name: String,
    pub group1_name: String,
    pub group2_name: String,
    pub group1_count: u64,
    pub group2_count: u64,
    pub group1_total: u64,
    pub group2_total: u64,
    pub p_value: f64,
    pub fdr: f64,
    pub effect_size: f64,
    pub enriched_in: String,
}

/// Resolves ontology term ids (EC, ENVO...) to readable labels.
pub trait LabelLookup {
    fn label(&self, term_id: &str) -> Option<String>;
}

/// Lookup that knows no labels; ids are reported as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLabels;

impl LabelLookup for NoLabels {
    fn label(&self, _term_id: &str) -> Option<String> {
        None
    }
}

impl LabelLookup for BTreeMap<String, String> {
    fn label(&self, term_id: &str) -> Option<String> {
        self.get(term_id).cloned()
    }
}

impl<L: LabelLookup + ?Sized> LabelLookup for &L {
    fn label(&self, term_id: &str) -> Option<String> {
        (**self).label(term_id)
    }
}

/// Caches another lookup's answers, misses included, in a bounded LRU.
pub struct MemoizedLookup<L> {
    inner: L,
    cache: Mutex<LruCache<String, Option<String>>>,
}

impl<L: LabelLookup> MemoizedLookup<L> {
    pub fn new(inner: L, capacity: NonZeroUsize) -> Self {
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }
}

impl<L: LabelLookup> LabelLookup for MemoizedLookup<L> {
    fn label(&self, term_id: &str) -> Option<String> {
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(hit) = cache.get(term_id) {
                return hit.clone();
            }
        }
        let label = self.inner.label(term_id);
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(term_id.to_string(), label.clone());
        }
        label
    }
}

pub struct EnrichmentAnalyzer<L = NoLabels> {
    pub fdr: FdrMethod,
    pub min_count: u64,
    labels: L,
}

impl Default for EnrichmentAnalyzer<NoLabels> {
    fn default() -> Self {
        Self {
            fdr: FdrMethod::default(),
            min_count: 5,
            labels: NoLabels,
        }
    }
}

impl<L: LabelLookup> EnrichmentAnalyzer<L> {
    pub fn new(fdr: FdrMethod, min_count: u64, labels: L) -> Self {
        Self {
            fdr,
            min_count,
            labels,
        }
    }

    fn display_name(&self, id: &str) -> String {
        self.labels.label(id).unwrap_or_else(|| id.to_string())
    }

    /// Tests every annotation seen in either group with Fisher's exact test
    /// and returns the results ordered by `(fdr, p_value)`.
    pub fn analyze(
        &self,
        samples: &Samples,
        group_by: &str,
        grouping: &Grouping,
    ) -> Result<Vec<EnrichmentResult>, NmdcError> {
        let groups = group_samples(samples, group_by, grouping)?;
        let [(name1, group1), (name2, group2)] =
            <[_; 2]>::try_from(groups).map_err(|groups: Vec<_>| {
                NmdcError::Enrichment(format!(
                    "enrichment requires exactly 2 groups, got {}; use a threshold, bins or categories",
                    groups.len()
                ))
            })?;

        let label1 = self.display_name(&name1);
        let label2 = self.display_name(&name2);
        info!(group = %label1, samples = group1.len(), "group 1");
        info!(group = %label2, samples = group2.len(), "group 2");

        let features: BTreeSet<&str> = group1
            .iter()
            .chain(group2.iter())
            .flat_map(|sample| sample.annotations.keys().map(String::as_str))
            .collect();
        info!(features = features.len(), "testing features");

        let total1 = total_counts(&group1);
        let total2 = total_counts(&group2);

        let mut results = Vec::new();
        for feature in features {
            let count1 = feature_count(&group1, feature);
            let count2 = feature_count(&group2, feature);
            if count1 + count2 < self.min_count {
                continue;
            }

            let p_value = fisher_exact(
                count1,
                total1.saturating_sub(count1),
                count2,
                total2.saturating_sub(count2),
            );
            let rate1 = rate(count1, total1);
            let rate2 = rate(count2, total2);
            let enriched_in = if rate1 > rate2 { &name1 } else { &name2 };

            results.push(EnrichmentResult {
                feature_id: feature.to_string(),
                feature_name: self.display_name(feature),
                group1_name: label1.clone(),
                group2_name: label2.clone(),
                group1_count: count1,
                group2_count: count2,
                group1_total: total1,
                group2_total: total2,
                p_value,
                fdr: 0.0,
                effect_size: effect_size(count1, total1, count2, total2),
                enriched_in: self.display_name(enriched_in),
            });
        }

        let p_values: Vec<f64> = results.iter().map(|result| result.p_value).collect();
        let adjusted = match self.fdr {
            FdrMethod::BenjaminiHochberg => benjamini_hochberg(&p_values),
            FdrMethod::Bonferroni => bonferroni(&p_values),
        };
        for (result, fdr) in results.iter_mut().zip(adjusted) {
            result.fdr = fdr;
        }
        results.sort_by(|a, b| {
            a.fdr
                .total_cmp(&b.fdr)
                .then_with(|| a.p_value.total_cmp(&b.p_value))
        });
        debug!(results = results.len(), "enrichment complete");
        Ok(results)
    }
}

type Group<'a> = (String, Vec<&'a Sample>);

/// Splits samples into named groups, in a stable order. Samples without the
/// property are left out.
pub fn group_samples<'a>(
    samples: &'a Samples,
    group_by: &str,
    grouping: &Grouping,
) -> Result<Vec<Group<'a>>, NmdcError> {
    let with_value: Vec<(&Sample, &Value)> = samples
        .values()
        .filter_map(|sample| sample.properties.get(group_by).map(|value| (sample, value)))
        .collect();
    let Some((_, first)) = with_value.first() else {
        return Err(NmdcError::Enrichment(format!(
            "property '{group_by}' not found in any samples"
        )));
    };

    if let Grouping::Categories(categories) = grouping {
        let mut groups: Vec<Group<'a>> = categories
            .iter()
            .map(|category| (category.clone(), Vec::new()))
            .collect();
        for (sample, value) in &with_value {
            let Some(text) = value.as_str() else { continue };
            if let Some((_, members)) = groups.iter_mut().find(|(name, _)| name == text) {
                members.push(*sample);
            }
        }
        return Ok(groups);
    }

    if first.is_string() {
        let mut groups: Vec<Group<'a>> = Vec::new();
        for (sample, value) in &with_value {
            let category = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            match groups.iter_mut().find(|(name, _)| *name == category) {
                Some((_, members)) => members.push(*sample),
                None => groups.push((category, vec![*sample])),
            }
        }
        return Ok(groups);
    }

    let numeric: Vec<(&Sample, f64)> = with_value
        .iter()
        .filter_map(|(sample, value)| value.as_f64().map(|number| (*sample, number)))
        .collect();
    if numeric.is_empty() {
        return Err(NmdcError::Enrichment(format!(
            "property '{group_by}' has no numeric values"
        )));
    }

    match grouping {
        Grouping::Threshold(threshold) => Ok(split_at(&numeric, group_by, *threshold)),
        Grouping::Bins(bins) => {
            if *bins != 2 {
                return Err(NmdcError::Enrichment(format!(
                    "bins={bins} would create {bins} groups, need exactly 2"
                )));
            }
            let min = numeric.iter().map(|(_, v)| *v).fold(f64::INFINITY, f64::min);
            let max = numeric.iter().map(|(_, v)| *v).fold(f64::NEG_INFINITY, f64::max);
            let middle = min + (max - min) / 2.0;
            let mut low = (format!("{group_by} [{min:.1}, {middle:.1})"), Vec::new());
            let mut high = (format!("{group_by} [{middle:.1}, {max:.1}]"), Vec::new());
            for (sample, value) in &numeric {
                if *value < middle {
                    low.1.push(*sample);
                } else {
                    high.1.push(*sample);
                }
            }
            Ok(vec![low, high])
        }
        Grouping::Median | Grouping::Auto | Grouping::Categories(_) => {
            let mut values: Vec<f64> = numeric.iter().map(|(_, v)| *v).collect();
            values.sort_by(f64::total_cmp);
            let median = values[values.len() / 2];
            info!(median, "auto-thresholding at median");
            Ok(split_at(&numeric, group_by, median))
        }
    }
}

fn split_at<'a>(numeric: &[(&'a Sample, f64)], group_by: &str, threshold: f64) -> Vec<Group<'a>> {
    let mut low = (format!("{group_by} ≤ {threshold:?}"), Vec::new());
    let mut high = (format!("{group_by} > {threshold:?}"), Vec::new());
    for (sample, value) in numeric {
        if *value <= threshold {
            low.1.push(*sample);
        } else {
            high.1.push(*sample);
        }
    }
    vec![low, high]
}

fn feature_count(samples: &[&Sample], feature: &str) -> u64 {
    samples
        .iter()
        .filter_map(|sample| sample.annotations.get(feature))
        .sum()
}

fn total_counts(samples: &[&Sample]) -> u64 {
    samples
        .iter()
        .map(|sample| sample.annotations.values().sum::<u64>())
        .sum()
}

fn rate(count: u64, total: u64) -> f64 {
    if total > 0 {
        count as f64 / total as f64
    } else {
        0.0
    }
}

/// Ratio of the two rates: infinite when only the second group lacks the
/// feature, 1 when neither has it.
pub fn effect_size(count1: u64, total1: u64, count2: u64, total2: u64) -> f64 {
    let rate1 = rate(count1, total1);
    let rate2 = rate(count2, total2);
    if rate2 == 0.0 {
        if rate1 > 0.0 { f64::INFINITY } else { 1.0 }
    } else {
        rate1 / rate2
    }
}

/// Two-sided Fisher's exact test on `[[a, b], [c, d]]`: the summed
/// probability of every table with the same margins that is no more likely
/// than the observed one.
pub fn fisher_exact(a: u64, b: u64, c: u64, d: u64) -> f64 {
    let row1 = a + b;
    let row2 = c + d;
    let col1 = a + c;
    let n = row1 + row2;
    if n == 0 || row1 == 0 || row2 == 0 || col1 == 0 || col1 == n {
        return 1.0;
    }

    let log_denominator = ln_choose(n, col1);
    let probability = |x: u64| -> f64 {
        (ln_choose(row1, x) + ln_choose(row2, col1 - x) - log_denominator).exp()
    };

    let observed = probability(a);
    let cutoff = observed * (1.0 + 1e-7);
    let low = col1.saturating_sub(row2);
    let high = row1.min(col1);
    let p: f64 = (low..=high)
        .map(probability)
        .filter(|p| *p <= cutoff)
        .sum();
    p.min(1.0)
}

fn ln_choose(n: u64, k: u64) -> f64 {
    ln_factorial(n) - ln_factorial(k) - ln_factorial(n - k)
}

fn ln_factorial(n: u64) -> f64 {
    if n < 2 {
        0.0
    } else {
        ln_gamma(n as f64 + 1.0)
    }
}

/// Lanczos approximation (g = 7, n = 9).
fn ln_gamma(x: f64) -> f64 {
    const COEFFICIENTS: [f64; 9] = [
        0.999_999_999_999_809_9,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];
    let x = x - 1.0;
    let mut sum = COEFFICIENTS[0];
    for (i, coefficient) in COEFFICIENTS.iter().enumerate().skip(1) {
        sum += coefficient / (x + i as f64);
    }
    let t = x + 7.5;
    0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + sum.ln()
}

/// Benjamini-Hochberg adjusted p-values, monotone in p and capped at 1.
pub fn benjamini_hochberg(p_values: &[f64]) -> Vec<f64> {
    let n = p_values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| p_values[i].total_cmp(&p_values[j]));

    let mut adjusted = vec![0.0; n];
    let mut running_min = 1.0_f64;
    for (rank, &index) in order.iter().enumerate().rev() {
        let value = p_values[index] * n as f64 / (rank + 1) as f64;
        running_min = running_min.min(value);
        adjusted[index] = running_min.min(1.0);
    }
    adjusted
}

pub fn bonferroni(p_values: &[f64]) -> Vec<f64> {
    let n = p_values.len() as f64;
    p_values.iter().map(|p| (p * n).min(1.0)).collect()
}

const NUMERIC_PROPERTIES: [&str; 6] = [
    "depth",
    "ph",
    "temperature",
    "salinity",
    "latitude",
    "longitude",
];

const CATEGORICAL_PROPERTIES: [&str; 7] = [
    "ecosystem",
    "ecosystem_category",
    "ecosystem_type",
    "ecosystem_subtype",
    "env_medium",
    "env_broad_scale",
    "env_local_scale",
];

/// Counts the values of one annotation column; comma-separated cells count
/// once per value.
pub fn count_annotations(features: &[GffFeature], column: &str) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    for feature in features {
        let Some(cell) = feature.annotation(column) else {
            continue;
        };
        for value in cell.split(',').map(str::trim).filter(|value| !value.is_empty()) {
            *counts.entry(value.to_string()).or_insert(0) += 1;
        }
    }
    counts
}

/// Builds a sample from a biosample record: numeric properties are read from
/// the plain field or a `QuantityValue`, categorical ones from the raw value.
pub fn sample_from_biosample(biosample: &Record, annotations: BTreeMap<String, u64>) -> Sample {
    let mut properties = Map::new();
    if let Some(id) = biosample.get("id") {
        properties.insert("biosample_id".to_string(), id.clone());
    }

    for key in NUMERIC_PROPERTIES {
        let candidates = [
            key.to_string(),
            format!("{key}_has_numeric_value"),
            format!("{key}_has_maximum_numeric_value"),
        ];
        let number = candidates.iter().find_map(|field| {
            let value = biosample.get(field)?;
            let value = value.get("has_numeric_value").unwrap_or(value);
            value.is_number().then(|| value.clone())
        });
        if let Some(number) = number {
            properties.insert(key.to_string(), number);
        }
    }

    for key in CATEGORICAL_PROPERTIES {
        if let Some(value) = biosample.get(key) {
            let value = value.get("has_raw_value").unwrap_or(value);
            properties.insert(key.to_string(), value.clone());
        }
    }

    Sample {
        annotations,
        properties,
    }
}

/// Loads one sample per GFF file whose biosample is known. Unknown biosamples
/// and missing files are skipped with a warning.
pub fn samples_from_gff(
    biosamples: &[Record],
    gff_files: &BTreeMap<String, Utf8PathBuf>,
    annotation_column: &str,
) -> Result<Samples, NmdcError> {
    let by_id: BTreeMap<&str, &Record> = biosamples
        .iter()
        .filter_map(|record| record.get("id").and_then(Value::as_str).map(|id| (id, record)))
        .collect();

    let mut samples = Samples::new();
    for (biosample_id, path) in gff_files {
        let Some(biosample) = by_id.get(biosample_id.as_str()) else {
            warn!(biosample = %biosample_id, "biosample not found in metadata");
            continue;
        };
        if !path.exists() {
            warn!(path = %path, "GFF file not found");
            continue;
        }
        let reader = GffReader::open(path)?;
        let annotations = count_annotations(&reader.all_features()?, annotation_column);
        samples.insert(
            biosample_id.clone(),
            sample_from_biosample(biosample, annotations),
        );
    }
    info!(samples = samples.len(), "loaded samples");
    Ok(samples)
}

/// Writes results as TSV, CSV or JSON. `Auto` picks from the extension.
pub fn export_enrichment(
    results: &[EnrichmentResult],
    path: &Utf8Path,
    format: ExportFormat,
) -> Result<(), NmdcError> {
    let content = match format.resolve(path) {
        ExportFormat::Json => serde_json::to_string_pretty(results)
            .map_err(|err| NmdcError::Filesystem(err.to_string()))?,
        other => {
            let delimiter = if other == ExportFormat::Tsv { "\t" } else { "," };
            let mut out = [
                "feature_id",
                "feature_name",
                "group1_name",
                "group1_count",
                "group1_total",
                "group2_name",
                "group2_count",
                "group2_total",
                "p_value",
                "fdr",
                "effect_size",
                "enriched_in",
            ]
            .join(delimiter);
            out.push_str("\r\n");
            for result in results {
                let row = [
                    quote(&result.feature_id, delimiter),
                    quote(&result.feature_name, delimiter),
                    quote(&result.group1_name, delimiter),
                    result.group1_count.to_string(),
                    result.group1_total.to_string(),
                    quote(&result.group2_name, delimiter),
                    result.group2_count.to_string(),
                    result.group2_total.to_string(),
                    format_scientific(result.p_value),
                    format_scientific(result.fdr),
                    format_effect(result.effect_size),
                    quote(&result.enriched_in, delimiter),
                ];
                out.push_str(&row.join(delimiter));
                out.push_str("\r\n");
            }
            out
        }
    };
    write_atomic(path, content.as_bytes())?;
    info!(path = %path, results = results.len(), "exported enrichment results");
    Ok(())
}

fn quote(cell: &str, delimiter: &str) -> String {
    if cell.contains(delimiter) || cell.contains('"') || cell.contains('\n') {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

/// `1.234560e-05` style: six decimals, signed two-digit exponent.
pub fn format_scientific(value: f64) -> String {
    if !value.is_finite() {
        return format_non_finite(value);
    }
    let formatted = format!("{value:.6e}");
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            let (sign, digits) = match exponent.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exponent),
            };
            format!("{mantissa}e{sign}{digits:0>2}")
        }
        None => formatted,
    }
}

fn format_effect(value: f64) -> String {
    if value.is_finite() {
        format!("{value:.3}")
    } else {
        format_non_finite(value)
    }
}

fn format_non_finite(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else if value > 0.0 {
        "inf".to_string()
    } else {
        "-inf".to_string()
    }
}
