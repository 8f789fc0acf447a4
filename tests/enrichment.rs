use std::collections::BTreeMap;
use std::fs;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use serde_json::json;

use nmdc_link_toolkit::enrichment::{
    EnrichmentAnalyzer, FdrMethod, Grouping, NoLabels, Samples, export_enrichment, parse_samples,
};
use nmdc_link_toolkit::error::NmdcError;
use nmdc_link_toolkit::export::ExportFormat;

fn ph_samples() -> Samples {
    parse_samples(
        &json!({
            "nmdc:bsm-1": {"ph": 5.0, "ecosystem_type": "Soil",
                           "annotations": {"EC:1.1.1.1": 10, "EC:2.7.1.1": 2}},
            "nmdc:bsm-2": {"ph": 5.5, "ecosystem_type": "Soil",
                           "annotations": {"EC:1.1.1.1": 8, "EC:2.7.1.1": 2}},
            "nmdc:bsm-3": {"ph": 7.0, "ecosystem_type": "Marine",
                           "annotations": {"EC:1.1.1.1": 1, "EC:2.7.1.1": 10}},
            "nmdc:bsm-4": {"ph": 7.5, "ecosystem_type": "Freshwater",
                           "annotations": {"EC:1.1.1.1": 1, "EC:2.7.1.1": 9, "EC:3.1.1.1": 1}}
        })
        .to_string(),
    )
    .unwrap()
}

fn close(actual: f64, expected: f64) -> bool {
    ((actual - expected) / expected).abs() < 1e-6
}

#[test]
fn threshold_split_tests_each_feature() {
    let results = EnrichmentAnalyzer::default()
        .analyze(&ph_samples(), "ph", &Grouping::Threshold(6.0))
        .unwrap();

    // EC:3.1.1.1 is seen once and falls under min_count.
    assert_eq!(results.len(), 2);

    let acid = &results[0];
    assert_eq!(acid.feature_id, "EC:1.1.1.1");
    assert_eq!(acid.group1_name, "ph ≤ 6.0");
    assert_eq!(acid.group2_name, "ph > 6.0");
    assert_eq!((acid.group1_count, acid.group1_total), (18, 22));
    assert_eq!((acid.group2_count, acid.group2_total), (2, 22));
    assert!(close(acid.p_value, 1.957_793_844_789_984_3e-6), "p = {}", acid.p_value);
    assert!(close(acid.fdr, 2.0 * 1.957_793_844_789_984_3e-6));
    assert!((acid.effect_size - 9.0).abs() < 1e-12);
    assert_eq!(acid.enriched_in, "ph ≤ 6.0");

    let basic = &results[1];
    assert_eq!(basic.feature_id, "EC:2.7.1.1");
    assert!(close(basic.p_value, 1.155_306_495_518_756_3e-5));
    assert!(close(basic.fdr, basic.p_value));
    assert_eq!(basic.enriched_in, "ph > 6.0");
}

#[test]
fn bonferroni_and_labels() {
    let labels: BTreeMap<String, String> = [(
        "EC:1.1.1.1".to_string(),
        "alcohol dehydrogenase".to_string(),
    )]
    .into_iter()
    .collect();
    let results = EnrichmentAnalyzer::new(FdrMethod::Bonferroni, 5, &labels)
        .analyze(&ph_samples(), "ph", &Grouping::Threshold(6.0))
        .unwrap();

    assert_eq!(results[0].feature_name, "alcohol dehydrogenase");
    assert_eq!(results[1].feature_name, "EC:2.7.1.1");
    assert!(close(results[1].fdr, 2.0 * results[1].p_value));
}

#[test]
fn chosen_categories_drop_other_samples() {
    let results = EnrichmentAnalyzer::new(FdrMethod::BenjaminiHochberg, 1, NoLabels)
        .analyze(
            &ph_samples(),
            "ecosystem_type",
            &Grouping::Categories(vec!["Soil".to_string(), "Marine".to_string()]),
        )
        .unwrap();

    assert!(results.iter().all(|result| result.group1_name == "Soil"));
    assert!(results.iter().all(|result| result.group2_total == 11));
    assert!(!results.iter().any(|result| result.feature_id == "EC:3.1.1.1"));
}

#[test]
fn three_way_categories_need_an_explicit_choice() {
    let err = EnrichmentAnalyzer::default()
        .analyze(&ph_samples(), "ecosystem_type", &Grouping::Auto)
        .unwrap_err();
    assert_matches!(err, NmdcError::Enrichment(msg) if msg.contains("got 3"));
}

#[test]
fn median_split_and_unknown_property() {
    let results = EnrichmentAnalyzer::default()
        .analyze(&ph_samples(), "ph", &Grouping::Median)
        .unwrap();
    // Four values put the median at the third (7.0).
    assert_eq!(results[0].group1_name, "ph ≤ 7.0");
    assert_eq!(results[0].group2_total, 11);

    let err = EnrichmentAnalyzer::default()
        .analyze(&ph_samples(), "salinity", &Grouping::Auto)
        .unwrap_err();
    assert_matches!(err, NmdcError::Enrichment(msg) if msg.contains("salinity"));
}

#[test]
fn bins_other_than_two_are_rejected() {
    let err = EnrichmentAnalyzer::default()
        .analyze(&ph_samples(), "ph", &Grouping::Bins(3))
        .unwrap_err();
    assert_matches!(err, NmdcError::Enrichment(_));
}

#[test]
fn fdr_method_names() {
    assert_eq!("fdr_bh".parse::<FdrMethod>().unwrap(), FdrMethod::BenjaminiHochberg);
    assert_eq!("bonferroni".parse::<FdrMethod>().unwrap(), FdrMethod::Bonferroni);
    assert_matches!("holm".parse::<FdrMethod>(), Err(NmdcError::Enrichment(_)));
}

#[test]
fn export_writes_fixed_columns() {
    let dir = tempfile::tempdir().unwrap();
    let tsv = Utf8PathBuf::from_path_buf(dir.path().join("enrichment.tsv")).unwrap();
    let json_path = Utf8PathBuf::from_path_buf(dir.path().join("enrichment.json")).unwrap();
    let results = EnrichmentAnalyzer::default()
        .analyze(&ph_samples(), "ph", &Grouping::Threshold(6.0))
        .unwrap();

    export_enrichment(&results, &tsv, ExportFormat::Auto).unwrap();
    let text = fs::read_to_string(&tsv).unwrap();
    let lines: Vec<&str> = text.split("\r\n").collect();
    assert_eq!(
        lines[0],
        "feature_id\tfeature_name\tgroup1_name\tgroup1_count\tgroup1_total\tgroup2_name\tgroup2_count\tgroup2_total\tp_value\tfdr\teffect_size\tenriched_in"
    );
    assert_eq!(
        lines[1],
        "EC:1.1.1.1\tEC:1.1.1.1\tph ≤ 6.0\t18\t22\tph > 6.0\t2\t22\t1.957794e-06\t3.915588e-06\t9.000\tph ≤ 6.0"
    );

    export_enrichment(&results, &json_path, ExportFormat::Auto).unwrap();
    let parsed: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&json_path).unwrap()).unwrap();
    assert_eq!(parsed[1]["feature_id"], "EC:2.7.1.1");
}
