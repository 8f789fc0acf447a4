mod common;

use std::fs;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};
use serde_json::{Value, json};

use nmdc_link_toolkit::app::{
    App, CollectionKind, EnrichRequest, FunctionSearchRequest, GffSelector, LinkRequest,
    Relation, SearchRequest,
};
use nmdc_link_toolkit::domain::{Direction, EdgeDirection};
use nmdc_link_toolkit::enrichment::{FdrMethod, Grouping};
use nmdc_link_toolkit::error::NmdcError;
use nmdc_link_toolkit::functional_search::MatchLogic;
use nmdc_link_toolkit::output::JsonOutput;

use common::{ScriptedTransport, param};

fn workspace() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    (dir, root)
}

fn traversal(nexus: &str) -> Value {
    json!({
        "resources": [
            {"id": "nmdc:sty-1", "type": "nmdc:Study", "_upstream_of": [nexus]},
            {"id": format!("{nexus}-reads"), "type": "nmdc:DataObject", "_downstream_of": [nexus]},
            {"id": "nmdc:omprc-1", "type": "nmdc:NucleotideSequencing", "_downstream_of": [nexus]}
        ]
    })
}

#[test]
fn cache_links_then_query_and_clear() {
    let (_dir, root) = workspace();
    let transport = ScriptedTransport::shared(vec![
        Ok(traversal("nmdc:bsm-1")),
        Ok(traversal("nmdc:bsm-2")),
    ]);
    let app = App::new(transport.clone(), root.join("cache/links.db"));
    let ids = vec!["nmdc:bsm-1".to_string(), "nmdc:bsm-2".to_string()];

    let cached = app.cache_links(&ids, &JsonOutput).unwrap();
    assert_eq!(cached.total, 6);
    assert_eq!(cached.entries[1].id, "nmdc:bsm-2");
    assert_eq!(cached.cache_path, root.join("cache/links.db").as_str());

    let calls = transport.calls();
    assert_eq!(param(&calls[0].1, "hydrate"), Some("false"));
    assert_eq!(param(&calls[0].1, "max_page_size"), Some("1000"));

    let downstream = app
        .query_links("nmdc:bsm-1", EdgeDirection::Outgoing, Some("downstream"))
        .unwrap();
    assert_eq!(downstream.links.len(), 2);

    let study = app
        .query_links("nmdc:sty-1", EdgeDirection::Incoming, None)
        .unwrap();
    assert!(study.links.is_empty());
    let study = app
        .query_links("nmdc:sty-1", EdgeDirection::Outgoing, None)
        .unwrap();
    assert_eq!(study.links.len(), 2);

    let stats = app.cache_stats().unwrap();
    assert_eq!(stats.total_edges, 6);
    assert_eq!(stats.total_synced_entities, 2);
    assert_eq!(stats.counts_by_relationship_type["upstream"], 2);

    let cleared = app.cache_clear(Some("nmdc:bsm-1")).unwrap();
    assert_eq!(cleared.removed, 3);
    let cleared = app.cache_clear(None).unwrap();
    assert_eq!(cleared.removed, 3);
    assert_eq!(app.cache_stats().unwrap().total_edges, 0);
}

#[test]
fn cache_links_needs_ids() {
    let (_dir, root) = workspace();
    let app = App::new(ScriptedTransport::shared(Vec::new()), root.join("links.db"));
    let err = app.cache_links(&[], &JsonOutput).unwrap_err();
    assert_matches!(err, NmdcError::InvalidArgument(_));
}

#[test]
fn failed_traversal_leaves_cache_untouched() {
    let (_dir, root) = workspace();
    let transport = ScriptedTransport::shared(vec![
        Ok(traversal("nmdc:bsm-1")),
        Err(NmdcError::RemoteRequestFailed("NMDC API error: boom".to_string())),
    ]);
    let app = App::new(transport, root.join("links.db"));
    let ids = vec!["nmdc:bsm-1".to_string(), "nmdc:bsm-2".to_string()];

    let err = app.cache_links(&ids, &JsonOutput).unwrap_err();
    assert_matches!(err, NmdcError::RemoteRequestFailed(_));
    let stats = app.cache_stats().unwrap();
    assert_eq!(stats.total_edges, 3);
    assert_eq!(stats.total_synced_entities, 1);
}

#[test]
fn link_single_direction_keeps_its_bucket() {
    let (_dir, root) = workspace();
    let transport = ScriptedTransport::shared(vec![Ok(traversal("nmdc:bsm-1"))]);
    let app = App::new(transport, root.join("links.db"));

    let result = app
        .link(
            &LinkRequest {
                ids: vec!["nmdc:bsm-1".to_string()],
                types: None,
                direction: Direction::Downstream,
                hydrate: false,
                page_size: 100,
            },
            &JsonOutput,
        )
        .unwrap();

    assert_eq!(result.total, 2);
    let by_type = result.by_type();
    assert_eq!(by_type["nmdc:DataObject"].len(), 1);
    assert_eq!(by_type["nmdc:NucleotideSequencing"].len(), 1);
}

#[test]
fn link_both_returns_whole_traversal() {
    let (_dir, root) = workspace();
    let transport = ScriptedTransport::shared(vec![Ok(traversal("nmdc:bsm-1"))]);
    let app = App::new(transport.clone(), root.join("links.db"));

    let result = app
        .link(
            &LinkRequest {
                ids: vec!["nmdc:bsm-1".to_string()],
                types: Some(vec!["nmdc:Study".to_string()]),
                direction: Direction::Both,
                hydrate: true,
                page_size: 100,
            },
            &JsonOutput,
        )
        .unwrap();

    assert_eq!(result.total, 3);
    let calls = transport.calls();
    assert_eq!(param(&calls[0].1, "types"), Some("nmdc:Study"));
    assert_eq!(param(&calls[0].1, "hydrate"), Some("true"));
}

#[test]
fn search_by_id_and_invalid_filter() {
    let (_dir, root) = workspace();
    let transport = ScriptedTransport::shared(vec![Ok(json!({"id": "nmdc:sty-1"}))]);
    let app = App::new(transport.clone(), root.join("links.db"));

    let result = app
        .search(
            CollectionKind::Study,
            &SearchRequest {
                id: Some("nmdc:sty-1".to_string()),
                ..SearchRequest::default()
            },
            &JsonOutput,
        )
        .unwrap();
    assert_eq!(result.collection, "study_set");
    assert_eq!(result.count, 1);
    assert_eq!(transport.calls()[0].0, "/nmdcschema/study_set/nmdc:sty-1");

    let err = app
        .search(
            CollectionKind::Biosample,
            &SearchRequest {
                filter: Some("no separator here".to_string()),
                limit: 10,
                ..SearchRequest::default()
            },
            &JsonOutput,
        )
        .unwrap_err();
    assert_matches!(err, NmdcError::InvalidFilter(_));
}

#[test]
fn linked_data_objects_are_counted_by_type() {
    let (_dir, root) = workspace();
    let transport = ScriptedTransport::shared(vec![Ok(json!({
        "resources": [
            {"id": "d1", "type": "nmdc:DataObject", "data_object_type": "Metagenome Raw Reads"},
            {"id": "d2", "type": "nmdc:DataObject", "data_object_type": "Functional Annotation GFF"},
            {"id": "d3", "type": "nmdc:DataObject", "data_object_type": "Functional Annotation GFF"}
        ]
    }))]);
    let app = App::new(transport, root.join("links.db"));

    let result = app
        .linked_records("nmdc:sty-1", Relation::StudyDataObjects, &JsonOutput)
        .unwrap();
    assert_eq!(result.count, 3);
    assert_eq!(result.by_type["Functional Annotation GFF"], 2);
    assert_eq!(result.records[0]["data_object_type"], "Metagenome Raw Reads");
}

const GFF: &str = "##gff-version 3
c1\tprodigal\tCDS\t1\t300\t.\t+\t0\tID=g1;ec_number=EC:1.1.1.1
c1\tprodigal\tCDS\t400\t700\t.\t+\t0\tID=g2;ec_number=EC:1.1.1.1
c1\tprodigal\tCDS\t800\t1100\t.\t+\t0\tID=g3;ec_number=EC:1.1.1.1,EC:1.2.1.1
";

#[test]
fn gff_query_applies_limit() {
    let (_dir, root) = workspace();
    let path = root.join("sample.gff");
    fs::write(&path, GFF).unwrap();
    let app = App::new(ScriptedTransport::shared(Vec::new()), root.join("links.db"));

    let result = app
        .gff_query(&path, &GffSelector::Ec("EC:1.1.1.1".to_string()), Some(2), &JsonOutput)
        .unwrap();
    assert_eq!(result.count, 2);
    assert!(result.rows.is_empty());

    let sql = app
        .gff_query(
            &path,
            &GffSelector::Sql("SELECT COUNT(*) AS n FROM features".to_string()),
            None,
            &JsonOutput,
        )
        .unwrap();
    assert_eq!(sql.rows[0]["n"], 3);
}

fn enrich_request(input: &Utf8Path) -> EnrichRequest {
    EnrichRequest {
        input: input.to_path_buf(),
        group_by: "ph".to_string(),
        annotation_column: "ec_number".to_string(),
        grouping: Grouping::Threshold(6.0),
        fdr: FdrMethod::BenjaminiHochberg,
        min_count: 1,
        alpha: 0.05,
    }
}

#[test]
fn enrich_from_samples_file() {
    let (_dir, root) = workspace();
    let input = root.join("samples.json");
    fs::write(
        &input,
        json!({
            "s1": {"ph": 5.0, "annotations": {"EC:1.1.1.1": 20, "EC:2.7.1.1": 1}},
            "s2": {"ph": 7.5, "annotations": {"EC:1.1.1.1": 1, "EC:2.7.1.1": 20}}
        })
        .to_string(),
    )
    .unwrap();
    let app = App::new(ScriptedTransport::shared(Vec::new()), root.join("links.db"));

    let result = app.enrich(&enrich_request(&input), &JsonOutput).unwrap();
    assert_eq!(result.samples, 2);
    assert_eq!(result.tested, 2);
    assert_eq!(result.significant, 2);
    assert_eq!(result.significant_results().count(), 2);
}

#[test]
fn enrich_from_study_directory() {
    let (_dir, root) = workspace();
    for (name, ph, ec) in [("nmdc_bsm-1", 5.0, "EC:1.1.1.1"), ("nmdc_bsm-2", 8.0, "EC:2.7.1.1")] {
        let sample_dir = root.join(name);
        fs::create_dir_all(sample_dir.join("data_objects")).unwrap();
        let id = name.replacen("nmdc_", "nmdc:", 1);
        fs::write(
            sample_dir.join("biosample.json"),
            json!({"id": id, "ph": {"has_numeric_value": ph, "type": "nmdc:QuantityValue"}}).to_string(),
        )
        .unwrap();
        let gff = format!(
            "c1\tprodigal\tCDS\t1\t300\t.\t+\t0\tec_number={ec}\n\
             c1\tprodigal\tCDS\t400\t700\t.\t+\t0\tec_number={ec}\n\
             c1\tprodigal\tCDS\t800\t900\t.\t+\t0\tec_number={ec}\n"
        );
        fs::write(
            sample_dir.join(format!("data_objects/{name}_functional_annotation.gff")),
            gff,
        )
        .unwrap();
    }
    let app = App::new(ScriptedTransport::shared(Vec::new()), root.join("links.db"));

    let result = app.enrich(&enrich_request(&root), &JsonOutput).unwrap();
    assert_eq!(result.samples, 2);
    assert_eq!(result.tested, 2);
    // 3 vs 0 out of 3 each: p = 0.1.
    assert!((result.results[0].p_value - 0.1).abs() < 1e-9);
    assert_eq!(result.significant, 0);
}

#[test]
fn enrich_needs_two_samples() {
    let (_dir, root) = workspace();
    let input = root.join("one.json");
    fs::write(&input, r#"{"s1": {"ph": 5.0, "annotations": {"EC:1": 3}}}"#).unwrap();
    let app = App::new(ScriptedTransport::shared(Vec::new()), root.join("links.db"));

    let err = app.enrich(&enrich_request(&input), &JsonOutput).unwrap_err();
    assert_matches!(err, NmdcError::Enrichment(msg) if msg.contains("at least 2"));
}

#[test]
fn collection_name_uses_the_schema_transport() {
    let transport = ScriptedTransport::shared(vec![Ok(json!({"collection_name": "study_set"}))]);
    let app = App::new(transport.clone(), "unused.db");

    let result = app.collection_name("nmdc:sty-11-aygzgv51").unwrap();
    assert_eq!(result.collection_name, "study_set");
    assert_eq!(result.id, "nmdc:sty-11-aygzgv51");
    assert_eq!(transport.calls().len(), 1);
}

#[test]
fn function_search_goes_to_the_data_transport() {
    let schema = ScriptedTransport::shared(Vec::new());
    let portal = ScriptedTransport::shared(vec![Ok(json!({
        "count": 1,
        "results": [{"id": "nmdc:bsm-1"}]
    }))]);
    let request = FunctionSearchRequest {
        function_ids: vec!["PF00005".to_string()],
        limit: 20,
        offset: 0,
        logic: MatchLogic::All,
    };

    let without_portal = App::new(schema.clone(), "unused.db");
    assert_matches!(
        without_portal.search_by_function(&request, &JsonOutput),
        Err(NmdcError::InvalidArgument(_))
    );

    let app = App::new(schema.clone(), "unused.db").with_data_transport(portal.clone());
    let result = app.search_by_function(&request, &JsonOutput).unwrap();
    assert_eq!(result.count, 1);
    assert!(schema.calls().is_empty());
    assert_eq!(portal.calls().len(), 1);
}
