mod common;

use assert_matches::assert_matches;
use serde_json::json;

use nmdc_link_toolkit::error::NmdcError;
use nmdc_link_toolkit::functional_search::{
    BIOSAMPLE_SEARCH_PATH, FunctionalBiosampleSearch, MatchLogic,
};

use common::{ScriptedTransport, param};

fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

#[test]
fn all_logic_sends_every_condition_in_one_request() {
    let transport = ScriptedTransport::new(vec![Ok(json!({
        "count": 42,
        "results": [{"id": "nmdc:bsm-1", "study_id": "nmdc:sty-1"}]
    }))]);
    let result = FunctionalBiosampleSearch::new(&transport)
        .search_by_functions(&ids(&["PF00005", "KEGG.ORTHOLOGY:K00001"]), 10, 5, MatchLogic::All)
        .unwrap();

    assert_eq!(result.count, 42);
    assert_eq!(result.results.len(), 1);
    assert_eq!(
        result.search_criteria.function_ids,
        ["PFAM:PF00005", "KEGG.ORTHOLOGY:K00001"]
    );
    assert_eq!(result.search_criteria.logic, MatchLogic::All);

    let calls = transport.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, BIOSAMPLE_SEARCH_PATH);
    assert_eq!(param(&calls[0].1, "limit"), Some("10"));
    assert_eq!(param(&calls[0].1, "offset"), Some("5"));

    let body = &transport.bodies()[0];
    assert_eq!(body["data_object_filter"], json!([]));
    assert_eq!(
        body["conditions"],
        json!([
            {"op": "==", "field": "id", "value": "PFAM:PF00005", "table": "pfam_function"},
            {"op": "==", "field": "id", "value": "KEGG.ORTHOLOGY:K00001", "table": "kegg_function"}
        ])
    );
}

#[test]
fn any_logic_merges_and_deduplicates_by_id() {
    let transport = ScriptedTransport::new(vec![
        Ok(json!({"count": 2, "results": [{"id": "a"}, {"id": "b"}]})),
        Ok(json!({"count": 3, "results": [{"id": "b"}, {"id": "c"}, {"study_id": "no-id"}]})),
    ]);
    let result = FunctionalBiosampleSearch::new(&transport)
        .search_by_functions(&ids(&["PF00005", "COG0001"]), 2, 0, MatchLogic::Any)
        .unwrap();

    assert_eq!(result.count, 3);
    let returned: Vec<&str> = result
        .results
        .iter()
        .map(|record| record["id"].as_str().unwrap())
        .collect();
    assert_eq!(returned, ["a", "b"]);

    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(param(&calls[0].1, "limit"), Some("4"));
    let bodies = transport.bodies();
    assert_eq!(bodies[1]["conditions"][0]["table"], "cog_function");
    assert_eq!(bodies[1]["conditions"].as_array().unwrap().len(), 1);
}

#[test]
fn any_logic_skips_a_failed_function() {
    let transport = ScriptedTransport::new(vec![
        Err(NmdcError::RemoteStatus {
            status: 500,
            message: "boom".to_string(),
        }),
        Ok(json!({"count": 1, "results": [{"id": "a"}]})),
    ]);
    let result = FunctionalBiosampleSearch::new(&transport)
        .search_by_functions(&ids(&["PF00005", "GO:0008150"]), 10, 0, MatchLogic::Any)
        .unwrap();
    assert_eq!(result.count, 1);
}

#[test]
fn any_logic_fails_when_every_function_fails() {
    let transport = ScriptedTransport::new(vec![Err(NmdcError::RemoteStatus {
        status: 503,
        message: "down".to_string(),
    })]);
    let err = FunctionalBiosampleSearch::new(&transport)
        .search_by_functions(&ids(&["PF00005"]), 10, 0, MatchLogic::Any)
        .unwrap_err();
    assert_matches!(err, NmdcError::RemoteRequestFailed(msg) if msg.starts_with("Failed to search biosamples"));
}

#[test]
fn all_logic_failure_is_a_remote_error() {
    let transport = ScriptedTransport::new(vec![Err(NmdcError::RemoteStatus {
        status: 502,
        message: "bad gateway".to_string(),
    })]);
    let err = FunctionalBiosampleSearch::new(&transport)
        .search_by_functions(&ids(&["PF00005"]), 10, 0, MatchLogic::All)
        .unwrap_err();
    assert_matches!(err, NmdcError::RemoteRequestFailed(msg) if msg.contains("502"));
}

#[test]
fn invalid_input_is_rejected_before_any_request() {
    let transport = ScriptedTransport::default();
    let search = FunctionalBiosampleSearch::new(&transport);

    assert_matches!(
        search.search_by_functions(&[], 10, 0, MatchLogic::All),
        Err(NmdcError::InvalidArgument(_))
    );
    assert_matches!(
        search.search_by_functions(&ids(&["PF00005", "EC:1.1.1.1"]), 10, 0, MatchLogic::All),
        Err(NmdcError::InvalidArgument(msg)) if msg.contains("EC")
    );
    assert!(transport.calls().is_empty());
}

#[test]
fn convenience_searches_add_their_prefix() {
    let transport = ScriptedTransport::new(vec![
        Ok(json!({"count": 0, "results": []})),
        Ok(json!({"count": 0, "results": []})),
    ]);
    let search = FunctionalBiosampleSearch::new(&transport);

    let pfam = search
        .search_by_pfam(&ids(&["PF00072", "PFAM:PF00005"]), 5, true)
        .unwrap();
    assert_eq!(pfam.search_criteria.function_ids, ["PFAM:PF00072", "PFAM:PF00005"]);

    let go = search.search_by_go(&ids(&["0008150"]), 5, false).unwrap();
    assert_eq!(go.search_criteria.function_ids, ["GO:0008150"]);
    assert_eq!(go.search_criteria.logic, MatchLogic::Any);

    let bodies = transport.bodies();
    assert_eq!(bodies.len(), 2);
    assert_eq!(bodies[1]["conditions"][0]["table"], "go_function");
}
