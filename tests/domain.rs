use serde_json::json;

use nmdc_link_toolkit::domain::{Direction, EdgeDirection, LinkedNode};
use nmdc_link_toolkit::linked_instances::{Page, classify, group_by_type, select_direction};

fn page() -> Page {
    Page::from_json(json!({
        "resources": [
            {"id": "nmdc:sty-1", "type": "nmdc:Study", "_upstream_of": ["nmdc:bsm-1"],
             "name": "Soil microbiome"},
            {"id": "nmdc:dobj-1", "type": "nmdc:DataObject", "_downstream_of": ["nmdc:bsm-1"]},
            {"id": "nmdc:dobj-2", "type": "nmdc:DataObject", "_downstream_of": ["nmdc:bsm-1"]},
            {"id": "nmdc:bsm-2", "_upstream_of": ["nmdc:dobj-1"], "_downstream_of": ["nmdc:sty-1"]},
            {"id": "nmdc:inst-1", "type": "nmdc:Instrument"}
        ],
        "next_page_token": null
    }))
    .unwrap()
}

#[test]
fn hydrated_fields_survive_in_payload() {
    let page = page();
    assert!(page.next_page_token.is_none());
    let study = &page.resources[0];
    assert_eq!(study.payload_str("name"), Some("Soil microbiome"));
    assert!(study.is_upstream_of("nmdc:bsm-1"));
    assert!(!study.is_upstream_of("nmdc:bsm-2"));
    assert_eq!(study.to_record()["name"], "Soil microbiome");
}

#[test]
fn untyped_nodes_group_as_unknown() {
    let grouped = group_by_type(&page().resources);
    assert_eq!(grouped["nmdc:DataObject"].len(), 2);
    assert_eq!(grouped["Unknown"][0].id, "nmdc:bsm-2");
    assert_eq!(grouped.len(), 4);
}

#[test]
fn markerless_nodes_are_dropped_from_every_bucket() {
    let classified = classify(page().resources);
    assert_eq!(classified.upstream.len(), 1);
    assert_eq!(classified.downstream.len(), 2);
    assert_eq!(classified.both.len(), 1);

    let groups = select_direction(classified, Direction::Downstream);
    let ids: Vec<&str> = groups["downstream"].iter().map(|node| node.id.as_str()).collect();
    assert_eq!(ids, ["nmdc:dobj-1", "nmdc:dobj-2", "nmdc:bsm-2"]);
}

#[test]
fn builders_and_direction_names() {
    let node = LinkedNode::new("a", "nmdc:Study").with_downstream_of(&["x", "y"]);
    assert!(node.is_downstream_of("y"));
    assert!(!node.is_bidirectional());

    assert_eq!(Direction::Both.to_string(), "both");
    assert_eq!("incoming".parse::<EdgeDirection>().unwrap(), EdgeDirection::Incoming);
    assert_eq!(
        serde_json::to_value(EdgeDirection::Outgoing).unwrap(),
        json!("outgoing")
    );
}

#[test]
fn null_marker_still_counts_as_present() {
    let page = Page::from_json(json!({
        "resources": [
            {"id": "nmdc:sty-1", "type": "nmdc:Study", "_upstream_of": null},
            {"id": "nmdc:inst-1", "type": "nmdc:Instrument"}
        ]
    }))
    .unwrap();

    let study = &page.resources[0];
    assert_eq!(study.upstream_of, Some(Vec::new()));
    assert!(study.has_upstream_marker());
    assert!(!study.is_upstream_of("nmdc:bsm-1"));
    assert!(page.resources[1].upstream_of.is_none());

    let classified = classify(page.resources);
    assert_eq!(classified.upstream.len(), 1);
    assert!(classified.downstream.is_empty());
}
