use std::{collections::HashSet, time::Duration};

use pretty_assertions::assert_eq;

use super::choose_uniformly;
use crate::{
    bson::{doc, Document},
    options::ClientOptions,
    sdam::{
        description::topology::{
            test::{address, description_from_reply},
            verify_max_staleness,
            TopologyDescription,
        },
        ServerDescription,
    },
    selection_criteria::{ReadPreference, ReadPreferenceOptions, SelectionCriteria, TagSet},
};

fn mongos_reply() -> Document {
    doc! { "ok": 1, "isWritablePrimary": true, "msg": "isdbgrid", "maxWireVersion": 17 }
}

fn member_reply(primary: bool, tags: Document) -> Document {
    doc! {
        "ok": 1,
        "isWritablePrimary": primary,
        "secondary": !primary,
        "setName": "rs",
        "hosts": vec!["a:27017", "b:27017", "c:27017", "d:27017"],
        "tags": tags,
        "maxWireVersion": 17,
    }
}

fn topology_of(servers: Vec<ServerDescription>) -> TopologyDescription {
    let options = ClientOptions::builder()
        .hosts(servers.iter().map(|sd| sd.address().clone()).collect())
        .build();
    let mut description = TopologyDescription::new(&options);
    for server in servers {
        description.update(server).unwrap();
    }
    description
}

fn sharded_with_rtts(rtts_ms: &[u64]) -> TopologyDescription {
    topology_of(
        rtts_ms
            .iter()
            .map(|rtt| {
                description_from_reply(
                    &format!("mongos{rtt}:27017"),
                    mongos_reply(),
                    Duration::from_millis(*rtt),
                )
            })
            .collect(),
    )
}

fn tag_set(pairs: &[(&str, &str)]) -> TagSet {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn selected_hosts(description: &TopologyDescription, criteria: &SelectionCriteria) -> Vec<String> {
    let mut hosts: Vec<_> = description
        .suitable_servers_in_latency_window(criteria)
        .unwrap()
        .into_iter()
        .map(|sd| sd.address().host().to_string())
        .collect();
    hosts.sort();
    hosts
}

#[test]
fn latency_window_excludes_slow_servers() {
    let description = sharded_with_rtts(&[5, 10, 12, 30]);
    let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);

    assert_eq!(
        selected_hosts(&description, &criteria),
        vec!["mongos10", "mongos12", "mongos5"]
    );
}

#[test]
fn selection_is_spread_across_the_window() {
    let description = sharded_with_rtts(&[5, 10, 12, 30]);
    let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
    let in_window = description
        .suitable_servers_in_latency_window(&criteria)
        .unwrap();

    let mut seen = HashSet::new();
    for _ in 0..1000 {
        let chosen = choose_uniformly(&in_window).unwrap();
        seen.insert(chosen.address().host().to_string());
    }

    let expected: HashSet<String> = ["mongos5", "mongos10", "mongos12"]
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(seen, expected);
}

#[test]
fn choose_from_empty_window() {
    let empty: Vec<&u32> = Vec::new();
    assert!(choose_uniformly(&empty).is_none());
}

#[test]
fn custom_local_threshold_widens_window() {
    let mut description = sharded_with_rtts(&[5, 10, 12, 30]);
    description.local_threshold = Some(Duration::from_millis(30));
    let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);

    assert_eq!(selected_hosts(&description, &criteria).len(), 4);
}

#[test]
fn unknown_topology_selects_nothing() {
    let options = ClientOptions::builder()
        .hosts(vec![address("a:27017"), address("b:27017")])
        .build();
    let description = TopologyDescription::new(&options);
    let criteria = SelectionCriteria::ReadPreference(ReadPreference::Nearest { options: None });

    assert!(selected_hosts(&description, &criteria).is_empty());
    assert!(description
        .server_selection_timeout_error_message(&criteria)
        .contains("No available servers"));
}

fn replica_set() -> TopologyDescription {
    topology_of(vec![
        description_from_reply(
            "a:27017",
            member_reply(true, doc! { "dc": "ny" }),
            Duration::from_millis(5),
        ),
        description_from_reply(
            "b:27017",
            member_reply(false, doc! { "dc": "ny", "rack": "1" }),
            Duration::from_millis(6),
        ),
        description_from_reply(
            "c:27017",
            member_reply(false, doc! { "dc": "sf" }),
            Duration::from_millis(7),
        ),
        description_from_reply(
            "d:27017",
            member_reply(false, doc! {}),
            Duration::from_millis(8),
        ),
    ])
}

fn with_tags(tag_sets: Vec<TagSet>) -> Option<ReadPreferenceOptions> {
    Some(ReadPreferenceOptions::builder().tag_sets(tag_sets).build())
}

#[test]
fn replica_set_modes() {
    let description = replica_set();

    let primary = SelectionCriteria::ReadPreference(ReadPreference::Primary);
    assert_eq!(selected_hosts(&description, &primary), vec!["a"]);

    let secondary =
        SelectionCriteria::ReadPreference(ReadPreference::Secondary { options: None });
    assert_eq!(selected_hosts(&description, &secondary), vec!["b", "c", "d"]);

    let nearest = SelectionCriteria::ReadPreference(ReadPreference::Nearest { options: None });
    assert_eq!(
        selected_hosts(&description, &nearest),
        vec!["a", "b", "c", "d"]
    );

    let primary_preferred =
        SelectionCriteria::ReadPreference(ReadPreference::PrimaryPreferred { options: None });
    assert_eq!(selected_hosts(&description, &primary_preferred), vec!["a"]);
}

#[test]
fn first_matching_tag_set_wins() {
    let description = replica_set();

    let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
        options: with_tags(vec![
            tag_set(&[("dc", "tokyo")]),
            tag_set(&[("dc", "ny")]),
            tag_set(&[]),
        ]),
    });
    assert_eq!(selected_hosts(&description, &criteria), vec!["b"]);
}

#[test]
fn empty_tag_set_matches_everything() {
    let description = replica_set();

    let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
        options: with_tags(vec![tag_set(&[("dc", "tokyo")]), tag_set(&[])]),
    });
    assert_eq!(selected_hosts(&description, &criteria), vec!["b", "c", "d"]);
}

#[test]
fn no_matching_tag_set_selects_nothing() {
    let description = replica_set();

    let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
        options: with_tags(vec![tag_set(&[("dc", "tokyo")])]),
    });
    assert!(selected_hosts(&description, &criteria).is_empty());
}

#[test]
fn secondary_preferred_falls_back_to_primary() {
    let description = topology_of(vec![description_from_reply(
        "a:27017",
        member_reply(true, doc! { "dc": "ny" }),
        Duration::from_millis(5),
    )]);

    let criteria = SelectionCriteria::ReadPreference(ReadPreference::SecondaryPreferred {
        options: with_tags(vec![tag_set(&[("dc", "sf")])]),
    });
    assert!(selected_hosts(&description, &criteria).contains(&"a".to_string()));
}

#[test]
fn predicate_criteria_filters_servers() {
    let description = replica_set();
    let criteria = SelectionCriteria::from_address(address("c:27017"));

    assert_eq!(selected_hosts(&description, &criteria), vec!["c"]);
}

#[test]
fn max_staleness_lower_bound() {
    let heartbeat = Duration::from_secs(10);
    assert!(verify_max_staleness(Duration::from_secs(89), heartbeat).is_err());
    assert!(verify_max_staleness(Duration::from_secs(90), heartbeat).is_ok());

    let slow_heartbeat = Duration::from_secs(100);
    assert!(verify_max_staleness(Duration::from_secs(100), slow_heartbeat).is_err());
    assert!(verify_max_staleness(Duration::from_secs(110), slow_heartbeat).is_ok());
}

#[test]
fn invalid_max_staleness_fails_selection() {
    let description = replica_set();
    let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
        options: Some(
            ReadPreferenceOptions::builder()
                .max_staleness(Duration::from_secs(10))
                .build(),
        ),
    });

    assert!(description
        .suitable_servers_in_latency_window(&criteria)
        .is_err());
}
