use std::time::Duration;

use pretty_assertions::assert_eq;

use super::{TopologyDescription, TopologyType};
use crate::{
    bson::{doc, oid::ObjectId, Document},
    error::Error,
    hello::{HelloCommandResponse, HelloReply},
    options::{ClientOptions, ServerAddress},
    sdam::{ServerDescription, ServerType, TransactionSupportStatus},
};

pub(crate) fn address(host: &str) -> ServerAddress {
    ServerAddress::parse(host).unwrap()
}

/// A description built from a hello reply the way the monitor would build it.
pub(crate) fn description_from_reply(
    host: &str,
    reply: Document,
    rtt: Duration,
) -> ServerDescription {
    let hello_reply = HelloReply {
        command_response: HelloCommandResponse::from_document(&reply).unwrap(),
        raw_command_response: reply,
        cluster_time: None,
    };
    ServerDescription::new_from_hello_reply(address(host), hello_reply, rtt)
}

fn primary(host: &str, set_name: &str, hosts: &[&str]) -> ServerDescription {
    description_from_reply(
        host,
        doc! {
            "ok": 1,
            "isWritablePrimary": true,
            "setName": set_name,
            "hosts": hosts.to_vec(),
            "minWireVersion": 0,
            "maxWireVersion": 17,
        },
        Duration::from_millis(5),
    )
}

fn secondary(host: &str, set_name: &str, hosts: &[&str]) -> ServerDescription {
    description_from_reply(
        host,
        doc! {
            "ok": 1,
            "secondary": true,
            "setName": set_name,
            "hosts": hosts.to_vec(),
            "minWireVersion": 0,
            "maxWireVersion": 17,
        },
        Duration::from_millis(5),
    )
}

fn standalone(host: &str) -> ServerDescription {
    description_from_reply(
        host,
        doc! { "ok": 1, "isWritablePrimary": true, "minWireVersion": 0, "maxWireVersion": 17 },
        Duration::from_millis(5),
    )
}

fn mongos(host: &str) -> ServerDescription {
    description_from_reply(
        host,
        doc! {
            "ok": 1,
            "isWritablePrimary": true,
            "msg": "isdbgrid",
            "minWireVersion": 0,
            "maxWireVersion": 17,
        },
        Duration::from_millis(5),
    )
}

fn topology(hosts: &[&str], repl_set_name: Option<&str>) -> TopologyDescription {
    let options = ClientOptions::builder()
        .hosts(hosts.iter().map(|h| address(h)).collect())
        .repl_set_name(repl_set_name.map(str::to_string))
        .build();
    TopologyDescription::new(&options)
}

fn addresses(description: &TopologyDescription) -> Vec<String> {
    let mut addresses: Vec<_> = description
        .server_addresses()
        .map(ToString::to_string)
        .collect();
    addresses.sort();
    addresses
}

#[test]
fn initial_type_follows_options() {
    assert_eq!(
        topology(&["a:27017", "b:27017"], None).topology_type(),
        TopologyType::Unknown
    );
    assert_eq!(
        topology(&["a:27017"], Some("rs")).topology_type(),
        TopologyType::ReplicaSetNoPrimary
    );

    let direct = ClientOptions::builder()
        .hosts(vec![address("a:27017")])
        .direct_connection(true)
        .build();
    assert_eq!(
        TopologyDescription::new(&direct).topology_type(),
        TopologyType::Single
    );
}

#[test]
fn primary_reconciles_member_list() {
    let mut description = topology(&["a:27017", "b:27017", "c:27017"], Some("rs"));

    description
        .update(primary("a:27017", "rs", &["a:27017", "b:27017"]))
        .unwrap();

    assert_eq!(
        description.topology_type(),
        TopologyType::ReplicaSetWithPrimary
    );
    assert_eq!(addresses(&description), vec!["a:27017", "b:27017"]);
}

#[test]
fn primary_adds_new_members_as_unknown() {
    let mut description = topology(&["a:27017"], None);

    description
        .update(primary("a:27017", "rs", &["a:27017", "d:27017"]))
        .unwrap();

    assert_eq!(description.set_name(), Some("rs"));
    let new_member = description
        .get_server_description(&address("d:27017"))
        .unwrap();
    assert_eq!(new_member.server_type(), ServerType::Unknown);
}

#[test]
fn losing_the_primary_returns_to_no_primary() {
    let mut description = topology(&["a:27017", "b:27017"], Some("rs"));
    description
        .update(primary("a:27017", "rs", &["a:27017", "b:27017"]))
        .unwrap();

    description
        .update(ServerDescription::new_from_error(
            address("a:27017"),
            Error::internal("connection refused"),
        ))
        .unwrap();

    assert_eq!(
        description.topology_type(),
        TopologyType::ReplicaSetNoPrimary
    );
    assert_eq!(addresses(&description), vec!["a:27017", "b:27017"]);
}

#[test]
fn mismatched_set_name_is_removed() {
    let mut description = topology(&["a:27017", "b:27017"], Some("rs"));

    description
        .update(secondary("b:27017", "other", &["a:27017", "b:27017"]))
        .unwrap();

    assert_eq!(addresses(&description), vec!["a:27017"]);
    assert_eq!(
        description.topology_type(),
        TopologyType::ReplicaSetNoPrimary
    );
}

#[test]
fn standalone_in_replica_set_is_removed() {
    let mut description = topology(&["a:27017", "b:27017"], Some("rs"));
    description
        .update(primary("a:27017", "rs", &["a:27017", "b:27017"]))
        .unwrap();

    description.update(standalone("b:27017")).unwrap();

    assert_eq!(addresses(&description), vec!["a:27017"]);
    assert_eq!(
        description.topology_type(),
        TopologyType::ReplicaSetWithPrimary
    );
}

#[test]
fn single_seed_standalone_becomes_single() {
    let mut description = topology(&["a:27017"], None);
    description.update(standalone("a:27017")).unwrap();
    assert_eq!(description.topology_type(), TopologyType::Single);
}

#[test]
fn standalone_among_several_seeds_is_removed() {
    let mut description = topology(&["a:27017", "b:27017"], None);
    description.update(standalone("a:27017")).unwrap();
    assert_eq!(description.topology_type(), TopologyType::Unknown);
    assert_eq!(addresses(&description), vec!["b:27017"]);
}

#[test]
fn mongos_makes_topology_sharded_and_drops_replica_set_members() {
    let mut description = topology(&["a:27017", "b:27017"], None);

    description.update(mongos("a:27017")).unwrap();
    assert_eq!(description.topology_type(), TopologyType::Sharded);

    description
        .update(secondary("b:27017", "rs", &["b:27017"]))
        .unwrap();
    assert_eq!(description.topology_type(), TopologyType::Sharded);
    assert_eq!(addresses(&description), vec!["a:27017"]);
}

#[test]
fn mongos_transactions_need_wire_version_eight() {
    let router = |host: &str, max_wire_version: i32| {
        description_from_reply(
            host,
            doc! {
                "ok": 1,
                "isWritablePrimary": true,
                "msg": "isdbgrid",
                "minWireVersion": 0,
                "maxWireVersion": max_wire_version,
                "logicalSessionTimeoutMinutes": 30,
            },
            Duration::from_millis(5),
        )
    };

    let mut description = topology(&["a:27017", "b:27017"], None);
    description.update(router("a:27017", 7)).unwrap();
    assert_eq!(description.topology_type(), TopologyType::Sharded);
    assert_eq!(
        description.transaction_support_status(),
        TransactionSupportStatus::Unsupported
    );

    description.update(router("b:27017", 8)).unwrap();
    assert_eq!(
        description.transaction_support_status(),
        TransactionSupportStatus::Supported
    );
}

#[test]
fn stale_primary_is_reset_to_unknown() {
    let mut description = topology(&["a:27017", "b:27017"], Some("rs"));
    let newer_election = ObjectId::parse_str("000000000000000000000002").unwrap();
    let older_election = ObjectId::parse_str("000000000000000000000001").unwrap();

    description
        .update(description_from_reply(
            "a:27017",
            doc! {
                "ok": 1,
                "isWritablePrimary": true,
                "setName": "rs",
                "hosts": vec!["a:27017", "b:27017"],
                "setVersion": 1,
                "electionId": newer_election,
                "maxWireVersion": 17,
            },
            Duration::from_millis(5),
        ))
        .unwrap();

    description
        .update(description_from_reply(
            "b:27017",
            doc! {
                "ok": 1,
                "isWritablePrimary": true,
                "setName": "rs",
                "hosts": vec!["a:27017", "b:27017"],
                "setVersion": 1,
                "electionId": older_election,
                "maxWireVersion": 17,
            },
            Duration::from_millis(5),
        ))
        .unwrap();

    let stale = description
        .get_server_description(&address("b:27017"))
        .unwrap();
    assert_eq!(stale.server_type(), ServerType::Unknown);
    assert_eq!(
        description.primary().map(|sd| sd.address().clone()),
        Some(address("a:27017"))
    );
}

#[test]
fn diff_reports_changed_and_removed_servers() {
    let before = topology(&["a:27017", "b:27017", "c:27017"], Some("rs"));
    let mut after = before.clone();
    after
        .update(primary("a:27017", "rs", &["a:27017", "b:27017"]))
        .unwrap();

    let diff = before.diff(&after).unwrap();
    assert_eq!(diff.removed_addresses.len(), 1);
    assert!(diff.removed_addresses.contains(&address("c:27017")));
    assert!(diff.added_addresses.is_empty());
    assert!(diff.changed_servers.contains_key(&address("a:27017")));

    assert!(after.diff(&after.clone()).is_none());
}

#[test]
fn logical_session_timeout_is_minimum_over_data_bearing_servers() {
    let mut description = topology(&["a:27017", "b:27017"], Some("rs"));

    let with_timeout = |host: &str, minutes: i64, primary: bool| {
        description_from_reply(
            host,
            doc! {
                "ok": 1,
                "isWritablePrimary": primary,
                "secondary": !primary,
                "setName": "rs",
                "hosts": vec!["a:27017", "b:27017"],
                "logicalSessionTimeoutMinutes": minutes,
                "maxWireVersion": 17,
            },
            Duration::from_millis(5),
        )
    };

    description.update(with_timeout("a:27017", 30, true)).unwrap();
    description
        .update(with_timeout("b:27017", 20, false))
        .unwrap();

    assert_eq!(
        description.logical_session_timeout,
        Some(Duration::from_secs(20 * 60))
    );
}

#[test]
fn incompatible_wire_version_is_recorded() {
    let mut description = topology(&["a:27017"], None);
    description
        .update(description_from_reply(
            "a:27017",
            doc! { "ok": 1, "isWritablePrimary": true, "minWireVersion": 0, "maxWireVersion": 1 },
            Duration::from_millis(5),
        ))
        .unwrap();

    assert!(description
        .compatibility_error()
        .is_some_and(|message| message.contains("wire version 1")));
}

#[test]
fn hosts_are_lowercased() {
    let mut description = topology(&["a:27017"], None);
    description
        .update(primary("a:27017", "rs", &["A:27017", "B:27017"]))
        .unwrap();

    assert_eq!(addresses(&description), vec!["a:27017", "b:27017"]);
}
