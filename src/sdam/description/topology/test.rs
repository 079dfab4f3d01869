use std::time::Duration;

use bson::{doc, oid::ObjectId};

use super::{TopologyDescription, TopologyType};
use crate::{
    error::Error,
    options::{ClientOptions, ServerAddress},
    sdam::description::server::{test_helpers::description_from_hello, ServerDescription, ServerType},
    selection_criteria::{ReadPreference, ReadPreferenceOptions, SelectionCriteria},
};

fn addr(s: &str) -> ServerAddress {
    ServerAddress::parse(s).unwrap()
}

fn topology_with_seeds(seeds: &[&str]) -> TopologyDescription {
    let options = ClientOptions::builder()
        .hosts(seeds.iter().map(|s| addr(s)).collect::<Vec<_>>())
        .build();
    TopologyDescription::new(&options).unwrap()
}

fn oid(byte: u8) -> ObjectId {
    let mut bytes = [0u8; 12];
    bytes[11] = byte;
    ObjectId::from_bytes(bytes)
}

#[test]
fn single_seed_standalone() {
    let mut topology = topology_with_seeds(&["127.0.0.1:27017"]);

    topology
        .update(description_from_hello(
            "127.0.0.1:27017",
            doc! { "ok": 1, "ismaster": true, "maxWireVersion": 17, "minWireVersion": 0 },
        ))
        .unwrap();

    assert_eq!(topology.topology_type(), TopologyType::Single);
    let server = topology
        .get_server_description(&addr("127.0.0.1:27017"))
        .unwrap();
    assert_eq!(server.server_type, ServerType::Standalone);

    let selected = topology
        .select_server(&SelectionCriteria::ReadPreference(ReadPreference::Primary))
        .unwrap();
    assert_eq!(selected.address, addr("127.0.0.1:27017"));
}

#[test]
fn single_topology_selects_sole_server_in_any_state() {
    let options = ClientOptions::builder()
        .hosts(vec![addr("a:27017")])
        .direct_connection(Some(true))
        .build();
    let mut topology = TopologyDescription::new(&options).unwrap();
    assert_eq!(topology.topology_type(), TopologyType::Single);

    // Before the first heartbeat the sole server is still Unknown, but a direct connection has
    // nowhere else to go, so selection must hand it back immediately.
    let nearest = SelectionCriteria::ReadPreference(ReadPreference::Nearest {
        options: Default::default(),
    });
    let selected = topology.select_server(&nearest).unwrap();
    assert_eq!(selected.address, addr("a:27017"));

    // The same holds after a failed heartbeat reverts the server to Unknown.
    topology
        .update(description_from_hello(
            "a:27017",
            doc! { "ok": 1, "ismaster": true, "maxWireVersion": 17 },
        ))
        .unwrap();
    topology
        .update(ServerDescription::new_from_error(
            addr("a:27017"),
            Error::from(crate::error::ErrorKind::from(
                std::io::ErrorKind::ConnectionReset,
            )),
        ))
        .unwrap();
    let selected = topology.select_server(&nearest).unwrap();
    assert_eq!(selected.address, addr("a:27017"));
}

#[test]
fn standalone_in_multi_seed_topology_is_dropped() {
    let mut topology = topology_with_seeds(&["a:27017", "b:27017"]);

    topology
        .update(description_from_hello(
            "a:27017",
            doc! { "ok": 1, "ismaster": true, "maxWireVersion": 17 },
        ))
        .unwrap();

    assert_eq!(topology.topology_type(), TopologyType::Unknown);
    assert!(topology.get_server_description(&addr("a:27017")).is_none());
}

fn primary_hello(set_version: i32, election_byte: u8) -> bson::Document {
    doc! {
        "ok": 1,
        "ismaster": true,
        "setName": "replset1",
        "hosts": ["a:27018", "b:27019", "c:27020"],
        "setVersion": set_version,
        "electionId": oid(election_byte),
        "maxWireVersion": 17,
        "minWireVersion": 0,
        "logicalSessionTimeoutMinutes": 30,
    }
}

#[test]
fn replica_set_discovery_from_one_seed() {
    let mut topology = topology_with_seeds(&["a:27018"]);

    topology
        .update(description_from_hello("a:27018", primary_hello(3, 1)))
        .unwrap();

    assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);
    assert_eq!(topology.set_name.as_deref(), Some("replset1"));
    assert_eq!(topology.servers.len(), 3);

    for host in ["a:27018", "b:27019", "c:27020"] {
        assert!(
            topology.get_server_description(&addr(host)).is_some(),
            "expected {} in topology",
            host
        );
    }

    assert_eq!(
        topology
            .get_server_description(&addr("a:27018"))
            .unwrap()
            .server_type,
        ServerType::RsPrimary
    );
    assert_eq!(
        topology
            .get_server_description(&addr("b:27019"))
            .unwrap()
            .server_type,
        ServerType::Unknown
    );
}

#[test]
fn primary_step_down_and_new_election() {
    let mut topology = topology_with_seeds(&["a:27018"]);
    topology
        .update(description_from_hello("a:27018", primary_hello(3, 1)))
        .unwrap();
    assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);

    // The primary becomes unreachable.
    topology
        .update(ServerDescription::new_from_error(
            addr("a:27018"),
            Error::from(crate::error::ErrorKind::from(
                std::io::ErrorKind::ConnectionReset,
            )),
        ))
        .unwrap();
    assert_eq!(topology.topology_type(), TopologyType::ReplicaSetNoPrimary);

    // b wins the next election with a higher set version.
    let mut b_hello = primary_hello(4, 2);
    b_hello.insert("me", "b:27019");
    topology
        .update(description_from_hello("b:27019", b_hello))
        .unwrap();

    assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);
    assert_eq!(
        topology
            .get_server_description(&addr("b:27019"))
            .unwrap()
            .server_type,
        ServerType::RsPrimary
    );
}

#[test]
fn stale_primary_is_demoted_to_unknown() {
    let mut topology = topology_with_seeds(&["a:27018"]);

    // a claims primacy at (setVersion 4, electionId 2).
    let mut a_hello = primary_hello(4, 2);
    a_hello.insert("me", "a:27018");
    topology
        .update(description_from_hello("a:27018", a_hello))
        .unwrap();

    // b claims primacy with a stale (setVersion 3, electionId 1) pair: it has not yet learned
    // it lost. The claim is not believed and a remains primary.
    let mut b_hello = primary_hello(3, 1);
    b_hello.insert("me", "b:27019");
    topology
        .update(description_from_hello("b:27019", b_hello))
        .unwrap();

    assert_eq!(
        topology
            .get_server_description(&addr("b:27019"))
            .unwrap()
            .server_type,
        ServerType::Unknown
    );
    assert_eq!(
        topology
            .get_server_description(&addr("a:27018"))
            .unwrap()
            .server_type,
        ServerType::RsPrimary
    );
    assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);
}

#[test]
fn newer_primary_demotes_previous_one() {
    let mut topology = topology_with_seeds(&["a:27018"]);
    let mut a_hello = primary_hello(3, 1);
    a_hello.insert("me", "a:27018");
    topology
        .update(description_from_hello("a:27018", a_hello))
        .unwrap();

    let mut b_hello = primary_hello(4, 2);
    b_hello.insert("me", "b:27019");
    topology
        .update(description_from_hello("b:27019", b_hello))
        .unwrap();

    // The old primary is relabeled unknown until its own next hello.
    assert_eq!(
        topology
            .get_server_description(&addr("a:27018"))
            .unwrap()
            .server_type,
        ServerType::Unknown
    );
    assert_eq!(
        topology
            .get_server_description(&addr("b:27019"))
            .unwrap()
            .server_type,
        ServerType::RsPrimary
    );
}

#[test]
fn mongos_discovery_and_pruning() {
    let mut topology = topology_with_seeds(&["r1:27017", "r2:27017"]);

    topology
        .update(description_from_hello(
            "r1:27017",
            doc! { "ok": 1, "ismaster": true, "msg": "isdbgrid", "maxWireVersion": 17 },
        ))
        .unwrap();
    assert_eq!(topology.topology_type(), TopologyType::Sharded);

    // A non-mongos in a sharded topology is removed.
    topology
        .update(description_from_hello(
            "r2:27017",
            doc! { "ok": 1, "ismaster": true, "maxWireVersion": 17 },
        ))
        .unwrap();
    assert!(topology.get_server_description(&addr("r2:27017")).is_none());
}

#[test]
fn member_with_wrong_set_name_is_removed() {
    let mut topology = topology_with_seeds(&["a:27018"]);
    topology
        .update(description_from_hello("a:27018", primary_hello(3, 1)))
        .unwrap();

    let b_hello = doc! {
        "ok": 1,
        "secondary": true,
        "setName": "otherset",
        "hosts": ["b:27019"],
        "maxWireVersion": 17,
    };
    topology
        .update(description_from_hello("b:27019", b_hello))
        .unwrap();

    assert!(topology.get_server_description(&addr("b:27019")).is_none());
}

#[test]
fn wire_version_overlap_is_required() {
    let mut topology = topology_with_seeds(&["a:27017"]);

    topology
        .update(description_from_hello(
            "a:27017",
            doc! { "ok": 1, "ismaster": true, "maxWireVersion": 2, "minWireVersion": 0 },
        ))
        .unwrap();

    let error = topology.compatibility_error().unwrap();
    assert!(error.contains("a:27017"), "{}", error);
}

#[test]
fn session_timeout_is_min_across_data_bearing_members() {
    let mut topology = topology_with_seeds(&["a:27018"]);
    topology
        .update(description_from_hello("a:27018", primary_hello(3, 1)))
        .unwrap();
    assert_eq!(
        topology.logical_session_timeout,
        Some(Duration::from_secs(30 * 60))
    );

    // A secondary with a smaller timeout lowers the deployment-wide value.
    let b_hello = doc! {
        "ok": 1,
        "secondary": true,
        "setName": "replset1",
        "hosts": ["a:27018", "b:27019", "c:27020"],
        "me": "b:27019",
        "maxWireVersion": 17,
        "logicalSessionTimeoutMinutes": 20,
    };
    topology
        .update(description_from_hello("b:27019", b_hello))
        .unwrap();
    assert_eq!(
        topology.logical_session_timeout,
        Some(Duration::from_secs(20 * 60))
    );

    // A data-bearing member that hasn't reported one makes it unknown.
    let c_hello = doc! {
        "ok": 1,
        "secondary": true,
        "setName": "replset1",
        "hosts": ["a:27018", "b:27019", "c:27020"],
        "me": "c:27020",
        "maxWireVersion": 17,
    };
    topology
        .update(description_from_hello("c:27020", c_hello))
        .unwrap();
    assert_eq!(topology.logical_session_timeout, None);
}

mod selection {
    use std::collections::HashMap;

    use super::*;

    fn secondary_hello(me: &str, tags: Option<bson::Document>) -> bson::Document {
        let mut hello = doc! {
            "ok": 1,
            "secondary": true,
            "setName": "replset1",
            "hosts": ["a:27018", "b:27019", "c:27020"],
            "me": me,
            "maxWireVersion": 17,
            "logicalSessionTimeoutMinutes": 30,
        };
        if let Some(tags) = tags {
            hello.insert("tags", tags);
        }
        hello
    }

    /// Three secondaries with the given RTTs in milliseconds, no primary.
    fn secondaries_with_rtts(rtts: [u64; 3]) -> TopologyDescription {
        let mut topology = topology_with_seeds(&["a:27018", "b:27019", "c:27020"]);
        let hosts = ["a:27018", "b:27019", "c:27020"];

        for (host, rtt) in hosts.iter().zip(rtts) {
            let mut description = description_from_hello(host, secondary_hello(host, None));
            description.average_round_trip_time = Some(Duration::from_millis(rtt));
            topology.update(description).unwrap();
        }

        topology.local_threshold = Some(Duration::from_millis(15));
        topology
    }

    fn nearest() -> SelectionCriteria {
        SelectionCriteria::ReadPreference(ReadPreference::Nearest {
            options: Default::default(),
        })
    }

    #[test]
    fn latency_window_excludes_slow_servers() {
        let topology = secondaries_with_rtts([10, 20, 120]);

        let in_window: Vec<_> = (0..100)
            .map(|_| topology.select_server(&nearest()).unwrap().address.clone())
            .collect();

        assert!(in_window.iter().all(|address| {
            *address == addr("a:27018") || *address == addr("b:27019")
        }));
    }

    #[test]
    fn selection_is_uniform_within_window() {
        let topology = secondaries_with_rtts([10, 20, 120]);

        let mut counts: HashMap<ServerAddress, u32> = HashMap::new();
        for _ in 0..10_000 {
            let selected = topology.select_server(&nearest()).unwrap();
            *counts.entry(selected.address.clone()).or_default() += 1;
        }

        assert_eq!(counts.len(), 2);
        // Each of the two eligible servers should get 50% ± 2% of selections.
        for (address, count) in counts {
            assert!(
                (4800..=5200).contains(&count),
                "expected ~5000 selections for {}, got {}",
                address,
                count
            );
        }
    }

    #[test]
    fn every_selection_is_a_suitable_server() {
        let topology = secondaries_with_rtts([10, 20, 120]);
        let criteria = nearest();

        for _ in 0..1000 {
            let selected = topology.select_server(&criteria).unwrap();
            let suitable = topology.suitable_servers(&criteria);
            assert!(suitable.iter().any(|s| s.address == selected.address));

            let min_rtt = suitable
                .iter()
                .filter_map(|s| s.average_round_trip_time)
                .min()
                .unwrap();
            assert!(
                selected.average_round_trip_time.unwrap()
                    <= min_rtt + Duration::from_millis(15)
            );
        }
    }

    #[test]
    fn first_matching_tag_set_wins() {
        let mut topology = topology_with_seeds(&["a:27018", "b:27019", "c:27020"]);

        let tag_doc = |dc: &str| doc! { "dc": dc };
        for (host, dc) in [("a:27018", "ny"), ("b:27019", "sf"), ("c:27020", "sf")] {
            let mut description =
                description_from_hello(host, secondary_hello(host, Some(tag_doc(dc))));
            description.average_round_trip_time = Some(Duration::from_millis(10));
            topology.update(description).unwrap();
        }

        let tag_set = |dc: &str| {
            let mut tags = crate::selection_criteria::TagSet::new();
            tags.insert("dc".to_string(), dc.to_string());
            tags
        };

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
            options: ReadPreferenceOptions::builder()
                .tag_sets(vec![tag_set("tokyo"), tag_set("sf"), tag_set("ny")])
                .build(),
        });

        // "tokyo" matches nothing, so "sf" applies and "ny" is never consulted.
        for _ in 0..50 {
            let selected = topology.select_server(&criteria).unwrap();
            assert_ne!(selected.address, addr("a:27018"));
        }
    }

    #[test]
    fn no_tag_set_match_yields_no_candidates() {
        let mut topology = topology_with_seeds(&["a:27018"]);
        let mut description = description_from_hello(
            "a:27018",
            secondary_hello("a:27018", Some(doc! { "dc": "ny" })),
        );
        description.average_round_trip_time = Some(Duration::from_millis(10));
        topology.update(description).unwrap();

        let mut tags = crate::selection_criteria::TagSet::new();
        tags.insert("dc".to_string(), "mars".to_string());

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
            options: ReadPreferenceOptions::builder()
                .tag_sets(vec![tags])
                .build(),
        });

        assert!(topology.select_server(&criteria).is_none());
    }

    #[test]
    fn unknown_topology_has_no_candidates() {
        let topology = topology_with_seeds(&["a:27018"]);
        assert!(topology
            .select_server(&SelectionCriteria::ReadPreference(ReadPreference::Primary))
            .is_none());
    }
}
