//! Network hopping tests
//!
//! Covers the hop threshold, the broker budget rollover and the cursor
//! wrapping around the candidate list.


use stationkeeper::broker::SENTINEL_BROKER_HOST;
use stationkeeper::{ConnectionStatus, LinkState, RetryCounters, RetryPolicy};
use test_helpers::{broker_network, joins_for, link_only_network, test_config, Harness};

fn three_networks() -> Vec<stationkeeper::NetworkDescriptor> {
    vec![
        broker_network("alpha"),
        broker_network("bravo"),
        broker_network("charlie"),
    ]
}

#[test]
fn test_twenty_link_failures_select_next_network_once() {
    // Arrange: the link never comes up on any network
    let mut h: Harness = Harness::new();
    h.manager.begin_with_candidates(three_networks(), 0).unwrap();
    h.manager.set_retry_counters(RetryCounters::default());

    // Act
    h.ticks(19);

    // Assert: still on the first network
    assert_eq!(h.manager.current_index(), Some(0));
    assert_eq!(h.manager.retry_counters().link_failures, 19);
    assert_eq!(joins_for(&h.link, "bravo"), 0);

    // Act: the twentieth failure
    let status = h.tick();

    // Assert
    assert_eq!(status, ConnectionStatus::Disconnected);
    assert_eq!(h.manager.current_index(), Some(1));
    assert_eq!(h.manager.retry_counters().link_failures, 0);
    assert_eq!(joins_for(&h.link, "bravo"), 1);
    assert_eq!(joins_for(&h.link, "charlie"), 0);

    h.tick();
    assert_eq!(h.manager.current_index(), Some(1));
    assert_eq!(h.manager.retry_counters().link_failures, 1);
}

#[test]
fn test_link_down_retries_do_not_rejoin() {
    let mut h: Harness = Harness::new();
    h.manager.begin_with_candidates(three_networks(), 0).unwrap();

    h.ticks(19);

    assert_eq!(h.link.joins().len(), 1);
}

#[test]
fn test_failover_tears_down_and_reconfigures_session() {
    let mut h: Harness = Harness::new();
    h.manager.begin_with_candidates(three_networks(), 0).unwrap();
    h.ticks(19);
    h.link.clear_history();
    let disconnects = h.broker.disconnect_count();

    h.tick();

    assert_eq!(h.link.calls(), vec!["stop_access_point", "disconnect", "connect"]);
    assert_eq!(h.broker.disconnect_count(), disconnects + 1);
    let (host, port, _) = h.broker.endpoint().unwrap();
    assert_eq!(host, "bravo.broker.local");
    assert_eq!(port, 1883);
    assert_eq!(h.manager.current_descriptor().unwrap().network_name, "bravo");
}

#[test]
fn test_failover_wraps_around_the_list() {
    let mut h: Harness = Harness::new();
    h.manager.begin_with_candidates(three_networks(), 0).unwrap();

    h.ticks(40);
    assert_eq!(h.manager.current_index(), Some(2));

    h.ticks(20);
    assert_eq!(h.manager.current_index(), Some(0));
    assert_eq!(joins_for(&h.link, "alpha"), 2);
    assert_eq!(joins_for(&h.link, "bravo"), 1);
    assert_eq!(joins_for(&h.link, "charlie"), 1);
}

#[test]
fn test_start_index_selects_first_network() {
    let mut h: Harness = Harness::new();
    h.manager.begin_with_candidates(three_networks(), 2).unwrap();
    assert_eq!(
        h.link.joins(),
        vec![("charlie".to_string(), Some("hunter22".to_string()))]
    );

    h.ticks(20);

    assert_eq!(h.manager.current_index(), Some(0));
}

#[test]
fn test_broker_failures_escalate_only_through_rollover() {
    // Arrange: link is up but every handshake is rejected
    let mut h: Harness = Harness::new();
    h.link.set_join_connects(true);
    h.broker.set_accept_handshakes(false);
    h.manager
        .begin_with_candidates(vec![broker_network("alpha"), broker_network("bravo")], 0)
        .unwrap();

    // Act: 19 full budgets plus 4 attempts
    h.ticks(99);

    // Assert
    let counters = h.manager.retry_counters();
    assert_eq!(counters.link_failures, 19);
    assert_eq!(counters.broker_attempts, 4);
    assert_eq!(h.broker.connect_attempts(), 99);
    assert_eq!(h.manager.current_index(), Some(0));

    // Act: the hundredth rejected handshake rolls over into the twentieth link failure
    let status = h.tick();

    // Assert
    assert_eq!(status, ConnectionStatus::Disconnected);
    assert_eq!(h.manager.current_index(), Some(1));
    assert_eq!(h.manager.retry_counters(), RetryCounters::default());
}

#[test]
fn test_custom_retry_policy() {
    let config = stationkeeper::ManagerConfig {
        retry: RetryPolicy {
            hop_threshold: 3,
            broker_attempt_budget: 2,
        },
        ..test_config()
    };
    let mut h: Harness = Harness::with_config(config);
    h.link.set_join_connects(true);
    h.broker.set_accept_handshakes(false);
    h.manager
        .begin_with_candidates(vec![broker_network("alpha"), broker_network("bravo")], 0)
        .unwrap();

    h.ticks(5);
    assert_eq!(h.manager.current_index(), Some(0));

    h.tick();
    assert_eq!(h.manager.current_index(), Some(1));
}

#[test]
fn test_hopping_disabled_resets_counters_without_moving() {
    let mut h: Harness = Harness::new();
    h.manager.set_hopping(false);
    h.manager
        .begin_with_candidates(vec![broker_network("alpha"), broker_network("bravo")], 0)
        .unwrap();
    assert!(!h.manager.hopping_enabled());

    h.ticks(20);

    assert_eq!(h.manager.current_index(), Some(0));
    assert_eq!(h.manager.retry_counters().link_failures, 0);
    assert_eq!(joins_for(&h.link, "bravo"), 0);
    assert!(!h.link.calls().contains(&"disconnect"));
}

#[test]
fn test_single_network_does_not_hop_by_default() {
    let mut h: Harness = Harness::new();
    h.manager.begin(broker_network("alpha")).unwrap();
    assert!(!h.manager.hopping_enabled());

    h.ticks(45);

    assert_eq!(h.link.joins().len(), 1);
    assert_eq!(h.manager.retry_counters().link_failures, 5);
}

#[test]
fn test_hopping_forced_on_single_network_rejoins_it() {
    let mut h: Harness = Harness::new();
    h.manager.set_hopping(true);
    h.manager.begin(broker_network("alpha")).unwrap();

    h.ticks(20);

    assert_eq!(h.manager.current_index(), Some(0));
    assert_eq!(joins_for(&h.link, "alpha"), 2);
}

#[test]
fn test_failover_to_link_only_network_targets_sentinel() {
    let mut h: Harness = Harness::new();
    h.manager
        .begin_with_candidates(vec![broker_network("alpha"), link_only_network("bravo")], 0)
        .unwrap();

    h.ticks(20);
    let (host, _, _) = h.broker.endpoint().unwrap();
    assert_eq!(host, SENTINEL_BROKER_HOST);

    h.link.set_state(LinkState::Connected);
    h.broker.clear_history();
    for _ in 0..100 {
        assert_eq!(h.tick(), ConnectionStatus::LinkOnly);
    }
    assert_eq!(h.broker.connect_attempts(), 0);
}

#[test]
fn test_recovered_link_clears_failure_count() {
    let mut h: Harness = Harness::new();
    h.manager.begin_with_candidates(three_networks(), 0).unwrap();
    h.ticks(15);

    h.link.set_state(LinkState::Connected);
    h.tick();
    assert_eq!(h.manager.retry_counters().link_failures, 0);

    h.link.set_state(LinkState::Disconnected);
    h.ticks(19);
    assert_eq!(h.manager.current_index(), Some(0));
}
