use super::service::in_network_partition;

const T: u64 = 30;

#[test]
fn partitioned_when_both_contacts_are_stale() {
    // Both contacts 35 seconds stale with a 30 second timeout.
    assert!(in_network_partition(965, 965, 1000, T));
}

#[test]
fn not_partitioned_while_the_standby_answers() {
    // Monitor stale, standby recent.
    assert!(!in_network_partition(965, 999, 1000, T));
}

#[test]
fn not_partitioned_while_the_monitor_answers() {
    assert!(!in_network_partition(999, 965, 1000, T));
}

#[test]
fn a_node_that_never_had_contact_is_not_partitioned() {
    // Zero timestamps mean "never": a primary that never saw a standby
    // must not self-demote, there is nothing to fail over to.
    assert!(!in_network_partition(0, 965, 1000, T));
    assert!(!in_network_partition(965, 0, 1000, T));
    assert!(!in_network_partition(0, 0, 1000, T));
}

#[test]
fn a_zero_timeout_disables_the_check() {
    assert!(!in_network_partition(1, 1, 1_000_000, 0));
}

#[test]
fn the_timeout_boundary_is_strict() {
    // Exactly at the timeout: not partitioned yet.
    assert!(!in_network_partition(970, 970, 1000, T));
    // One second past: partitioned.
    assert!(in_network_partition(969, 969, 1000, T));
}
