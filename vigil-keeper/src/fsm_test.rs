use vigil_core::NodeState;

use super::fsm::{find_transition, should_ensure_current_state, TransitionAction, TRANSITIONS};

#[test]
fn the_table_has_no_duplicate_keys() {
    for (index, transition) in TRANSITIONS.iter().enumerate() {
        let duplicate = TRANSITIONS
            .iter()
            .skip(index + 1)
            .any(|other| other.current == transition.current && other.assigned == transition.assigned);
        assert!(
            !duplicate,
            "duplicate table entry for {} -> {}",
            transition.current, transition.assigned
        );
    }
}

#[test]
fn fresh_nodes_start_as_single() {
    let transition = find_transition(NodeState::Init, NodeState::Single).expect("init -> single must exist");
    assert!(transition.action == TransitionAction::StartAsSingle);
}

#[test]
fn demotion_paths_stop_postgres() {
    for assigned in &[NodeState::Draining, NodeState::Demoted, NodeState::DemoteTimeout] {
        let transition =
            find_transition(NodeState::Primary, *assigned).unwrap_or_else(|| panic!("primary -> {} must exist", assigned));
        assert!(
            transition.action == TransitionAction::StopPostgres,
            "primary -> {} must stop postgres, got {:?}",
            assigned,
            transition.action
        );
    }
}

#[test]
fn every_state_can_be_dropped() {
    // The wildcard row covers states with no exact entry.
    for current in &[
        NodeState::Init,
        NodeState::Single,
        NodeState::Primary,
        NodeState::Secondary,
        NodeState::Maintenance,
        NodeState::Demoted,
        NodeState::ReportLsn,
    ] {
        let transition = find_transition(*current, NodeState::Dropped)
            .unwrap_or_else(|| panic!("{} -> dropped must resolve via the wildcard", current));
        assert!(transition.action == TransitionAction::DropNode);
    }
}

#[test]
fn unknown_pairs_have_no_transition() {
    assert!(find_transition(NodeState::Single, NodeState::Secondary).is_none());
    assert!(find_transition(NodeState::Maintenance, NodeState::Primary).is_none());
}

#[test]
fn promotion_path_is_complete() {
    assert!(find_transition(NodeState::Secondary, NodeState::PreparePromotion).is_some());
    assert!(find_transition(NodeState::PreparePromotion, NodeState::StopReplication).is_some());
    let transition = find_transition(NodeState::StopReplication, NodeState::WaitPrimary).unwrap();
    assert!(transition.action == TransitionAction::MakeReadWrite);
    assert!(find_transition(NodeState::WaitPrimary, NodeState::Primary).is_some());
}

#[test]
fn failover_election_path_is_complete() {
    assert!(find_transition(NodeState::Secondary, NodeState::ReportLsn).is_some());
    assert!(find_transition(NodeState::ReportLsn, NodeState::FastForward).is_some());
    assert!(find_transition(NodeState::FastForward, NodeState::PreparePromotion).is_some());
    assert!(find_transition(NodeState::ReportLsn, NodeState::Secondary).is_some());
}

#[test]
fn ensure_is_skipped_around_demotion_states() {
    for state in &[NodeState::Draining, NodeState::DemoteTimeout, NodeState::Demoted] {
        assert!(
            !should_ensure_current_state(NodeState::Primary, *state),
            "ensure must be skipped going to {}",
            state
        );
        assert!(
            !should_ensure_current_state(*state, NodeState::Catchingup),
            "ensure must be skipped coming from {}",
            state
        );
    }
}

#[test]
fn ensure_runs_for_ordinary_transitions() {
    assert!(should_ensure_current_state(NodeState::Init, NodeState::Single));
    assert!(should_ensure_current_state(NodeState::Secondary, NodeState::PreparePromotion));
    assert!(should_ensure_current_state(NodeState::WaitPrimary, NodeState::Primary));
    assert!(
        !should_ensure_current_state(NodeState::Primary, NodeState::Primary),
        "no transition, nothing to ensure ahead of it"
    );
}
