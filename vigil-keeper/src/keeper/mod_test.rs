use vigil_core::NodeState;

use super::report_pg_is_running;

const TIMEOUT: u64 = 20;
const MAX_RETRIES: u32 = 3;

fn report(role: NodeState, running: bool, first_failure: i64, retries: u32, now: i64) -> bool {
    report_pg_is_running(role, running, first_failure, retries, TIMEOUT, MAX_RETRIES, now)
}

#[test]
fn non_primary_roles_report_the_truth() {
    for role in &[NodeState::Single, NodeState::Secondary, NodeState::Catchingup, NodeState::Demoted] {
        assert!(report(*role, true, 0, 0, 1000), "{} running must report true", role);
        assert!(!report(*role, false, 0, 0, 1000), "{} not running must report false", role);
        assert!(
            !report(*role, false, 990, 5, 1000),
            "{} reports the truth regardless of retry accounting",
            role
        );
    }
}

#[test]
fn a_running_primary_reports_true() {
    assert!(report(NodeState::Primary, true, 0, 0, 1000));
}

#[test]
fn a_primary_with_no_restart_attempted_yet_reports_true() {
    assert!(report(NodeState::Primary, false, 0, 0, 1000));
}

#[test]
fn a_primary_within_the_grace_period_reports_true() {
    // First failure 5 seconds ago, one attempt: too early for a failover.
    assert!(report(NodeState::Primary, false, 995, 1, 1000));
}

#[test]
fn a_primary_escalates_after_the_timeout() {
    // First failure recorded at 979, now 1000: 21s > 20s budget.
    assert!(!report(NodeState::Primary, false, 979, 1, 1000));
}

#[test]
fn a_primary_escalates_after_too_many_retries() {
    assert!(!report(NodeState::Primary, false, 995, MAX_RETRIES, 1000));
}

#[test]
fn escalation_takes_whichever_budget_runs_out_first() {
    // Exactly at the timeout boundary with retries to spare: still true.
    assert!(report(NodeState::Primary, false, 980, 1, 1000));
    // One second past the boundary: false.
    assert!(!report(NodeState::Primary, false, 980, 1, 1001));
    // Within the timeout but out of retries: false.
    assert!(!report(NodeState::Primary, false, 999, 3, 1000));
}
