mod common;

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use common::*;
use testbed_scheduler::domain::bus::message::ArtifactRetrievedEvent;
use testbed_scheduler::domain::clock::SimulatedClock;
use testbed_scheduler::domain::experiment::status::ExperimentStatus;
use testbed_scheduler::domain::scheduling::completion_tracker::{CompletionTracker, TrackerOutcome};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing_test::traced_test;

fn simulated() -> Harness {
    Harness::new(Arc::new(SimulatedClock::starting_at(t0())))
}

/// Spawns the factory's router and returns the sending half of its stream.
fn route_events(h: &Harness) -> mpsc::Sender<ArtifactRetrievedEvent> {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(h.trackers.clone().run(rx));
    tx
}

#[tokio::test(start_paused = true)]
async fn missing_node_fails_after_end_plus_grace() {
    let h = simulated();
    let events = route_events(&h);
    let experiment = h.running_experiment(template("three", t0(), t0() + secs(60), &["n1", "n2", "n3"]));
    let id = experiment.id();
    h.trackers.register(&experiment);

    sleep(Duration::from_secs(30)).await;
    events.send(ArtifactRetrievedEvent::new(id, "n1")).await.unwrap();
    events.send(ArtifactRetrievedEvent::new(id, "n2")).await.unwrap();

    sleep(Duration::from_secs(1)).await;
    assert_eq!(h.trackers.tracker(id).unwrap().retrieved_count(), 2);

    // Deadline is T + 60s + 300s.
    sleep(Duration::from_secs(328)).await;
    assert_eq!(h.status(id), ExperimentStatus::Running);

    sleep(Duration::from_secs(2)).await;
    assert_eq!(h.status(id), ExperimentStatus::FailedToRetrieveLogs);
    assert!(h.trackers.active_trackers().is_empty());

    h.shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn all_nodes_reporting_completes_the_experiment() {
    let h = simulated();
    let events = route_events(&h);
    let experiment = h.running_experiment(template("pair", t0(), t0() + secs(60), &["n1", "n2"]));
    let id = experiment.id();
    h.trackers.register(&experiment);

    sleep(Duration::from_secs(70)).await;
    events.send(ArtifactRetrievedEvent::new(id, "n2")).await.unwrap();
    events.send(ArtifactRetrievedEvent::new(id, "n1")).await.unwrap();
    sleep(Duration::from_millis(1)).await;

    assert_eq!(h.status(id), ExperimentStatus::Done);
    assert!(h.trackers.tracker(id).is_none());

    // Long past the deadline nothing changes.
    sleep(Duration::from_secs(3600)).await;
    assert_eq!(h.status(id), ExperimentStatus::Done);

    h.shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn events_are_routed_to_their_own_experiment() {
    let h = simulated();
    let events = route_events(&h);
    let first = h.running_experiment(template("first", t0(), t0() + secs(60), &["n1"]));
    let second = h.running_experiment(template("second", t0(), t0() + secs(60), &["n1", "n2"]));
    h.trackers.register(&first);
    h.trackers.register(&second);

    events.send(ArtifactRetrievedEvent::new(second.id(), "n1")).await.unwrap();
    sleep(Duration::from_millis(1)).await;

    assert_eq!(h.status(first.id()), ExperimentStatus::Running);
    assert_eq!(h.trackers.tracker(first.id()).unwrap().retrieved_count(), 0);
    assert_eq!(h.trackers.tracker(second.id()).unwrap().retrieved_count(), 1);
    assert_eq!(h.trackers.active_trackers(), vec![first.id(), second.id()]);

    h.shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn duplicate_events_count_once() {
    let h = simulated();
    let experiment = h.running_experiment(template("dup", t0(), t0() + secs(60), &["n1", "n2"]));
    let tracker = CompletionTracker::new(&experiment, Vec::new(), h.lifecycle.clone());
    let event = ArtifactRetrievedEvent::new(experiment.id(), "n1");

    assert_eq!(tracker.on_artifact_retrieved(&event), TrackerOutcome::Pending);
    assert_eq!(tracker.on_artifact_retrieved(&event), TrackerOutcome::Pending);
    assert_eq!(tracker.retrieved_count(), 1);

    let last = ArtifactRetrievedEvent::new(experiment.id(), "n2");
    assert_eq!(tracker.on_artifact_retrieved(&last), TrackerOutcome::Resolved(ExperimentStatus::Done));
    assert_eq!(tracker.on_artifact_retrieved(&last), TrackerOutcome::AlreadyResolved);
    assert_eq!(h.status(experiment.id()), ExperimentStatus::Done);
}

#[tokio::test(start_paused = true)]
async fn registering_twice_keeps_one_tracker() {
    let h = simulated();
    let experiment = h.running_experiment(template("twice", t0(), t0() + secs(60), &["n1"]));

    let first = h.trackers.register(&experiment);
    let second = h.trackers.register(&experiment);

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(h.trackers.active_trackers().len(), 1);

    h.shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn already_retrieved_logs_complete_on_registration() {
    let h = simulated();
    let experiment = h.running_experiment(template("early", t0(), t0() + secs(60), &["n1", "n2"]));
    h.artifacts.store_logs(experiment.id(), "n1");
    h.artifacts.store_logs(experiment.id(), "n2");

    h.trackers.register(&experiment);
    sleep(Duration::from_millis(1)).await;

    assert_eq!(h.status(experiment.id()), ExperimentStatus::Done);
    assert!(h.trackers.active_trackers().is_empty());

    h.shutdown.cancel();
}

#[test]
fn last_event_racing_the_deadline_commits_exactly_once() {
    for _ in 0..50 {
        let h = Harness::new(FixedClock::at(t0()));
        let experiment = h.running_experiment(template("race", t0(), t0() + secs(60), &["n1", "n2"]));
        let tracker = Arc::new(CompletionTracker::new(&experiment, vec![experiment.nodes()[0].id.clone()], h.lifecycle.clone()));
        let barrier = Arc::new(Barrier::new(2));

        let last_event = {
            let (tracker, barrier) = (tracker.clone(), barrier.clone());
            let event = ArtifactRetrievedEvent::new(experiment.id(), "n2");
            thread::spawn(move || {
                barrier.wait();
                tracker.on_artifact_retrieved(&event)
            })
        };
        let deadline = {
            let (tracker, barrier) = (tracker.clone(), barrier.clone());
            thread::spawn(move || {
                barrier.wait();
                tracker.on_deadline()
            })
        };

        let outcomes = [last_event.join().unwrap(), deadline.join().unwrap()];
        let committed: Vec<_> = outcomes.iter().filter(|outcome| matches!(outcome, TrackerOutcome::Resolved(_))).collect();

        assert_eq!(committed.len(), 1, "outcomes: {:?}", outcomes);
        assert!(outcomes.contains(&TrackerOutcome::AlreadyResolved));

        let status = h.status(experiment.id());
        assert_eq!(*committed[0], TrackerOutcome::Resolved(status));
        assert!(matches!(status, ExperimentStatus::Done | ExperimentStatus::FailedToRetrieveLogs));
    }
}

#[test]
fn a_failed_commit_is_retried_once() {
    let store = FlakyStore::new();
    let h = Harness::with_store(FixedClock::at(t0()), store.clone());
    let experiment = h.running_experiment(template("retry", t0(), t0() + secs(60), &["n1"]));
    let tracker = CompletionTracker::new(&experiment, Vec::new(), h.lifecycle.clone());
    store.fail_next_updates(1);

    let outcome = tracker.on_artifact_retrieved(&ArtifactRetrievedEvent::new(experiment.id(), "n1"));

    assert_eq!(outcome, TrackerOutcome::Resolved(ExperimentStatus::Done));
    assert_eq!(h.status(experiment.id()), ExperimentStatus::Done);
}

#[test]
#[traced_test]
fn twice_failed_commit_is_reported_as_stuck() {
    let store = FlakyStore::new();
    let h = Harness::with_store(FixedClock::at(t0()), store.clone());
    let experiment = h.running_experiment(template("stuck", t0(), t0() + secs(60), &["n1"]));
    let tracker = CompletionTracker::new(&experiment, Vec::new(), h.lifecycle.clone());
    let updates_before = store.update_calls();
    store.fail_next_updates(2);

    assert_eq!(tracker.on_deadline(), TrackerOutcome::Stuck);

    assert_eq!(store.update_calls() - updates_before, 2);
    assert_eq!(h.status(experiment.id()), ExperimentStatus::Running);
    assert!(tracker.is_resolved());
    assert!(logs_contain("Stuck experiment"));
}
