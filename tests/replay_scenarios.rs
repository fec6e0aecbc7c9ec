//! End-to-end replays of small synthetic jobs

mod utils;

use utils::*;
use waitcause::config::AnalysisConfig;
use waitcause::context::WaitKind;
use waitcause::replay::{AnalysisCallback, EventView, FinishView, Job, Stage, TraceBundle};
use waitcause::report::{JobReport, SeverityProfile};
use waitcause::trace::{EventKind, RmaSync};
use waitcause::ReplayError;

fn replay(bundle: TraceBundle, config: AnalysisConfig) -> Vec<Recorder> {
    let job = Job::new(bundle, config).unwrap();
    job.run_with(|_| Recorder::new())
        .unwrap()
        .into_iter()
        .map(|out| out.callback)
        .collect()
}

fn profile(bundle: TraceBundle) -> (Job, Vec<SeverityProfile>) {
    let job = Job::new(bundle, AnalysisConfig::full()).unwrap();
    let outputs = job.run_with(|_| SeverityProfile::new()).unwrap();
    let profiles = outputs.into_iter().map(|o| o.callback).collect();
    (job, profiles)
}

fn barrier_job() -> TraceBundle {
    let mut s = Scenario::processes(4);
    for (loc, enter) in [0.0, 1.0, 2.0, 5.0].into_iter().enumerate() {
        s.barrier(loc, enter, 6.0);
    }
    s.bundle(7.0)
}

#[test]
fn test_barrier_waits_for_latest_arrival() {
    let recorders = replay(barrier_job(), AnalysisConfig::basic());
    let waits: Vec<Vec<f64>> = recorders.iter().map(|r| r.waits(WaitKind::Barrier)).collect();
    assert_eq!(waits, vec![vec![5.0], vec![4.0], vec![3.0], vec![]]);

    for r in &recorders {
        assert!(r.synchpoints(WaitKind::Barrier).iter().all(|i| approx(i.completion_time, 0.0)));
    }
}

#[test]
fn test_barrier_synchronizes_every_rank() {
    let recorders = replay(barrier_job(), AnalysisConfig::basic());
    let ranks = recorders[0].ranks.values().next().unwrap();
    assert_eq!(ranks, &vec![0, 1, 2, 3]);
}

#[test]
fn test_broadcast_waits_only_for_root() {
    let mut s = Scenario::processes(4);
    for (loc, enter) in [2.0, 0.0, 1.0, 3.0].into_iter().enumerate() {
        s.bcast(loc, 0, enter, 4.0);
    }
    let recorders = replay(s.bundle(5.0), AnalysisConfig::basic());

    assert!(recorders[0].waits(WaitKind::OneToN).is_empty());
    assert_eq!(recorders[1].waits(WaitKind::OneToN), vec![2.0]);
    assert_eq!(recorders[2].waits(WaitKind::OneToN), vec![1.0]);
    assert!(recorders[3].waits(WaitKind::OneToN).is_empty());
}

#[test]
fn test_late_sender_delay_lands_on_sender_work() {
    let mut s = Scenario::processes(2);
    s.region(0, WORK, 0.0, 10.0).send(0, 1, 7, 10.0, 11.0);
    s.recv(1, 0, 7, 0.0, 11.0);
    let (job, profiles) = profile(s.bundle(12.0));

    let receiver = &profiles[1].nodes()[&RECV];
    assert!(approx(receiver.wait["late_sender"], 10.0));
    assert!(approx(receiver.indirect_wait, 0.0));

    let cause = &profiles[0].nodes()[&WORK];
    assert!(approx(cause.delay["late_sender.direct"], 10.0));

    let outputs = job.run_with(|_| SeverityProfile::new()).unwrap();
    let report = JobReport::build(&job, &outputs).unwrap();
    assert!(approx(report.totals.total_delay(), report.totals.total_wait()));
    let work = report.callpaths.iter().find(|c| c.callpath == WORK).unwrap();
    assert_eq!(work.path, "main/work");
}

#[test]
fn test_late_receiver_detected_in_backward_pass() {
    let mut s = Scenario::processes(2);
    s.ssend(0, 1, 3, 0.0, 5.0);
    s.recv(1, 0, 3, 3.0, 5.0);
    let recorders = replay(s.bundle(6.0), AnalysisConfig::full());

    let lr: Vec<_> = recorders[0]
        .detected
        .iter()
        .filter(|(_, _, kind, _)| *kind == WaitKind::LateReceiver)
        .collect();
    assert_eq!(lr.len(), 1);
    assert_eq!(lr[0].0, Stage::BackwardWaitStates);
    assert!(approx(lr[0].3.wait_time, 3.0));

    // The receiver is a synchpoint of the same pair, found in the next pass
    assert!(recorders[1]
        .detected
        .iter()
        .any(|(stage, _, kind, _)| *stage == Stage::ForwardSynchpoints && *kind == WaitKind::LateReceiver));
    assert!(recorders[1].waits(WaitKind::LateSender).is_empty());
}

#[test]
fn test_late_receiver_delay_charged_to_receiver() {
    let mut s = Scenario::processes(2);
    s.ssend(0, 1, 3, 0.0, 5.0);
    s.recv(1, 0, 3, 3.0, 5.0);
    let (_, profiles) = profile(s.bundle(6.0));

    let cause = &profiles[1].nodes()[&MAIN];
    assert!(approx(cause.delay["late_receiver.direct"], 3.0));
}

#[test]
fn test_collective_info_survives_to_delay_pass() {
    let recorders = replay(barrier_job(), AnalysisConfig::full());
    for r in &recorders {
        let main: Vec<_> = r.collinfo.iter().filter(|((stage, _), _)| *stage == Stage::Main).collect();
        assert!(!main.is_empty());
        for ((_, event), info) in main {
            assert_eq!(r.collinfo.get(&(Stage::BackwardDelay, *event)), Some(info));
        }
    }
}

#[test]
fn test_single_pass_skips_backward_stages() {
    let recorders = replay(barrier_job(), AnalysisConfig::single());
    for r in &recorders {
        assert!(r.detected.iter().all(|(stage, _, _, _)| *stage == Stage::Main));
        assert!(r.collinfo.keys().all(|(stage, _)| *stage == Stage::Main));
    }
}

fn thread_barrier_job() -> TraceBundle {
    let mut s = Scenario::threads(3);
    s.push(0, 1.0, EventKind::Fork { team_size: 3 });
    for (thread, arrival) in [3.0, 4.0, 6.0].into_iter().enumerate() {
        s.enter(thread, PARALLEL, 1.0)
            .region(thread, THREAD_BARRIER, arrival, 6.5)
            .leave(thread, PARALLEL, 7.0);
    }
    s.push(0, 7.5, EventKind::Join);
    s.bundle(8.0)
}

#[test]
fn test_thread_barrier_waits() {
    let recorders = replay(thread_barrier_job(), AnalysisConfig::basic());
    let waits: Vec<Vec<f64>> = recorders.iter().map(|r| r.waits(WaitKind::ThreadBarrier)).collect();
    assert_eq!(waits, vec![vec![3.0], vec![2.0], vec![]]);
}

#[test]
fn test_thread_barrier_delay_on_latest_thread() {
    let (_, profiles) = profile(thread_barrier_job());
    let delay: f64 = profiles
        .iter()
        .flat_map(|p| p.nodes().values())
        .map(|s| s.total_delay())
        .sum();
    assert!(approx(delay, 5.0));

    let latest = &profiles[2].nodes()[&PARALLEL];
    assert!(approx(latest.delay["thread_barrier.direct"], 5.0));
}

#[test]
fn test_fence_wait_on_early_process() {
    let mut s = Scenario::processes(2);
    for (loc, enter) in [2.0, 5.0].into_iter().enumerate() {
        s.fence(loc, RmaSync::Create, 0.0, 1.0)
            .fence(loc, RmaSync::Fence, enter, 6.0)
            .fence(loc, RmaSync::Free, 7.0, 8.0);
    }
    let recorders = replay(s.bundle(9.0), AnalysisConfig::single());
    assert!(approx(recorders[0].rma_wait, 3.0));
    assert!(approx(recorders[1].rma_wait, 0.0));
}

/// Fails once, on the first `work` region of location zero
#[derive(Debug)]
struct FailOnWork {
    armed: bool,
}

impl AnalysisCallback for FailOnWork {
    fn on_event(&mut self, stage: Stage, view: &EventView<'_>) -> waitcause::Result<()> {
        if self.armed && stage == Stage::Main && view.event.is_enter() && view.event.cnode() == WORK {
            self.armed = false;
            return Err(ReplayError::Callback("rejected work region".to_string()));
        }
        Ok(())
    }
}

#[test]
fn test_callback_error_stops_job_at_next_collective() {
    let mut s = Scenario::processes(2);
    s.region(0, WORK, 0.0, 1.0);
    s.barrier(0, 1.0, 3.0).barrier(1, 2.0, 3.0);
    let job = Job::new(s.bundle(4.0), AnalysisConfig::basic()).unwrap();

    let err = job
        .run_with(|loc| FailOnWork {
            armed: loc.process == 0,
        })
        .unwrap_err();
    assert!(matches!(err, ReplayError::HealthCheck(1)), "{err}");
}

#[test]
fn test_callback_error_without_collectives_stops_at_pass_close() {
    let mut s = Scenario::processes(1);
    s.region(0, WORK, 0.0, 1.0);
    let job = Job::new(s.bundle(2.0), AnalysisConfig::basic()).unwrap();

    let err = job.run_with(|_| FailOnWork { armed: true }).unwrap_err();
    assert!(matches!(err, ReplayError::HealthCheck(1)), "{err}");
}

/// Fails on the first event it sees in `stage`
#[derive(Debug)]
struct FailInStage {
    stage: Stage,
    armed: bool,
}

impl AnalysisCallback for FailInStage {
    fn on_event(&mut self, stage: Stage, _view: &EventView<'_>) -> waitcause::Result<()> {
        if self.armed && stage == self.stage {
            self.armed = false;
            return Err(ReplayError::Callback(format!("rejected in {stage}")));
        }
        Ok(())
    }
}

#[test]
fn test_callback_error_in_delay_pass_stops_job() {
    let mut s = Scenario::processes(2);
    s.region(1, WORK, 0.0, 2.0);
    s.barrier(0, 0.0, 3.0).barrier(1, 2.0, 3.0);
    let job = Job::new(s.bundle(4.0), AnalysisConfig::full()).unwrap();

    let err = job
        .run_with(|loc| FailInStage {
            stage: Stage::BackwardDelay,
            armed: loc.process == 0,
        })
        .unwrap_err();
    assert!(matches!(err, ReplayError::HealthCheck(_)), "{err}");
}

#[test]
fn test_callback_error_in_synchpoint_pass_stops_job() {
    let job = Job::new(barrier_job(), AnalysisConfig::full()).unwrap();

    let err = job
        .run_with(|loc| FailInStage {
            stage: Stage::ForwardSynchpoints,
            armed: loc.process == 2,
        })
        .unwrap_err();
    assert!(matches!(err, ReplayError::HealthCheck(_)), "{err}");
}

/// Rejects the accumulated state once every pass is done
#[derive(Debug)]
struct FailOnFinish;

impl AnalysisCallback for FailOnFinish {
    fn on_event(&mut self, _stage: Stage, _view: &EventView<'_>) -> waitcause::Result<()> {
        Ok(())
    }

    fn finish(&mut self, _view: &FinishView<'_>) -> waitcause::Result<()> {
        Err(ReplayError::Callback("rejected summary".to_string()))
    }
}

#[test]
fn test_finish_error_recorded_in_outputs() {
    let mut s = Scenario::processes(1);
    s.region(0, WORK, 0.0, 1.0);
    let job = Job::new(s.bundle(2.0), AnalysisConfig::basic()).unwrap();

    let outputs = job.run_with(|_| FailOnFinish).unwrap();
    assert_eq!(outputs[0].errors.len(), 1);
    assert!(outputs[0].errors[0].contains("rejected summary"));
}
