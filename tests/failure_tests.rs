use swmpi::collective::CommunicatorCollectives;
use swmpi::config::CoordinatorConfig;
use swmpi::coordination::{self, failure, share, Context, Phase, WorkUnits};
use swmpi::environment::{JobOutcome, Launcher};
use swmpi::records::{RunInputs, Suid, VegEstabInfo};
use swmpi::{Error, ErrorKind, FailureKind, Rank};

fn units(n: u64) -> WorkUnits {
    WorkUnits::new((0..n).map(|i| Suid::new(i, 0)).collect())
}

fn run_setup(layout: &[(&str, usize)], config: CoordinatorConfig) -> JobOutcome<()> {
    let units = units(16);
    Launcher::from_layout(layout).run(|universe| {
        let ctx = Context::new(&universe, config.clone())?;
        coordination::setup(&ctx, Some(&units)).map(|_| ())
    })
}

fn assert_stopped_in(outcome: &JobOutcome<()>, phase: Phase) {
    assert_eq!(outcome.failure(), Some(FailureKind::Setup));
    for result in &outcome.results {
        match result {
            Err(Error::SetupFailed { phase: failed, .. }) => assert_eq!(*failed, phase),
            other => panic!("expected a failed {} phase, got {:?}", phase, other),
        }
    }
}

fn local_cause(outcome: &JobOutcome<()>, rank: Rank) -> ErrorKind {
    match &outcome.results[rank as usize] {
        Err(err) => err.root_cause().kind(),
        Ok(()) => panic!("rank {} succeeded", rank),
    }
}

#[test]
fn io_rank_failing_to_store_units_stops_everyone() {
    // rank 5 is the second I/O rank of node b
    let config = CoordinatorConfig::default().with_allocation_failure(5, Phase::Handoff);
    let outcome = run_setup(&[("a", 4), ("b", 4)], config);
    assert_stopped_in(&outcome, Phase::Handoff);
    assert_eq!(local_cause(&outcome, 5), ErrorKind::ResourceExhaustion);
    assert_eq!(local_cause(&outcome, 0), ErrorKind::Aborted);
}

#[test]
fn compute_rank_failing_to_store_its_designation_stops_everyone() {
    // ranks 0 and 1 do I/O, 2 and 3 compute
    let config = CoordinatorConfig::default().with_allocation_failure(3, Phase::Designation);
    let outcome = run_setup(&[("a", 4)], config);
    assert_stopped_in(&outcome, Phase::Handoff);
    assert_eq!(outcome.exit_code, 4);
    assert_eq!(local_cause(&outcome, 3), ErrorKind::ResourceExhaustion);
    assert_eq!(local_cause(&outcome, 2), ErrorKind::Aborted);
}

#[test]
fn io_rank_failing_to_store_its_designation_drains_its_lists() {
    let config = CoordinatorConfig::default().with_allocation_failure(1, Phase::Designation);
    let outcome = run_setup(&[("a", 4), ("b", 2)], config);
    assert_stopped_in(&outcome, Phase::Handoff);
    assert_eq!(local_cause(&outcome, 1), ErrorKind::ResourceExhaustion);
    assert_eq!(local_cause(&outcome, 0), ErrorKind::Aborted);
}

#[test]
fn root_failing_to_record_topology_drains_names() {
    let config = CoordinatorConfig::default().with_allocation_failure(0, Phase::Topology);
    let outcome = run_setup(&[("a", 3), ("b", 3)], config);
    assert_stopped_in(&outcome, Phase::Topology);
    assert_eq!(local_cause(&outcome, 0), ErrorKind::ResourceExhaustion);
}

#[test]
fn compute_rank_failing_to_store_its_group_stops_everyone() {
    let config = CoordinatorConfig::default().with_allocation_failure(3, Phase::Groups);
    let outcome = run_setup(&[("a", 4), ("b", 2)], config);
    assert_stopped_in(&outcome, Phase::Groups);
    assert_eq!(local_cause(&outcome, 3), ErrorKind::ResourceExhaustion);
}

#[test]
fn invalid_configuration_stops_before_discovery() {
    let outcome = run_setup(&[("a", 2), ("b", 2)], CoordinatorConfig::default().with_io_target(0));
    assert_stopped_in(&outcome, Phase::Registry);
    assert_eq!(local_cause(&outcome, 2), ErrorKind::Configuration);
}

#[test]
fn compute_rank_failing_to_store_records_drains_the_broadcast() {
    let units = units(8);
    let config = CoordinatorConfig::default().with_allocation_failure(2, Phase::Sharing);
    let outcome = Launcher::from_layout(&[("a", 4)]).run(|universe| {
        let ctx = Context::new(&universe, config.clone())?;
        let setup = coordination::setup(&ctx, Some(&units))?;
        let mut inputs = RunInputs::default();
        let mut estab = if ctx.is_root() {
            vec![VegEstabInfo::default(); 4]
        } else {
            Vec::new()
        };
        share::share_template(&ctx, &setup.groups, &mut inputs, &mut estab)?;
        // I/O ranks outside the compute group wait for the others here
        ctx.world().barrier()?;
        Ok(())
    });
    assert_eq!(outcome.failure(), Some(FailureKind::Setup));
    for rank in [0, 2, 3] {
        assert!(matches!(
            outcome.results[rank],
            Err(Error::SetupFailed {
                phase: Phase::Sharing,
                ..
            })
        ));
    }
    // rank 1 serves I/O only and sees the abort
    assert!(matches!(outcome.results[1], Err(Error::Aborted { code: 4 })));
}

#[test]
fn fail_aborts_with_its_reason() {
    let outcome = Launcher::from_layout(&[("a", 3)]).run(|universe| {
        let ctx = Context::new(&universe, CoordinatorConfig::default())?;
        if ctx.rank() == 1 {
            return Err(failure::fail(&ctx, FailureKind::NetCdf, "cannot open input file"));
        }
        ctx.world().barrier()
    });
    assert_eq!(outcome.failure(), Some(FailureKind::NetCdf));
    for result in &outcome.results {
        assert!(matches!(result, Err(Error::Aborted { code: 1 })));
    }
}
