use swmpi::config::CoordinatorConfig;
use swmpi::coordination::{self, Context, Phase, WorkUnits};
use swmpi::environment::{self, Launcher};
use swmpi::records::Suid;

/// One I/O rank cannot store its work units. The failure check stops the
/// handoff on every rank and the job exits with the setup failure code.
fn main() {
    environment::init_tracing("swmpi=debug");

    let config = CoordinatorConfig::default().with_allocation_failure(1, Phase::Handoff);
    let units = WorkUnits::new((0..12).map(|i| Suid::new(i, 0)).collect());

    let outcome = Launcher::from_layout(&[("node-a", 4), ("node-b", 4)]).run(|universe| {
        let ctx = Context::new(&universe, config.clone())?;
        coordination::setup(&ctx, Some(&units)).map(|_| ())
    });

    for (rank, result) in outcome.results.iter().enumerate() {
        match result {
            Ok(()) => println!("rank {}: ok", rank),
            Err(err) => println!("rank {}: {}", rank, err.root_cause()),
        }
    }
    assert_eq!(outcome.exit_code, swmpi::FailureKind::Setup.code());
    std::process::exit(outcome.exit_code);
}
