//! Run with an MPI launcher, e.g. `mpirun -n 6 target/debug/examples/mpirun`
use swmpi::config::CoordinatorConfig;
use swmpi::coordination::{self, Context, WorkUnits};
use swmpi::environment;
use swmpi::records::Suid;

fn main() {
    environment::init_tracing("info");
    let universe = environment::initialize().unwrap();

    let units = WorkUnits::new((0..24).map(|i| Suid::new(i / 6, i % 6)).collect());
    let result = Context::new(&universe, CoordinatorConfig::default())
        .and_then(|ctx| coordination::setup(&ctx, Some(&units)));

    match universe.finish(result) {
        Ok(setup) => println!(
            "rank {} on {}: {}",
            universe.rank(),
            universe.processor_name(),
            setup.designation.role()
        ),
        Err(err) => {
            eprintln!("rank {}: {}", universe.rank(), err);
            std::process::exit(err.failure_kind().code());
        }
    }
}
