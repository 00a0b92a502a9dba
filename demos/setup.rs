use swmpi::config::CoordinatorConfig;
use swmpi::coordination::{self, share, Context, WorkUnits};
use swmpi::environment::{self, Launcher};
use swmpi::records::{DomainConfig, SpinupConfig, Suid, WallTime};

fn main() {
    let config = match std::env::args().nth(1) {
        Some(path) => CoordinatorConfig::load(path).unwrap(),
        None => CoordinatorConfig::default(),
    };
    environment::init_tracing(&config.log_filter);

    let units = WorkUnits::new((0..40).map(|i| Suid::new(i / 8, i % 8)).collect());
    let launcher = Launcher::from_layout(&[("node-a", 6), ("node-b", 5), ("node-c", 2)]);

    let outcome = launcher.run(|universe| {
        let ctx = Context::new(&universe, config.clone())?;
        let setup = coordination::setup(&ctx, Some(&units))?;

        let mut domain = DomainConfig {
            start_year: 1980,
            end_year: 2020,
            ..DomainConfig::default()
        };
        let mut spinup = SpinupConfig::default();
        share::share_domain_info(&ctx, &mut domain, &mut spinup)?;

        let owned = setup.designation.as_io().map_or(0, |io| io.suids.len());
        println!(
            "rank {:2} on {}: {} ({} units), years {}-{}",
            ctx.rank(),
            ctx.node_name(),
            setup.designation.role(),
            owned,
            domain.start_year,
            domain.end_year
        );

        let timing = WallTime {
            time_mean: 0.5,
            time_min: 0.5,
            time_max: 0.5,
            n_timed_runs: 1,
            ..WallTime::default()
        };
        share::report_wall_time(&ctx, &timing)?;
        Ok(())
    });
    std::process::exit(outcome.exit_code);
}
