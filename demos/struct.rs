use swmpi::environment::Launcher;
use swmpi::traits::*;

#[derive(Equivalence, Default, Clone, Copy, PartialEq, Debug)]
#[repr(C)]
struct Layer {
    depth: f64,
    sand: f32,
    clay: f32,
}

#[derive(Equivalence, Default, Clone, Copy, PartialEq, Debug)]
#[repr(C)]
struct Profile {
    site: u32,
    layers: [Layer; 3],
    is_irrigated: u8,
}

fn main() {
    let sent = Profile {
        site: 17,
        layers: [
            Layer {
                depth: 10.0,
                sand: 0.5,
                clay: 0.2,
            },
            Layer {
                depth: 30.0,
                sand: 0.45,
                clay: 0.25,
            },
            Layer {
                depth: 60.0,
                sand: 0.4,
                clay: 0.3,
            },
        ],
        is_irrigated: 1,
    };

    let outcome = Launcher::from_layout(&[("node", 4)]).run(|universe| {
        let world = universe.world();
        let mut profile = if world.rank() == 0 {
            sent
        } else {
            Profile::default()
        };
        world.root_process().broadcast_into(std::slice::from_mut(&mut profile))?;
        Ok(profile)
    });

    for profile in outcome.into_values().unwrap() {
        assert_eq!(profile, sent);
    }
    let datatype = Profile::equivalent_datatype().unwrap();
    println!(
        "{} bytes per profile in memory, {} on the wire",
        datatype.extent(),
        datatype.packed_size()
    );
}
