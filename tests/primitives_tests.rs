use std::slice;

use swmpi::config::CoordinatorConfig;
use swmpi::coordination::{primitives, Context};
use swmpi::environment::Launcher;
use swmpi::records::{DesignationRecord, RunInputs, VegEstabInfo};
use swmpi::registry::TypeKind;
use swmpi::request::PendingOperation;
use swmpi::traits::*;
use swmpi::FailureKind;

#[test]
fn second_operation_waits_for_the_first() {
    let outcome = Launcher::from_layout(&[("a", 2)]).run(|universe| {
        let world = universe.world();
        let datatype = i64::equivalent_datatype()?;
        if world.rank() == 0 {
            let first = [1i64, 2, 3];
            let second = [4i64, 5];
            let mut pending = PendingOperation::new();
            primitives::send(&world, &datatype, &first, 3, 1, false, 0, &mut pending)?;
            assert!(pending.is_pending());
            primitives::send(&world, &datatype, &second, 2, 1, false, 0, &mut pending)?;
            primitives::finalize(&world, &mut pending)?;
            assert!(!pending.is_pending());
            Ok(Vec::new())
        } else {
            let mut first = [0i64; 3];
            let mut second = [0i64; 4];
            let mut pending = PendingOperation::new();
            primitives::recv(&world, &datatype, &mut first, 3, 0, false, 0, &mut pending)?;
            primitives::recv(&world, &datatype, &mut second, 4, 0, false, 0, &mut pending)?;
            let status = primitives::finalize(&world, &mut pending)?;
            assert_eq!(status.map(|status| status.count()), Some(2));
            drop(pending);
            Ok(first.iter().chain(&second[..2]).copied().collect())
        }
    });
    let values = outcome.into_values().unwrap();
    assert_eq!(values[1], vec![1, 2, 3, 4, 5]);
}

#[test]
fn designation_record_crosses_unchanged() {
    let sent = DesignationRecord {
        proc_job: 1,
        n_comp_procs: 3,
        io_rank: -1,
        n_translated_sets: 2,
        n_suids: 1 << 40,
    };
    let outcome = Launcher::from_layout(&[("a", 2)]).run(|universe| {
        let ctx = Context::new(&universe, CoordinatorConfig::default())?;
        let datatype = ctx.datatype(TypeKind::Designate);
        let mut record = DesignationRecord::default();
        if ctx.is_root() {
            primitives::send(
                ctx.world(),
                datatype,
                slice::from_ref(&sent),
                1,
                1,
                true,
                7,
                &mut PendingOperation::new(),
            )?;
        } else {
            primitives::recv(
                ctx.world(),
                datatype,
                slice::from_mut(&mut record),
                1,
                0,
                true,
                7,
                &mut PendingOperation::new(),
            )?;
        }
        Ok(record)
    });
    assert_eq!(outcome.into_values().unwrap()[1], sent);
}

#[test]
fn nested_inputs_are_broadcast_field_for_field() {
    let mut template = RunInputs::default();
    template.sky.snow_density[11] = 0.3;
    template.sky.snow_density_daily[366] = 310.0;
    template.model.elevation = 1520.0;
    template.soil.swrcp_mineral_soil[24][5] = 7.5;
    template.veg_prod.veg[2].cover.f_cover = 0.4;
    template.veg_prod.veg[2].lai_conv[6] = 60.0;
    template.veg_prod.bare_cover.albedo = 0.15;
    template.site.t_soil_constant = 4.5;

    let outcome = Launcher::from_layout(&[("a", 2), ("b", 2)]).run(|universe| {
        let ctx = Context::new(&universe, CoordinatorConfig::default())?;
        let mut inputs = if ctx.is_root() {
            template
        } else {
            RunInputs::default()
        };
        primitives::bcast(
            ctx.datatype(TypeKind::Inputs),
            slice::from_mut(&mut inputs),
            1,
            0,
            ctx.world(),
        )?;
        Ok(inputs)
    });
    for inputs in outcome.into_values().unwrap() {
        assert_eq!(inputs, template);
    }
}

#[test]
fn establishment_records_are_broadcast() {
    let mut records = vec![VegEstabInfo::default(); 3];
    records[0].species_name = *b"bogr\0";
    records[1].veg_type = 3;

    let outcome = Launcher::from_layout(&[("a", 3)]).run(|universe| {
        let ctx = Context::new(&universe, CoordinatorConfig::default())?;
        let mut received = if ctx.is_root() {
            records.clone()
        } else {
            vec![VegEstabInfo::default(); 3]
        };
        primitives::bcast(ctx.datatype(TypeKind::VegEstabIn), &mut received, 3, 0, ctx.world())?;
        Ok(received)
    });
    for received in outcome.into_values().unwrap() {
        assert_eq!(received, records);
    }
}

#[test]
fn mismatched_wire_format_aborts_the_job() {
    let outcome = Launcher::from_layout(&[("a", 2)]).run(|universe| {
        let world = universe.world();
        if world.rank() == 0 {
            let values = [1i32, 2];
            let result = primitives::send(
                &world,
                &i32::equivalent_datatype()?,
                &values,
                2,
                1,
                true,
                0,
                &mut PendingOperation::new(),
            );
            result
        } else {
            let mut values = [0f64; 2];
            let result = primitives::recv(
                &world,
                &f64::equivalent_datatype()?,
                &mut values,
                2,
                0,
                true,
                0,
                &mut PendingOperation::new(),
            )
            .map(|_| ());
            result
        }
    });
    assert_eq!(outcome.failure(), Some(FailureKind::Transport));
}
