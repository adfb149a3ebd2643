//! Solves a 2-D Poisson problem for the potential of a pair of opposite
//! point charges, on a 2x2 arrangement of blocks, using the continuation-
//! driven conjugate-gradient solver.

use palisade::boundary::Boundary;
use palisade::field::{FieldDescr, Precision};
use palisade::hierarchy::Hierarchy;
use palisade::matrix::Matrix;
use palisade::scheduler::Scheduler;
use palisade::solver::{CgFields, GravityCg};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()?;

    let mut descr = FieldDescr::new();
    for name in ["B", "X", "R", "D", "Z", "Y"] {
        descr.insert(name, Precision::Double, (1, 1, 0));
    }
    let fields = CgFields { b: 0, x: 1, r: 2, d: 3, z: 4, y: 5 };

    let hierarchy = Hierarchy::unigrid(
        (2, 2, 1),
        (16, 16, 1),
        ((0.0, 0.0, 0.0), (1.0, 1.0, 1.0)));

    let mut scheduler = Scheduler::new(hierarchy, descr, Boundary::Zero, |_| {
        GravityCg::new(fields, Matrix::Diagonal, false, 1000, 1e-10).monitor_every(10)
    });

    // opposite point charges in the lower-left and upper-right blocks
    deposit(&mut scheduler, (0, 0, 0), (8, 8), 1.0);
    deposit(&mut scheduler, (1, 1, 0), (8, 8), -1.0);

    scheduler.run_par()?;

    let cg = scheduler.method((0, 0, 0)).unwrap();
    log::info!(
        "converged after {} iterations (rr/rr0 = {:.3e}, bracket [{:.3e}, {:.3e}])",
        cg.iter(),
        cg.residual_ratio(),
        cg.rr_min(),
        cg.rr_max());

    for index in [(0, 0, 0), (1, 1, 0)] {
        let block = scheduler.block(index).unwrap();
        let i = probe(block.size(), block.ghost_depth(fields.x), (8, 8));
        log::info!("{}: potential at charge = {:+.6e}", block.name(), block.field(fields.x).get(i));
    }
    Ok(())
}

fn deposit(
    scheduler: &mut Scheduler<GravityCg>,
    index: (i32, i32, i32),
    zone: (usize, usize),
    charge: f64,
) {
    let block = scheduler.block_mut(index).unwrap();
    let i = probe(block.size(), block.ghost_depth(0), zone);
    let (hx, hy, _) = (
        (block.upper().0 - block.lower().0) / block.size().0 as f64,
        (block.upper().1 - block.lower().1) / block.size().1 as f64,
        1.0,
    );
    block.field_mut(0).set(i, charge / (hx * hy));
}

fn probe(size: (usize, usize, usize), g: (usize, usize, usize), zone: (usize, usize)) -> usize {
    let mx = size.0 + 2 * g.0;
    let my = size.1 + 2 * g.1;
    (zone.0 + g.0) + mx * ((zone.1 + g.1) + my * g.2)
}
