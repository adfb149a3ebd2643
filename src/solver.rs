use crate::block::Block;
use crate::error::{check, Error};
use crate::field::{FieldDescr, FieldId};
use crate::matrix::Matrix;
use crate::method::Method;
use crate::reduction::Reducer;
use crate::refresh::{RefreshSpec, SyncMode};
use crate::scheduler::Context;
use log::info;

/// Where the conjugate-gradient method resumes after each exchange or
/// reduction. One iteration of the loop is a chain of four: a ghost
/// refresh of the search direction, two dot-product round trips, and the
/// max-reduction that keeps every block's iteration counter in agreement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CgResume {
    /// Initial moments: residual norm, right-hand-side sum, zone count.
    InitMoments,
    /// Residual norm recomputed after the singular-system shift.
    ShiftDots,
    /// Ghosts of the search direction are fresh; apply the operator.
    MatvecGhosts,
    /// The scalars that fix the step length: r.z and d.A(d).
    Alpha,
    /// Post-update scalars: the new residual norm, r.z, and the sums that
    /// drive the per-iteration re-centering of singular systems.
    UpdateDots,
    /// Agreed iteration counter (max over per-block candidates).
    IterCount,
}

/// The six vectors CG works on, as registered field ids: the right-hand
/// side `b`, the solution `x`, the residual `r`, the search direction `d`,
/// the preconditioned residual `z`, and the operator image `y = A(d)`. All
/// six share the block's interior shape; `d` must carry ghost storage on
/// every axis the operator acts along.
#[derive(Clone, Copy, Debug)]
pub struct CgFields {
    pub b: FieldId,
    pub x: FieldId,
    pub r: FieldId,
    pub d: FieldId,
    pub z: FieldId,
    pub y: FieldId,
}

/// Preconditioned conjugate gradient over the block array, solving the
/// discrete Poisson problem A(x) = b with A the Laplace stencil. Each
/// block runs one instance; global dot products travel as sum reductions,
/// the search direction's ghosts are refreshed (barrier mode) before every
/// operator application, and the iteration counter is agreed on by a max
/// reduction over all blocks, so every instance walks the same iteration
/// in lockstep whether or not it holds live data.
///
/// With `singular` set (pure-Neumann boundaries, where A annihilates
/// constants), the right-hand side is shifted to zero mean before the
/// first iteration and the solution and residual are re-centered every
/// iteration, keeping the iterates orthogonal to the null space.
pub struct GravityCg {
    fields: CgFields,
    precond: Matrix,
    singular: bool,
    iter_max: u64,
    res_tol: f64,
    monitor_iter: u64,
    rhs: Option<(FieldId, f64)>,

    iter: u64,
    count: f64,
    rr0: f64,
    rr: f64,
    rr_min: f64,
    rr_max: f64,
    rz: f64,
}

impl GravityCg {
    pub fn new(fields: CgFields, precond: Matrix, singular: bool, iter_max: u64, res_tol: f64) -> Self {
        Self {
            fields,
            precond,
            singular,
            iter_max,
            res_tol,
            monitor_iter: 10,
            rhs: None,
            iter: 0,
            count: 0.0,
            rr0: 0.0,
            rr: 0.0,
            rr_min: f64::INFINITY,
            rr_max: f64::NEG_INFINITY,
            rz: 0.0,
        }
    }

    /// Assemble the right-hand side from a source field at the start of
    /// each solve: b = coefficient * source (e.g. -4 pi G times the
    /// density). Without this, `b` is taken as already assembled.
    pub fn with_rhs(mut self, source: FieldId, coefficient: f64) -> Self {
        self.rhs = Some((source, coefficient));
        self
    }

    /// Log the residual every `n` iterations (root block only).
    pub fn monitor_every(mut self, n: u64) -> Self {
        self.monitor_iter = n.max(1);
        self
    }

    pub fn iter(&self) -> u64 {
        self.iter
    }

    pub fn rr0(&self) -> f64 {
        self.rr0
    }

    pub fn rr_min(&self) -> f64 {
        self.rr_min
    }

    pub fn rr_max(&self) -> f64 {
        self.rr_max
    }

    pub fn residual_ratio(&self) -> f64 {
        self.rr / self.rr0
    }

    fn ghost_refresh(&self, descr: &FieldDescr) -> RefreshSpec {
        let mut spec = RefreshSpec::new(descr.ghost_depth(self.fields.d), SyncMode::Barrier);
        spec.add_all_fields(descr);
        spec
    }

    /// x = 0, r = b, z = precond(r), d = z.
    fn setup_vectors(&self, block: &mut Block, width: (f64, f64, f64)) -> Result<(), Error> {
        let f = self.fields;
        fill(block, f.x, 0.0);
        assign(block, f.r, f.b);
        self.precond.matvec(f.z, f.r, block, width)?;
        assign(block, f.d, f.z);
        Ok(())
    }

    fn finish_init(&mut self, rr: f64, block: &mut Block, ctx: &mut Context<CgResume>) -> Result<(), Error> {
        self.rr0 = rr;
        self.rr = rr;
        self.rr_min = rr;
        self.rr_max = rr;
        if rr == 0.0 {
            // b was identically zero; x = 0 is the answer
            ctx.done();
            return Ok(());
        }
        self.loop_head(block, ctx)
    }

    /// Top of the iteration loop: monitor, test convergence against the
    /// freshest residual, enforce the iteration cap, then refresh the
    /// search direction's ghost zones for the next operator application.
    fn loop_head(&mut self, block: &mut Block, ctx: &mut Context<CgResume>) -> Result<(), Error> {
        if self.iter % self.monitor_iter == 0 {
            self.monitor(block)
        }
        if self.rr / self.rr0 < self.res_tol {
            self.monitor(block);
            ctx.done();
            return Ok(());
        }
        if self.iter >= self.iter_max {
            return Err(Error::MaxIterExceeded {
                iter: self.iter,
                residual_ratio: self.rr / self.rr0,
            });
        }
        let spec = self.ghost_refresh(ctx.descr());
        ctx.start_refresh(block, &spec, CgResume::MatvecGhosts)
    }

    fn monitor(&self, block: &Block) {
        if block.index() == (0, 0, 0) && self.rr0 > 0.0 {
            info!(
                "cg iter {:04}  rr {:.6e}  rr/rr0 {:.6e}",
                self.iter,
                self.rr,
                self.rr / self.rr0);
        }
    }
}

impl Method for GravityCg {
    type Continuation = CgResume;

    fn compute_step(&mut self, block: &mut Block, ctx: &mut Context<CgResume>) -> Result<(), Error> {
        self.iter = 0;
        self.count = 0.0;
        self.rr0 = 0.0;
        self.rr = 0.0;
        self.rr_min = f64::INFINITY;
        self.rr_max = f64::NEG_INFINITY;
        self.rz = 0.0;

        let f = self.fields;
        if let Some((source, coefficient)) = self.rhs {
            scaled_assign(block, f.b, coefficient, source)
        }
        let width = ctx.cell_width(block);
        self.setup_vectors(block, width)?;

        let values = if ctx.is_leaf(block) {
            [dot(block, f.r, f.r), sum(block, f.b), count(block, f.b)]
        } else {
            [0.0, 0.0, 0.0]
        };
        ctx.contribute(block, &values, Reducer::Sum, CgResume::InitMoments)
    }

    fn exchange_complete(
        &mut self,
        block: &mut Block,
        cont: CgResume,
        ctx: &mut Context<CgResume>,
    ) -> Result<(), Error> {
        match cont {
            CgResume::MatvecGhosts => {
                let f = self.fields;
                let width = ctx.cell_width(block);
                Matrix::Laplace.matvec(f.y, f.d, block, width)?;
                let values = if ctx.is_leaf(block) {
                    [dot(block, f.r, f.z), dot(block, f.d, f.y)]
                } else {
                    [0.0, 0.0]
                };
                ctx.contribute(block, &values, Reducer::Sum, CgResume::Alpha)
            }
            other => Err(Error::protocol(
                block.index(),
                0,
                format!("cg resumed from an exchange with continuation {:?}", other))),
        }
    }

    fn reduction_complete(
        &mut self,
        block: &mut Block,
        cont: CgResume,
        aggregate: &[f64],
        ctx: &mut Context<CgResume>,
    ) -> Result<(), Error> {
        let f = self.fields;
        match cont {
            CgResume::InitMoments => {
                let rr = check(aggregate[0], "rr")?;
                let bs = check(aggregate[1], "bs")?;
                self.count = aggregate[2];

                if self.singular && self.count > 0.0 {
                    let delta = -bs / self.count;
                    shift(block, f.b, delta);
                    shift(block, f.r, delta);
                    let width = ctx.cell_width(block);
                    self.precond.matvec(f.z, f.r, block, width)?;
                    assign(block, f.d, f.z);

                    let values = if ctx.is_leaf(block) {
                        [dot(block, f.r, f.r)]
                    } else {
                        [0.0]
                    };
                    ctx.contribute(block, &values, Reducer::Sum, CgResume::ShiftDots)
                } else {
                    self.finish_init(rr, block, ctx)
                }
            }
            CgResume::ShiftDots => {
                let rr = check(aggregate[0], "rr")?;
                self.finish_init(rr, block, ctx)
            }
            CgResume::Alpha => {
                self.rz = check(aggregate[0], "rz")?;
                let dy = check(aggregate[1], "dy")?;
                let alpha = check(self.rz / dy, "alpha")?;
                axpy(block, f.x, alpha, f.d);
                axpy(block, f.r, -alpha, f.y);
                let width = ctx.cell_width(block);
                self.precond.matvec(f.z, f.r, block, width)?;

                let values = if ctx.is_leaf(block) {
                    [
                        dot(block, f.r, f.r),
                        dot(block, f.r, f.z),
                        sum(block, f.r),
                        sum(block, f.x),
                    ]
                } else {
                    [0.0, 0.0, 0.0, 0.0]
                };
                ctx.contribute(block, &values, Reducer::Sum, CgResume::UpdateDots)
            }
            CgResume::UpdateDots => {
                self.rr = check(aggregate[0], "rr")?;
                let rz2 = check(aggregate[1], "rz")?;
                let rs = check(aggregate[2], "rs")?;
                let xs = check(aggregate[3], "xs")?;

                if self.singular && self.count > 0.0 {
                    shift(block, f.x, -xs / self.count);
                    shift(block, f.r, -rs / self.count);
                }
                let beta = check(rz2 / self.rz, "beta")?;
                xpay(block, f.d, beta, f.z);

                // all blocks, leaf or not, advance the agreed counter
                ctx.contribute(block, &[(self.iter + 1) as f64], Reducer::Max, CgResume::IterCount)
            }
            CgResume::IterCount => {
                self.iter = check(aggregate[0], "iter")? as u64;
                self.rr_min = self.rr_min.min(self.rr);
                self.rr_max = self.rr_max.max(self.rr);
                self.loop_head(block, ctx)
            }
            other => Err(Error::protocol(
                block.index(),
                0,
                format!("cg resumed from a reduction with continuation {:?}", other))),
        }
    }
}

// ----------------------------------------------------------------------------
// Local vector kernels. All touch interior zones only and accumulate in f64
// regardless of the field precision.

fn dot(block: &Block, a: FieldId, b: FieldId) -> f64 {
    let sa = block.interior_slab(a);
    let sb = block.interior_slab(b);
    sa.offsets()
        .zip(sb.offsets())
        .map(|(i, j)| block.field(a).get(i) * block.field(b).get(j))
        .sum()
}

fn sum(block: &Block, a: FieldId) -> f64 {
    let slab = block.interior_slab(a);
    slab.offsets().map(|i| block.field(a).get(i)).sum()
}

fn count(block: &Block, a: FieldId) -> f64 {
    block.interior_slab(a).len() as f64
}

fn fill(block: &mut Block, a: FieldId, value: f64) {
    for i in 0..block.field(a).len() {
        block.field_mut(a).set(i, value)
    }
}

fn shift(block: &mut Block, a: FieldId, delta: f64) {
    let slab = block.interior_slab(a);
    for i in slab.offsets() {
        let v = block.field(a).get(i) + delta;
        block.field_mut(a).set(i, v);
    }
}

/// dst = src over the interior.
fn assign(block: &mut Block, dst: FieldId, src: FieldId) {
    let sd = block.interior_slab(dst);
    let ss = block.interior_slab(src);
    for (i, j) in sd.offsets().zip(ss.offsets()) {
        let v = block.field(src).get(j);
        block.field_mut(dst).set(i, v);
    }
}

/// dst = coefficient * src over the interior.
fn scaled_assign(block: &mut Block, dst: FieldId, coefficient: f64, src: FieldId) {
    let sd = block.interior_slab(dst);
    let ss = block.interior_slab(src);
    for (i, j) in sd.offsets().zip(ss.offsets()) {
        let v = coefficient * block.field(src).get(j);
        block.field_mut(dst).set(i, v);
    }
}

/// y = y + alpha x over the interior.
fn axpy(block: &mut Block, y: FieldId, alpha: f64, x: FieldId) {
    let sy = block.interior_slab(y);
    let sx = block.interior_slab(x);
    for (i, j) in sy.offsets().zip(sx.offsets()) {
        let v = block.field(y).get(i) + alpha * block.field(x).get(j);
        block.field_mut(y).set(i, v);
    }
}

/// d = z + beta d over the interior.
fn xpay(block: &mut Block, d: FieldId, beta: f64, z: FieldId) {
    let sd = block.interior_slab(d);
    let sz = block.interior_slab(z);
    for (i, j) in sd.offsets().zip(sz.offsets()) {
        let v = block.field(z).get(j) + beta * block.field(d).get(i);
        block.field_mut(d).set(i, v);
    }
}

// ============================================================================
#[cfg(test)]
mod test {

    use super::*;
    use crate::boundary::Boundary;
    use crate::field::Precision;
    use crate::hierarchy::Hierarchy;
    use crate::scheduler::Scheduler;

    fn descr() -> FieldDescr {
        let mut descr = FieldDescr::new();
        for name in ["B", "X", "R", "D", "Z", "Y"] {
            descr.insert(name, Precision::Double, (1, 0, 0));
        }
        descr
    }

    fn fields() -> CgFields {
        CgFields { b: 0, x: 1, r: 2, d: 3, z: 4, y: 5 }
    }

    /// The 1-D Laplace stencil with zero Dirichlet ghosts, applied to a
    /// whole-domain vector. Used to manufacture right-hand sides with a
    /// known solution.
    fn laplace_1d(x: &[f64], h: f64) -> Vec<f64> {
        let n = x.len();
        (0..n)
            .map(|i| {
                let left = if i == 0 { 0.0 } else { x[i - 1] };
                let right = if i + 1 == n { 0.0 } else { x[i + 1] };
                (left + right - 2.0 * x[i]) / (h * h)
            })
            .collect()
    }

    /// Serial preconditioned CG on the same 1-D problem, with the same
    /// update ordering and convergence rule as the distributed flow, as an
    /// iteration-count oracle.
    fn reference_pcg(rhs: &[f64], h: f64, res_tol: f64, iter_max: u64) -> (Vec<f64>, u64) {
        let n = rhs.len();
        let dot = |a: &[f64], b: &[f64]| a.iter().zip(b).map(|(p, q)| p * q).sum::<f64>();
        let minv = -h * h / 2.0;

        let mut x = vec![0.0; n];
        let mut r = rhs.to_vec();
        let mut z: Vec<f64> = r.iter().map(|v| v * minv).collect();
        let mut d = z.clone();
        let rr0 = dot(&r, &r);
        let mut rr = rr0;
        let mut iter = 0;

        while rr / rr0 >= res_tol && iter < iter_max {
            let y = laplace_1d(&d, h);
            let rz = dot(&r, &z);
            let dy = dot(&d, &y);
            let alpha = rz / dy;
            for i in 0..n {
                x[i] += alpha * d[i];
                r[i] -= alpha * y[i];
                z[i] = r[i] * minv;
            }
            let rz2 = dot(&r, &z);
            rr = dot(&r, &r);
            let beta = rz2 / rz;
            for i in 0..n {
                d[i] = z[i] + beta * d[i]
            }
            iter += 1;
        }
        (x, iter)
    }

    fn load(scheduler: &mut Scheduler<GravityCg>, index: (i32, i32, i32), id: FieldId, values: &[f64]) {
        let block = scheduler.block_mut(index).unwrap();
        let offsets: Vec<usize> = block.interior_slab(id).offsets().collect();
        assert_eq!(offsets.len(), values.len());
        for (i, v) in offsets.into_iter().zip(values) {
            block.field_mut(id).set(i, *v)
        }
    }

    fn solution(scheduler: &Scheduler<GravityCg>, index: (i32, i32, i32)) -> Vec<f64> {
        let block = scheduler.block(index).unwrap();
        block
            .interior_slab(1)
            .offsets()
            .map(|i| block.field(1).get(i))
            .collect()
    }

    #[test]
    fn single_block_poisson_matches_the_serial_oracle() {
        let truth = vec![0.1, -0.2, 0.3, 0.05];
        let h = 0.25;
        let rhs = laplace_1d(&truth, h);
        let (x_ref, iter_ref) = reference_pcg(&rhs, h, 1e-12, 20);

        let hierarchy = Hierarchy::unigrid((1, 1, 1), (4, 1, 1), ((0.0, 0.0, 0.0), (1.0, 1.0, 1.0)));
        let mut scheduler = Scheduler::new(hierarchy, descr(), Boundary::Zero, |_| {
            GravityCg::new(fields(), Matrix::Diagonal, false, 20, 1e-12)
        });
        load(&mut scheduler, (0, 0, 0), 0, &rhs);

        scheduler.run().unwrap();

        let x = solution(&scheduler, (0, 0, 0));
        for ((a, b), c) in x.iter().zip(&truth).zip(&x_ref) {
            assert!((a - b).abs() < 1e-8, "{} vs truth {}", a, b);
            assert!((a - c).abs() < 1e-10, "{} vs oracle {}", a, c);
        }

        let cg = scheduler.method((0, 0, 0)).unwrap();
        assert!((cg.iter() as i64 - iter_ref as i64).abs() <= 1);
        assert!(cg.residual_ratio() < 1e-12);
        assert!(cg.rr_min() <= cg.rr_max());
        assert!(cg.rr_min() <= cg.rr0());
    }

    #[test]
    fn two_block_poisson_agrees_across_the_interface() {
        let truth: Vec<f64> = (0..8).map(|i| ((i as f64) * 0.7).sin()).collect();
        let h = 1.0 / 8.0;
        let rhs = laplace_1d(&truth, h);

        let hierarchy = Hierarchy::unigrid((2, 1, 1), (4, 1, 1), ((0.0, 0.0, 0.0), (1.0, 1.0, 1.0)));
        let mut scheduler = Scheduler::new(hierarchy, descr(), Boundary::Zero, |_| {
            GravityCg::new(fields(), Matrix::Diagonal, false, 50, 1e-12)
        });
        load(&mut scheduler, (0, 0, 0), 0, &rhs[..4]);
        load(&mut scheduler, (1, 0, 0), 0, &rhs[4..]);

        scheduler.run().unwrap();

        let x: Vec<f64> = solution(&scheduler, (0, 0, 0))
            .into_iter()
            .chain(solution(&scheduler, (1, 0, 0)))
            .collect();
        for (a, b) in x.iter().zip(&truth) {
            assert!((a - b).abs() < 1e-7, "{} vs {}", a, b);
        }

        // the per-block instances walked the same iteration count
        let a = scheduler.method((0, 0, 0)).unwrap();
        let b = scheduler.method((1, 0, 0)).unwrap();
        assert_eq!(a.iter(), b.iter());
    }

    #[test]
    fn rhs_is_assembled_from_the_source_field() {
        let truth = vec![0.1, -0.2, 0.3, 0.05];
        let h = 0.25;
        let rhs = laplace_1d(&truth, h);
        let density: Vec<f64> = rhs.iter().map(|v| -v).collect();

        let mut descr = descr();
        let rho = descr.insert("density", Precision::Double, (1, 0, 0));

        let hierarchy = Hierarchy::unigrid((1, 1, 1), (4, 1, 1), ((0.0, 0.0, 0.0), (1.0, 1.0, 1.0)));
        let mut scheduler = Scheduler::new(hierarchy, descr, Boundary::Zero, move |_| {
            GravityCg::new(fields(), Matrix::Diagonal, false, 20, 1e-12).with_rhs(rho, -1.0)
        });
        load(&mut scheduler, (0, 0, 0), rho, &density);

        scheduler.run().unwrap();

        let x = solution(&scheduler, (0, 0, 0));
        for (a, b) in x.iter().zip(&truth) {
            assert!((a - b).abs() < 1e-8, "{} vs {}", a, b);
        }
    }

    #[test]
    fn singular_system_is_shifted_to_zero_mean() {
        let rhs: Vec<f64> = (1..=8).map(|i| i as f64).collect();

        let hierarchy = Hierarchy::unigrid((2, 1, 1), (4, 1, 1), ((0.0, 0.0, 0.0), (1.0, 1.0, 1.0)));
        let mut scheduler = Scheduler::new(hierarchy, descr(), Boundary::Outflow, |_| {
            GravityCg::new(fields(), Matrix::Diagonal, true, 50, 1e-10)
        });
        load(&mut scheduler, (0, 0, 0), 0, &rhs[..4]);
        load(&mut scheduler, (1, 0, 0), 0, &rhs[4..]);

        scheduler.run().unwrap();

        let total: f64 = [(0, 0, 0), (1, 0, 0)]
            .iter()
            .map(|&i| sum(scheduler.block(i).unwrap(), 0))
            .sum();
        assert!(total.abs() < 1e-9, "rhs mean not removed: {}", total);

        let cg = scheduler.method((0, 0, 0)).unwrap();
        assert!(cg.residual_ratio() < 1e-10);
    }

    #[test]
    fn zero_rhs_converges_immediately() {
        let hierarchy = Hierarchy::unigrid((1, 1, 1), (4, 1, 1), ((0.0, 0.0, 0.0), (1.0, 1.0, 1.0)));
        let mut scheduler = Scheduler::new(hierarchy, descr(), Boundary::Zero, |_| {
            GravityCg::new(fields(), Matrix::Identity, false, 10, 1e-10)
        });
        scheduler.run().unwrap();
        assert_eq!(scheduler.method((0, 0, 0)).unwrap().iter(), 0);
    }

    #[test]
    fn iteration_cap_is_reported_to_the_caller() {
        let truth = vec![0.1, -0.2, 0.3, 0.05];
        let rhs = laplace_1d(&truth, 0.25);

        let hierarchy = Hierarchy::unigrid((1, 1, 1), (4, 1, 1), ((0.0, 0.0, 0.0), (1.0, 1.0, 1.0)));
        let mut scheduler = Scheduler::new(hierarchy, descr(), Boundary::Zero, |_| {
            GravityCg::new(fields(), Matrix::Diagonal, false, 1, 1e-30)
        });
        load(&mut scheduler, (0, 0, 0), 0, &rhs);

        match scheduler.run() {
            Err(Error::MaxIterExceeded { iter, .. }) => assert_eq!(iter, 1),
            other => panic!("expected an iteration-cap error, got {:?}", other.map(|_| ())),
        }
    }
}
