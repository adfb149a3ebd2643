use crate::block::Block;
use crate::error::Error;
use crate::scheduler::Context;
use core::fmt;

/// A numerical method driven by the scheduler, one instance per block.
/// Handlers run to completion and never block: to wait for ghost data or a
/// global scalar, a handler registers a continuation through the [`Context`]
/// and returns. The scheduler resumes the method on the same block when the
/// awaited event completes. Global reduction results arrive identically at
/// every block, so per-block instances of one method advance in lockstep.
///
pub trait Method: Send {
    /// The continuation type: a tag naming where the method resumes after
    /// an exchange or reduction completes. Typically a small enum of
    /// next-states.
    type Continuation: Copy + PartialEq + fmt::Debug + Send + Sync;

    /// Invoked once per block at the start of a simulation cycle.
    fn compute_step(
        &mut self,
        block: &mut Block,
        ctx: &mut Context<Self::Continuation>,
    ) -> Result<(), Error>;

    /// Invoked exactly once when a ghost exchange this method started on
    /// this block has completed.
    fn exchange_complete(
        &mut self,
        block: &mut Block,
        cont: Self::Continuation,
        ctx: &mut Context<Self::Continuation>,
    ) -> Result<(), Error>;

    /// Invoked exactly once per block when a reduction episode completes,
    /// with the global aggregate.
    fn reduction_complete(
        &mut self,
        block: &mut Block,
        cont: Self::Continuation,
        aggregate: &[f64],
        ctx: &mut Context<Self::Continuation>,
    ) -> Result<(), Error>;

    /// The largest stable timestep this method allows on the given block.
    /// The scheduler takes the minimum over all blocks when a cycle ends.
    fn timestep(&self, _block: &Block) -> f64 {
        f64::INFINITY
    }
}
