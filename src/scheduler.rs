//! The in-process replacement for a migratable actor array: an arena of
//! blocks addressed by stable spatial index, a FIFO signal queue delivering
//! face buffers and reduction traffic, and the episode bookkeeping that
//! fires continuations exactly once. Handlers run to completion and never
//! block; everything asynchronous goes through the queue.

use crate::block::{Block, BlockIndex};
use crate::boundary::Boundary;
use crate::error::Error;
use crate::face::Face;
use crate::field::FieldDescr;
use crate::hierarchy::Hierarchy;
use crate::method::Method;
use crate::reduction::{PendingReduction, Reducer};
use crate::refresh::{RefreshSpec, SyncMode};
use log::debug;
use std::collections::HashMap;

/// Traffic on the scheduler's queue. The queue is FIFO, which the barrier
/// discipline leans on: a block's face buffers are always enqueued before
/// its epoch-started signal, so the sync token (enqueued after the last
/// arrival) can never overtake data.
pub enum Signal<C> {
    /// One packed ghost buffer, addressed to a block. The face is the
    /// relation as seen from the receiver's side.
    FaceData {
        epoch: u64,
        to: BlockIndex,
        face: Face,
        bytes: Vec<u8>,
    },
    /// A block entered an exchange epoch. Doubles as the barrier arrival
    /// and as the completion probe for blocks with no expected arrivals.
    EpochStarted {
        from: BlockIndex,
        epoch: u64,
        barrier: bool,
    },
    /// Global synchronization token of a barrier-mode epoch, broadcast once
    /// every block has entered the epoch.
    SyncToken { epoch: u64 },
    /// One block's partial value for a reduction episode.
    Contribute {
        from: BlockIndex,
        episode: u64,
        values: Vec<f64>,
        reducer: Reducer,
        cont: C,
    },
}

/// What a handler invocation is resuming from.
#[derive(Clone)]
enum Event<C> {
    Step,
    Exchange(C),
    Reduction(C, Vec<f64>),
}

/// The narrow interface a method sees while one of its handlers runs: the
/// topology and field registry, and the operations that register
/// continuations. Handlers communicate only through here; they cannot
/// reach other blocks.
pub struct Context<'a, C> {
    hierarchy: &'a Hierarchy,
    descr: &'a FieldDescr,
    boundary: Boundary,
    outbox: &'a mut Vec<Signal<C>>,
    exchange_cont: &'a mut Option<C>,
    done: &'a mut bool,
}

impl<'a, C: Copy + PartialEq + std::fmt::Debug> Context<'a, C> {
    pub fn hierarchy(&self) -> &Hierarchy {
        self.hierarchy
    }

    pub fn descr(&self) -> &FieldDescr {
        self.descr
    }

    pub fn is_leaf(&self, block: &Block) -> bool {
        self.hierarchy.is_leaf(block.index())
    }

    pub fn cell_width(&self, block: &Block) -> (f64, f64, f64) {
        self.hierarchy.cell_width(block.index())
    }

    /// Begin a ghost exchange episode on this block. Returns immediately;
    /// `cont` names where the method resumes once the episode completes.
    /// Interior relations are packed and sent through the queue; relations
    /// crossing the domain boundary are handed to the boundary-condition
    /// collaborator on the spot.
    pub fn start_refresh(
        &mut self,
        block: &mut Block,
        spec: &RefreshSpec,
        cont: C,
    ) -> Result<(), Error> {
        spec.validate(self.descr, self.hierarchy)?;

        if self.exchange_cont.is_some() {
            return Err(Error::protocol(
                block.index(),
                0,
                format!("{} started a refresh with a continuation pending", block.name())));
        }

        let depth = spec.ghost_depth();
        let interior: Vec<(Face, BlockIndex)> = self
            .hierarchy
            .relations(block.index())
            .filter(|(face, _)| Block::facet_carries_data(face.facet(), depth))
            .cloned()
            .collect();

        let epoch = block.start_refresh(spec, interior.len())?;

        for (face, dest) in &interior {
            let bytes = block.pack_face(spec, face.facet());
            self.outbox.push(Signal::FaceData {
                epoch,
                to: *dest,
                face: face.opposite(),
                bytes,
            });
        }

        // domain-boundary relations: every facet that carries data but has
        // no interior neighbor
        for fx in -1..=1 {
            for fy in -1..=1 {
                for fz in -1..=1 {
                    let facet = (fx, fy, fz);
                    if facet == (0, 0, 0) || !Block::facet_carries_data(facet, depth) {
                        continue;
                    }
                    if interior.iter().any(|(face, _)| face.facet() == facet) {
                        continue;
                    }
                    self.boundary.fill(block, spec, facet)
                }
            }
        }

        block.sends_posted();
        *self.exchange_cont = Some(cont);
        self.outbox.push(Signal::EpochStarted {
            from: block.index(),
            epoch,
            barrier: matches!(spec.sync(), SyncMode::Barrier),
        });
        Ok(())
    }

    /// Submit this block's partial value to the next reduction episode.
    /// Every block must contribute to every episode, using the reducer's
    /// neutral element when it holds no live data; a skipped contribution
    /// stalls the whole run.
    pub fn contribute(
        &mut self,
        block: &mut Block,
        values: &[f64],
        reducer: Reducer,
        cont: C,
    ) -> Result<(), Error> {
        let episode = block.next_reduction_episode();
        self.outbox.push(Signal::Contribute {
            from: block.index(),
            episode,
            values: values.to_vec(),
            reducer,
            cont,
        });
        Ok(())
    }

    /// Mark this block's method finished for the current cycle.
    pub fn done(&mut self) {
        *self.done = true
    }
}

struct Slot<M: Method> {
    block: Block,
    method: Option<M>,
    exchange_cont: Option<M::Continuation>,
    done: bool,
}

/// The arena of blocks plus the queue that drives them to quiescence.
pub struct Scheduler<M: Method> {
    hierarchy: Hierarchy,
    descr: FieldDescr,
    boundary: Boundary,
    slots: Vec<Slot<M>>,
    index_of: HashMap<BlockIndex, usize>,
    pending: HashMap<u64, PendingReduction<M::Continuation>>,
    barriers: HashMap<u64, usize>,
    queue_tx: crossbeam_channel::Sender<Signal<M::Continuation>>,
    queue_rx: crossbeam_channel::Receiver<Signal<M::Continuation>>,
    parallel: bool,
}

impl<M: Method> Scheduler<M> {
    /// Allocate one block and one method instance per hierarchy entry.
    pub fn new<F>(
        hierarchy: Hierarchy,
        descr: FieldDescr,
        boundary: Boundary,
        mut make_method: F,
    ) -> Self
    where
        F: FnMut(BlockIndex) -> M,
    {
        let (queue_tx, queue_rx) = crossbeam_channel::unbounded();
        let mut slots = Vec::new();
        let mut index_of = HashMap::new();

        for index in hierarchy.block_indices() {
            let (lower, upper) = hierarchy.block_extents(index);
            let block = Block::new(
                index,
                hierarchy.level(index),
                lower,
                upper,
                hierarchy.block_size(),
                &descr);
            index_of.insert(index, slots.len());
            slots.push(Slot {
                block,
                method: Some(make_method(index)),
                exchange_cont: None,
                done: false,
            });
        }

        Self {
            hierarchy,
            descr,
            boundary,
            slots,
            index_of,
            pending: HashMap::new(),
            barriers: HashMap::new(),
            queue_tx,
            queue_rx,
            parallel: false,
        }
    }

    pub fn hierarchy(&self) -> &Hierarchy {
        &self.hierarchy
    }

    pub fn descr(&self) -> &FieldDescr {
        &self.descr
    }

    pub fn block(&self, index: BlockIndex) -> Option<&Block> {
        self.index_of.get(&index).map(|&i| &self.slots[i].block)
    }

    /// Mutable access for setting initial conditions before a run.
    pub fn block_mut(&mut self, index: BlockIndex) -> Option<&mut Block> {
        let i = *self.index_of.get(&index)?;
        Some(&mut self.slots[i].block)
    }

    pub fn method(&self, index: BlockIndex) -> Option<&M> {
        self.index_of
            .get(&index)
            .and_then(|&i| self.slots[i].method.as_ref())
    }

    /// Drive one simulation cycle to quiescence on the calling thread.
    pub fn run(&mut self) -> Result<(), Error> {
        self.parallel = false;
        self.run_cycle()
    }

    /// Like [`Scheduler::run`], with the per-block handler phases (the
    /// cycle seed and reduction-result broadcasts) dispatched into the
    /// rayon thread pool. Queue routing stays on the calling thread, so
    /// signal order is the same either way.
    pub fn run_par(&mut self) -> Result<(), Error> {
        self.parallel = true;
        self.run_cycle()
    }

    fn run_cycle(&mut self) -> Result<(), Error> {
        for slot in &mut self.slots {
            slot.done = false
        }

        self.invoke_all(Event::Step)?;

        while let Ok(signal) = self.queue_rx.try_recv() {
            self.dispatch(signal)?
        }

        if let Some(stalled) = self.slots.iter().find(|s| !s.done) {
            return Err(Error::protocol(
                stalled.block.index(),
                0,
                format!(
                    "run stalled with {} pending reduction episode(s) and an idle queue",
                    self.pending.len())));
        }

        self.advance_cycle();
        Ok(())
    }

    fn dispatch(&mut self, signal: Signal<M::Continuation>) -> Result<(), Error> {
        match signal {
            Signal::FaceData { epoch, to, face, bytes } => {
                let i = self.slot_index(to, epoch)?;
                self.slots[i].block.deliver_face(epoch, face, bytes)?;
                self.finish_if_complete(i, epoch)
            }
            Signal::EpochStarted { from, epoch, barrier } => {
                let i = self.slot_index(from, epoch)?;
                for (face, bytes) in self.slots[i].block.take_stashed(epoch) {
                    self.slots[i].block.deliver_face(epoch, face, bytes)?;
                }
                self.finish_if_complete(i, epoch)?;

                if barrier {
                    let arrived = self.barriers.entry(epoch).or_insert(0);
                    *arrived += 1;
                    if *arrived == self.slots.len() {
                        self.barriers.remove(&epoch);
                        debug!("all blocks entered barrier epoch {}; broadcasting token", epoch);
                        self.queue_tx.send(Signal::SyncToken { epoch }).unwrap()
                    }
                }
                Ok(())
            }
            Signal::SyncToken { epoch } => {
                for i in 0..self.slots.len() {
                    self.slots[i].block.deliver_sync_token(epoch)?;
                    self.finish_if_complete(i, epoch)?;
                }
                Ok(())
            }
            Signal::Contribute { from, episode, values, reducer, cont } => {
                let expected = self.slots.len();
                let pending = self.pending.entry(episode).or_insert_with(|| {
                    PendingReduction::new(episode, reducer, cont, expected, values.len())
                });
                if pending.contribute(from, &values, reducer, cont)? {
                    let retired = self.pending.remove(&episode).unwrap();
                    let (cont, aggregate) = retired.into_aggregate();
                    debug!("reduction episode {} complete", episode);
                    self.invoke_all(Event::Reduction(cont, aggregate))?
                }
                Ok(())
            }
        }
    }

    fn slot_index(&self, index: BlockIndex, episode: u64) -> Result<usize, Error> {
        self.index_of.get(&index).copied().ok_or_else(|| {
            Error::protocol(
                index,
                episode,
                "signal addressed to a block absent from the hierarchy".to_string())
        })
    }

    fn finish_if_complete(&mut self, i: usize, epoch: u64) -> Result<(), Error> {
        if !self.slots[i].block.exchange_complete_now(epoch) {
            return Ok(());
        }
        self.slots[i].block.finish_exchange(epoch)?;
        let cont = self.slots[i].exchange_cont.take().ok_or_else(|| {
            Error::protocol(
                self.slots[i].block.index(),
                epoch,
                "exchange completed with no continuation registered".to_string())
        })?;
        self.invoke(i, Event::Exchange(cont))
    }

    /// Run one handler on one block, then flush its outbox into the queue.
    fn invoke(&mut self, i: usize, event: Event<M::Continuation>) -> Result<(), Error> {
        let mut outbox = Vec::new();
        let result = {
            let slot = &mut self.slots[i];
            let mut ctx = Context {
                hierarchy: &self.hierarchy,
                descr: &self.descr,
                boundary: self.boundary,
                outbox: &mut outbox,
                exchange_cont: &mut slot.exchange_cont,
                done: &mut slot.done,
            };
            let mut method = slot.method.take().expect("handler re-entered");
            let result = match &event {
                Event::Step => method.compute_step(&mut slot.block, &mut ctx),
                Event::Exchange(cont) => method.exchange_complete(&mut slot.block, *cont, &mut ctx),
                Event::Reduction(cont, aggregate) => {
                    method.reduction_complete(&mut slot.block, *cont, aggregate, &mut ctx)
                }
            };
            slot.method = Some(method);
            result
        };
        result?;
        for signal in outbox {
            self.queue_tx.send(signal).unwrap()
        }
        Ok(())
    }

    /// Run one handler on every block. Per-block work is independent (a
    /// handler touches only its own block and outbox), so this phase may
    /// fan out into the rayon pool; outboxes are flushed in slot order
    /// either way, keeping the queue deterministic.
    fn invoke_all(&mut self, event: Event<M::Continuation>) -> Result<(), Error> {
        if self.parallel {
            use rayon::prelude::*;

            let hierarchy = &self.hierarchy;
            let descr = &self.descr;
            let boundary = self.boundary;

            let outcomes: Vec<(Vec<Signal<M::Continuation>>, Result<(), Error>)> = self
                .slots
                .par_iter_mut()
                .map(|slot| {
                    let mut outbox = Vec::new();
                    let mut ctx = Context {
                        hierarchy,
                        descr,
                        boundary,
                        outbox: &mut outbox,
                        exchange_cont: &mut slot.exchange_cont,
                        done: &mut slot.done,
                    };
                    let mut method = slot.method.take().expect("handler re-entered");
                    let result = match &event {
                        Event::Step => method.compute_step(&mut slot.block, &mut ctx),
                        Event::Exchange(cont) => {
                            method.exchange_complete(&mut slot.block, *cont, &mut ctx)
                        }
                        Event::Reduction(cont, aggregate) => {
                            method.reduction_complete(&mut slot.block, *cont, aggregate, &mut ctx)
                        }
                    };
                    slot.method = Some(method);
                    (outbox, result)
                })
                .collect();

            for (outbox, result) in outcomes {
                result?;
                for signal in outbox {
                    self.queue_tx.send(signal).unwrap()
                }
            }
            Ok(())
        } else {
            for i in 0..self.slots.len() {
                self.invoke(i, event.clone())?
            }
            Ok(())
        }
    }

    /// End-of-cycle bookkeeping: agree on the next timestep (the minimum
    /// over every block's method) and advance cycle and time.
    fn advance_cycle(&mut self) {
        let dt = self
            .slots
            .iter()
            .map(|slot| {
                slot.method
                    .as_ref()
                    .map(|m| m.timestep(&slot.block))
                    .unwrap_or(f64::INFINITY)
            })
            .fold(f64::INFINITY, f64::min);

        for slot in &mut self.slots {
            let cycle = slot.block.cycle();
            slot.block.set_cycle(cycle + 1);
            if dt.is_finite() {
                let time = slot.block.time();
                slot.block.set_dt(dt);
                slot.block.set_time(time + dt);
            }
        }
    }
}

// ============================================================================
#[cfg(test)]
mod test {

    use super::*;
    use crate::field::Precision;
    use crate::refresh::{RefreshSpec, SyncMode};

    /// A method that runs one refresh and stops.
    struct RefreshOnce {
        spec: RefreshSpec,
    }

    impl Method for RefreshOnce {
        type Continuation = ();

        fn compute_step(&mut self, block: &mut Block, ctx: &mut Context<()>) -> Result<(), Error> {
            ctx.start_refresh(block, &self.spec, ())
        }

        fn exchange_complete(&mut self, _: &mut Block, _: (), ctx: &mut Context<()>) -> Result<(), Error> {
            ctx.done();
            Ok(())
        }

        fn reduction_complete(&mut self, _: &mut Block, _: (), _: &[f64], _: &mut Context<()>) -> Result<(), Error> {
            unreachable!("no reductions in this method")
        }
    }

    /// A method that contributes one sum and records the aggregate.
    struct SumOnce {
        value: f64,
        seen: Option<f64>,
        contribute_twice: bool,
    }

    impl Method for SumOnce {
        type Continuation = u32;

        fn compute_step(&mut self, block: &mut Block, ctx: &mut Context<u32>) -> Result<(), Error> {
            let value = if ctx.is_leaf(block) { self.value } else { Reducer::Sum.neutral() };
            ctx.contribute(block, &[value], Reducer::Sum, 1)?;
            if self.contribute_twice {
                // a second contribution to the same episode: the episode id
                // advances, so force the collision by reusing the signal
                ctx.outbox.push(Signal::Contribute {
                    from: block.index(),
                    episode: 1,
                    values: vec![value],
                    reducer: Reducer::Sum,
                    cont: 1,
                });
            }
            Ok(())
        }

        fn exchange_complete(&mut self, _: &mut Block, _: u32, _: &mut Context<u32>) -> Result<(), Error> {
            unreachable!("no exchanges in this method")
        }

        fn reduction_complete(&mut self, _: &mut Block, cont: u32, aggregate: &[f64], ctx: &mut Context<u32>) -> Result<(), Error> {
            assert_eq!(cont, 1);
            self.seen = Some(aggregate[0]);
            ctx.done();
            Ok(())
        }
    }

    fn one_field_descr(ghost: (usize, usize, usize)) -> FieldDescr {
        let mut descr = FieldDescr::new();
        descr.insert("density", Precision::Double, ghost);
        descr
    }

    fn fill(scheduler: &mut Scheduler<RefreshOnce>, index: BlockIndex, value: f64) {
        let block = scheduler.block_mut(index).unwrap();
        for i in block.interior_slab(0).offsets().collect::<Vec<_>>() {
            block.field_mut(0).set(i, value)
        }
    }

    fn refresh_scheduler(sync: SyncMode, accumulate: bool) -> Scheduler<RefreshOnce> {
        let descr = one_field_descr((1, 0, 0));
        let hierarchy = Hierarchy::unigrid((2, 1, 1), (4, 1, 1), ((0.0, 0.0, 0.0), (1.0, 1.0, 1.0)));
        let mut spec = RefreshSpec::new((1, 0, 0), sync);
        spec.add_field(0);
        spec.set_accumulate(accumulate);
        Scheduler::new(hierarchy, descr, Boundary::Zero, move |_| RefreshOnce { spec: spec.clone() })
    }

    #[test]
    fn scenario_a_neighbor_counted_halo_swap() {
        let mut scheduler = refresh_scheduler(SyncMode::NeighborCounted, false);
        fill(&mut scheduler, (0, 0, 0), 1.0);
        fill(&mut scheduler, (1, 0, 0), 2.0);

        scheduler.run().unwrap();

        // block A's right ghost mirrors B, block B's left ghost mirrors A
        assert_eq!(scheduler.block((0, 0, 0)).unwrap().field(0).get(5), 2.0);
        assert_eq!(scheduler.block((1, 0, 0)).unwrap().field(0).get(0), 1.0);
        assert_eq!(scheduler.block((0, 0, 0)).unwrap().cycle(), 1);
    }

    #[test]
    fn barrier_mode_reaches_the_same_ghosts() {
        let mut scheduler = refresh_scheduler(SyncMode::Barrier, false);
        fill(&mut scheduler, (0, 0, 0), 3.0);
        fill(&mut scheduler, (1, 0, 0), 4.0);

        scheduler.run().unwrap();

        assert_eq!(scheduler.block((0, 0, 0)).unwrap().field(0).get(5), 4.0);
        assert_eq!(scheduler.block((1, 0, 0)).unwrap().field(0).get(0), 3.0);
    }

    #[test]
    fn accumulate_sums_into_the_destination() {
        let mut scheduler = refresh_scheduler(SyncMode::NeighborCounted, true);
        fill(&mut scheduler, (0, 0, 0), 1.0);
        fill(&mut scheduler, (1, 0, 0), 2.0);
        scheduler.block_mut((0, 0, 0)).unwrap().field_mut(0).set(5, 0.5);

        scheduler.run().unwrap();

        // destination = original + incoming slab
        assert_eq!(scheduler.block((0, 0, 0)).unwrap().field(0).get(5), 2.5);
    }

    #[test]
    fn accumulate_across_levels_is_rejected() {
        let descr = one_field_descr((1, 0, 0));
        let mut hierarchy = Hierarchy::unigrid((2, 1, 1), (4, 1, 1), ((0.0, 0.0, 0.0), (1.0, 1.0, 1.0)));
        hierarchy.set_level((1, 0, 0), 1);

        let mut spec = RefreshSpec::new((1, 0, 0), SyncMode::NeighborCounted);
        spec.add_field(0);
        spec.set_accumulate(true);

        let mut scheduler =
            Scheduler::new(hierarchy, descr, Boundary::Zero, move |_| RefreshOnce { spec: spec.clone() });
        match scheduler.run() {
            Err(Error::Config(_)) => {}
            other => panic!("expected a config error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn parallel_run_matches_serial() {
        let mut serial = refresh_scheduler(SyncMode::NeighborCounted, false);
        let mut parallel = refresh_scheduler(SyncMode::NeighborCounted, false);
        for s in [&mut serial, &mut parallel] {
            fill(s, (0, 0, 0), 1.0);
            fill(s, (1, 0, 0), 2.0);
        }

        serial.run().unwrap();
        parallel.run_par().unwrap();

        for index in [(0, 0, 0), (1, 0, 0)] {
            let a = serial.block(index).unwrap();
            let b = parallel.block(index).unwrap();
            for i in 0..a.field(0).len() {
                assert_eq!(a.field(0).get(i).to_bits(), b.field(0).get(i).to_bits())
            }
        }
    }

    #[test]
    fn sum_reduction_with_a_neutral_contributor() {
        let descr = one_field_descr((0, 0, 0));
        let mut hierarchy = Hierarchy::unigrid((3, 1, 1), (2, 1, 1), ((0.0, 0.0, 0.0), (1.0, 1.0, 1.0)));
        hierarchy.set_leaf((2, 0, 0), false);

        let mut scheduler = Scheduler::new(hierarchy, descr, Boundary::Zero, |_| SumOnce {
            value: 2.5,
            seen: None,
            contribute_twice: false,
        });
        scheduler.run().unwrap();

        // two leaves contribute 2.5, the non-leaf contributes the neutral 0
        for index in [(0, 0, 0), (1, 0, 0), (2, 0, 0)] {
            assert_eq!(scheduler.method(index).unwrap().seen, Some(5.0));
        }
    }

    #[test]
    fn double_contribution_is_a_protocol_violation() {
        let descr = one_field_descr((0, 0, 0));
        let hierarchy = Hierarchy::unigrid((2, 1, 1), (2, 1, 1), ((0.0, 0.0, 0.0), (1.0, 1.0, 1.0)));
        let mut scheduler = Scheduler::new(hierarchy, descr, Boundary::Zero, |index| SumOnce {
            value: 1.0,
            seen: None,
            contribute_twice: index == (0, 0, 0),
        });
        match scheduler.run() {
            Err(Error::Protocol { .. }) => {}
            other => panic!("expected a protocol violation, got {:?}", other.map(|_| ())),
        }
    }

    /// A method that never finishes: contributes nothing, refreshes
    /// nothing, just returns.
    struct Silent;

    impl Method for Silent {
        type Continuation = ();

        fn compute_step(&mut self, _: &mut Block, _: &mut Context<()>) -> Result<(), Error> {
            Ok(())
        }

        fn exchange_complete(&mut self, _: &mut Block, _: (), _: &mut Context<()>) -> Result<(), Error> {
            Ok(())
        }

        fn reduction_complete(&mut self, _: &mut Block, _: (), _: &[f64], _: &mut Context<()>) -> Result<(), Error> {
            Ok(())
        }
    }

    #[test]
    fn a_block_that_never_finishes_is_a_stall() {
        let descr = one_field_descr((0, 0, 0));
        let hierarchy = Hierarchy::unigrid((2, 1, 1), (2, 1, 1), ((0.0, 0.0, 0.0), (1.0, 1.0, 1.0)));
        let mut scheduler = Scheduler::new(hierarchy, descr, Boundary::Zero, |_| Silent);
        match scheduler.run() {
            Err(Error::Protocol { .. }) => {}
            other => panic!("expected a stall, got {:?}", other.map(|_| ())),
        }
    }
}
