use crate::block::BlockIndex;
use crate::error::Error;
use std::collections::HashSet;
use std::fmt;

/// A reduction operator. Operators must be associative and commutative so
/// the aggregate is independent of contribution order. Values are short
/// vectors of scalars reduced elementwise, which is how several dot
/// products travel in a single round trip.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reducer {
    Sum,
    Max,
}

impl Reducer {
    /// The neutral element: contributing it is indistinguishable from
    /// having no data, which is what inactive blocks contribute.
    pub fn neutral(self) -> f64 {
        match self {
            Reducer::Sum => 0.0,
            Reducer::Max => f64::NEG_INFINITY,
        }
    }

    pub fn merge(self, acc: &mut [f64], values: &[f64]) {
        for (a, v) in acc.iter_mut().zip(values) {
            match self {
                Reducer::Sum => *a += v,
                Reducer::Max => *a = a.max(*v),
            }
        }
    }
}

/// One in-flight reduction episode: the running accumulator, the set of
/// blocks heard from, and the continuation to fire exactly once when the
/// expected count is reached. The first contribution fixes the reducer,
/// the value arity, and the continuation tag; every later contribution
/// must agree, otherwise two different episodes have been conflated and
/// the run is broken.
pub struct PendingReduction<C> {
    episode: u64,
    reducer: Reducer,
    cont: C,
    expected: usize,
    acc: Vec<f64>,
    contributed: HashSet<BlockIndex>,
}

impl<C> PendingReduction<C>
where
    C: Copy + PartialEq + fmt::Debug,
{
    pub fn new(episode: u64, reducer: Reducer, cont: C, expected: usize, arity: usize) -> Self {
        Self {
            episode,
            reducer,
            cont,
            expected,
            acc: vec![reducer.neutral(); arity],
            contributed: HashSet::new(),
        }
    }

    pub fn episode(&self) -> u64 {
        self.episode
    }

    /// Merge one block's partial value. Returns true when the episode has
    /// heard from every expected contributor.
    pub fn contribute(
        &mut self,
        from: BlockIndex,
        values: &[f64],
        reducer: Reducer,
        cont: C,
    ) -> Result<bool, Error> {
        if !self.contributed.insert(from) {
            return Err(Error::protocol(
                from,
                self.episode,
                "block contributed twice to one reduction episode".to_string()));
        }
        if reducer != self.reducer {
            return Err(Error::protocol(
                from,
                self.episode,
                format!("reducer mismatch within one episode ({:?} vs {:?})", reducer, self.reducer)));
        }
        if values.len() != self.acc.len() {
            return Err(Error::protocol(
                from,
                self.episode,
                format!("value arity mismatch within one episode ({} vs {})", values.len(), self.acc.len())));
        }
        if cont != self.cont {
            return Err(Error::protocol(
                from,
                self.episode,
                format!("mismatched continuations within one episode ({:?} vs {:?})", cont, self.cont)));
        }
        if self.contributed.len() > self.expected {
            return Err(Error::protocol(
                from,
                self.episode,
                "more contributions than expected contributors".to_string()));
        }

        self.reducer.merge(&mut self.acc, values);
        Ok(self.contributed.len() == self.expected)
    }

    /// Retire the episode, yielding the continuation and the aggregate.
    pub fn into_aggregate(self) -> (C, Vec<f64>) {
        (self.cont, self.acc)
    }
}

// ============================================================================
#[cfg(test)]
mod test {

    use super::*;

    fn contributors() -> Vec<(BlockIndex, Vec<f64>)> {
        vec![
            ((0, 0, 0), vec![1.0, -3.0]),
            ((1, 0, 0), vec![2.5, 0.0]),
            ((2, 0, 0), vec![-0.5, 7.0]),
            ((3, 0, 0), vec![4.0, 1.0]),
        ]
    }

    fn run(reducer: Reducer, order: &[usize]) -> Vec<f64> {
        let all = contributors();
        let mut pending = PendingReduction::new(1, reducer, 0u32, all.len(), 2);
        let mut complete = false;
        for &i in order {
            let (from, values) = &all[i];
            complete = pending.contribute(*from, values, reducer, 0).unwrap();
        }
        assert!(complete);
        pending.into_aggregate().1
    }

    #[test]
    fn sum_is_independent_of_contribution_order() {
        let reference = run(Reducer::Sum, &[0, 1, 2, 3]);
        assert_eq!(reference, vec![7.0, 5.0]);
        assert_eq!(run(Reducer::Sum, &[3, 2, 1, 0]), reference);
        assert_eq!(run(Reducer::Sum, &[2, 0, 3, 1]), reference);
    }

    #[test]
    fn max_is_independent_of_contribution_order() {
        let reference = run(Reducer::Max, &[0, 1, 2, 3]);
        assert_eq!(reference, vec![4.0, 7.0]);
        assert_eq!(run(Reducer::Max, &[1, 3, 0, 2]), reference);
    }

    #[test]
    fn neutral_contributions_do_not_change_the_aggregate() {
        let mut pending = PendingReduction::new(1, Reducer::Max, 0u32, 2, 1);
        pending.contribute((0, 0, 0), &[3.0], Reducer::Max, 0).unwrap();
        let done = pending
            .contribute((1, 0, 0), &[Reducer::Max.neutral()], Reducer::Max, 0)
            .unwrap();
        assert!(done);
        assert_eq!(pending.into_aggregate().1, vec![3.0]);
    }

    #[test]
    fn double_contribution_is_fatal() {
        let mut pending = PendingReduction::new(1, Reducer::Sum, 0u32, 3, 1);
        pending.contribute((0, 0, 0), &[1.0], Reducer::Sum, 0).unwrap();
        assert!(pending.contribute((0, 0, 0), &[1.0], Reducer::Sum, 0).is_err());
    }

    #[test]
    fn conflated_episodes_are_fatal() {
        let mut pending = PendingReduction::new(1, Reducer::Sum, 0u32, 3, 1);
        pending.contribute((0, 0, 0), &[1.0], Reducer::Sum, 0).unwrap();
        assert!(pending.contribute((1, 0, 0), &[1.0], Reducer::Max, 0).is_err());

        let mut pending = PendingReduction::new(1, Reducer::Sum, 0u32, 3, 2);
        assert!(pending.contribute((0, 0, 0), &[1.0], Reducer::Sum, 0).is_err());

        let mut pending = PendingReduction::new(1, Reducer::Sum, 7u32, 3, 1);
        assert!(pending.contribute((0, 0, 0), &[1.0], Reducer::Sum, 8).is_err());
    }
}
