use crate::adjacency::LabeledGraph;
use crate::block::BlockIndex;
use crate::face::Face;
use std::collections::HashMap;

/// The topology manager: which blocks exist, how they are linked, which are
/// leaves, and where the domain boundary lies. Blocks consult it through the
/// scheduler; it never touches block storage.
///
/// The patch here is a uniform `nbx * nby * nbz` arrangement of equally
/// sized blocks at one refinement level. Per-block levels are still carried
/// so episode validation can enforce the restrictions that apply across
/// coarse-fine boundaries.
pub struct Hierarchy {
    shape: (usize, usize, usize),
    block_size: (usize, usize, usize),
    domain: ((f64, f64, f64), (f64, f64, f64)),
    levels: HashMap<BlockIndex, u32>,
    leaves: HashMap<BlockIndex, bool>,
    links: LabeledGraph<BlockIndex, Face>,
}

impl Hierarchy {
    /// Build a uniform patch of blocks covering the given domain. Neighbor
    /// links are precomputed for all facet, edge, and corner relations
    /// between blocks of the patch; relations that would leave the patch are
    /// absent, which is what marks them as domain-boundary relations.
    pub fn unigrid(
        shape: (usize, usize, usize),
        block_size: (usize, usize, usize),
        domain: ((f64, f64, f64), (f64, f64, f64)),
    ) -> Self {
        assert!(shape.0 > 0 && shape.1 > 0 && shape.2 > 0, "empty hierarchy");

        let mut levels = HashMap::new();
        let mut leaves = HashMap::new();
        let mut links = LabeledGraph::new();

        let contains = |i: i32, j: i32, k: i32| {
            0 <= i && (i as usize) < shape.0 &&
            0 <= j && (j as usize) < shape.1 &&
            0 <= k && (k as usize) < shape.2
        };

        for i in 0..shape.0 as i32 {
            for j in 0..shape.1 as i32 {
                for k in 0..shape.2 as i32 {
                    let home = (i, j, k);
                    levels.insert(home, 0);
                    leaves.insert(home, true);

                    for fx in -1..=1 {
                        for fy in -1..=1 {
                            for fz in -1..=1 {
                                if (fx, fy, fz) == (0, 0, 0) {
                                    continue;
                                }
                                if contains(i + fx, j + fy, k + fz) {
                                    links.insert(
                                        home,
                                        Face::from_facet((fx, fy, fz)),
                                        (i + fx, j + fy, k + fz));
                                }
                            }
                        }
                    }
                }
            }
        }

        Self {
            shape,
            block_size,
            domain,
            levels,
            leaves,
            links,
        }
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        self.shape
    }

    pub fn block_size(&self) -> (usize, usize, usize) {
        self.block_size
    }

    pub fn domain(&self) -> ((f64, f64, f64), (f64, f64, f64)) {
        self.domain
    }

    /// All block indices in the patch, in a fixed deterministic order
    /// (x-fastest).
    pub fn block_indices(&self) -> Vec<BlockIndex> {
        let mut out = Vec::with_capacity(self.block_count());
        for k in 0..self.shape.2 as i32 {
            for j in 0..self.shape.1 as i32 {
                for i in 0..self.shape.0 as i32 {
                    out.push((i, j, k))
                }
            }
        }
        out
    }

    pub fn block_count(&self) -> usize {
        self.shape.0 * self.shape.1 * self.shape.2
    }

    /// Interior neighbor relations of a block: the `Face` as seen from the
    /// block's side, and the neighbor's index.
    pub fn relations(&self, index: BlockIndex) -> impl Iterator<Item = &(Face, BlockIndex)> {
        self.links.edges(&index)
    }

    pub fn has_neighbor(&self, a: BlockIndex, b: BlockIndex) -> bool {
        self.links.contains(&a, &b)
    }

    pub fn is_leaf(&self, index: BlockIndex) -> bool {
        self.leaves.get(&index).copied().unwrap_or(false)
    }

    /// Mark a block as refined away (non-leaf). Non-leaf blocks hold no
    /// live data but still participate in every reduction episode with
    /// neutral contributions.
    pub fn set_leaf(&mut self, index: BlockIndex, leaf: bool) {
        if let Some(entry) = self.leaves.get_mut(&index) {
            *entry = leaf
        }
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.values().filter(|&&leaf| leaf).count()
    }

    pub fn level(&self, index: BlockIndex) -> u32 {
        self.levels.get(&index).copied().unwrap_or(0)
    }

    /// Override a block's refinement level. Regridding itself is out of
    /// scope; the level is carried so that episode validation can reject
    /// configurations that are unsupported across coarse-fine boundaries.
    pub fn set_level(&mut self, index: BlockIndex, level: u32) {
        if let Some(entry) = self.levels.get_mut(&index) {
            *entry = level
        }
    }

    pub fn is_single_level(&self) -> bool {
        let mut levels = self.levels.values();
        match levels.next() {
            Some(first) => levels.all(|l| l == first),
            None => true,
        }
    }

    /// Spatial extents of one block.
    pub fn block_extents(&self, index: BlockIndex) -> ((f64, f64, f64), (f64, f64, f64)) {
        let (lo, hi) = self.domain;
        let width = (
            (hi.0 - lo.0) / self.shape.0 as f64,
            (hi.1 - lo.1) / self.shape.1 as f64,
            (hi.2 - lo.2) / self.shape.2 as f64,
        );
        let lower = (
            lo.0 + width.0 * index.0 as f64,
            lo.1 + width.1 * index.1 as f64,
            lo.2 + width.2 * index.2 as f64,
        );
        let upper = (lower.0 + width.0, lower.1 + width.1, lower.2 + width.2);
        (lower, upper)
    }

    /// Width of one zone of one block, per axis.
    pub fn cell_width(&self, index: BlockIndex) -> (f64, f64, f64) {
        let (lower, upper) = self.block_extents(index);
        let (nx, ny, nz) = self.block_size;
        (
            (upper.0 - lower.0) / nx as f64,
            (upper.1 - lower.1) / ny as f64,
            (upper.2 - lower.2) / nz as f64,
        )
    }
}
