use crate::block::Block;
use crate::field::FieldId;
use crate::refresh::RefreshSpec;




#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]


/**
 * The boundary-condition collaborator: fills a block's ghost slab on a
 * facet that crosses the domain boundary, during an exchange episode.
 * `Zero` writes zeros (a Dirichlet-zero condition); `Outflow` copies the
 * nearest interior zone (zero-gradient, which makes the Laplace stencil
 * behave as a pure-Neumann operator).
 */
pub enum Boundary {
    Zero,
    Outflow,
}




// ============================================================================
impl Boundary {


    /**
     * Fill the ghost slabs of every field in the spec along one external
     * facet of the block.
     */
    pub fn fill(&self, block: &mut Block, spec: &RefreshSpec, facet: (i32, i32, i32)) {
        for &id in spec.fields() {
            self.fill_field(block, id, facet, spec.ghost_depth())
        }
    }


    fn fill_field(&self, block: &mut Block, id: FieldId, facet: (i32, i32, i32), depth: (usize, usize, usize)) {
        let slab = block.recv_slab(id, facet, depth);
        let (mx, my, _) = slab.shape;
        let g = block.ghost_depth(id);
        let n = block.size();

        match self {
            Boundary::Zero => {
                let offsets: Vec<usize> = slab.offsets().collect();
                for i in offsets {
                    block.field_mut(id).set(i, 0.0)
                }
            }
            Boundary::Outflow => {
                // clamp each ghost zone to the nearest interior zone
                let clamp = |x: usize, g: usize, n: usize| x.max(g).min(g + n - 1);
                let (sx, sy, sz) = slab.start;
                let (cx, cy, cz) = slab.count;

                for iz in 0..cz {
                    for iy in 0..cy {
                        for ix in 0..cx {
                            let x = sx + ix;
                            let y = sy + iy;
                            let z = sz + iz;
                            let src = clamp(x, g.0, n.0)
                                + mx * (clamp(y, g.1, n.1) + my * clamp(z, g.2, n.2));
                            let dst = x + mx * (y + my * z);
                            let value = block.field(id).get(src);
                            block.field_mut(id).set(dst, value);
                        }
                    }
                }
            }
        }
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::Boundary;
    use crate::block::Block;
    use crate::field::{FieldDescr, Precision};
    use crate::refresh::{RefreshSpec, SyncMode};


    fn setup() -> (Block, RefreshSpec) {
        let mut descr = FieldDescr::new();
        descr.insert("density", Precision::Double, (1, 0, 0));

        let mut block = Block::new(
            (0, 0, 0),
            0,
            (0.0, 0.0, 0.0),
            (1.0, 1.0, 1.0),
            (4, 1, 1),
            &descr);

        for (k, i) in block.interior_slab(0).offsets().enumerate() {
            block.field_mut(0).set(i, 1.0 + k as f64)
        }

        let mut spec = RefreshSpec::new((1, 0, 0), SyncMode::NeighborCounted);
        spec.add_field(0);
        (block, spec)
    }


    #[test]
    fn zero_fills_the_ghost_slab() {
        let (mut block, spec) = setup();
        block.field_mut(0).set(0, 9.0);
        Boundary::Zero.fill(&mut block, &spec, (-1, 0, 0));
        assert_eq!(block.field(0).get(0), 0.0);
        assert_eq!(block.field(0).get(1), 1.0);
    }


    #[test]
    fn outflow_copies_the_nearest_interior_zone() {
        let (mut block, spec) = setup();
        Boundary::Outflow.fill(&mut block, &spec, (-1, 0, 0));
        Boundary::Outflow.fill(&mut block, &spec, (1, 0, 0));
        assert_eq!(block.field(0).get(0), 1.0);
        assert_eq!(block.field(0).get(5), 4.0);
    }
}
