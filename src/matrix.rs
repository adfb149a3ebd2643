use crate::block::Block;
use crate::error::Error;
use crate::field::{FieldId, Precision, Scalar};

/// The linear operators a solver can be configured with, selected at
/// construction time. `Laplace` is the second-order stencil of the
/// discrete Laplacian; `Diagonal` applies the inverse diagonal of that
/// stencil (the Jacobi preconditioner); `Identity` copies, which turns
/// preconditioning off.
///
/// `matvec` touches interior zones only and reads whatever the ghost
/// zones hold, so the source field must have been refreshed (or boundary
/// filled) beforehand. An axis participates in the stencil only when the
/// source field carries ghost storage on it; degenerate axes drop out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Matrix {
    Laplace,
    Diagonal,
    Identity,
}

impl Matrix {
    pub fn matvec(
        &self,
        dst: FieldId,
        src: FieldId,
        block: &mut Block,
        cell_width: (f64, f64, f64),
    ) -> Result<(), Error> {
        if block.dims(src) != block.dims(dst) {
            return Err(Error::Config(format!(
                "matvec fields have different shapes ({:?} vs {:?})",
                block.dims(src), block.dims(dst))));
        }
        match block.field(src).precision() {
            Precision::Single => self.matvec_t::<f32>(dst, src, block, cell_width),
            Precision::Double => self.matvec_t::<f64>(dst, src, block, cell_width),
        }
    }

    /// The diagonal entry of the Laplace stencil on this block.
    pub fn laplace_diagonal(block: &Block, src: FieldId, cell_width: (f64, f64, f64)) -> f64 {
        let g = block.ghost_depth(src);
        let mut diagonal = 0.0;
        if g.0 > 0 {
            diagonal -= 2.0 / (cell_width.0 * cell_width.0)
        }
        if g.1 > 0 {
            diagonal -= 2.0 / (cell_width.1 * cell_width.1)
        }
        if g.2 > 0 {
            diagonal -= 2.0 / (cell_width.2 * cell_width.2)
        }
        diagonal
    }

    fn matvec_t<T: Scalar>(
        &self,
        dst: FieldId,
        src: FieldId,
        block: &mut Block,
        cell_width: (f64, f64, f64),
    ) -> Result<(), Error> {
        let (mx, my, _) = block.dims(src);
        let g = block.ghost_depth(src);
        let interior = block.interior_slab(dst);

        // owned copy of the source so dst and src may be the same field
        let source: Vec<T> = T::values(block.field(src))?.to_vec();

        match self {
            Matrix::Identity => {
                let out = T::values_mut(block.field_mut(dst))?;
                for i in interior.offsets() {
                    out[i] = source[i]
                }
            }
            Matrix::Diagonal => {
                let diagonal = T::from_f64(1.0 / Self::laplace_diagonal(block, src, cell_width));
                let out = T::values_mut(block.field_mut(dst))?;
                for i in interior.offsets() {
                    out[i] = diagonal * source[i]
                }
            }
            Matrix::Laplace => {
                let cx = T::from_f64(1.0 / (cell_width.0 * cell_width.0));
                let cy = T::from_f64(1.0 / (cell_width.1 * cell_width.1));
                let cz = T::from_f64(1.0 / (cell_width.2 * cell_width.2));
                let two = T::from_f64(2.0);

                let strides = (1, mx, mx * my);
                let offsets: Vec<usize> = interior.offsets().collect();
                let out = T::values_mut(block.field_mut(dst))?;

                for i in offsets {
                    let mut acc = T::ZERO;
                    if g.0 > 0 {
                        acc = acc + cx * (source[i - strides.0] + source[i + strides.0] - two * source[i]);
                    }
                    if g.1 > 0 {
                        acc = acc + cy * (source[i - strides.1] + source[i + strides.1] - two * source[i]);
                    }
                    if g.2 > 0 {
                        acc = acc + cz * (source[i - strides.2] + source[i + strides.2] - two * source[i]);
                    }
                    out[i] = acc;
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
#[cfg(test)]
mod test {

    use super::Matrix;
    use crate::block::Block;
    use crate::field::{FieldDescr, Precision};

    fn setup() -> (Block, FieldDescr) {
        let mut descr = FieldDescr::new();
        descr.insert("R", Precision::Double, (1, 0, 0));
        descr.insert("Z", Precision::Double, (1, 0, 0));

        let block = Block::new(
            (0, 0, 0),
            0,
            (0.0, 0.0, 0.0),
            (1.0, 1.0, 1.0),
            (4, 1, 1),
            &descr);
        (block, descr)
    }

    #[test]
    fn identity_copies_the_interior() {
        let (mut block, _) = setup();
        for (k, i) in block.interior_slab(0).offsets().enumerate() {
            block.field_mut(0).set(i, k as f64)
        }
        Matrix::Identity.matvec(1, 0, &mut block, (0.25, 1.0, 1.0)).unwrap();
        for (k, i) in block.interior_slab(1).offsets().enumerate() {
            assert_eq!(block.field(1).get(i), k as f64)
        }
    }

    #[test]
    fn laplace_of_a_linear_field_vanishes() {
        let (mut block, _) = setup();
        let h = 0.25;
        // fill interior and ghosts with x so the second derivative is zero
        for i in 0..6 {
            block.field_mut(0).set(i, i as f64 * h)
        }
        Matrix::Laplace.matvec(1, 0, &mut block, (h, 1.0, 1.0)).unwrap();
        for i in block.interior_slab(1).offsets() {
            assert!(block.field(1).get(i).abs() < 1e-12)
        }
    }

    #[test]
    fn laplace_of_a_quadratic_field_is_two() {
        let (mut block, _) = setup();
        let h = 0.5;
        for i in 0..6 {
            let x = i as f64 * h;
            block.field_mut(0).set(i, x * x)
        }
        Matrix::Laplace.matvec(1, 0, &mut block, (h, 1.0, 1.0)).unwrap();
        for i in block.interior_slab(1).offsets() {
            assert!((block.field(1).get(i) - 2.0).abs() < 1e-12)
        }
    }

    #[test]
    fn diagonal_inverts_the_stencil_diagonal() {
        let (mut block, _) = setup();
        let h = 0.5;
        for i in block.interior_slab(0).offsets() {
            block.field_mut(0).set(i, 8.0)
        }
        Matrix::Diagonal.matvec(1, 0, &mut block, (h, 1.0, 1.0)).unwrap();
        let diagonal = Matrix::laplace_diagonal(&block, 0, (h, 1.0, 1.0));
        assert_eq!(diagonal, -8.0);
        for i in block.interior_slab(1).offsets() {
            assert_eq!(block.field(1).get(i), -1.0)
        }
    }

    #[test]
    fn matvec_may_run_in_place() {
        let (mut block, _) = setup();
        for i in 0..6 {
            block.field_mut(0).set(i, i as f64)
        }
        Matrix::Laplace.matvec(0, 0, &mut block, (1.0, 1.0, 1.0)).unwrap();
        for i in block.interior_slab(0).offsets() {
            assert!(block.field(0).get(i).abs() < 1e-12)
        }
    }
}
