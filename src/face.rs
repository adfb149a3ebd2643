use crate::wire;




#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]


/**
 * Identifies one neighbor link of a block: a facet, edge, or corner selector
 * with components in {-1, 0, 1}, the outward normal direction, and the
 * neighbor's child-position-in-parent encoding (meaningful only when the
 * neighbor sits at a different refinement level). Immutable once built;
 * equality is exact field-wise comparison.
 */
pub struct Face {
    ix: i32,
    iy: i32,
    iz: i32,
    rx: i32,
    ry: i32,
    rz: i32,
    cx: i32,
    cy: i32,
    cz: i32,
}




// ============================================================================
impl Face {


    pub fn new(
        (ix, iy, iz): (i32, i32, i32),
        (rx, ry, rz): (i32, i32, i32),
        (cx, cy, cz): (i32, i32, i32),
    ) -> Self {
        assert!(
            ix.abs() <= 1 && iy.abs() <= 1 && iz.abs() <= 1,
            "face selector components must be in -1..=1");

        Self { ix, iy, iz, rx, ry, rz, cx, cy, cz }
    }


    /**
     * Build a same-level face from just the facet selector; the normal is
     * the selector itself and the child position is zero.
     */
    pub fn from_facet(facet: (i32, i32, i32)) -> Self {
        Self::new(facet, facet, (0, 0, 0))
    }


    /**
     * Return the facet/edge/corner selector.
     */
    pub fn facet(&self) -> (i32, i32, i32) {
        (self.ix, self.iy, self.iz)
    }


    /**
     * Return the outward normal direction.
     */
    pub fn normal(&self) -> (i32, i32, i32) {
        (self.rx, self.ry, self.rz)
    }


    /**
     * Return the child-position-in-parent encoding.
     */
    pub fn child(&self) -> (i32, i32, i32) {
        (self.cx, self.cy, self.cz)
    }


    /**
     * Return the same link as seen from the other side: the facet and
     * normal are negated, the child encoding is kept.
     */
    pub fn opposite(&self) -> Self {
        Self {
            ix: -self.ix,
            iy: -self.iy,
            iz: -self.iz,
            rx: -self.rx,
            ry: -self.ry,
            rz: -self.rz,
            cx: self.cx,
            cy: self.cy,
            cz: self.cz,
        }
    }


    /**
     * Serialize to nine fixed-width little-endian integers in declaration
     * order (36 bytes).
     */
    pub fn encode(&self, buffer: &mut Vec<u8>) {
        for value in [
            self.ix, self.iy, self.iz,
            self.rx, self.ry, self.rz,
            self.cx, self.cy, self.cz,
        ] {
            wire::put_i32(buffer, value)
        }
    }


    /**
     * Inverse of `encode`. Returns `None` on a short buffer.
     */
    pub fn decode(reader: &mut wire::Reader) -> Option<Self> {
        Some(Self {
            ix: reader.get_i32()?,
            iy: reader.get_i32()?,
            iz: reader.get_i32()?,
            rx: reader.get_i32()?,
            ry: reader.get_i32()?,
            rz: reader.get_i32()?,
            cx: reader.get_i32()?,
            cy: reader.get_i32()?,
            cz: reader.get_i32()?,
        })
    }
}
