use crate::error::Error;
use crate::field::{FieldDescr, FieldId};
use crate::hierarchy::Hierarchy;




#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]


/**
 * Synchronization discipline for one exchange episode. `NeighborCounted`
 * completes when a block has heard from every interior neighbor it expects;
 * `Barrier` completes only on a global token broadcast after every active
 * block has entered the episode, for epochs where the neighbor topology
 * cannot be determined locally.
 */
pub enum SyncMode {
    NeighborCounted,
    Barrier,
}




#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]


/**
 * Declarative description of one ghost-zone exchange episode: which fields
 * move, how deep, under which synchronization discipline, and whether
 * incoming slabs accumulate into the destination or overwrite it.
 */
pub struct RefreshSpec {
    fields: Vec<FieldId>,
    ghost_depth: (usize, usize, usize),
    sync: SyncMode,
    accumulate: bool,
}




// ============================================================================
impl RefreshSpec {


    pub fn new(ghost_depth: (usize, usize, usize), sync: SyncMode) -> Self {
        Self {
            fields: Vec::new(),
            ghost_depth,
            sync,
            accumulate: false,
        }
    }


    /**
     * Add one field to the exchange. The field list is a set; the stored
     * order is sorted by id so the serialized buffer layout is stable no
     * matter the insertion order.
     */
    pub fn add_field(&mut self, id: FieldId) {
        if !self.fields.contains(&id) {
            self.fields.push(id);
            self.fields.sort_unstable();
        }
    }


    /**
     * Add every field in the registry to the exchange.
     */
    pub fn add_all_fields(&mut self, descr: &FieldDescr) {
        for id in descr.all_fields() {
            self.add_field(id)
        }
    }


    pub fn set_accumulate(&mut self, accumulate: bool) {
        self.accumulate = accumulate
    }


    pub fn fields(&self) -> &[FieldId] {
        &self.fields
    }


    pub fn ghost_depth(&self) -> (usize, usize, usize) {
        self.ghost_depth
    }


    pub fn sync(&self) -> SyncMode {
        self.sync
    }


    pub fn accumulate(&self) -> bool {
        self.accumulate
    }


    /**
     * Check this spec against the field registry and hierarchy before an
     * episode fires. Every field must be registered with ghost storage at
     * least as deep as the exchange wants, and accumulation is rejected
     * outright when blocks span refinement levels: merging slabs across a
     * coarse-fine boundary is not supported yet.
     */
    pub fn validate(&self, descr: &FieldDescr, hierarchy: &Hierarchy) -> Result<(), Error> {
        if self.fields.is_empty() {
            return Err(Error::Config("refresh spec names no fields".to_string()));
        }
        for &id in &self.fields {
            if !descr.contains(id) {
                return Err(Error::Config(format!("refresh spec names unregistered field id {}", id)));
            }
            let (gx, gy, gz) = descr.ghost_depth(id);
            let (dx, dy, dz) = self.ghost_depth;
            if dx > gx || dy > gy || dz > gz {
                return Err(Error::Config(format!(
                    "refresh depth ({},{},{}) exceeds ghost storage ({},{},{}) of field {:?}",
                    dx, dy, dz, gx, gy, gz, descr.name(id))));
            }
        }
        if self.accumulate && !hierarchy.is_single_level() {
            return Err(Error::Config(
                "accumulate refresh cannot be used across refinement levels".to_string()));
        }
        Ok(())
    }
}
