use crate::error::Error;
use crate::face::Face;
use crate::field::{FieldArray, FieldDescr, FieldId, Precision};
use crate::refresh::{RefreshSpec, SyncMode};
use crate::wire;
use std::collections::HashSet;
use std::io::{Read, Write};

/// A block's identity: its 3-D integer index within the containing patch.
pub type BlockIndex = (i32, i32, i32);

/// Format version of the block snapshot codec. Bump whenever the snapshot
/// layout changes.
const SNAPSHOT_VERSION: u32 = 1;

/// A rectangular selection of a ghost-padded array: start and count per
/// axis within an array of the given shape. Offsets are produced x-fastest,
/// matching the storage layout, so pack and unpack traverse identically.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slab {
    pub start: (usize, usize, usize),
    pub count: (usize, usize, usize),
    pub shape: (usize, usize, usize),
}

impl Slab {
    pub fn len(&self) -> usize {
        self.count.0 * self.count.1 * self.count.2
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn offsets(&self) -> impl Iterator<Item = usize> + '_ {
        let (sx, sy, sz) = self.start;
        let (cx, cy, cz) = self.count;
        let (mx, my, _) = self.shape;

        (0..cz).flat_map(move |iz| {
            (0..cy).flat_map(move |iy| {
                (0..cx).map(move |ix| (sx + ix) + mx * ((sy + iy) + my * (sz + iz)))
            })
        })
    }
}

/// The lifecycle of one exchange epoch on one block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeState {
    Sending,
    Waiting,
    Complete,
}

/// Bookkeeping for the (single) exchange epoch a block may have in flight.
struct Exchange {
    epoch: u64,
    spec: RefreshSpec,
    expected: usize,
    received: usize,
    synced: bool,
    seen: HashSet<Face>,
    state: ExchangeState,
}

impl Exchange {
    fn is_complete(&self) -> bool {
        self.received == self.expected && self.synced
    }
}

/// The actor unit: owns a subregion of the domain, the ghost-padded field
/// arrays over it, and the per-block scalar state (cycle, time, dt). A block
/// never holds references into another block's storage; everything that
/// crosses blocks is a copied buffer or a reduced scalar.
pub struct Block {
    index: BlockIndex,
    level: u32,
    lower: (f64, f64, f64),
    upper: (f64, f64, f64),
    size: (usize, usize, usize),
    cycle: u64,
    time: f64,
    dt: f64,
    fields: Vec<FieldArray>,
    ghosts: Vec<(usize, usize, usize)>,
    exchange: Option<Exchange>,
    epochs_started: u64,
    reductions_started: u64,
    stash: Vec<(u64, Face, Vec<u8>)>,
}

impl Block {
    pub fn new(
        index: BlockIndex,
        level: u32,
        lower: (f64, f64, f64),
        upper: (f64, f64, f64),
        size: (usize, usize, usize),
        descr: &FieldDescr,
    ) -> Self {
        let mut fields = Vec::new();
        let mut ghosts = Vec::new();

        for id in descr.all_fields() {
            let g = descr.ghost_depth(id);
            let m = (size.0 + 2 * g.0) * (size.1 + 2 * g.1) * (size.2 + 2 * g.2);
            fields.push(FieldArray::zeros(descr.precision(id), m));
            ghosts.push(g);
        }

        Self {
            index,
            level,
            lower,
            upper,
            size,
            cycle: 0,
            time: 0.0,
            dt: 0.0,
            fields,
            ghosts,
            exchange: None,
            epochs_started: 0,
            reductions_started: 0,
            stash: Vec::new(),
        }
    }

    pub fn index(&self) -> BlockIndex {
        self.index
    }

    /// Diagnostic name, e.g. "block_1_0_2".
    pub fn name(&self) -> String {
        format!("block_{}_{}_{}", self.index.0, self.index.1, self.index.2)
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn lower(&self) -> (f64, f64, f64) {
        self.lower
    }

    pub fn upper(&self) -> (f64, f64, f64) {
        self.upper
    }

    /// Interior zone counts, ghost zones excluded.
    pub fn size(&self) -> (usize, usize, usize) {
        self.size
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn set_cycle(&mut self, cycle: u64) {
        self.cycle = cycle
    }

    pub fn set_time(&mut self, time: f64) {
        self.time = time
    }

    pub fn set_dt(&mut self, dt: f64) {
        self.dt = dt
    }

    pub fn field(&self, id: FieldId) -> &FieldArray {
        &self.fields[id as usize]
    }

    pub fn field_mut(&mut self, id: FieldId) -> &mut FieldArray {
        &mut self.fields[id as usize]
    }

    pub fn ghost_depth(&self, id: FieldId) -> (usize, usize, usize) {
        self.ghosts[id as usize]
    }

    /// Memory extent of a field's backing array, ghost zones included.
    pub fn dims(&self, id: FieldId) -> (usize, usize, usize) {
        let g = self.ghosts[id as usize];
        (self.size.0 + 2 * g.0, self.size.1 + 2 * g.1, self.size.2 + 2 * g.2)
    }

    /// The interior selection of a field (every zone that is not a ghost).
    pub fn interior_slab(&self, id: FieldId) -> Slab {
        let g = self.ghosts[id as usize];
        Slab {
            start: g,
            count: self.size,
            shape: self.dims(id),
        }
    }

    /// Which of this block's faces lie along the domain boundary, compared
    /// within a small relative epsilon: `[axis][side]`, side 0 = lower.
    pub fn is_on_boundary(
        &self,
        domain_lower: (f64, f64, f64),
        domain_upper: (f64, f64, f64),
    ) -> [[bool; 2]; 3] {
        let close = |a: f64, b: f64, extent: f64| (a - b).abs() <= 1e-10 * extent.abs().max(1.0);

        let ex = domain_upper.0 - domain_lower.0;
        let ey = domain_upper.1 - domain_lower.1;
        let ez = domain_upper.2 - domain_lower.2;

        [
            [close(self.lower.0, domain_lower.0, ex), close(self.upper.0, domain_upper.0, ex)],
            [close(self.lower.1, domain_lower.1, ey), close(self.upper.1, domain_upper.1, ey)],
            [close(self.lower.2, domain_lower.2, ez), close(self.upper.2, domain_upper.2, ez)],
        ]
    }

    // ------------------------------------------------------------------------
    // Exchange epochs

    /// Whether a facet relation carries any data under the given per-axis
    /// depth: an axis with a nonzero facet component but zero depth has
    /// nothing to move.
    pub fn facet_carries_data(facet: (i32, i32, i32), depth: (usize, usize, usize)) -> bool {
        (facet.0 == 0 || depth.0 > 0) &&
        (facet.1 == 0 || depth.1 > 0) &&
        (facet.2 == 0 || depth.2 > 0)
    }

    /// The interior slab a block sends across one of its facets.
    pub fn send_slab(&self, id: FieldId, facet: (i32, i32, i32), depth: (usize, usize, usize)) -> Slab {
        let g = self.ghosts[id as usize];
        let axis = |f: i32, n: usize, g: usize, d: usize| match f {
            -1 => (g, d),
            0 => (g, n),
            1 => (g + n - d, d),
            _ => unreachable!("facet component out of range"),
        };
        let (sx, cx) = axis(facet.0, self.size.0, g.0, depth.0);
        let (sy, cy) = axis(facet.1, self.size.1, g.1, depth.1);
        let (sz, cz) = axis(facet.2, self.size.2, g.2, depth.2);
        Slab {
            start: (sx, sy, sz),
            count: (cx, cy, cz),
            shape: self.dims(id),
        }
    }

    /// The ghost slab a block fills from an arrival on one of its facets.
    pub fn recv_slab(&self, id: FieldId, facet: (i32, i32, i32), depth: (usize, usize, usize)) -> Slab {
        let g = self.ghosts[id as usize];
        let axis = |f: i32, n: usize, g: usize, d: usize| match f {
            -1 => (g - d, d),
            0 => (g, n),
            1 => (g + n, d),
            _ => unreachable!("facet component out of range"),
        };
        let (sx, cx) = axis(facet.0, self.size.0, g.0, depth.0);
        let (sy, cy) = axis(facet.1, self.size.1, g.1, depth.1);
        let (sz, cz) = axis(facet.2, self.size.2, g.2, depth.2);
        Slab {
            start: (sx, sy, sz),
            count: (cx, cy, cz),
            shape: self.dims(id),
        }
    }

    /// Begin an exchange epoch. Non-blocking; the scheduler routes the
    /// packed buffers and later arrivals. `expected` is the number of
    /// interior relations that will actually deliver data this epoch. Only
    /// one epoch may be in flight per block: overlapping epochs of
    /// different kinds would cross-deliver, so a second `start_refresh`
    /// before completion is a protocol violation.
    pub fn start_refresh(&mut self, spec: &RefreshSpec, expected: usize) -> Result<u64, Error> {
        if let Some(active) = &self.exchange {
            return Err(Error::protocol(
                self.index,
                active.epoch,
                format!("{} started a refresh with an epoch already in flight", self.name())));
        }

        self.epochs_started += 1;
        let epoch = self.epochs_started;

        self.exchange = Some(Exchange {
            epoch,
            spec: spec.clone(),
            expected,
            received: 0,
            synced: matches!(spec.sync(), SyncMode::NeighborCounted),
            seen: HashSet::new(),
            state: if expected == 0 { ExchangeState::Waiting } else { ExchangeState::Sending },
        });
        Ok(epoch)
    }

    pub fn exchange_state(&self) -> Option<ExchangeState> {
        self.exchange.as_ref().map(|e| e.state)
    }

    /// Whether the given epoch is in flight and has everything it was
    /// waiting for. Retired epochs answer false.
    pub fn exchange_complete_now(&self, epoch: u64) -> bool {
        match &self.exchange {
            Some(active) => active.epoch == epoch && active.is_complete(),
            None => false,
        }
    }

    /// Mark the send phase done; arrivals may already have landed in the
    /// meantime.
    pub fn sends_posted(&mut self) {
        if let Some(active) = &mut self.exchange {
            if active.state == ExchangeState::Sending {
                active.state = ExchangeState::Waiting
            }
        }
    }

    /// Pack one outgoing face buffer: for each field of the spec (stable,
    /// sorted order), a subheader of field id, precision tag, and value
    /// count, then the raw slab values.
    pub fn pack_face(&self, spec: &RefreshSpec, facet: (i32, i32, i32)) -> Vec<u8> {
        let mut out = Vec::new();
        wire::put_u32(&mut out, spec.fields().len() as u32);

        for &id in spec.fields() {
            let slab = self.send_slab(id, facet, spec.ghost_depth());
            let array = self.field(id);
            wire::put_u32(&mut out, id);
            out.push(array.precision().tag());
            wire::put_u64(&mut out, slab.len() as u64);
            array.pack(slab.offsets(), &mut out);
        }
        out
    }

    /// Accept one face arrival. Early arrivals (for an epoch this block has
    /// not started yet) are stashed; duplicates within an epoch, arrivals
    /// after completion, and arrivals for a dead epoch are fatal. Returns
    /// true when this arrival completes the epoch.
    pub fn deliver_face(&mut self, epoch: u64, face: Face, bytes: Vec<u8>) -> Result<bool, Error> {
        if epoch > self.epochs_started {
            self.stash.push((epoch, face, bytes));
            return Ok(false);
        }

        let name = self.name();
        let index = self.index;
        let active = match &mut self.exchange {
            Some(active) if active.epoch == epoch => active,
            _ => {
                return Err(Error::protocol(
                    index,
                    epoch,
                    format!("{} received a face buffer for a completed epoch", name)));
            }
        };

        if active.state == ExchangeState::Complete {
            return Err(Error::protocol(
                index,
                epoch,
                format!("{} received a face buffer after epoch completion", name)));
        }
        if !active.seen.insert(face) {
            return Err(Error::protocol(
                index,
                epoch,
                format!("{} received a duplicate face {:?} within one epoch", name, face)));
        }

        let spec = active.spec.clone();
        let facet = face.facet();
        self.unpack_face(&spec, facet, &bytes)?;

        let active = self.exchange.as_mut().unwrap();
        active.received += 1;
        if active.received > active.expected {
            return Err(Error::protocol(
                index,
                epoch,
                format!("{} received more face buffers than its neighbor count", name)));
        }
        Ok(active.is_complete())
    }

    /// Accept the global sync token of a barrier-mode epoch. Returns true
    /// when it completes the epoch.
    pub fn deliver_sync_token(&mut self, epoch: u64) -> Result<bool, Error> {
        let name = self.name();
        let index = self.index;
        let active = match &mut self.exchange {
            Some(active) if active.epoch == epoch => active,
            _ => {
                return Err(Error::protocol(
                    index,
                    epoch,
                    format!("{} received a sync token for an epoch not in flight", name)));
            }
        };
        if active.synced {
            return Err(Error::protocol(
                index,
                epoch,
                format!("{} received a duplicate sync token", name)));
        }
        active.synced = true;
        Ok(active.is_complete())
    }

    /// Retire a completed epoch. The continuation is fired by the caller
    /// exactly once, after this returns.
    pub fn finish_exchange(&mut self, epoch: u64) -> Result<(), Error> {
        match &mut self.exchange {
            Some(active) if active.epoch == epoch && active.is_complete() => {
                active.state = ExchangeState::Complete;
                self.exchange = None;
                Ok(())
            }
            _ => Err(Error::protocol(
                self.index,
                epoch,
                format!("{} asked to finish an incomplete epoch", self.name()))),
        }
    }

    /// Drain any arrivals stashed for the given epoch, for redelivery once
    /// the epoch has started.
    pub fn take_stashed(&mut self, epoch: u64) -> Vec<(Face, Vec<u8>)> {
        let mut out = Vec::new();
        let mut i = 0;
        while i != self.stash.len() {
            if self.stash[i].0 == epoch {
                let (_, face, bytes) = self.stash.remove(i);
                out.push((face, bytes));
            } else {
                i += 1;
            }
        }
        out
    }

    /// Next reduction episode id for this block. Episode numbering is a
    /// lockstep counter: every block walks the same sequence of episodes,
    /// so equal numbers refer to the same episode.
    pub fn next_reduction_episode(&mut self) -> u64 {
        self.reductions_started += 1;
        self.reductions_started
    }

    fn unpack_face(&mut self, spec: &RefreshSpec, facet: (i32, i32, i32), bytes: &[u8]) -> Result<(), Error> {
        let name = self.name();
        let index = self.index;
        let epoch = self.exchange.as_ref().map(|e| e.epoch).unwrap_or(0);
        let shape_error = |detail: String| Error::protocol(index, epoch, detail);

        let mut reader = wire::Reader::new(bytes);
        let count = reader
            .get_u32()
            .ok_or_else(|| shape_error(format!("{}: truncated face buffer header", name)))?;

        if count as usize != spec.fields().len() {
            return Err(shape_error(format!(
                "{}: face buffer carries {} fields, spec names {}",
                name, count, spec.fields().len())));
        }

        for &id in spec.fields() {
            let sent_id = reader
                .get_u32()
                .ok_or_else(|| shape_error(format!("{}: truncated field subheader", name)))?;
            if sent_id != id {
                return Err(shape_error(format!(
                    "{}: face buffer field order mismatch ({} vs {})", name, sent_id, id)));
            }

            let tag = reader
                .get_u8()
                .ok_or_else(|| shape_error(format!("{}: truncated precision tag", name)))?;
            let precision = Precision::from_tag(tag)?;
            if precision != self.field(id).precision() {
                return Err(Error::Config(format!(
                    "{}: precision mismatch on field id {} ({:?} sent, {:?} stored)",
                    name, id, precision, self.field(id).precision())));
            }

            let sent_len = reader
                .get_u64()
                .ok_or_else(|| shape_error(format!("{}: truncated slab length", name)))?;
            let slab = self.recv_slab(id, facet, spec.ghost_depth());
            if sent_len as usize != slab.len() {
                return Err(shape_error(format!(
                    "{}: slab shape mismatch on field id {} ({} sent, {} expected)",
                    name, id, sent_len, slab.len())));
            }

            let accumulate = spec.accumulate();
            let array = &mut self.fields[id as usize];
            array
                .unpack(slab.offsets(), &mut reader, accumulate)
                .ok_or_else(|| shape_error(format!("{}: face buffer shorter than its header claims", name)))?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Snapshots

    /// Serialize the block into a versioned snapshot. This is the explicit
    /// encode half of the relocation pair that replaces intrusive
    /// pack/unpack migration.
    pub fn encode_snapshot<W: Write>(&self, writer: W) -> Result<(), Error> {
        let snapshot = BlockSnapshot {
            version: SNAPSHOT_VERSION,
            index: self.index,
            level: self.level,
            lower: self.lower,
            upper: self.upper,
            size: self.size,
            cycle: self.cycle,
            time: self.time,
            dt: self.dt,
            fields: self.fields.clone(),
        };
        ciborium::ser::into_writer(&snapshot, writer)
            .map_err(|e| Error::Config(format!("snapshot encode failed: {}", e)))
    }

    /// Restore a block from a snapshot, checking the format version and
    /// that the field set agrees with the registry.
    pub fn decode_snapshot<R: Read>(reader: R, descr: &FieldDescr) -> Result<Self, Error> {
        let snapshot: BlockSnapshot = ciborium::de::from_reader(reader)
            .map_err(|e| Error::Config(format!("snapshot decode failed: {}", e)))?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::Config(format!(
                "snapshot version {} does not match {}", snapshot.version, SNAPSHOT_VERSION)));
        }
        if snapshot.fields.len() != descr.field_count() {
            return Err(Error::Config(format!(
                "snapshot carries {} fields, registry has {}",
                snapshot.fields.len(), descr.field_count())));
        }
        for (id, array) in snapshot.fields.iter().enumerate() {
            if array.precision() != descr.precision(id as FieldId) {
                return Err(Error::Config(format!(
                    "snapshot precision mismatch on field {:?}", descr.name(id as FieldId))));
            }
        }

        let ghosts = descr.all_fields().iter().map(|&id| descr.ghost_depth(id)).collect();
        Ok(Self {
            index: snapshot.index,
            level: snapshot.level,
            lower: snapshot.lower,
            upper: snapshot.upper,
            size: snapshot.size,
            cycle: snapshot.cycle,
            time: snapshot.time,
            dt: snapshot.dt,
            fields: snapshot.fields,
            ghosts,
            exchange: None,
            epochs_started: 0,
            reductions_started: 0,
            stash: Vec::new(),
        })
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct BlockSnapshot {
    version: u32,
    index: BlockIndex,
    level: u32,
    lower: (f64, f64, f64),
    upper: (f64, f64, f64),
    size: (usize, usize, usize),
    cycle: u64,
    time: f64,
    dt: f64,
    fields: Vec<FieldArray>,
}
