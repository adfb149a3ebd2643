use crate::error::Error;
use crate::wire;
use std::collections::HashMap;

/// Floating-point precision of one field. Every participating block must
/// agree on the precision of a field within one run; a sender/receiver
/// mismatch is a fatal configuration error, never negotiated. Quadruple
/// precision (`long double` in the ancestral codes) has no stable Rust
/// counterpart and is rejected at the wire level as an unsupported tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Precision {
    Single,
    Double,
}

impl Precision {
    pub fn size(self) -> usize {
        match self {
            Precision::Single => 4,
            Precision::Double => 8,
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            Precision::Single => 4,
            Precision::Double => 8,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, Error> {
        match tag {
            4 => Ok(Precision::Single),
            8 => Ok(Precision::Double),
            _ => Err(Error::Config(format!("unsupported precision tag {}", tag))),
        }
    }
}

/// Identifies a registered field. Ids are dense and stable for the life of
/// the registry.
pub type FieldId = u32;

struct FieldInfo {
    name: String,
    precision: Precision,
    ghost: (usize, usize, usize),
}

/// Registry of the fields every block in a run carries: name, precision,
/// and per-axis ghost depth. The registry is immutable once blocks have
/// been allocated from it.
pub struct FieldDescr {
    fields: Vec<FieldInfo>,
    by_name: HashMap<String, FieldId>,
}

impl FieldDescr {
    pub fn new() -> Self {
        Self {
            fields: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Register a field and return its id. Re-registering a name is a bug
    /// in the setup code.
    pub fn insert(&mut self, name: &str, precision: Precision, ghost: (usize, usize, usize)) -> FieldId {
        assert!(
            !self.by_name.contains_key(name),
            "field {:?} registered twice", name);

        let id = self.fields.len() as FieldId;
        self.fields.push(FieldInfo {
            name: name.to_string(),
            precision,
            ghost,
        });
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// Look up a field id by name; requesting an unregistered field is a
    /// configuration error.
    pub fn field_id(&self, name: &str) -> Result<FieldId, Error> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| Error::Config(format!("field {:?} is not registered", name)))
    }

    pub fn contains(&self, id: FieldId) -> bool {
        (id as usize) < self.fields.len()
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn name(&self, id: FieldId) -> &str {
        &self.fields[id as usize].name
    }

    pub fn precision(&self, id: FieldId) -> Precision {
        self.fields[id as usize].precision
    }

    pub fn ghost_depth(&self, id: FieldId) -> (usize, usize, usize) {
        self.fields[id as usize].ghost
    }

    /// Ids of every registered field, in registration order.
    pub fn all_fields(&self) -> Vec<FieldId> {
        (0..self.fields.len() as FieldId).collect()
    }
}

impl Default for FieldDescr {
    fn default() -> Self {
        Self::new()
    }
}

/// Dense storage for one field on one block, ghost padding included. The
/// layout is x-fastest: `i = ix + mx * (iy + my * iz)`.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub enum FieldArray {
    Single(Vec<f32>),
    Double(Vec<f64>),
}

impl FieldArray {
    pub fn zeros(precision: Precision, len: usize) -> Self {
        match precision {
            Precision::Single => FieldArray::Single(vec![0.0; len]),
            Precision::Double => FieldArray::Double(vec![0.0; len]),
        }
    }

    pub fn precision(&self) -> Precision {
        match self {
            FieldArray::Single(_) => Precision::Single,
            FieldArray::Double(_) => Precision::Double,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            FieldArray::Single(v) => v.len(),
            FieldArray::Double(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, i: usize) -> f64 {
        match self {
            FieldArray::Single(v) => v[i] as f64,
            FieldArray::Double(v) => v[i],
        }
    }

    pub fn set(&mut self, i: usize, value: f64) {
        match self {
            FieldArray::Single(v) => v[i] = value as f32,
            FieldArray::Double(v) => v[i] = value,
        }
    }

    pub fn add(&mut self, i: usize, value: f64) {
        match self {
            FieldArray::Single(v) => v[i] += value as f32,
            FieldArray::Double(v) => v[i] += value,
        }
    }

    /// Pack the values at the given offsets into a byte buffer, native
    /// width, little-endian, in offset order.
    pub fn pack<I>(&self, offsets: I, out: &mut Vec<u8>)
    where
        I: Iterator<Item = usize>,
    {
        match self {
            FieldArray::Single(v) => {
                for i in offsets {
                    out.extend_from_slice(&v[i].to_le_bytes())
                }
            }
            FieldArray::Double(v) => {
                for i in offsets {
                    out.extend_from_slice(&v[i].to_le_bytes())
                }
            }
        }
    }

    /// Unpack values from a wire reader into the given offsets, either
    /// overwriting or accumulating. Returns `None` if the reader runs dry
    /// (a shape mismatch on the sender side).
    pub fn unpack<I>(&mut self, offsets: I, reader: &mut wire::Reader, accumulate: bool) -> Option<()>
    where
        I: Iterator<Item = usize>,
    {
        match self {
            FieldArray::Single(v) => {
                for i in offsets {
                    let bytes = reader.get_slice(4)?;
                    let value = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                    if accumulate {
                        v[i] += value
                    } else {
                        v[i] = value
                    }
                }
            }
            FieldArray::Double(v) => {
                for i in offsets {
                    let bytes = reader.get_slice(8)?;
                    let value = f64::from_le_bytes([
                        bytes[0], bytes[1], bytes[2], bytes[3],
                        bytes[4], bytes[5], bytes[6], bytes[7],
                    ]);
                    if accumulate {
                        v[i] += value
                    } else {
                        v[i] = value
                    }
                }
            }
        }
        Some(())
    }
}

/// Typed access into a `FieldArray`, so stencil and vector kernels can run
/// at the field's native precision rather than converting every element
/// through `f64`.
pub trait Scalar: Copy + PartialOrd + std::ops::Add<Output = Self> + std::ops::Sub<Output = Self> + std::ops::Mul<Output = Self> {
    const ZERO: Self;

    fn from_f64(value: f64) -> Self;

    fn to_f64(self) -> f64;

    fn values(array: &FieldArray) -> Result<&[Self], Error>;

    fn values_mut(array: &mut FieldArray) -> Result<&mut [Self], Error>;
}

impl Scalar for f32 {
    const ZERO: Self = 0.0;

    fn from_f64(value: f64) -> Self {
        value as f32
    }

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn values(array: &FieldArray) -> Result<&[Self], Error> {
        match array {
            FieldArray::Single(v) => Ok(v),
            _ => Err(Error::Config("expected a single-precision field".to_string())),
        }
    }

    fn values_mut(array: &mut FieldArray) -> Result<&mut [Self], Error> {
        match array {
            FieldArray::Single(v) => Ok(v),
            _ => Err(Error::Config("expected a single-precision field".to_string())),
        }
    }
}

impl Scalar for f64 {
    const ZERO: Self = 0.0;

    fn from_f64(value: f64) -> Self {
        value
    }

    fn to_f64(self) -> f64 {
        self
    }

    fn values(array: &FieldArray) -> Result<&[Self], Error> {
        match array {
            FieldArray::Double(v) => Ok(v),
            _ => Err(Error::Config("expected a double-precision field".to_string())),
        }
    }

    fn values_mut(array: &mut FieldArray) -> Result<&mut [Self], Error> {
        match array {
            FieldArray::Double(v) => Ok(v),
            _ => Err(Error::Config("expected a double-precision field".to_string())),
        }
    }
}

// ============================================================================
#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn registry_assigns_dense_ids() {
        let mut descr = FieldDescr::new();
        let d = descr.insert("density", Precision::Double, (1, 1, 1));
        let p = descr.insert("potential", Precision::Double, (1, 1, 1));
        assert_eq!((d, p), (0, 1));
        assert_eq!(descr.field_id("potential").unwrap(), 1);
        assert_eq!(descr.name(0), "density");
        assert!(descr.field_id("pressure").is_err());
    }

    #[test]
    fn unsupported_precision_tag_is_a_config_error() {
        assert!(Precision::from_tag(16).is_err());
        assert_eq!(Precision::from_tag(4).unwrap(), Precision::Single);
    }

    #[test]
    fn pack_unpack_is_bit_identical() {
        let mut src = FieldArray::zeros(Precision::Double, 8);
        for i in 0..8 {
            src.set(i, 0.1 * i as f64 + 1.0 / 3.0)
        }

        let mut bytes = Vec::new();
        src.pack(2..6, &mut bytes);

        let mut dst = FieldArray::zeros(Precision::Double, 8);
        let mut reader = wire::Reader::new(&bytes);
        dst.unpack(2..6, &mut reader, false).unwrap();

        for i in 2..6 {
            assert_eq!(dst.get(i).to_bits(), src.get(i).to_bits());
        }
        assert_eq!(dst.get(0), 0.0);
    }

    #[test]
    fn unpack_accumulates_when_asked() {
        let mut src = FieldArray::zeros(Precision::Single, 4);
        src.set(0, 2.0);

        let mut bytes = Vec::new();
        src.pack(0..1, &mut bytes);

        let mut dst = FieldArray::zeros(Precision::Single, 4);
        dst.set(0, 1.0);
        let mut reader = wire::Reader::new(&bytes);
        dst.unpack(0..1, &mut reader, true).unwrap();
        assert_eq!(dst.get(0), 3.0);
    }

    #[test]
    fn unpack_detects_short_buffers() {
        let bytes = vec![0u8; 12];
        let mut dst = FieldArray::zeros(Precision::Double, 4);
        let mut reader = wire::Reader::new(&bytes);
        assert!(dst.unpack(0..2, &mut reader, false).is_none());
    }
}
