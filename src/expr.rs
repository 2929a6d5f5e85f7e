use crate::{*, error::*, types::*, memory::*, interp::*, registry::*, settings::*, log::*};
use std::ops::Range;

// A byte array holding a value that was read from memory or computed. Knows its length.
// Integers are little-endian, zero-extended to whatever the type size is.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValueBlob(Vec<u8>);

impl ValueBlob {
    // 8-byte value. Most of the time used for integers and pointers.
    pub fn new(v: usize) -> Self { Self(v.to_le_bytes().to_vec()) }

    pub fn zeroed(bytes: usize) -> Self { Self(vec![0; bytes]) }
    pub fn from_vec(v: Vec<u8>) -> Self { Self(v) }
    pub fn from_slice(s: &[u8]) -> Self { Self(s.to_vec()) }

    pub fn len(&self) -> usize { self.0.len() }
    pub fn as_slice(&self) -> &[u8] { &self.0 }
    pub fn as_mut_slice(&mut self) -> &mut [u8] { &mut self.0 }
    pub fn resize(&mut self, bytes: usize) { self.0.resize(bytes, 0); }

    // First min(len, 8) bytes, zero-extended.
    pub fn get_usize(&self) -> usize {
        let mut a = [0u8; 8];
        let n = self.0.len().min(8);
        a[..n].copy_from_slice(&self.0[..n]);
        usize::from_le_bytes(a)
    }

    pub fn get_usize_at(&self, offset: usize) -> Result<usize> {
        if offset + 8 > self.0.len() {
            return err!(Internal, "blob offset out of bounds: {}+8 > {}", offset, self.0.len());
        }
        let mut a = [0u8; 8];
        a.copy_from_slice(&self.0[offset..offset+8]);
        Ok(usize::from_le_bytes(a))
    }

    pub fn bit_range(&self, bit_offset: usize, bit_size: usize) -> Result<Self> {
        let byte_end = (bit_offset + bit_size + 7)/8;
        if byte_end > self.0.len() {
            return err!(Runtime, "bit range out of bounds: {}+{} > {}*8", bit_offset, bit_size, self.0.len());
        }
        let start = bit_offset/8;
        let shift = (bit_offset & 7) as u32;
        let mut res = vec![0u8; (bit_size + 7)/8];
        for i in 0..res.len() {
            let lo = self.0[start + i] >> shift;
            let hi = if shift != 0 && start + i + 1 < self.0.len() { self.0[start + i + 1] << (8 - shift) } else { 0 };
            res[i] = lo | hi;
        }
        if bit_size & 7 != 0 {
            let last = res.len() - 1;
            res[last] &= (1u8 << (bit_size & 7) as u32) - 1;
        }
        Ok(Self(res))
    }

    pub fn byte_range(&self, r: Range<usize>) -> Result<Self> {
        if r.end > self.0.len() || r.start > r.end {
            return err!(Runtime, "blob slice out of bounds: [{}, {}) > {}", r.start, r.end, self.0.len());
        }
        Ok(Self::from_slice(&self.0[r]))
    }
}

// For values whose address is known, we defer the dereferencing just in case a user expression takes address again ('&' operator),
// and so that huge arrays aren't read in full.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddrOrValueBlob {
    Addr(usize),
    Blob(ValueBlob),
}
impl Default for AddrOrValueBlob { fn default() -> Self { AddrOrValueBlob::Blob(ValueBlob::new(0)) } }

impl AddrOrValueBlob {
    pub fn into_value(self, bytes: usize, memory: &mut CachedMemReader) -> Result<ValueBlob> {
        Ok(match self {
            Self::Blob(b) => {
                if b.len() < bytes {
                    return err!(Runtime, "value too short: {} < {}", b.len(), bytes);
                }
                b
            }
            Self::Addr(a) => {
                let mut b = ValueBlob::zeroed(bytes);
                memory.read(a, b.as_mut_slice())?;
                b
            }
        })
    }

    pub fn addr(&self) -> Option<usize> { match self { Self::Addr(a) => Some(*a), _ => None } }
    pub fn blob_ref(&self) -> Option<&ValueBlob> { match self { Self::Blob(b) => Some(b), _ => None } }
}

#[derive(Debug, Clone)]
pub struct Value {
    pub val: AddrOrValueBlob,
    pub type_: TypeIdx,
}

impl Value {
    pub fn at(addr: usize, type_: TypeIdx) -> Self { Self {val: AddrOrValueBlob::Addr(addr), type_} }
    pub fn blob(blob: ValueBlob, type_: TypeIdx) -> Self { Self {val: AddrOrValueBlob::Blob(blob), type_} }
}

// State of one pipeline run (one watch expression, from resolution to the visible rows).
// Not shared between threads; everything shared is behind the references.
pub struct EvalContext<'a> {
    pub types: Types,
    pub memory: CachedMemReader<'a>,
    pub evaluator: &'a dyn ExpressionEvaluator,
    pub registry: &'a RuleRegistry,
    pub settings: &'a Settings,
    pub log: Log,
}

impl<'a> EvalContext<'a> {
    pub fn new(types: Types, memory: CachedMemReader<'a>, evaluator: &'a dyn ExpressionEvaluator, registry: &'a RuleRegistry, settings: &'a Settings) -> Self {
        Self {types, memory, evaluator, registry, settings, log: Log::new()}
    }

    // Evaluates an expression with the configured evaluator. Nothing about the current node's rules is visible to it.
    pub fn eval_expression(&mut self, text: &str) -> Result<Value> {
        let evaluator = self.evaluator;
        evaluator.eval(text, self)
    }

}

// Pointers come from debuggee memory and may be garbage. An address that wraps around is unreadable, like any other bad address.
pub fn offset_addr(addr: usize, offset: usize) -> Result<usize> {
    match addr.checked_add(offset) {
        Some(a) => Ok(a),
        None => err!(Unreadable, "bad address 0x{:x} + 0x{:x}", addr, offset),
    }
}

pub fn element_addr(base: usize, idx: usize, stride: usize) -> Result<usize> {
    match idx.checked_mul(stride) {
        Some(off) => offset_addr(base, off),
        None => err!(Unreadable, "bad address 0x{:x} + {}*{}", base, idx, stride),
    }
}

pub fn get_struct_field(val: &AddrOrValueBlob, field: &StructField, types: &Types, memory: &mut CachedMemReader) -> Result<AddrOrValueBlob> {
    let mut type_bytes = types.get(field.type_).size;
    let field_bits = types.field_bit_size(field);
    if field_bits == 0 {
        return Ok(AddrOrValueBlob::Blob(ValueBlob::new(0)));
    }
    if type_bytes == 0 {
        type_bytes = (field_bits + 7)/8;
    }
    let mut blob = match val {
        AddrOrValueBlob::Addr(addr) => {
            if type_bytes * 8 == field_bits && field.bit_offset % 8 == 0 {
                return Ok(AddrOrValueBlob::Addr(offset_addr(*addr, field.bit_offset/8)?));
            }
            if field_bits > 1 << 30 {
                return err!(Sanity, "field {} is suspiciously big: {} bits", field.name, field_bits);
            }
            let start_byte = field.bit_offset/8;
            let end = field.bit_offset + field_bits;
            let blob = AddrOrValueBlob::Addr(offset_addr(*addr, start_byte)?).into_value((end - start_byte*8 + 7)/8, memory)?;
            blob.bit_range(field.bit_offset - start_byte*8, field_bits)?
        }
        AddrOrValueBlob::Blob(blob) => match blob.bit_range(field.bit_offset, field_bits) {
            Ok(x) => x,
            Err(_) => return err!(Runtime, "field {} bit range out of bounds: {}+{} vs {}*8", field.name, field.bit_offset, field_bits, blob.len()),
        }
    };
    blob.resize(type_bytes);
    Ok(AddrOrValueBlob::Blob(blob))
}

pub fn sign_extend(x: usize, size: usize) -> usize {
    if size == 0 || size >= 8 {
        return x;
    }
    let shift = (64 - size*8) as u32;
    (((x << shift) as isize) >> shift) as usize
}

// Integer, enum, bool, char or pointer value as 8 bytes, sign-extended if the type is signed.
// With `byte_swap`, the value's bytes are reversed before interpreting; memory is untouched.
pub fn read_integer(v: &Value, byte_swap: bool, types: &Types, memory: &mut CachedMemReader) -> Result<usize> {
    let t = types.get(v.type_);
    let (size, signed) = match &t.t {
        Type::Primitive(p) if p.intersects(PrimitiveFlags::FLOAT | PrimitiveFlags::UNSPECIFIED) => return err!(TypeMismatch, "not an integer"),
        Type::Primitive(p) => (t.size, p.contains(PrimitiveFlags::SIGNED)),
        Type::Enum(e) => (t.size, types.get(e.type_).t.as_primitive().map_or(false, |p| p.contains(PrimitiveFlags::SIGNED))),
        Type::Pointer(_) => (8, false),
        _ => return err!(TypeMismatch, "expected integer, got {}", t.t.kind_name()),
    };
    if size == 0 || size > 8 {
        return err!(NotImplemented, "{}-byte integers not supported", size);
    }
    let mut blob = v.val.clone().into_value(size, memory)?;
    let bytes = &mut blob.as_mut_slice()[..size];
    if byte_swap {
        bytes.reverse();
    }
    let mut a = [0u8; 8];
    a[..size].copy_from_slice(bytes);
    let x = usize::from_le_bytes(a);
    Ok(if signed { sign_extend(x, size) } else { x })
}

pub fn read_float(v: &Value, byte_swap: bool, types: &Types, memory: &mut CachedMemReader) -> Result<f64> {
    let size = types.get(v.type_).size;
    let mut blob = v.val.clone().into_value(size, memory)?;
    let bytes = &mut blob.as_mut_slice()[..size];
    if byte_swap {
        bytes.reverse();
    }
    Ok(match size {
        4 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
        8 => { let mut a = [0u8; 8]; a.copy_from_slice(bytes); f64::from_le_bytes(a) }
        _ => return err!(NotImplemented, "{}-byte floats not supported", size),
    })
}

// Value of the pointed-to object, without reading it.
pub fn deref_pointer(v: &Value, types: &Types, memory: &mut CachedMemReader) -> Result<Value> {
    let p = match &types.get(v.type_).t {
        Type::Pointer(p) => p.type_,
        _ => return err!(TypeMismatch, "can't dereference {}", types.type_name(v.type_)),
    };
    let addr = read_integer(v, false, types, memory)?;
    Ok(Value::at(addr, p))
}

// Pointer to first element and number of elements.
pub fn read_slice(v: &Value, memory: &mut CachedMemReader) -> Result<(usize, usize)> {
    let blob = v.val.clone().into_value(16, memory)?;
    Ok((blob.get_usize_at(0)?, blob.get_usize_at(8)?))
}
