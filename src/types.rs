use crate::{*, error::*};
use std::{collections::HashMap, sync::Arc, fmt::Write};
use bitflags::bitflags;

// Types come from an external type-info provider (debug symbols loader) as an immutable TypeSnapshot, shared by all
// concurrently evaluated watches through an Arc. Rules like array(N) or slice need to create new types on the fly;
// those go into a per-run overlay (Types), so the snapshot is never mutated after it's built.
// TypeIdx indexes the snapshot first, then the overlay.

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct TypeIdx(pub usize);

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PrimitiveFlags: u8 {
        const SIGNED = 0x1;
        const FLOAT = 0x2;
        // 1-byte char. Arrays of these are shown as strings.
        const CHAR = 0x4;
        const BOOL = 0x8;
        const UNSPECIFIED = 0x10; // void
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PointerType {
    pub type_: TypeIdx,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ArrayFlags: u8 {
        // Length is known. Otherwise we pretend the length is 1, so that at least the first element is visible.
        const LEN_KNOWN = 0x1;
        // Print as string even if element type is not a char.
        const UTF_STRING = 0x2;
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ArrayType {
    pub flags: ArrayFlags,
    pub type_: TypeIdx,
    pub stride: usize, // 0 means type_'s size
    pub len: usize,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct SliceFlags: u8 {
        const UTF_STRING = 0x2;
    }
}

// Always 16 bytes: start address (in debuggee's address space) and number of elements.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SliceType {
    pub flags: SliceFlags,
    pub type_: TypeIdx,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct FieldFlags: u8 {
        // If bit_size was assigned (bitfield). Otherwise use type_'s size.
        const SIZE_KNOWN = 0x1;
        const ARTIFICIAL = 0x2;
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StructField {
    pub name: String,
    pub flags: FieldFlags,
    pub bit_offset: usize,
    pub bit_size: usize,
    pub type_: TypeIdx,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct StructFlags: u8 {
        const UNION = 0x1;
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct StructType {
    pub flags: StructFlags,
    pub fields: Vec<StructField>,
}
impl StructType {
    pub fn field_by_name(&self, name: &str) -> Option<&StructField> { self.fields.iter().find(|f| f.name == name) }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Enumerand {
    pub name: String,
    pub value: usize, // if type_ is signed, sign-extended to 8 bytes
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EnumType {
    pub enumerands: Vec<Enumerand>,
    pub type_: TypeIdx,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    Unknown,
    Primitive(PrimitiveFlags),
    Pointer(PointerType),
    Array(ArrayType),
    Struct(StructType),
    Enum(EnumType),
    // Pointer + count. Produced by the slice rule; things like Rust slices or std::span are structs in debug info.
    Slice(SliceType),
}
impl Type {
    pub fn as_primitive(&self) -> Option<PrimitiveFlags> { match self { &Type::Primitive(f) => Some(f), _ => None } }
    pub fn as_pointer(&self) -> Option<&PointerType> { match self { Type::Pointer(p) => Some(p), _ => None } }
    pub fn as_array(&self) -> Option<&ArrayType> { match self { Type::Array(a) => Some(a), _ => None } }
    pub fn as_struct(&self) -> Option<&StructType> { match self { Type::Struct(s) => Some(s), _ => None } }
    pub fn as_slice(&self) -> Option<&SliceType> { match self { Type::Slice(s) => Some(s), _ => None } }
    pub fn is_composite(&self) -> bool { match self { Type::Struct(_) | Type::Array(_) | Type::Slice(_) => true, _ => false } }
    pub fn is_integral(&self) -> bool { match self { Type::Primitive(p) => !p.intersects(PrimitiveFlags::FLOAT | PrimitiveFlags::UNSPECIFIED), Type::Enum(_) => true, _ => false } }
    pub fn kind_name(&self) -> &'static str {
        match self {
            Type::Unknown => "unknown",
            Type::Primitive(_) => "primitive type",
            Type::Pointer(_) => "pointer",
            Type::Array(_) => "array",
            Type::Slice(s) if s.flags.contains(SliceFlags::UTF_STRING) => "string",
            Type::Slice(_) => "slice",
            Type::Struct(s) if s.flags.contains(StructFlags::UNION) => "union",
            Type::Struct(_) => "struct",
            Type::Enum(_) => "enum",
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct TypeFlags: u8 {
        // The symbols had type declaration but no definition.
        const DECLARATION = 0x1;
        const BUILTIN = 0x2;
    }
}

#[derive(Clone, Debug)]
pub struct TypeInfo {
    pub name: String, // empty means anonymous
    pub size: usize,
    pub align: usize,
    pub flags: TypeFlags,
    pub t: Type,
}
impl Default for TypeInfo { fn default() -> Self { Self {name: String::new(), size: 0, align: 1, flags: TypeFlags::empty(), t: Type::Unknown} } }

#[derive(Clone, Copy, Debug)]
pub struct BuiltinTypes {
    pub unknown: TypeIdx,
    pub void: TypeIdx,
    pub bool_: TypeIdx,
    pub char8: TypeIdx,
    pub u8_: TypeIdx,
    pub u16_: TypeIdx,
    pub u32_: TypeIdx,
    pub u64_: TypeIdx,
    pub i8_: TypeIdx,
    pub i16_: TypeIdx,
    pub i32_: TypeIdx,
    pub i64_: TypeIdx,
    pub f32_: TypeIdx,
    pub f64_: TypeIdx,
}

fn pointer_info(target: TypeIdx) -> TypeInfo {
    TypeInfo {size: 8, align: 8, t: Type::Pointer(PointerType {type_: target}), ..Default::default()}
}

fn array_info(elem: &TypeInfo, elem_idx: TypeIdx, len: Option<usize>, extra_flags: ArrayFlags) -> TypeInfo {
    let mut flags = extra_flags;
    if len.is_some() {
        flags.insert(ArrayFlags::LEN_KNOWN);
    }
    let len = len.unwrap_or(1);
    TypeInfo {size: elem.size.saturating_mul(len), align: elem.align, t: Type::Array(ArrayType {flags, type_: elem_idx, stride: 0, len}), ..Default::default()}
}

fn align_up(x: usize, align: usize) -> usize { (x + align - 1) / align * align }

// The immutable part: what the type-info provider loaded.
pub struct TypeSnapshot {
    types: Vec<TypeInfo>,
    by_name: HashMap<String, TypeIdx>,
    pointers: HashMap<TypeIdx, TypeIdx>,
    pub builtins: BuiltinTypes,
    pub version: u64,
}

impl TypeSnapshot {
    pub fn new() -> Self {
        let u = TypeIdx(0);
        let mut s = Self {types: Vec::new(), by_name: HashMap::new(), pointers: HashMap::new(), builtins: BuiltinTypes {unknown: u, void: u, bool_: u, char8: u, u8_: u, u16_: u, u32_: u, u64_: u, i8_: u, i16_: u, i32_: u, i64_: u, f32_: u, f64_: u}, version: 0};
        let b = BuiltinTypes {
            unknown: s.add(TypeInfo {name: "<unknown>".to_string(), flags: TypeFlags::BUILTIN, ..Default::default()}),
            void: s.add_primitive("void", 0, PrimitiveFlags::UNSPECIFIED),
            bool_: s.add_primitive("bool", 1, PrimitiveFlags::BOOL),
            char8: s.add_primitive("char", 1, PrimitiveFlags::CHAR | PrimitiveFlags::SIGNED),
            u8_: s.add_primitive("u8", 1, PrimitiveFlags::empty()),
            u16_: s.add_primitive("u16", 2, PrimitiveFlags::empty()),
            u32_: s.add_primitive("u32", 4, PrimitiveFlags::empty()),
            u64_: s.add_primitive("u64", 8, PrimitiveFlags::empty()),
            i8_: s.add_primitive("i8", 1, PrimitiveFlags::SIGNED),
            i16_: s.add_primitive("i16", 2, PrimitiveFlags::SIGNED),
            i32_: s.add_primitive("i32", 4, PrimitiveFlags::SIGNED),
            i64_: s.add_primitive("i64", 8, PrimitiveFlags::SIGNED),
            f32_: s.add_primitive("f32", 4, PrimitiveFlags::FLOAT | PrimitiveFlags::SIGNED),
            f64_: s.add_primitive("f64", 8, PrimitiveFlags::FLOAT | PrimitiveFlags::SIGNED),
        };
        s.builtins = b;
        // C spellings.
        for (alias, t) in [("int", b.i32_), ("unsigned", b.u32_), ("long", b.i64_), ("short", b.i16_), ("float", b.f32_), ("double", b.f64_), ("int32_t", b.i32_), ("uint32_t", b.u32_), ("int64_t", b.i64_), ("uint64_t", b.u64_), ("uint8_t", b.u8_), ("int8_t", b.i8_), ("size_t", b.u64_), ("usize", b.u64_), ("isize", b.i64_)] {
            s.by_name.insert(alias.to_string(), t);
        }
        s
    }

    pub fn len(&self) -> usize { self.types.len() }

    pub fn get(&self, idx: TypeIdx) -> &TypeInfo { &self.types[idx.0] }

    pub fn find_by_name(&self, name: &str) -> Option<TypeIdx> { self.by_name.get(name).copied() }

    // If the name is already taken, the type is still added but can't be looked up by name.
    pub fn add(&mut self, info: TypeInfo) -> TypeIdx {
        let idx = TypeIdx(self.types.len());
        if !info.name.is_empty() && !self.by_name.contains_key(&info.name) {
            self.by_name.insert(info.name.clone(), idx);
        }
        self.types.push(info);
        idx
    }

    pub fn add_primitive(&mut self, name: &str, size: usize, flags: PrimitiveFlags) -> TypeIdx {
        self.add(TypeInfo {name: name.to_string(), size, align: size.max(1), flags: TypeFlags::BUILTIN, t: Type::Primitive(flags)})
    }

    pub fn add_pointer(&mut self, target: TypeIdx) -> TypeIdx {
        if let Some(&p) = self.pointers.get(&target) {
            return p;
        }
        let p = self.add(pointer_info(target));
        self.pointers.insert(target, p);
        p
    }

    pub fn add_array(&mut self, elem: TypeIdx, len: Option<usize>) -> TypeIdx {
        let info = array_info(self.get(elem), elem, len, ArrayFlags::empty());
        self.add(info)
    }

    pub fn add_enum(&mut self, name: &str, underlying: TypeIdx, items: &[(&str, usize)]) -> TypeIdx {
        let (size, align) = (self.get(underlying).size, self.get(underlying).align);
        let enumerands = items.iter().map(|(n, v)| Enumerand {name: n.to_string(), value: *v}).collect();
        self.add(TypeInfo {name: name.to_string(), size, align, flags: TypeFlags::empty(), t: Type::Enum(EnumType {enumerands, type_: underlying})})
    }

    // Struct without definition yet. Lets self-referential types point to themselves before their layout is known.
    pub fn declare_struct(&mut self, name: &str) -> TypeIdx {
        self.add(TypeInfo {name: name.to_string(), flags: TypeFlags::DECLARATION, t: Type::Struct(StructType::default()), ..Default::default()})
    }

    // Natural C layout.
    pub fn define_struct(&mut self, idx: TypeIdx, fields: &[(&str, TypeIdx)]) {
        let (mut offset, mut align) = (0usize, 1usize);
        let mut out: Vec<StructField> = Vec::new();
        for &(name, t) in fields {
            let ti = self.get(t);
            offset = align_up(offset, ti.align);
            align = align.max(ti.align);
            out.push(StructField {name: name.to_string(), flags: FieldFlags::empty(), bit_offset: offset * 8, bit_size: ti.size * 8, type_: t});
            offset += ti.size;
        }
        self.define_struct_fields(idx, align_up(offset, align), align, out);
    }

    pub fn define_struct_fields(&mut self, idx: TypeIdx, size: usize, align: usize, fields: Vec<StructField>) {
        let t = &mut self.types[idx.0];
        t.size = size;
        t.align = align;
        t.flags.remove(TypeFlags::DECLARATION);
        t.t = Type::Struct(StructType {flags: StructFlags::empty(), fields});
    }

    pub fn add_struct(&mut self, name: &str, fields: &[(&str, TypeIdx)]) -> TypeIdx {
        let idx = self.declare_struct(name);
        self.define_struct(idx, fields);
        idx
    }
}

// Snapshot + types created during one pipeline run.
#[derive(Clone)]
pub struct Types {
    pub snapshot: Arc<TypeSnapshot>,
    local: Vec<TypeInfo>,
    local_pointers: HashMap<TypeIdx, TypeIdx>,
    local_arrays: HashMap<(TypeIdx, usize), TypeIdx>,
}

impl Types {
    pub fn new(snapshot: Arc<TypeSnapshot>) -> Self { Self {snapshot, local: Vec::new(), local_pointers: HashMap::new(), local_arrays: HashMap::new()} }

    pub fn builtins(&self) -> BuiltinTypes { self.snapshot.builtins }

    pub fn num_local_types(&self) -> usize { self.local.len() }

    pub fn get(&self, idx: TypeIdx) -> &TypeInfo {
        let n = self.snapshot.len();
        if idx.0 < n { self.snapshot.get(idx) } else { &self.local[idx.0 - n] }
    }

    pub fn add(&mut self, info: TypeInfo) -> TypeIdx {
        self.local.push(info);
        TypeIdx(self.snapshot.len() + self.local.len() - 1)
    }

    pub fn find_by_name(&self, name: &str) -> Option<TypeIdx> { self.snapshot.find_by_name(name) }

    pub fn add_pointer(&mut self, target: TypeIdx) -> TypeIdx {
        if let Some(&p) = self.snapshot.pointers.get(&target) {
            return p;
        }
        if let Some(&p) = self.local_pointers.get(&target) {
            return p;
        }
        let p = self.add(pointer_info(target));
        self.local_pointers.insert(target, p);
        p
    }

    pub fn add_array(&mut self, elem: TypeIdx, len: Option<usize>, extra_flags: ArrayFlags) -> TypeIdx {
        let key = (elem, len.unwrap_or(usize::MAX));
        if extra_flags.is_empty() {
            if let Some(&a) = self.local_arrays.get(&key) {
                return a;
            }
        }
        let info = array_info(self.get(elem), elem, len, extra_flags);
        let a = self.add(info);
        if extra_flags.is_empty() {
            self.local_arrays.insert(key, a);
        }
        a
    }

    pub fn add_slice(&mut self, elem: TypeIdx, flags: SliceFlags) -> TypeIdx {
        self.add(TypeInfo {size: 16, align: 8, t: Type::Slice(SliceType {flags, type_: elem}), ..Default::default()})
    }

    pub fn field_bit_size(&self, f: &StructField) -> usize {
        if f.flags.contains(FieldFlags::SIZE_KNOWN) { f.bit_size } else { self.get(f.type_).size * 8 }
    }

    // Element type and stride of an array, slice, or pointer.
    pub fn element_layout(&self, t: TypeIdx) -> Option<(TypeIdx, usize)> {
        match &self.get(t).t {
            Type::Array(a) => Some((a.type_, if a.stride != 0 {a.stride} else {self.get(a.type_).size})),
            Type::Slice(s) => Some((s.type_, self.get(s.type_).size)),
            Type::Pointer(p) => Some((p.type_, self.get(p.type_).size)),
            _ => None,
        }
    }

    // Accepts `T`, `T*`, `*T`, `T[N]`, `[T; N]`, with optional `const`/`struct` in front.
    pub fn parse_type_name(&mut self, text: &str) -> Result<TypeIdx> {
        self.parse_type_name_recurse(text, 0)
    }

    fn parse_type_name_recurse(&mut self, text: &str, depth: usize) -> Result<TypeIdx> {
        if depth > 32 {
            return err!(Syntax, "type name too deeply nested: '{}'", text);
        }
        let s = text.trim();
        if s.is_empty() {
            return err!(Syntax, "expected type name");
        }
        if let Some(rest) = s.strip_prefix('*') {
            let t = self.parse_type_name_recurse(rest, depth + 1)?;
            return Ok(self.add_pointer(t));
        }
        if let Some(rest) = s.strip_suffix('*') {
            let t = self.parse_type_name_recurse(rest, depth + 1)?;
            return Ok(self.add_pointer(t));
        }
        if s.starts_with('[') && s.ends_with(']') {
            let inner = &s[1..s.len()-1];
            let Some(semi) = inner.rfind(';') else { return err!(Syntax, "expected '[T; N]', got '{}'", s) };
            let len: usize = inner[semi+1..].trim().parse()?;
            let t = self.parse_type_name_recurse(&inner[..semi], depth + 1)?;
            return Ok(self.add_array(t, Some(len), ArrayFlags::empty()));
        }
        if s.ends_with(']') {
            let Some(open) = s.rfind('[') else { return err!(Syntax, "unbalanced ']' in '{}'", s) };
            let len: usize = s[open+1..s.len()-1].trim().parse()?;
            let t = self.parse_type_name_recurse(&s[..open], depth + 1)?;
            return Ok(self.add_array(t, Some(len), ArrayFlags::empty()));
        }
        for prefix in ["const ", "struct ", "enum ", "union "] {
            if let Some(rest) = s.strip_prefix(prefix) {
                return self.parse_type_name_recurse(rest, depth + 1);
            }
        }
        match self.find_by_name(s) {
            Some(t) => Ok(t),
            None => err!(NoType, "unknown type '{}'", s),
        }
    }

    pub fn type_name(&self, t: TypeIdx) -> String {
        let mut s = String::new();
        self.print_type_name(t, &mut s, 0);
        s
    }

    pub fn print_type_name(&self, t: TypeIdx, out: &mut String, recursion_depth: usize) {
        if recursion_depth > 32 {
            out.push_str("…");
            return;
        }
        let ti = self.get(t);
        match &ti.t {
            Type::Pointer(p) => {
                out.push('*');
                self.print_type_name(p.type_, out, recursion_depth + 1);
            }
            Type::Array(a) => {
                out.push('[');
                self.print_type_name(a.type_, out, recursion_depth + 1);
                if a.flags.contains(ArrayFlags::LEN_KNOWN) {
                    write!(out, "; {}]", a.len).unwrap();
                } else {
                    out.push_str("; ?]");
                }
            }
            Type::Slice(s) => {
                out.push_str("&[");
                self.print_type_name(s.type_, out, recursion_depth + 1);
                out.push(']');
            }
            _ if ti.name.is_empty() => write!(out, "<{}>", ti.t.kind_name()).unwrap(),
            _ => out.push_str(&ti.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{*, types::*};

    #[test]
    fn layout_and_names() {
        let mut s = TypeSnapshot::new();
        let b = s.builtins;
        let node = s.declare_struct("Node");
        let node_ptr = s.add_pointer(node);
        s.define_struct(node, &[("val", b.i32_), ("next", node_ptr)]);
        assert_eq!(s.get(node).size, 16);
        assert_eq!(s.get(node).t.as_struct().unwrap().fields[1].bit_offset, 64);
        assert_eq!(s.add_pointer(node), node_ptr);

        let mut types = Types::new(Arc::new(s));
        assert_eq!(types.parse_type_name("Node*").unwrap(), node_ptr);
        assert_eq!(types.parse_type_name("*Node").unwrap(), node_ptr);
        assert_eq!(types.parse_type_name("struct Node *").unwrap(), node_ptr);
        let arr = types.parse_type_name("[int; 3]").unwrap();
        assert_eq!(types.get(arr).size, 12);
        assert_eq!(types.parse_type_name("int[3]").unwrap(), arr);
        assert_eq!(types.type_name(arr), "[i32; 3]");
        let pp = types.parse_type_name("**u8").unwrap();
        assert_eq!(types.type_name(pp), "**u8");
        assert!(types.parse_type_name("Frob").unwrap_err().code() == Some(ErrorCode::NoType));
        assert!(types.parse_type_name("").is_err());
        assert!(types.parse_type_name("[int]").is_err());
    }
}
