use crate::{*, types::*, expr::*, memory::*, interp::*};
use std::sync::Arc;

// A small fake program state: a few types, a memory snapshot and the variables pointing into it.
// Used by the command line tool and by tests.
pub struct DemoProgram {
    pub types: Arc<TypeSnapshot>,
    pub memory: Arc<SnapshotMemory>,
    pub evaluator: Arc<WatchInterpreter>,
}

pub const UNMAPPED_ADDR: usize = 0xdead0000;

// Contiguous bytes starting at `base`, filled by absolute address.
struct Region {
    base: usize,
    bytes: Vec<u8>,
}
impl Region {
    fn new(base: usize, len: usize) -> Self { Self {base, bytes: vec![0; len]} }
    fn put(&mut self, addr: usize, data: &[u8]) { let o = addr - self.base; self.bytes[o..o+data.len()].copy_from_slice(data); }
    fn put_i32(&mut self, addr: usize, x: i32) { self.put(addr, &x.to_le_bytes()); }
    fn put_u64(&mut self, addr: usize, x: u64) { self.put(addr, &x.to_le_bytes()); }
    fn put_i32_be(&mut self, addr: usize, x: i32) { self.put(addr, &x.to_be_bytes()); }
    fn put_u64_be(&mut self, addr: usize, x: u64) { self.put(addr, &x.to_be_bytes()); }
}

impl DemoProgram {
    pub fn new() -> Self {
        let mut s = TypeSnapshot::new();
        let b = s.builtins;
        let point = s.add_struct("Point", &[("x", b.i32_), ("y", b.i32_)]);
        let inner = s.add_struct("Inner", &[("a", b.i32_), ("b", b.i32_), ("c", b.i32_)]);
        let outer = s.add_struct("Outer", &[("a", b.i32_), ("b", inner), ("c", b.i32_)]);
        let node = s.declare_struct("Node");
        let node_ptr = s.add_pointer(node);
        s.define_struct(node, &[("val", b.i32_), ("next", node_ptr)]);
        let i32_ptr = s.add_pointer(b.i32_);
        let pair = s.add_struct("Pair", &[("ptr", i32_ptr), ("len", b.u64_)]);
        let hello = s.add_array(b.char8, Some(6));
        let color = s.add_enum("Color", b.u32_, &[("Red", 0), ("Green", 1), ("Blue", 2)]);
        let char_ptr = s.add_pointer(b.char8);
        let big = s.add_array(b.i32_, Some(1000));

        let mut vars = Region::new(0x1000, 0x900);
        vars.put_i32(0x1000, 3);
        vars.put_i32(0x1004, -4);
        for (i, x) in [1, 4, 5, 6, 7].iter().enumerate() {
            vars.put_i32(0x1100 + i * 4, *x);
        }
        vars.put_u64(0x1200, 0x2000);
        vars.put_u64(0x1300, 0x3000);
        vars.put_u64(0x1308, 0x3100);
        vars.put_u64(0x1310, 0);
        vars.put_u64(0x1318, UNMAPPED_ADDR as u64);
        vars.put_u64(0x1400, 0x2000);
        vars.put_u64(0x1408, 3);
        vars.put(0x1500, b"hello\0");
        vars.put_u64(0x1600, UNMAPPED_ADDR as u64);
        vars.put(0x1700, &0x12345678u32.to_le_bytes());
        vars.put(0x1800, &1u32.to_le_bytes());
        vars.put(0x1808, &0.5f64.to_le_bytes());
        vars.put_u64(0x1810, 0x1500);
        // Big-endian data, for bswap.
        vars.put_u64_be(0x1820, 0x2000);
        vars.put_u64_be(0x1828, 0x3040);

        let mut arr = Region::new(0x2000, 16);
        for (i, x) in [10, 20, 30, 40].iter().enumerate() {
            arr.put_i32(0x2000 + i * 4, *x);
        }

        // head: 1 -> 2 -> 3 -> null. ring: 1 -> 2 -> 1 -> ...
        let mut nodes = Region::new(0x3000, 0x120);
        for (i, next) in [0x3010u64, 0x3020, 0].iter().enumerate() {
            nodes.put_i32(0x3000 + i * 16, i as i32 + 1);
            nodes.put_u64(0x3000 + i * 16 + 8, *next);
        }
        for (i, next) in [0x3110u64, 0x3100].iter().enumerate() {
            nodes.put_i32(0x3100 + i * 16, i as i32 + 1);
            nodes.put_u64(0x3100 + i * 16 + 8, *next);
        }

        // be_head: 10 -> 20 -> null, all fields big-endian.
        for (i, next) in [0x3050u64, 0].iter().enumerate() {
            nodes.put_i32_be(0x3040 + i * 16, (i as i32 + 1) * 10);
            nodes.put_u64_be(0x3040 + i * 16 + 8, *next);
        }

        let mut big_region = Region::new(0x4000, 4000);
        for i in 0..1000 {
            big_region.put_i32(0x4000 + i * 4, i as i32);
        }

        let memory = SnapshotMemory::new();
        for r in [vars, arr, nodes, big_region] {
            memory.map(r.base, r.bytes);
        }

        let mut interp = WatchInterpreter::new();
        for (name, addr, t) in [
            ("pt", 0x1000, point), ("outer", 0x1100, outer), ("arr_ptr", 0x1200, i32_ptr), ("head", 0x1300, node_ptr),
            ("ring", 0x1308, node_ptr), ("null_node", 0x1310, node_ptr), ("bad_node", 0x1318, node_ptr), ("pair", 0x1400, pair),
            ("hello", 0x1500, hello), ("bad_ptr", 0x1600, i32_ptr), ("flag", 0x1700, b.u32_), ("color", 0x1800, color),
            ("ratio", 0x1808, b.f64_), ("name_ptr", 0x1810, char_ptr), ("big", 0x4000, big),
            ("be_ptr", 0x1820, i32_ptr), ("be_head", 0x1828, node_ptr),
        ] {
            interp.add_variable(name, Value::at(addr, t));
        }

        Self {types: Arc::new(s), memory: Arc::new(memory), evaluator: Arc::new(interp)}
    }
}
