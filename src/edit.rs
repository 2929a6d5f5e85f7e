use crate::{*, error::*, expr::*, types::*, dispatch::*, memory::*, stringize::*};

// Editing a value in place: the text shown in the edit box, and writing the user's text back.
// Both go through the same radix and byte order translation as the displayed line, so committing an unmodified
// edit string writes back the same bytes.

pub fn edit_string(v: &Value, ctx: &StageContext, cx: &mut EvalContext) -> Result<String> {
    let t = cx.types.get(v.type_).clone();
    Ok(match &t.t {
        Type::Primitive(p) if p.contains(PrimitiveFlags::FLOAT) => format!("{:?}", read_float(v, ctx.byte_swap, &cx.types, &mut cx.memory)?),
        Type::Primitive(p) if p.contains(PrimitiveFlags::BOOL) && ctx.radix.is_none() => {
            let x = read_integer(v, ctx.byte_swap, &cx.types, &mut cx.memory)?;
            if x == 0 { "false".to_string() } else if x == 1 { "true".to_string() } else { x.to_string() }
        }
        Type::Primitive(p) => {
            let x = read_integer(v, ctx.byte_swap, &cx.types, &mut cx.memory)?;
            format_integer(x, t.size, p.contains(PrimitiveFlags::SIGNED), ctx.radix)
        }
        Type::Enum(e) => {
            let x = read_integer(v, ctx.byte_swap, &cx.types, &mut cx.memory)?;
            match e.enumerands.iter().find(|en| en.value == x) {
                Some(en) if ctx.radix.is_none() => en.name.clone(),
                _ => {
                    let signed = cx.types.get(e.type_).t.as_primitive().map_or(false, |p| p.contains(PrimitiveFlags::SIGNED));
                    format_integer(x, t.size, signed, ctx.radix)
                }
            }
        }
        Type::Pointer(_) => format!("0x{:x}", read_integer(v, ctx.byte_swap, &cx.types, &mut cx.memory)?),
        _ => return err!(NotImplemented, "{} values can't be edited", t.t.kind_name()),
    })
}

// Returns (negative, magnitude). Unprefixed digits are in `default_radix`.
fn parse_integer_text(text: &str, default_radix: u32) -> Result<(bool, u64)> {
    let s = text.trim();
    let (negative, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest.trim_start()),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let lower = s.to_ascii_lowercase();
    let (radix, digits) = if let Some(d) = lower.strip_prefix("0x") {
        (16, d)
    } else if let Some(d) = lower.strip_prefix("0b") {
        (2, d)
    } else if let Some(d) = lower.strip_prefix("0o") {
        (8, d)
    } else {
        (default_radix, &lower as &str)
    };
    let digits: String = digits.chars().filter(|c| *c != '_').collect();
    if digits.is_empty() {
        return err!(Usage, "expected a number, got '{}'", text.trim());
    }
    match u64::from_str_radix(&digits, radix) {
        Ok(x) => Ok((negative, x)),
        Err(e) => err!(Usage, "bad number '{}': {}", text.trim(), e),
    }
}

// Checks that the number fits in `size` bytes and returns its little-endian representation.
// Unsigned-looking text is accepted for signed types as long as it fits in the bits, so that hex edit strings of negative values round trip.
fn integer_bytes(negative: bool, x: u64, size: usize, signed: bool, text: &str) -> Result<Vec<u8>> {
    let bits = size as u32 * 8;
    let out_of_range = || err!(Usage, "{} doesn't fit in {} {}-bit integer", text.trim(), if signed {"a signed"} else {"an unsigned"}, bits);
    let value: u64 = if negative {
        if !signed && x != 0 {
            return out_of_range();
        }
        if bits < 64 && x > 1u64 << (bits - 1) || bits == 64 && x > 1u64 << 63 {
            return out_of_range();
        }
        x.wrapping_neg()
    } else {
        if bits < 64 && x >> bits != 0 {
            return out_of_range();
        }
        x
    };
    Ok(value.to_le_bytes()[..size].to_vec())
}

fn char_literal(text: &str) -> Option<u8> {
    let s = text.trim();
    let inner = s.strip_prefix('\'')?.strip_suffix('\'')?;
    match inner.as_bytes() {
        [c] => Some(*c),
        [b'\\', b'0'] => Some(0),
        [b'\\', b'n'] => Some(b'\n'),
        [b'\\', b't'] => Some(b'\t'),
        [b'\\', b'\\'] => Some(b'\\'),
        [b'\\', b'\''] => Some(b'\''),
        _ => None,
    }
}

// The bytes to write, in memory order.
pub fn encode_edit(v: &Value, ctx: &StageContext, text: &str, types: &Types) -> Result<Vec<u8>> {
    let t = types.get(v.type_);
    let radix = ctx.radix.map_or(10, |r| r as u32);
    let mut bytes = match &t.t {
        Type::Primitive(p) if p.contains(PrimitiveFlags::UNSPECIFIED) => return err!(NotImplemented, "void values can't be edited"),
        Type::Primitive(p) if p.contains(PrimitiveFlags::FLOAT) => {
            let x: f64 = match text.trim().parse() {
                Ok(x) => x,
                Err(_) => return err!(Usage, "bad float: '{}'", text.trim()),
            };
            match t.size {
                4 => (x as f32).to_le_bytes().to_vec(),
                8 => x.to_le_bytes().to_vec(),
                n => return err!(NotImplemented, "{}-byte floats not supported", n),
            }
        }
        Type::Primitive(p) if p.contains(PrimitiveFlags::BOOL) && ["true", "false"].contains(&text.trim()) => {
            let mut b = vec![0u8; t.size];
            b[0] = (text.trim() == "true") as u8;
            b
        }
        Type::Primitive(p) => match char_literal(text) {
            Some(c) if p.contains(PrimitiveFlags::CHAR) && t.size == 1 => vec![c],
            _ => {
                let (neg, x) = parse_integer_text(text, radix)?;
                integer_bytes(neg, x, t.size, p.contains(PrimitiveFlags::SIGNED), text)?
            }
        }
        Type::Enum(e) => match e.enumerands.iter().find(|en| en.name == text.trim()) {
            Some(en) => en.value.to_le_bytes()[..t.size].to_vec(),
            None => {
                let signed = types.get(e.type_).t.as_primitive().map_or(false, |p| p.contains(PrimitiveFlags::SIGNED));
                let (neg, x) = parse_integer_text(text, radix)?;
                integer_bytes(neg, x, t.size, signed, text)?
            }
        }
        // Addresses are shown in hex, so they're read in hex too.
        Type::Pointer(_) => {
            let (neg, x) = parse_integer_text(text, ctx.radix.map_or(16, |r| r as u32))?;
            integer_bytes(neg, x, 8, false, text)?
        }
        _ => return err!(NotImplemented, "{} values can't be edited", t.t.kind_name()),
    };
    if ctx.byte_swap {
        bytes.reverse();
    }
    Ok(bytes)
}

// Parses and range-checks everything first, then does exactly one write.
pub fn commit_edit(v: &Value, ctx: &StageContext, text: &str, types: &Types, writer: &dyn MemoryWriter) -> Result<()> {
    if ctx.raw {
        return err!(Usage, "value is shown raw; remove the raw rule to edit it");
    }
    let Some(addr) = v.val.addr() else { return err!(Usage, "value is not in memory") };
    let bytes = encode_edit(v, ctx, text, types)?;
    writer.write(addr, &bytes)
}

#[cfg(test)]
mod tests {
    use crate::{*, edit::*, testing::*, annotation::*, registry::*};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingWriter<'a> {
        inner: &'a SnapshotMemory,
        writes: AtomicUsize,
    }
    impl MemoryWriter for CountingWriter<'_> {
        fn write(&self, addr: usize, data: &[u8]) -> Result<()> {
            self.writes.fetch_add(1, Ordering::Relaxed);
            self.inner.write(addr, data)
        }
    }

    fn ctx(annotation: &str) -> StageContext {
        let r = RuleRegistry::builtin();
        StageContext::for_rules(&parse_annotation(annotation, r), r).0
    }

    fn int(f: &Fixture, expr: &str) -> isize {
        let mut cx = f.cx();
        let v = cx.eval_expression(expr).unwrap();
        read_integer(&v, false, &cx.types, &mut cx.memory).unwrap() as isize
    }

    #[test]
    fn edit_strings() {
        let f = Fixture::new();
        let mut cx = f.cx();
        let y = cx.eval_expression("pt.y").unwrap();
        assert_eq!(edit_string(&y, &ctx(""), &mut cx).unwrap(), "-4");
        assert_eq!(edit_string(&y, &ctx("hex"), &mut cx).unwrap(), "0xfffffffc");
        let color = f.var("color");
        assert_eq!(edit_string(&color, &ctx(""), &mut cx).unwrap(), "Green");
        assert_eq!(edit_string(&color, &ctx("bin"), &mut cx).unwrap(), "0b1");
        assert_eq!(edit_string(&f.var("arr_ptr"), &ctx(""), &mut cx).unwrap(), "0x2000");
        assert_eq!(edit_string(&f.var("ratio"), &ctx(""), &mut cx).unwrap(), "0.5");
        assert!(edit_string(&f.var("pt"), &ctx(""), &mut cx).is_err());
    }

    #[test]
    fn commit() {
        let f = Fixture::new();
        let w = CountingWriter {inner: &*f.demo.memory, writes: AtomicUsize::new(0)};
        let types = f.cx().types;
        let x = f.var("pt");
        let x = Value::at(x.val.addr().unwrap(), types.builtins().i32_);

        commit_edit(&x, &ctx(""), "7", &types, &w).unwrap();
        assert_eq!(int(&f, "pt.x"), 7);
        commit_edit(&x, &ctx(""), " -2_000 ", &types, &w).unwrap();
        assert_eq!(int(&f, "pt.x"), -2000);
        // Unprefixed digits use the effective radix.
        commit_edit(&x, &ctx("hex"), "ff", &types, &w).unwrap();
        assert_eq!(int(&f, "pt.x"), 255);
        // What the hex display shows for a negative number goes back in unchanged.
        commit_edit(&x, &ctx("hex"), "0xfffffffc", &types, &w).unwrap();
        assert_eq!(int(&f, "pt.x"), -4);
        commit_edit(&x, &ctx(""), "-2147483648", &types, &w).unwrap();
        assert_eq!(w.writes.load(Ordering::Relaxed), 5);

        // Rejected before writing anything.
        for bad in ["2147483648x", "0x100000000", "-2147483649", "", "abc", "1.5"] {
            assert!(commit_edit(&x, &ctx(""), bad, &types, &w).is_err(), "{}", bad);
        }
        assert_eq!(w.writes.load(Ordering::Relaxed), 5);
        assert_eq!(int(&f, "pt.x"), -2147483648);

        let flag = f.var("flag");
        assert!(commit_edit(&flag, &ctx(""), "-1", &types, &w).is_err());
        assert!(commit_edit(&flag, &ctx(""), "4294967296", &types, &w).is_err());
        commit_edit(&flag, &ctx("bswap"), "0x11223344", &types, &w).unwrap();
        assert_eq!(int(&f, "flag"), 0x44332211);
        assert!(commit_edit(&flag, &ctx("raw"), "1", &types, &w).is_err());

        commit_edit(&f.var("color"), &ctx(""), "Blue", &types, &w).unwrap();
        assert_eq!(int(&f, "color"), 2);
        commit_edit(&f.var("ratio"), &ctx(""), "-0.25", &types, &w).unwrap();
        let mut cx = f.cx();
        assert_eq!(read_float(&f.var("ratio"), false, &cx.types, &mut cx.memory).unwrap(), -0.25);

        let c = Value::at(0x1500, types.builtins().char8);
        commit_edit(&c, &ctx(""), "'j'", &types, &w).unwrap();
        assert_eq!(int(&f, "hello[0]"), b'j' as isize);

        commit_edit(&f.var("arr_ptr"), &ctx(""), "2004", &types, &w).unwrap();
        assert_eq!(int(&f, "*arr_ptr"), 20);

        // Temporaries have nowhere to go.
        let tmp = Value::blob(ValueBlob::new(1), types.builtins().i32_);
        assert!(commit_edit(&tmp, &ctx(""), "1", &types, &w).is_err());
    }
}
