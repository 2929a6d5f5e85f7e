use crate::{*, error::*, expr::*, types::*, dispatch::*, settings::*, util::*};
use std::fmt::Write;

// Markers that can't be mistaken for a value.
pub const ELISION: &str = "…";
pub const UNREADABLE: &str = "<unreadable>";
pub const ADDR_ELIDED: &str = "<addr>";

// Limits for one line. Nested values get depth-1; every nested value costs at least one character.
#[derive(Clone, Copy, Debug)]
pub struct Budget {
    pub chars: usize,
    pub depth: usize,
}

impl Budget {
    pub fn from_settings(s: &Settings) -> Self { Self {chars: s.max_line_chars, depth: s.max_depth} }
}

struct FormatState<'s, 'a> {
    out: String,
    max_chars: usize,
    ctx: &'s StageContext,
    cx: &'s mut EvalContext<'a>,
}

impl FormatState<'_, '_> {
    // Output length limit. Guarantees termination together with the depth limit.
    fn over_output_limit(&self) -> bool { str_width(&self.out) >= self.max_chars }

    fn write_address(&mut self, addr: usize) {
        if self.ctx.omit_addresses {
            self.out.push_str(ADDR_ELIDED);
        } else {
            write!(self.out, "0x{:x}", addr).unwrap();
        }
    }

    fn write_error(&mut self, e: Error) -> Result<()> {
        if e.is_cancelled() {
            return Err(e);
        }
        if e.is_unreadable() {
            self.out.push_str(UNREADABLE);
        } else {
            write!(self.out, "<{}>", e).unwrap();
        }
        Ok(())
    }
}

// x0 must be already sign-extended to 8 bytes if signed.
pub fn format_integer(x0: usize, size: usize, signed: bool, radix: Option<Radix>) -> String {
    let mut x = x0;
    if size > 0 && size < 8 {
        x &= (1usize << (size*8) as u32) - 1;
    }
    match radix {
        Some(Radix::Hex) => format!("0x{:x}", x),
        Some(Radix::Bin) => format!("0b{:b}", x),
        Some(Radix::Oct) => format!("0o{:o}", x),
        Some(Radix::Dec) | None if signed => format!("{}", x0 as isize),
        Some(Radix::Dec) | None => format!("{}", x),
    }
}

fn format_char(c: u8) -> String {
    match c {
        0 => "0 '\\0'".to_string(),
        32..=126 if c != b'\'' && c != b'\\' => format!("{} '{}'", c, c as char),
        _ => format!("{} '{}'", c, (c as char).escape_default()),
    }
}

fn is_char_type(t: &TypeInfo) -> bool { t.size == 1 && t.t.as_primitive().map_or(false, |p| p.contains(PrimitiveFlags::CHAR)) }

fn write_bytes_as_string(bytes: &[u8], hex: bool, out: &mut String) {
    if hex {
        out.push_str("0x\"");
        for b in bytes {
            write!(out, "{:02x}", b).unwrap();
        }
    } else {
        out.push('"');
        match std::str::from_utf8(bytes) {
            Ok(s) => out.extend(s.chars().flat_map(|c| c.escape_debug())),
            Err(_) => for &b in bytes {
                if b >= 32 && b <= 126 {
                    out.push(b as char);
                } else {
                    write!(out, "\\x{:02x}", b).unwrap();
                }
            }
        }
    }
    out.push('"');
}

// Null-terminated string behind a char pointer.
fn format_c_string(addr: usize, st: &mut FormatState) -> Result<()> {
    let limit = st.cx.settings.max_string_bytes.min(st.cx.settings.preread_limit);
    let mut res: Vec<u8> = Vec::new();
    let mut terminated = false;
    let mut chunk = 64usize;
    let mut a = addr;
    while res.len() < limit {
        // Don't read across a page boundary in one go: the next page may be unmapped.
        let n = (chunk - (a & (chunk - 1))).min(limit - res.len());
        let start = res.len();
        res.resize(start + n, 0);
        if let Err(e) = st.cx.memory.read(a, &mut res[start..]) {
            if start == 0 || e.is_cancelled() {
                return st.write_error(e);
            }
            res.truncate(start);
            break;
        }
        if let Some(i) = res[start..].iter().position(|c| *c == 0) {
            res.truncate(start + i);
            terminated = true;
            break;
        }
        a = match a.checked_add(n) {
            Some(x) => x,
            None => break, // ran into the end of the address space
        };
        if chunk < 4096 {
            chunk <<= 1;
        }
    }
    write_bytes_as_string(&res, st.ctx.radix == Some(Radix::Hex), &mut st.out);
    if !terminated {
        st.out.push_str(ELISION);
    }
    Ok(())
}

fn format_array(elem: TypeIdx, len: usize, base: &AddrOrValueBlob, is_string: bool, depth: usize, st: &mut FormatState) -> Result<()> {
    let elem_info = st.cx.types.get(elem).clone();
    let stride = elem_info.size;
    if (is_string || is_char_type(&elem_info)) && stride == 1 && !st.ctx.raw {
        let n = len.min(st.cx.settings.max_string_bytes).min(st.cx.settings.preread_limit);
        let blob = match base.clone() {
            AddrOrValueBlob::Blob(b) => b.byte_range(0..n.min(b.len())),
            a => a.into_value(n, &mut st.cx.memory),
        };
        let blob = match blob {
            Ok(b) => b,
            Err(e) => return st.write_error(e),
        };
        let hex = st.ctx.radix == Some(Radix::Hex);
        let mut bytes = blob.as_slice();
        if !hex {
            if let Some(i) = bytes.iter().position(|c| *c == 0) {
                bytes = &bytes[..i];
            }
        }
        write_bytes_as_string(bytes, hex, &mut st.out);
        if n < len {
            st.out.push_str(ELISION);
        }
        return Ok(());
    }
    if depth == 0 {
        st.out.push('[');
        st.out.push_str(ELISION);
        st.out.push(']');
        return Ok(());
    }
    st.out.push('[');
    for i in 0..len {
        if i != 0 {
            st.out.push_str(", ");
        }
        if st.over_output_limit() {
            st.out.push_str(ELISION);
            break;
        }
        let v = match base {
            AddrOrValueBlob::Addr(a) => match element_addr(*a, i, stride) {
                Ok(a) => Value::at(a, elem),
                Err(e) => {
                    st.write_error(e)?;
                    break;
                }
            }
            AddrOrValueBlob::Blob(b) => match b.byte_range(i * stride..(i + 1) * stride) {
                Ok(b) => Value::blob(b, elem),
                Err(_) => {
                    st.out.push_str(ELISION);
                    break;
                }
            }
        };
        format_value_recurse(&v, depth - 1, st)?;
    }
    st.out.push(']');
    Ok(())
}

fn format_value_recurse(v: &Value, depth: usize, st: &mut FormatState) -> Result<()> {
    if st.over_output_limit() {
        st.out.push_str(ELISION);
        return Ok(());
    }
    let t = st.cx.types.get(v.type_).clone();
    let swap = st.ctx.byte_swap;
    match &t.t {
        Type::Unknown => st.out.push_str("<unknown type>"),
        Type::Primitive(p) if p.contains(PrimitiveFlags::UNSPECIFIED) => st.out.push_str("()"),
        Type::Primitive(p) if p.contains(PrimitiveFlags::FLOAT) => match read_float(v, swap, &st.cx.types, &mut st.cx.memory) {
            Ok(x) => write!(st.out, "{:?}", x).unwrap(),
            Err(e) => st.write_error(e)?,
        }
        Type::Primitive(p) => match read_integer(v, swap, &st.cx.types, &mut st.cx.memory) {
            Ok(x) if p.contains(PrimitiveFlags::BOOL) && st.ctx.radix.is_none() && x <= 1 => st.out.push_str(if x == 1 {"true"} else {"false"}),
            Ok(x) if p.contains(PrimitiveFlags::CHAR) && t.size == 1 && st.ctx.radix.is_none() => st.out.push_str(&format_char(x as u8)),
            Ok(x) => st.out.push_str(&format_integer(x, t.size, p.contains(PrimitiveFlags::SIGNED), st.ctx.radix)),
            Err(e) => st.write_error(e)?,
        }
        Type::Enum(e) => match read_integer(v, swap, &st.cx.types, &mut st.cx.memory) {
            Ok(x) => {
                let signed = st.cx.types.get(e.type_).t.as_primitive().map_or(false, |p| p.contains(PrimitiveFlags::SIGNED));
                st.out.push_str(&format_integer(x, t.size, signed, st.ctx.radix));
                if st.ctx.radix.is_none() {
                    match e.enumerands.iter().find(|en| en.value == x) {
                        Some(en) => write!(st.out, " ({})", en.name).unwrap(),
                        None => st.out.push_str(" (?)"),
                    }
                }
            }
            Err(e) => st.write_error(e)?,
        }
        Type::Pointer(p) => {
            let x = match read_integer(v, swap, &st.cx.types, &mut st.cx.memory) {
                Ok(x) => x,
                Err(e) => return st.write_error(e),
            };
            if x == 0 {
                st.out.push_str("null");
                return Ok(());
            }
            st.out.push('*');
            st.write_address(x);
            let target = st.cx.types.get(p.type_).clone();
            if is_char_type(&target) && !st.ctx.raw {
                st.out.push(' ');
                format_c_string(x, st)?;
            } else if target.t.is_composite() {
                st.out.push(' ');
                let pointee = Value::at(x, p.type_);
                if depth == 0 {
                    st.out.push_str(if target.t.as_struct().is_some() {"{…}"} else {"[…]"});
                } else {
                    // Check readability first so an unreadable pointee doesn't show up as a list of unreadable fields.
                    let mut probe = [0u8; 1];
                    match st.cx.memory.read(x, &mut probe) {
                        Ok(()) => format_value_recurse(&pointee, depth - 1, st)?,
                        Err(e) => st.write_error(e)?,
                    }
                }
            }
        }
        Type::Struct(s) => {
            if depth == 0 {
                st.out.push('{');
                st.out.push_str(ELISION);
                st.out.push('}');
                return Ok(());
            }
            st.out.push('{');
            let mut first = true;
            for f in &s.fields {
                if !st.ctx.shows_field(&f.name) {
                    continue;
                }
                if !first {
                    st.out.push_str(", ");
                }
                first = false;
                if st.over_output_limit() {
                    st.out.push_str(ELISION);
                    break;
                }
                write!(st.out, "{}: ", f.name).unwrap();
                match get_struct_field(&v.val, f, &st.cx.types, &mut st.cx.memory) {
                    Ok(val) => format_value_recurse(&Value {val, type_: f.type_}, depth - 1, st)?,
                    Err(e) => st.write_error(e)?,
                }
            }
            if s.fields.is_empty() && t.flags.contains(TypeFlags::DECLARATION) {
                st.out.push_str("<missing type definition>");
            }
            st.out.push('}');
        }
        Type::Array(a) => format_array(a.type_, a.len, &v.val, a.flags.contains(ArrayFlags::UTF_STRING), depth, st)?,
        Type::Slice(s) => match read_slice(v, &mut st.cx.memory) {
            Ok((ptr, len)) => format_array(s.type_, len, &AddrOrValueBlob::Addr(ptr), s.flags.contains(SliceFlags::UTF_STRING), depth, st)?,
            Err(e) => st.write_error(e)?,
        }
    }
    Ok(())
}

fn truncate_to_budget(mut s: String, chars: usize) -> String {
    if str_width(&s) <= chars {
        return s;
    }
    let (bytes, _) = str_prefix_with_width(&s, chars.saturating_sub(1));
    s.truncate(bytes);
    s.push_str(ELISION);
    s
}

// Stage 4. Only cancellation is an error; everything else is rendered into the text.
pub fn format_value_line(v: &Value, ctx: &StageContext, budget: Budget, cx: &mut EvalContext) -> Result<String> {
    let mut st = FormatState {out: String::new(), max_chars: budget.chars, ctx, cx};
    format_value_recurse(v, budget.depth, &mut st)?;
    Ok(truncate_to_budget(st.out, budget.chars))
}

// What an expanded row shows next to its name; the details are in the children.
fn format_summary(v: &Value, ctx: &StageContext, info: &ExpandInfo, cx: &mut EvalContext) -> Result<String> {
    if let ExpandSource::Rule(_) = info.source {
        return Ok(format!("length {}", info.child_count));
    }
    let t = cx.types.get(v.type_).clone();
    Ok(match &t.t {
        Type::Struct(_) if t.name.is_empty() => format!("<{}>", t.t.kind_name()),
        Type::Struct(_) => t.name.clone(),
        Type::Array(_) | Type::Slice(_) => format!("length {}", info.child_count),
        Type::Pointer(_) => {
            let mut st = FormatState {out: String::new(), max_chars: usize::MAX, ctx, cx};
            match read_integer(v, ctx.byte_swap, &st.cx.types, &mut st.cx.memory) {
                Ok(x) => {
                    st.out.push('*');
                    st.write_address(x);
                }
                Err(e) => st.write_error(e)?,
            }
            st.out
        }
        _ => return format_value_line(v, ctx, Budget {chars: usize::MAX, depth: 0}, cx),
    })
}

// The display text of a row: inline rule errors, then the value (or a summary if the row is expanded).
pub fn format_node_line(node: &ResolvedNode, ctx: &StageContext, expanded: bool, info: Option<&ExpandInfo>, budget: Budget, cx: &mut EvalContext) -> Result<String> {
    let mut out = String::new();
    for e in &node.rule_errors {
        write!(out, "<{}> ", e).unwrap();
    }
    match &node.value {
        Err(e) if e.is_cancelled() => return Err(e.clone()),
        Err(e) if e.is_unreadable() => out.push_str(UNREADABLE),
        Err(e) => write!(out, "<{}>", e).unwrap(),
        Ok(v) => match info {
            Some(info) if expanded && info.expandable => out.push_str(&format_summary(v, ctx, info, cx)?),
            _ => {
                let rest = budget.chars.saturating_sub(str_width(&out)).max(1);
                out.push_str(&format_value_line(v, ctx, Budget {chars: rest, ..budget}, cx)?);
            }
        }
    }
    Ok(truncate_to_budget(out, budget.chars))
}

#[cfg(test)]
mod tests {
    use crate::{*, stringize::*, testing::*};

    fn line(f: &Fixture, expr: &str, annotation: &str, budget: Budget) -> String {
        let mut cx = f.cx();
        let node = resolve_root(expr, annotation, &mut cx).unwrap();
        let (ctx, _) = StageContext::for_rules(&node.rules, cx.registry);
        format_node_line(&node, &ctx, false, None, budget, &mut cx).unwrap()
    }

    const B: Budget = Budget {chars: 200, depth: 4};

    #[test]
    fn defaults() {
        let f = Fixture::new();
        assert_eq!(line(&f, "pt", "", B), "{x: 3, y: -4}");
        assert_eq!(line(&f, "outer", "", B), "{a: 1, b: {a: 4, b: 5, c: 6}, c: 7}");
        assert_eq!(line(&f, "hello", "", B), "\"hello\"");
        assert_eq!(line(&f, "hello", "raw", B), "[104 'h', 101 'e', 108 'l', 108 'l', 111 'o', 0 '\\0']");
        assert_eq!(line(&f, "hello", "hex", B), "0x\"68656c6c6f00\"");
        assert_eq!(line(&f, "arr_ptr", "", B), "*0x2000");
        assert_eq!(line(&f, "arr_ptr", "array(4)", B), "*0x2000 [10, 20, 30, 40]");
        assert_eq!(line(&f, "pair", "slice", B), "[10, 20, 30]");
        assert_eq!(line(&f, "null_node", "", B), "null");
        assert_eq!(line(&f, "color", "", B), "1 (Green)");
        assert_eq!(line(&f, "hello[1]", "", B), "101 'e'");
        assert_eq!(line(&f, "ratio", "", B), "0.5");
        assert_eq!(line(&f, "name_ptr", "", B), "*0x1500 \"hello\"");
    }

    #[test]
    fn radix_and_bswap() {
        let f = Fixture::new();
        assert_eq!(line(&f, "pt", "hex", B), "{x: 0x3, y: 0xfffffffc}");
        assert_eq!(line(&f, "pt", "bin only(x)", B), "{x: 0b11}");
        assert_eq!(line(&f, "flag", "oct", B), "0o2215053170");
        assert_eq!(line(&f, "flag", "hex bswap", B), "0x78563412");
        assert_eq!(line(&f, "color", "hex", B), "0x1");
        assert_eq!(line(&f, "pt", "hex dec", B), "{x: 3, y: -4}");
        assert_eq!(format_integer(0xff, 1, false, Some(Radix::Hex)), "0xff");
        assert_eq!(format_integer(usize::MAX, 2, true, None), "-1");
    }

    #[test]
    fn budgets() {
        let f = Fixture::new();
        // Cycle: terminates through the depth budget.
        let s = line(&f, "ring", "", Budget {chars: 1000, depth: 3});
        assert_eq!(s, "*0x3100 {val: 1, next: *0x3110 {…}}");
        let s = line(&f, "ring", "", Budget {chars: 30, depth: 100});
        assert!(str_width(&s) <= 30, "{}", s);
        assert!(s.ends_with(ELISION));
        assert_eq!(line(&f, "outer", "", Budget {chars: 100, depth: 1}), "{a: 1, b: {…}, c: 7}");
        assert_eq!(line(&f, "ring", "no_addr", Budget {chars: 100, depth: 1}), "*<addr> {…}");

        for _ in 0..50 {
            let b = Budget {chars: rand::random::<usize>() % 64 + 1, depth: rand::random::<usize>() % 8};
            let s = line(&f, "ring", "", b);
            assert!(str_width(&s) <= b.chars);
        }
    }

    #[test]
    fn errors_inline() {
        let f = Fixture::new();
        assert_eq!(line(&f, "bad_ptr", "", B), "*0xdead0000");
        assert_eq!(line(&f, "*bad_ptr", "", B), UNREADABLE);
        assert_eq!(line(&f, "bad_node", "", B), "*0xdead0000 <unreadable>");
        assert_eq!(line(&f, "nope", "", B), "<no variable 'nope'>");
        let s = line(&f, "arr_ptr", "array(1 +) hex", B);
        assert!(s.starts_with("<array: ") && s.ends_with("> *0x2000"), "{}", s);
        assert_eq!(line(&f, "pt", "frobnicate", B), line(&f, "pt", "", B));
    }

    #[test]
    fn top_of_address_space() {
        let f = Fixture::new();
        assert_eq!(line(&f, "(0 - 8) as *char", "", B), "*0xfffffffffffffff8 <unreadable>");
        assert_eq!(line(&f, "(0 - 4) as *Node", "", B), "*0xfffffffffffffffc <unreadable>");
        // Elements past the end of the address space stop the array.
        assert_eq!(line(&f, "*((0 - 16) as *[i32; 8])", "", B), "[<unreadable>, <unreadable>, <unreadable>, <unreadable>, <unreadable>]");
    }

    #[test]
    fn preread_limit() {
        let mut f = Fixture::new();
        f.settings.preread_limit = 3;
        assert_eq!(line(&f, "hello", "", B), "\"hel\"…");
        assert_eq!(line(&f, "name_ptr", "", B), "*0x1500 \"hel\"…");
        assert_eq!(line(&f, "pt", "", B), "{x: 3, y: -4}");
    }
}
