use crate::{*, error::*, expr::*, types::*, annotation::*, registry::*, dispatch::*, interp::*};
use std::{collections::HashSet, ops::Range};

// Built-in view rules.

pub fn register_builtin_rules(r: &mut RuleRegistry) {
    let none = RuleHooks::default();
    let inherited = RuleFlags {inherited: true, forced_expandable: false};
    let specs = [
        RuleSpec {name: "array", display_name: "array", description: "pointer to T becomes pointer to [T; N]; on arrays, changes the length. N is evaluated like a watch expression",
                  schema: ArgSchema::Expr, flags: RuleFlags::default(), hooks: RuleHooks {resolve: Some(resolve_array), ..none}},
        RuleSpec {name: "cast", display_name: "cast", description: "converts the value to the given type, like `as`",
                  schema: ArgSchema::TypeName, flags: RuleFlags::default(), hooks: RuleHooks {resolve: Some(resolve_cast), ..none}},
        RuleSpec {name: "wrap", display_name: "wrap", description: "evaluates the given expression with $ replaced by the annotated expression",
                  schema: ArgSchema::Template, flags: RuleFlags::default(), hooks: RuleHooks {resolve: Some(resolve_wrap), ..none}},
        RuleSpec {name: "slice", display_name: "slice", description: "struct with a pointer field and a length field is shown as an array",
                  schema: ArgSchema::None, flags: RuleFlags::default(), hooks: RuleHooks {resolve: Some(resolve_slice), ..none}},
        RuleSpec {name: "list", display_name: "linked list", description: "children are the nodes reached by following the given pointer field",
                  schema: ArgSchema::Ident, flags: RuleFlags {inherited: false, forced_expandable: true}, hooks: RuleHooks {expand_info: Some(list_expand_info), expand_range: Some(list_expand_range), ..none}},
        RuleSpec {name: "bin", display_name: "binary", description: "integers in base 2", schema: ArgSchema::None, flags: inherited, hooks: RuleHooks {context: Some(context_bin), ..none}},
        RuleSpec {name: "oct", display_name: "octal", description: "integers in base 8", schema: ArgSchema::None, flags: inherited, hooks: RuleHooks {context: Some(context_oct), ..none}},
        RuleSpec {name: "dec", display_name: "decimal", description: "integers in base 10", schema: ArgSchema::None, flags: inherited, hooks: RuleHooks {context: Some(context_dec), ..none}},
        RuleSpec {name: "hex", display_name: "hexadecimal", description: "integers in base 16, byte strings as hex", schema: ArgSchema::None, flags: inherited, hooks: RuleHooks {context: Some(context_hex), ..none}},
        RuleSpec {name: "bswap", display_name: "byte swap", description: "integers are read in the opposite byte order; memory is not changed",
                  schema: ArgSchema::None, flags: inherited, hooks: RuleHooks {context: Some(context_bswap), ..none}},
        RuleSpec {name: "only", display_name: "only", description: "show only the listed struct members", schema: ArgSchema::NameList, flags: inherited, hooks: RuleHooks {context: Some(context_only), ..none}},
        RuleSpec {name: "omit", display_name: "omit", description: "hide the listed struct members", schema: ArgSchema::NameList, flags: inherited, hooks: RuleHooks {context: Some(context_omit), ..none}},
        RuleSpec {name: "no_addr", display_name: "no addresses", description: "replace addresses with a placeholder", schema: ArgSchema::None, flags: inherited, hooks: RuleHooks {context: Some(context_no_addr), ..none}},
        RuleSpec {name: "raw", display_name: "raw", description: "no string formatting for char arrays, values not editable", schema: ArgSchema::None, flags: inherited, hooks: RuleHooks {context: Some(context_raw), ..none}},
    ];
    for s in specs {
        // Names are distinct literals above.
        if let Err(e) = r.register(s) {
            eprintln!("warning: {}", e);
        }
    }
}

fn type_of_rewritten(cur: &Resolved, t: TypeIdx, cx: &mut EvalContext) -> Result<Resolved> {
    let value = cast_value(cur.value.clone(), t, cx)?;
    let expr = format!("{} as {}", adjust_expression_for_appending_child_path(&cur.expr), cx.types.type_name(t));
    Ok(Resolved {expr, value})
}

fn resolve_array(a: &RuleApplication, cur: Resolved, cx: &mut EvalContext) -> Result<Resolved> {
    // Evaluated by the plain evaluator: no rules, doesn't see the node being rewritten.
    let len_val = cx.eval_expression(a.args_str())?;
    let len = read_integer(&len_val, false, &cx.types, &mut cx.memory)?;
    if (len as isize) < 0 {
        return err!(RuleArgument, "negative length: {}", len as isize);
    }
    let t = match &cx.types.get(cur.value.type_).t {
        Type::Pointer(p) => {
            let elem = p.type_;
            let arr = cx.types.add_array(elem, Some(len), ArrayFlags::empty());
            cx.types.add_pointer(arr)
        }
        Type::Array(x) => {
            let (elem, flags) = (x.type_, x.flags - ArrayFlags::LEN_KNOWN);
            cx.types.add_array(elem, Some(len), flags)
        }
        t => return err!(TypeMismatch, "array() needs a pointer or array, got {}", t.kind_name()),
    };
    type_of_rewritten(&cur, t, cx)
}

fn resolve_cast(a: &RuleApplication, cur: Resolved, cx: &mut EvalContext) -> Result<Resolved> {
    let t = cx.types.parse_type_name(a.args_str())?;
    type_of_rewritten(&cur, t, cx)
}

fn resolve_wrap(a: &RuleApplication, cur: Resolved, cx: &mut EvalContext) -> Result<Resolved> {
    let expr = a.args_str().replace('$', &format!("({})", cur.expr));
    let value = cx.eval_expression(&expr)?;
    Ok(Resolved {expr, value})
}

// {ptr, len} struct -> slice. Uses the first pointer field and the first integer field.
fn resolve_slice(_a: &RuleApplication, cur: Resolved, cx: &mut EvalContext) -> Result<Resolved> {
    let s = match &cx.types.get(cur.value.type_).t {
        Type::Struct(s) => s.clone(),
        t => return err!(TypeMismatch, "slice needs a struct, got {}", t.kind_name()),
    };
    let ptr_field = s.fields.iter().find(|f| cx.types.get(f.type_).t.as_pointer().is_some());
    let len_field = s.fields.iter().find(|f| { let t = &cx.types.get(f.type_).t; t.is_integral() && t.as_pointer().is_none() });
    let (Some(ptr_field), Some(len_field)) = (ptr_field, len_field) else { return err!(TypeMismatch, "slice needs a pointer field and an integer field") };
    let elem = match &cx.types.get(ptr_field.type_).t {
        Type::Pointer(p) => p.type_,
        _ => return err!(Internal, "pointer field is not a pointer"),
    };
    let ptr_val = Value {val: get_struct_field(&cur.value.val, ptr_field, &cx.types, &mut cx.memory)?, type_: ptr_field.type_};
    let len_val = Value {val: get_struct_field(&cur.value.val, len_field, &cx.types, &mut cx.memory)?, type_: len_field.type_};
    let ptr = read_integer(&ptr_val, false, &cx.types, &mut cx.memory)?;
    let len = read_integer(&len_val, false, &cx.types, &mut cx.memory)?;
    let mut bytes = ptr.to_le_bytes().to_vec();
    bytes.extend_from_slice(&len.to_le_bytes());
    let blob = ValueBlob::from_vec(bytes);
    let flags = match cx.types.get(elem).t.as_primitive() {
        Some(p) if p.contains(PrimitiveFlags::CHAR) => SliceFlags::UTF_STRING,
        _ => SliceFlags::empty(),
    };
    let t = cx.types.add_slice(elem, flags);
    Ok(Resolved {expr: cur.expr, value: Value::blob(blob, t)})
}

// Node addresses, following `next` until null, a node seen before, or the node limit.
fn list_expand_info(a: &RuleApplication, node: &ResolvedNode, ctx: &StageContext, cx: &mut EvalContext) -> Result<ExpandInfo> {
    let v = match &node.value {
        Ok(v) => v.clone(),
        Err(e) => return Err(e.clone()),
    };
    let (mut addr, node_type) = match &cx.types.get(v.type_).t {
        Type::Pointer(p) => (read_integer(&v, ctx.byte_swap, &cx.types, &mut cx.memory)?, p.type_),
        Type::Struct(_) => match v.val.addr() {
            Some(addr) => (addr, v.type_),
            None => return err!(NotImplemented, "list head has no address"),
        }
        t => return err!(TypeMismatch, "list() needs a struct or pointer to struct, got {}", t.kind_name()),
    };
    let field = match &cx.types.get(node_type).t {
        Type::Struct(s) => match s.field_by_name(a.args_str()) {
            Some(f) => f.clone(),
            None => return err!(RuleArgument, "no field '{}' in {}", a.args_str(), cx.types.type_name(node_type)),
        }
        _ => return err!(TypeMismatch, "list() needs a struct or pointer to struct"),
    };
    if cx.types.get(field.type_).t.as_pointer().is_none() {
        return err!(TypeMismatch, "field '{}' is not a pointer", field.name);
    }
    let mut seen: HashSet<usize> = HashSet::new();
    let mut addrs: Vec<usize> = Vec::new();
    while addr != 0 && addrs.len() < cx.settings.max_list_nodes {
        if !seen.insert(addr) {
            log!(cx.log, "list: cycle at 0x{:x} after {} nodes", addr, addrs.len());
            break;
        }
        addrs.push(addr);
        let next = get_struct_field(&AddrOrValueBlob::Addr(addr), &field, &cx.types, &mut cx.memory)
            .and_then(|val| read_integer(&Value {val, type_: field.type_}, ctx.byte_swap, &cx.types, &mut cx.memory));
        addr = match next {
            Ok(x) => x,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                log!(cx.log, "list: {}", e);
                break;
            }
        };
    }
    Ok(ExpandInfo::children(addrs.len(), ExpandPayload::Addresses(addrs)))
}

fn list_expand_range(_a: &RuleApplication, node: &ResolvedNode, info: &ExpandInfo, range: Range<usize>, _ctx: &StageContext, cx: &mut EvalContext) -> Result<Vec<ChildNode>> {
    let ExpandPayload::Addresses(addrs) = &info.payload else { return err!(Internal, "list: no addresses") };
    let v = match &node.value {
        Ok(v) => v,
        Err(e) => return Err(e.clone()),
    };
    let node_type = match &cx.types.get(v.type_).t {
        Type::Pointer(p) => p.type_,
        _ => v.type_,
    };
    let type_name = cx.types.type_name(node_type);
    Ok(range.filter_map(|i| addrs.get(i).map(|&addr| ChildNode {name: format!("[{}]", i), expr: expression_for_address(addr, &type_name), value: Ok(Value::at(addr, node_type))})).collect())
}

fn context_radix(ctx: &mut StageContext, r: Radix) -> Result<()> {
    ctx.radix = Some(r);
    Ok(())
}
fn context_bin(_: &RuleApplication, ctx: &mut StageContext) -> Result<()> { context_radix(ctx, Radix::Bin) }
fn context_oct(_: &RuleApplication, ctx: &mut StageContext) -> Result<()> { context_radix(ctx, Radix::Oct) }
fn context_dec(_: &RuleApplication, ctx: &mut StageContext) -> Result<()> { context_radix(ctx, Radix::Dec) }
fn context_hex(_: &RuleApplication, ctx: &mut StageContext) -> Result<()> { context_radix(ctx, Radix::Hex) }

fn context_bswap(_: &RuleApplication, ctx: &mut StageContext) -> Result<()> {
    ctx.byte_swap = true;
    Ok(())
}

fn context_only(a: &RuleApplication, ctx: &mut StageContext) -> Result<()> {
    ctx.only = Some(parse_name_list(a.args_str())?);
    Ok(())
}

fn context_omit(a: &RuleApplication, ctx: &mut StageContext) -> Result<()> {
    ctx.omit.extend(parse_name_list(a.args_str())?);
    Ok(())
}

fn context_no_addr(_: &RuleApplication, ctx: &mut StageContext) -> Result<()> {
    ctx.omit_addresses = true;
    Ok(())
}

fn context_raw(_: &RuleApplication, ctx: &mut StageContext) -> Result<()> {
    ctx.raw = true;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::{*, pretty::*, testing::*};

    #[test]
    fn rewrites() {
        let f = Fixture::new();
        let mut cx = f.cx();
        let node = resolve_root("arr_ptr", "array(4)", &mut cx).unwrap();
        assert_eq!(node.expr, "arr_ptr as *[i32; 4]");
        assert_eq!(cx.types.type_name(node.value.as_ref().unwrap().type_), "*[i32; 4]");

        let node = resolve_root("arr_ptr", "wrap($ + 1)", &mut cx).unwrap();
        assert_eq!(node.expr, "(arr_ptr) + 1");
        assert_eq!(read_integer(node.value.as_ref().unwrap(), false, &cx.types, &mut cx.memory).unwrap(), 0x2004);

        let node = resolve_root("pt", "wrap($.x) hex", &mut cx).unwrap();
        assert_eq!(read_integer(node.value.as_ref().unwrap(), false, &cx.types, &mut cx.memory).unwrap(), 3);

        let node = resolve_root("flag", "cast(u8)", &mut cx).unwrap();
        assert_eq!(node.expr, "flag as u8");
        assert_eq!(read_integer(node.value.as_ref().unwrap(), false, &cx.types, &mut cx.memory).unwrap(), 0x78);

        let node = resolve_root("pt", "array(-1)", &mut cx).unwrap();
        assert!(node.rule_errors[0].message.contains("negative"));
        let node = resolve_root("pt", "array(2)", &mut cx).unwrap();
        assert!(node.rule_errors[0].message.contains("pointer or array"));
        let node = resolve_root("flag", "slice", &mut cx).unwrap();
        assert_eq!(node.rule_errors.len(), 1);
    }

    #[test]
    fn context_rules() {
        let r = RuleRegistry::builtin();
        let rules = parse_annotation("hex bin bswap no_addr raw omit(a, b)", r);
        let (ctx, w) = StageContext::for_rules(&rules, r);
        assert!(w.is_empty());
        assert_eq!(ctx.radix, Some(Radix::Bin));
        assert!(ctx.byte_swap && ctx.omit_addresses && ctx.raw);
        assert!(!ctx.shows_field("a") && ctx.shows_field("c"));
        let (ctx, _) = StageContext::for_rules(&parse_annotation("oct dec", r), r);
        assert_eq!(ctx.radix, Some(Radix::Dec));
    }
}
