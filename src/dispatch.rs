use crate::{*, error::*, expr::*, types::*, annotation::*, registry::*, interp::*, stringize::*};
use std::{ops::Range, sync::Arc};

// The pipeline: resolve (rules rewrite the expression and its value), expand-info (is the node expandable, how many
// children), expand-range (children in an index window), stringize (one line of text). Each stage asks the node's rules
// in order and falls back to the type-driven default when no rule has a hook for it.

#[derive(Clone, Debug)]
pub struct Resolved {
    pub expr: String,
    pub value: Value,
}

// An evaluated expression with its effective rule list. Never mutated after creation; re-resolving makes a new one.
#[derive(Debug)]
pub struct ResolvedNode {
    pub name: String, // what the row shows as the name: root expression text, field name, "[3]", ...
    pub expr: String, // expression after rules' rewrites; children's expressions are built from it
    pub original: Result<Resolved>, // input of the resolution stage
    pub value: Result<Value>,
    pub rules: Vec<RuleApplication>,
    pub warnings: Vec<String>,
    pub rule_errors: Vec<Error>, // shown inline in the row
    pub depth: usize,
}

impl ResolvedNode {
    pub fn has_rule(&self, name: &str) -> bool { self.rules.iter().any(|a| a.name == name && !a.is_passthrough()) }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Radix {
    Bin = 2,
    Oct = 8,
    Dec = 10,
    Hex = 16,
}

// Formatting state inherited from ancestors. Built from a node's effective rule list, never changed afterwards.
#[derive(Clone, Debug, Default)]
pub struct StageContext {
    pub radix: Option<Radix>,
    pub byte_swap: bool,
    pub omit_addresses: bool,
    pub only: Option<Vec<String>>,
    pub omit: Vec<String>,
    pub raw: bool,
}

impl StageContext {
    // Runs the context hooks in application order, so the last radix rule wins.
    pub fn for_rules(rules: &[RuleApplication], registry: &RuleRegistry) -> (StageContext, Vec<String>) {
        let mut ctx = StageContext::default();
        let mut warnings: Vec<String> = Vec::new();
        for a in rules {
            if a.is_passthrough() {
                continue;
            }
            let Some(hook) = registry.get(a.rule).hooks.context else { continue };
            if let Err(e) = hook(a, &mut ctx) {
                warnings.push(format!("{}: {}", a.name, e));
            }
        }
        if ctx.only.is_some() && !ctx.omit.is_empty() {
            warnings.push("both only() and omit() apply; omit() ignored".to_string());
            ctx.omit.clear();
        }
        (ctx, warnings)
    }

    pub fn shows_field(&self, name: &str) -> bool {
        match &self.only {
            Some(only) => only.iter().any(|n| n == name),
            None => !self.omit.iter().any(|n| n == name),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpandSource {
    Default,
    Rule(usize), // index in the node's rule list
}

// State a rule's expand-info hook hands to its expand-range hook, or the default's precomputed field list.
#[derive(Clone, Debug)]
pub enum ExpandPayload {
    None,
    Fields(Vec<usize>), // indices of the struct fields that pass the only/omit filter
    Addresses(Vec<usize>),
}

#[derive(Clone, Debug)]
pub struct ExpandInfo {
    pub expandable: bool,
    pub child_count: usize,
    pub editable: bool,
    pub source: ExpandSource,
    pub payload: ExpandPayload,
    pub error: Option<Error>,
}

impl ExpandInfo {
    pub fn leaf(editable: bool) -> Self { Self {expandable: false, child_count: 0, editable, source: ExpandSource::Default, payload: ExpandPayload::None, error: None} }
    pub fn children(n: usize, payload: ExpandPayload) -> Self { Self {expandable: n > 0, child_count: n, editable: false, source: ExpandSource::Default, payload, error: None} }
    pub fn failed(e: Error) -> Self { Self {error: Some(e), ..Self::leaf(false)} }
}

// A child before its own rules are applied.
#[derive(Clone, Debug)]
pub struct ChildNode {
    pub name: String,
    pub expr: String,
    pub value: Result<Value>,
}

// Effective rules of a child: the parent's inherited rules, minus the ones the child overrides by name, then the child's own.
pub fn propagate_rules(parent: &[RuleApplication], explicit: &[RuleApplication], registry: &RuleRegistry) -> Vec<RuleApplication> {
    let mut res: Vec<RuleApplication> = parent.iter()
        .filter(|a| !a.is_passthrough() && registry.get(a.rule).flags.inherited && !explicit.iter().any(|e| e.name == a.name))
        .cloned().collect();
    res.extend(explicit.iter().cloned());
    res
}

fn rule_warnings(rules: &[RuleApplication], warnings: &mut Vec<String>, rule_errors: &mut Vec<Error>, cx: &mut EvalContext) {
    for a in rules {
        if a.unknown {
            log!(cx.log, "unknown rule '{}'", a.name);
            warnings.push(format!("unknown rule '{}'", a.name));
        } else if let Some(e) = &a.arg_error {
            log!(cx.log, "{}", e);
            warnings.push(e.message.clone());
            rule_errors.push(e.clone());
        }
    }
}

// Resolution stage. Each resolve hook sees what the previous one produced; rules without the hook pass the input through.
// A failing hook is reported on the node and skipped. Only cancellation aborts.
pub fn resolve_node(name: String, input: Result<Resolved>, rules: Vec<RuleApplication>, depth: usize, cx: &mut EvalContext) -> Result<Arc<ResolvedNode>> {
    let mut warnings: Vec<String> = Vec::new();
    let mut rule_errors: Vec<Error> = Vec::new();
    rule_warnings(&rules, &mut warnings, &mut rule_errors, cx);
    let (expr, value) = match &input {
        Err(e) if e.is_cancelled() => return Err(e.clone()),
        Err(e) => (name.clone(), Err(e.clone())),
        Ok(r) => {
            let mut cur = r.clone();
            for a in &rules {
                if a.is_passthrough() {
                    continue;
                }
                let hook = cx.registry.get(a.rule).hooks.resolve;
                match hook {
                    None => (), // identity
                    Some(hook) => match hook(a, cur.clone(), cx) {
                        Ok(next) => cur = next,
                        Err(e) if e.is_cancelled() => return Err(e),
                        Err(e) => {
                            let e = error!(RuleArgument, "{}: {}", a.name, e);
                            log!(cx.log, "{}", e);
                            warnings.push(e.message.clone());
                            rule_errors.push(e);
                        }
                    }
                }
            }
            (cur.expr, Ok(cur.value))
        }
    };
    Ok(Arc::new(ResolvedNode {name, expr, original: input, value, rules, warnings, rule_errors, depth}))
}

// Evaluates the watch expression and applies its annotation.
pub fn resolve_root(expr: &str, annotation: &str, cx: &mut EvalContext) -> Result<Arc<ResolvedNode>> {
    let rules = parse_annotation(annotation, cx.registry);
    let input = cx.eval_expression(expr).map(|value| Resolved {expr: expr.to_string(), value});
    resolve_node(expr.to_string(), input, rules, 0, cx)
}

pub fn resolve_child(parent: &ResolvedNode, child: ChildNode, explicit_annotation: Option<&str>, cx: &mut EvalContext) -> Result<Arc<ResolvedNode>> {
    let explicit = match explicit_annotation {
        Some(text) => parse_annotation(text, cx.registry),
        None => Vec::new(),
    };
    let rules = propagate_rules(&parent.rules, &explicit, cx.registry);
    let expr = child.expr;
    let input = child.value.map(|value| Resolved {expr, value});
    resolve_node(child.name, input, rules, parent.depth + 1, cx)
}

// Expand-info stage. The last rule with an expand-info hook decides; otherwise the type decides.
pub fn dispatch_expand_info(node: &ResolvedNode, ctx: &StageContext, cx: &mut EvalContext) -> Result<ExpandInfo> {
    let forced = node.rules.iter().any(|a| !a.is_passthrough() && cx.registry.get(a.rule).flags.forced_expandable);
    let hook = node.rules.iter().enumerate().rev()
        .filter(|(_, a)| !a.is_passthrough())
        .find_map(|(i, a)| cx.registry.get(a.rule).hooks.expand_info.map(|h| (i, h)));
    let mut info = match (&node.value, hook) {
        (Err(e), _) => ExpandInfo::failed(e.clone()),
        (Ok(_), Some((i, hook))) => match hook(&node.rules[i], node, ctx, cx) {
            Ok(mut info) => {
                info.source = ExpandSource::Rule(i);
                info
            }
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => ExpandInfo::failed(e),
        }
        (Ok(v), None) => match default_expand_info(v, ctx, cx) {
            Ok(info) => info,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => ExpandInfo::failed(e),
        }
    };
    if forced {
        info.expandable = true;
    }
    // Independent of how expansion went: a pointer with a garbage address is the one most worth editing.
    if let Ok(v) = &node.value {
        info.editable = is_editable(v, ctx, &cx.types);
    }
    Ok(info)
}

fn is_editable(v: &Value, ctx: &StageContext, types: &Types) -> bool {
    let t = &types.get(v.type_).t;
    v.val.addr().is_some() && !ctx.raw && match t {
        Type::Primitive(p) => !p.contains(PrimitiveFlags::UNSPECIFIED),
        Type::Enum(_) | Type::Pointer(_) => true,
        _ => false,
    }
}

pub fn default_expand_info(v: &Value, ctx: &StageContext, cx: &mut EvalContext) -> Result<ExpandInfo> {
    let max = cx.settings.max_array_children;
    let t = cx.types.get(v.type_);
    Ok(match &t.t {
        Type::Struct(s) => {
            let fields: Vec<usize> = s.fields.iter().enumerate().filter(|(_, f)| ctx.shows_field(&f.name)).map(|(i, _)| i).collect();
            ExpandInfo::children(fields.len(), ExpandPayload::Fields(fields))
        }
        Type::Array(a) => ExpandInfo::children(a.len.min(max), ExpandPayload::None),
        Type::Slice(_) => {
            let (_, len) = read_slice(v, &mut cx.memory)?;
            ExpandInfo::children(len.min(max), ExpandPayload::None)
        }
        Type::Pointer(p) => {
            let target = cx.types.get(p.type_);
            let n = match &target.t {
                Type::Unknown => 0,
                Type::Primitive(f) if f.contains(PrimitiveFlags::UNSPECIFIED) => 0,
                Type::Array(a) => a.len.min(max),
                _ => 1,
            };
            let mut info = ExpandInfo::children(n, ExpandPayload::None);
            if n > 0 {
                let addr = read_integer(v, ctx.byte_swap, &cx.types, &mut cx.memory)?;
                if addr == 0 {
                    info.expandable = false;
                    info.child_count = 0;
                } else {
                    // Unreadable pointee means no children.
                    let mut probe = [0u8; 1];
                    cx.memory.read(addr, &mut probe)?;
                }
            }
            info
        }
        _ => ExpandInfo::leaf(false),
    })
}

// Expand-range stage: children in `range` only. Rules that decided expand-info also produce the children.
pub fn dispatch_expand_range(node: &ResolvedNode, info: &ExpandInfo, range: Range<usize>, ctx: &StageContext, cx: &mut EvalContext) -> Result<Vec<ChildNode>> {
    let range = range.start.min(info.child_count)..range.end.min(info.child_count);
    if range.is_empty() {
        return Ok(Vec::new());
    }
    let v = match &node.value {
        Ok(v) => v,
        Err(e) => return Err(e.clone()),
    };
    if let ExpandSource::Rule(i) = info.source {
        let a = &node.rules[i];
        let hook = cx.registry.get(a.rule).hooks.expand_range;
        if let Some(hook) = hook {
            return hook(a, node, info, range, ctx, cx);
        }
    }
    default_expand_range(&node.expr, v, info, range, ctx, cx)
}

fn element_child(name_idx: usize, expr: String, base: &AddrOrValueBlob, elem: TypeIdx, stride: usize, cx: &mut EvalContext) -> ChildNode {
    let name = format!("[{}]", name_idx);
    let size = cx.types.get(elem).size;
    let value = match base {
        AddrOrValueBlob::Addr(a) => element_addr(*a, name_idx, stride).map(|a| Value::at(a, elem)),
        AddrOrValueBlob::Blob(b) => b.byte_range(name_idx * stride..name_idx * stride + size).map(|b| Value::blob(b, elem)),
    };
    ChildNode {name, expr, value}
}

pub fn default_expand_range(expr: &str, v: &Value, info: &ExpandInfo, range: Range<usize>, ctx: &StageContext, cx: &mut EvalContext) -> Result<Vec<ChildNode>> {
    let mut res: Vec<ChildNode> = Vec::new();
    let t = cx.types.get(v.type_).t.clone();
    match &t {
        Type::Struct(s) => {
            let all: Vec<usize>;
            let fields = match &info.payload {
                ExpandPayload::Fields(f) => f,
                _ => { all = (0..s.fields.len()).collect(); &all }
            };
            for &fi in &fields[range.start.min(fields.len())..range.end.min(fields.len())] {
                cx.memory.cancel.check()?;
                let f = &s.fields[fi];
                let value = get_struct_field(&v.val, f, &cx.types, &mut cx.memory).map(|val| Value {val, type_: f.type_});
                res.push(ChildNode {name: f.name.clone(), expr: child_path_field(expr, &f.name), value});
            }
        }
        Type::Array(_) => {
            let (elem, stride) = cx.types.element_layout(v.type_).unwrap_or((cx.types.builtins().unknown, 0));
            for i in range {
                res.push(element_child(i, child_path_index(expr, i), &v.val, elem, stride, cx));
            }
        }
        Type::Slice(s) => {
            let (ptr, _) = read_slice(v, &mut cx.memory)?;
            let stride = cx.types.get(s.type_).size;
            let type_name = cx.types.type_name(s.type_);
            for i in range {
                let e = match element_addr(ptr, i, stride) {
                    Ok(a) => expression_for_address(a, &type_name),
                    Err(_) => child_path_index(expr, i),
                };
                res.push(element_child(i, e, &AddrOrValueBlob::Addr(ptr), s.type_, stride, cx));
            }
        }
        Type::Pointer(p) => {
            let addr = read_integer(v, ctx.byte_swap, &cx.types, &mut cx.memory)?;
            let deref_expr = child_path_deref(expr);
            if cx.types.get(p.type_).t.as_array().is_some() {
                let (elem, stride) = cx.types.element_layout(p.type_).unwrap_or((cx.types.builtins().unknown, 0));
                for i in range {
                    res.push(element_child(i, child_path_index(&deref_expr, i), &AddrOrValueBlob::Addr(addr), elem, stride, cx));
                }
            } else {
                res.push(ChildNode {name: "*".to_string(), expr: deref_expr, value: Ok(Value::at(addr, p.type_))});
            }
        }
        _ => return err!(NotContainer, "{} has no children", t.kind_name()),
    }
    Ok(res)
}

#[derive(Clone, Debug)]
pub enum Stage {
    Resolve,
    ExpandInfo,
    ExpandRange(Range<usize>),
    Stringize(Budget),
}

#[derive(Debug)]
pub enum StageArtifact {
    Node(Arc<ResolvedNode>),
    ExpandInfo(ExpandInfo),
    Children(Vec<ChildNode>),
    Line(String),
}

// One entry point for all stages, for callers that drive the pipeline generically (tools, tests).
// Resolve re-runs resolution from the node's original input and returns a new node.
pub fn dispatch(stage: Stage, node: &Arc<ResolvedNode>, ctx: &StageContext, cx: &mut EvalContext) -> Result<StageArtifact> {
    Ok(match stage {
        Stage::Resolve => StageArtifact::Node(resolve_node(node.name.clone(), node.original.clone(), node.rules.clone(), node.depth, cx)?),
        Stage::ExpandInfo => StageArtifact::ExpandInfo(dispatch_expand_info(node, ctx, cx)?),
        Stage::ExpandRange(range) => {
            let info = dispatch_expand_info(node, ctx, cx)?;
            StageArtifact::Children(dispatch_expand_range(node, &info, range, ctx, cx)?)
        }
        Stage::Stringize(budget) => StageArtifact::Line(format_node_line(node, ctx, false, None, budget, cx)?),
    })
}

#[cfg(test)]
mod tests {
    use crate::{*, dispatch::*, testing::*};

    fn children(node: &ResolvedNode, cx: &mut EvalContext) -> (ExpandInfo, Vec<ChildNode>) {
        let (ctx, _) = StageContext::for_rules(&node.rules, cx.registry);
        let info = dispatch_expand_info(node, &ctx, cx).unwrap();
        let c = dispatch_expand_range(node, &info, 0..usize::MAX, &ctx, cx).unwrap();
        (info, c)
    }

    fn addrs(c: &[ChildNode]) -> Vec<usize> { c.iter().map(|c| c.value.as_ref().unwrap().val.addr().unwrap()).collect() }

    #[test]
    fn no_rules_is_default() {
        let f = Fixture::new();
        let mut cx = f.cx();
        let node = resolve_root("outer", "", &mut cx).unwrap();
        assert!(node.rules.is_empty() && node.warnings.is_empty());
        assert_eq!(node.expr, "outer");
        let (ctx, w) = StageContext::for_rules(&node.rules, cx.registry);
        assert!(w.is_empty());
        let info = dispatch_expand_info(&node, &ctx, &mut cx).unwrap();
        let default = default_expand_info(node.value.as_ref().unwrap(), &StageContext::default(), &mut cx).unwrap();
        assert_eq!((info.expandable, info.child_count, info.source), (default.expandable, default.child_count, ExpandSource::Default));
        let (_, c) = children(&node, &mut cx);
        let names: Vec<&str> = c.iter().map(|c| &c.name as &str).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(c[1].expr, "outer.b");
    }

    #[test]
    fn array_rule_addresses() {
        let f = Fixture::new();
        let mut cx = f.cx();
        let node = resolve_root("arr_ptr", "array(3)", &mut cx).unwrap();
        assert!(node.rule_errors.is_empty(), "{:?}", node.rule_errors);
        let (info, c) = children(&node, &mut cx);
        assert_eq!(info.child_count, 3);
        assert_eq!(addrs(&c), vec![0x2000, 0x2004, 0x2008]);
        assert_eq!(c[2].name, "[2]");
        // Child expressions evaluate to the same place.
        let v = cx.eval_expression(&c[2].expr).unwrap();
        assert_eq!(v.val.addr(), Some(0x2008));

        // Size is an expression, evaluated in the watch's scope.
        let node = resolve_root("arr_ptr", "array(pair.len + 1)", &mut cx).unwrap();
        assert_eq!(children(&node, &mut cx).0.child_count, 4);

        // On an array, resizes it.
        let node = resolve_root("hello", "array(2)", &mut cx).unwrap();
        assert_eq!(children(&node, &mut cx).0.child_count, 2);
    }

    #[test]
    fn rule_order_matters() {
        let f = Fixture::new();
        let mut cx = f.cx();
        let a = resolve_root("arr_ptr", "cast(*u64) array(2)", &mut cx).unwrap();
        let b = resolve_root("arr_ptr", "array(2) cast(*u64)", &mut cx).unwrap();
        let (ia, ca) = children(&a, &mut cx);
        let (ib, cb) = children(&b, &mut cx);
        assert_eq!(ia.child_count, 2);
        assert_eq!(addrs(&ca), vec![0x2000, 0x2008]);
        assert_eq!(ib.child_count, 1);
        assert_eq!(cb[0].name, "*");
        assert_ne!(cx.types.type_name(a.value.as_ref().unwrap().type_), cx.types.type_name(b.value.as_ref().unwrap().type_));
    }

    #[test]
    fn inheritance() {
        let f = Fixture::new();
        let mut cx = f.cx();
        let root = resolve_root("outer", "hex cast(Outer) only(\"a,b\")", &mut cx).unwrap();
        let (_, c) = children(&root, &mut cx);
        let b = resolve_child(&root, c[1].clone(), None, &mut cx).unwrap();
        let names: Vec<&str> = b.rules.iter().map(|a| &a.name as &str).collect();
        assert_eq!(names, vec!["hex", "only"]);

        // Explicit rule on the child replaces the inherited one with the same name.
        let b2 = resolve_child(&root, c[1].clone(), Some("only(c) bin"), &mut cx).unwrap();
        let texts: Vec<String> = b2.rules.iter().map(|a| a.to_text()).collect();
        assert_eq!(texts, vec!["hex", "only(c)", "bin"]);
        let (ctx, _) = StageContext::for_rules(&b2.rules, cx.registry);
        assert_eq!(ctx.radix, Some(Radix::Bin));
        assert_eq!(ctx.only, Some(vec!["c".to_string()]));

        // Grandchildren too.
        let (_, gc) = children(&b, &mut cx);
        assert_eq!(gc.len(), 2);
        let g = resolve_child(&b, gc[0].clone(), None, &mut cx).unwrap();
        assert_eq!(g.rules.len(), 2);
        assert!(!g.has_rule("cast"));
    }

    #[test]
    fn only_and_omit() {
        let f = Fixture::new();
        let mut cx = f.cx();
        let node = resolve_root("pt", "only(x)", &mut cx).unwrap();
        let (_, c) = children(&node, &mut cx);
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].name, "x");

        let node = resolve_root("outer", "omit(b)", &mut cx).unwrap();
        let (_, c) = children(&node, &mut cx);
        assert_eq!(c.iter().map(|c| c.name.clone()).collect::<Vec<_>>(), vec!["a", "c"]);

        let node = resolve_root("pt", "omit(x) only(x)", &mut cx).unwrap();
        let (ctx, w) = StageContext::for_rules(&node.rules, cx.registry);
        assert_eq!(w.len(), 1);
        assert!(ctx.omit.is_empty());
        assert_eq!(children(&node, &mut cx).1.len(), 1);
    }

    #[test]
    fn unknown_and_malformed() {
        let f = Fixture::new();
        let mut cx = f.cx();
        let plain = resolve_root("pt", "", &mut cx).unwrap();
        let node = resolve_root("pt", "frobnicate", &mut cx).unwrap();
        assert_eq!(node.warnings, vec!["unknown rule 'frobnicate'".to_string()]);
        assert!(node.rule_errors.is_empty());
        assert_eq!(children(&node, &mut cx).1.len(), children(&plain, &mut cx).1.len());
        assert_eq!(cx.log.lines.len(), 1);

        let node = resolve_root("arr_ptr", "array(1 +) hex", &mut cx).unwrap();
        assert_eq!(node.rule_errors.len(), 1);
        assert!(node.rule_errors[0].is_rule_argument());
        assert_eq!(children(&node, &mut cx).1.len(), 1); // plain pointer

        let node = resolve_root("pt", "cast(Frob)", &mut cx).unwrap();
        assert_eq!(node.rule_errors.len(), 1);
        assert_eq!(cx.types.type_name(node.value.as_ref().unwrap().type_), "Point");

        let node = resolve_root("nope", "hex", &mut cx).unwrap();
        assert!(node.value.is_err());
        let (ctx, _) = StageContext::for_rules(&node.rules, cx.registry);
        let info = dispatch_expand_info(&node, &ctx, &mut cx).unwrap();
        assert!(!info.expandable && info.error.is_some());
    }

    #[test]
    fn unreadable_pointee_has_no_children() {
        let f = Fixture::new();
        let mut cx = f.cx();
        let node = resolve_root("bad_ptr", "", &mut cx).unwrap();
        let (info, c) = children(&node, &mut cx);
        assert_eq!(info.child_count, 0);
        assert!(info.error.as_ref().unwrap().is_unreadable());
        assert!(c.is_empty());
    }

    #[test]
    fn list_and_slice() {
        let f = Fixture::new();
        let mut cx = f.cx();
        let node = resolve_root("head", "list(next)", &mut cx).unwrap();
        let (info, c) = children(&node, &mut cx);
        assert!(info.expandable);
        assert_eq!(info.source, ExpandSource::Rule(0));
        assert_eq!(addrs(&c), vec![0x3000, 0x3010, 0x3020]);
        assert_eq!(c[1].expr, "*(0x3010 as *Node)");
        // Window.
        let (ctx, _) = StageContext::for_rules(&node.rules, cx.registry);
        let w = dispatch_expand_range(&node, &info, 1..2, &ctx, &mut cx).unwrap();
        assert_eq!(addrs(&w), vec![0x3010]);

        let ring = resolve_root("ring", "list(next)", &mut cx).unwrap();
        assert_eq!(children(&ring, &mut cx).0.child_count, 2);

        // Forced expandable even when the list is empty.
        let null = resolve_root("null_node", "list(next)", &mut cx).unwrap();
        let (info, c) = children(&null, &mut cx);
        assert!(info.expandable && c.is_empty());

        let bad = resolve_root("pt", "list(next)", &mut cx).unwrap();
        assert!(children(&bad, &mut cx).0.error.is_some());

        let node = resolve_root("pair", "slice", &mut cx).unwrap();
        assert!(node.rule_errors.is_empty(), "{:?}", node.rule_errors);
        let (info, c) = children(&node, &mut cx);
        assert_eq!(info.child_count, 3);
        assert_eq!(addrs(&c), vec![0x2000, 0x2004, 0x2008]);
    }

    #[test]
    fn byte_swapped_addresses() {
        let f = Fixture::new();
        let mut cx = f.cx();
        // Stored big-endian: only the swapped value points at readable memory.
        let node = resolve_root("be_ptr", "bswap", &mut cx).unwrap();
        let (info, c) = children(&node, &mut cx);
        assert_eq!(info.child_count, 1);
        assert_eq!(addrs(&c), vec![0x2000]);
        let plain = resolve_root("be_ptr", "", &mut cx).unwrap();
        assert_eq!(children(&plain, &mut cx).0.child_count, 0);

        let node = resolve_root("be_head", "list(next) bswap", &mut cx).unwrap();
        let (info, c) = children(&node, &mut cx);
        assert_eq!(info.child_count, 2);
        assert_eq!(addrs(&c), vec![0x3040, 0x3050]);
        assert_eq!(c[1].expr, "*(0x3050 as *Node)");
        // bswap is inherited, so the node's own pointer field is swapped too.
        let n1 = resolve_child(&node, c[0].clone(), None, &mut cx).unwrap();
        assert!(n1.has_rule("bswap") && !n1.has_rule("list"));
        let (_, fields) = children(&n1, &mut cx);
        let next = resolve_child(&n1, fields[1].clone(), None, &mut cx).unwrap();
        assert_eq!(addrs(&children(&next, &mut cx).1), vec![0x3050]);
    }

    #[test]
    fn top_of_address_space() {
        let f = Fixture::new();
        let mut cx = f.cx();
        let node = resolve_root("*((0 - 16) as *[i32; 8])", "", &mut cx).unwrap();
        let (info, c) = children(&node, &mut cx);
        assert_eq!(info.child_count, 8);
        assert_eq!(c[3].value.as_ref().unwrap().val.addr(), Some(usize::MAX - 3));
        assert!(c[4].value.as_ref().unwrap_err().is_unreadable());
        assert!(c[7].value.as_ref().unwrap_err().is_unreadable());

        // The head can't be read; the list is just that node.
        let node = resolve_root("(0 - 4) as *Node", "list(next)", &mut cx).unwrap();
        let (info, c) = children(&node, &mut cx);
        assert!(info.error.is_none());
        assert_eq!(addrs(&c), vec![usize::MAX - 3]);
        let n = resolve_child(&node, c[0].clone(), None, &mut cx).unwrap();
        let (_, fields) = children(&n, &mut cx);
        assert!(fields[1].value.as_ref().unwrap_err().is_unreadable());

        assert!(element_addr(usize::MAX - 3, 1, 4).unwrap_err().is_unreadable());
        assert!(element_addr(0x2000, usize::MAX, 2).unwrap_err().is_unreadable());
        assert_eq!(element_addr(0x2000, 2, 4).unwrap(), 0x2008);
    }

    #[test]
    fn editable_regardless_of_expansion() {
        let f = Fixture::new();
        let mut cx = f.cx();
        for (expr, annotation) in [("bad_ptr", ""), ("arr_ptr", ""), ("head", "list(next)"), ("pt.x", "")] {
            let node = resolve_root(expr, annotation, &mut cx).unwrap();
            let (ctx, _) = StageContext::for_rules(&node.rules, cx.registry);
            assert!(dispatch_expand_info(&node, &ctx, &mut cx).unwrap().editable, "{}", expr);
        }
        for (expr, annotation) in [("pt", ""), ("arr_ptr", "raw"), ("pt.x + 1", "")] {
            let node = resolve_root(expr, annotation, &mut cx).unwrap();
            let (ctx, _) = StageContext::for_rules(&node.rules, cx.registry);
            assert!(!dispatch_expand_info(&node, &ctx, &mut cx).unwrap().editable, "{}", expr);
        }
    }

    #[test]
    fn generic_dispatch() {
        let f = Fixture::new();
        let mut cx = f.cx();
        let node = resolve_root("arr_ptr", "array(2)", &mut cx).unwrap();
        let ctx = StageContext::default();
        match dispatch(Stage::Resolve, &node, &ctx, &mut cx).unwrap() {
            StageArtifact::Node(n) => {
                assert!(!Arc::ptr_eq(&n, &node));
                assert_eq!(n.expr, node.expr);
            }
            a => panic!("{:?}", a),
        }
        match dispatch(Stage::ExpandRange(1..5), &node, &ctx, &mut cx).unwrap() {
            StageArtifact::Children(c) => assert_eq!(addrs(&c), vec![0x2004]),
            a => panic!("{:?}", a),
        }
        match dispatch(Stage::Stringize(Budget {chars: 100, depth: 2}), &node, &ctx, &mut cx).unwrap() {
            StageArtifact::Line(s) => assert_eq!(s, "*0x2000 [10, 20]"),
            a => panic!("{:?}", a),
        }
    }

    #[test]
    fn cancellation() {
        let f = Fixture::new();
        let mut cx = f.cx();
        let node = resolve_root("outer", "", &mut cx).unwrap();
        cx.memory.cancel.cancel();
        let (ctx, _) = StageContext::for_rules(&node.rules, cx.registry);
        let info = dispatch_expand_info(&node, &ctx, &mut cx).unwrap();
        assert!(dispatch_expand_range(&node, &info, 0..3, &ctx, &mut cx).unwrap_err().is_cancelled());
        assert!(resolve_root("head->val", "", &mut cx).unwrap_err().is_cancelled());
    }
}
