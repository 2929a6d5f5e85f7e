use crate::{*, error::*, expr::*, annotation::*, dispatch::*};
use std::{collections::HashMap, ops::Range, sync::OnceLock};

// What the annotation parser checks a rule's argument text against. Only the shape is checked;
// the meaning (e.g. whether a type name exists) is up to the rule's hooks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgSchema {
    None,
    Expr, // array(n * 2)
    TypeName, // cast(*u64)
    NameList, // only("a,b") or only(a, b)
    Ident, // list(next)
    Template, // wrap(foo($, 10))
}

impl ArgSchema {
    // For tooling and error messages.
    pub fn describe(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Expr => "(expression)",
            Self::TypeName => "(type)",
            Self::NameList => "(\"name,name,...\")",
            Self::Ident => "(field)",
            Self::Template => "(expression with $)",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RuleFlags {
    // Applies to all descendants of the annotated node, not just the node.
    pub inherited: bool,
    // Node is expandable even if its type says otherwise.
    pub forced_expandable: bool,
}

// Rewrites the node's (expression, value) pair. Sees what the previous rule in the chain produced.
pub type ResolveHook = fn(&RuleApplication, Resolved, &mut EvalContext) -> Result<Resolved>;
// Replaces the type-driven decision about whether and how a node expands.
pub type ExpandInfoHook = fn(&RuleApplication, &ResolvedNode, &StageContext, &mut EvalContext) -> Result<ExpandInfo>;
// Produces children in the given index range, given what the rule's expand-info hook returned.
pub type ExpandRangeHook = fn(&RuleApplication, &ResolvedNode, &ExpandInfo, Range<usize>, &StageContext, &mut EvalContext) -> Result<Vec<ChildNode>>;
// Adjusts inherited formatting state (radix, byte order, member filters, ...).
pub type ContextHook = fn(&RuleApplication, &mut StageContext) -> Result<()>;

// None means the rule doesn't participate in that stage; the dispatcher substitutes the default behavior.
#[derive(Clone, Copy, Default, Debug)]
pub struct RuleHooks {
    pub resolve: Option<ResolveHook>,
    pub expand_info: Option<ExpandInfoHook>,
    pub expand_range: Option<ExpandRangeHook>,
    pub context: Option<ContextHook>,
}

#[derive(Clone, Debug)]
pub struct RuleSpec {
    pub name: &'static str,
    pub display_name: &'static str,
    pub description: &'static str,
    pub schema: ArgSchema,
    pub flags: RuleFlags,
    pub hooks: RuleHooks,
}

impl RuleSpec {
    // e.g. "array(expression)"
    pub fn signature(&self) -> String { format!("{}{}", self.name, self.schema.describe()) }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RuleIdx(pub usize);

// Built once, then only read. Shared by all concurrently evaluated watches.
pub struct RuleRegistry {
    specs: Vec<RuleSpec>,
    by_name: HashMap<&'static str, RuleIdx>,
}

pub const NOP_RULE: &str = "nop";

impl RuleRegistry {
    // Just the no-op rule, which unknown rule names resolve to.
    pub fn new() -> Self {
        let mut r = Self {specs: Vec::new(), by_name: HashMap::new()};
        r.specs.push(RuleSpec {name: NOP_RULE, display_name: "no-op", description: "does nothing; unknown rule names are treated as this", schema: ArgSchema::None, flags: RuleFlags::default(), hooks: RuleHooks::default()});
        r.by_name.insert(NOP_RULE, RuleIdx(0));
        r
    }

    pub fn with_builtins() -> Self {
        let mut r = Self::new();
        pretty::register_builtin_rules(&mut r);
        r
    }

    // Process-wide registry with the built-in rules.
    pub fn builtin() -> &'static RuleRegistry {
        static REGISTRY: OnceLock<RuleRegistry> = OnceLock::new();
        REGISTRY.get_or_init(Self::with_builtins)
    }

    // Names are unique and case-sensitive.
    pub fn register(&mut self, spec: RuleSpec) -> Result<RuleIdx> {
        if self.by_name.contains_key(spec.name) {
            return err!(Usage, "rule '{}' is already registered", spec.name);
        }
        if spec.name.is_empty() || !spec.name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return err!(Usage, "bad rule name: '{}'", spec.name);
        }
        let idx = RuleIdx(self.specs.len());
        self.by_name.insert(spec.name, idx);
        self.specs.push(spec);
        Ok(idx)
    }

    pub fn find(&self, name: &str) -> Option<RuleIdx> { self.by_name.get(name).copied() }

    pub fn lookup(&self, name: &str) -> Result<&RuleSpec> {
        match self.find(name) {
            Some(i) => Ok(&self.specs[i.0]),
            None => err!(UnknownRule, "unknown rule '{}'", name),
        }
    }

    pub fn get(&self, idx: RuleIdx) -> &RuleSpec { &self.specs[idx.0] }

    pub fn nop(&self) -> RuleIdx { RuleIdx(0) }

    pub fn enumerate(&self) -> &[RuleSpec] { &self.specs }
}

// Extra per-rule data attached by a higher layer (e.g. UI hooks that build custom widgets for a row),
// keyed by the names of rules that already exist in the registry.
pub struct RuleExtensions<H> {
    hooks: HashMap<RuleIdx, H>,
}

impl<H> RuleExtensions<H> {
    pub fn new() -> Self { Self {hooks: HashMap::new()} }

    pub fn register(&mut self, registry: &RuleRegistry, name: &str, hook: H) -> Result<()> {
        let Some(idx) = registry.find(name) else { return err!(UnknownRule, "can't extend unknown rule '{}'", name) };
        if self.hooks.contains_key(&idx) {
            return err!(Usage, "rule '{}' already has an extension", name);
        }
        self.hooks.insert(idx, hook);
        Ok(())
    }

    pub fn get(&self, idx: RuleIdx) -> Option<&H> { self.hooks.get(&idx) }

    // Extensions for a node's rules, in application order.
    pub fn for_rules<'a>(&'a self, rules: &'a [RuleApplication]) -> impl Iterator<Item = (&'a RuleApplication, &'a H)> + 'a {
        rules.iter().filter(|a| !a.is_passthrough()).filter_map(move |a| self.get(a.rule).map(|h| (a, h)))
    }
}

#[cfg(test)]
mod tests {
    use crate::{*, registry::*};

    #[test]
    fn lookup_and_register() {
        let r = RuleRegistry::builtin();
        assert_eq!(r.nop(), RuleIdx(0));
        assert_eq!(r.lookup("array").unwrap().schema, ArgSchema::Expr);
        assert!(r.lookup("hex").unwrap().flags.inherited);
        assert!(!r.lookup("cast").unwrap().flags.inherited);
        assert!(r.lookup("list").unwrap().flags.forced_expandable);
        assert!(r.lookup("Array").unwrap_err().is_unknown_rule());
        assert!(r.lookup("frobnicate").unwrap_err().is_unknown_rule());
        for name in ["array", "cast", "wrap", "slice", "list", "bin", "oct", "dec", "hex", "bswap", "only", "omit", "no_addr", "raw", "nop"] {
            assert!(r.enumerate().iter().any(|s| s.name == name), "{}", name);
        }
        assert_eq!(r.lookup("only").unwrap().signature(), "only(\"name,name,...\")");

        // Absent hooks are None, not stubs.
        let hex = r.lookup("hex").unwrap();
        assert!(hex.hooks.resolve.is_none() && hex.hooks.expand_info.is_none() && hex.hooks.context.is_some());

        let mut r = RuleRegistry::with_builtins();
        let spec = RuleSpec {name: "hex", display_name: "", description: "", schema: ArgSchema::None, flags: RuleFlags::default(), hooks: RuleHooks::default()};
        assert!(r.register(spec.clone()).is_err());
        let idx = r.register(RuleSpec {name: "mine", ..spec.clone()}).unwrap();
        assert_eq!(r.find("mine"), Some(idx));
        assert!(r.register(RuleSpec {name: "bad name", ..spec}).is_err());
    }

    #[test]
    fn extensions() {
        let r = RuleRegistry::builtin();
        let mut ext: RuleExtensions<&'static str> = RuleExtensions::new();
        ext.register(r, "list", "list widget").unwrap();
        assert!(ext.register(r, "list", "again").is_err());
        assert!(ext.register(r, "frobnicate", "x").unwrap_err().is_unknown_rule());
        let rules = parse_annotation("hex list(next) frobnicate", r);
        let found: Vec<&str> = ext.for_rules(&rules).map(|(a, h)| { assert_eq!(a.name, "list"); *h }).collect();
        assert_eq!(found, vec!["list widget"]);
    }
}
