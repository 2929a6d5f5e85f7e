use crate::{*, error::*, expr::*, dispatch::*, stringize::*, edit::*, log::*};
use std::{collections::{BTreeSet, HashMap}, ops::Range, sync::Arc};

// Which rows of a watch tree are expanded, and annotations the user attached to individual descendants.
// Rows are identified by index paths from the root: [] is the root, [1, 0] is the first child of the root's second child.
// Index paths survive re-evaluation as long as the shape of the data doesn't change, unlike node identities.
#[derive(Clone, Debug, Default)]
pub struct ExpansionState {
    pub expanded: BTreeSet<Vec<usize>>,
    // Child expression text -> annotation, e.g. "outer.b" -> "only(c)".
    pub child_rules: HashMap<String, String>,
}

impl ExpansionState {
    pub fn root_expanded() -> Self {
        let mut s = Self::default();
        s.expanded.insert(Vec::new());
        s
    }

    pub fn is_expanded(&self, path: &[usize]) -> bool { self.expanded.contains(path) }

    pub fn expand(&mut self, path: &[usize]) { self.expanded.insert(path.to_vec()); }

    // Descendants stay in the set, so re-expanding restores them.
    pub fn collapse(&mut self, path: &[usize]) { self.expanded.remove(path); }

    pub fn toggle(&mut self, path: &[usize]) {
        if self.is_expanded(path) { self.collapse(path) } else { self.expand(path) }
    }

    pub fn set_child_rules(&mut self, expr: &str, annotation: &str) {
        if annotation.trim().is_empty() {
            self.child_rules.remove(expr);
        } else {
            self.child_rules.insert(expr.to_string(), annotation.to_string());
        }
    }

    // Indices of expanded direct children of `path`, sorted.
    fn expanded_children(&self, path: &[usize], child_count: usize) -> Vec<usize> {
        let mut res: Vec<usize> = self.expanded.iter()
            .filter(|p| p.len() == path.len() + 1 && p.starts_with(path) && p[path.len()] < child_count)
            .map(|p| p[path.len()]).collect();
        res.dedup();
        res
    }
}

// A node whose expand-info is known. Shared between the block that shows it and the blocks of its children.
#[derive(Debug)]
pub struct ExpansionFrame {
    pub node: Arc<ResolvedNode>,
    pub ctx: StageContext,
    pub info: ExpandInfo,
    pub path: Vec<usize>,
    pub expanded: bool,
    pub warnings: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VizBlockKind {
    Root, // the watch expression itself
    FlatRun, // consecutive collapsed children, produced by the default expansion
    SubExpansion, // one expanded child; its own children follow as separate blocks
    Custom, // consecutive collapsed children, produced by a rule's expand-range hook
}

#[derive(Clone, Debug)]
pub struct VizBlock {
    pub kind: VizBlockKind,
    // Root, SubExpansion: the node shown in the block's only row. FlatRun, Custom: the node whose children the rows are.
    pub frame: Arc<ExpansionFrame>,
    pub range: Range<usize>, // child indices; empty for Root
    pub depth: usize, // of the rows
}

impl VizBlock {
    pub fn num_rows(&self) -> usize {
        match self.kind {
            VizBlockKind::Root | VizBlockKind::SubExpansion => 1,
            VizBlockKind::FlatRun | VizBlockKind::Custom => self.range.len(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct VizRow {
    pub name: String,
    pub expr: String,
    pub display: String,
    pub edit: Option<String>, // None if not editable
    pub expandable: bool,
    pub expanded: bool,
    pub editable: bool,
    pub depth: usize,
    pub path: Vec<usize>,
    pub warnings: Vec<String>,
    pub node: Arc<ResolvedNode>,
    pub ctx: StageContext,
}

impl VizRow {
    pub fn has_warning(&self) -> bool { !self.warnings.is_empty() || !self.node.rule_errors.is_empty() }
}

fn make_frame(node: Arc<ResolvedNode>, path: Vec<usize>, state: &ExpansionState, cx: &mut EvalContext) -> Result<Arc<ExpansionFrame>> {
    let (ctx, ctx_warnings) = StageContext::for_rules(&node.rules, cx.registry);
    for w in &ctx_warnings {
        log!(cx.log, "{}: {}", node.name, w);
    }
    let info = dispatch_expand_info(&node, &ctx, cx)?;
    let mut warnings = node.warnings.clone();
    warnings.extend(ctx_warnings);
    if let (Some(e), Ok(_)) = (&info.error, &node.value) {
        warnings.push(e.to_string());
    }
    let expanded = info.expandable && state.is_expanded(&path);
    Ok(Arc::new(ExpansionFrame {node, ctx, info, path, expanded, warnings}))
}

// Children in `range`; if the parent fails to produce them, placeholder children carrying the error,
// so that the block still has the number of rows it promised.
fn children_in_range(frame: &ExpansionFrame, range: Range<usize>, cx: &mut EvalContext) -> Result<Vec<ChildNode>> {
    match dispatch_expand_range(&frame.node, &frame.info, range.clone(), &frame.ctx, cx) {
        Ok(mut c) => {
            // A hook may return fewer children than asked (e.g. the list changed under us).
            while c.len() < range.len() {
                let i = range.start + c.len();
                c.push(ChildNode {name: format!("[{}]", i), expr: String::new(), value: err!(Sanity, "child {} disappeared", i)});
            }
            c.truncate(range.len());
            Ok(c)
        }
        Err(e) if e.is_cancelled() => Err(e),
        Err(e) => Ok(range.map(|i| ChildNode {name: format!("[{}]", i), expr: String::new(), value: Err(e.clone())}).collect()),
    }
}

fn resolve_child_frame(parent: &ExpansionFrame, child: ChildNode, idx: usize, state: &ExpansionState, cx: &mut EvalContext) -> Result<Arc<ExpansionFrame>> {
    let explicit = state.child_rules.get(&child.expr).map(|s| s.as_str());
    let node = resolve_child(&parent.node, child, explicit, cx)?;
    let mut path = parent.path.clone();
    path.push(idx);
    make_frame(node, path, state, cx)
}

fn add_children_blocks(frame: &Arc<ExpansionFrame>, state: &ExpansionState, blocks: &mut Vec<VizBlock>, cx: &mut EvalContext) -> Result<()> {
    let count = frame.info.child_count;
    let depth = frame.node.depth + 1;
    let run_kind = match frame.info.source {
        ExpandSource::Rule(_) => VizBlockKind::Custom,
        ExpandSource::Default => VizBlockKind::FlatRun,
    };
    let mut cursor = 0usize;
    for i in state.expanded_children(&frame.path, count) {
        if cursor < i {
            blocks.push(VizBlock {kind: run_kind, frame: frame.clone(), range: cursor..i, depth});
        }
        let child = children_in_range(frame, i..i+1, cx)?.pop();
        let Some(child) = child else { return err!(Sanity, "no child {}", i) };
        let child_frame = resolve_child_frame(frame, child, i, state, cx)?;
        let expanded = child_frame.expanded;
        blocks.push(VizBlock {kind: VizBlockKind::SubExpansion, frame: child_frame.clone(), range: i..i+1, depth});
        if expanded {
            add_children_blocks(&child_frame, state, blocks, cx)?;
        }
        cursor = i + 1;
    }
    if cursor < count {
        blocks.push(VizBlock {kind: run_kind, frame: frame.clone(), range: cursor..count, depth});
    }
    Ok(())
}

// Stage 2: the logical row sequence of a watch, as blocks. Only expanded nodes are resolved here;
// collapsed children stay unresolved until a row window covers them.
pub fn produce_blocks(expr: &str, annotation: &str, state: &ExpansionState, cx: &mut EvalContext) -> Result<Vec<VizBlock>> {
    let _prof = ProfileScope::with_threshold(cx.settings.profile_threshold_secs, format!("blocks for '{}'", expr));
    let root = resolve_root(expr, annotation, cx)?;
    let frame = make_frame(root, Vec::new(), state, cx)?;
    let mut blocks = vec![VizBlock {kind: VizBlockKind::Root, frame: frame.clone(), range: 0..0, depth: 0}];
    if frame.expanded {
        add_children_blocks(&frame, state, &mut blocks, cx)?;
    }
    Ok(blocks)
}

pub fn total_rows(blocks: &[VizBlock]) -> usize { blocks.iter().map(|b| b.num_rows()).sum() }

fn make_row(frame: &ExpansionFrame, budget: Budget, cx: &mut EvalContext) -> Result<VizRow> {
    let node = &frame.node;
    let display = format_node_line(node, &frame.ctx, frame.expanded, Some(&frame.info), budget, cx)?;
    let edit = match (&node.value, frame.info.editable) {
        (Ok(v), true) => match edit_string(v, &frame.ctx, cx) {
            Ok(s) => Some(s),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(_) => None,
        }
        _ => None,
    };
    let editable = edit.is_some();
    Ok(VizRow {name: node.name.clone(), expr: node.expr.clone(), display, edit, expandable: frame.info.expandable, expanded: frame.expanded, editable, depth: node.depth, path: frame.path.clone(), warnings: frame.warnings.clone(), node: node.clone(), ctx: frame.ctx.clone()})
}

// Stage 3: rows in `window` (row indices over the whole tree). Blocks outside the window are skipped without resolving anything in them.
pub fn produce_rows(blocks: &[VizBlock], window: Range<usize>, state: &ExpansionState, cx: &mut EvalContext) -> Result<Vec<VizRow>> {
    let _prof = ProfileScope::with_threshold(cx.settings.profile_threshold_secs, format!("rows {}..{}", window.start, window.end));
    let budget = Budget::from_settings(cx.settings);
    let mut rows: Vec<VizRow> = Vec::new();
    let mut pos = 0usize;
    for b in blocks {
        if pos >= window.end {
            break;
        }
        let n = b.num_rows();
        if pos + n <= window.start {
            pos += n;
            continue;
        }
        let lo = window.start.max(pos) - pos;
        let hi = window.end.min(pos + n) - pos;
        match b.kind {
            VizBlockKind::Root | VizBlockKind::SubExpansion => rows.push(make_row(&b.frame, budget, cx)?),
            VizBlockKind::FlatRun | VizBlockKind::Custom => {
                let start = b.range.start + lo;
                let children = children_in_range(&b.frame, start..b.range.start + hi, cx)?;
                for (i, child) in children.into_iter().enumerate() {
                    let frame = resolve_child_frame(&b.frame, child, start + i, state, cx)?;
                    rows.push(make_row(&frame, budget, cx)?);
                }
            }
        }
        pos += n;
    }
    Ok(rows)
}
