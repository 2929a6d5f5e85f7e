use crate::{*, error::*, expr::*, types::*, memory::*, interp::*, registry::*, settings::*, viz::*, demo::*};
use std::{ops::Range, sync::Arc};

// Everything one watch evaluation reads. All of it is shared read-only between concurrently evaluated watches.
#[derive(Clone)]
pub struct WatchEnv {
    pub registry: Arc<RuleRegistry>,
    pub types: Arc<TypeSnapshot>,
    pub memory: Arc<dyn MemoryReader>,
    pub evaluator: Arc<dyn ExpressionEvaluator>,
    pub settings: Arc<Settings>,
}

impl WatchEnv {
    pub fn demo(demo: &DemoProgram, registry: Arc<RuleRegistry>, settings: Arc<Settings>) -> Self {
        Self {registry, types: demo.types.clone(), memory: demo.memory.clone(), evaluator: demo.evaluator.clone(), settings}
    }
}

#[derive(Clone, Debug)]
pub struct WatchRequest {
    pub expr: String,
    pub annotation: String,
    pub state: ExpansionState,
    pub window: Range<usize>, // visible rows
}

impl WatchRequest {
    pub fn new(expr: &str, annotation: &str) -> Self { Self {expr: expr.to_string(), annotation: annotation.to_string(), state: ExpansionState::root_expanded(), window: 0..usize::MAX} }
}

#[derive(Debug)]
pub struct WatchOutput {
    pub total_rows: usize,
    pub rows: Vec<VizRow>,
    pub log: Vec<String>,
    // Memory version the rows were computed from. If the provider's version has moved on, the rows are stale.
    pub memory_version: u64,
    pub num_reads: usize,
}

// One full pipeline run: resolve, blocks, rows in the window, lines. Fails only if cancelled (or on internal errors);
// everything else is reported on the rows.
pub fn evaluate_watch(req: &WatchRequest, env: &WatchEnv, cancel: CancelToken) -> Result<WatchOutput> {
    cancel.check()?;
    let memory_version = env.memory.version();
    let memory = CachedMemReader::new(&*env.memory, cancel);
    let mut cx = EvalContext::new(Types::new(env.types.clone()), memory, &*env.evaluator, &env.registry, &env.settings);
    let blocks = produce_blocks(&req.expr, &req.annotation, &req.state, &mut cx)?;
    let rows = produce_rows(&blocks, req.window.clone(), &req.state, &mut cx)?;
    Ok(WatchOutput {total_rows: total_rows(&blocks), rows, log: cx.log.take(), memory_version, num_reads: cx.memory.num_reads})
}

#[cfg(test)]
mod tests {
    use crate::watch::*;

    #[test]
    fn evaluate() {
        let demo = DemoProgram::new();
        let env = WatchEnv::demo(&demo, Arc::new(RuleRegistry::with_builtins()), Arc::new(Settings::default()));
        let mut req = WatchRequest::new("pt", "frobnicate hex");
        let out = evaluate_watch(&req, &env, CancelToken::new()).unwrap();
        assert_eq!(out.total_rows, 3);
        assert_eq!(out.rows[2].display, "0xfffffffc");
        assert_eq!(out.log, vec!["unknown rule 'frobnicate'".to_string()]);
        assert_eq!(out.memory_version, demo.memory.version());

        req.window = 1..2;
        let out = evaluate_watch(&req, &env, CancelToken::new()).unwrap();
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0].name, "x");

        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(evaluate_watch(&req, &env, cancel).unwrap_err().is_cancelled());
    }
}
