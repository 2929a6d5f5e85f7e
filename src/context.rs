use crate::{*, error::*, executor::*, settings::*, registry::*, memory::*, watch::*};
use std::sync::{Arc, mpsc};

// Process-lifetime state shared by all watches.
pub struct Context {
    pub settings: Arc<Settings>,
    pub executor: Executor,
    pub registry: Arc<RuleRegistry>,
}

// A watch evaluation running on the executor.
pub struct WatchHandle {
    pub cancel: CancelToken,
    receiver: mpsc::Receiver<Result<WatchOutput>>,
}

impl WatchHandle {
    // E.g. the row scrolled out of view. The evaluation stops at its next memory read.
    pub fn cancel(&self) { self.cancel.cancel(); }

    pub fn wait(self) -> Result<WatchOutput> {
        match self.receiver.recv() {
            Ok(r) => r,
            Err(_) => err!(Internal, "watch worker went away"),
        }
    }
}

impl Context {
    pub fn new(settings: Settings, registry: Arc<RuleRegistry>) -> Result<Arc<Self>> {
        let executor = Executor::new(settings.max_threads.max(1))?;
        Ok(Arc::new(Self {settings: Arc::new(settings), executor, registry}))
    }

    pub fn env(&self, types: Arc<types::TypeSnapshot>, memory: Arc<dyn MemoryReader>, evaluator: Arc<dyn interp::ExpressionEvaluator>) -> WatchEnv {
        WatchEnv {registry: self.registry.clone(), types, memory, evaluator, settings: self.settings.clone()}
    }

    pub fn submit(&self, req: WatchRequest, env: WatchEnv) -> WatchHandle {
        let cancel = CancelToken::new();
        let (sender, receiver) = mpsc::channel();
        let job_cancel = cancel.clone();
        self.executor.add(move || {
            let res = evaluate_watch(&req, &env, job_cancel);
            // Nobody waiting is fine.
            let _ = sender.send(res);
        });
        WatchHandle {cancel, receiver}
    }
}

#[cfg(test)]
mod tests {
    use crate::{context::*, demo::*};

    #[test]
    fn concurrent_watches() {
        let demo = DemoProgram::new();
        let context = Context::new(Settings {max_threads: 4, ..Settings::default()}, Arc::new(RuleRegistry::with_builtins())).unwrap();
        let env = context.env(demo.types.clone(), demo.memory.clone(), demo.evaluator.clone());
        let watches = [("outer", "hex"), ("head", "list(next)"), ("big", ""), ("pair", "slice"), ("arr_ptr", "array(4)"), ("ring", ""), ("pt", "only(y)")];
        let sequential: Vec<Vec<String>> = watches.iter().map(|(e, a)| {
            let out = evaluate_watch(&WatchRequest::new(e, a), &env, CancelToken::new()).unwrap();
            out.rows.iter().map(|r| r.display.clone()).collect()
        }).collect();

        let mut handles: Vec<(usize, WatchHandle)> = Vec::new();
        for _ in 0..10 {
            for (i, (e, a)) in watches.iter().enumerate() {
                handles.push((i, context.submit(WatchRequest::new(e, a), env.clone())));
            }
        }
        for (i, h) in handles {
            let out = h.wait().unwrap();
            let lines: Vec<String> = out.rows.iter().map(|r| r.display.clone()).collect();
            assert_eq!(lines, sequential[i]);
        }
    }

    #[test]
    fn cancel_before_start() {
        let demo = DemoProgram::new();
        let context = Context::new(Settings {max_threads: 1, ..Settings::default()}, Arc::new(RuleRegistry::with_builtins())).unwrap();
        let env = context.env(demo.types.clone(), demo.memory.clone(), demo.evaluator.clone());
        // Occupy the only worker until the watch is cancelled.
        let (release, blocked) = mpsc::channel::<()>();
        context.executor.add(move || { let _ = blocked.recv(); });
        let h = context.submit(WatchRequest::new("big", "hex"), env.clone());
        let other = context.submit(WatchRequest::new("pt", ""), env);
        h.cancel();
        release.send(()).unwrap();
        assert!(h.wait().unwrap_err().is_cancelled());
        // Other watches are unaffected.
        assert_eq!(other.wait().unwrap().rows[0].display, "Point");
    }
}
