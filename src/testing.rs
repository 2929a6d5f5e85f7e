use crate::{*, demo::*, expr::*, types::*, memory::*, registry::*, settings::*};

pub struct Fixture {
    pub demo: DemoProgram,
    pub settings: Settings,
}

impl Fixture {
    pub fn new() -> Self { Self {demo: DemoProgram::new(), settings: Settings::default()} }

    pub fn cx(&self) -> EvalContext<'_> {
        let memory = CachedMemReader::new(&*self.demo.memory, CancelToken::new());
        EvalContext::new(Types::new(self.demo.types.clone()), memory, &*self.demo.evaluator, RuleRegistry::builtin(), &self.settings)
    }

    pub fn var(&self, name: &str) -> Value { self.demo.evaluator.variables.get(name).cloned().unwrap() }
}
