//! Ordered mutation hooks run over a freshly built desired object.

use std::borrow::Cow;
use std::fmt;

use smallvec::SmallVec;

type Hook<K, C> = dyn Fn(&C, &mut K) -> anyhow::Result<()> + Send + Sync;

/// A named hook. It receives the request's context handle and the object under construction.
pub struct Mutation<K, C = ()> {
    name: Cow<'static, str>,
    hook: Box<Hook<K, C>>,
}

impl<K, C> Mutation<K, C> {
    pub fn new<F>(name: impl Into<Cow<'static, str>>, hook: F) -> Self
    where
        F: Fn(&C, &mut K) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self { name: name.into(), hook: Box::new(hook) }
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn apply(&self, ctx: &C, obj: &mut K) -> anyhow::Result<()> { (self.hook)(ctx, obj) }
}

impl<K, C> fmt::Debug for Mutation<K, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation").field("name", &self.name).finish_non_exhaustive()
    }
}

/// A hook that failed while the pipeline ran.
#[derive(Debug)]
pub struct HookFailure {
    /// 1-based position in the pipeline
    pub index: usize,
    pub name: String,
    pub error: anyhow::Error,
}

/// Every failing hook of one pipeline run.
#[derive(Debug, thiserror::Error)]
#[error("{} of {} mutation(s) could not be applied: {}", .failures.len(), .total, render(.failures))]
pub struct MutationError {
    pub failures: SmallVec<[HookFailure; 2]>,
    pub total: usize,
}

impl MutationError {
    pub fn failed_hooks(&self) -> impl Iterator<Item = &str> + '_ { self.failures.iter().map(|f| f.name.as_str()) }
}

fn render(failures: &[HookFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("#{} {}: {:#}", f.index, f.name, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Hooks in the order they were supplied.
pub struct MutationPipeline<K, C = ()> {
    hooks: Vec<Mutation<K, C>>,
}

impl<K, C> Default for MutationPipeline<K, C> {
    fn default() -> Self { Self { hooks: Vec::new() } }
}

impl<K, C> fmt::Debug for MutationPipeline<K, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.debug_list().entries(self.hooks.iter()).finish() }
}

impl<K, C> MutationPipeline<K, C> {
    pub fn new() -> Self { Self::default() }

    pub fn push(&mut self, m: Mutation<K, C>) { self.hooks.push(m); }

    pub fn len(&self) -> usize { self.hooks.len() }

    pub fn is_empty(&self) -> bool { self.hooks.is_empty() }

    /// Run every hook in order. A failing hook does not stop the ones after it.
    pub fn run(&self, ctx: &C, obj: &mut K) -> Result<(), MutationError> {
        let mut failures = SmallVec::new();
        for (i, m) in self.hooks.iter().enumerate() {
            if let Err(error) = m.apply(ctx, obj) {
                failures.push(HookFailure { index: i + 1, name: m.name().to_string(), error });
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(MutationError { failures, total: self.hooks.len() })
        }
    }
}

impl<K, C> From<Vec<Mutation<K, C>>> for MutationPipeline<K, C> {
    fn from(hooks: Vec<Mutation<K, C>>) -> Self { Self { hooks } }
}
