use std::sync::LazyLock;

use crate::{suite::Suite, suites, vdso};

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

#[derive(Debug)]
pub struct Registered {
    pub suite: &'static Suite,
    /// Where the suite's fast path was found, resolved once at registration
    pub vdso: Option<usize>,
}

#[derive(Default)]
pub struct Registry {
    entries: Vec<Registered>,
}

impl Registry {
    pub fn new() -> Registry {
        let mut registry = Registry::default();
        for &suite in suites::ALL {
            registry.register(suite);
        }
        registry
    }

    /// Add `suite`, resolve its vDSO symbol and hand the result to its
    /// bind callback so its call paths are wired before any test runs.
    pub fn register(&mut self, suite: &'static Suite) {
        let vdso = vdso::resolve(suite.vdso_names);
        if let Some(bind) = suite.bind {
            bind(vdso);
        }
        self.entries.push(Registered { suite, vdso });
    }

    pub fn entries(&self) -> &[Registered] {
        &self.entries
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|entry| entry.suite.name).collect()
    }

    /// `all`, or the one suite called `api`.
    pub fn select(&self, api: &str) -> Result<Vec<&Registered>, String> {
        if api == "all" {
            return Ok(self.entries.iter().collect());
        }
        match self.entries.iter().find(|entry| entry.suite.name == api) {
            Some(entry) => Ok(vec![entry]),
            None => Err(format!(
                "unknown API `{api}`, expected one of: all, {}",
                self.names().join(", ")
            )),
        }
    }
}
