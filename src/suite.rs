use crate::{bench::BenchResults, cli::TestType, ctx::Ctx};

pub type BenchFn = fn(&mut Ctx) -> BenchResults;
pub type TestFn = fn(&mut Ctx);
pub type NotesFn = fn(&Ctx) -> Vec<String>;
pub type BindFn = fn(Option<usize>);

/// Everything the dispatcher needs to know about one tested function.
/// Built as a `static`, registered once, never changed afterwards.
#[derive(Debug)]
pub struct Suite {
    pub name: &'static str,
    pub bench: Option<BenchFn>,
    pub verify: Option<TestFn>,
    pub abi: Option<TestFn>,
    pub notes: Option<NotesFn>,
    /// Candidate vDSO symbols, most preferred first
    pub vdso_names: &'static [&'static str],
    /// Receives the resolved vDSO address (or `None`) before anything runs
    pub bind: Option<BindFn>,
}

impl Suite {
    pub fn supports(&self, test: TestType) -> bool {
        match test {
            TestType::Bench => self.bench.is_some(),
            TestType::Verify => self.verify.is_some(),
            TestType::Abi => self.abi.is_some(),
        }
    }

    pub fn tests(&self) -> Vec<&'static str> {
        [TestType::Bench, TestType::Verify, TestType::Abi]
            .into_iter()
            .filter(|test| self.supports(*test))
            .map(|test| test.as_str())
            .collect()
    }
}
