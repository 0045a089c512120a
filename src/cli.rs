use clap::{Parser, Subcommand, ValueEnum};
use std::sync::LazyLock;

pub static VDSOPROBE_ARGS: LazyLock<VdsoprobeArgs> = LazyLock::new(VdsoprobeArgs::parse);

#[derive(Parser, Debug)]
#[command(
    about = "vdsoprobe checks vDSO fast paths against the system calls they duplicate.",
    version,
    subcommand_required = true
)]
pub struct VdsoprobeArgs {
    /// seconds each benchmark interval or verification run lasts
    #[arg(short = 'd', long, default_value_t = 1, global = true)]
    pub duration: u64,

    /// stop verify/abi runs after this many failures (0 = never stop early)
    #[arg(short = 'f', long = "max-failures", default_value_t = 10, global = true)]
    pub max_failures: u64,

    /// print debug output
    #[arg(short = 'g', long, global = true)]
    pub debug: bool,

    /// disable colored output
    #[arg(long = "no-color", global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// list the available test suites
    List,
    /// run a test against one API (or `all`)
    Run {
        /// API to test, e.g. gettimeofday, or `all`
        api: String,
        /// kind of test to run
        #[arg(value_enum)]
        test: TestType,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum TestType {
    /// compare throughput of each call path
    Bench,
    /// check results of each call path against each other
    Verify,
    /// check behavior under invalid pointer arguments
    Abi,
}

impl TestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestType::Bench => "bench",
            TestType::Verify => "verify",
            TestType::Abi => "abi",
        }
    }
}
