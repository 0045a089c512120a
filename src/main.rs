use std::{
    process::exit,
    sync::{atomic::Ordering, LazyLock},
    time::Duration,
};

use cli::{Command, TestType, VDSOPROBE_ARGS};
use ctx::{Ctx, Settings, EXIT_FAILURES, EXIT_USAGE, INTERRUPTED};
use registry::{Registered, REGISTRY};
use tabled::{builder::Builder, settings::Style};
use writer::{
    flush_buffer, initialize_writer, write_general_text, write_note, write_summary,
    write_vdso_location,
};

mod abi;
mod bench;
mod call_path;
mod child;
mod cli;
mod colors;
mod ctx;
mod registry;
mod suite;
mod suites;
mod vdso;
mod verify;
mod writer;

fn main() {
    let args = &*VDSOPROBE_ARGS;
    initialize_writer(args.no_color);
    if let Err(error) = ctrlc::set_handler(|| {
        INTERRUPTED.store(true, Ordering::SeqCst);
    }) {
        write_note(&format!("could not install the interrupt handler: {error}"));
    }
    LazyLock::force(&REGISTRY);

    let settings = Settings {
        duration: Duration::from_secs(args.duration),
        max_failures: args.max_failures,
        debug: args.debug,
    };

    let status = match &args.command {
        Command::List => {
            print_suites();
            0
        }
        Command::Run { api, test } => match REGISTRY.select(api) {
            Ok(selected) => run(&selected, *test, settings),
            Err(message) => {
                write_general_text(&format!("vdsoprobe: {message}\n"));
                EXIT_USAGE
            }
        },
    };
    flush_buffer();
    exit(status);
}

fn print_suites() {
    let mut builder = Builder::new();
    builder.push_record(["suite", "tests", "vDSO entry"]);
    for entry in REGISTRY.entries() {
        builder.push_record([
            entry.suite.name.to_owned(),
            entry.suite.tests().join(", "),
            match entry.vdso {
                Some(address) => format!("{address:#x}"),
                None => "not found".to_owned(),
            },
        ]);
    }
    let table = builder.build().with(Style::ascii_rounded()).to_string();
    println!("{table}");
}

/// Run `test` on every selected suite, returning the process exit status.
fn run(selected: &[&Registered], test: TestType, settings: Settings) -> i32 {
    if settings.debug {
        match vdso::vdso_image() {
            Ok(image) => write_vdso_location(image.base(), image.symbol_count()),
            Err(error) => write_note(&format!("vDSO unavailable: {error}")),
        }
    }

    let mut failed = false;
    for entry in selected {
        if INTERRUPTED.load(Ordering::SeqCst) {
            break;
        }
        let suite = entry.suite;
        if !suite.supports(test) {
            write_note(&format!("{} has no {} test, skipping", suite.name, test.as_str()));
            continue;
        }

        let mut ctx = Ctx::new(suite.name, settings);
        if let Some(notes) = suite.notes {
            for note in notes(&ctx) {
                write_note(&note);
            }
        }

        match test {
            TestType::Bench => {
                if let Some(bench) = suite.bench {
                    let results = bench(&mut ctx);
                    flush_buffer();
                    println!("{}", results.render(suite.name));
                }
            }
            TestType::Verify => {
                if let Some(verify) = suite.verify {
                    verify(&mut ctx);
                }
            }
            TestType::Abi => {
                if let Some(abi) = suite.abi {
                    abi(&mut ctx);
                }
            }
        }

        write_summary(suite.name, test.as_str(), ctx.failures);
        failed |= ctx.failures > 0;
    }

    if failed {
        EXIT_FAILURES
    } else {
        0
    }
}
