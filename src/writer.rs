use crate::colors::{
    DEBUG_COLOR, FAILURE_BACKGROUND_COLOR, FAILURE_COLOR, GENERAL_TEXT_COLOR, NOTE_COLOR,
    PATH_COLOR, SUITE_NAME_COLOR,
};
use colored::{ColoredString, Colorize};
use std::{
    io::{BufWriter, Write},
    sync::{LazyLock, Mutex},
};

pub static BUFFER: LazyLock<Mutex<Vec<ColoredString>>> = LazyLock::new(|| Mutex::new(Vec::new()));
pub static WRITER: LazyLock<Mutex<BufWriter<Box<dyn Write + Send>>>> =
    LazyLock::new(|| Mutex::new(BufWriter::new(Box::new(std::io::stderr()))));

pub fn initialize_writer(no_color: bool) {
    // colored disables coloring when stdout is redirected, but failures go to stderr
    // https://github.com/colored-rs/colored/issues/125#issuecomment-1691155922
    colored::control::set_override(!no_color);
}

#[inline(always)]
pub fn buffered_write(data: ColoredString) {
    BUFFER.lock().unwrap().push(data);
}

#[inline(always)]
pub(crate) fn write_general_text(arg: &str) {
    buffered_write(arg.custom_color(*GENERAL_TEXT_COLOR));
}

/// Write everything buffered so far. Must run before `fork` so the child
/// never inherits (and later repeats) pending output.
pub fn flush_buffer() {
    let mut buffer = BUFFER.lock().unwrap();
    let mut writer = WRITER.lock().unwrap();
    for colored_text in buffer.drain(..) {
        let _ = write!(writer, "{}", colored_text);
    }
    let _ = writer.flush();
    let _ = std::io::stdout().flush();
}

pub fn write_failure(suite: &str, message: &str) {
    buffered_write(format!("{suite}:").custom_color(*SUITE_NAME_COLOR));
    buffered_write(" ".normal());
    buffered_write(" FAIL ".on_custom_color(*FAILURE_BACKGROUND_COLOR));
    buffered_write(" ".normal());
    let mut lines = message.lines();
    if let Some(headline) = lines.next() {
        buffered_write(headline.custom_color(*FAILURE_COLOR));
    }
    buffered_write("\n".normal());
    for detail in lines {
        write_general_text(&format!("    {}\n", detail.trim_start()));
    }
    flush_buffer();
}

pub fn write_note(message: &str) {
    buffered_write("Note: ".custom_color(*NOTE_COLOR).bold());
    buffered_write(message.custom_color(*NOTE_COLOR));
    buffered_write("\n".normal());
    flush_buffer();
}

pub fn write_debug(suite: &str, message: &str) {
    buffered_write(format!("[{suite}] ").custom_color(*DEBUG_COLOR));
    write_general_text(message);
    buffered_write("\n".normal());
    flush_buffer();
}

pub fn write_vdso_location(base: usize, symbols: usize) {
    write_general_text("vDSO mapped at ");
    buffered_write(format!("{base:#x}").custom_color(*PATH_COLOR));
    write_general_text(&format!(", {symbols} dynamic symbols\n"));
    flush_buffer();
}

pub fn write_summary(suite: &str, test: &str, failures: u64) {
    buffered_write(suite.custom_color(*SUITE_NAME_COLOR).bold());
    write_general_text(&format!(" {test}: "));
    if failures == 0 {
        buffered_write("ok".green());
    } else {
        buffered_write(format!("{failures} failure(s)").custom_color(*FAILURE_COLOR).bold());
    }
    buffered_write("\n".normal());
    flush_buffer();
}
