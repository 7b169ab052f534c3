//! Stdout line sink (spec.md §4.5.2's formatted trace lines), used for the
//! daemon's default subscriber when no real control-channel transport is
//! wired up in front of it.

use std::io::Write;

use atrace_consumer::LineSink;

#[derive(Default)]
pub struct StdoutSink;

impl LineSink for StdoutSink {
    type Error = std::io::Error;

    fn send_line(&mut self, line: &str) -> Result<(), Self::Error> {
        let mut out = std::io::stdout();
        writeln!(out, "{line}")?;
        out.flush()
    }

    fn send_end_of_stream(&mut self) -> Result<(), Self::Error> {
        println!("# end-of-stream");
        Ok(())
    }
}
