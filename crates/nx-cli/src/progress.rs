use std::io::{self, Write};
use std::sync::Mutex;

use nx_transfer::{ProgressEvent, ProgressObserver};

/// One carriage-returned progress line, redrawn when the whole percentage
/// changes. A completed transfer ends the line so the next one starts fresh.
pub struct ConsoleProgress<W: Write = io::Stdout> {
    state: Mutex<LineState<W>>,
}

struct LineState<W> {
    out: W,
    last_percent: Option<u64>,
}

impl ConsoleProgress {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> ConsoleProgress<W> {
    pub fn new(out: W) -> Self {
        Self {
            state: Mutex::new(LineState {
                out,
                last_percent: None,
            }),
        }
    }

    /// Terminate a line left open by an interrupted transfer.
    pub fn finish(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.last_percent.take().is_some() {
            let _ = writeln!(state.out);
        }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        match self.state.into_inner() {
            Ok(state) => state.out,
            Err(poisoned) => poisoned.into_inner().out,
        }
    }
}

impl<W: Write> ProgressObserver for ConsoleProgress<W> {
    fn on_progress(&self, event: ProgressEvent) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let percent = event.percent() as u64;
        if state.last_percent == Some(percent) && !event.is_complete() {
            return;
        }
        let _ = write!(state.out, "\r{}", format_progress(&event));
        if event.is_complete() {
            let _ = writeln!(state.out);
            state.last_percent = None;
        } else {
            state.last_percent = Some(percent);
        }
        let _ = state.out.flush();
    }
}

pub fn format_progress(event: &ProgressEvent) -> String {
    format!(
        "Progress: {}/{} kb ({:.0}%)",
        event.bytes_transferred / 1024,
        event.total_bytes / 1024,
        event.percent().floor()
    )
}
