use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;

/// Observer for reporting incremental progress through a gridding pass.
///
/// The driver only calls the observer from the reporting root, so implementations
/// never need to deduplicate output between roles.
pub trait PassProgressObserver {
    fn on_pass_start(&mut self, total_rows: u64) {
        let _ = total_rows;
    }
    fn on_rows_processed(&mut self, rows_done: u64) {
        let _ = rows_done;
    }
    fn on_pass_finish(&mut self) {}
}

#[derive(Default)]
pub struct NoopPassProgress;

impl PassProgressObserver for NoopPassProgress {}

/// Draws a progress bar on stderr when it is a terminal, and stays silent otherwise.
pub struct ConsoleProgress {
    message: String,
    bar: Option<ProgressBar>,
}

impl ConsoleProgress {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
            bar: None,
        }
    }
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    let style = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} rows ({eta}) {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏  ");
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb
}

impl PassProgressObserver for ConsoleProgress {
    fn on_pass_start(&mut self, total_rows: u64) {
        self.bar = Some(create_progress_bar(total_rows, &self.message));
    }

    fn on_rows_processed(&mut self, rows_done: u64) {
        if let Some(bar) = &self.bar {
            bar.set_position(rows_done);
        }
    }

    fn on_pass_finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message("done.");
        }
    }
}
