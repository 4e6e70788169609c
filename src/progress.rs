use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Controls how step output is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Spinners + ring-buffer logs, clear logs on completion.
    Normal,
    /// Like Normal but keeps log lines after step completion.
    Verbose,
    /// Spinners only, no log lines.
    Quiet,
    /// No ANSI, plain println output (for piped/non-TTY).
    Plain,
}

/// Numbered steps with spinners, checkmarks and crosses.
pub struct StepProgress {
    multi: MultiProgress,
    total_steps: usize,
    current_step: usize,
    mode: OutputMode,
}

/// Shared between `Step` and `StepProgress::run()`; the step future may
/// drop its handle before finishing.
struct StepState {
    log_lines: VecDeque<String>,
    done_label: Option<String>,
}

/// Handle passed into the step closure for logging during execution.
///
/// Log lines are extra lines of the spinner's message, so the bar count
/// inside the `MultiProgress` never changes.
pub struct Step {
    bar: ProgressBar,
    state: Arc<Mutex<StepState>>,
    label: String,
    mode: OutputMode,
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("[{prefix}] {spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn done_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("[{prefix}] \u{2713} {msg:.green}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn failed_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("[{prefix}] \u{2717} {msg:.red}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

const MAX_LOG_LINES: usize = 10;

impl StepProgress {
    pub fn new(total_steps: usize, mode: OutputMode) -> Self {
        let multi = if mode == OutputMode::Plain {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        } else {
            MultiProgress::new()
        };
        Self {
            multi,
            total_steps,
            current_step: 0,
            mode,
        }
    }

    /// Run a fallible async task as a numbered step.
    ///
    /// Shows a spinner while running, a checkmark on `Ok` and a cross on
    /// `Err`. Finalization happens here, not in `Step::drop`.
    pub async fn run<F, Fut, T, E>(&mut self, label: &str, f: F) -> Result<T, E>
    where
        F: FnOnce(Step) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.current_step += 1;
        let prefix = format!("{}/{}", self.current_step, self.total_steps);

        if self.mode == OutputMode::Plain {
            println!("[{prefix}] {label}");
        }

        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(spinner_style());
        bar.set_prefix(prefix.clone());
        bar.set_message(label.to_string());
        bar.enable_steady_tick(std::time::Duration::from_millis(80));

        let state = Arc::new(Mutex::new(StepState {
            log_lines: VecDeque::new(),
            done_label: None,
        }));

        let step = Step {
            bar: bar.clone(),
            state: state.clone(),
            label: label.to_string(),
            mode: self.mode,
        };

        let result = f(step).await;

        let (log_lines, done_label) = {
            let st = state.lock().unwrap_or_else(|p| p.into_inner());
            (
                st.log_lines.iter().cloned().collect::<Vec<_>>(),
                st.done_label.clone().unwrap_or_else(|| label.to_string()),
            )
        };

        // Verbose keeps the log lines above the managed area; failures keep
        // them in every interactive mode since they explain the cross.
        if self.mode == OutputMode::Verbose || (result.is_err() && self.mode == OutputMode::Normal)
        {
            for line in &log_lines {
                self.multi.println(format!("        {line}")).ok();
            }
        }

        let mark = if result.is_ok() { '\u{2713}' } else { '\u{2717}' };
        if self.mode == OutputMode::Plain {
            println!("[{prefix}] {mark} {done_label}");
        }

        bar.set_style(if result.is_ok() { done_style() } else { failed_style() });
        bar.finish_with_message(done_label);

        result
    }

    /// Print an info line under the current step.
    pub fn info(&self, text: &str) {
        if self.mode == OutputMode::Plain {
            println!("      \u{2192} {text}");
        } else {
            self.multi.println(format!("      \u{2192} {text}")).ok();
        }
    }

    /// Print a plain line (final messages).
    pub fn println(&self, text: &str) {
        if self.mode == OutputMode::Plain {
            println!("{text}");
        } else {
            self.multi.println(text).ok();
        }
    }
}

impl Step {
    /// Add a log line under this step (ring buffer of ~10).
    pub fn log(&self, line: &str) {
        if self.mode == OutputMode::Quiet {
            return;
        }

        if self.mode == OutputMode::Plain {
            for sub in line.split('\n') {
                println!("        {sub}");
            }
            return;
        }

        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

        // One ring-buffer entry per visual line keeps indicatif's line count right.
        for sub in line.split('\n') {
            if state.log_lines.len() >= MAX_LOG_LINES {
                state.log_lines.pop_front();
            }
            state.log_lines.push_back(sub.to_string());
        }

        let mut msg = self.label.clone();
        for log_line in &state.log_lines {
            msg.push_str("\n        ");
            msg.push_str(log_line);
        }
        self.bar.set_message(msg);
    }

    /// Override the completion label shown with the checkmark.
    pub fn set_done_label(&self, label: impl Into<String>) {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .done_label = Some(label.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_passes_through_ok_and_err() {
        let mut progress = StepProgress::new(2, OutputMode::Quiet);
        let ok: Result<u32, String> = progress
            .run("first", |step| async move {
                step.log("ignored in quiet mode");
                step.set_done_label("first done");
                Ok(7)
            })
            .await;
        assert_eq!(ok, Ok(7));

        let err: Result<u32, String> = progress
            .run("second", |_step| async { Err("boom".to_string()) })
            .await;
        assert_eq!(err, Err("boom".to_string()));
        assert_eq!(progress.current_step, 2);
    }
}
