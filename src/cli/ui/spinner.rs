use std::borrow::Cow;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

const TICK: Duration = Duration::from_millis(120);

/// Indefinite stderr spinner whose message can change while it runs.
///
/// A disabled spinner accepts the same calls and draws nothing, so callers do
/// not branch on whether stderr is a terminal.
#[derive(Debug)]
pub(crate) struct Spinner {
    bar: Option<ProgressBar>,
}

impl Spinner {
    pub(crate) fn start(enabled: bool, message: impl Into<Cow<'static, str>>) -> Self {
        if !enabled {
            return Self { bar: None };
        }

        let bar = ProgressBar::new_spinner().with_style(spinner_style());
        bar.set_message(message);
        bar.enable_steady_tick(TICK);
        Self { bar: Some(bar) }
    }

    pub(crate) fn set_message(&self, message: impl Into<Cow<'static, str>>) {
        if let Some(bar) = &self.bar {
            bar.set_message(message);
        }
    }

    pub(crate) fn is_drawing(&self) -> bool {
        self.bar.is_some()
    }

    /// Removes the spinner line before regular output is written.
    pub(crate) fn finish(self) {
        if let Some(bar) = self.bar {
            bar.finish_and_clear();
        }
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.cyan.bold} {msg} {elapsed:.dim}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars("◐◓◑◒●")
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::disabled(false)]
    #[case::enabled(true)]
    fn spinner_draws_only_when_enabled(#[case] enabled: bool) {
        let spinner = Spinner::start(enabled, "Scanning");
        spinner.set_message("Scanning (2 found)");

        assert_eq!(enabled, spinner.is_drawing());
        spinner.finish();
    }
}
