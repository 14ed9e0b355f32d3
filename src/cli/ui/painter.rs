use owo_colors::{OwoColorize, Style};

use crate::utils::format_rssi;

/// Signal strength at or above which a peripheral counts as close by.
const STRONG_SIGNAL_DBM: i16 = -60;
/// Signal strength below which a link is likely to be unreliable.
const WEAK_SIGNAL_DBM: i16 = -80;

/// Styles terminal text, or passes it through untouched when colour is off.
#[derive(Debug)]
pub(crate) struct Painter {
    use_colour: bool,
}

impl Painter {
    pub(crate) fn new(use_colour: bool) -> Self {
        Self { use_colour }
    }

    pub(crate) fn heading(&self, text: impl AsRef<str>) -> String {
        self.paint(text.as_ref(), Style::new().bold().cyan())
    }

    pub(crate) fn value(&self, text: impl AsRef<str>) -> String {
        self.paint(text.as_ref(), Style::new().bold())
    }

    pub(crate) fn muted(&self, text: impl AsRef<str>) -> String {
        self.paint(text.as_ref(), Style::new().dimmed())
    }

    /// Healthy link states and clean stops.
    pub(crate) fn good(&self, text: impl AsRef<str>) -> String {
        self.paint(text.as_ref(), Style::new().bold().green())
    }

    /// Degraded but recoverable states.
    pub(crate) fn caution(&self, text: impl AsRef<str>) -> String {
        self.paint(text.as_ref(), Style::new().bold().yellow())
    }

    pub(crate) fn fault(&self, text: impl AsRef<str>) -> String {
        self.paint(text.as_ref(), Style::new().bold().red())
    }

    /// Renders an RSSI reading coloured by how strong it is.
    pub(crate) fn signal(&self, rssi: Option<i16>) -> String {
        let text = format_rssi(rssi);
        match rssi {
            None => self.muted(text),
            Some(dbm) if dbm >= STRONG_SIGNAL_DBM => self.good(text),
            Some(dbm) if dbm >= WEAK_SIGNAL_DBM => self.caution(text),
            Some(_) => self.fault(text),
        }
    }

    fn paint(&self, text: &str, style: Style) -> String {
        if self.use_colour {
            text.style(style).to_string()
        } else {
            text.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::unknown(None, "-")]
    #[case::strong(Some(-48), "-48 dBm")]
    #[case::fair(Some(-72), "-72 dBm")]
    #[case::weak(Some(-91), "-91 dBm")]
    fn signal_without_colour_is_plain_text(#[case] rssi: Option<i16>, #[case] expected: &str) {
        assert_eq!(expected, Painter::new(false).signal(rssi));
    }

    #[test]
    fn signal_colour_follows_strength() {
        let painter = Painter::new(true);

        assert_eq!(painter.good("-60 dBm"), painter.signal(Some(-60)));
        assert_eq!(painter.caution("-80 dBm"), painter.signal(Some(-80)));
        assert_eq!(painter.fault("-81 dBm"), painter.signal(Some(-81)));
        assert_eq!(painter.muted("-"), painter.signal(None));
    }

    #[test]
    fn colour_wraps_the_original_text() {
        let painter = Painter::new(true);

        let styled = painter.heading("Link:");

        assert_ne!("Link:", styled);
        assert!(styled.contains("Link:"));
    }
}
