use std::fmt::{self, Display, Formatter};

use tabled::builder::Builder;
use tabled::settings::Style;

use super::painter::Painter;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Layout {
    /// Rounded borders with a header row.
    Grid,
    /// Borderless label/value pairs.
    Fields,
}

/// Rows of terminal cells rendered through `tabled` on `Display`.
#[derive(Debug)]
pub(crate) struct Table {
    layout: Layout,
    records: Vec<Vec<String>>,
}

impl Table {
    /// Starts a bordered grid whose first record is `header`.
    pub(crate) fn with_header(header: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            layout: Layout::Grid,
            records: vec![header.into_iter().map(Into::into).collect()],
        }
    }

    /// Builds a borderless list of muted labels and their values.
    pub(crate) fn fields(painter: &Painter, fields: Vec<(&str, String)>) -> Self {
        let records = fields
            .into_iter()
            .map(|(label, value)| vec![painter.muted(label), value])
            .collect();
        Self {
            layout: Layout::Fields,
            records,
        }
    }

    pub(crate) fn push_row(&mut self, row: Vec<String>) {
        self.records.push(row);
    }
}

impl Display for Table {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut builder = Builder::default();
        for record in &self.records {
            builder.push_record(record);
        }
        let mut table = builder.build();
        match self.layout {
            Layout::Grid => table.with(Style::rounded()),
            Layout::Fields => table.with(Style::blank()),
        };
        write!(f, "{table}")
    }
}
