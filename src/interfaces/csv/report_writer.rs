use crate::application::engine::BatchHistory;
use crate::domain::order::Order;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

pub const HEADER: [&str; 7] = [
    "order",
    "batch",
    "kind",
    "state",
    "receivers",
    "allocated",
    "remainder",
];

#[derive(Debug, Serialize)]
struct ReportRow<'a> {
    order: &'a str,
    batch: String,
    kind: &'static str,
    state: &'static str,
    receivers: usize,
    allocated: u64,
    remainder: u64,
}

/// Writes one CSV row per division batch.
pub struct ReportWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> ReportWriter<W> {
    /// Creates the writer and emits the header row.
    pub fn new(sink: W) -> Result<Self> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(sink);
        writer.write_record(HEADER)?;
        Ok(Self { writer })
    }

    pub fn write_history(&mut self, order: &Order, history: &[BatchHistory]) -> Result<()> {
        for entry in history {
            let allocated = entry.allocated();
            self.writer.serialize(ReportRow {
                order: &order.id,
                batch: entry.batch.id.to_string(),
                kind: entry.batch.kind.as_str(),
                state: entry.batch.state.as_str(),
                receivers: entry.records.len(),
                allocated: allocated.value(),
                remainder: order.amount.saturating_sub(allocated).value(),
            })?;
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
