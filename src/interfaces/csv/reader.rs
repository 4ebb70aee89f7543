use crate::domain::order::Order;
use crate::domain::receiver::ReceiverBinding;
use crate::error::{DivisionError, Result};
use serde::de::DeserializeOwned;
use std::io::Read;

/// Reads orders or receiver bindings from a CSV source.
///
/// Wraps `csv::Reader` with whitespace trimming and flexible record lengths.
/// Rows are deserialized lazily, one `Result` per row, so a malformed row
/// does not stop the rest of the file.
pub struct CsvReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> CsvReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    pub fn rows<T: DeserializeOwned>(self) -> impl Iterator<Item = Result<T>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(DivisionError::from))
    }

    /// Columns: `id, merchant_id, app_id, channel, channel_order_ref, amount,
    /// division_eligible`, optionally `division_status`.
    pub fn orders(self) -> impl Iterator<Item = Result<Order>> {
        self.rows()
    }

    /// Columns follow [`ReceiverBinding`]; optional columns may be omitted.
    pub fn bindings(self) -> impl Iterator<Item = Result<ReceiverBinding>> {
        self.rows()
    }
}
