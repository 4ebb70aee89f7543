//! CSV input (orders, receiver bindings) and the batch report output.

pub mod reader;
pub mod report_writer;
