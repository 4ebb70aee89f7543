//! Domain model: money, orders, receiver bindings, division batches, and the
//! ports the application layer talks through.

pub mod batch;
pub mod channel;
pub mod money;
pub mod order;
pub mod ports;
pub mod receiver;
pub mod split;
