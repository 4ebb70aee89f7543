//! Application layer: the division engine and everything that moves a batch
//! to its final state afterwards.
//!
//! [`engine::DivisionEngine`] opens and submits batches. Outcomes that are not
//! known at submit time are settled later by
//! [`reconciler::ReconciliationScheduler`] (polling) or
//! [`notification::NotificationHandler`] (channel push), both through
//! [`settlement::settle`].

pub mod adapters;
pub mod dedup;
pub mod engine;
pub mod notification;
pub mod reconciler;
pub mod settlement;
