use super::dedup::DedupAdapter;
use crate::domain::ports::ChannelAdapterRef;
use crate::domain::receiver::ChannelCode;
use crate::error::{DivisionError, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Channel code to adapter map handed to the engine at construction.
#[derive(Clone, Default)]
pub struct ChannelAdapters {
    adapters: HashMap<ChannelCode, ChannelAdapterRef>,
}

impl ChannelAdapters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter under its own channel code, replacing any earlier
    /// one. Adapters that do not deduplicate split or finalize natively are
    /// wrapped in a [`DedupAdapter`].
    pub fn register(&mut self, adapter: ChannelAdapterRef) -> &mut Self {
        let idempotency = adapter.idempotency();
        let adapter: ChannelAdapterRef = if idempotency.split && idempotency.finalize {
            adapter
        } else {
            tracing::info!(channel = %adapter.channel(), "wrapping channel in dedup guard");
            Arc::new(DedupAdapter::new(adapter))
        };
        self.adapters.insert(adapter.channel().clone(), adapter);
        self
    }

    pub fn with(mut self, adapter: ChannelAdapterRef) -> Self {
        self.register(adapter);
        self
    }

    /// The adapter for `channel`, if it is registered and offers division.
    pub fn get(&self, channel: &ChannelCode) -> Result<&ChannelAdapterRef> {
        self.adapters
            .get(channel)
            .filter(|adapter| adapter.supports_division())
            .ok_or_else(|| DivisionError::UnsupportedChannel(channel.to_string()))
    }

    pub fn channels(&self) -> impl Iterator<Item = &ChannelCode> {
        self.adapters.keys()
    }
}
