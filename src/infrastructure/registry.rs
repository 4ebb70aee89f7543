use crate::domain::ports::{ReceiverRegistry, ReceiverRegistryRef};
use crate::domain::receiver::{BindingState, ChannelCode, ReceiverBinding};
use crate::error::{DivisionError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// In-memory receiver registry, loaded once at startup.
///
/// Bindings are kept in insertion order, which is also their priority order.
#[derive(Default, Clone)]
pub struct InMemoryReceiverRegistry {
    bindings: Arc<RwLock<Vec<ReceiverBinding>>>,
}

impl InMemoryReceiverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a binding.
    ///
    /// Rejects a second binding for an account that is already bound for the
    /// same merchant and channel under a different id.
    pub async fn upsert(&self, mut binding: ReceiverBinding) -> Result<()> {
        let now = Utc::now();
        let mut bindings = self.bindings.write().await;
        if let Some(clash) = bindings
            .iter()
            .find(|b| b.unique_key() == binding.unique_key() && b.id != binding.id)
        {
            return Err(DivisionError::ConfigError(format!(
                "account {} is already bound to merchant {} on {} as receiver {}",
                binding.account_no, binding.merchant_id, binding.channel, clash.id
            )));
        }
        binding.updated_at = Some(now);
        match bindings.iter_mut().find(|b| b.id == binding.id) {
            Some(existing) => {
                binding.created_at = existing.created_at.or(binding.created_at).or(Some(now));
                *existing = binding;
            }
            None => {
                binding.created_at = binding.created_at.or(Some(now));
                bindings.push(binding);
            }
        }
        Ok(())
    }

    pub async fn suspend(&self, receiver_id: u64) -> Result<()> {
        let mut bindings = self.bindings.write().await;
        let binding = bindings
            .iter_mut()
            .find(|b| b.id == receiver_id)
            .ok_or(DivisionError::ReceiverUnavailable(receiver_id))?;
        binding.state = BindingState::Suspended;
        binding.updated_at = Some(Utc::now());
        Ok(())
    }

    pub async fn get(&self, receiver_id: u64) -> Option<ReceiverBinding> {
        let bindings = self.bindings.read().await;
        bindings.iter().find(|b| b.id == receiver_id).cloned()
    }
}

#[async_trait]
impl ReceiverRegistry for InMemoryReceiverRegistry {
    async fn list_active_bindings(
        &self,
        merchant_id: &str,
        app_id: &str,
        channel: &ChannelCode,
    ) -> Result<Vec<ReceiverBinding>> {
        let bindings = self.bindings.read().await;
        Ok(bindings
            .iter()
            .filter(|b| {
                b.is_active()
                    && b.merchant_id == merchant_id
                    && b.app_id == app_id
                    && &b.channel == channel
            })
            .cloned()
            .collect())
    }
}

type CacheKey = (String, String, ChannelCode);

/// Wraps a registry with a short-lived read-through cache.
///
/// Binding changes are rare and not urgent, so a stale read for up to `ttl`
/// is acceptable.
pub struct CachedRegistry {
    inner: ReceiverRegistryRef,
    ttl: Duration,
    entries: RwLock<HashMap<CacheKey, (Instant, Vec<ReceiverBinding>)>>,
}

impl CachedRegistry {
    pub fn new(inner: ReceiverRegistryRef, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Drops every cached entry.
    pub async fn invalidate(&self) {
        self.entries.write().await.clear();
    }
}

#[async_trait]
impl ReceiverRegistry for CachedRegistry {
    async fn list_active_bindings(
        &self,
        merchant_id: &str,
        app_id: &str,
        channel: &ChannelCode,
    ) -> Result<Vec<ReceiverBinding>> {
        let key = (merchant_id.to_string(), app_id.to_string(), channel.clone());
        {
            let entries = self.entries.read().await;
            if let Some((fetched_at, bindings)) = entries.get(&key)
                && fetched_at.elapsed() < self.ttl
            {
                return Ok(bindings.clone());
            }
        }

        let bindings = self
            .inner
            .list_active_bindings(merchant_id, app_id, channel)
            .await?;
        let mut entries = self.entries.write().await;
        entries.retain(|_, (fetched_at, _)| fetched_at.elapsed() < self.ttl);
        entries.insert(key, (Instant::now(), bindings.clone()));
        Ok(bindings)
    }
}
