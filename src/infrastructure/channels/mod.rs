//! Channel adapter implementations.

pub mod sandbox;
pub mod wxpay;

pub use sandbox::{FinalizeMode, SandboxChannel, SandboxConfig, SandboxReply};
pub use wxpay::{WxpayChannel, WxpayConfig, WxpayTransport};

use crate::domain::ports::ChannelAdapterRef;
use crate::domain::receiver::ChannelCode;
use std::sync::Arc;

/// Adapter for `sandbox.channel`, backed by the in-process sandbox. Channels
/// with a dedicated variant get it, with the sandbox as its transport.
pub fn sandbox_backed(sandbox: SandboxConfig) -> ChannelAdapterRef {
    match sandbox.channel.as_str() {
        ChannelCode::WXPAY => {
            let config = WxpayConfig {
                channel: sandbox.channel.clone(),
                supports_division: sandbox.supports_division,
                native_idempotency: sandbox.native_idempotency,
                ..WxpayConfig::default()
            };
            Arc::new(WxpayChannel::new(config, Arc::new(SandboxChannel::new(sandbox))))
        }
        _ => Arc::new(SandboxChannel::new(sandbox)),
    }
}
