//! Upstream receiver integration: status polling, zapping, stream probing.

mod client;
mod readiness;
mod zap;

pub(crate) use client::ensure_crypto_provider;
pub use client::{ReceiverClient, StatusSource, TunerStatus};
pub use readiness::{ReadinessChecker, ReadinessOutcome};
pub use zap::{ResolvedStream, ZapResolver, parse_mini_playlist};
