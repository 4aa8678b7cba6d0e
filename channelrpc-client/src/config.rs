//! Configuration for channel factories.
//!
//! - [`BindingConfig`]: Transport settings, validated once when a factory opens
//! - [`ProxySettings`]: Proxy selection and bypass rules
//! - [`TlsSettings`]: Client certificate, peer pinning and extra roots
//! - [`RetryPolicy`]: Retry behavior with exponential backoff

mod binding;
mod proxy;
mod retry;

pub use binding::{
    BindingConfig, ClientCertificate, SecurityMode, TlsSettings, TransferMode, TransportUsage,
};
pub use proxy::{EnvProxyResolver, ProxyMode, ProxyResolver, ProxySettings};
pub use retry::{ExponentialBackoff, RetryPolicy, defaults, retry, retry_with_policy};
