//! HTTP transport to model providers.

pub mod http;

pub use http::{AuthScheme, HttpProvider, ProviderConfig};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Transport error: {0}")]
    Other(String),
}
