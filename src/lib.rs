//! # ai-bridge
//!
//! A caching, rate-limited bridge to large-language-model providers.
//!
//! ## Overview
//!
//! Provider calls are slow, rate-limited and billed per token. `ai-bridge`
//! puts a response cache in front of them, so a prompt already answered with
//! the same output-relevant options is served locally, and funnels the calls
//! that do go out through a bounded FIFO queue. Streamed responses are decoded
//! incrementally and handed to the caller delta by delta.
//!
//! ## Key Features
//!
//! - **Deterministic keys**: prompt + allow-listed options, SHA-256 content addressed
//! - **Sharded JSONL cache**: append-only local files, lock-free reads, locked writes
//! - **Remote cache**: document-store backend with upsert semantics
//! - **Temperature buckets**: several cached samples per prompt at non-zero temperature
//! - **Dispatch queue**: bounded concurrency with an optional post-call delay
//! - **Stream decoding**: cumulative snapshots turned back into ordered deltas
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ai_bridge::{AiBridge, BridgeConfig, CallScope};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> ai_bridge::Result<()> {
//!     let config = BridgeConfig::from_file("bridge.yaml").await?.with_env_overrides();
//!     let bridge = AiBridge::from_config(config).await?;
//!
//!     let options = json!({"model": "claude-v1", "temperature": 0, "stream": true});
//!     let mut print = |delta: &str, _: &str| print!("{}", delta);
//!     let text = bridge
//!         .completion_streamed(
//!             "\n\nHuman: Hello\n\nAssistant:",
//!             options.as_object().unwrap(),
//!             &CallScope::new().with_group("demo/hello"),
//!             &mut print,
//!         )
//!         .await?;
//!     println!("\n{}", text);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`bridge`] | The facade: cache lookup, dispatch, write-through |
//! | [`cache`] | Key derivation, JSONL and remote backends, the cache manager |
//! | [`dispatch`] | FIFO queue bounding in-flight provider calls |
//! | [`stream`] | Incremental decoder for streamed responses |
//! | [`provider`] | Provider-call traits and request types |
//! | [`transport`] | HTTP provider implementation |
//! | [`tokens`] | Token counting for `max_tokens` budgeting |
//! | [`config`] | Typed, YAML-loadable configuration |

pub mod bridge;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod provider;
pub mod stream;
pub mod tokens;
pub mod transport;

pub use bridge::{AiBridge, AiBridgeBuilder, CallScope};
pub use cache::{CacheKind, CacheManager};
pub use config::BridgeConfig;
pub use dispatch::{DispatchConfig, DispatchQueue};
pub use provider::{CompletionProvider, CompletionRequest, EmbeddingProvider, EmbeddingRequest};
pub use stream::{DeltaSink, NoopSink, StreamDecoder, StreamError};

use futures::Stream;
use std::pin::Pin;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// A unified pinned, boxed stream that emits `Result<T>`
pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = Result<T>> + Send + 'a>>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
