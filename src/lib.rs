//! # pagefetch
//!
//! Fetch web pages and return them as markdown, plain text, HTML or raw
//! bytes. Each URL is fetched over plain HTTP first; a classifier decides
//! whether the document needs a headless Chrome render (single-page apps,
//! JavaScript-heavy domains, near-empty bodies) and, if so, the page is
//! rendered through a bounded pool of browser processes.
//!
//! Batches run with bounded concurrency and per-URL timeouts. Long batches
//! can be submitted as background jobs whose progress is tracked in a
//! versioned store.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pagefetch::{Config, FetchService, SingleFetchRequest};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let service = FetchService::new(Config::default()).await?;
//!     let page = service
//!         .fetch_one(SingleFetchRequest::new("https://example.com"))
//!         .await?;
//!     println!("{} bytes of {}", page.size, page.format);
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! pagefetch fetch https://example.com --format text
//! pagefetch batch --input urls.txt --output results.json --concurrency 8
//! pagefetch health --detailed
//! ```

/// Configuration and settings
pub mod config;

/// Error types and status code mapping
pub mod error;

/// Browser process launch and supervision
pub mod process;

/// Chrome-backed browser processes
pub mod chrome;

/// Pool of reusable browser instances
pub mod browser_pool;

/// Bounded caches used by the classifier
pub mod cache;

/// Static-vs-render decision for fetched documents
pub mod classifier;

/// Headless rendering through the browser pool
pub mod render;

/// Plain HTTP fetching
pub mod fetcher;

/// URL validation
pub mod validate;

/// Output format negotiation and conversion
pub mod convert;

/// Per-batch concurrency and the per-URL pipeline
pub mod orchestrator;

/// Versioned job storage
pub mod store;

/// Background batch jobs
pub mod jobs;

/// Service wiring
pub mod service;

/// Command-line interface implementation
pub mod cli;

/// Metrics and performance tracking
pub mod metrics;

/// Health assessment
pub mod health;

/// Utility functions
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;


pub use browser_pool::*;
pub use cache::*;
pub use chrome::*;
pub use classifier::*;
pub use cli::*;
pub use config::*;
pub use convert::*;
pub use error::*;
pub use fetcher::*;
pub use health::*;
pub use jobs::*;
pub use metrics::*;
pub use orchestrator::*;
pub use process::*;
pub use render::*;
pub use service::*;
pub use store::*;
pub use utils::*;
pub use validate::*;
