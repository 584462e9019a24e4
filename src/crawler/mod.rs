//! Scraping engine
//!
//! This module contains the core scraping logic, including:
//! - Egress identity selection (proxy and user agent rotation)
//! - HTTP fetching with retry, backoff and identity rotation
//! - Index and detail page parsing
//! - The dedup-and-save pipeline
//! - Per-session polling orchestration and the session registry

mod coordinator;
mod detail;
mod fetcher;
mod parser;
mod pipeline;
mod proxy;
mod sessions;

pub use coordinator::{fetch_listing, Orchestrator};
pub use detail::parse_detail;
pub use fetcher::{
    backoff_delay, build_http_client, FetchResult, Fetcher, ReqwestTransport, Transport,
    TransportError,
};
pub use parser::{parse_index, IndexPage};
pub use pipeline::{ListingPipeline, DEFAULT_CONCURRENCY};
pub use proxy::{pick_user_agent, Identity, ProxyManager, USER_AGENTS};
pub use sessions::{SessionRegistry, TransportFactory};
