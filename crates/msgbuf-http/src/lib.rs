//! HTTP adapters (reqwest): attachment downloads and the content store client.

mod content_store;
mod fetcher;

pub use content_store::HttpContentStore;
pub use fetcher::HttpFetcher;
