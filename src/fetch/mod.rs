pub mod fetcher;
pub mod transport;
