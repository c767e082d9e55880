pub mod context;
pub mod toggle;
