pub mod bucket;
pub mod sender;
