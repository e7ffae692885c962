pub mod common;
pub mod copies;
pub mod index;
pub mod resolve;
pub mod status;
