pub mod config;
pub mod error;
pub mod record_result;
pub mod source;
pub mod state;
