pub mod calibrator;
pub mod detect;
pub mod engine;
pub mod pipeline;
pub(crate) mod request;
