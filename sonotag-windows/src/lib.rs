//! # sonotag-windows
//!
//! Windows WASAPI backend for sonotag.
//!
//! Provides:
//! - `WasapiBackend`: `CaptureBackend` over shared-mode WASAPI capture endpoints
//! - `WasapiCaptureDevice`: one polled capture stream converted to mono 16-bit PCM
//! - `EndpointEnumerator`: capture endpoint enumeration via the MMDevice API
//!
//! ## Platform Requirements
//! - Windows 10 or later
//! - Visual Studio Build Tools 2022 + Windows SDK for linking
//!
//! ## Usage
//! ```ignore
//! use std::sync::Arc;
//! use sonotag_core::{EngineConfiguration, RecordOptions, SonotagEngine};
//! use sonotag_windows::WasapiBackend;
//!
//! let backend = Arc::new(WasapiBackend::new());
//! let engine = SonotagEngine::new(backend, EngineConfiguration::default())?;
//! let outcome = engine.record(RecordOptions::default()).wait();
//! ```

#[cfg(target_os = "windows")]
pub mod backend;
#[cfg(target_os = "windows")]
mod com;
#[cfg(target_os = "windows")]
pub mod endpoints;

#[cfg(target_os = "windows")]
pub use backend::{WasapiBackend, WasapiCaptureDevice};
#[cfg(target_os = "windows")]
pub use endpoints::{Endpoint, EndpointEnumerator, Transport};
