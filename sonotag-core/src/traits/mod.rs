pub mod capture_device;
pub mod detection_service;
pub mod engine_delegate;
