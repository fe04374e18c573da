pub mod analyzer;
pub mod codec;
pub mod fft;
pub mod frame_queue;
pub mod level;
pub mod ring_buffer;
