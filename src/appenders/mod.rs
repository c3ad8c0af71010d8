//! Output sinks: the log file with rotation, the console and log shipping

pub mod console;
pub mod file;
pub mod network;
pub mod rotating_file;

pub use file::{FileSink, FlushContext};
pub use network::{
    encode_frame, ClientConfig, FrameReader, RemoteSink, ShippingClient, ShippingMetrics,
    ShippingServer, MAX_FRAME_SIZE,
};
pub use rotating_file::{
    Compression, Compressor, GzipCompressor, RotationManager, RotationPolicy, RotationReport,
};
