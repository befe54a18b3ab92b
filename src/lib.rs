pub mod config;
pub mod embedder;
pub mod error;
pub mod export;
pub mod extract;
pub mod fetch;
pub mod matcher;
pub mod preprocess;
pub mod reference;
pub mod storage;

pub use embedder::Embedder;
pub use error::Error;

// The ONNX-backed embedder
pub use faceseek_vision::Pipeline;
