pub mod client;
pub mod normalizer;

pub use client::OcrClient;
pub use normalizer::normalize_response;
