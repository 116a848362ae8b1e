pub mod exporter;
pub mod recognizer;

pub use exporter::ExportService;
pub use recognizer::RecognitionService;
