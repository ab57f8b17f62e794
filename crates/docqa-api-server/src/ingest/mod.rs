pub mod chunker;
pub mod enrich;
pub mod extract;
pub mod pipeline;
pub mod storage;

pub use pipeline::{IngestPipeline, PdfSource};
pub use storage::BlobStore;
