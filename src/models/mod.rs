pub mod invoice;
pub mod project;
pub mod result;

pub use invoice::{
    CanonicalInvoice, InvoiceItem, NormalizedInvoice, Party, StoredInvoice, StoredInvoiceItem,
};
pub use project::Project;
pub use result::{RecognitionOutcome, UploadStatus};
