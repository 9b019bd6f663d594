pub mod batch; // Resumable, checkpointed record processing
pub mod collaborators; // Search, fetch, caption and OCR clients
pub mod filter;
pub mod stages; // crawl, caption, ocr, augment
