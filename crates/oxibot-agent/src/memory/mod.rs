//! Memory system — passive file-based store plus a background extractor
//! that distills conversation history into it.
//!
//! - **store**: `MemoryStore` — `memory/MEMORY.md` and daily notes, read on
//!   every prompt build, written by tools or the extractor
//! - **extractor**: `MemoryExtractor` — idle- and urgent-triggered
//!   distillation passes, at most one in flight per session
//! - **signals**: correction-phrase detection that triggers the urgent path

pub mod extractor;
pub mod signals;
pub mod store;

pub use extractor::{ExtractionFn, MemoryExtractor, DEFAULT_IDLE_MS};
pub use signals::contains_correction_signal;
pub use store::MemoryStore;
