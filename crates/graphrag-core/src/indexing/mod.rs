pub mod splitter;
pub mod loader;
pub mod coordinator;

pub use splitter::TextSplitter;
pub use loader::{DocumentLoader, FileSystemLoader};
pub use coordinator::{IndexSummary, IndexingCoordinator, ProgressSink};
