pub mod local;
pub mod global;
pub mod mode;
pub mod vector;

pub use local::LocalSearch;
pub use global::GlobalSearch;
pub use mode::SearchModeDetector;
pub use vector::ChunkSearch;
