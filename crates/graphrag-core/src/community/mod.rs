pub mod detector;
pub mod summarizer;

pub use detector::CommunityDetector;
pub use summarizer::CommunitySummarizer;
