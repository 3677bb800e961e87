//! The six pipeline stages: sentiment, research, PM pitches, peer
//! review, chairman synthesis, execution.

pub mod chairman;
pub mod execution;
pub mod peer_review;
pub mod pm_pitch;
pub mod research;
pub mod sentiment;

pub use chairman::ChairmanStage;
pub use execution::{size_factor, ExecutionStage};
pub use peer_review::PeerReviewStage;
pub use pm_pitch::PmPitchStage;
pub use research::ResearchStage;
pub use sentiment::SentimentStage;
