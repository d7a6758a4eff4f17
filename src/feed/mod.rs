pub mod degradation;
pub mod ingestor;
pub mod monitors;
pub mod rate_limit;
pub mod socketio;

// Re-export the pieces main wires together.
pub use degradation::DegradationManager;
pub use ingestor::FeedIngestor;
