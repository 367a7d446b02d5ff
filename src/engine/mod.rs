pub mod intake;
pub mod locator;
pub mod orchestrator;
pub mod queue;
pub mod retry;
pub mod scoring;
pub mod sweeper;
