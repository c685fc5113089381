pub mod assertions;
pub mod mocks;
pub mod setup;

// Re-export main utilities for use by test files
#[allow(unused_imports)]
pub use assertions::{wait_for_event, wait_for_status};
#[allow(unused_imports)]
pub use mocks::FlakyLobbyRepository;
#[allow(unused_imports)]
pub use setup::{TestSetup, TestSetupBuilder};
