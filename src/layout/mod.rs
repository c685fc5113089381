// Dungeon generation engine: seeded generator, validator, layout cache and
// the service that ties them together.

pub use cache::{CacheStats, LayoutCache};
pub use errors::{GenerationError, RejectionReason};
pub use generator::{furnish, LayoutGenerator};
pub use models::{
    CacheKey, CandidateLayout, Difficulty, GenerationParameters, Layout, LayoutId, Rect, Room,
    RoomKind,
};
pub use service::GenerationService;
pub use validator::LayoutValidator;

mod cache;
mod errors;
mod generator;
pub mod models;
mod service;
mod validator;
