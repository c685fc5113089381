// Event-driven notification of the host
//
// Lobby actors publish facts to the bus; the host consumes them directly or
// through a handler registered with a subscription.

pub use bus::EventBus;
pub use events::LobbyEvent;
pub use handler::{LobbyEventError, LobbyEventHandler};
pub use subscription::LobbySubscription;

mod bus;
mod events;
mod handler;
mod subscription;
