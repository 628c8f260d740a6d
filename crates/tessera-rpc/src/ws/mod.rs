pub mod events;
pub mod server;

pub use events::{EventBroadcaster, WsEvent};
pub use server::create_ws_router;
