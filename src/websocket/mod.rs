//! WebSocket module: client connections, progress channels and fan-out.
//!
//! ## Frames
//!
//! ### Outbound (server -> client)
//! `{"fd": "<optional target>", "type": "<channel | event | notice>", "data": ..., "respAt": ...}`
//! - `event` - daemon connectivity, normalized daemon events, `pong`
//! - `notice` - user-facing notices
//! - `<channel name>` - progress output, e.g. `image:pull:nginx:latest`
//!
//! ### Inbound (client -> server)
//! - `ping` - bare text, answered with `{"type":"event","data":"pong"}`
//! - `{"type":"progress:close","data":"<channel name>"}` - stop a progress channel

pub mod bus;
pub mod client;
pub mod docker_progress;
pub mod handler;
pub mod hub;
pub mod progress;
pub mod protocol;
pub mod reaper;

pub use bus::Broadcaster;
pub use docker_progress::DockerProgressHook;
pub use handler::{ws_handler, WebSocketState};
pub use hub::ConnectionHub;
pub use progress::{ProgressChannel, ProgressError, ProgressRegistry};
pub use reaper::{IdleResource, IdleResourceReaper};
