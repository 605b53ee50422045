pub mod auth_gate;
pub mod cache;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod http;
pub mod router;
pub mod session;
pub mod stability;
pub mod store;

pub use auth_gate::*;
pub use cache::*;
pub use config::*;
pub use error::{Result, SidelinkError};
pub use event_bus::*;
pub use http::*;
pub use router::*;
pub use session::*;
pub use stability::*;
pub use store::*;
