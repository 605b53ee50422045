pub mod auth;
pub mod connection;
pub mod resource;

pub use auth::*;
pub use connection::*;
pub use resource::*;
