//! Business logic: authorization, connections, and the demo itself.

pub mod authorizer;
pub mod connection;
pub mod controller;
pub mod demo;
pub mod registry;
pub mod session;

pub use authorizer::TopicAuthorizer;
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState, MessageHandler};
pub use controller::DemoController;
pub use registry::ConnectionRegistry;
pub use session::DemoSession;
