pub mod config;
pub mod message;
pub mod transport;

// Re-export the types most callers need to simplify imports elsewhere
pub use config::{FactoryParams, ServiceParams, TransportConfig};
pub use message::{MessageDispatcher, RabbitMessage};
pub use transport::errors::{Result, TransportError};
pub use transport::{RabbitTransport, TransportContext};
