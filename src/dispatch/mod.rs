//! Event dispatch: the dispatcher task and the connection registry it owns.

pub use dispatcher::{Dispatcher, DispatcherCommand};
pub use registry::ConnectionRegistry;

mod dispatcher;
mod registry;
