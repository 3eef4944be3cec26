pub mod agent_event;
pub mod config;
pub mod error;
pub mod path_guard;
pub mod session;

pub use agent_event::AgentEvent;
pub use config::Config;
pub use error::{Error, Result};
pub use session::{Session, SessionFilter, SessionStatus};
