pub mod attachment;
pub mod audio;
pub mod config;
pub mod error;
pub mod gateway;
pub mod message;
pub mod protocol;
pub mod session;

pub use error::{ChatError, Result};
pub use session::{SessionEngine, SessionEvent, SessionTexts, TurnOutcome};
