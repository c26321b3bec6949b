//! Session lifecycle: state machine, controller, status reporting

mod controller;
mod state;
mod status;

pub use controller::SessionController;
pub use state::SessionState;
pub use status::{SessionNotification, SessionStatus, SessionStatusEvent};
