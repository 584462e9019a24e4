//! State module for tracking session progress
//!
//! # Components
//!
//! - `SessionState`: the Idle/Running state machine of one polling session

mod session_state;

// Re-export main types
pub use session_state::SessionState;
