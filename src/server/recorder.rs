//! Demo recorder seam.
//!
//! The demo format is owned by an external collaborator; the core only needs
//! a place to announce state-dump points. The default recorder does nothing.

use tracing::debug;

pub trait GameRecorder: Send {
    /// Called when a client requests a gamestate dump at `frame`.
    fn save_state(&mut self, frame: i32);
}

/// Recorder used when demo recording is disabled.
pub struct NullRecorder;

impl GameRecorder for NullRecorder {
    fn save_state(&mut self, frame: i32) {
        debug!(frame, "state dump requested (recording disabled)");
    }
}
