//! Keyframe sync checking and desync detection.
//!
//! Every keyframe opens a pending entry; players answer with their frame
//! checksum. Two disagreeing checksums for the same frame mean the lockstep
//! simulations diverged. Entries that age past the timeout (inflated under
//! high RTT) are treated as desync candidates and removed. The checker only
//! raises flags; the scheduler decides what failover or messaging follows,
//! and the game always continues.

use std::collections::BTreeMap;

use hashbrown::HashMap;
use tracing::{debug, warn};

/// Frames a sync entry may stay outstanding before it counts as a desync
/// candidate.
pub const SYNCCHECK_TIMEOUT: u32 = 300;
/// Average RTT (ms) above which the timeout is inflated.
pub const SYNCCHECK_MSG_TIMEOUT: f64 = 400.0;

/// Effective timeout in frames for the current network conditions.
pub fn effective_timeout(average_rtt_millis: f64) -> u32 {
    if average_rtt_millis > SYNCCHECK_MSG_TIMEOUT {
        SYNCCHECK_TIMEOUT + (average_rtt_millis / 10.0) as u32
    } else {
        SYNCCHECK_TIMEOUT
    }
}

pub struct SyncChecker {
    /// frame -> (player -> checksum) for outstanding keyframes.
    pending: BTreeMap<u32, HashMap<u8, u32>>,
    desync_has_occurred: bool,
    sync_error_frame: Option<u32>,
    sync_warning_frame: Option<u32>,
}

impl SyncChecker {
    pub fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
            desync_has_occurred: false,
            sync_error_frame: None,
            sync_warning_frame: None,
        }
    }

    /// Open a pending entry when a keyframe is broadcast.
    pub fn open_frame(&mut self, frame: u32) {
        self.pending.entry(frame).or_default();
    }

    /// Record one player's checksum. A mismatch against any previously
    /// recorded checksum for the frame marks desync immediately. The entry is
    /// retired once every player in `expected_players` has answered.
    pub fn record_response(
        &mut self,
        frame: u32,
        player: u8,
        checksum: u32,
        expected_players: &[u8],
    ) {
        let entry = self.pending.entry(frame).or_default();
        if let Some((&other_player, &other_checksum)) =
            entry.iter().find(|(_, &c)| c != checksum)
        {
            warn!(
                frame,
                player,
                checksum = format_args!("{checksum:#010x}"),
                other_player,
                other_checksum = format_args!("{other_checksum:#010x}"),
                "sync checksum mismatch"
            );
            self.desync_has_occurred = true;
            self.sync_error_frame = Some(frame);
        }
        entry.insert(player, checksum);

        let all_answered = expected_players.iter().all(|p| entry.contains_key(p));
        if all_answered {
            self.pending.remove(&frame);
            debug!(frame, "sync frame complete");
        }
    }

    /// Age out entries older than the effective timeout. Each timed-out frame
    /// is a desync candidate: the warning frame is recorded and the desync
    /// flag raised. Returns the frames that timed out.
    pub fn check_timeouts(&mut self, server_frame: u32, average_rtt_millis: f64) -> Vec<u32> {
        let timeout = effective_timeout(average_rtt_millis);
        let timed_out: Vec<u32> = self
            .pending
            .keys()
            .copied()
            .filter(|&frame| server_frame.saturating_sub(frame) > timeout)
            .collect();
        for frame in &timed_out {
            self.pending.remove(frame);
            self.sync_warning_frame = Some(*frame);
            self.desync_has_occurred = true;
            warn!(frame, timeout, "sync response timeout");
        }
        timed_out
    }

    /// Drop per-player state when a participant leaves mid-check.
    pub fn forget_player(&mut self, player: u8) {
        for entry in self.pending.values_mut() {
            entry.remove(&player);
        }
    }

    /// Consume the desync flag. The caller reacts exactly once per
    /// occurrence.
    pub fn take_desync(&mut self) -> bool {
        std::mem::take(&mut self.desync_has_occurred)
    }

    pub fn desync_has_occurred(&self) -> bool {
        self.desync_has_occurred
    }

    pub fn sync_error_frame(&self) -> Option<u32> {
        self.sync_error_frame
    }

    pub fn sync_warning_frame(&self) -> Option<u32> {
        self.sync_warning_frame
    }

    pub fn has_pending(&self, frame: u32) -> bool {
        self.pending.contains_key(&frame)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for SyncChecker {
    fn default() -> Self {
        Self::new()
    }
}
