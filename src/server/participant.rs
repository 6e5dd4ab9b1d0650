//! Player slots, teams, and the skirmish-AI id pool.

use hashbrown::HashMap;

use crate::net::connection::Connection;
use crate::net::packet::RawPacket;

/// Player slots available on the server. The configured `max_players` cap is
/// enforced at admission; this is the structural bound.
pub const MAX_PLAYERS: usize = 250;
pub const MAX_TEAMS: usize = 250;
pub const MAX_AIS: usize = 255;

/// One occupant of a player slot. Mutated only by the dispatcher under the
/// server mutex; destroyed on quit or kick.
#[derive(Default)]
pub struct Participant {
    pub active: bool,
    pub name: String,
    pub version: String,
    pub spectator: bool,
    pub team: u8,
    pub ready: bool,
    pub is_midgame_join: bool,
    pub cpu_usage: f32,
    pub last_frame_response: u32,
    /// Exclusively owned; exactly one connection per active participant.
    pub connection: Option<Connection>,
}

impl Participant {
    /// Enqueue a packet if this participant has a live connection.
    pub fn send(&self, packet: &RawPacket) {
        if let Some(connection) = &self.connection {
            let _ = connection.send(packet);
        }
    }

    /// Clear the slot for reuse.
    pub fn reset(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close(true);
        }
        *self = Participant::default();
    }
}

#[derive(Debug, Clone, Default)]
pub struct Team {
    pub active: bool,
    pub ally_team: u8,
    pub start_pos: [f32; 3],
    pub leader_player: Option<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkirmishAi {
    pub id: u8,
    pub host_player: u8,
    pub name: String,
}

/// Id pool for skirmish AIs. An id is in exactly one of the free list or the
/// active map at all times.
pub struct SkirmishAiPool {
    free: Vec<u8>,
    active: HashMap<u8, SkirmishAi>,
}

impl SkirmishAiPool {
    pub fn new() -> Self {
        // Lowest id first off the end of the free list.
        let free: Vec<u8> = (0..MAX_AIS as u16).rev().map(|id| id as u8).collect();
        Self {
            free,
            active: HashMap::new(),
        }
    }

    /// Reserve the lowest free id for a new AI. `None` when the pool is
    /// exhausted.
    pub fn reserve(&mut self, host_player: u8, name: String) -> Option<u8> {
        let id = self.free.pop()?;
        self.active.insert(
            id,
            SkirmishAi {
                id,
                host_player,
                name,
            },
        );
        Some(id)
    }

    /// Return an id to the pool. Unknown ids are ignored.
    pub fn release(&mut self, id: u8) -> Option<SkirmishAi> {
        let ai = self.active.remove(&id)?;
        self.free.push(id);
        self.free.sort_unstable_by(|a, b| b.cmp(a));
        Some(ai)
    }

    pub fn get(&self, id: u8) -> Option<&SkirmishAi> {
        self.active.get(&id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// AIs hosted by a player, released when that player leaves.
    pub fn release_hosted_by(&mut self, player: u8) -> Vec<SkirmishAi> {
        let ids: Vec<u8> = self
            .active
            .values()
            .filter(|ai| ai.host_player == player)
            .map(|ai| ai.id)
            .collect();
        ids.into_iter().filter_map(|id| self.release(id)).collect()
    }
}

impl Default for SkirmishAiPool {
    fn default() -> Self {
        Self::new()
    }
}
