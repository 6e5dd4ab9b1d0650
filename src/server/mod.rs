//! The authoritative game server: state, admission, and packet dispatch.
//!
//! [`ServerState`] owns everything the lockstep protocol needs: player
//! slots, teams, the packet cache for mid-game joiners, the sync checker and
//! the network endpoint. All mutation happens on the server thread under the
//! server mutex; the frame scheduler in [`scheduler`] drives it.
//!
//! Dispatch is keyed on the first byte of each incoming packet. Decode
//! failures drop the packet with a warning and never unwind the thread.

pub mod participant;
pub mod recorder;
pub mod scheduler;
pub mod sync;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap;
use rand::RngCore;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, NetworkConfig};
use crate::net::autohost::AutohostInterface;
use crate::net::connection::{Connection, ConnectionError, Endpoint};
use crate::net::packet::RawPacket;
use crate::net::protocol::{tags, Message, ProtocolError, SERVER_PLAYER};
use participant::{Participant, SkirmishAiPool, Team, MAX_PLAYERS, MAX_TEAMS};
use recorder::{GameRecorder, NullRecorder};
use sync::SyncChecker;

pub use scheduler::GameServer;

/// Join attempts counted against a name before further attempts are denied.
const MAX_REJECTED_ATTEMPTS: u32 = 3;

/// Chat destination meaning "everyone".
pub const CHAT_EVERYONE: u8 = 254;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("autohost interface: {0}")]
    Autohost(#[from] std::io::Error),
}

/// Where an inbound packet came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// A transport peer with no participant yet (joins land here).
    Peer(String),
    /// An admitted participant's connection.
    Player(u8),
    /// The autohost side channel or the server itself.
    Host,
}

/// Authoritative server state. One instance per game, owned by the server
/// thread.
pub struct ServerState {
    pub(crate) config: NetworkConfig,
    pub(crate) endpoint: Endpoint,
    pub(crate) participants: Vec<Participant>,
    pub(crate) teams: Vec<Team>,
    pub(crate) winning_ally_teams: Vec<u8>,
    pub(crate) skirmish_ais: SkirmishAiPool,
    pub(crate) rejected_connections: HashMap<String, u32>,
    pub(crate) packet_cache: Vec<RawPacket>,
    pub(crate) sync: SyncChecker,
    pub(crate) hostif: Option<AutohostInterface>,
    pub(crate) recorder: Box<dyn GameRecorder>,

    pub(crate) net_ping_timings: Vec<Option<Instant>>,
    pub(crate) median_ping: u32,
    pub(crate) median_cpu: f32,

    pub(crate) server_start_time: Instant,
    pub(crate) ready_time: Option<Instant>,
    pub(crate) last_tick: Option<Instant>,
    pub(crate) last_player_info: Instant,
    pub(crate) last_bandwidth_update: Instant,

    pub(crate) mod_game_time: f32,
    pub(crate) game_time: f32,
    pub(crate) start_time: f32,
    pub(crate) frame_accumulator: f32,
    /// -1 before the simulation starts.
    pub(crate) server_frame_num: i64,

    pub(crate) user_speed_factor: f32,
    pub(crate) internal_speed: f32,
    pub(crate) min_user_speed: f32,
    pub(crate) max_user_speed: f32,
    pub(crate) cur_speed_ctrl: u8,

    pub(crate) is_paused: bool,
    pub(crate) game_pausable: bool,
    pub(crate) reloading: bool,
    pub(crate) game_has_started: bool,
    pub(crate) generated_game_id: bool,
    pub(crate) game_id: [u8; 16],
    pub(crate) local_client: Option<u8>,
    /// Most distinct ally-teams ever active at once; the game-end predicate
    /// only fires after a reduction from at least two.
    pub(crate) peak_ally_teams: usize,

    pub(crate) allow_spec_join: bool,
    pub(crate) whitelist_additional_players: bool,
    pub(crate) log_info_messages: bool,
    pub(crate) log_debug_messages: bool,

    pub(crate) quit: Arc<AtomicBool>,
}

impl ServerState {
    pub fn new(config: NetworkConfig) -> Result<Self, ServerError> {
        let endpoint = Endpoint::open(&config)?;
        let hostif = if config.server.autohost_port != 0 {
            Some(AutohostInterface::new(
                &config.server.autohost_ip,
                config.server.autohost_port,
            )?)
        } else {
            None
        };

        let now = Instant::now();
        let tuning = &config.server;
        Ok(Self {
            participants: (0..MAX_PLAYERS).map(|_| Participant::default()).collect(),
            teams: vec![Team::default(); MAX_TEAMS],
            winning_ally_teams: Vec::new(),
            skirmish_ais: SkirmishAiPool::new(),
            rejected_connections: HashMap::new(),
            packet_cache: Vec::new(),
            sync: SyncChecker::new(),
            hostif,
            recorder: Box::new(NullRecorder),
            net_ping_timings: vec![None; MAX_PLAYERS],
            median_ping: 0,
            median_cpu: 0.0,
            server_start_time: now,
            ready_time: None,
            last_tick: None,
            last_player_info: now,
            last_bandwidth_update: now,
            mod_game_time: 0.0,
            game_time: 0.0,
            start_time: 0.0,
            frame_accumulator: 0.0,
            server_frame_num: -1,
            user_speed_factor: 1.0,
            internal_speed: 1.0,
            min_user_speed: tuning.min_user_speed,
            max_user_speed: tuning.max_user_speed,
            cur_speed_ctrl: tuning.speed_control,
            is_paused: false,
            game_pausable: tuning.game_pausable,
            reloading: false,
            game_has_started: false,
            generated_game_id: false,
            game_id: [0; 16],
            local_client: None,
            peak_ally_teams: 0,
            allow_spec_join: tuning.allow_spec_join,
            whitelist_additional_players: tuning.whitelist_additional_players,
            log_info_messages: tuning.log_info_messages,
            log_debug_messages: tuning.log_debug_messages,
            quit: Arc::new(AtomicBool::new(false)),
            endpoint,
            config,
        })
    }

    /// Swap in a real demo recorder.
    pub fn set_recorder(&mut self, recorder: Box<dyn GameRecorder>) {
        self.recorder = recorder;
    }

    pub fn pre_sim_frame(&self) -> bool {
        self.server_frame_num == -1
    }

    pub fn has_started(&self) -> bool {
        self.game_has_started
    }

    pub fn is_paused(&self) -> bool {
        self.is_paused
    }

    pub fn set_reloading(&mut self, reloading: bool) {
        self.reloading = reloading;
    }

    pub fn quit_requested(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    /// Active non-spectator player numbers; the set that must answer sync
    /// checks.
    pub(crate) fn sync_players(&self) -> Vec<u8> {
        self.participants
            .iter()
            .enumerate()
            .filter(|(_, p)| p.active && !p.spectator)
            .map(|(i, _)| i as u8)
            .collect()
    }

    fn active_player_count(&self) -> usize {
        self.participants.iter().filter(|p| p.active).count()
    }

    // -----------------------------------------------------------------
    // Broadcast and messaging
    // -----------------------------------------------------------------

    /// Enqueue a shared reference to the packet on every active
    /// participant's connection.
    pub fn broadcast(&mut self, packet: &RawPacket) {
        for participant in self.participants.iter().filter(|p| p.active) {
            participant.send(packet);
        }
    }

    /// Broadcast and remember for mid-game joiners. Only the roster and
    /// setup packets a joiner must replay belong in the cache; live traffic
    /// never does.
    fn broadcast_and_cache(&mut self, packet: &RawPacket) {
        self.broadcast(packet);
        self.packet_cache.push(packet.clone());
    }

    pub fn send_system_message(&mut self, player: u8, text: &str) {
        let packet = Message::SystemMessage {
            player,
            text: text.to_string(),
        }
        .encode();
        self.broadcast(&packet);
    }

    /// Log (gated by the config flags) and optionally broadcast as a system
    /// message.
    pub fn message(&mut self, text: &str, broadcast: bool) {
        if self.log_info_messages || self.log_debug_messages {
            info!("{}", text);
        }
        if broadcast {
            self.send_system_message(SERVER_PLAYER, text);
        }
    }

    // -----------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------

    /// Dispatch one inbound packet. Never panics; malformed payloads are
    /// dropped with a warning.
    pub fn dispatch(&mut self, packet: RawPacket, origin: Origin) {
        match packet.tag() {
            tags::SYNCRESPONSE => self.unpack_sync_response(&packet),
            tags::CREATE_NEWPLAYER => self.add_additional_user(&packet, &origin),
            tags::PING => self.handle_ping(&packet, &origin),
            tags::GAME_FRAME_PROGRESS => self.handle_frame_progress(&packet),
            tags::GAMESTATE_DUMP => self.dump_state(&packet),
            tags::CHAT => self.got_chat_message(&packet),
            tags::PAUSE => self.handle_pause(&packet),
            tags::USER_SPEED => self.handle_user_speed(&packet),
            tags::CPU_USAGE => self.handle_cpu_usage(&packet),
            tags::GAME_OVER => self.handle_game_over(&packet),
            other => {
                debug!(tag = other, len = packet.len(), "forwarding packet verbatim");
                self.broadcast(&packet);
            }
        }
    }

    fn drop_malformed(&self, packet: &RawPacket, err: ProtocolError) {
        warn!(tag = packet.tag(), %err, "dropping malformed packet");
    }

    pub(crate) fn unpack_sync_response(&mut self, packet: &RawPacket) {
        match Message::decode(packet) {
            Ok(Message::SyncResponse {
                player,
                frame,
                checksum,
            }) => {
                let expected = self.sync_players();
                self.sync.record_response(frame, player, checksum, &expected);
            }
            Ok(_) => {}
            Err(err) => self.drop_malformed(packet, err),
        }
    }

    /// Admission control and slot assignment for a join request.
    pub(crate) fn add_additional_user(&mut self, packet: &RawPacket, origin: &Origin) {
        let (player, spectator, team, name) = match Message::decode(packet) {
            Ok(Message::CreateNewPlayer {
                player,
                spectator,
                team,
                name,
            }) => (player, spectator, team, name),
            Ok(_) => return,
            Err(err) => {
                self.drop_malformed(packet, err);
                return;
            }
        };

        if self.rejected_connections.get(&name).copied().unwrap_or(0) > MAX_REJECTED_ATTEMPTS {
            self.reject_connection(player, &name, origin, "Too many failed connection attempts");
            return;
        }
        if spectator && !self.allow_spec_join && !self.whitelist_additional_players {
            self.reject_connection(
                player,
                &name,
                origin,
                "Server does not allow additional spectators",
            );
            return;
        }
        if (player as usize) >= MAX_PLAYERS || self.participants[player as usize].active {
            self.reject_connection(player, &name, origin, "No free player slot");
            return;
        }
        if self.active_player_count() >= self.config.max_players {
            self.reject_connection(player, &name, origin, "Server is full");
            return;
        }
        if (team as usize) >= MAX_TEAMS {
            self.reject_connection(player, &name, origin, "Invalid team");
            return;
        }

        let slot = player as usize;
        let is_midgame_join = self.game_has_started && !spectator;
        {
            let participant = &mut self.participants[slot];
            participant.active = true;
            participant.name = name.clone();
            participant.spectator = spectator;
            participant.team = team;
            participant.ready = !spectator;
            participant.is_midgame_join = is_midgame_join;
            participant.connection = match origin {
                Origin::Peer(peer) => Some(self.endpoint.connect(peer)),
                _ => None,
            };
        }

        // Mid-game joiners are caught up from the cache before any live
        // broadcast reaches them.
        for cached in self.packet_cache.clone() {
            self.participants[slot].send(&cached);
        }

        self.broadcast_and_cache(packet);

        if !spectator && !self.teams[team as usize].active {
            let entry = &mut self.teams[team as usize];
            entry.active = true;
            entry.leader_player = Some(player);
            // Each team is its own alliance until game setup says otherwise.
            entry.ally_team = team;
            let join = Message::JoinTeam { player, team }.encode();
            self.broadcast_and_cache(&join);
        }

        if let Some(hostif) = &self.hostif {
            hostif.send_player_joined(player, &name);
            if self.participants[slot].ready {
                hostif.send_player_ready(player, 1);
            }
        }
        info!(player, name = %name, spectator, team, is_midgame_join, "player joined");
    }

    pub(crate) fn reject_connection(
        &mut self,
        player: u8,
        name: &str,
        origin: &Origin,
        reason: &str,
    ) {
        let packet = Message::Reject {
            player,
            reason: reason.to_string(),
        }
        .encode();
        match origin {
            Origin::Peer(peer) => self.endpoint.send_to_peer(peer, &packet),
            _ => self.broadcast(&packet),
        }
        *self.rejected_connections.entry(name.to_string()).or_insert(0) += 1;
        warn!(player, name, reason, "connection rejected");
    }

    pub(crate) fn handle_ping(&mut self, packet: &RawPacket, origin: &Origin) {
        let player = match Message::decode(packet) {
            Ok(Message::Ping { player }) => player,
            Ok(_) => return,
            Err(err) => {
                self.drop_malformed(packet, err);
                return;
            }
        };
        if (player as usize) >= MAX_PLAYERS {
            return;
        }
        let now = Instant::now();
        if let Some(previous) = self.net_ping_timings[player as usize] {
            let interval_ms = now.duration_since(previous).as_millis() as f64;
            if interval_ms < 10_000.0 {
                if let Origin::Peer(peer) = origin {
                    self.endpoint.record_rtt(peer, interval_ms);
                } else if let Some(conn) = &self.participants[player as usize].connection {
                    self.endpoint.record_rtt(conn.peer(), interval_ms);
                    conn.metrics().record_rtt(interval_ms);
                }
            }
        }
        self.net_ping_timings[player as usize] = Some(now);

        let mut total_ms = 0u128;
        let mut samples = 0u32;
        for timing in self.net_ping_timings.iter().flatten() {
            total_ms += now.duration_since(*timing).as_millis();
            samples += 1;
        }
        self.median_ping = (total_ms / u128::from(samples.max(1))) as u32;
        debug!(player, median_ping = self.median_ping, "ping");
    }

    pub(crate) fn handle_frame_progress(&mut self, packet: &RawPacket) {
        match Message::decode(packet) {
            Ok(Message::GameFrameProgress { player, frame }) => {
                if (player as usize) < MAX_PLAYERS && self.participants[player as usize].active {
                    self.participants[player as usize].last_frame_response = frame;
                }
            }
            Ok(_) => {}
            Err(err) => self.drop_malformed(packet, err),
        }
    }

    pub(crate) fn dump_state(&mut self, packet: &RawPacket) {
        match Message::decode(packet) {
            Ok(Message::GamestateDump { player, frame }) => {
                self.recorder.save_state(frame);
                info!(player, frame, "gamestate dump");
                let reply = Message::Gamestate { frame }.encode();
                self.broadcast(&reply);
            }
            Ok(_) => {}
            Err(err) => self.drop_malformed(packet, err),
        }
    }

    pub(crate) fn got_chat_message(&mut self, packet: &RawPacket) {
        match Message::decode(packet) {
            Ok(Message::Chat { player, dest, text }) => {
                if text.is_empty() {
                    warn!(player, "empty chat message");
                    return;
                }
                self.broadcast(packet);
                if player != SERVER_PLAYER {
                    if let Some(hostif) = &self.hostif {
                        hostif.send_player_chat(player, dest, &text);
                    }
                }
            }
            Ok(_) => {}
            Err(err) => self.drop_malformed(packet, err),
        }
    }

    fn handle_pause(&mut self, packet: &RawPacket) {
        match Message::decode(packet) {
            Ok(Message::Pause { player, paused }) => {
                self.pause_game(paused, player == SERVER_PLAYER, player);
            }
            Ok(_) => {}
            Err(err) => self.drop_malformed(packet, err),
        }
    }

    fn handle_user_speed(&mut self, packet: &RawPacket) {
        match Message::decode(packet) {
            Ok(Message::UserSpeed { player, speed }) => {
                self.user_speed_change(player, speed);
            }
            Ok(_) => {}
            Err(err) => self.drop_malformed(packet, err),
        }
    }

    fn handle_cpu_usage(&mut self, packet: &RawPacket) {
        match Message::decode(packet) {
            Ok(Message::CpuUsage { player, usage }) => {
                if (player as usize) < MAX_PLAYERS && self.participants[player as usize].active {
                    self.participants[player as usize].cpu_usage = usage;
                }
            }
            Ok(_) => {}
            Err(err) => self.drop_malformed(packet, err),
        }
    }

    fn handle_game_over(&mut self, packet: &RawPacket) {
        match Message::decode(packet) {
            Ok(Message::GameOver { player }) => {
                self.broadcast(packet);
                if let Some(hostif) = &self.hostif {
                    hostif.send_player_defeated(player);
                }
            }
            Ok(_) => {}
            Err(err) => self.drop_malformed(packet, err),
        }
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// Add the embedded local client. Returns the slot and the client side of
    /// the in-process connection pair.
    pub fn add_local_client(&mut self, name: &str, version: &str) -> Option<(u8, Connection)> {
        let slot = self.participants.iter().position(|p| !p.active)?;
        let (server_side, client_side) = Connection::local_pair();
        {
            let participant = &mut self.participants[slot];
            participant.active = true;
            participant.name = name.to_string();
            participant.version = version.to_string();
            participant.ready = true;
            participant.connection = Some(server_side);
        }
        self.local_client = Some(slot as u8);

        let announce = Message::PlayerName {
            player: slot as u8,
            name: name.to_string(),
        }
        .encode();
        self.broadcast_and_cache(&announce);
        self.message(&format!("connection established (given id {slot})"), false);
        Some((slot as u8, client_side))
    }

    /// Reserve the lowest free skirmish-AI id for an AI hosted by
    /// `host_player`. `None` when the pool is exhausted.
    pub fn reserve_skirmish_ai_id(&mut self, host_player: u8, name: String) -> Option<u8> {
        self.skirmish_ais.reserve(host_player, name)
    }

    /// Return a skirmish-AI id to the free pool.
    pub fn free_skirmish_ai_id(&mut self, id: u8) {
        self.skirmish_ais.release(id);
    }

    /// Remove a participant, releasing the slot, its AIs, and its team when
    /// it was the last member.
    pub fn remove_participant(&mut self, player: u8, reason: u8) {
        let slot = player as usize;
        if slot >= MAX_PLAYERS || !self.participants[slot].active {
            return;
        }
        let name = self.participants[slot].name.clone();
        let team = self.participants[slot].team;
        let was_spectator = self.participants[slot].spectator;

        self.participants[slot].reset();
        self.sync.forget_player(player);
        self.skirmish_ais.release_hosted_by(player);
        if self.local_client == Some(player) {
            self.local_client = None;
        }

        if !was_spectator {
            let team_empty = !self
                .participants
                .iter()
                .any(|p| p.active && !p.spectator && p.team == team);
            if team_empty {
                self.teams[team as usize].active = false;
                self.teams[team as usize].leader_player = None;
            }
        }

        if let Some(hostif) = &self.hostif {
            hostif.send_player_left(player, reason);
        }
        let text = format!("player {name} left");
        self.send_system_message(SERVER_PLAYER, &text);
        info!(player, name = %name, reason, "player left");
    }

    /// Transition into the playing state: stamp the ready time, mint the
    /// GameID, and announce to clients and autohost. Idempotent.
    pub fn start_game(&mut self) {
        if self.game_has_started {
            return;
        }
        self.game_has_started = true;
        self.ready_time = Some(Instant::now());
        self.start_time = self.mod_game_time;

        if !self.generated_game_id {
            rand::thread_rng().fill_bytes(&mut self.game_id);
            self.generated_game_id = true;
        }
        let id_packet = Message::GameId { id: self.game_id }.encode();
        self.broadcast_and_cache(&id_packet);
        let start = Message::StartPlaying { countdown: 0 }.encode();
        self.broadcast_and_cache(&start);

        if let Some(hostif) = &self.hostif {
            hostif.send_start_playing(&self.game_id, "");
        }
        info!("game started");
    }

    /// Start once every active non-spectator is ready.
    pub(crate) fn maybe_start_game(&mut self) {
        if self.game_has_started {
            return;
        }
        let mut any = false;
        for participant in self.participants.iter().filter(|p| p.active && !p.spectator) {
            if !participant.ready {
                return;
            }
            any = true;
        }
        if any {
            self.start_game();
        }
    }

    /// Pause or resume. Ignored unless the game is pausable and the state
    /// actually changes; repeated requests are no-ops.
    pub fn pause_game(&mut self, pause: bool, from_server: bool, player: u8) {
        if !self.game_pausable || self.is_paused == pause {
            return;
        }
        self.is_paused = pause;
        let packet = Message::Pause {
            player: if from_server { SERVER_PLAYER } else { player },
            paused: pause,
        }
        .encode();
        self.broadcast(&packet);
        info!(pause, from_server, "pause state changed");
    }

    /// Broadcast QUIT exactly once and raise the quit flag.
    pub fn quit_game(&mut self) {
        if self.quit.swap(true, Ordering::SeqCst) {
            return;
        }
        let packet = Message::Quit.encode();
        self.broadcast(&packet);
        if let Some(hostif) = &self.hostif {
            hostif.send_quit();
        }
        info!("server quitting");
    }

    /// The game is over when, after start, the set of active ally-teams has
    /// been reduced to at most one. Never fires before the game has started,
    /// and never for a game that never had opposition.
    pub(crate) fn check_for_game_end(&mut self) -> bool {
        if !self.game_has_started || self.ready_time.is_none() {
            return false;
        }
        let mut ally_teams: Vec<u8> = self
            .teams
            .iter()
            .filter(|t| t.active)
            .map(|t| t.ally_team)
            .collect();
        ally_teams.sort_unstable();
        ally_teams.dedup();
        self.peak_ally_teams = self.peak_ally_teams.max(ally_teams.len());
        if self.peak_ally_teams < 2 || ally_teams.len() > 1 {
            return false;
        }
        self.winning_ally_teams = ally_teams;
        true
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn test_config() -> NetworkConfig {
        NetworkConfig {
            node_id: "test-server".into(),
            transport: "udp".into(),
            host: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        }
    }

    pub fn test_state() -> ServerState {
        ServerState::new(test_config()).unwrap()
    }

    pub fn join_packet(player: u8, spectator: bool, team: u8, name: &str) -> RawPacket {
        Message::CreateNewPlayer {
            player,
            spectator,
            team,
            name: name.into(),
        }
        .encode()
    }

    /// Wire an in-process connection into an active slot and return the
    /// client side, so a test can observe what the server broadcasts.
    pub fn attach_observer(state: &mut ServerState, slot: usize) -> Connection {
        let (server_side, client_side) = Connection::local_pair();
        state.participants[slot].connection = Some(server_side);
        client_side
    }

    pub fn drain(connection: &mut Connection) -> Vec<RawPacket> {
        let mut packets = Vec::new();
        while let Some(packet) = connection.next() {
            packets.push(packet);
        }
        packets
    }
}
