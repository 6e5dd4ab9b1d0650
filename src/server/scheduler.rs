//! Frame scheduler: the server thread and its tick loop.
//!
//! Each tick, under the server mutex: drain inbound queues into the
//! dispatcher, generate due simulation frames (keyframes every 16th), age the
//! sync checker, react to desync, and emit the periodic CPU and bandwidth
//! reports. Pause stops frame generation but never dispatch.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{Origin, ServerError, ServerState, CHAT_EVERYONE};
use crate::config::NetworkConfig;
use crate::net::connection::Connection;
use crate::net::protocol::{Message, SERVER_PLAYER};

/// Every Nth simulation frame is a keyframe.
pub const KEYFRAME_INTERVAL: i64 = 16;
/// Simulation frames per game-second at speed 1.0.
pub const GAME_FRAME_RATE: f32 = 30.0;
/// Backstop against frame spirals after a long stall.
const MAX_FRAMES_PER_TICK: u32 = 30;

const PLAYER_INFO_INTERVAL: Duration = Duration::from_secs(1);
const BANDWIDTH_INTERVAL: Duration = Duration::from_secs(5);

impl ServerState {
    /// One scheduler tick. Called with the server mutex held.
    pub fn update(&mut self, now: Instant) {
        // Autohost chat commands surface as server-player chat.
        let mut chats = Vec::new();
        if let Some(hostif) = &self.hostif {
            while let Some(raw) = hostif.next_chat() {
                chats.push(raw);
            }
        }
        for raw in chats {
            match String::from_utf8(raw) {
                Ok(text) if !text.is_empty() && text.len() <= 4096 => {
                    let packet = Message::Chat {
                        player: SERVER_PLAYER,
                        dest: CHAT_EVERYONE,
                        text,
                    }
                    .encode();
                    self.dispatch(packet, Origin::Host);
                }
                _ => warn!("ignoring malformed autohost chat command"),
            }
        }

        // Datagrams from peers without a participant yet (join requests).
        while let Some((peer, packet)) = self.endpoint.accept() {
            self.dispatch(packet, Origin::Peer(peer));
        }

        // Participant connections: drain before frame generation so a packet
        // received in tick T is visible to the simulation by frame T.
        let mut inbound = Vec::new();
        for (index, participant) in self.participants.iter_mut().enumerate() {
            if !participant.active {
                continue;
            }
            if let Some(connection) = participant.connection.as_mut() {
                connection.update();
                while let Some(packet) = connection.next() {
                    inbound.push((index as u8, packet));
                }
            }
        }
        for (player, packet) in inbound {
            self.dispatch(packet, Origin::Player(player));
        }

        // Frame generation.
        let delta = self
            .last_tick
            .map(|t| now.duration_since(t).as_secs_f32())
            .unwrap_or(0.0);
        self.last_tick = Some(now);
        if self.game_has_started && !self.is_paused && !self.reloading {
            self.mod_game_time += delta * self.internal_speed;
            self.game_time = self.mod_game_time - self.start_time;
            self.frame_accumulator += delta * self.internal_speed * GAME_FRAME_RATE;
            let mut produced = 0;
            while self.frame_accumulator >= 1.0 && produced < MAX_FRAMES_PER_TICK {
                self.frame_accumulator -= 1.0;
                self.create_new_frame();
                produced += 1;
            }
        }

        // Sync aging and desync reaction.
        if self.server_frame_num >= 0 {
            let rtt = self.endpoint.average_rtt_millis();
            self.sync.check_timeouts(self.server_frame_num as u32, rtt);
        }
        if self.sync.take_desync() {
            let frame = self
                .sync
                .sync_error_frame()
                .or(self.sync.sync_warning_frame())
                .unwrap_or(0);
            warn!(frame, "desync detected, requesting failover");
            self.endpoint.trigger_failover_if_needed();
            self.send_system_message(SERVER_PLAYER, &format!("sync error at frame {frame}"));
        }

        // Periodic reports.
        if now.duration_since(self.last_player_info) >= PLAYER_INFO_INTERVAL {
            self.last_player_info = now;
            self.send_client_proc_usage();
        }
        if now.duration_since(self.last_bandwidth_update) >= BANDWIDTH_INTERVAL {
            self.last_bandwidth_update = now;
            self.check_bandwidth();
        }

        self.maybe_start_game();

        if self.check_for_game_end() {
            let winners = self.winning_ally_teams.clone();
            let over = Message::GameOver {
                player: SERVER_PLAYER,
            }
            .encode();
            self.broadcast(&over);
            if let Some(hostif) = &self.hostif {
                hostif.send_game_over(SERVER_PLAYER, &winners);
            }
            self.quit_game();
        }
    }

    /// Advance the lockstep by one frame; keyframes open a sync entry.
    pub(crate) fn create_new_frame(&mut self) {
        self.server_frame_num += 1;
        let frame = self.server_frame_num;
        if frame % KEYFRAME_INTERVAL == 0 {
            let packet = Message::KeyFrame {
                frame: frame as u32,
            }
            .encode();
            self.broadcast(&packet);
            if !self.sync_players().is_empty() {
                self.sync.open_frame(frame as u32);
            }
        }
        self.update_speed_control(self.cur_speed_ctrl);
    }

    /// Adjust speeds from player load and network RTT.
    ///
    /// Mode 1 follows the average reported load, mode 2 the worst. On top of
    /// that, RTT above 50 ms throttles the user speed factor proportionally.
    pub(crate) fn update_speed_control(&mut self, mode: u8) {
        if mode == 0 {
            return;
        }
        let mut sum = 0.0f32;
        let mut max = 0.0f32;
        let mut clients = 0u32;
        for participant in self.participants.iter().filter(|p| p.active) {
            sum += participant.cpu_usage;
            max = max.max(participant.cpu_usage);
            clients += 1;
        }
        if clients > 0 {
            self.median_cpu = sum / clients as f32;
        }

        let rtt = self.endpoint.average_rtt_millis();
        if rtt > 50.0 {
            let throttled = (self.user_speed_factor * (50.0 / rtt) as f32)
                .clamp(self.min_user_speed, self.max_user_speed);
            if (throttled - self.user_speed_factor).abs() > f32::EPSILON {
                self.user_speed_factor = throttled;
                let packet = Message::UserSpeed {
                    player: 0,
                    speed: throttled,
                }
                .encode();
                self.broadcast(&packet);
                info!(rtt, speed = throttled, "user speed throttled by rtt");
            }
        }

        if clients > 0 {
            let target = if mode == 1 { self.median_cpu } else { max };
            if target > 0.0 {
                self.internal_speed_change(target);
            }
        }
        // The user cap binds even when no client reported load.
        self.internal_speed_change(self.internal_speed.min(self.user_speed_factor));
    }

    /// Set the internal simulation speed, clamped into
    /// `[min_user_speed, user_speed_factor]`. No-op when unchanged.
    pub(crate) fn internal_speed_change(&mut self, new_speed: f32) {
        let clamped = new_speed.clamp(self.min_user_speed, self.user_speed_factor);
        if (clamped - self.internal_speed).abs() < f32::EPSILON {
            return;
        }
        self.internal_speed = clamped;
        let packet = Message::InternalSpeed { speed: clamped }.encode();
        self.broadcast(&packet);
        debug!(speed = clamped, "internal speed changed");
    }

    /// A player (or the server) requested a new target speed.
    pub(crate) fn user_speed_change(&mut self, player: u8, new_speed: f32) {
        let new_speed = new_speed.clamp(self.min_user_speed, self.max_user_speed);
        if (new_speed - self.user_speed_factor).abs() < f32::EPSILON {
            return;
        }
        let follow = self.internal_speed > new_speed
            || (self.internal_speed - self.user_speed_factor).abs() < f32::EPSILON;
        self.user_speed_factor = new_speed;
        if follow {
            self.internal_speed_change(new_speed);
        }
        let packet = Message::UserSpeed {
            player,
            speed: new_speed,
        }
        .encode();
        self.broadcast(&packet);
    }

    /// Broadcast the per-player CPU usage snapshot (1 s cadence).
    pub(crate) fn send_client_proc_usage(&mut self) {
        let usages: Vec<(u8, f32)> = self
            .participants
            .iter()
            .enumerate()
            .filter(|(_, p)| p.active)
            .map(|(i, p)| (i as u8, p.cpu_usage))
            .collect();
        for (player, usage) in usages {
            let packet = Message::CpuUsage { player, usage }.encode();
            self.broadcast(&packet);
        }
    }

    /// Log per-connection traffic stats (5 s cadence).
    pub(crate) fn check_bandwidth(&self) {
        debug!(
            uptime_secs = self.server_start_time.elapsed().as_secs(),
            game_secs = self.game_time,
            frame = self.server_frame_num,
            "server stats"
        );
        for participant in self.participants.iter().filter(|p| p.active) {
            if let Some(connection) = &participant.connection {
                debug!(stats = %connection.stats(), "bandwidth");
            }
        }
    }
}

/// Handle to a running game server: owns the server thread, exposes the
/// host-control surface, and joins everything on drop.
pub struct GameServer {
    state: Arc<Mutex<ServerState>>,
    quit: Arc<std::sync::atomic::AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl GameServer {
    /// Construct the server state and start the scheduler thread.
    pub fn launch(config: NetworkConfig) -> Result<Self, ServerError> {
        let sleep_time = Duration::from_millis(config.server.sleep_time_ms.max(1));
        let state = ServerState::new(config)?;
        let quit = state.quit.clone();
        let state = Arc::new(Mutex::new(state));

        let loop_state = state.clone();
        let loop_quit = quit.clone();
        let thread = thread::Builder::new()
            .name("game-server".into())
            .spawn(move || {
                info!("server thread running");
                while !loop_quit.load(Ordering::SeqCst) {
                    {
                        let mut state = loop_state.lock();
                        state.update(Instant::now());
                    }
                    thread::sleep(sleep_time);
                }
                info!("server thread exiting");
            })
            .map_err(ServerError::Autohost)?;

        Ok(Self {
            state,
            quit,
            thread: Some(thread),
        })
    }

    /// Add the embedded local client; returns its slot and connection.
    pub fn add_local_client(&self, name: &str, version: &str) -> Option<(u8, Connection)> {
        self.state.lock().add_local_client(name, version)
    }

    pub fn pause(&self, pause: bool) {
        self.state.lock().pause_game(pause, true, SERVER_PLAYER);
    }

    pub fn set_user_speed(&self, player: u8, speed: f32) {
        self.state.lock().user_speed_change(player, speed);
    }

    pub fn quit(&self) {
        self.state.lock().quit_game();
    }

    /// True once the quit flag is raised and the server thread has exited.
    pub fn has_finished(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
            && self.thread.as_ref().map(|t| t.is_finished()).unwrap_or(true)
    }

    /// Run a closure under the server mutex.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut ServerState) -> R) -> R {
        f(&mut self.state.lock())
    }
}

impl Drop for GameServer {
    fn drop(&mut self) {
        self.state.lock().quit_game();
        self.quit.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::tags;
    use crate::server::test_support::*;

    /// Two players on separate alliances so the game-end predicate holds off.
    fn two_player_state() -> ServerState {
        let mut state = test_state();
        state.dispatch(join_packet(0, false, 0, "alice"), Origin::Host);
        state.dispatch(join_packet(1, false, 1, "bob"), Origin::Host);
        state.teams[0].ally_team = 0;
        state.teams[1].ally_team = 1;
        state
    }

    #[test]
    fn test_keyframe_cadence() {
        let mut state = two_player_state();
        state.start_game();
        let mut observer = attach_observer(&mut state, 0);

        for _ in 0..33 {
            state.create_new_frame();
        }
        assert_eq!(state.server_frame_num, 32);

        let keyframes: Vec<u32> = drain(&mut observer)
            .iter()
            .filter(|p| p.tag() == tags::KEYFRAME)
            .map(|p| match Message::decode(p).unwrap() {
                Message::KeyFrame { frame } => frame,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(keyframes, vec![0, 16, 32]);
    }

    #[test]
    fn test_keyframe_opens_sync_entry() {
        let mut state = two_player_state();
        state.start_game();
        state.create_new_frame();
        assert!(state.sync.has_pending(0));
    }

    #[test]
    fn test_rtt_throttles_user_speed() {
        let mut state = two_player_state();
        let mut observer = attach_observer(&mut state, 0);
        // Feed a 200 ms RTT into the redundancy graph.
        state.endpoint.record_rtt("10.0.0.2:8452", 200.0);
        assert!((state.endpoint.average_rtt_millis() - 200.0).abs() < 1e-9);

        state.update_speed_control(1);
        assert!((state.user_speed_factor - 0.25).abs() < 1e-6);
        // The internal speed follows the cap down even with no load reports.
        assert!((state.internal_speed - 0.25).abs() < 1e-6);
        assert!(state.internal_speed <= state.user_speed_factor);

        let packets = drain(&mut observer);
        let throttle = packets
            .iter()
            .find(|p| p.tag() == tags::USER_SPEED)
            .unwrap();
        match Message::decode(throttle).unwrap() {
            Message::UserSpeed { player, speed } => {
                assert_eq!(player, 0);
                assert!((speed - 0.25).abs() < 1e-6);
            }
            _ => unreachable!(),
        }
        assert!(packets.iter().any(|p| p.tag() == tags::INTERNAL_SPEED));
    }

    #[test]
    fn test_rtt_throttle_with_no_active_players_keeps_invariant() {
        let mut state = test_state();
        state.endpoint.record_rtt("10.0.0.2:8452", 200.0);

        state.update_speed_control(1);
        assert!((state.user_speed_factor - 0.25).abs() < 1e-6);
        assert!((state.internal_speed - 0.25).abs() < 1e-6);
        assert!(state.internal_speed <= state.user_speed_factor);
    }

    #[test]
    fn test_speed_control_modes() {
        let mut state = two_player_state();
        state.participants[0].cpu_usage = 0.4;
        state.participants[1].cpu_usage = 0.8;

        state.update_speed_control(1);
        assert!((state.median_cpu - 0.6).abs() < 1e-6);
        assert!((state.internal_speed - 0.6).abs() < 1e-6);

        state.update_speed_control(2);
        assert!((state.internal_speed - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_internal_speed_clamped_to_user_factor() {
        let mut state = two_player_state();
        state.user_speed_factor = 1.5;
        state.internal_speed_change(5.0);
        assert!((state.internal_speed - 1.5).abs() < 1e-6);
        state.internal_speed_change(0.0);
        assert!((state.internal_speed - state.min_user_speed).abs() < 1e-6);
    }

    #[test]
    fn test_user_speed_change_clamps_and_broadcasts() {
        let mut state = two_player_state();
        let mut observer = attach_observer(&mut state, 0);
        state.user_speed_change(3, 10.0);
        assert!((state.user_speed_factor - state.max_user_speed).abs() < 1e-6);
        let packets = drain(&mut observer);
        let packet = packets
            .iter()
            .find(|p| p.tag() == tags::USER_SPEED)
            .unwrap();
        match Message::decode(packet).unwrap() {
            Message::UserSpeed { player, speed } => {
                assert_eq!(player, 3);
                assert!((speed - state.max_user_speed).abs() < 1e-6);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_update_generates_frames_once_started() {
        let mut state = two_player_state();
        let t0 = Instant::now();
        state.update(t0);
        assert!(state.game_has_started, "all players ready, game must start");
        assert_eq!(state.server_frame_num, -1);

        // 100 ms at speed 1.0 and 30 fps: three frames due.
        state.update(t0 + Duration::from_millis(100));
        assert!(state.server_frame_num >= 2);
        assert!(!state.quit_requested());
    }

    #[test]
    fn test_pause_stops_frames_but_not_dispatch() {
        let mut state = two_player_state();
        let t0 = Instant::now();
        state.update(t0);
        state.pause_game(true, true, SERVER_PLAYER);
        let frame_before = state.server_frame_num;

        // A chat arrives over the local-pair connection while paused.
        let mut chat_client = attach_observer(&mut state, 0);
        let chat = Message::Chat {
            player: 0,
            dest: CHAT_EVERYONE,
            text: "still here".into(),
        }
        .encode();
        chat_client.send(&chat).unwrap();

        state.update(t0 + Duration::from_millis(100));
        assert_eq!(state.server_frame_num, frame_before);
        // The chat was dispatched and its broadcast echoed back.
        assert!(drain(&mut chat_client)
            .iter()
            .any(|p| p.tag() == tags::CHAT));
    }

    #[test]
    fn test_game_end_quits_server() {
        let mut state = two_player_state();
        let t0 = Instant::now();
        state.update(t0);
        assert!(!state.quit_requested());
        let mut observer = attach_observer(&mut state, 0);

        // Bob's alliance collapses.
        state.remove_participant(1, 0);
        state.update(t0 + Duration::from_millis(10));
        assert!(state.quit_requested());
        assert_eq!(state.winning_ally_teams, vec![0]);
        assert!(drain(&mut observer)
            .iter()
            .any(|p| p.tag() == tags::GAME_OVER));
    }

    #[test]
    fn test_desync_triggers_failover_and_system_message() {
        let mut state = two_player_state();
        let mut observer = attach_observer(&mut state, 0);
        state.sync.open_frame(160);
        state.sync.record_response(160, 0, 0xDEADBEEF, &[0, 1]);
        state.sync.record_response(160, 1, 0xCAFEBABE, &[0, 1]);

        let t0 = Instant::now();
        state.update(t0);
        assert!(!state.sync.desync_has_occurred(), "flag consumed by update");
        let packets = drain(&mut observer);
        let system = packets
            .iter()
            .find(|p| p.tag() == tags::SYSTEM_MESSAGE)
            .expect("system message broadcast");
        match Message::decode(system).unwrap() {
            Message::SystemMessage { player, text } => {
                assert_eq!(player, SERVER_PLAYER);
                assert!(text.contains("160"));
            }
            _ => unreachable!(),
        }
        // Game continues after desync.
        assert!(!state.quit_requested());
    }

    #[test]
    fn test_game_server_launch_and_quit() {
        let server = GameServer::launch(test_config()).unwrap();
        let (slot, _client) = server.add_local_client("host", "1.0").unwrap();
        assert_eq!(slot, 0);
        assert!(!server.has_finished());

        server.quit();
        for _ in 0..100 {
            if server.has_finished() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(server.has_finished());
    }
}
