//! Autohost side channel.
//!
//! Write-mostly UDP channel to an external controller process. Every message
//! is a single datagram starting with its tag byte. Sends are queued and
//! shipped by a worker with the same capped-backoff retry the connections
//! use; the receive worker surfaces inbound chat commands through
//! [`AutohostInterface::next_chat`]. Losing the controller never affects the
//! game.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, warn};

/// Side-channel message tags.
pub mod events {
    pub const SERVER_STARTED: u8 = 0;
    pub const SERVER_QUIT: u8 = 1;
    pub const SERVER_STARTPLAYING: u8 = 2;
    pub const SERVER_GAMEOVER: u8 = 3;
    pub const PLAYER_JOINED: u8 = 10;
    pub const PLAYER_LEFT: u8 = 11;
    pub const PLAYER_READY: u8 = 12;
    pub const PLAYER_CHAT: u8 = 13;
    pub const PLAYER_DEFEATED: u8 = 14;
    pub const GAME_LUAMSG: u8 = 20;
}

const QUEUE_CAPACITY: usize = 1024;
const SEND_MAX_ATTEMPTS: u32 = 3;
const RECV_BUFFER: usize = 65_536;

fn send_backoff(attempt: u32) -> Duration {
    Duration::from_millis((100 * attempt as u64).min(500))
}

/// Fire-and-forget channel to the autohost controller.
pub struct AutohostInterface {
    send_tx: Sender<Vec<u8>>,
    chat_rx: Receiver<Vec<u8>>,
    running: Arc<AtomicBool>,
    workers: Vec<thread::JoinHandle<()>>,
    local_addr: std::net::SocketAddr,
}

impl AutohostInterface {
    /// Bind an ephemeral socket pointed at the controller and start the two
    /// workers. Announces `SERVER_STARTED` immediately.
    pub fn new(remote_ip: &str, remote_port: u16) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.connect((remote_ip, remote_port))?;
        socket.set_read_timeout(Some(Duration::from_millis(100)))?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        let running = Arc::new(AtomicBool::new(true));
        let (send_tx, send_rx) = bounded::<Vec<u8>>(QUEUE_CAPACITY);
        let (chat_tx, chat_rx) = bounded::<Vec<u8>>(QUEUE_CAPACITY);

        let mut workers = Vec::with_capacity(2);
        {
            let socket = socket.clone();
            let running = running.clone();
            workers.push(
                thread::Builder::new()
                    .name("autohost-send".into())
                    .spawn(move || send_worker(socket, send_rx, running))?,
            );
        }
        {
            let socket = socket.clone();
            let running = running.clone();
            workers.push(
                thread::Builder::new()
                    .name("autohost-recv".into())
                    .spawn(move || recv_worker(socket, chat_tx, running))?,
            );
        }

        let interface = Self {
            send_tx,
            chat_rx,
            running,
            workers,
            local_addr,
        };
        interface.send_start();
        Ok(interface)
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    fn enqueue(&self, buffer: Vec<u8>) {
        if let Err(TrySendError::Full(_)) = self.send_tx.try_send(buffer) {
            warn!("autohost send queue full, dropping message");
        }
    }

    pub fn send_start(&self) {
        self.enqueue(vec![events::SERVER_STARTED]);
    }

    pub fn send_quit(&self) {
        self.enqueue(vec![events::SERVER_QUIT]);
    }

    /// `[tag][u32 total size][gameID; 16][demo name]`
    pub fn send_start_playing(&self, game_id: &[u8; 16], demo_name: &str) {
        let total = 1 + 4 + 16 + demo_name.len();
        let mut buffer = Vec::with_capacity(total);
        buffer.push(events::SERVER_STARTPLAYING);
        buffer.extend_from_slice(&(total as u32).to_le_bytes());
        buffer.extend_from_slice(game_id);
        buffer.extend_from_slice(demo_name.as_bytes());
        self.enqueue(buffer);
    }

    /// `[tag][player][count][winning ally teams...]`
    pub fn send_game_over(&self, player: u8, winning_ally_teams: &[u8]) {
        let mut buffer = Vec::with_capacity(3 + winning_ally_teams.len());
        buffer.push(events::SERVER_GAMEOVER);
        buffer.push(player);
        buffer.push(winning_ally_teams.len() as u8);
        buffer.extend_from_slice(winning_ally_teams);
        self.enqueue(buffer);
    }

    pub fn send_player_joined(&self, player: u8, name: &str) {
        let mut buffer = Vec::with_capacity(2 + name.len());
        buffer.push(events::PLAYER_JOINED);
        buffer.push(player);
        buffer.extend_from_slice(name.as_bytes());
        self.enqueue(buffer);
    }

    pub fn send_player_left(&self, player: u8, reason: u8) {
        self.enqueue(vec![events::PLAYER_LEFT, player, reason]);
    }

    pub fn send_player_ready(&self, player: u8, ready_state: u8) {
        self.enqueue(vec![events::PLAYER_READY, player, ready_state]);
    }

    pub fn send_player_chat(&self, player: u8, destination: u8, msg: &str) {
        let mut buffer = Vec::with_capacity(3 + msg.len());
        buffer.push(events::PLAYER_CHAT);
        buffer.push(player);
        buffer.push(destination);
        buffer.extend_from_slice(msg.as_bytes());
        self.enqueue(buffer);
    }

    pub fn send_player_defeated(&self, player: u8) {
        self.enqueue(vec![events::PLAYER_DEFEATED, player]);
    }

    pub fn send_lua_msg(&self, msg: &[u8]) {
        let mut buffer = Vec::with_capacity(1 + msg.len());
        buffer.push(events::GAME_LUAMSG);
        buffer.extend_from_slice(msg);
        self.enqueue(buffer);
    }

    /// Drain one inbound chat command, if any.
    pub fn next_chat(&self) -> Option<Vec<u8>> {
        self.chat_rx.try_recv().ok()
    }

    fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for AutohostInterface {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn send_worker(socket: Arc<UdpSocket>, send_rx: Receiver<Vec<u8>>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        let buffer = match send_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(buffer) => buffer,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        for attempt in 1..=SEND_MAX_ATTEMPTS {
            match socket.send(&buffer) {
                Ok(_) => break,
                Err(err) if attempt < SEND_MAX_ATTEMPTS => {
                    debug!(attempt, %err, "autohost send failed, retrying");
                    thread::sleep(send_backoff(attempt));
                }
                Err(err) => warn!(%err, "autohost send failed, dropping message"),
            }
        }
    }
}

fn recv_worker(socket: Arc<UdpSocket>, chat_tx: Sender<Vec<u8>>, running: Arc<AtomicBool>) {
    let mut buf = vec![0u8; RECV_BUFFER];
    while running.load(Ordering::SeqCst) {
        match socket.recv(&mut buf) {
            Ok(0) => {}
            Ok(len) => {
                if let Err(TrySendError::Full(_)) = chat_tx.try_send(buf[..len].to_vec()) {
                    warn!("autohost chat queue full, dropping command");
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(e) => {
                debug!("autohost receive error: {}", e);
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Controller socket + interface pointed at it.
    fn pair() -> (UdpSocket, AutohostInterface) {
        let controller = UdpSocket::bind("127.0.0.1:0").unwrap();
        controller
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = controller.local_addr().unwrap().port();
        let interface = AutohostInterface::new("127.0.0.1", port).unwrap();
        (controller, interface)
    }

    fn recv(controller: &UdpSocket) -> Vec<u8> {
        let mut buf = [0u8; 1024];
        let len = controller.recv(&mut buf).unwrap();
        buf[..len].to_vec()
    }

    #[test]
    fn test_server_started_announced_on_creation() {
        let (controller, _interface) = pair();
        assert_eq!(recv(&controller), vec![events::SERVER_STARTED]);
    }

    #[test]
    fn test_player_joined_layout() {
        let (controller, interface) = pair();
        assert_eq!(recv(&controller)[0], events::SERVER_STARTED);

        interface.send_player_joined(1, "alice");
        let msg = recv(&controller);
        assert_eq!(msg[0], events::PLAYER_JOINED);
        assert_eq!(msg[1], 1);
        assert_eq!(&msg[2..], b"alice");
    }

    #[test]
    fn test_game_over_layout() {
        let (controller, interface) = pair();
        assert_eq!(recv(&controller)[0], events::SERVER_STARTED);

        interface.send_game_over(255, &[0, 2]);
        let msg = recv(&controller);
        assert_eq!(msg, vec![events::SERVER_GAMEOVER, 255, 2, 0, 2]);
    }

    #[test]
    fn test_start_playing_layout() {
        let (controller, interface) = pair();
        assert_eq!(recv(&controller)[0], events::SERVER_STARTED);

        let game_id = [7u8; 16];
        interface.send_start_playing(&game_id, "demo.sdfz");
        let msg = recv(&controller);
        assert_eq!(msg[0], events::SERVER_STARTPLAYING);
        let total = u32::from_le_bytes([msg[1], msg[2], msg[3], msg[4]]) as usize;
        assert_eq!(total, msg.len());
        assert_eq!(&msg[5..21], &game_id);
        assert_eq!(&msg[21..], b"demo.sdfz");
    }

    #[test]
    fn test_chat_drain() {
        let (controller, interface) = pair();
        assert_eq!(recv(&controller)[0], events::SERVER_STARTED);

        let target = ("127.0.0.1", interface.local_addr().port());
        controller.send_to(b"/say hello", target).unwrap();

        let mut chat = None;
        for _ in 0..100 {
            if let Some(msg) = interface.next_chat() {
                chat = Some(msg);
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(chat.unwrap(), b"/say hello");
    }

    #[test]
    fn test_player_left_and_ready() {
        let (controller, interface) = pair();
        assert_eq!(recv(&controller)[0], events::SERVER_STARTED);

        interface.send_player_left(3, 1);
        assert_eq!(recv(&controller), vec![events::PLAYER_LEFT, 3, 1]);
        interface.send_player_ready(3, 2);
        assert_eq!(recv(&controller), vec![events::PLAYER_READY, 3, 2]);
    }
}
