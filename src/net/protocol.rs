//! Wire protocol: message tags and typed encode/decode.
//!
//! Every message is a [`RawPacket`] whose first byte is the tag; integers are
//! little-endian, strings are either u8-length-prefixed or trail out to the
//! end of the packet. Decoding never panics: a malformed payload yields a
//! [`ProtocolError`] and the packet is dropped by the caller.

use crate::net::packet::{PacketBuilder, PacketError, PacketReader, RawPacket};

/// Synthetic "player" number for server-generated messages.
pub const SERVER_PLAYER: u8 = 255;

/// Message tags (byte 0 of every packet).
pub mod tags {
    pub const KEYFRAME: u8 = 1;
    pub const QUIT: u8 = 2;
    pub const START_PLAYING: u8 = 3;
    pub const PLAYER_NAME: u8 = 4;
    pub const CHAT: u8 = 5;
    pub const SYSTEM_MESSAGE: u8 = 6;
    pub const PAUSE: u8 = 7;
    pub const INTERNAL_SPEED: u8 = 8;
    pub const USER_SPEED: u8 = 9;
    pub const CPU_USAGE: u8 = 10;
    pub const GAME_ID: u8 = 11;
    pub const SYNCRESPONSE: u8 = 12;
    pub const CREATE_NEWPLAYER: u8 = 13;
    pub const PING: u8 = 14;
    pub const GAME_FRAME_PROGRESS: u8 = 15;
    pub const GAMESTATE_DUMP: u8 = 16;
    pub const GAMESTATE: u8 = 17;
    pub const JOIN_TEAM: u8 = 18;
    pub const REJECT: u8 = 19;
    pub const GAME_OVER: u8 = 20;
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
    #[error("unpack failed: {0}")]
    Unpack(#[from] PacketError),
}

/// Typed view of the wire messages the server core produces or consumes.
/// Packets with tags outside this set are forwarded verbatim by the
/// dispatcher and never decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    KeyFrame { frame: u32 },
    Quit,
    StartPlaying { countdown: u32 },
    PlayerName { player: u8, name: String },
    Chat { player: u8, dest: u8, text: String },
    SystemMessage { player: u8, text: String },
    Pause { player: u8, paused: bool },
    InternalSpeed { speed: f32 },
    UserSpeed { player: u8, speed: f32 },
    CpuUsage { player: u8, usage: f32 },
    GameId { id: [u8; 16] },
    SyncResponse { player: u8, frame: u32, checksum: u32 },
    CreateNewPlayer { player: u8, spectator: bool, team: u8, name: String },
    Ping { player: u8 },
    GameFrameProgress { player: u8, frame: u32 },
    GamestateDump { player: u8, frame: i32 },
    Gamestate { frame: i32 },
    JoinTeam { player: u8, team: u8 },
    Reject { player: u8, reason: String },
    GameOver { player: u8 },
}

impl Message {
    /// Pack into a wire packet. Encoding is total: every variant fits well
    /// under the packet size cap except pathological strings, which the
    /// builder truncates.
    pub fn encode(&self) -> RawPacket {
        let builder = match self {
            Message::KeyFrame { frame } => PacketBuilder::new(tags::KEYFRAME).write_u32(*frame),
            Message::Quit => PacketBuilder::new(tags::QUIT),
            Message::StartPlaying { countdown } => {
                PacketBuilder::new(tags::START_PLAYING).write_u32(*countdown)
            }
            Message::PlayerName { player, name } => PacketBuilder::new(tags::PLAYER_NAME)
                .write_u8(*player)
                .write_str_tail(name),
            Message::Chat { player, dest, text } => PacketBuilder::new(tags::CHAT)
                .write_u8(*player)
                .write_u8(*dest)
                .write_str_tail(text),
            Message::SystemMessage { player, text } => PacketBuilder::new(tags::SYSTEM_MESSAGE)
                .write_u8(*player)
                .write_str_tail(text),
            Message::Pause { player, paused } => PacketBuilder::new(tags::PAUSE)
                .write_u8(*player)
                .write_u8(u8::from(*paused)),
            Message::InternalSpeed { speed } => {
                PacketBuilder::new(tags::INTERNAL_SPEED).write_f32(*speed)
            }
            Message::UserSpeed { player, speed } => PacketBuilder::new(tags::USER_SPEED)
                .write_u8(*player)
                .write_f32(*speed),
            Message::CpuUsage { player, usage } => PacketBuilder::new(tags::CPU_USAGE)
                .write_u8(*player)
                .write_f32(*usage),
            Message::GameId { id } => PacketBuilder::new(tags::GAME_ID).write_bytes(id),
            Message::SyncResponse { player, frame, checksum } => {
                PacketBuilder::new(tags::SYNCRESPONSE)
                    .write_u8(*player)
                    .write_u32(*frame)
                    .write_u32(*checksum)
            }
            Message::CreateNewPlayer { player, spectator, team, name } => {
                PacketBuilder::new(tags::CREATE_NEWPLAYER)
                    .write_u8(*player)
                    .write_u8(u8::from(*spectator))
                    .write_u8(*team)
                    .write_str_tail(name)
            }
            Message::Ping { player } => PacketBuilder::new(tags::PING).write_u8(*player),
            Message::GameFrameProgress { player, frame } => {
                PacketBuilder::new(tags::GAME_FRAME_PROGRESS)
                    .write_u8(*player)
                    .write_u32(*frame)
            }
            Message::GamestateDump { player, frame } => PacketBuilder::new(tags::GAMESTATE_DUMP)
                .write_u8(*player)
                .write_i32(*frame),
            Message::Gamestate { frame } => PacketBuilder::new(tags::GAMESTATE).write_i32(*frame),
            Message::JoinTeam { player, team } => PacketBuilder::new(tags::JOIN_TEAM)
                .write_u8(*player)
                .write_u8(*team),
            Message::Reject { player, reason } => PacketBuilder::new(tags::REJECT)
                .write_u8(*player)
                .write_str_tail(reason),
            Message::GameOver { player } => PacketBuilder::new(tags::GAME_OVER).write_u8(*player),
        };
        // A builder starting from a tag byte cannot produce an empty packet,
        // and all fixed layouts are far below the size cap.
        builder.build().expect("wire message exceeds packet size cap")
    }

    /// Decode a known-tag packet. Unknown tags are an error so the dispatcher
    /// can fall through to verbatim forwarding.
    pub fn decode(packet: &RawPacket) -> Result<Message, ProtocolError> {
        let mut r = PacketReader::new(packet);
        let msg = match packet.tag() {
            tags::KEYFRAME => Message::KeyFrame { frame: r.read_u32()? },
            tags::QUIT => Message::Quit,
            tags::START_PLAYING => Message::StartPlaying { countdown: r.read_u32()? },
            tags::PLAYER_NAME => Message::PlayerName {
                player: r.read_u8()?,
                name: r.read_str_tail()?,
            },
            tags::CHAT => Message::Chat {
                player: r.read_u8()?,
                dest: r.read_u8()?,
                text: r.read_str_tail()?,
            },
            tags::SYSTEM_MESSAGE => Message::SystemMessage {
                player: r.read_u8()?,
                text: r.read_str_tail()?,
            },
            tags::PAUSE => Message::Pause {
                player: r.read_u8()?,
                paused: r.read_u8()? != 0,
            },
            tags::INTERNAL_SPEED => Message::InternalSpeed { speed: r.read_f32()? },
            tags::USER_SPEED => Message::UserSpeed {
                player: r.read_u8()?,
                speed: r.read_f32()?,
            },
            tags::CPU_USAGE => Message::CpuUsage {
                player: r.read_u8()?,
                usage: r.read_f32()?,
            },
            tags::GAME_ID => {
                let mut id = [0u8; 16];
                id.copy_from_slice(r.read_bytes(16)?);
                Message::GameId { id }
            }
            tags::SYNCRESPONSE => Message::SyncResponse {
                player: r.read_u8()?,
                frame: r.read_u32()?,
                checksum: r.read_u32()?,
            },
            tags::CREATE_NEWPLAYER => Message::CreateNewPlayer {
                player: r.read_u8()?,
                spectator: r.read_u8()? != 0,
                team: r.read_u8()?,
                name: r.read_str_tail()?,
            },
            tags::PING => Message::Ping { player: r.read_u8()? },
            tags::GAME_FRAME_PROGRESS => Message::GameFrameProgress {
                player: r.read_u8()?,
                frame: r.read_u32()?,
            },
            tags::GAMESTATE_DUMP => Message::GamestateDump {
                player: r.read_u8()?,
                frame: r.read_i32()?,
            },
            tags::GAMESTATE => Message::Gamestate { frame: r.read_i32()? },
            tags::JOIN_TEAM => Message::JoinTeam {
                player: r.read_u8()?,
                team: r.read_u8()?,
            },
            tags::REJECT => Message::Reject {
                player: r.read_u8()?,
                reason: r.read_str_tail()?,
            },
            tags::GAME_OVER => Message::GameOver { player: r.read_u8()? },
            other => return Err(ProtocolError::UnknownTag(other)),
        };
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let packet = msg.encode();
        let decoded = Message::decode(&packet).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_sync_response_roundtrip() {
        roundtrip(Message::SyncResponse {
            player: 3,
            frame: 160,
            checksum: 0xDEADBEEF,
        });
    }

    #[test]
    fn test_create_newplayer_roundtrip() {
        roundtrip(Message::CreateNewPlayer {
            player: 1,
            spectator: false,
            team: 0,
            name: "alice".into(),
        });
    }

    #[test]
    fn test_chat_roundtrip() {
        roundtrip(Message::Chat {
            player: 4,
            dest: SERVER_PLAYER,
            text: "gg wp".into(),
        });
    }

    #[test]
    fn test_user_speed_roundtrip() {
        roundtrip(Message::UserSpeed {
            player: 0,
            speed: 0.25,
        });
    }

    #[test]
    fn test_game_id_roundtrip() {
        roundtrip(Message::GameId { id: [0xAB; 16] });
    }

    #[test]
    fn test_pause_roundtrip() {
        roundtrip(Message::Pause {
            player: SERVER_PLAYER,
            paused: true,
        });
        roundtrip(Message::Pause {
            player: 2,
            paused: false,
        });
    }

    #[test]
    fn test_unknown_tag_is_error() {
        let packet = RawPacket::new(vec![200, 1, 2, 3]).unwrap();
        assert!(matches!(
            Message::decode(&packet),
            Err(ProtocolError::UnknownTag(200))
        ));
    }

    #[test]
    fn test_truncated_payload_is_unpack_error() {
        // SYNCRESPONSE wants 9 payload bytes; give it 2.
        let packet = RawPacket::new(vec![tags::SYNCRESPONSE, 1, 2]).unwrap();
        assert!(matches!(
            Message::decode(&packet),
            Err(ProtocolError::Unpack(_))
        ));
    }

    #[test]
    fn test_keyframe_layout() {
        let packet = Message::KeyFrame { frame: 16 }.encode();
        assert_eq!(packet.as_bytes(), &[tags::KEYFRAME, 16, 0, 0, 0]);
    }
}
