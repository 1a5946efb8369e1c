/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Wire constants and record codecs for the SPICE client protocol.
 *
 * All multi-byte integers on the wire are little-endian. Records are
 * packed; the helpers here read from and append to plain byte slices so
 * no layout tricks are needed anywhere else. */

/* Link stage */

/** Link header magic, the bytes "REDQ" */
pub const SPICE_MAGIC: u32 = u32::from_le_bytes(*b"REDQ");
pub const SPICE_VERSION_MAJOR: u32 = 2;
pub const SPICE_VERSION_MINOR: u32 = 2;

pub const LINK_ERR_OK: u32 = 0;

/** Size of the DER-encoded (SubjectPublicKeyInfo) RSA public key carried
 * in the link reply. */
pub const TICKET_PUBKEY_BYTES: usize = 162;
/** Longest password accepted, excluding the NUL terminator. */
pub const MAX_PASSWORD_LEN: usize = 31;

/* Capability bits advertised in the link message. Common capabilities are
 * indices into the (single) common caps word; channel capabilities index
 * the channel caps word of the respective channel. */
pub const COMMON_CAP_PROTOCOL_AUTH_SELECTION: u32 = 0;
pub const COMMON_CAP_AUTH_SPICE: u32 = 1;
pub const COMMON_CAP_MINI_HEADER: u32 = 3;
pub const MAIN_CAP_AGENT_CONNECTED_TOKENS: u32 = 2;
pub const PLAYBACK_CAP_VOLUME: u32 = 1;

/* Channel types */
pub const CHANNEL_MAIN: u8 = 1;
pub const CHANNEL_INPUTS: u8 = 3;
pub const CHANNEL_PLAYBACK: u8 = 5;

/* Messages shared by every channel (server to client) */
pub const MSG_MIGRATE: u16 = 1;
pub const MSG_MIGRATE_DATA: u16 = 2;
pub const MSG_SET_ACK: u16 = 3;
pub const MSG_PING: u16 = 4;
pub const MSG_WAIT_FOR_CHANNELS: u16 = 5;
pub const MSG_DISCONNECTING: u16 = 6;
pub const MSG_NOTIFY: u16 = 7;

/* Messages shared by every channel (client to server) */
pub const MSGC_ACK_SYNC: u16 = 1;
pub const MSGC_ACK: u16 = 2;
pub const MSGC_PONG: u16 = 3;
pub const MSGC_DISCONNECTING: u16 = 6;

/* Main channel (server to client) */
pub const MSG_MAIN_INIT: u16 = 103;
pub const MSG_MAIN_CHANNELS_LIST: u16 = 104;
pub const MSG_MAIN_AGENT_CONNECTED: u16 = 107;
pub const MSG_MAIN_AGENT_DISCONNECTED: u16 = 108;
pub const MSG_MAIN_AGENT_DATA: u16 = 109;
pub const MSG_MAIN_AGENT_TOKEN: u16 = 110;
pub const MSG_MAIN_AGENT_CONNECTED_TOKENS: u16 = 115;

/* Main channel (client to server) */
pub const MSGC_MAIN_ATTACH_CHANNELS: u16 = 104;
pub const MSGC_MAIN_MOUSE_MODE_REQUEST: u16 = 105;
pub const MSGC_MAIN_AGENT_START: u16 = 106;
pub const MSGC_MAIN_AGENT_DATA: u16 = 107;

/* Inputs channel */
pub const MSG_INPUTS_INIT: u16 = 101;
pub const MSG_INPUTS_KEY_MODIFIERS: u16 = 102;
pub const MSG_INPUTS_MOUSE_MOTION_ACK: u16 = 111;

pub const MSGC_INPUTS_KEY_DOWN: u16 = 101;
pub const MSGC_INPUTS_KEY_UP: u16 = 102;
pub const MSGC_INPUTS_KEY_MODIFIERS: u16 = 103;
pub const MSGC_INPUTS_MOUSE_MOTION: u16 = 111;
pub const MSGC_INPUTS_MOUSE_POSITION: u16 = 112;
pub const MSGC_INPUTS_MOUSE_PRESS: u16 = 113;
pub const MSGC_INPUTS_MOUSE_RELEASE: u16 = 114;

/** The server acknowledges relative mouse motion in groups of this many
 * messages; each `mouse-motion-ack` retires exactly this many. */
pub const INPUT_MOTION_ACK_BUNCH: i32 = 4;

/* Playback channel (server to client) */
pub const MSG_PLAYBACK_DATA: u16 = 101;
pub const MSG_PLAYBACK_START: u16 = 103;
pub const MSG_PLAYBACK_STOP: u16 = 104;
pub const MSG_PLAYBACK_VOLUME: u16 = 105;
pub const MSG_PLAYBACK_MUTE: u16 = 106;

pub const AUDIO_FMT_S16: u32 = 1;

/* Mouse */
pub const MOUSE_MODE_SERVER: u16 = 1;
pub const MOUSE_MODE_CLIENT: u16 = 2;

pub const MOUSE_BUTTON_LEFT: u8 = 1;
pub const MOUSE_BUTTON_MIDDLE: u8 = 2;
pub const MOUSE_BUTTON_RIGHT: u8 = 3;
pub const MOUSE_BUTTON_WHEEL_UP: u8 = 4;
pub const MOUSE_BUTTON_WHEEL_DOWN: u8 = 5;
pub const MOUSE_BUTTON_SIDE: u8 = 6;
pub const MOUSE_BUTTON_EXTRA: u8 = 7;

pub const MOUSE_BUTTON_MASK_LEFT: u16 = 1 << 0;
pub const MOUSE_BUTTON_MASK_MIDDLE: u16 = 1 << 1;
pub const MOUSE_BUTTON_MASK_RIGHT: u16 = 1 << 2;
pub const MOUSE_BUTTON_MASK_SIDE: u16 = 1 << 5;
pub const MOUSE_BUTTON_MASK_EXTRA: u16 = 1 << 6;

/* Agent sub-protocol, tunneled in main-channel agent-data messages */

pub const AGENT_PROTOCOL: u32 = 1;
/** Largest agent payload carried by one agent-data wire packet; logical
 * agent messages larger than this are fragmented by the sender. */
pub const AGENT_MAX_DATA_SIZE: usize = 2048;
/** Hard bound on inbound capability and grab-type lists. */
pub const AGENT_LIST_SIZE_MAX: u32 = 1024;

pub const AGENT_MSG_CLIPBOARD: u32 = 4;
pub const AGENT_MSG_ANNOUNCE_CAPABILITIES: u32 = 6;
pub const AGENT_MSG_CLIPBOARD_GRAB: u32 = 7;
pub const AGENT_MSG_CLIPBOARD_REQUEST: u32 = 8;
pub const AGENT_MSG_CLIPBOARD_RELEASE: u32 = 9;

pub const AGENT_CAP_CLIPBOARD_BY_DEMAND: u32 = 5;
pub const AGENT_CAP_CLIPBOARD_SELECTION: u32 = 6;

pub const AGENT_CLIPBOARD_NONE: u32 = 0;
pub const AGENT_CLIPBOARD_UTF8_TEXT: u32 = 1;
pub const AGENT_CLIPBOARD_IMAGE_PNG: u32 = 2;
pub const AGENT_CLIPBOARD_IMAGE_BMP: u32 = 3;
pub const AGENT_CLIPBOARD_IMAGE_TIFF: u32 = 4;
pub const AGENT_CLIPBOARD_IMAGE_JPG: u32 = 5;

pub const AGENT_CLIPBOARD_SELECTION_CLIPBOARD: u8 = 0;
/** Size of the opaque `{selection, reserved[3]}` preamble prepended to
 * clipboard messages when the per-selection capability is active. */
pub const AGENT_SELECTION_PREAMBLE: usize = 4;

/* Fixed record sizes */
pub const LINK_HEADER_SIZE: usize = 16;
pub const LINK_MESS_SIZE: usize = 18;
pub const LINK_REPLY_SIZE: usize = 4 + TICKET_PUBKEY_BYTES + 12;
pub const MINI_HEADER_SIZE: usize = 6;
pub const AGENT_HEADER_SIZE: usize = 20;

/* Cursor-style readers: each consumes from the front of `tail`. */

pub fn read_u8(tail: &mut &[u8]) -> Result<u8, &'static str> {
    let (x, rest) = tail.split_first().ok_or("Record too short")?;
    *tail = rest;
    Ok(*x)
}
pub fn read_u16(tail: &mut &[u8]) -> Result<u16, &'static str> {
    if tail.len() < 2 {
        return Err("Record too short");
    }
    let v = u16::from_le_bytes(tail[..2].try_into().unwrap());
    *tail = &tail[2..];
    Ok(v)
}
pub fn read_u32(tail: &mut &[u8]) -> Result<u32, &'static str> {
    if tail.len() < 4 {
        return Err("Record too short");
    }
    let v = u32::from_le_bytes(tail[..4].try_into().unwrap());
    *tail = &tail[4..];
    Ok(v)
}
pub fn read_u64(tail: &mut &[u8]) -> Result<u64, &'static str> {
    if tail.len() < 8 {
        return Err("Record too short");
    }
    let v = u64::from_le_bytes(tail[..8].try_into().unwrap());
    *tail = &tail[8..];
    Ok(v)
}
pub fn read_skip<'a>(tail: &mut &'a [u8], len: usize) -> Result<&'a [u8], &'static str> {
    if tail.len() < len {
        return Err("Record too short");
    }
    let (skipped, rest) = tail.split_at(len);
    *tail = rest;
    Ok(skipped)
}

/* Writers appending to a packet under construction. */

pub fn put_u8(dst: &mut Vec<u8>, v: u8) {
    dst.push(v);
}
pub fn put_u16(dst: &mut Vec<u8>, v: u16) {
    dst.extend_from_slice(&v.to_le_bytes());
}
pub fn put_u32(dst: &mut Vec<u8>, v: u32) {
    dst.extend_from_slice(&v.to_le_bytes());
}
pub fn put_i32(dst: &mut Vec<u8>, v: i32) {
    dst.extend_from_slice(&v.to_le_bytes());
}
pub fn put_u64(dst: &mut Vec<u8>, v: u64) {
    dst.extend_from_slice(&v.to_le_bytes());
}

/** The six-byte `{type, size}` prefix used for every post-link message
 * once the mini-header capability has been negotiated. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MiniHeader {
    pub ty: u16,
    pub size: u32,
}

pub fn parse_mini_header(b: &[u8; MINI_HEADER_SIZE]) -> MiniHeader {
    MiniHeader {
        ty: u16::from_le_bytes(b[0..2].try_into().unwrap()),
        size: u32::from_le_bytes(b[2..6].try_into().unwrap()),
    }
}

pub fn put_mini_header(dst: &mut Vec<u8>, ty: u16, size: u32) {
    put_u16(dst, ty);
    put_u32(dst, size);
}

/** Build one complete framed message: mini header followed by payload. */
pub fn framed(ty: u16, payload: &[u8]) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(MINI_HEADER_SIZE + payload.len());
    put_mini_header(&mut pkt, ty, payload.len() as u32);
    pkt.extend_from_slice(payload);
    pkt
}

/** Fixed preamble of every link exchange, in both directions. */
pub struct LinkHeader {
    pub magic: u32,
    pub major: u32,
    pub minor: u32,
    pub size: u32,
}

pub fn parse_link_header(b: &[u8; LINK_HEADER_SIZE]) -> LinkHeader {
    let mut tail = &b[..];
    LinkHeader {
        magic: read_u32(&mut tail).unwrap(),
        major: read_u32(&mut tail).unwrap(),
        minor: read_u32(&mut tail).unwrap(),
        size: read_u32(&mut tail).unwrap(),
    }
}

pub fn put_link_header(dst: &mut Vec<u8>, size: u32) {
    put_u32(dst, SPICE_MAGIC);
    put_u32(dst, SPICE_VERSION_MAJOR);
    put_u32(dst, SPICE_VERSION_MINOR);
    put_u32(dst, size);
}

/** Server's answer to the link message: status, its RSA public key for
 * ticket encryption, and its capability words. */
pub struct LinkReply {
    pub error: u32,
    pub pub_key: [u8; TICKET_PUBKEY_BYTES],
    pub num_common_caps: u32,
    pub num_channel_caps: u32,
}

pub fn parse_link_reply(b: &[u8; LINK_REPLY_SIZE]) -> LinkReply {
    let mut tail = &b[..];
    let error = read_u32(&mut tail).unwrap();
    let mut pub_key = [0u8; TICKET_PUBKEY_BYTES];
    pub_key.copy_from_slice(read_skip(&mut tail, TICKET_PUBKEY_BYTES).unwrap());
    let num_common_caps = read_u32(&mut tail).unwrap();
    let num_channel_caps = read_u32(&mut tail).unwrap();
    let _caps_offset = read_u32(&mut tail).unwrap();
    LinkReply {
        error,
        pub_key,
        num_common_caps,
        num_channel_caps,
    }
}

/** Session parameters delivered by the server's first main-channel
 * message. Only the fields the client acts on are kept by name. */
pub struct MainInit {
    pub session_id: u32,
    pub current_mouse_mode: u32,
    pub agent_connected: u32,
    pub agent_tokens: u32,
}

pub const MAIN_INIT_SIZE: usize = 32;

pub fn parse_main_init(b: &[u8; MAIN_INIT_SIZE]) -> MainInit {
    let mut tail = &b[..];
    let session_id = read_u32(&mut tail).unwrap();
    let _display_channels_hint = read_u32(&mut tail).unwrap();
    let _supported_mouse_modes = read_u32(&mut tail).unwrap();
    let current_mouse_mode = read_u32(&mut tail).unwrap();
    let agent_connected = read_u32(&mut tail).unwrap();
    let agent_tokens = read_u32(&mut tail).unwrap();
    let _multi_media_time = read_u32(&mut tail).unwrap();
    let _ram_hint = read_u32(&mut tail).unwrap();
    MainInit {
        session_id,
        current_mouse_mode,
        agent_connected,
        agent_tokens,
    }
}

/** Header of every logical agent message: `{protocol, type, opaque,
 * size}`. Continuation fragments of an oversized message carry none. */
#[derive(Debug, Clone, Copy)]
pub struct AgentHeader {
    pub protocol: u32,
    pub ty: u32,
    pub opaque: u64,
    pub size: u32,
}

pub fn parse_agent_header(b: &[u8; AGENT_HEADER_SIZE]) -> AgentHeader {
    let mut tail = &b[..];
    AgentHeader {
        protocol: read_u32(&mut tail).unwrap(),
        ty: read_u32(&mut tail).unwrap(),
        opaque: read_u64(&mut tail).unwrap(),
        size: read_u32(&mut tail).unwrap(),
    }
}

pub fn put_agent_header(dst: &mut Vec<u8>, ty: u32, size: u32) {
    put_u32(dst, AGENT_PROTOCOL);
    put_u32(dst, ty);
    put_u64(dst, 0);
    put_u32(dst, size);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mini_header_layout() {
        let pkt = framed(MSGC_PONG, &[1, 2, 3]);
        assert_eq!(pkt.len(), MINI_HEADER_SIZE + 3);
        let hdr = parse_mini_header(pkt[..6].try_into().unwrap());
        assert_eq!(hdr.ty, MSGC_PONG);
        assert_eq!(hdr.size, 3);
        assert_eq!(&pkt[6..], &[1, 2, 3]);
    }

    #[test]
    fn link_header_magic_bytes() {
        let mut buf = Vec::new();
        put_link_header(&mut buf, 26);
        assert_eq!(&buf[0..4], b"REDQ");
        let hdr = parse_link_header(buf[..].try_into().unwrap());
        assert_eq!(hdr.magic, SPICE_MAGIC);
        assert_eq!(hdr.major, SPICE_VERSION_MAJOR);
        assert_eq!(hdr.size, 26);
    }

    #[test]
    fn agent_header_roundtrip() {
        let mut buf = Vec::new();
        put_agent_header(&mut buf, AGENT_MSG_CLIPBOARD_GRAB, 12);
        assert_eq!(buf.len(), AGENT_HEADER_SIZE);
        let hdr = parse_agent_header(buf[..].try_into().unwrap());
        assert_eq!(hdr.protocol, AGENT_PROTOCOL);
        assert_eq!(hdr.ty, AGENT_MSG_CLIPBOARD_GRAB);
        assert_eq!(hdr.opaque, 0);
        assert_eq!(hdr.size, 12);
    }

    #[test]
    fn cursor_readers_consume() {
        let data = [0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0xff];
        let mut tail = &data[..];
        assert_eq!(read_u16(&mut tail), Ok(1));
        assert_eq!(read_u32(&mut tail), Ok(2));
        assert_eq!(read_u8(&mut tail), Ok(0xff));
        assert!(read_u8(&mut tail).is_err());
    }
}
