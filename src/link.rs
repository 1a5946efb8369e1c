/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Per-channel link negotiation: magic/version exchange, capability
 * advertisement, and ticket authentication against the server's RSA key. */

use crate::channel::ChannelKind;
use crate::proto::*;
use crate::sock;
use crate::tag;
use log::debug;
use rand::rngs::OsRng;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use sha1::Sha1;
use std::os::fd::OwnedFd;

/** Upper bound on the capability words a sane server sends back. */
const MAX_CAP_WORDS: u32 = 64;

/** Run the complete link sequence on a freshly connected socket. On
 * success the channel may start exchanging mini-header framed messages.
 *
 * `session_id` is zero for the first (main) connection; sub-channels pass
 * the id the server assigned in main-init. */
pub fn handshake(
    fd: &OwnedFd,
    kind: ChannelKind,
    session_id: u32,
    password: &str,
) -> Result<(), String> {
    send_link_message(fd, kind, session_id)?;

    let mut raw_header = [0u8; LINK_HEADER_SIZE];
    if sock::read_exact(fd, &mut raw_header, None)? {
        return Err(tag!("Server closed the connection during link"));
    }
    let header = parse_link_header(&raw_header);
    if header.magic != SPICE_MAGIC {
        return Err(tag!("Bad link magic: {:#010x}", header.magic));
    }
    if header.major != SPICE_VERSION_MAJOR {
        return Err(tag!(
            "Unsupported protocol version {}.{}",
            header.major,
            header.minor
        ));
    }
    if (header.size as usize) < LINK_REPLY_SIZE {
        return Err(tag!("Link reply too short: {} bytes", header.size));
    }

    let mut raw_reply = [0u8; LINK_REPLY_SIZE];
    if sock::read_exact(fd, &mut raw_reply, None)? {
        return Err(tag!("Server closed the connection during link"));
    }
    let reply = parse_link_reply(&raw_reply);
    if reply.error != LINK_ERR_OK {
        return Err(tag!(
            "Channel {} link refused: error {}",
            kind.name(),
            reply.error
        ));
    }
    if reply.num_common_caps > MAX_CAP_WORDS || reply.num_channel_caps > MAX_CAP_WORDS {
        return Err(tag!(
            "Implausible capability count: {}/{}",
            reply.num_common_caps,
            reply.num_channel_caps
        ));
    }
    /* The server's capability words are not acted on: the client already
     * committed to mini-header framing and spice-ticket auth above. */
    let caps_len = 4 * (reply.num_common_caps + reply.num_channel_caps) as usize;
    if sock::discard(fd, caps_len, None)? {
        return Err(tag!("Server closed the connection during link"));
    }

    authenticate(fd, kind, &reply.pub_key, password)?;
    debug!("Channel {}: link complete", kind.name());
    Ok(())
}

fn send_link_message(fd: &OwnedFd, kind: ChannelKind, session_id: u32) -> Result<(), String> {
    let body_size = (LINK_MESS_SIZE + 8) as u32;
    let mut pkt = Vec::with_capacity(LINK_HEADER_SIZE + body_size as usize);
    put_link_header(&mut pkt, body_size);
    put_u32(&mut pkt, session_id);
    put_u8(&mut pkt, kind.wire_type());
    put_u8(&mut pkt, 0); /* channel id */
    put_u32(&mut pkt, 1); /* one common caps word */
    put_u32(&mut pkt, 1); /* one channel caps word */
    put_u32(&mut pkt, LINK_MESS_SIZE as u32);

    let common_caps = (1 << COMMON_CAP_PROTOCOL_AUTH_SELECTION)
        | (1 << COMMON_CAP_AUTH_SPICE)
        | (1 << COMMON_CAP_MINI_HEADER);
    let channel_caps: u32 = match kind {
        ChannelKind::Main => 1 << MAIN_CAP_AGENT_CONNECTED_TOKENS,
        ChannelKind::Playback => 1 << PLAYBACK_CAP_VOLUME,
        ChannelKind::Inputs => 0,
    };
    put_u32(&mut pkt, common_caps);
    put_u32(&mut pkt, channel_caps);
    sock::send_all(fd, &pkt)
}

/** Select spice-ticket auth, send the encrypted password, and check the
 * final link status. */
fn authenticate(
    fd: &OwnedFd,
    kind: ChannelKind,
    pub_key: &[u8; TICKET_PUBKEY_BYTES],
    password: &str,
) -> Result<(), String> {
    let mut mech = Vec::new();
    put_u32(&mut mech, COMMON_CAP_AUTH_SPICE);
    sock::send_all(fd, &mech)?;

    let ticket = encrypt_ticket(pub_key, password)?;
    sock::send_all(fd, &ticket)?;

    let mut raw_result = [0u8; 4];
    if sock::read_exact(fd, &mut raw_result, None)? {
        return Err(tag!("Server closed the connection during auth"));
    }
    let result = u32::from_le_bytes(raw_result);
    if result != LINK_ERR_OK {
        return Err(tag!(
            "Channel {} authentication failed: error {}",
            kind.name(),
            result
        ));
    }
    Ok(())
}

/** RSA-OAEP(SHA-1) encryption of the password ticket under the server's
 * SubjectPublicKeyInfo-encoded key. The ticket is NUL terminated and
 * truncated to the protocol's password limit beforehand. */
fn encrypt_ticket(pub_key_der: &[u8], password: &str) -> Result<Vec<u8>, String> {
    let key = RsaPublicKey::from_public_key_der(pub_key_der)
        .map_err(|x| tag!("Failed to parse server public key: {}", x))?;
    let mut ticket = password.as_bytes().to_vec();
    ticket.truncate(MAX_PASSWORD_LEN);
    ticket.push(0);
    key.encrypt(&mut OsRng, Oaep::new::<Sha1>(), &ticket)
        .map_err(|x| tag!("Failed to encrypt ticket: {}", x))
}
