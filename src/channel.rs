/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Per-channel connection state and the message handling every channel
 * shares: framing, the infrastructural server messages, and ACK window
 * accounting. */

use crate::proto::*;
use crate::sock;
use crate::tag;
use log::{debug, error, info, warn};
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Main,
    Inputs,
    Playback,
}

impl ChannelKind {
    pub fn wire_type(self) -> u8 {
        match self {
            ChannelKind::Main => CHANNEL_MAIN,
            ChannelKind::Inputs => CHANNEL_INPUTS,
            ChannelKind::Playback => CHANNEL_PLAYBACK,
        }
    }
    pub fn name(self) -> &'static str {
        match self {
            ChannelKind::Main => "main",
            ChannelKind::Inputs => "inputs",
            ChannelKind::Playback => "playback",
        }
    }
}

/** Receive-side bookkeeping; touched only by the event-loop thread (and
 * by channel setup before the socket is registered). */
struct RecvState {
    init_done: bool,
    ack_frequency: u32,
    ack_count: u32,
}

/** Outcome of draining one framed message. `Closed` means the peer shut
 * the stream down in an orderly fashion; protocol violations and I/O
 * failures are reported as `Err` instead. */
#[derive(Debug, PartialEq, Eq)]
pub enum Status {
    Ok,
    Handled,
    Closed,
}

/** What the common-message filter decided about an inbound header. */
pub enum Inbound {
    /** Channel-specific message; the caller must consume `size` bytes. */
    Msg(MiniHeader),
    Handled,
    Closed,
}

pub struct Channel {
    pub kind: ChannelKind,
    /* The socket slot is shared by the event loop (reads) and user
     * threads (writes); holders clone the Arc out so teardown never has
     * to wait for an in-flight operation. */
    slot: Mutex<Option<Arc<OwnedFd>>>,
    connected: AtomicBool,
    ready: AtomicBool,
    send: Mutex<()>,
    recv: Mutex<RecvState>,
}

impl Channel {
    pub fn new(kind: ChannelKind) -> Channel {
        Channel {
            kind,
            slot: Mutex::new(None),
            connected: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            send: Mutex::new(()),
            recv: Mutex::new(RecvState {
                init_done: false,
                ack_frequency: 0,
                ack_count: 0,
            }),
        }
    }

    pub fn sock(&self) -> Option<Arc<OwnedFd>> {
        self.slot.lock().unwrap().clone()
    }

    /** Adopt a freshly connected socket and reset per-connection state. */
    pub fn install(&self, fd: OwnedFd) {
        let mut recv = self.recv.lock().unwrap();
        recv.init_done = false;
        recv.ack_frequency = 0;
        recv.ack_count = 0;
        drop(recv);
        *self.slot.lock().unwrap() = Some(Arc::new(fd));
        self.ready.store(false, Ordering::Release);
        self.connected.store(true, Ordering::Release);
    }

    /** Drop the socket; any sender still holding the Arc keeps a doomed
     * fd that closes when it lets go. */
    pub fn close(&self) {
        self.connected.store(false, Ordering::Release);
        self.ready.store(false, Ordering::Release);
        *self.slot.lock().unwrap() = None;
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn init_done(&self) -> bool {
        self.recv.lock().unwrap().init_done
    }

    /** Record that the channel's init message has been consumed; doing so
     * twice is a protocol violation. */
    pub fn mark_init_done(&self) -> Result<(), String> {
        let mut recv = self.recv.lock().unwrap();
        if recv.init_done {
            return Err(tag!("Channel {} initialized twice", self.kind.name()));
        }
        recv.init_done = true;
        Ok(())
    }

    /** Frame and send one message. May be called from any thread; the
     * send mutex serializes whole messages onto the stream. */
    pub fn send_packet(&self, ty: u16, payload: &[u8]) -> Result<(), String> {
        self.send_raw(&framed(ty, payload))
    }

    /** Send an already-framed buffer (possibly several messages). */
    pub fn send_raw(&self, buf: &[u8]) -> Result<(), String> {
        let _guard = self.send.lock().unwrap();
        self.send_raw_nl(buf)
    }

    /** Hold off other senders on this channel; used when several queued
     * packets must leave back to back. */
    pub fn lock_send(&self) -> std::sync::MutexGuard<'_, ()> {
        self.send.lock().unwrap()
    }

    /** Non-locking send; the caller holds the guard from `lock_send`. */
    pub fn send_raw_nl(&self, buf: &[u8]) -> Result<(), String> {
        if !self.is_connected() {
            return Err(tag!("Channel {} is not connected", self.kind.name()));
        }
        let fd = self
            .sock()
            .ok_or_else(|| tag!("Channel {} has no socket", self.kind.name()))?;
        sock::send_all(&fd, buf)
    }

    /** Read the next mini header and absorb the messages every channel
     * handles the same way. Until the channel's init message has been
     * seen, everything is passed through so the channel handler can
     * enforce its expected first message. */
    pub fn read_common(&self, fd: &OwnedFd, avail: &mut i32) -> Result<Inbound, String> {
        let mut raw = [0u8; MINI_HEADER_SIZE];
        if sock::read_exact(fd, &mut raw, Some(avail))? {
            return Ok(Inbound::Closed);
        }
        if !self.is_connected() {
            return Ok(Inbound::Handled);
        }
        let header = parse_mini_header(&raw);
        if !self.init_done() {
            return Ok(Inbound::Msg(header));
        }

        match header.ty {
            MSG_MIGRATE | MSG_MIGRATE_DATA | MSG_WAIT_FOR_CHANNELS => Ok(Inbound::Handled),
            MSG_SET_ACK => {
                let mut body = [0u8; 8];
                if sock::read_exact(fd, &mut body, Some(avail))? {
                    return Ok(Inbound::Closed);
                }
                let mut tail = &body[..];
                let generation = read_u32(&mut tail).unwrap();
                let window = read_u32(&mut tail).unwrap();
                self.recv.lock().unwrap().ack_frequency = window;
                debug!(
                    "Channel {}: ack window set to {} (generation {})",
                    self.kind.name(),
                    window,
                    generation
                );
                let mut out = Vec::new();
                put_u32(&mut out, generation);
                self.send_packet(MSGC_ACK_SYNC, &out)?;
                Ok(Inbound::Handled)
            }
            MSG_PING => {
                if header.size < 12 {
                    return Err(tag!("Ping message too short: {}", header.size));
                }
                let mut body = [0u8; 12];
                if sock::read_exact(fd, &mut body, Some(avail))? {
                    return Ok(Inbound::Closed);
                }
                /* ping may carry trailing padding the pong does not echo */
                if sock::discard(fd, header.size as usize - 12, Some(avail))? {
                    return Ok(Inbound::Closed);
                }
                self.send_packet(MSGC_PONG, &body)?;
                Ok(Inbound::Handled)
            }
            MSG_DISCONNECTING => {
                debug!("Channel {}: server is disconnecting", self.kind.name());
                if let Some(fd) = self.sock() {
                    sock::shutdown_write(&fd);
                }
                Ok(Inbound::Handled)
            }
            MSG_NOTIFY => {
                let mut body = vec![0u8; header.size as usize];
                if sock::read_exact(fd, &mut body, Some(avail))? {
                    return Ok(Inbound::Closed);
                }
                self.log_notify(&body);
                Ok(Inbound::Handled)
            }
            _ => Ok(Inbound::Msg(header)),
        }
    }

    /** Forward a server notification to the logger. */
    fn log_notify(&self, body: &[u8]) {
        let mut tail = body;
        let parsed: Result<_, &'static str> = (|| {
            let _time = read_u64(&mut tail)?;
            let severity = read_u32(&mut tail)?;
            let _visibility = read_u32(&mut tail)?;
            let what = read_u32(&mut tail)?;
            let len = read_u32(&mut tail)? as usize;
            let take = len.min(tail.len());
            let msg = read_skip(&mut tail, take)?;
            Ok((severity, what, String::from_utf8_lossy(msg).into_owned()))
        })();
        match parsed {
            Ok((severity, what, text)) => match severity {
                0 => info!("Server notice ({}): {}", what, text),
                1 => warn!("Server notice ({}): {}", what, text),
                _ => error!("Server notice ({}): {}", what, text),
            },
            Err(_) => warn!(
                "Channel {}: discarded malformed notify message",
                self.kind.name()
            ),
        }
    }

    /** ACK window accounting, run after each message drained from a
     * connected channel. The counter is compared against the window
     * before the post-increment; since the set-ack message itself passes
     * through here, the net effect is one ack per `window` subsequent
     * messages. */
    pub fn process_ack(&self) -> Result<(), String> {
        let mut recv = self.recv.lock().unwrap();
        if recv.ack_frequency == 0 {
            return Ok(());
        }
        let fire = recv.ack_count == recv.ack_frequency;
        recv.ack_count += 1;
        if !fire {
            return Ok(());
        }
        recv.ack_count = 0;
        drop(recv);
        self.send_packet(MSGC_ACK, &[])
    }
}
