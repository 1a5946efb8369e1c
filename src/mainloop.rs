/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! The cooperative event loop: readiness polling across channels, the
 * per-event drain, and the main channel's inbound handler. */

use crate::channel::{ChannelKind, Inbound, Status};
use crate::proto::*;
use crate::sock;
use crate::tag;
use crate::Session;
use log::debug;
use nix::errno::Errno;
use nix::sys::epoll::{EpollEvent, EpollTimeout};
use std::os::fd::OwnedFd;
use std::sync::atomic::Ordering;

/** Events polled per `process` call. */
const EVENT_BATCH: usize = 4;

pub(crate) fn poll_token(kind: ChannelKind) -> u64 {
    match kind {
        ChannelKind::Main => 0,
        ChannelKind::Inputs => 1,
        ChannelKind::Playback => 2,
    }
}

fn token_kind(token: u64) -> Option<ChannelKind> {
    match token {
        0 => Some(ChannelKind::Main),
        1 => Some(ChannelKind::Inputs),
        2 => Some(ChannelKind::Playback),
        _ => None,
    }
}

impl Session {
    /** Run one event-loop tick: wait up to `timeout_ms` (negative waits
     * forever) for readiness, then drain every ready channel. Returns
     * `Ok(false)` once the session has shut down cleanly; protocol
     * violations and I/O failures are terminal errors. */
    pub fn process(&self, timeout_ms: i32) -> Result<bool, String> {
        let timeout = EpollTimeout::try_from(timeout_ms.max(-1))
            .map_err(|_| tag!("Invalid timeout {}", timeout_ms))?;
        let mut events = [EpollEvent::empty(); EVENT_BATCH];
        let nev = match self.poll.wait(&mut events, timeout) {
            Ok(n) => n,
            Err(Errno::EINTR) => 0,
            Err(x) => return Err(tag!("Readiness wait failed: {}", x)),
        };

        for ev in &events[..nev] {
            let Some(kind) = token_kind(ev.data()) else {
                continue;
            };
            self.drain_channel(kind)?;
        }

        if self.main.is_connected() {
            return Ok(true);
        }
        self.teardown();
        Ok(false)
    }

    /** Read every message the kernel has buffered for one channel. The
     * bytes-available count bounds the work; it is refreshed whenever a
     * handler consumed an unknown amount (it then reads negative). */
    fn drain_channel(&self, kind: ChannelKind) -> Result<(), String> {
        let ch = self.channel(kind);
        let Some(fd) = ch.sock() else {
            return Ok(());
        };
        let mut avail = sock::bytes_available(&fd)?;
        if avail == 0 {
            /* readable with nothing buffered: the peer closed */
            debug!("Channel {}: peer closed", kind.name());
            let _ = self.poll.delete(&*fd);
            ch.close();
            return Ok(());
        }
        while avail > 0 {
            match self.dispatch(kind, &fd, &mut avail)? {
                Status::Ok | Status::Handled => {
                    if avail < 0 {
                        avail = sock::bytes_available(&fd)?;
                    }
                }
                Status::Closed => {
                    debug!("Channel {}: closed mid-stream", kind.name());
                    let _ = self.poll.delete(&*fd);
                    ch.close();
                    return Ok(());
                }
            }
            if ch.is_connected() {
                ch.process_ack()?;
            }
        }
        Ok(())
    }

    fn dispatch(&self, kind: ChannelKind, fd: &OwnedFd, avail: &mut i32) -> Result<Status, String> {
        let ch = self.channel(kind);
        match ch.read_common(fd, avail)? {
            Inbound::Handled => Ok(Status::Handled),
            Inbound::Closed => Ok(Status::Closed),
            Inbound::Msg(header) => match kind {
                ChannelKind::Main => self.on_main_msg(fd, header, avail),
                ChannelKind::Inputs => self.on_inputs_msg(fd, header, avail),
                ChannelKind::Playback => self.on_playback_msg(fd, header, avail),
            },
        }
    }

    /** Channel-specific inbound dispatch for the main channel. Errors in
     * session setup, channel-list handling or the agent tunnel take the
     * whole session down. */
    fn on_main_msg(
        &self,
        fd: &OwnedFd,
        header: MiniHeader,
        avail: &mut i32,
    ) -> Result<Status, String> {
        if !self.main.init_done() {
            if header.ty != MSG_MAIN_INIT {
                self.disconnect();
                return Err(tag!(
                    "Main channel: expected init, got message type {}",
                    header.ty
                ));
            }
            self.main.mark_init_done()?;
            let mut body = [0u8; MAIN_INIT_SIZE];
            if sock::read_exact(fd, &mut body, Some(avail))? {
                self.disconnect();
                return Ok(Status::Closed);
            }
            let init = parse_main_init(&body);
            debug!(
                "Session {} established; agent connected: {}",
                init.session_id,
                init.agent_connected != 0
            );
            self.session_id.store(init.session_id, Ordering::Release);
            self.agent.tokens.store(init.agent_tokens, Ordering::Release);
            if init.agent_connected != 0 {
                self.agent_connect().map_err(|e| {
                    self.disconnect();
                    e
                })?;
            }
            if init.current_mouse_mode != MOUSE_MODE_CLIENT as u32 {
                self.mouse_mode(false)?;
            }
            self.main
                .send_packet(MSGC_MAIN_ATTACH_CHANNELS, &[])
                .map_err(|e| {
                    self.disconnect();
                    e
                })?;
            return Ok(Status::Ok);
        }

        match header.ty {
            MSG_MAIN_INIT => {
                self.disconnect();
                Err(tag!("Main channel initialized twice"))
            }
            MSG_MAIN_CHANNELS_LIST => {
                let mut body = vec![0u8; header.size as usize];
                if sock::read_exact(fd, &mut body, Some(avail))? {
                    self.disconnect();
                    return Ok(Status::Closed);
                }
                self.on_channels_list(&body).map_err(|e| {
                    self.disconnect();
                    e
                })?;
                Ok(Status::Ok)
            }
            MSG_MAIN_AGENT_CONNECTED => {
                self.agent_connect().map_err(|e| {
                    self.disconnect();
                    e
                })?;
                Ok(Status::Ok)
            }
            MSG_MAIN_AGENT_CONNECTED_TOKENS => {
                let mut raw = [0u8; 4];
                if sock::read_exact(fd, &mut raw, Some(avail))? {
                    self.disconnect();
                    return Ok(Status::Closed);
                }
                self.agent
                    .tokens
                    .store(u32::from_le_bytes(raw), Ordering::Release);
                self.agent_connect().map_err(|e| {
                    self.disconnect();
                    e
                })?;
                Ok(Status::Ok)
            }
            MSG_MAIN_AGENT_DISCONNECTED => {
                let mut raw = [0u8; 4];
                if sock::read_exact(fd, &mut raw, Some(avail))? {
                    self.disconnect();
                    return Ok(Status::Closed);
                }
                debug!("Agent disconnected: error {}", u32::from_le_bytes(raw));
                self.agent_disconnected();
                Ok(Status::Ok)
            }
            MSG_MAIN_AGENT_DATA => {
                if !self.agent.has_agent.load(Ordering::Acquire) {
                    if sock::discard(fd, header.size as usize, Some(avail))? {
                        return Ok(Status::Closed);
                    }
                    return Ok(Status::Ok);
                }
                self.on_agent_data(fd, header.size, avail).map_err(|e| {
                    self.disconnect();
                    e
                })
            }
            MSG_MAIN_AGENT_TOKEN => {
                let mut raw = [0u8; 4];
                if sock::read_exact(fd, &mut raw, Some(avail))? {
                    self.disconnect();
                    return Ok(Status::Closed);
                }
                self.agent
                    .tokens
                    .fetch_add(u32::from_le_bytes(raw), Ordering::AcqRel);
                self.agent_drain().map_err(|e| {
                    self.disconnect();
                    e
                })?;
                Ok(Status::Ok)
            }
            _ => {
                if sock::discard(fd, header.size as usize, Some(avail))? {
                    return Ok(Status::Closed);
                }
                Ok(Status::Ok)
            }
        }
    }

    /** Connect the sub-channels the server names. Re-announcing a
     * channel that is already connected is a protocol violation. */
    fn on_channels_list(&self, body: &[u8]) -> Result<(), String> {
        let mut tail = body;
        let count = read_u32(&mut tail).map_err(|x| tag!("Bad channels list: {}", x))?;
        for _ in 0..count {
            let ty = read_u8(&mut tail).map_err(|x| tag!("Bad channels list: {}", x))?;
            let _id = read_u8(&mut tail).map_err(|x| tag!("Bad channels list: {}", x))?;
            match ty {
                CHANNEL_INPUTS => {
                    if self.inputs.is_connected() {
                        return Err(tag!("Server announced the inputs channel twice"));
                    }
                    self.connect_channel(ChannelKind::Inputs)?;
                }
                CHANNEL_PLAYBACK if self.playback_requested => {
                    if self.playback.is_connected() {
                        return Err(tag!("Server announced the playback channel twice"));
                    }
                    self.connect_channel(ChannelKind::Playback)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /** Final cleanup once the main channel is gone: forget the session
     * id, any half-assembled clipboard data, and the motion scratch
     * buffer, and drop remaining sockets. */
    fn teardown(&self) {
        debug!("Session shut down");
        self.session_id.store(0, Ordering::Release);
        self.agent.reset();
        *self.motion_buf.lock().unwrap() = Vec::new();
        for kind in [
            ChannelKind::Inputs,
            ChannelKind::Playback,
            ChannelKind::Main,
        ] {
            let ch = self.channel(kind);
            if let Some(fd) = ch.sock() {
                let _ = self.poll.delete(&*fd);
            }
            ch.close();
        }
    }
}
