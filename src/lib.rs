/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Client-side implementation of the SPICE remote-desktop protocol core.
 *
 * A [`Session`] opens one stream socket per protocol channel (main,
 * inputs, and optionally playback), performs link negotiation and ticket
 * authentication on each, and then multiplexes framed messages through a
 * cooperative event loop driven by [`Session::process`]. Keyboard,
 * mouse and clipboard operations may be issued from other threads while
 * the loop runs; audio and clipboard data arriving from the server are
 * delivered through registered callbacks.
 *
 * Display and cursor channels, USB redirection, migration and smartcard
 * support are out of scope. */

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use nix::sys::epoll::{Epoll, EpollCreateFlags};

mod agent;
mod channel;
mod inputs;
mod link;
mod mainloop;
mod playback;
mod proto;
mod sock;
mod util;

#[cfg(test)]
mod test;

use agent::AgentState;
use channel::{Channel, ChannelKind};
use inputs::MouseState;
use sock::Dest;

/** Kinds of data the clipboard can carry. `None` stands in for any type
 * the protocol's agent cannot express. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipboardType {
    None,
    Text,
    Png,
    Bmp,
    Tiff,
    Jpeg,
}

/** Sample formats the playback channel can announce. Only 16-bit signed
 * audio is mapped; everything else is reported as `Invalid`. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Invalid,
    S16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Middle,
    Right,
    WheelUp,
    WheelDown,
    Side,
    Extra,
}

pub type ClipboardNoticeFn = Arc<dyn Fn(ClipboardType) + Send + Sync>;
pub type ClipboardDataFn = Arc<dyn Fn(ClipboardType, &[u8]) + Send + Sync>;
pub type ClipboardReleaseFn = Arc<dyn Fn() + Send + Sync>;
pub type ClipboardRequestFn = Arc<dyn Fn(ClipboardType) + Send + Sync>;

pub type AudioStartFn = Arc<dyn Fn(u32, u32, AudioFormat, u32) + Send + Sync>;
pub type AudioVolumeFn = Arc<dyn Fn(&[u16]) + Send + Sync>;
pub type AudioMuteFn = Arc<dyn Fn(bool) + Send + Sync>;
pub type AudioStopFn = Arc<dyn Fn() + Send + Sync>;
pub type AudioDataFn = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[derive(Default)]
pub(crate) struct ClipboardHooks {
    pub notice: Option<ClipboardNoticeFn>,
    pub data: Option<ClipboardDataFn>,
    pub release: Option<ClipboardReleaseFn>,
    pub request: Option<ClipboardRequestFn>,
}

#[derive(Default)]
pub(crate) struct AudioHooks {
    pub start: Option<AudioStartFn>,
    pub volume: Option<AudioVolumeFn>,
    pub mute: Option<AudioMuteFn>,
    pub stop: Option<AudioStopFn>,
    pub data: Option<AudioDataFn>,
}

/** One SPICE session: the destination, the per-channel connections, the
 * agent tunnel, and the registered callbacks.
 *
 * `Session` is `Send + Sync`: input and clipboard methods may be called
 * concurrently with the thread driving [`Session::process`]. */
pub struct Session {
    pub(crate) dest: Dest,
    pub(crate) password: String,
    pub(crate) playback_requested: bool,
    pub(crate) poll: Epoll,
    /** Assigned by the server in main-init; zero before and after. */
    pub(crate) session_id: AtomicU32,
    pub(crate) main: Channel,
    pub(crate) inputs: Channel,
    pub(crate) playback: Channel,
    pub(crate) kb_modifiers: AtomicU32,
    pub(crate) mouse: MouseState,
    /** Scratch buffer holding coalesced mouse-motion frames so a large
     * relative movement goes out in a single write. */
    pub(crate) motion_buf: Mutex<Vec<u8>>,
    pub(crate) agent: AgentState,
    pub(crate) clipboard_hooks: Mutex<ClipboardHooks>,
    pub(crate) audio_hooks: Mutex<AudioHooks>,
}

impl Session {
    /** Connect to a SPICE server and complete the main channel's link
     * handshake. A port of zero makes `host` a Unix socket path. The
     * inputs (and, if requested, playback) channels are connected later,
     * once the server's channel list arrives during [`Session::process`].
     *
     * Passwords longer than the protocol's 31-byte ticket limit are
     * truncated. */
    pub fn connect(
        host: &str,
        port: u16,
        password: &str,
        playback: bool,
    ) -> Result<Session, String> {
        let dest = sock::resolve_dest(host, port)?;
        let poll = Epoll::new(EpollCreateFlags::empty())
            .map_err(|x| tag!("Failed to create epoll instance: {}", x))?;
        let session = Session {
            dest,
            password: password.to_owned(),
            playback_requested: playback,
            poll,
            session_id: AtomicU32::new(0),
            main: Channel::new(ChannelKind::Main),
            inputs: Channel::new(ChannelKind::Inputs),
            playback: Channel::new(ChannelKind::Playback),
            kb_modifiers: AtomicU32::new(0),
            mouse: MouseState::new(),
            motion_buf: Mutex::new(Vec::new()),
            agent: AgentState::new(),
            clipboard_hooks: Mutex::new(ClipboardHooks::default()),
            audio_hooks: Mutex::new(AudioHooks::default()),
        };
        session.connect_channel(ChannelKind::Main)?;
        Ok(session)
    }

    /** Tear down every channel. Ready channels get a courtesy
     * disconnect message before their write side is shut down. */
    pub fn disconnect(&self) {
        self.disconnect_channel(ChannelKind::Inputs);
        self.disconnect_channel(ChannelKind::Playback);
        self.disconnect_channel(ChannelKind::Main);
        *self.motion_buf.lock().unwrap() = Vec::new();
        self.agent.reset();
    }

    /** True once both the main and inputs channels are connected. */
    pub fn ready(&self) -> bool {
        self.main.is_connected() && self.inputs.is_connected()
    }

    /** Keyboard modifier bitmap last reported by the server. */
    pub fn modifiers(&self) -> u32 {
        self.kb_modifiers.load(Ordering::Acquire)
    }

    /** Register clipboard callbacks. `notice` and `data` must be given
     * together or not at all. */
    pub fn set_clipboard_cb(
        &self,
        notice: Option<ClipboardNoticeFn>,
        data: Option<ClipboardDataFn>,
        release: Option<ClipboardReleaseFn>,
        request: Option<ClipboardRequestFn>,
    ) -> Result<(), String> {
        if notice.is_some() != data.is_some() {
            return Err(tag!(
                "Clipboard notice and data callbacks must be registered together"
            ));
        }
        *self.clipboard_hooks.lock().unwrap() = ClipboardHooks {
            notice,
            data,
            release,
            request,
        };
        Ok(())
    }

    /** Register audio callbacks; start, stop and data are mandatory. */
    pub fn set_audio_cb(
        &self,
        start: AudioStartFn,
        volume: Option<AudioVolumeFn>,
        mute: Option<AudioMuteFn>,
        stop: AudioStopFn,
        data: AudioDataFn,
    ) {
        *self.audio_hooks.lock().unwrap() = AudioHooks {
            start: Some(start),
            volume,
            mute,
            stop: Some(stop),
            data: Some(data),
        };
    }

    pub(crate) fn channel(&self, kind: ChannelKind) -> &Channel {
        match kind {
            ChannelKind::Main => &self.main,
            ChannelKind::Inputs => &self.inputs,
            ChannelKind::Playback => &self.playback,
        }
    }

    /** Open a socket to the destination, run the link handshake, and arm
     * the readiness poll for the channel. */
    pub(crate) fn connect_channel(&self, kind: ChannelKind) -> Result<(), String> {
        let ch = self.channel(kind);
        let fd = sock::stream_connect(&self.dest)?;
        ch.install(fd);
        let fd = ch.sock().unwrap();
        if let Err(e) = link::handshake(
            &fd,
            kind,
            self.session_id.load(Ordering::Acquire),
            &self.password,
        ) {
            ch.close();
            return Err(e);
        }
        self.poll
            .add(
                &*fd,
                nix::sys::epoll::EpollEvent::new(
                    nix::sys::epoll::EpollFlags::EPOLLIN,
                    mainloop::poll_token(kind),
                ),
            )
            .map_err(|x| tag!("Failed to register channel {}: {}", kind.name(), x))?;
        ch.set_ready();
        if kind == ChannelKind::Playback {
            /* playback has no init message; common handling (ping,
             * set-ack) starts right after the link */
            ch.mark_init_done()?;
        }
        log::debug!("Channel {} connected and ready", kind.name());
        Ok(())
    }

    pub(crate) fn disconnect_channel(&self, kind: ChannelKind) {
        let ch = self.channel(kind);
        if !ch.is_connected() {
            return;
        }
        if let Some(fd) = ch.sock() {
            if ch.is_ready() {
                let is_tcp = matches!(self.dest, Dest::Tcp(_));
                /* drop NODELAY so the disconnect message is flushed with
                 * the re-enable below */
                if is_tcp {
                    let _ = sock::set_nodelay(&fd, false);
                }
                let mut out = Vec::new();
                proto::put_u64(&mut out, util::timestamp_millis());
                proto::put_u32(&mut out, proto::LINK_ERR_OK);
                let _ = ch.send_packet(proto::MSGC_DISCONNECTING, &out);
                if is_tcp {
                    let _ = sock::set_nodelay(&fd, true);
                }
            }
            let _ = self.poll.delete(&*fd);
            sock::shutdown_write(&fd);
        }
        ch.close();
    }
}
