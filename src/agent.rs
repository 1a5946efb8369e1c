/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Agent tunnel: clipboard sharing and capability exchange with the
 * guest agent, carried inside main-channel agent-data messages.
 *
 * Outbound traffic is flow controlled by a token bucket: the server
 * grants tokens and every agent-data wire packet spends one. Logical
 * agent messages larger than the per-packet bound are fragmented when
 * enqueued; all fragments of one message enter the queue atomically and
 * leave it in order, though the bucket may stall between them. */

use crate::channel::Status;
use crate::proto::*;
use crate::sock;
use crate::tag;
use crate::{ClipboardType, Session};
use log::debug;
use std::collections::VecDeque;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

/** In-flight inbound clipboard payload. */
struct Reassembly {
    data: Vec<u8>,
    remain: usize,
}

/** Clipboard negotiation and grab state. */
struct ClipboardState {
    supported: bool,
    selection: bool,
    agent_grabbed: bool,
    client_grabbed: bool,
    ty: ClipboardType,
    reassembly: Option<Reassembly>,
}

/** Queued outbound agent packets plus the byte count the current
 * logical message still owes. Packets are fully framed main-channel
 * messages, ready for the wire once a token is available. */
struct AgentSend {
    queue: VecDeque<Vec<u8>>,
    msg_remaining: usize,
}

pub(crate) struct AgentState {
    pub has_agent: AtomicBool,
    /** Credits granted by the server; one agent-data packet per credit. */
    pub tokens: AtomicU32,
    send: Mutex<AgentSend>,
    cb: Mutex<ClipboardState>,
}

impl AgentState {
    pub fn new() -> AgentState {
        AgentState {
            has_agent: AtomicBool::new(false),
            tokens: AtomicU32::new(0),
            send: Mutex::new(AgentSend {
                queue: VecDeque::new(),
                msg_remaining: 0,
            }),
            cb: Mutex::new(ClipboardState {
                supported: false,
                selection: false,
                agent_grabbed: false,
                client_grabbed: false,
                ty: ClipboardType::None,
                reassembly: None,
            }),
        }
    }

    /** Forget the agent entirely: queue, grabs, and any half-received
     * clipboard payload. */
    pub fn reset(&self) {
        self.has_agent.store(false, Ordering::Release);
        let mut send = self.send.lock().unwrap();
        send.queue.clear();
        send.msg_remaining = 0;
        drop(send);
        let mut cb = self.cb.lock().unwrap();
        cb.agent_grabbed = false;
        cb.client_grabbed = false;
        cb.reassembly = None;
    }

    #[cfg(test)]
    pub fn queued_packets(&self) -> usize {
        self.send.lock().unwrap().queue.len()
    }
}

fn to_agent_type(ty: ClipboardType) -> u32 {
    match ty {
        ClipboardType::Text => AGENT_CLIPBOARD_UTF8_TEXT,
        ClipboardType::Png => AGENT_CLIPBOARD_IMAGE_PNG,
        ClipboardType::Bmp => AGENT_CLIPBOARD_IMAGE_BMP,
        ClipboardType::Tiff => AGENT_CLIPBOARD_IMAGE_TIFF,
        ClipboardType::Jpeg => AGENT_CLIPBOARD_IMAGE_JPG,
        ClipboardType::None => AGENT_CLIPBOARD_NONE,
    }
}

fn from_agent_type(code: u32) -> ClipboardType {
    match code {
        AGENT_CLIPBOARD_UTF8_TEXT => ClipboardType::Text,
        AGENT_CLIPBOARD_IMAGE_PNG => ClipboardType::Png,
        AGENT_CLIPBOARD_IMAGE_BMP => ClipboardType::Bmp,
        AGENT_CLIPBOARD_IMAGE_TIFF => ClipboardType::Tiff,
        AGENT_CLIPBOARD_IMAGE_JPG => ClipboardType::Jpeg,
        _ => ClipboardType::None,
    }
}

impl Session {
    /** (Re)initialize the agent tunnel: flush the queue, grant the agent
     * a generous token allowance for its own sends, and exchange
     * capabilities. */
    pub(crate) fn agent_connect(&self) -> Result<(), String> {
        {
            let mut send = self.agent.send.lock().unwrap();
            send.queue.clear();
            send.msg_remaining = 0;
        }
        /* all traffic is local; grant the agent the largest possible
         * token count rather than bothering with flow control */
        let mut out = Vec::new();
        put_u32(&mut out, u32::MAX);
        self.main.send_packet(MSGC_MAIN_AGENT_START, &out)?;
        self.agent.has_agent.store(true, Ordering::Release);
        if let Err(e) = self.agent_send_caps(true) {
            self.agent.has_agent.store(false, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn agent_disconnected(&self) {
        self.agent.has_agent.store(false, Ordering::Release);
        let mut cb = self.agent.cb.lock().unwrap();
        cb.reassembly = None;
    }

    fn agent_send_caps(&self, request: bool) -> Result<(), String> {
        if !self.agent.has_agent.load(Ordering::Acquire) {
            return Err(tag!("No agent to announce capabilities to"));
        }
        let mut body = Vec::new();
        put_u32(&mut body, request as u32);
        put_u32(
            &mut body,
            (1 << AGENT_CAP_CLIPBOARD_BY_DEMAND) | (1 << AGENT_CAP_CLIPBOARD_SELECTION),
        );
        self.agent_start_msg(AGENT_MSG_ANNOUNCE_CAPABILITIES, body.len())?;
        self.agent_write_msg(&body)
    }

    /** Take one send credit, unless the main channel is gone or the
     * bucket is empty. */
    fn take_server_token(&self) -> bool {
        loop {
            if !self.main.is_connected() {
                return false;
            }
            let tokens = self.agent.tokens.load(Ordering::Acquire);
            if tokens == 0 {
                return false;
            }
            if self
                .agent
                .tokens
                .compare_exchange_weak(tokens, tokens - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /** Release as many queued packets as the token bucket allows. Runs
     * under the main channel's send mutex so the token take and the
     * write are atomic with respect to other senders. */
    pub(crate) fn agent_drain(&self) -> Result<(), String> {
        let mut send = self.agent.send.lock().unwrap();
        let _guard = self.main.lock_send();
        while !send.queue.is_empty() && self.take_server_token() {
            let pkt = send.queue.pop_front().unwrap();
            self.main.send_raw_nl(&pkt)?;
        }
        Ok(())
    }

    /** Enqueue the header packet of a logical agent message of `size`
     * payload bytes, then drain. */
    fn agent_start_msg(&self, ty: u32, size: usize) -> Result<(), String> {
        let mut payload = Vec::with_capacity(AGENT_HEADER_SIZE);
        put_agent_header(&mut payload, ty, size as u32);
        let pkt = framed(MSGC_MAIN_AGENT_DATA, &payload);
        {
            let mut send = self.agent.send.lock().unwrap();
            send.queue.push_back(pkt);
            send.msg_remaining = size;
        }
        self.agent_drain()
    }

    /** Enqueue payload bytes of the current logical message, fragmented
     * to the per-packet bound, then drain. */
    fn agent_write_msg(&self, buf: &[u8]) -> Result<(), String> {
        {
            let mut send = self.agent.send.lock().unwrap();
            if buf.len() > send.msg_remaining {
                return Err(tag!(
                    "Agent payload of {} bytes exceeds the {} still declared",
                    buf.len(),
                    send.msg_remaining
                ));
            }
            for chunk in buf.chunks(AGENT_MAX_DATA_SIZE) {
                send.queue.push_back(framed(MSGC_MAIN_AGENT_DATA, chunk));
                send.msg_remaining -= chunk.len();
            }
        }
        self.agent_drain()
    }

    /** Demultiplex one inbound agent-data message of `data_size` payload
     * bytes. */
    pub(crate) fn on_agent_data(
        &self,
        fd: &OwnedFd,
        data_size: u32,
        avail: &mut i32,
    ) -> Result<Status, String> {
        /* continuation fragments of a clipboard payload carry no agent
         * header; they are routed straight into the reassembly buffer */
        {
            let mut cb = self.agent.cb.lock().unwrap();
            if let Some(re) = cb.reassembly.as_mut() {
                let take = (re.remain as u32).min(data_size) as usize;
                let start = re.data.len();
                re.data.resize(start + take, 0);
                match sock::read_exact(fd, &mut re.data[start..], Some(avail)) {
                    Err(e) => {
                        cb.reassembly = None;
                        return Err(e);
                    }
                    Ok(true) => {
                        cb.reassembly = None;
                        return Ok(Status::Closed);
                    }
                    Ok(false) => {}
                }
                re.remain -= take;
                if re.remain == 0 {
                    let done = cb.reassembly.take().unwrap();
                    let ty = cb.ty;
                    drop(cb);
                    self.deliver_clipboard(ty, &done.data);
                }
                return Ok(Status::Ok);
            }
        }

        if data_size < AGENT_HEADER_SIZE as u32 {
            return Err(tag!("Agent data message of {} bytes", data_size));
        }
        let mut raw = [0u8; AGENT_HEADER_SIZE];
        if sock::read_exact(fd, &mut raw, Some(avail))? {
            return Ok(Status::Closed);
        }
        let hdr = parse_agent_header(&raw);
        let data_size = data_size - AGENT_HEADER_SIZE as u32;
        if hdr.protocol != AGENT_PROTOCOL {
            return Err(tag!("Unsupported agent protocol {}", hdr.protocol));
        }

        match hdr.ty {
            AGENT_MSG_ANNOUNCE_CAPABILITIES => {
                if hdr.size > AGENT_LIST_SIZE_MAX {
                    return Err(tag!("Capability announcement of {} bytes", hdr.size));
                }
                let mut body = vec![0u8; hdr.size as usize];
                if sock::read_exact(fd, &mut body, Some(avail))? {
                    return Ok(Status::Closed);
                }
                let mut tail = &body[..];
                let request =
                    read_u32(&mut tail).map_err(|x| tag!("Bad capability message: {}", x))?;
                let mut caps = Vec::new();
                while let Ok(w) = read_u32(&mut tail) {
                    caps.push(w);
                }
                let has = |cap: u32| {
                    caps.get((cap / 32) as usize)
                        .is_some_and(|w| w & (1 << (cap % 32)) != 0)
                };
                let by_demand = has(AGENT_CAP_CLIPBOARD_BY_DEMAND);
                let selection = has(AGENT_CAP_CLIPBOARD_SELECTION);
                {
                    let mut cb = self.agent.cb.lock().unwrap();
                    cb.supported = by_demand || selection;
                    cb.selection = selection;
                }
                debug!(
                    "Agent capabilities: clipboard {}, per-selection {}",
                    by_demand, selection
                );
                if request != 0 {
                    self.agent_send_caps(false)?;
                }
                Ok(Status::Ok)
            }
            AGENT_MSG_CLIPBOARD
            | AGENT_MSG_CLIPBOARD_GRAB
            | AGENT_MSG_CLIPBOARD_REQUEST
            | AGENT_MSG_CLIPBOARD_RELEASE => {
                self.on_agent_clipboard(fd, hdr.ty, hdr.size, data_size, avail)
            }
            _ => {
                if sock::discard(fd, hdr.size as usize, Some(avail))? {
                    return Ok(Status::Closed);
                }
                Ok(Status::Ok)
            }
        }
    }

    fn on_agent_clipboard(
        &self,
        fd: &OwnedFd,
        ty: u32,
        msg_size: u32,
        mut data_size: u32,
        avail: &mut i32,
    ) -> Result<Status, String> {
        let mut remaining = msg_size;
        let selection = self.agent.cb.lock().unwrap().selection;
        if selection {
            /* opaque {selection, reserved[3]} preamble */
            if remaining < AGENT_SELECTION_PREAMBLE as u32 {
                return Err(tag!("Clipboard message too short for selection"));
            }
            let mut pre = [0u8; AGENT_SELECTION_PREAMBLE];
            if sock::read_exact(fd, &mut pre, Some(avail))? {
                return Ok(Status::Closed);
            }
            remaining -= AGENT_SELECTION_PREAMBLE as u32;
            data_size = data_size.saturating_sub(AGENT_SELECTION_PREAMBLE as u32);
        }

        match ty {
            AGENT_MSG_CLIPBOARD_RELEASE => {
                self.agent.cb.lock().unwrap().agent_grabbed = false;
                let cb = self.clipboard_hooks.lock().unwrap().release.clone();
                if let Some(f) = cb {
                    f();
                }
                Ok(Status::Ok)
            }
            AGENT_MSG_CLIPBOARD | AGENT_MSG_CLIPBOARD_REQUEST => {
                if remaining < 4 {
                    return Err(tag!("Clipboard message too short for a type"));
                }
                let mut raw = [0u8; 4];
                if sock::read_exact(fd, &mut raw, Some(avail))? {
                    return Ok(Status::Closed);
                }
                let code = u32::from_le_bytes(raw);
                remaining -= 4;
                data_size = data_size.saturating_sub(4);

                if ty == AGENT_MSG_CLIPBOARD_REQUEST {
                    let cb = self.clipboard_hooks.lock().unwrap().request.clone();
                    if let Some(f) = cb {
                        f(from_agent_type(code));
                    }
                    return Ok(Status::Ok);
                }

                let total = remaining as usize;
                let first = remaining.min(data_size) as usize;
                let mut cb = self.agent.cb.lock().unwrap();
                if cb.reassembly.is_some() {
                    return Err(tag!("Clipboard data while a transfer is in progress"));
                }
                let mut data = Vec::with_capacity(total);
                data.resize(first, 0);
                match sock::read_exact(fd, &mut data, Some(avail)) {
                    Err(e) => return Err(e),
                    Ok(true) => return Ok(Status::Closed),
                    Ok(false) => {}
                }
                if first == total {
                    let ty = cb.ty;
                    drop(cb);
                    self.deliver_clipboard(ty, &data);
                } else {
                    cb.reassembly = Some(Reassembly {
                        data,
                        remain: total - first,
                    });
                }
                Ok(Status::Ok)
            }
            AGENT_MSG_CLIPBOARD_GRAB => {
                if remaining == 0 {
                    return Ok(Status::Ok);
                }
                if remaining > AGENT_LIST_SIZE_MAX {
                    return Err(tag!("Clipboard grab list of {} bytes", remaining));
                }
                let mut body = vec![0u8; remaining as usize];
                if sock::read_exact(fd, &mut body, Some(avail))? {
                    return Ok(Status::Closed);
                }
                /* the type list is undocumented; the first entry is
                 * treated as the offered type */
                let first = u32::from_le_bytes(body[..4].try_into().unwrap());
                let offered = from_agent_type(first);
                let mut cb = self.agent.cb.lock().unwrap();
                cb.ty = offered;
                cb.agent_grabbed = true;
                cb.client_grabbed = false;
                drop(cb);
                if selection {
                    /* selection-qualified grabs only update state; the
                     * notice callback is reserved for the default
                     * clipboard */
                    return Ok(Status::Ok);
                }
                let cb = self.clipboard_hooks.lock().unwrap().notice.clone();
                if let Some(f) = cb {
                    f(offered);
                }
                Ok(Status::Ok)
            }
            _ => unreachable!(),
        }
    }

    fn deliver_clipboard(&self, ty: ClipboardType, data: &[u8]) {
        let cb = self.clipboard_hooks.lock().unwrap().data.clone();
        if let Some(f) = cb {
            f(ty, data);
        }
    }

    /** Whether the agent negotiated clipboard-by-demand support. */
    pub fn clipboard_supported(&self) -> bool {
        self.agent.cb.lock().unwrap().supported
    }

    /** Claim the guest clipboard, offering `types`. */
    pub fn clipboard_grab(&self, types: &[ClipboardType]) -> Result<(), String> {
        if !self.agent.has_agent.load(Ordering::Acquire) {
            return Err(tag!("No agent connected"));
        }
        if types.is_empty() {
            return Err(tag!("Clipboard grab with no types"));
        }
        let selection = self.agent.cb.lock().unwrap().selection;
        let mut payload = Vec::new();
        if selection {
            put_u8(&mut payload, AGENT_CLIPBOARD_SELECTION_CLIPBOARD);
            payload.extend_from_slice(&[0, 0, 0]);
        }
        for t in types {
            put_u32(&mut payload, to_agent_type(*t));
        }
        self.agent_start_msg(AGENT_MSG_CLIPBOARD_GRAB, payload.len())?;
        self.agent_write_msg(&payload)?;
        self.agent.cb.lock().unwrap().client_grabbed = true;
        Ok(())
    }

    /** Give up a previously announced clipboard grab. A release with no
     * outstanding grab is a no-op. */
    pub fn clipboard_release(&self) -> Result<(), String> {
        if !self.agent.has_agent.load(Ordering::Acquire) {
            return Err(tag!("No agent connected"));
        }
        let selection = {
            let cb = self.agent.cb.lock().unwrap();
            if !cb.client_grabbed {
                return Ok(());
            }
            cb.selection
        };
        if selection {
            let payload = [AGENT_CLIPBOARD_SELECTION_CLIPBOARD, 0, 0, 0];
            self.agent_start_msg(AGENT_MSG_CLIPBOARD_RELEASE, payload.len())?;
            self.agent_write_msg(&payload)?;
        } else {
            self.agent_start_msg(AGENT_MSG_CLIPBOARD_RELEASE, 0)?;
        }
        self.agent.cb.lock().unwrap().client_grabbed = false;
        Ok(())
    }

    /** Ask the agent for the clipboard contents it currently offers. */
    pub fn clipboard_request(&self, ty: ClipboardType) -> Result<(), String> {
        if !self.agent.has_agent.load(Ordering::Acquire) {
            return Err(tag!("No agent connected"));
        }
        {
            let cb = self.agent.cb.lock().unwrap();
            if !cb.agent_grabbed {
                return Err(tag!("Agent holds no clipboard grab"));
            }
            if ty != cb.ty {
                return Err(tag!("Requested type differs from the offered type"));
            }
        }
        let mut payload = Vec::new();
        put_u32(&mut payload, to_agent_type(ty));
        self.agent_start_msg(AGENT_MSG_CLIPBOARD_REQUEST, payload.len())?;
        self.agent_write_msg(&payload)
    }

    /** Begin sending clipboard data of `len` payload bytes; the bytes
     * themselves follow through [`Session::clipboard_data`]. */
    pub fn clipboard_data_start(&self, ty: ClipboardType, len: usize) -> Result<(), String> {
        if !self.agent.has_agent.load(Ordering::Acquire) {
            return Err(tag!("No agent connected"));
        }
        let selection = self.agent.cb.lock().unwrap().selection;
        let mut preamble = Vec::new();
        if selection {
            put_u8(&mut preamble, AGENT_CLIPBOARD_SELECTION_CLIPBOARD);
            preamble.extend_from_slice(&[0, 0, 0]);
        }
        put_u32(&mut preamble, to_agent_type(ty));
        self.agent_start_msg(AGENT_MSG_CLIPBOARD, preamble.len() + len)?;
        self.agent_write_msg(&preamble)
    }

    /** Stream a chunk of the clipboard payload announced by
     * [`Session::clipboard_data_start`]. */
    pub fn clipboard_data(&self, _ty: ClipboardType, chunk: &[u8]) -> Result<(), String> {
        if !self.agent.has_agent.load(Ordering::Acquire) {
            return Err(tag!("No agent connected"));
        }
        self.agent_write_msg(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_mapping_round_trips() {
        let named = [
            ClipboardType::Text,
            ClipboardType::Png,
            ClipboardType::Bmp,
            ClipboardType::Tiff,
            ClipboardType::Jpeg,
        ];
        let mut codes: Vec<u32> = named.iter().map(|t| to_agent_type(*t)).collect();
        for (t, c) in named.iter().zip(&codes) {
            assert_eq!(from_agent_type(*c), *t);
        }
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), named.len());
        assert_eq!(from_agent_type(0xdead), ClipboardType::None);
        assert_eq!(to_agent_type(ClipboardType::None), AGENT_CLIPBOARD_NONE);
    }

    #[test]
    fn fragmentation_covers_payload_exactly() {
        for len in [0usize, 1, 2048, 2049, 5000, 100 * 1024] {
            let data = vec![7u8; len];
            let chunks: Vec<&[u8]> = data.chunks(AGENT_MAX_DATA_SIZE).collect();
            let expect = if len == 0 { 0 } else { len.div_ceil(AGENT_MAX_DATA_SIZE) };
            assert_eq!(chunks.len(), expect);
            assert_eq!(chunks.iter().map(|c| c.len()).sum::<usize>(), len);
            assert!(chunks.iter().all(|c| c.len() <= AGENT_MAX_DATA_SIZE));
        }
    }
}
