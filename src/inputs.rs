/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Inputs channel: keyboard scancodes, mouse state, and the coalesced
 * relative-motion send path. */

use crate::channel::Status;
use crate::proto::*;
use crate::sock;
use crate::tag;
use crate::{MouseButton, Session};
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;

/** Mouse bookkeeping: the held-button mask, and the number of pointer
 * (motion and position) messages the server has not acknowledged yet.
 * The mutex also spans outbound packet construction and transmission,
 * so the state read and the send form one critical section. */
pub(crate) struct MouseState {
    pub buttons: Mutex<u16>,
    pub sent_count: AtomicI32,
}

impl MouseState {
    pub fn new() -> MouseState {
        MouseState {
            buttons: Mutex::new(0),
            sent_count: AtomicI32::new(0),
        }
    }
}

/** Translate a scancode for a key-down message. Codes at `0x100` and
 * above are escaped: `0xE0` in the low byte, the offset in the high. */
fn key_down_code(code: u32) -> u32 {
    if code >= 0x100 {
        0xe0 | ((code - 0x100) << 8)
    } else {
        code
    }
}

/** Key-up translation; the break bit `0x80` is OR'd into the leading
 * byte of the encoded form. */
fn key_up_code(code: u32) -> u32 {
    if code < 0x100 {
        code | 0x80
    } else {
        0x80e0 | ((code - 0x100) << 8)
    }
}

fn button_code(button: MouseButton) -> u8 {
    match button {
        MouseButton::Left => MOUSE_BUTTON_LEFT,
        MouseButton::Middle => MOUSE_BUTTON_MIDDLE,
        MouseButton::Right => MOUSE_BUTTON_RIGHT,
        MouseButton::WheelUp => MOUSE_BUTTON_WHEEL_UP,
        MouseButton::WheelDown => MOUSE_BUTTON_WHEEL_DOWN,
        MouseButton::Side => MOUSE_BUTTON_SIDE,
        MouseButton::Extra => MOUSE_BUTTON_EXTRA,
    }
}

/** Mask bit a button contributes to the held-button state. Wheel events
 * are transient and carry no bit. */
fn button_mask(button: MouseButton) -> u16 {
    match button {
        MouseButton::Left => MOUSE_BUTTON_MASK_LEFT,
        MouseButton::Middle => MOUSE_BUTTON_MASK_MIDDLE,
        MouseButton::Right => MOUSE_BUTTON_MASK_RIGHT,
        MouseButton::Side => MOUSE_BUTTON_MASK_SIDE,
        MouseButton::Extra => MOUSE_BUTTON_MASK_EXTRA,
        MouseButton::WheelUp | MouseButton::WheelDown => 0,
    }
}

fn apply_button(mask: u16, button: MouseButton, pressed: bool) -> u16 {
    if pressed {
        mask | button_mask(button)
    } else {
        mask & !button_mask(button)
    }
}

/** Split a relative movement into per-message deltas. The virtio mouse
 * device saturates at +-127 per axis and message, so larger movements
 * are cut into `ceil(max(|dx|,|dy|) / 127)` steps, each axis clamped and
 * the remainder carried forward. A zero movement still produces one
 * step. */
fn split_motion(dx: i32, dy: i32) -> Vec<(i32, i32)> {
    let delta = dx.unsigned_abs().max(dy.unsigned_abs());
    let count = ((delta + 126) / 127).max(1);
    let mut out = Vec::with_capacity(count as usize);
    let (mut rx, mut ry) = (dx, dy);
    for _ in 0..count {
        let sx = rx.clamp(-127, 127);
        let sy = ry.clamp(-127, 127);
        out.push((sx, sy));
        rx -= sx;
        ry -= sy;
    }
    out
}

impl Session {
    pub fn key_down(&self, code: u32) -> Result<(), String> {
        if !self.inputs.is_connected() {
            return Err(tag!("Inputs channel is not connected"));
        }
        let mut out = Vec::new();
        put_u32(&mut out, key_down_code(code));
        self.inputs.send_packet(MSGC_INPUTS_KEY_DOWN, &out)
    }

    pub fn key_up(&self, code: u32) -> Result<(), String> {
        if !self.inputs.is_connected() {
            return Err(tag!("Inputs channel is not connected"));
        }
        let mut out = Vec::new();
        put_u32(&mut out, key_up_code(code));
        self.inputs.send_packet(MSGC_INPUTS_KEY_UP, &out)
    }

    pub fn key_modifiers(&self, modifiers: u32) -> Result<(), String> {
        if !self.inputs.is_connected() {
            return Err(tag!("Inputs channel is not connected"));
        }
        let mut out = Vec::new();
        put_u32(&mut out, modifiers);
        self.inputs.send_packet(MSGC_INPUTS_KEY_MODIFIERS, &out)
    }

    /** Ask the server for server- or client-side pointer handling. */
    pub fn mouse_mode(&self, server: bool) -> Result<(), String> {
        if !self.main.is_connected() {
            return Err(tag!("Main channel is not connected"));
        }
        let mut out = Vec::new();
        put_u16(
            &mut out,
            if server {
                MOUSE_MODE_SERVER
            } else {
                MOUSE_MODE_CLIENT
            },
        );
        self.main.send_packet(MSGC_MAIN_MOUSE_MODE_REQUEST, &out)
    }

    /** Absolute pointer position, sent with the current button mask. */
    pub fn mouse_position(&self, x: u32, y: u32) -> Result<(), String> {
        if !self.inputs.is_connected() {
            return Err(tag!("Inputs channel is not connected"));
        }
        let buttons = self.mouse.buttons.lock().unwrap();
        let mut out = Vec::new();
        put_u32(&mut out, x);
        put_u32(&mut out, y);
        put_u16(&mut out, *buttons);
        put_u8(&mut out, 0); /* display id */
        /* position messages are covered by the same motion-ack window */
        self.mouse.sent_count.fetch_add(1, Ordering::AcqRel);
        self.inputs.send_packet(MSGC_INPUTS_MOUSE_POSITION, &out)
    }

    /** Relative pointer movement. Movements beyond the per-message limit
     * are split into several motion messages which are written out in a
     * single coalesced buffer, avoiding one syscall (and potentially one
     * TCP segment) per fragment. The outstanding-motion counter grows by
     * the number of messages emitted. */
    pub fn mouse_motion(&self, dx: i32, dy: i32) -> Result<(), String> {
        if !self.inputs.is_connected() {
            return Err(tag!("Inputs channel is not connected"));
        }
        let steps = split_motion(dx, dy);
        if steps.len() == 1 {
            let buttons = self.mouse.buttons.lock().unwrap();
            let mut out = Vec::new();
            put_i32(&mut out, steps[0].0);
            put_i32(&mut out, steps[0].1);
            put_u16(&mut out, *buttons);
            self.mouse.sent_count.fetch_add(1, Ordering::AcqRel);
            return self.inputs.send_packet(MSGC_INPUTS_MOUSE_MOTION, &out);
        }

        let mut buf = self.motion_buf.lock().unwrap();
        buf.clear();
        buf.reserve(steps.len() * (MINI_HEADER_SIZE + 10));
        let buttons = self.mouse.buttons.lock().unwrap();
        for (sx, sy) in &steps {
            put_mini_header(&mut buf, MSGC_INPUTS_MOUSE_MOTION, 10);
            put_i32(&mut buf, *sx);
            put_i32(&mut buf, *sy);
            put_u16(&mut buf, *buttons);
        }
        self.mouse
            .sent_count
            .fetch_add(steps.len() as i32, Ordering::AcqRel);
        self.inputs.send_raw(&buf)
    }

    pub fn mouse_press(&self, button: MouseButton) -> Result<(), String> {
        self.mouse_button(button, true)
    }

    pub fn mouse_release(&self, button: MouseButton) -> Result<(), String> {
        self.mouse_button(button, false)
    }

    fn mouse_button(&self, button: MouseButton, pressed: bool) -> Result<(), String> {
        if !self.inputs.is_connected() {
            return Err(tag!("Inputs channel is not connected"));
        }
        let mut buttons = self.mouse.buttons.lock().unwrap();
        *buttons = apply_button(*buttons, button, pressed);
        let mut out = Vec::new();
        put_u8(&mut out, button_code(button));
        put_u16(&mut out, *buttons);
        let ty = if pressed {
            MSGC_INPUTS_MOUSE_PRESS
        } else {
            MSGC_INPUTS_MOUSE_RELEASE
        };
        self.inputs.send_packet(ty, &out)
    }

    /** Channel-specific inbound dispatch for the inputs channel. */
    pub(crate) fn on_inputs_msg(
        &self,
        fd: &OwnedFd,
        header: MiniHeader,
        avail: &mut i32,
    ) -> Result<Status, String> {
        if !self.inputs.init_done() {
            if header.ty != MSG_INPUTS_INIT {
                return Err(tag!(
                    "Inputs channel: expected init, got message type {}",
                    header.ty
                ));
            }
            self.inputs.mark_init_done()?;
            let mut body = [0u8; 4];
            if sock::read_exact(fd, &mut body, Some(avail))? {
                return Ok(Status::Closed);
            }
            self.kb_modifiers
                .store(u32::from_le_bytes(body), Ordering::Release);
            return Ok(Status::Ok);
        }

        match header.ty {
            MSG_INPUTS_INIT => Err(tag!("Inputs channel initialized twice")),
            MSG_INPUTS_KEY_MODIFIERS => {
                let mut body = [0u8; 4];
                if sock::read_exact(fd, &mut body, Some(avail))? {
                    return Ok(Status::Closed);
                }
                self.kb_modifiers
                    .store(u32::from_le_bytes(body), Ordering::Release);
                Ok(Status::Ok)
            }
            MSG_INPUTS_MOUSE_MOTION_ACK => {
                let prev = self
                    .mouse
                    .sent_count
                    .fetch_sub(INPUT_MOTION_ACK_BUNCH, Ordering::AcqRel);
                if prev < INPUT_MOTION_ACK_BUNCH {
                    return Err(tag!(
                        "Motion ack for {} outstanding messages",
                        prev.max(0)
                    ));
                }
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
}
