/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Playback channel: demultiplex server audio control and sample data to
 * the registered consumer callbacks. */

use crate::channel::Status;
use crate::proto::*;
use crate::sock;
use crate::tag;
use crate::{AudioFormat, Session};
use std::os::fd::OwnedFd;

impl Session {
    pub(crate) fn on_playback_msg(
        &self,
        fd: &OwnedFd,
        header: MiniHeader,
        avail: &mut i32,
    ) -> Result<Status, String> {
        match header.ty {
            MSG_PLAYBACK_START => {
                let mut body = [0u8; 16];
                if sock::read_exact(fd, &mut body, Some(avail))? {
                    return Ok(Status::Closed);
                }
                let mut tail = &body[..];
                let channels = read_u32(&mut tail).unwrap();
                let format = read_u32(&mut tail).unwrap();
                let frequency = read_u32(&mut tail).unwrap();
                let time = read_u32(&mut tail).unwrap();
                let fmt = if format == AUDIO_FMT_S16 {
                    AudioFormat::S16
                } else {
                    AudioFormat::Invalid
                };
                let cb = self.audio_hooks.lock().unwrap().start.clone();
                if let Some(f) = cb {
                    f(channels, frequency, fmt, time);
                }
                Ok(Status::Ok)
            }
            MSG_PLAYBACK_DATA => {
                if header.size < 4 {
                    return Err(tag!("Playback data message too short: {}", header.size));
                }
                let mut body = vec![0u8; header.size as usize];
                if sock::read_exact(fd, &mut body, Some(avail))? {
                    return Ok(Status::Closed);
                }
                /* leading u32 is the stream timestamp; the rest is raw
                 * sample data */
                let cb = self.audio_hooks.lock().unwrap().data.clone();
                if let Some(f) = cb {
                    f(&body[4..]);
                }
                Ok(Status::Ok)
            }
            MSG_PLAYBACK_STOP => {
                let cb = self.audio_hooks.lock().unwrap().stop.clone();
                if let Some(f) = cb {
                    f();
                }
                Ok(Status::Ok)
            }
            MSG_PLAYBACK_VOLUME => {
                let mut body = vec![0u8; header.size as usize];
                if sock::read_exact(fd, &mut body, Some(avail))? {
                    return Ok(Status::Closed);
                }
                let mut tail = &body[..];
                let nchannels =
                    read_u8(&mut tail).map_err(|x| tag!("Bad volume message: {}", x))? as usize;
                if tail.len() < 2 * nchannels {
                    return Err(tag!(
                        "Volume message for {} channels but only {} bytes",
                        nchannels,
                        tail.len()
                    ));
                }
                let mut volume = Vec::with_capacity(nchannels);
                for _ in 0..nchannels {
                    volume.push(read_u16(&mut tail).unwrap());
                }
                let cb = self.audio_hooks.lock().unwrap().volume.clone();
                if let Some(f) = cb {
                    f(&volume);
                }
                Ok(Status::Ok)
            }
            MSG_PLAYBACK_MUTE => {
                if header.size < 1 {
                    return Err(tag!("Mute message too short"));
                }
                let mut body = vec![0u8; header.size as usize];
                if sock::read_exact(fd, &mut body, Some(avail))? {
                    return Ok(Status::Closed);
                }
                let cb = self.audio_hooks.lock().unwrap().mute.clone();
                if let Some(f) = cb {
                    f(body[0] != 0);
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
