/* SPDX-License-Identifier: GPL-3.0-or-later */
#![cfg(test)]
/*! Protocol tests driving a [`Session`] against a scripted fake server
 * over Unix sockets: full link handshakes, input and clipboard flows,
 * flow control, and teardown. */

use crate::proto::*;
use crate::*;

use rand::rngs::OsRng;
use rsa::pkcs8::EncodePublicKey;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

const PASSWORD: &str = "opensesame";

struct TestLogger;
impl log::Log for TestLogger {
    fn enabled(&self, meta: &log::Metadata<'_>) -> bool {
        meta.level() <= log::LevelFilter::Debug
    }
    fn log(&self, record: &log::Record<'_>) {
        eprintln!("[{}] {}", record.level(), record.args());
    }
    fn flush(&self) {}
}
static LOGGER: TestLogger = TestLogger;

fn init_logging() {
    let _ = log::set_logger(&LOGGER).map(|()| log::set_max_level(log::LevelFilter::Debug));
}

struct TestKey {
    private: RsaPrivateKey,
    der: Vec<u8>,
}

/** The 1024-bit ticket key is expensive to generate, so every test
 * shares one. */
fn test_key() -> &'static TestKey {
    static KEY: OnceLock<TestKey> = OnceLock::new();
    KEY.get_or_init(|| {
        let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let der = RsaPublicKey::from(&private)
            .to_public_key_der()
            .unwrap()
            .to_vec();
        assert_eq!(der.len(), TICKET_PUBKEY_BYTES);
        TestKey { private, der }
    })
}

static SOCK_COUNTER: AtomicU32 = AtomicU32::new(0);

fn test_sock_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "spicelink-{}-{}-{}.sock",
        name,
        std::process::id(),
        SOCK_COUNTER.fetch_add(1, Ordering::Relaxed)
    ))
}

/** Server side of the link sequence: validate the client's link message,
 * hand out the test RSA key, and check the decrypted ticket. */
fn server_handshake(s: &mut UnixStream, expect_type: u8, expect_session: u32) {
    let key = test_key();
    let mut raw_header = [0u8; LINK_HEADER_SIZE];
    s.read_exact(&mut raw_header).unwrap();
    let header = parse_link_header(&raw_header);
    assert_eq!(header.magic, SPICE_MAGIC);
    assert_eq!(header.major, SPICE_VERSION_MAJOR);

    let mut body = vec![0u8; header.size as usize];
    s.read_exact(&mut body).unwrap();
    let mut tail = &body[..];
    let connection_id = read_u32(&mut tail).unwrap();
    let channel_type = read_u8(&mut tail).unwrap();
    let _channel_id = read_u8(&mut tail).unwrap();
    let num_common = read_u32(&mut tail).unwrap();
    let num_channel = read_u32(&mut tail).unwrap();
    let _caps_offset = read_u32(&mut tail).unwrap();
    assert_eq!(channel_type, expect_type);
    assert_eq!(connection_id, expect_session);
    assert_eq!((num_common, num_channel), (1, 1));
    let common_caps = read_u32(&mut tail).unwrap();
    assert_eq!(common_caps & (1 << COMMON_CAP_MINI_HEADER), 1 << COMMON_CAP_MINI_HEADER);
    assert_eq!(common_caps & (1 << COMMON_CAP_AUTH_SPICE), 1 << COMMON_CAP_AUTH_SPICE);

    let mut reply = Vec::new();
    put_link_header(&mut reply, (LINK_REPLY_SIZE + 8) as u32);
    put_u32(&mut reply, LINK_ERR_OK);
    reply.extend_from_slice(&key.der);
    put_u32(&mut reply, 1);
    put_u32(&mut reply, 1);
    put_u32(&mut reply, LINK_REPLY_SIZE as u32);
    put_u32(&mut reply, (1 << COMMON_CAP_AUTH_SPICE) | (1 << COMMON_CAP_MINI_HEADER));
    put_u32(&mut reply, 0);
    s.write_all(&reply).unwrap();

    let mut mech = [0u8; 4];
    s.read_exact(&mut mech).unwrap();
    assert_eq!(u32::from_le_bytes(mech), COMMON_CAP_AUTH_SPICE);

    /* 1024-bit key: the ciphertext is exactly 128 bytes */
    let mut ticket = [0u8; 128];
    s.read_exact(&mut ticket).unwrap();
    let clear = key.private.decrypt(Oaep::new::<Sha1>(), &ticket).unwrap();
    let mut expected = PASSWORD.as_bytes().to_vec();
    expected.push(0);
    assert_eq!(clear, expected);

    s.write_all(&LINK_ERR_OK.to_le_bytes()).unwrap();
}

fn send_msg(s: &mut UnixStream, ty: u16, payload: &[u8]) {
    s.write_all(&framed(ty, payload)).unwrap();
}

fn read_msg(s: &mut UnixStream) -> (u16, Vec<u8>) {
    let mut raw = [0u8; MINI_HEADER_SIZE];
    s.read_exact(&mut raw).unwrap();
    let header = parse_mini_header(&raw);
    let mut body = vec![0u8; header.size as usize];
    s.read_exact(&mut body).unwrap();
    (header.ty, body)
}

fn main_init_payload(
    session_id: u32,
    mouse_mode: u16,
    agent_connected: bool,
    agent_tokens: u32,
) -> Vec<u8> {
    let mut out = Vec::new();
    put_u32(&mut out, session_id);
    put_u32(&mut out, 1); /* display channels hint */
    put_u32(&mut out, 3); /* supported mouse modes */
    put_u32(&mut out, mouse_mode as u32);
    put_u32(&mut out, agent_connected as u32);
    put_u32(&mut out, agent_tokens);
    put_u32(&mut out, 0); /* multimedia time */
    put_u32(&mut out, 0); /* ram hint */
    out
}

/** One agent-data wire packet carrying a fresh agent message header. */
fn agent_packet(ty: u32, size: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    put_agent_header(&mut out, ty, size);
    out.extend_from_slice(payload);
    out
}

fn channels_list_payload(entries: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    put_u32(&mut out, entries.len() as u32);
    for ty in entries {
        put_u8(&mut out, *ty);
        put_u8(&mut out, 0);
    }
    out
}

/** Drive the event loop until `cond` holds. */
fn pump_until(sess: &Session, cond: &dyn Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        sess.process(100).unwrap();
    }
    panic!("Condition not reached while pumping the event loop");
}

/** Accept the main channel, run the link, and send main-init. */
fn accept_main(
    listener: &UnixListener,
    session_id: u32,
    mouse_mode: u16,
    agent_connected: bool,
    agent_tokens: u32,
) -> UnixStream {
    let (mut main, _) = listener.accept().unwrap();
    server_handshake(&mut main, CHANNEL_MAIN, 0);
    send_msg(
        &mut main,
        MSG_MAIN_INIT,
        &main_init_payload(session_id, mouse_mode, agent_connected, agent_tokens),
    );
    main
}

#[test]
fn link_mouse_mode_and_disconnect() {
    init_logging();
    let path = test_sock_path("link");
    let listener = UnixListener::bind(&path).unwrap();

    let server = std::thread::spawn(move || {
        let mut main = accept_main(&listener, 0x1234, MOUSE_MODE_SERVER, false, 0);
        /* server-mouse mode: the client must ask for client mode before
         * attaching channels */
        let (ty, body) = read_msg(&mut main);
        assert_eq!(ty, MSGC_MAIN_MOUSE_MODE_REQUEST);
        assert_eq!(body, MOUSE_MODE_CLIENT.to_le_bytes());
        let (ty, body) = read_msg(&mut main);
        assert_eq!(ty, MSGC_MAIN_ATTACH_CHANNELS);
        assert!(body.is_empty());
        /* orderly client disconnect carries a courtesy message */
        let (ty, body) = read_msg(&mut main);
        assert_eq!(ty, MSGC_DISCONNECTING);
        assert_eq!(body.len(), 12);
    });

    let sess = Session::connect(path.to_str().unwrap(), 0, PASSWORD, false).unwrap();
    pump_until(&sess, &|| sess.session_id.load(Ordering::Acquire) == 0x1234);
    assert!(!sess.ready()); /* inputs never came up */
    sess.disconnect();
    assert_eq!(sess.process(100), Ok(false));
    assert_eq!(sess.session_id.load(Ordering::Acquire), 0);
    server.join().unwrap();
    let _ = std::fs::remove_file(&path);
}

/** Bring up main and inputs, leaving the server ready to script inputs
 * traffic. */
fn accept_with_inputs(listener: &UnixListener, session_id: u32) -> (UnixStream, UnixStream) {
    let mut main = accept_main(listener, session_id, MOUSE_MODE_CLIENT, false, 0);
    let (ty, _) = read_msg(&mut main);
    assert_eq!(ty, MSGC_MAIN_ATTACH_CHANNELS);
    send_msg(
        &mut main,
        MSG_MAIN_CHANNELS_LIST,
        &channels_list_payload(&[CHANNEL_INPUTS]),
    );
    let (mut inputs, _) = listener.accept().unwrap();
    server_handshake(&mut inputs, CHANNEL_INPUTS, session_id);
    let mut init = Vec::new();
    put_u32(&mut init, 0b100); /* caps-lock lit */
    send_msg(&mut inputs, MSG_INPUTS_INIT, &init);
    (main, inputs)
}

#[test]
fn inputs_scancode_encoding() {
    init_logging();
    let path = test_sock_path("keys");
    let listener = UnixListener::bind(&path).unwrap();

    let server = std::thread::spawn(move || {
        let (_main, mut inputs) = accept_with_inputs(&listener, 7);
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(read_msg(&mut inputs));
        }
        seen
    });

    let sess = Session::connect(path.to_str().unwrap(), 0, PASSWORD, false).unwrap();
    pump_until(&sess, &|| sess.ready());
    pump_until(&sess, &|| sess.modifiers() == 0b100);
    sess.key_down(0x2a).unwrap();
    sess.key_up(0x2a).unwrap();
    sess.key_down(0x1d + 0x100).unwrap();
    sess.key_up(0x1d + 0x100).unwrap();

    let seen = server.join().unwrap();
    assert_eq!(
        seen,
        vec![
            (MSGC_INPUTS_KEY_DOWN, 0x2au32.to_le_bytes().to_vec()),
            (MSGC_INPUTS_KEY_UP, 0xaau32.to_le_bytes().to_vec()),
            (MSGC_INPUTS_KEY_DOWN, 0x1de0u32.to_le_bytes().to_vec()),
            (MSGC_INPUTS_KEY_UP, 0x9de0u32.to_le_bytes().to_vec()),
        ]
    );
    sess.disconnect();
    let _ = std::fs::remove_file(&path);
}

fn parse_motion(body: &[u8]) -> (i32, i32, u16) {
    let mut tail = body;
    let dx = read_u32(&mut tail).unwrap() as i32;
    let dy = read_u32(&mut tail).unwrap() as i32;
    let buttons = read_u16(&mut tail).unwrap();
    (dx, dy, buttons)
}

#[test]
fn motion_coalescing_and_acks() {
    init_logging();
    let path = test_sock_path("motion");
    let listener = UnixListener::bind(&path).unwrap();

    let server = std::thread::spawn(move || {
        let (_main, mut inputs) = accept_with_inputs(&listener, 8);
        /* a press, three coalesced motion fragments, one more motion */
        let (ty, body) = read_msg(&mut inputs);
        assert_eq!(ty, MSGC_INPUTS_MOUSE_PRESS);
        assert_eq!(body, vec![MOUSE_BUTTON_LEFT, 0x01, 0x00]);
        let mut motions = Vec::new();
        for _ in 0..4 {
            let (ty, body) = read_msg(&mut inputs);
            assert_eq!(ty, MSGC_INPUTS_MOUSE_MOTION);
            motions.push(parse_motion(&body));
        }
        assert_eq!(
            motions,
            vec![(127, -40, 1), (127, 0, 1), (46, 0, 1), (10, 0, 1)]
        );
        /* retire the whole bunch at once */
        send_msg(&mut inputs, MSG_INPUTS_MOUSE_MOTION_ACK, &[]);
        let (ty, body) = read_msg(&mut inputs);
        assert_eq!(ty, MSGC_INPUTS_MOUSE_RELEASE);
        assert_eq!(body, vec![MOUSE_BUTTON_LEFT, 0x00, 0x00]);
        /* a second ack with nothing outstanding is a violation; stay
         * alive until the client reacts so the error is not masked by
         * an earlier teardown */
        send_msg(&mut inputs, MSG_INPUTS_MOUSE_MOTION_ACK, &[]);
        let (ty, _) = read_msg(&mut inputs);
        assert_eq!(ty, MSGC_DISCONNECTING);
    });

    let sess = Session::connect(path.to_str().unwrap(), 0, PASSWORD, false).unwrap();
    pump_until(&sess, &|| sess.ready());
    sess.mouse_press(MouseButton::Left).unwrap();
    sess.mouse_motion(300, -40).unwrap();
    assert_eq!(sess.mouse.sent_count.load(Ordering::Acquire), 3);
    sess.mouse_motion(10, 0).unwrap();
    assert_eq!(sess.mouse.sent_count.load(Ordering::Acquire), 4);
    pump_until(&sess, &|| {
        sess.mouse.sent_count.load(Ordering::Acquire) == 0
    });
    sess.mouse_release(MouseButton::Left).unwrap();

    /* the second, spurious ack must surface as a protocol error */
    let mut result = Ok(true);
    for _ in 0..200 {
        result = sess.process(100);
        if result.is_err() {
            break;
        }
    }
    assert!(result.is_err());
    sess.disconnect();
    server.join().unwrap();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn ack_window_cadence() {
    init_logging();
    let path = test_sock_path("ack");
    let listener = UnixListener::bind(&path).unwrap();

    let server = std::thread::spawn(move || {
        let mut main = accept_main(&listener, 9, MOUSE_MODE_CLIENT, false, 0);
        let (ty, _) = read_msg(&mut main);
        assert_eq!(ty, MSGC_MAIN_ATTACH_CHANNELS);

        let mut set_ack = Vec::new();
        put_u32(&mut set_ack, 5); /* generation */
        put_u32(&mut set_ack, 10); /* window */
        send_msg(&mut main, MSG_SET_ACK, &set_ack);
        let (ty, body) = read_msg(&mut main);
        assert_eq!(ty, MSGC_ACK_SYNC);
        assert_eq!(body, 5u32.to_le_bytes());

        /* the set-ack message itself counted, so ten discardable
         * messages bring the counter to the window */
        for _ in 0..10 {
            send_msg(&mut main, 0xbb, &[0, 1, 2, 3]);
        }
        let (ty, body) = read_msg(&mut main);
        assert_eq!(ty, MSGC_ACK);
        assert!(body.is_empty());

        /* from an empty counter the next ack takes window + 1 */
        for _ in 0..11 {
            send_msg(&mut main, 0xbb, &[0, 1, 2, 3]);
        }
        let (ty, _) = read_msg(&mut main);
        assert_eq!(ty, MSGC_ACK);
    });

    let sess = Session::connect(path.to_str().unwrap(), 0, PASSWORD, false).unwrap();
    for _ in 0..50 {
        sess.process(100).unwrap();
    }
    server.join().unwrap();
    sess.disconnect();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn ping_pong_with_padding() {
    init_logging();
    let path = test_sock_path("ping");
    let listener = UnixListener::bind(&path).unwrap();

    let server = std::thread::spawn(move || {
        let mut main = accept_main(&listener, 10, MOUSE_MODE_CLIENT, false, 0);
        let (ty, _) = read_msg(&mut main);
        assert_eq!(ty, MSGC_MAIN_ATTACH_CHANNELS);

        let mut ping = Vec::new();
        put_u32(&mut ping, 77);
        put_u64(&mut ping, 0xdead_beef);
        ping.extend_from_slice(&[0u8; 32]); /* trailing padding */
        send_msg(&mut main, MSG_PING, &ping);
        let (ty, body) = read_msg(&mut main);
        assert_eq!(ty, MSGC_PONG);
        assert_eq!(body, ping[..12].to_vec());
    });

    let sess = Session::connect(path.to_str().unwrap(), 0, PASSWORD, false).unwrap();
    for _ in 0..20 {
        sess.process(100).unwrap();
    }
    server.join().unwrap();
    sess.disconnect();
    let _ = std::fs::remove_file(&path);
}

/** Read one agent-data message and return its payload. */
fn read_agent_data(s: &mut UnixStream) -> Vec<u8> {
    let (ty, body) = read_msg(s);
    assert_eq!(ty, MSGC_MAIN_AGENT_DATA);
    body
}

/** Consume the client's agent bring-up: agent-start plus its two-packet
 * capability announcement. Returns the announced `request` flag. */
fn read_agent_bringup(main: &mut UnixStream) -> u32 {
    let (ty, body) = read_msg(main);
    assert_eq!(ty, MSGC_MAIN_AGENT_START);
    assert_eq!(body, u32::MAX.to_le_bytes());
    read_caps_announcement(main)
}

fn read_caps_announcement(main: &mut UnixStream) -> u32 {
    let header_pkt = read_agent_data(main);
    let hdr = parse_agent_header(header_pkt[..AGENT_HEADER_SIZE].try_into().unwrap());
    assert_eq!(hdr.protocol, AGENT_PROTOCOL);
    assert_eq!(hdr.ty, AGENT_MSG_ANNOUNCE_CAPABILITIES);
    assert_eq!(hdr.size, 8);
    let payload_pkt = read_agent_data(main);
    let mut tail = &payload_pkt[..];
    let request = read_u32(&mut tail).unwrap();
    let caps = read_u32(&mut tail).unwrap();
    assert_eq!(
        caps,
        (1 << AGENT_CAP_CLIPBOARD_BY_DEMAND) | (1 << AGENT_CAP_CLIPBOARD_SELECTION)
    );
    request
}

#[test]
fn agent_capability_exchange() {
    init_logging();
    let path = test_sock_path("caps");
    let listener = UnixListener::bind(&path).unwrap();

    let server = std::thread::spawn(move || {
        let mut main = accept_main(&listener, 11, MOUSE_MODE_CLIENT, true, 4);
        assert_eq!(read_agent_bringup(&mut main), 1);
        let (ty, _) = read_msg(&mut main);
        assert_eq!(ty, MSGC_MAIN_ATTACH_CHANNELS);

        /* server announces its caps and asks for ours back */
        let mut caps = Vec::new();
        put_u32(&mut caps, 1); /* request */
        put_u32(&mut caps, 1 << AGENT_CAP_CLIPBOARD_BY_DEMAND);
        send_msg(
            &mut main,
            MSG_MAIN_AGENT_DATA,
            &agent_packet(AGENT_MSG_ANNOUNCE_CAPABILITIES, 8, &caps),
        );
        /* the reply must not request again */
        assert_eq!(read_caps_announcement(&mut main), 0);
    });

    let sess = Session::connect(path.to_str().unwrap(), 0, PASSWORD, false).unwrap();
    for _ in 0..20 {
        sess.process(100).unwrap();
    }
    server.join().unwrap();
    sess.disconnect();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn agent_token_bucket_stalls_queue() {
    init_logging();
    let path = test_sock_path("tokens");
    let listener = UnixListener::bind(&path).unwrap();

    /* the server holds its credits until the client's queue is loaded */
    let (grab_queued_tx, grab_queued_rx) = std::sync::mpsc::channel::<()>();

    let server = std::thread::spawn(move || {
        /* two tokens: entirely consumed by the capability announcement */
        let mut main = accept_main(&listener, 12, MOUSE_MODE_CLIENT, true, 2);
        assert_eq!(read_agent_bringup(&mut main), 1);
        let (ty, _) = read_msg(&mut main);
        assert_eq!(ty, MSGC_MAIN_ATTACH_CHANNELS);

        grab_queued_rx.recv().unwrap();
        /* one credit: only the grab header packet may flow */
        send_msg(&mut main, MSG_MAIN_AGENT_TOKEN, &1u32.to_le_bytes());
        let header_pkt = read_agent_data(&mut main);
        let hdr = parse_agent_header(header_pkt[..AGENT_HEADER_SIZE].try_into().unwrap());
        assert_eq!(hdr.ty, AGENT_MSG_CLIPBOARD_GRAB);
        assert_eq!(hdr.size, 4);

        /* second credit releases the type list */
        send_msg(&mut main, MSG_MAIN_AGENT_TOKEN, &1u32.to_le_bytes());
        let payload_pkt = read_agent_data(&mut main);
        assert_eq!(payload_pkt, AGENT_CLIPBOARD_UTF8_TEXT.to_le_bytes());
    });

    let sess = Session::connect(path.to_str().unwrap(), 0, PASSWORD, false).unwrap();
    pump_until(&sess, &|| sess.agent.has_agent.load(Ordering::Acquire));
    assert_eq!(sess.agent.tokens.load(Ordering::Acquire), 0);

    /* both fragments queue; no tokens are left to move them */
    sess.clipboard_grab(&[ClipboardType::Text]).unwrap();
    assert_eq!(sess.agent.queued_packets(), 2);
    grab_queued_tx.send(()).unwrap();
    pump_until(&sess, &|| sess.agent.queued_packets() == 0);
    server.join().unwrap();
    sess.disconnect();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn clipboard_reassembly_across_fragments() {
    init_logging();
    let path = test_sock_path("clip");
    let listener = UnixListener::bind(&path).unwrap();

    let payload: Vec<u8> = (0..100 * 1024u32).map(|i| (i * 7 + 3) as u8).collect();
    let payload_copy = payload.clone();

    let server = std::thread::spawn(move || {
        let mut main = accept_main(&listener, 13, MOUSE_MODE_CLIENT, true, 100);
        assert_eq!(read_agent_bringup(&mut main), 1);
        let (ty, _) = read_msg(&mut main);
        assert_eq!(ty, MSGC_MAIN_ATTACH_CHANNELS);

        /* offer text, then push the payload in three agent-data frames */
        send_msg(
            &mut main,
            MSG_MAIN_AGENT_DATA,
            &agent_packet(
                AGENT_MSG_CLIPBOARD_GRAB,
                4,
                &AGENT_CLIPBOARD_UTF8_TEXT.to_le_bytes(),
            ),
        );

        let total = 4 + payload_copy.len() as u32;
        let mut first = Vec::new();
        put_u32(&mut first, AGENT_CLIPBOARD_UTF8_TEXT);
        first.extend_from_slice(&payload_copy[..40000]);
        send_msg(
            &mut main,
            MSG_MAIN_AGENT_DATA,
            &agent_packet(AGENT_MSG_CLIPBOARD, total, &first),
        );
        send_msg(&mut main, MSG_MAIN_AGENT_DATA, &payload_copy[40000..80000]);
        send_msg(&mut main, MSG_MAIN_AGENT_DATA, &payload_copy[80000..]);
    });

    let sess = Session::connect(path.to_str().unwrap(), 0, PASSWORD, false).unwrap();
    let noticed: Arc<Mutex<Option<ClipboardType>>> = Arc::new(Mutex::new(None));
    let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let noticed_w = noticed.clone();
    let received_w = received.clone();
    sess.set_clipboard_cb(
        Some(Arc::new(move |ty| {
            *noticed_w.lock().unwrap() = Some(ty);
        })),
        Some(Arc::new(move |ty, data: &[u8]| {
            assert_eq!(ty, ClipboardType::Text);
            received_w.lock().unwrap().push(data.to_vec());
        })),
        None,
        None,
    )
    .unwrap();

    pump_until(&sess, &|| !received.lock().unwrap().is_empty());
    assert_eq!(*noticed.lock().unwrap(), Some(ClipboardType::Text));
    let got = received.lock().unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0], payload);
    drop(got);
    server.join().unwrap();
    sess.disconnect();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn oversized_capability_announcement_fails() {
    init_logging();
    let path = test_sock_path("oversize");
    let listener = UnixListener::bind(&path).unwrap();

    let server = std::thread::spawn(move || {
        let mut main = accept_main(&listener, 14, MOUSE_MODE_CLIENT, true, 8);
        assert_eq!(read_agent_bringup(&mut main), 1);
        let (ty, _) = read_msg(&mut main);
        assert_eq!(ty, MSGC_MAIN_ATTACH_CHANNELS);
        let junk = vec![0u8; 2000];
        send_msg(
            &mut main,
            MSG_MAIN_AGENT_DATA,
            &agent_packet(AGENT_MSG_ANNOUNCE_CAPABILITIES, 2000, &junk),
        );
        /* the client drops the session in response */
        let (ty, _) = read_msg(&mut main);
        assert_eq!(ty, MSGC_DISCONNECTING);
    });

    let sess = Session::connect(path.to_str().unwrap(), 0, PASSWORD, false).unwrap();
    let mut result = Ok(true);
    for _ in 0..200 {
        result = sess.process(100);
        if result.is_err() {
            break;
        }
    }
    assert!(result.is_err());
    server.join().unwrap();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn agent_protocol_mismatch_fails() {
    init_logging();
    let path = test_sock_path("agentproto");
    let listener = UnixListener::bind(&path).unwrap();

    let server = std::thread::spawn(move || {
        let mut main = accept_main(&listener, 15, MOUSE_MODE_CLIENT, true, 8);
        assert_eq!(read_agent_bringup(&mut main), 1);
        let (ty, _) = read_msg(&mut main);
        assert_eq!(ty, MSGC_MAIN_ATTACH_CHANNELS);
        let mut bad = Vec::new();
        put_u32(&mut bad, 2); /* protocol */
        put_u32(&mut bad, AGENT_MSG_CLIPBOARD_RELEASE);
        put_u64(&mut bad, 0);
        put_u32(&mut bad, 0);
        send_msg(&mut main, MSG_MAIN_AGENT_DATA, &bad);
        let (ty, _) = read_msg(&mut main);
        assert_eq!(ty, MSGC_DISCONNECTING);
    });

    let sess = Session::connect(path.to_str().unwrap(), 0, PASSWORD, false).unwrap();
    let mut result = Ok(true);
    for _ in 0..200 {
        result = sess.process(100);
        if result.is_err() {
            break;
        }
    }
    assert!(result.is_err());
    server.join().unwrap();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn playback_demux() {
    init_logging();
    let path = test_sock_path("audio");
    let listener = UnixListener::bind(&path).unwrap();

    let server = std::thread::spawn(move || {
        let mut main = accept_main(&listener, 16, MOUSE_MODE_CLIENT, false, 0);
        let (ty, _) = read_msg(&mut main);
        assert_eq!(ty, MSGC_MAIN_ATTACH_CHANNELS);
        send_msg(
            &mut main,
            MSG_MAIN_CHANNELS_LIST,
            &channels_list_payload(&[CHANNEL_PLAYBACK]),
        );
        let (mut playback, _) = listener.accept().unwrap();
        server_handshake(&mut playback, CHANNEL_PLAYBACK, 16);

        let mut start = Vec::new();
        put_u32(&mut start, 2);
        put_u32(&mut start, AUDIO_FMT_S16);
        put_u32(&mut start, 44100);
        put_u32(&mut start, 5);
        send_msg(&mut playback, MSG_PLAYBACK_START, &start);

        let mut data = Vec::new();
        put_u32(&mut data, 6); /* stream time */
        data.extend_from_slice(&[1, 2, 3, 4]);
        send_msg(&mut playback, MSG_PLAYBACK_DATA, &data);

        let mut volume = Vec::new();
        put_u8(&mut volume, 2);
        put_u16(&mut volume, 10);
        put_u16(&mut volume, 20);
        send_msg(&mut playback, MSG_PLAYBACK_VOLUME, &volume);

        send_msg(&mut playback, MSG_PLAYBACK_MUTE, &[1]);
        send_msg(&mut playback, MSG_PLAYBACK_STOP, &[]);
        /* keep both streams open until the client has drained them */
        (main, playback)
    });

    let sess = Session::connect(path.to_str().unwrap(), 0, PASSWORD, true).unwrap();
    #[derive(Default)]
    struct Seen {
        start: Option<(u32, u32, AudioFormat, u32)>,
        data: Vec<u8>,
        volume: Vec<u16>,
        mute: Option<bool>,
        stopped: bool,
    }
    let seen: Arc<Mutex<Seen>> = Arc::new(Mutex::new(Seen::default()));
    let (s1, s2, s3, s4, s5) = (
        seen.clone(),
        seen.clone(),
        seen.clone(),
        seen.clone(),
        seen.clone(),
    );
    sess.set_audio_cb(
        Arc::new(move |channels, frequency, format, time| {
            s1.lock().unwrap().start = Some((channels, frequency, format, time));
        }),
        Some(Arc::new(move |volume: &[u16]| {
            s2.lock().unwrap().volume = volume.to_vec();
        })),
        Some(Arc::new(move |mute| {
            s3.lock().unwrap().mute = Some(mute);
        })),
        Arc::new(move || {
            s4.lock().unwrap().stopped = true;
        }),
        Arc::new(move |data: &[u8]| {
            s5.lock().unwrap().data.extend_from_slice(data);
        }),
    );

    pump_until(&sess, &|| seen.lock().unwrap().stopped);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.start, Some((2, 44100, AudioFormat::S16, 5)));
    assert_eq!(seen.data, vec![1, 2, 3, 4]);
    assert_eq!(seen.volume, vec![10, 20]);
    assert_eq!(seen.mute, Some(true));
    server.join().unwrap();
    sess.disconnect();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn second_init_is_rejected() {
    init_logging();
    let path = test_sock_path("reinit");
    let listener = UnixListener::bind(&path).unwrap();

    let server = std::thread::spawn(move || {
        let mut main = accept_main(&listener, 17, MOUSE_MODE_CLIENT, false, 0);
        let (ty, _) = read_msg(&mut main);
        assert_eq!(ty, MSGC_MAIN_ATTACH_CHANNELS);
        /* a second init must kill the session */
        send_msg(
            &mut main,
            MSG_MAIN_INIT,
            &main_init_payload(17, MOUSE_MODE_CLIENT, false, 0),
        );
    });

    let sess = Session::connect(path.to_str().unwrap(), 0, PASSWORD, false).unwrap();
    let mut result = Ok(true);
    for _ in 0..200 {
        result = sess.process(100);
        if result.is_err() {
            break;
        }
    }
    assert!(result.is_err());
    server.join().unwrap();
    let _ = std::fs::remove_file(&path);
}
