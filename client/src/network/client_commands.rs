//! Encoders for commands sent from the client to the server.
//!
//! Every outbound packet is the ASCII command name, usually a space, then
//! binary or text arguments, wrapped in a 2-byte big-endian length frame by
//! the sink.

use std::io::{self, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use cf_core::byte_operations::{put_decimal, put_u16, put_u32};

/// Transport abstraction under [`CommandWriter`]. Implementations add the
/// length frame.
pub trait PacketSink: Send + Sync {
    fn send_packet(&self, packet: &[u8]) -> io::Result<()>;
}

/// Prepends the 2-byte big-endian length frame.
pub fn frame_packet(packet: &[u8]) -> io::Result<Vec<u8>> {
    let len = u16::try_from(packet.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("packet of {} bytes exceeds the length frame", packet.len()),
        )
    })?;
    let mut framed = Vec::with_capacity(2 + packet.len());
    put_u16(&mut framed, len);
    framed.extend_from_slice(packet);
    Ok(framed)
}

/// Writes framed packets to a TCP stream. The stream is locked per packet
/// so concurrent senders cannot interleave frames.
pub struct TcpSink {
    stream: Mutex<TcpStream>,
}

impl TcpSink {
    pub fn new(stream: TcpStream) -> Self {
        TcpSink {
            stream: Mutex::new(stream),
        }
    }
}

impl PacketSink for TcpSink {
    fn send_packet(&self, packet: &[u8]) -> io::Result<()> {
        let framed = frame_packet(packet)?;
        let mut stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        stream.write_all(&framed)?;
        stream.flush()
    }
}

/// Builds and sends all client-to-server commands.
pub struct CommandWriter {
    sink: Arc<dyn PacketSink>,
    /// Sequence number echoed back by `comc`; wraps modulo 256 even
    /// though it is sent as a 16-bit field.
    packet_id: AtomicU16,
}

impl CommandWriter {
    pub fn new(sink: Arc<dyn PacketSink>) -> Self {
        CommandWriter {
            sink,
            packet_id: AtomicU16::new(0),
        }
    }

    fn send(&self, packet: Vec<u8>) -> io::Result<()> {
        log::trace!("send {}", String::from_utf8_lossy(&packet));
        self.sink.send_packet(&packet)
    }

    pub fn send_version(&self, cs_version: u32, sc_version: u32, info: &str) -> io::Result<()> {
        let mut packet = b"version ".to_vec();
        put_decimal(&mut packet, cs_version);
        packet.push(b' ');
        put_decimal(&mut packet, sc_version);
        packet.push(b' ');
        packet.extend_from_slice(info.as_bytes());
        self.send(packet)
    }

    /// `options` are name/value pairs joined by single spaces.
    pub fn send_setup(&self, options: &[(&str, &str)]) -> io::Result<()> {
        let mut packet = b"setup".to_vec();
        for (name, value) in options {
            packet.push(b' ');
            packet.extend_from_slice(name.as_bytes());
            packet.push(b' ');
            packet.extend_from_slice(value.as_bytes());
        }
        self.send(packet)
    }

    pub fn send_addme(&self) -> io::Result<()> {
        self.send(b"addme".to_vec())
    }

    pub fn send_requestinfo(&self, info_type: &str) -> io::Result<()> {
        let mut packet = b"requestinfo ".to_vec();
        packet.extend_from_slice(info_type.as_bytes());
        self.send(packet)
    }

    pub fn send_toggleextendedtext(&self, types: &[u32]) -> io::Result<()> {
        if types.is_empty() {
            return Ok(());
        }
        let mut packet = b"toggleextendedtext".to_vec();
        for t in types {
            packet.push(b' ');
            put_decimal(&mut packet, *t);
        }
        self.send(packet)
    }

    /// Answers a server `query`.
    pub fn send_reply(&self, text: &str) -> io::Result<()> {
        let mut packet = b"reply ".to_vec();
        packet.extend_from_slice(text.as_bytes());
        self.send(packet)
    }

    /// Issues an in-game command; returns the sequence number the server
    /// will echo in `comc`.
    pub fn send_ncom(&self, repeat: u32, command: &str) -> io::Result<u16> {
        let packet_id = self.packet_id.fetch_add(1, Ordering::Relaxed) & 0xff;
        let mut packet = b"ncom ".to_vec();
        put_u16(&mut packet, packet_id);
        put_u32(&mut packet, repeat);
        packet.extend_from_slice(command.as_bytes());
        self.send(packet)?;
        Ok(packet_id)
    }

    pub fn send_apply(&self, tag: u32) -> io::Result<()> {
        let mut packet = b"apply ".to_vec();
        put_decimal(&mut packet, tag);
        self.send(packet)
    }

    pub fn send_examine(&self, tag: u32) -> io::Result<()> {
        let mut packet = b"examine ".to_vec();
        put_decimal(&mut packet, tag);
        self.send(packet)
    }

    pub fn send_lock(&self, locked: bool, tag: u32) -> io::Result<()> {
        let mut packet = b"lock ".to_vec();
        packet.push(u8::from(locked));
        put_u32(&mut packet, tag);
        self.send(packet)
    }

    pub fn send_mark(&self, tag: u32) -> io::Result<()> {
        let mut packet = b"mark ".to_vec();
        put_u32(&mut packet, tag);
        self.send(packet)
    }

    /// `dx`/`dy` are tile offsets relative to the view center.
    pub fn send_lookat(&self, dx: i32, dy: i32) -> io::Result<()> {
        let mut packet = b"lookat ".to_vec();
        packet.extend_from_slice(dx.to_string().as_bytes());
        packet.push(b' ');
        packet.extend_from_slice(dy.to_string().as_bytes());
        self.send(packet)
    }

    pub fn send_move(&self, to: u32, tag: u32, nrof: u32) -> io::Result<()> {
        let mut packet = b"move ".to_vec();
        put_decimal(&mut packet, to);
        packet.push(b' ');
        put_decimal(&mut packet, tag);
        packet.push(b' ');
        put_decimal(&mut packet, nrof);
        self.send(packet)
    }

    pub fn send_askface(&self, face: u32) -> io::Result<()> {
        let mut packet = b"askface ".to_vec();
        put_decimal(&mut packet, face);
        self.send(packet)
    }

    pub fn send_account_login(&self, login: &str, password: &str) -> io::Result<()> {
        let mut packet = b"accountlogin ".to_vec();
        put_counted_string(&mut packet, login)?;
        put_counted_string(&mut packet, password)?;
        self.send(packet)
    }

    pub fn send_account_create(&self, login: &str, password: &str) -> io::Result<()> {
        let mut packet = b"accountnew ".to_vec();
        put_counted_string(&mut packet, login)?;
        put_counted_string(&mut packet, password)?;
        self.send(packet)
    }

    /// Links an existing character to the logged-in account.
    pub fn send_account_link(&self, force: bool, login: &str, password: &str) -> io::Result<()> {
        let mut packet = b"accountaddplayer ".to_vec();
        packet.push(u8::from(force));
        put_counted_string(&mut packet, login)?;
        put_counted_string(&mut packet, password)?;
        self.send(packet)
    }

    /// Starts playing one character of the logged-in account.
    pub fn send_account_play(&self, name: &str) -> io::Result<()> {
        let mut packet = b"accountplay ".to_vec();
        packet.extend_from_slice(name.as_bytes());
        self.send(packet)
    }

    pub fn send_account_character_create(&self, login: &str, password: &str) -> io::Result<()> {
        let mut packet = b"createplayer ".to_vec();
        put_counted_string(&mut packet, login)?;
        put_counted_string(&mut packet, password)?;
        self.send(packet)
    }

    pub fn send_account_password(&self, current: &str, new: &str) -> io::Result<()> {
        let mut packet = b"accountpw ".to_vec();
        put_counted_string(&mut packet, current)?;
        put_counted_string(&mut packet, new)?;
        self.send(packet)
    }
}

/// Appends a 1-byte length followed by the string bytes.
fn put_counted_string(buf: &mut Vec<u8>, value: &str) -> io::Result<()> {
    let len = u8::try_from(value.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("string of {} bytes exceeds the 1-byte length field", value.len()),
        )
    })?;
    buf.push(len);
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        packets: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingSink {
        fn take(&self) -> Vec<Vec<u8>> {
            std::mem::take(&mut self.packets.lock().unwrap())
        }
    }

    impl PacketSink for RecordingSink {
        fn send_packet(&self, packet: &[u8]) -> io::Result<()> {
            self.packets.lock().unwrap().push(packet.to_vec());
            Ok(())
        }
    }

    fn writer() -> (CommandWriter, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (CommandWriter::new(sink.clone()), sink)
    }

    #[test]
    fn frame_prepends_big_endian_length() {
        let framed = frame_packet(b"addme").unwrap();
        assert_eq!(framed, [&[0x00, 0x05][..], b"addme"].concat());
    }

    #[test]
    fn frame_rejects_oversized_packet() {
        let packet = vec![0u8; 65536];
        assert!(frame_packet(&packet).is_err());
    }

    #[test]
    fn version_command_is_ascii() {
        let (w, sink) = writer();
        w.send_version(1023, 1027, "rust client").unwrap();
        assert_eq!(sink.take(), vec![b"version 1023 1027 rust client".to_vec()]);
    }

    #[test]
    fn setup_joins_option_pairs() {
        let (w, sink) = writer();
        w.send_setup(&[("mapsize", "17x13"), ("spellmon", "1")])
            .unwrap();
        assert_eq!(sink.take(), vec![b"setup mapsize 17x13 spellmon 1".to_vec()]);
    }

    #[test]
    fn ncom_mixes_ascii_prefix_with_binary_fields() {
        let (w, sink) = writer();
        let id = w.send_ncom(1, "north").unwrap();
        assert_eq!(id, 0);

        let packets = sink.take();
        let mut expected = b"ncom ".to_vec();
        expected.extend_from_slice(&[0x00, 0x00]); // sequence
        expected.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]); // repeat
        expected.extend_from_slice(b"north");
        assert_eq!(packets, vec![expected]);
    }

    #[test]
    fn ncom_sequence_wraps_modulo_256() {
        let (w, sink) = writer();
        w.packet_id.store(255, Ordering::Relaxed);
        assert_eq!(w.send_ncom(0, "stay").unwrap(), 255);
        assert_eq!(w.send_ncom(0, "stay").unwrap(), 0);

        // The wire field is still two bytes wide.
        let packets = sink.take();
        assert_eq!(packets[0][5..7], [0x00, 0xff]);
        assert_eq!(packets[1][5..7], [0x00, 0x00]);
    }

    #[test]
    fn account_login_uses_counted_strings() {
        let (w, sink) = writer();
        w.send_account_login("bob", "secret").unwrap();

        let mut expected = b"accountlogin ".to_vec();
        expected.push(3);
        expected.extend_from_slice(b"bob");
        expected.push(6);
        expected.extend_from_slice(b"secret");
        assert_eq!(sink.take(), vec![expected]);
    }

    #[test]
    fn overlong_account_name_is_rejected_without_sending() {
        let (w, sink) = writer();
        let long = "x".repeat(256);
        assert!(w.send_account_login(&long, "pw").is_err());
        assert!(sink.take().is_empty());
    }

    #[test]
    fn toggleextendedtext_with_no_types_sends_nothing() {
        let (w, sink) = writer();
        w.send_toggleextendedtext(&[]).unwrap();
        assert!(sink.take().is_empty());
    }
}
