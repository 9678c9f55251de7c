//! Connection lifecycle and inbound packet dispatch.
//!
//! A connection walks through a fixed sequence of phases: version exchange,
//! option negotiation, static info download, then login. Packets are
//! length-deframed by the reader thread and dispatched one at a time, so
//! listeners observe every packet's events before the next packet starts.

use std::io::{self, Read};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use cf_core::constants::{VERSION_CS, VERSION_SC};
use cf_core::error::{hex_dump, ProtocolError};

use crate::network::client_commands::{CommandWriter, PacketSink, TcpSink};
use crate::network::listeners::EventFanout;
use crate::network::map2::{Location, Map2Command, TileUpdate};
use crate::network::negotiate::{MapSizeNegotiator, NumLookObjectsNegotiator};
use crate::network::replyinfo::ReplyinfoData;
use crate::network::server_commands::{ServerCommand, ServerCommandData, StatUpdate};

/// Phases of one connection, in the order they are normally entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// TCP connect in progress.
    Connecting,
    /// Waiting for the server's `version`.
    Version,
    /// Waiting for the server's `setup` acknowledgements.
    Setup,
    /// Waiting for the `replyinfo` answers to the static info requests.
    RequestInfo,
    /// `addme` sent, waiting for the verdict.
    Addme,
    /// Account-based login: waiting for account commands.
    AccountInfo,
    /// Logged in and playing.
    Connected,
    /// The connection attempt failed.
    ConnectFailed,
}

/// Static info requested right after option negotiation. Answers arrive as
/// `replyinfo` with the first request token as the info type.
const REQUESTINFOS: &[&str] = &[
    "skill_info 1",
    "exp_table",
    "knowledge_info",
    "image_info",
    "startingmap",
    "race_list",
    "class_list",
    "newcharinfo",
];

/// Client name reported in the `version` line.
const CLIENT_INFO: &str = "rust crossfire client";

/// A connection to one game server.
pub struct ServerConnection {
    fanout: Arc<EventFanout>,
    writer: CommandWriter,
    map_size: MapSizeNegotiator,
    num_look_objects: NumLookObjectsNegotiator,
    state: Mutex<ConnectionState>,
    /// First tokens of unanswered requestinfo commands.
    pending_replyinfos: Mutex<Vec<&'static str>>,
    /// Login method granted by the server; 0 means classic `addme` login.
    login_method: AtomicU8,
    disconnected: AtomicBool,
    /// Accumulated per-level experience table, if already downloaded.
    experience_table: Mutex<Vec<u64>>,
}

impl ServerConnection {
    pub fn new(
        sink: Arc<dyn PacketSink>,
        fanout: Arc<EventFanout>,
        preferred_map_size: (u16, u16),
        preferred_num_look_objects: u16,
    ) -> Self {
        ServerConnection {
            fanout,
            writer: CommandWriter::new(sink),
            map_size: MapSizeNegotiator::new(preferred_map_size.0, preferred_map_size.1),
            num_look_objects: NumLookObjectsNegotiator::new(preferred_num_look_objects),
            state: Mutex::new(ConnectionState::Connecting),
            pending_replyinfos: Mutex::new(Vec::new()),
            login_method: AtomicU8::new(0),
            disconnected: AtomicBool::new(false),
            experience_table: Mutex::new(Vec::new()),
        }
    }

    /// Connects over TCP and spawns the reader thread.
    pub fn connect(
        address: &str,
        fanout: Arc<EventFanout>,
        preferred_map_size: (u16, u16),
        preferred_num_look_objects: u16,
    ) -> io::Result<Arc<ServerConnection>> {
        let stream = match TcpStream::connect(address) {
            Ok(stream) => stream,
            Err(e) => {
                fanout
                    .connection
                    .for_each(|l| l.state_changed(ConnectionState::ConnectFailed));
                return Err(e);
            }
        };
        let reader = stream.try_clone()?;
        let connection = Arc::new(ServerConnection::new(
            Arc::new(TcpSink::new(stream)),
            fanout,
            preferred_map_size,
            preferred_num_look_objects,
        ));
        connection.set_state(ConnectionState::Version);

        let conn = connection.clone();
        thread::Builder::new()
            .name("server-reader".to_string())
            .spawn(move || conn.run_reader(reader))?;
        Ok(connection)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn writer(&self) -> &CommandWriter {
        &self.writer
    }

    /// The map view size agreed with the server, blocking until settled.
    pub fn wait_for_map_size(&self) -> Result<(u16, u16), String> {
        self.map_size.wait_for_current()
    }

    /// The ground view length agreed with the server, blocking until
    /// settled.
    pub fn wait_for_num_look_objects(&self) -> Result<u16, String> {
        self.num_look_objects.wait_for_current()
    }

    pub fn set_preferred_map_size(&self, width: u16, height: u16) -> io::Result<()> {
        if let Some((w, h)) = self.map_size.set_preferred(width, height) {
            self.send_mapsize_request(w, h)?;
        }
        Ok(())
    }

    pub fn set_preferred_num_look_objects(&self, value: u16) -> io::Result<()> {
        if let Some(v) = self.num_look_objects.set_preferred(value) {
            self.writer.send_setup(&[("num_look_objects", &v.to_string())])?;
        }
        Ok(())
    }

    pub fn experience_table(&self) -> Vec<u64> {
        self.experience_table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn send_mapsize_request(&self, width: u16, height: u16) -> io::Result<()> {
        self.writer
            .send_setup(&[("mapsize", &format!("{width}x{height}"))])
    }

    /// Reads and dispatches packets until the stream ends or a packet is
    /// unparseable.
    fn run_reader(&self, mut stream: TcpStream) {
        let mut header = [0u8; 2];
        let mut payload = Vec::new();
        loop {
            if let Err(e) = stream.read_exact(&mut header) {
                self.disconnect(&format!("connection closed: {e}"));
                return;
            }
            let len = u16::from_be_bytes(header) as usize;
            payload.resize(len, 0);
            if let Err(e) = stream.read_exact(&mut payload) {
                self.disconnect(&format!("connection closed mid-packet: {e}"));
                return;
            }
            if let Err(e) = self.handle_packet(&payload) {
                log::error!("{e}\n{}", hex_dump(&payload));
                self.disconnect(&e.to_string());
                return;
            }
        }
    }

    fn set_state(&self, next: ConnectionState) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == next {
                return;
            }
            *state = next;
        }
        self.fanout.connection.for_each(|l| l.state_changed(next));
        if next == ConnectionState::ConnectFailed {
            self.map_size.reset();
            self.num_look_objects.reset();
        }
    }

    /// Warns if the current phase is not `expected`, then enters `next`.
    /// Out-of-order server commands are tolerated because some servers
    /// batch their handshake replies.
    fn advance(&self, expected: ConnectionState, next: ConnectionState) {
        let current = self.state();
        if current != expected {
            log::warn!("entering {next:?} from {current:?} instead of {expected:?}");
        }
        self.set_state(next);
    }

    fn disconnect(&self, reason: &str) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("disconnected: {reason}");
        // Losing the connection before login completes is a failed
        // connection attempt. Entering ConnectFailed also resets both
        // negotiators.
        if self.state() == ConnectionState::Connected {
            self.map_size.reset();
            self.num_look_objects.reset();
        } else {
            self.set_state(ConnectionState::ConnectFailed);
        }
        self.fanout.connection.for_each(|l| l.disconnected(reason));
    }

    /// Dispatches one length-deframed packet.
    pub fn handle_packet(&self, packet: &[u8]) -> Result<(), ProtocolError> {
        let command = ServerCommand::from_packet(packet)?;
        self.fanout
            .packet_watchers
            .for_each(|l| l.packet(command.command, packet));
        self.dispatch(command)
    }

    fn dispatch(&self, command: ServerCommand) -> Result<(), ProtocolError> {
        match command.data {
            ServerCommandData::Empty(cmd) => {
                self.fanout.packet_watchers.for_each(|l| l.empty_command(cmd));
            }
            ServerCommandData::Version {
                cs_version,
                sc_version,
                info,
            } => self.process_version(cs_version, sc_version, &info)?,
            ServerCommandData::Setup { options } => self.process_setup(&options)?,
            ServerCommandData::Replyinfo { info_type, data } => {
                self.process_replyinfo(&info_type, data)?;
            }
            ServerCommandData::Stats { updates } => {
                for update in &updates {
                    self.fanout.stats.for_each(|l| match update {
                        StatUpdate::Int2 { stat, value } => l.stat2(*stat, *value),
                        StatUpdate::Int4 { stat, value } => l.stat4(*stat, *value),
                        StatUpdate::Int8 { stat, value } => l.stat8(*stat, *value),
                        StatUpdate::Text { stat, value } => l.stat_string(*stat, value),
                        StatUpdate::Resist { stat, value } => l.resist(*stat, *value),
                        StatUpdate::Skill {
                            stat,
                            level,
                            experience,
                        } => l.skill(*stat, *level, *experience),
                    });
                }
            }
            ServerCommandData::Item2 { location, items } => {
                for item in &items {
                    self.fanout.items.for_each(|l| l.add_item(location, item));
                }
            }
            ServerCommandData::DelInv { tag } => {
                self.fanout.items.for_each(|l| l.del_inventory(tag));
            }
            ServerCommandData::DelItem { tags } => {
                self.fanout.items.for_each(|l| l.del_items(&tags));
            }
            ServerCommandData::UpdItem(update) => {
                self.fanout.items.for_each(|l| l.upd_item(&update));
            }
            ServerCommandData::Player {
                tag,
                weight,
                face,
                name,
            } => {
                self.fanout
                    .items
                    .for_each(|l| l.player(tag, weight, face, &name));
            }
            ServerCommandData::Pickup { mode } => {
                self.fanout.items.for_each(|l| l.pickup(mode));
            }
            ServerCommandData::AddSpells { spells } => {
                for spell in &spells {
                    self.fanout.spells.for_each(|l| l.add_spell(spell));
                }
            }
            ServerCommandData::UpdSpell(update) => {
                self.fanout.spells.for_each(|l| l.upd_spell(&update));
            }
            ServerCommandData::DelSpell { tag } => {
                self.fanout.spells.for_each(|l| l.del_spell(tag));
            }
            ServerCommandData::AddQuests { quests } => {
                for quest in &quests {
                    self.fanout.quests.for_each(|l| l.add_quest(quest));
                }
            }
            ServerCommandData::UpdQuest { code, end, step } => {
                self.fanout.quests.for_each(|l| l.upd_quest(code, end, &step));
            }
            ServerCommandData::AddKnowledge { entries } => {
                for entry in &entries {
                    self.fanout.knowledge.for_each(|l| l.add_knowledge(entry));
                }
            }
            ServerCommandData::DrawInfo { color, message } => {
                self.fanout.text.for_each(|l| l.drawinfo(color, &message));
            }
            ServerCommandData::DrawExtInfo {
                color,
                message_type,
                subtype,
                message,
            } => {
                self.fanout
                    .text
                    .for_each(|l| l.drawextinfo(color, message_type, subtype, &message));
            }
            ServerCommandData::Query { flags, text } => {
                self.fanout.text.for_each(|l| l.query(flags, &text));
            }
            ServerCommandData::Sound {
                x,
                y,
                num,
                sound_type,
            } => {
                self.fanout.sound.for_each(|l| l.sound(x, y, num, sound_type));
            }
            ServerCommandData::Sound2 {
                x,
                y,
                dir,
                volume,
                sound_type,
                action,
                name,
            } => {
                self.fanout
                    .sound
                    .for_each(|l| l.sound2(x, y, dir, volume, sound_type, &action, &name));
            }
            ServerCommandData::Music { name } => {
                self.fanout.music.for_each(|l| l.music(&name));
            }
            ServerCommandData::Face2 {
                num,
                set,
                checksum,
                name,
            } => {
                self.fanout
                    .faces
                    .for_each(|l| l.face2(num, set, checksum, &name));
            }
            ServerCommandData::Image2 { face, set, data } => {
                self.fanout.faces.for_each(|l| l.image2(face, set, &data));
            }
            ServerCommandData::Anim { num, flags, faces } => {
                self.fanout.faces.for_each(|l| l.animation(num, flags, &faces));
            }
            ServerCommandData::Smooth { face, smooth_pic } => {
                self.fanout.faces.for_each(|l| l.smooth(face, smooth_pic));
            }
            ServerCommandData::Comc { packet_no, time } => {
                self.fanout.comc.for_each(|l| l.comc(packet_no, time));
            }
            ServerCommandData::Tick { tick_no } => {
                self.fanout.tick.for_each(|l| l.tick(tick_no));
            }
            ServerCommandData::Goodbye => {
                self.disconnect("server closed the connection");
            }
            ServerCommandData::Failure { command, message } => {
                log::warn!("server rejected {command}: {message}");
                self.fanout.failure.for_each(|l| l.failure(&command, &message));
            }
            ServerCommandData::AddmeSuccess => {
                let current = self.state();
                if current != ConnectionState::Addme && current != ConnectionState::AccountInfo {
                    log::warn!("addme_success in state {current:?}");
                }
                self.set_state(ConnectionState::Connected);
                if let Some(v) = self.num_look_objects.begin() {
                    self.send_or_disconnect(
                        self.writer
                            .send_setup(&[("num_look_objects", &v.to_string())]),
                    );
                }
            }
            ServerCommandData::AddmeFailed => {
                log::warn!("login rejected by server");
                self.fanout
                    .failure
                    .for_each(|l| l.failure("addme", "login rejected by server"));
            }
            ServerCommandData::AccountPlayers { count, characters } => {
                self.fanout.account.for_each(|l| l.account_players_start(count));
                for info in &characters {
                    self.fanout.account.for_each(|l| l.account_player(info));
                }
                self.fanout.account.for_each(|l| l.account_players_end());
            }
            ServerCommandData::NewMap => {
                self.fanout.map.for_each(|l| l.new_map());
            }
            ServerCommandData::Map2(commands) => {
                self.dispatch_map2(&commands);
            }
            ServerCommandData::Ignored(cmd) => {
                log::debug!("not processing {}", cmd.literal());
            }
        }
        Ok(())
    }

    /// Delivers one map2 packet's tile updates inside a begin/end bracket
    /// so listeners can treat the whole packet as one atomic view change.
    fn dispatch_map2(&self, commands: &[Map2Command]) {
        let map = &self.fanout.map;
        map.for_each(|l| l.map_begin());
        for command in commands {
            match command {
                Map2Command::Scroll { dx, dy } => {
                    map.for_each(|l| l.map_scroll(*dx, *dy));
                }
                Map2Command::Coordinate { x, y, updates } => {
                    for update in updates {
                        match update {
                            TileUpdate::Clear => map.for_each(|l| l.map_clear(*x, *y)),
                            TileUpdate::Darkness(darkness) => {
                                map.for_each(|l| l.map_darkness(*x, *y, *darkness));
                            }
                            TileUpdate::Face {
                                layer,
                                face,
                                anim_speed,
                                smooth,
                            } => {
                                let location = Location {
                                    x: *x,
                                    y: *y,
                                    layer: *layer,
                                };
                                map.for_each(|l| l.map_face(location, *face));
                                // An absent smooth byte means no smoothing.
                                map.for_each(|l| l.map_smooth(location, smooth.unwrap_or(0)));
                                if let Some(speed) = anim_speed {
                                    map.for_each(|l| l.map_animation_speed(location, *speed));
                                }
                            }
                            TileUpdate::Animation {
                                layer,
                                animation,
                                animation_type,
                                anim_speed,
                                smooth,
                            } => {
                                let location = Location {
                                    x: *x,
                                    y: *y,
                                    layer: *layer,
                                };
                                map.for_each(|l| {
                                    l.map_animation(location, *animation, *animation_type);
                                });
                                if let Some(speed) = anim_speed {
                                    map.for_each(|l| l.map_animation_speed(location, *speed));
                                }
                                if let Some(smooth) = smooth {
                                    map.for_each(|l| l.map_smooth(location, *smooth));
                                }
                            }
                        }
                    }
                }
            }
        }
        map.for_each(|l| l.map_end());
    }

    fn process_version(
        &self,
        cs_version: u32,
        sc_version: u32,
        info: &str,
    ) -> Result<(), ProtocolError> {
        log::info!("server {info}, versions cs={cs_version} sc={sc_version}");
        if cs_version != VERSION_CS {
            log::warn!("server expects cs version {cs_version}, this client speaks {VERSION_CS}");
        }
        self.advance(ConnectionState::Version, ConnectionState::Setup);
        self.send_or_disconnect(self.writer.send_version(VERSION_CS, VERSION_SC, CLIENT_INFO));
        self.send_or_disconnect(self.writer.send_setup(&[
            ("spellmon", "1"),
            ("tick", "1"),
            ("map2cmd", "1"),
            ("newmapcmd", "1"),
            ("facecache", "1"),
            ("extendedTextInfos", "1"),
            ("itemcmd", "2"),
            ("exp64", "1"),
            ("darkness", "1"),
            ("sound2", "3"),
            ("want_pickup", "1"),
            ("extended_stats", "1"),
            ("notifications", "2"),
            ("loginmethod", "2"),
        ]));
        // setup may be sent from here on; negotiate the map size if the
        // preferred size differs from the default.
        if let Some((w, h)) = self.map_size.begin() {
            self.send_or_disconnect(self.send_mapsize_request(w, h));
        }
        Ok(())
    }

    fn process_setup(&self, options: &[(String, String)]) -> Result<(), ProtocolError> {
        for (name, value) in options {
            match name.as_str() {
                "mapsize" => {
                    let (width, height) = parse_mapsize(value)?;
                    if let Some((w, h)) = self.map_size.process_ack(width, height) {
                        self.send_or_disconnect(self.send_mapsize_request(w, h));
                    }
                }
                "num_look_objects" => {
                    if value == "FALSE" {
                        log::warn!("the server does not support num_look_objects");
                        self.num_look_objects.ack_failed();
                    } else {
                        let parsed = value.parse::<u16>().map_err(|_| {
                            ProtocolError::unparseable(
                                "setup",
                                format!("invalid num_look_objects value {value:?}"),
                                value.as_bytes(),
                            )
                        })?;
                        if let Some(v) = self.num_look_objects.process_ack(parsed) {
                            self.send_or_disconnect(
                                self.writer
                                    .send_setup(&[("num_look_objects", &v.to_string())]),
                            );
                        }
                    }
                }
                "spellmon" => require_setup_value(name, value, "1")?,
                "newmapcmd" => require_setup_value(name, value, "1")?,
                "facecache" => require_setup_value(name, value, "1")?,
                "extendedTextInfos" => require_setup_value(name, value, "1")?,
                "tick" => require_setup_value(name, value, "1")?,
                "map2cmd" => require_setup_value(name, value, "1")?,
                "itemcmd" => require_setup_value(name, value, "2")?,
                "loginmethod" => {
                    let method = if value == "FALSE" {
                        0
                    } else {
                        match value.parse::<u8>() {
                            Ok(m @ 0..=2) => m,
                            _ => {
                                return Err(ProtocolError::unparseable(
                                    "setup",
                                    format!("invalid loginmethod value {value:?}"),
                                    value.as_bytes(),
                                ));
                            }
                        }
                    };
                    self.login_method.store(method, Ordering::SeqCst);
                }
                "sound2" | "exp64" | "darkness" | "faceset" | "want_pickup"
                | "extended_stats" | "notifications" => {}
                other => log::warn!("ignoring server acknowledgement for setup option {other}"),
            }
        }

        // A lone mapsize or num_look_objects pair is a renegotiation
        // answer, not the handshake acknowledgement.
        let renegotiation_only = options.len() == 1
            && matches!(options[0].0.as_str(), "mapsize" | "num_look_objects");
        if !renegotiation_only {
            self.advance(ConnectionState::Setup, ConnectionState::RequestInfo);
            {
                let mut pending = self
                    .pending_replyinfos
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                pending.clear();
                pending.extend(
                    REQUESTINFOS
                        .iter()
                        .map(|request| request.split(' ').next().unwrap_or(request)),
                );
            }
            for request in REQUESTINFOS {
                self.send_or_disconnect(self.writer.send_requestinfo(request));
            }
            self.send_or_disconnect(
                self.writer
                    .send_toggleextendedtext(&(1..=13).collect::<Vec<u32>>()),
            );
        }
        Ok(())
    }

    fn process_replyinfo(
        &self,
        info_type: &str,
        data: ReplyinfoData,
    ) -> Result<(), ProtocolError> {
        match data {
            ReplyinfoData::ExpTable { levels } => {
                *self
                    .experience_table
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = levels;
            }
            ReplyinfoData::KnowledgeInfo { entries } => {
                for entry in &entries {
                    self.fanout.knowledge.for_each(|l| {
                        l.knowledge_info(
                            &entry.knowledge_type,
                            &entry.name,
                            entry.face,
                            entry.can_attempt,
                        );
                    });
                }
            }
            other => log::debug!("received replyinfo {info_type}: {other:?}"),
        }

        let all_answered = {
            let mut pending = self
                .pending_replyinfos
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            pending.retain(|p| *p != info_type);
            pending.is_empty()
        };
        if all_answered && self.state() == ConnectionState::RequestInfo {
            if self.login_method.load(Ordering::SeqCst) > 0 {
                self.advance(ConnectionState::RequestInfo, ConnectionState::AccountInfo);
            } else {
                self.advance(ConnectionState::RequestInfo, ConnectionState::Addme);
                self.send_or_disconnect(self.writer.send_addme());
            }
        }
        Ok(())
    }

    fn send_or_disconnect(&self, result: io::Result<()>) {
        if let Err(e) = result {
            self.disconnect(&format!("send failed: {e}"));
        }
    }
}

/// Parses a `WxH` map size value.
fn parse_mapsize(value: &str) -> Result<(u16, u16), ProtocolError> {
    let parsed = value
        .split_once('x')
        .and_then(|(w, h)| Some((w.parse::<u16>().ok()?, h.parse::<u16>().ok()?)));
    parsed.ok_or_else(|| {
        ProtocolError::unparseable(
            "setup",
            format!("invalid mapsize value {value:?}"),
            value.as_bytes(),
        )
    })
}

fn require_setup_value(name: &str, value: &str, expected: &str) -> Result<(), ProtocolError> {
    if value != expected {
        return Err(ProtocolError::unparseable(
            "setup",
            format!("the server requires {name}={value}, this client needs {name}={expected}"),
            value.as_bytes(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::listeners::{ConnectionListener, MapListener};

    #[derive(Default)]
    struct RecordingSink {
        packets: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingSink {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.packets.lock().unwrap())
                .into_iter()
                .map(|p| String::from_utf8_lossy(&p).into_owned())
                .collect()
        }
    }

    impl PacketSink for RecordingSink {
        fn send_packet(&self, packet: &[u8]) -> io::Result<()> {
            self.packets.lock().unwrap().push(packet.to_vec());
            Ok(())
        }
    }

    fn connection(
        preferred_map_size: (u16, u16),
    ) -> (ServerConnection, Arc<RecordingSink>, Arc<EventFanout>) {
        let sink = Arc::new(RecordingSink::default());
        let fanout = Arc::new(EventFanout::new());
        let conn = ServerConnection::new(sink.clone(), fanout.clone(), preferred_map_size, 50);
        conn.set_state(ConnectionState::Version);
        (conn, sink, fanout)
    }

    /// Drives the handshake up to the requestinfo phase.
    fn handshake(conn: &ServerConnection) {
        conn.handle_packet(b"version 1023 1027 test server").unwrap();
        conn.handle_packet(
            b"setup spellmon 1 tick 1 map2cmd 1 newmapcmd 1 facecache 1 \
              extendedTextInfos 1 itemcmd 2 exp64 1 darkness 1 sound2 3 \
              want_pickup 1 extended_stats 1 notifications 2 loginmethod 0",
        )
        .unwrap();
    }

    #[test]
    fn version_triggers_version_and_setup_replies() {
        let (conn, sink, _fanout) = connection((17, 13));
        conn.handle_packet(b"version 1023 1027 test server").unwrap();

        let sent = sink.take();
        assert!(sent[0].starts_with("version 1023 1027 "));
        assert!(sent[1].contains("spellmon 1"));
        assert!(sent[1].contains("loginmethod 2"));
        assert_eq!(sent[2], "setup mapsize 17x13");
        assert_eq!(conn.state(), ConnectionState::Setup);
    }

    #[test]
    fn default_map_size_sends_no_mapsize_request() {
        let (conn, sink, _fanout) = connection((11, 11));
        conn.handle_packet(b"version 1023 1027 test server").unwrap();
        assert!(sink.take().iter().all(|p| !p.contains("mapsize")));
    }

    #[test]
    fn setup_ack_advances_to_requestinfo_and_requests_static_info() {
        let (conn, sink, _fanout) = connection((11, 11));
        handshake(&conn);

        assert_eq!(conn.state(), ConnectionState::RequestInfo);
        let sent = sink.take();
        for request in REQUESTINFOS {
            assert!(
                sent.iter().any(|p| p == &format!("requestinfo {request}")),
                "missing requestinfo {request}"
            );
        }
        assert!(sent.iter().any(|p| p.starts_with("toggleextendedtext ")));
    }

    #[test]
    fn lone_mapsize_ack_does_not_advance_the_handshake() {
        let (conn, sink, _fanout) = connection((17, 13));
        conn.handle_packet(b"version 1023 1027 test server").unwrap();
        sink.take();

        conn.handle_packet(b"setup mapsize 15x11").unwrap();
        assert_eq!(conn.state(), ConnectionState::Setup);
        // Both dimensions were clamped; the negotiator retries with the
        // clamped size.
        assert_eq!(sink.take(), vec!["setup mapsize 15x11".to_string()]);
    }

    #[test]
    fn map_size_settles_before_login_completes() {
        let (conn, sink, _fanout) = connection((17, 13));
        conn.handle_packet(b"version 1023 1027 test server").unwrap();
        sink.take();

        // The server clamps to 15x11 every time; after the exact match
        // and one probe toward the preferred size the negotiation is
        // settled while the handshake is still in the setup phase.
        conn.handle_packet(b"setup mapsize 15x11").unwrap();
        conn.handle_packet(b"setup mapsize 15x11").unwrap();
        conn.handle_packet(b"setup mapsize 15x11").unwrap();

        assert_eq!(conn.state(), ConnectionState::Setup);
        assert_eq!(conn.wait_for_map_size(), Ok((15, 11)));
    }

    #[test]
    fn rejected_spellmon_is_fatal() {
        let (conn, _sink, _fanout) = connection((11, 11));
        conn.handle_packet(b"version 1023 1027 test server").unwrap();
        assert!(conn.handle_packet(b"setup spellmon FALSE").is_err());
    }

    #[test]
    fn bad_mapsize_ack_is_fatal() {
        let (conn, _sink, _fanout) = connection((17, 13));
        conn.handle_packet(b"version 1023 1027 test server").unwrap();
        assert!(conn.handle_packet(b"setup mapsize bogus").is_err());
    }

    #[test]
    fn classic_login_walks_to_connected() {
        let (conn, sink, _fanout) = connection((11, 11));
        handshake(&conn);
        sink.take();

        // Answer every requestinfo; the last answer triggers addme.
        let mut exp_table = b"replyinfo exp_table\n".to_vec();
        exp_table.extend_from_slice(&2u16.to_be_bytes());
        exp_table.extend_from_slice(&500u64.to_be_bytes());
        conn.handle_packet(&exp_table).unwrap();
        conn.handle_packet(b"replyinfo skill_info\n140:lockpicking\n").unwrap();
        conn.handle_packet(b"replyinfo knowledge_info\n").unwrap();
        conn.handle_packet(b"replyinfo image_info\n1\nbase:base set\n").unwrap();
        conn.handle_packet(b"replyinfo startingmap\n").unwrap();
        conn.handle_packet(b"replyinfo race_list\n|human").unwrap();
        conn.handle_packet(b"replyinfo class_list\n|barbarian").unwrap();
        assert_eq!(conn.state(), ConnectionState::RequestInfo);
        conn.handle_packet(b"replyinfo newcharinfo\nV points 115\n").unwrap();

        assert_eq!(conn.state(), ConnectionState::Addme);
        assert_eq!(sink.take(), vec!["addme".to_string()]);
        assert_eq!(conn.experience_table(), vec![500]);

        conn.handle_packet(b"addme_success").unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[derive(Default)]
    struct RecordingMap {
        events: Mutex<Vec<String>>,
    }

    impl MapListener for RecordingMap {
        fn map_begin(&self) {
            self.events.lock().unwrap().push("begin".to_string());
        }
        fn map_clear(&self, x: i32, y: i32) {
            self.events.lock().unwrap().push(format!("clear {x},{y}"));
        }
        fn map_face(&self, location: Location, face: u16) {
            self.events
                .lock()
                .unwrap()
                .push(format!("face {},{},{} {face}", location.x, location.y, location.layer));
        }
        fn map_smooth(&self, location: Location, smooth: u8) {
            self.events
                .lock()
                .unwrap()
                .push(format!("smooth {},{},{} {smooth}", location.x, location.y, location.layer));
        }
        fn map_end(&self) {
            self.events.lock().unwrap().push("end".to_string());
        }
    }

    #[test]
    fn map2_updates_are_bracketed_by_begin_and_end() {
        let (conn, _sink, fanout) = connection((11, 11));
        let listener = Arc::new(RecordingMap::default());
        fanout.map.add(listener.clone());

        // One coordinate at view center: clear, then a face on layer 0.
        let mut packet = b"map2 ".to_vec();
        packet.extend_from_slice(&[0x3c, 0xf0]); // x=0, y=0, coordinate
        packet.push(0x00); // clear, len 0
        packet.extend_from_slice(&[0x50, 0x00, 0x2a]); // layer 0 face, len 2
        packet.push(0xff);
        conn.handle_packet(&packet).unwrap();

        assert_eq!(
            *listener.events.lock().unwrap(),
            vec![
                "begin".to_string(),
                "clear 0,0".to_string(),
                "face 0,0,0 42".to_string(),
                "smooth 0,0,0 0".to_string(),
                "end".to_string(),
            ]
        );
    }

    #[derive(Default)]
    struct RecordingConnectionListener {
        states: Mutex<Vec<ConnectionState>>,
        disconnects: Mutex<Vec<String>>,
    }

    impl ConnectionListener for RecordingConnectionListener {
        fn state_changed(&self, state: ConnectionState) {
            self.states.lock().unwrap().push(state);
        }
        fn disconnected(&self, reason: &str) {
            self.disconnects.lock().unwrap().push(reason.to_string());
        }
    }

    #[test]
    fn out_of_order_addme_success_still_connects() {
        let (conn, _sink, _fanout) = connection((11, 11));
        // Some servers batch handshake replies; a premature verdict is
        // tolerated with a warning.
        conn.handle_packet(b"addme_success").unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[test]
    fn goodbye_fires_disconnect_once() {
        let (conn, _sink, fanout) = connection((11, 11));
        let listener = Arc::new(RecordingConnectionListener::default());
        fanout.connection.add(listener.clone());

        conn.handle_packet(b"goodbye").unwrap();
        conn.handle_packet(b"goodbye").unwrap();
        assert_eq!(listener.disconnects.lock().unwrap().len(), 1);
    }

    #[test]
    fn connection_lost_during_handshake_marks_the_attempt_failed() {
        let (conn, _sink, fanout) = connection((11, 11));
        let listener = Arc::new(RecordingConnectionListener::default());
        fanout.connection.add(listener.clone());

        conn.handle_packet(b"version 1023 1027 test server").unwrap();
        conn.handle_packet(b"goodbye").unwrap();

        assert_eq!(conn.state(), ConnectionState::ConnectFailed);
        assert!(listener
            .states
            .lock()
            .unwrap()
            .contains(&ConnectionState::ConnectFailed));
        assert_eq!(listener.disconnects.lock().unwrap().len(), 1);
    }

    #[test]
    fn empty_payload_notifies_packet_watchers() {
        use crate::network::listeners::PacketWatcher;
        use crate::network::server_commands::ServerCommandType;

        #[derive(Default)]
        struct Watcher {
            empties: Mutex<Vec<ServerCommandType>>,
        }
        impl PacketWatcher for Watcher {
            fn empty_command(&self, command: ServerCommandType) {
                self.empties.lock().unwrap().push(command);
            }
        }

        let (conn, _sink, fanout) = connection((11, 11));
        let watcher = Arc::new(Watcher::default());
        fanout.packet_watchers.add(watcher.clone());

        conn.handle_packet(b"tick").unwrap();
        assert_eq!(*watcher.empties.lock().unwrap(), vec![ServerCommandType::Tick]);
    }
}
