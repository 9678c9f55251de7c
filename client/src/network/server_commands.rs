//! Classification and decoding of inbound server command packets.
//!
//! Each packet starts with a literal ASCII command name. Classification
//! compares byte-for-byte against a fixed table; a divergence anywhere falls
//! through to the unrecognized-command path without consuming beyond the
//! mismatch. The decoded payload is returned as one `ServerCommandData`
//! variant.

use cf_core::byte_operations::PacketReader;
use cf_core::constants::{
    CS_STAT_ARMOUR, CS_STAT_EXP, CS_STAT_EXP64, CS_STAT_FLAGS, CS_STAT_FOOD,
    CS_STAT_GOLEM_MAXHP, CS_STAT_HP, CS_STAT_POW, CS_STAT_RACE_STR, CS_STAT_RANGE,
    CS_STAT_RESIST_START, CS_STAT_SKILLINFO, CS_STAT_SPELL_ATTUNE, CS_STAT_SPELL_DENY,
    CS_STAT_SPEED, CS_STAT_TITLE, CS_STAT_WEAP_SP, CS_STAT_WEIGHT_LIM, CS_NUM_SKILLS,
    RESIST_TYPES, UpdItemFlags, UpdSpellFlags,
};
use cf_core::error::ProtocolError;

use crate::network::map2::{self, Map2Command};
use crate::network::replyinfo::{self, ReplyinfoData};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerCommandType {
    AccountPlayers,
    AddKnowledge,
    AddmeFailed,
    AddmeSuccess,
    AddQuest,
    AddSpell,
    Anim,
    Comc,
    DelInv,
    DelItem,
    DelSpell,
    DrawExtInfo,
    DrawInfo,
    ExtendedInfoSet,
    ExtendedTextSet,
    Face2,
    Failure,
    Goodbye,
    Image2,
    Item2,
    Map2,
    MapExtended,
    Music,
    NewMap,
    Pickup,
    Player,
    Query,
    Replyinfo,
    Setup,
    Smooth,
    Sound,
    Sound2,
    Stats,
    Tick,
    UpdItem,
    UpdQuest,
    UpdSpell,
    Version,
}

impl ServerCommandType {
    /// The on-wire command name.
    pub fn literal(self) -> &'static str {
        match self {
            ServerCommandType::AccountPlayers => "accountplayers",
            ServerCommandType::AddKnowledge => "addknowledge",
            ServerCommandType::AddmeFailed => "addme_failed",
            ServerCommandType::AddmeSuccess => "addme_success",
            ServerCommandType::AddQuest => "addquest",
            ServerCommandType::AddSpell => "addspell",
            ServerCommandType::Anim => "anim",
            ServerCommandType::Comc => "comc",
            ServerCommandType::DelInv => "delinv",
            ServerCommandType::DelItem => "delitem",
            ServerCommandType::DelSpell => "delspell",
            ServerCommandType::DrawExtInfo => "drawextinfo",
            ServerCommandType::DrawInfo => "drawinfo",
            ServerCommandType::ExtendedInfoSet => "ExtendedInfoSet",
            ServerCommandType::ExtendedTextSet => "ExtendedTextSet",
            ServerCommandType::Face2 => "face2",
            ServerCommandType::Failure => "failure",
            ServerCommandType::Goodbye => "goodbye",
            ServerCommandType::Image2 => "image2",
            ServerCommandType::Item2 => "item2",
            ServerCommandType::Map2 => "map2",
            ServerCommandType::MapExtended => "mapextended",
            ServerCommandType::Music => "music",
            ServerCommandType::NewMap => "newmap",
            ServerCommandType::Pickup => "pickup",
            ServerCommandType::Player => "player",
            ServerCommandType::Query => "query",
            ServerCommandType::Replyinfo => "replyinfo",
            ServerCommandType::Setup => "setup",
            ServerCommandType::Smooth => "smooth",
            ServerCommandType::Sound => "sound",
            ServerCommandType::Sound2 => "sound2",
            ServerCommandType::Stats => "stats",
            ServerCommandType::Tick => "tick",
            ServerCommandType::UpdItem => "upditem",
            ServerCommandType::UpdQuest => "updquest",
            ServerCommandType::UpdSpell => "updspell",
            ServerCommandType::Version => "version",
        }
    }

    /// Whether this command never carries a payload: the literal must be
    /// the whole packet.
    fn is_bare(self) -> bool {
        matches!(
            self,
            ServerCommandType::AddmeFailed
                | ServerCommandType::AddmeSuccess
                | ServerCommandType::Goodbye
                | ServerCommandType::NewMap
        )
    }
}

const COMMAND_TABLE: &[ServerCommandType] = &[
    ServerCommandType::AccountPlayers,
    ServerCommandType::AddKnowledge,
    ServerCommandType::AddmeFailed,
    ServerCommandType::AddmeSuccess,
    ServerCommandType::AddQuest,
    ServerCommandType::AddSpell,
    ServerCommandType::Anim,
    ServerCommandType::Comc,
    ServerCommandType::DelInv,
    ServerCommandType::DelItem,
    ServerCommandType::DelSpell,
    ServerCommandType::DrawExtInfo,
    ServerCommandType::DrawInfo,
    ServerCommandType::ExtendedInfoSet,
    ServerCommandType::ExtendedTextSet,
    ServerCommandType::Face2,
    ServerCommandType::Failure,
    ServerCommandType::Goodbye,
    ServerCommandType::Image2,
    ServerCommandType::Item2,
    ServerCommandType::Map2,
    ServerCommandType::MapExtended,
    ServerCommandType::Music,
    ServerCommandType::NewMap,
    ServerCommandType::Pickup,
    ServerCommandType::Player,
    ServerCommandType::Query,
    ServerCommandType::Replyinfo,
    ServerCommandType::Setup,
    ServerCommandType::Smooth,
    ServerCommandType::Sound,
    ServerCommandType::Sound2,
    ServerCommandType::Stats,
    ServerCommandType::Tick,
    ServerCommandType::UpdItem,
    ServerCommandType::UpdQuest,
    ServerCommandType::UpdSpell,
    ServerCommandType::Version,
];

/// The result of matching a packet's leading bytes against the command
/// table.
#[derive(Debug, PartialEq, Eq)]
pub enum Classification<'a> {
    /// Known command followed by a separator and its payload bytes.
    Payload(ServerCommandType, &'a [u8]),
    /// Known command, but the packet ends right after the literal where a
    /// separator/payload was expected.
    EmptyPayload(ServerCommandType),
    /// No literal matches.
    Unknown,
}

/// Matches the packet against the literal table. Case-sensitive; no
/// allocation.
pub fn classify(packet: &[u8]) -> Classification<'_> {
    for &command in COMMAND_TABLE {
        let literal = command.literal().as_bytes();
        if !packet.starts_with(literal) {
            continue;
        }
        if command.is_bare() {
            if packet.len() == literal.len() {
                return Classification::Payload(command, &[]);
            }
            continue;
        }
        if packet.len() == literal.len() {
            return Classification::EmptyPayload(command);
        }
        if packet[literal.len()] == b' ' {
            return Classification::Payload(command, &packet[literal.len() + 1..]);
        }
    }
    Classification::Unknown
}

/// Extracts the leading printable-ASCII run for diagnostics about a packet
/// that matched no literal.
fn command_prefix(packet: &[u8]) -> String {
    let end = packet
        .iter()
        .position(|&b| b <= 0x20 || b >= 0x80)
        .unwrap_or(packet.len());
    String::from_utf8_lossy(&packet[..end]).into_owned()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatUpdate {
    Int2 { stat: u8, value: i16 },
    Int4 { stat: u8, value: i32 },
    Int8 { stat: u8, value: i64 },
    Text { stat: u8, value: String },
    Resist { stat: u8, value: i16 },
    Skill { stat: u8, level: u8, experience: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub tag: u32,
    pub flags: u32,
    pub weight: u32,
    pub face: u32,
    pub name: String,
    pub name_pl: String,
    pub anim: u16,
    pub anim_speed: u8,
    pub nrof: u32,
    pub item_type: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdItem {
    pub tag: u32,
    pub location: Option<u32>,
    pub flags: Option<u32>,
    pub weight: Option<u32>,
    pub face: Option<u32>,
    pub names: Option<(String, String)>,
    pub anim: Option<u16>,
    pub anim_speed: Option<u8>,
    pub nrof: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spell {
    pub tag: u32,
    pub level: i16,
    pub casting_time: i16,
    pub mana: i16,
    pub grace: i16,
    pub damage: i16,
    pub skill: u8,
    pub path: u32,
    pub face: u32,
    pub name: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdSpell {
    pub tag: u32,
    pub mana: Option<i16>,
    pub grace: Option<i16>,
    pub damage: Option<i16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quest {
    pub code: u32,
    pub title: String,
    pub face: u32,
    pub replay: bool,
    pub parent: u32,
    pub end: bool,
    pub step: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Knowledge {
    pub index: u32,
    pub knowledge_type: String,
    pub title: String,
    pub face: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CharacterInfo {
    pub name: String,
    pub class_name: String,
    pub race: String,
    pub level: u16,
    pub face: String,
    pub party: String,
    pub map: String,
    pub face_num: u16,
}

#[derive(Debug, PartialEq)]
pub enum ServerCommandData {
    /// A known command that arrived with a zero-length payload.
    Empty(ServerCommandType),
    Version {
        cs_version: u32,
        sc_version: u32,
        info: String,
    },
    Setup {
        options: Vec<(String, String)>,
    },
    Stats {
        updates: Vec<StatUpdate>,
    },
    Item2 {
        location: u32,
        items: Vec<Item>,
    },
    DelInv {
        tag: u32,
    },
    DelItem {
        tags: Vec<u32>,
    },
    UpdItem(UpdItem),
    Player {
        tag: u32,
        weight: u32,
        face: u32,
        name: String,
    },
    AddSpells {
        spells: Vec<Spell>,
    },
    UpdSpell(UpdSpell),
    DelSpell {
        tag: u32,
    },
    AddQuests {
        quests: Vec<Quest>,
    },
    UpdQuest {
        code: u32,
        end: bool,
        step: String,
    },
    AddKnowledge {
        entries: Vec<Knowledge>,
    },
    DrawInfo {
        color: u8,
        message: String,
    },
    DrawExtInfo {
        color: u8,
        message_type: u16,
        subtype: u16,
        message: String,
    },
    Query {
        flags: u8,
        text: String,
    },
    Sound {
        x: i8,
        y: i8,
        num: u16,
        sound_type: u8,
    },
    Sound2 {
        x: i8,
        y: i8,
        dir: i8,
        volume: u8,
        sound_type: u8,
        action: String,
        name: String,
    },
    Music {
        name: String,
    },
    Face2 {
        num: u16,
        set: u8,
        checksum: u32,
        name: String,
    },
    Image2 {
        face: u32,
        set: u8,
        data: Vec<u8>,
    },
    Anim {
        num: u16,
        flags: u16,
        faces: Vec<u16>,
    },
    Smooth {
        face: u16,
        smooth_pic: u16,
    },
    Comc {
        packet_no: u16,
        time: u32,
    },
    Tick {
        tick_no: u32,
    },
    Pickup {
        mode: u32,
    },
    Goodbye,
    Failure {
        command: String,
        message: String,
    },
    AddmeSuccess,
    AddmeFailed,
    AccountPlayers {
        count: u8,
        characters: Vec<CharacterInfo>,
    },
    NewMap,
    Map2(Vec<Map2Command>),
    Replyinfo {
        info_type: String,
        data: ReplyinfoData,
    },
    /// Commands the client acknowledges but does not act on.
    Ignored(ServerCommandType),
}

/// A decoded packet: the classified command plus its structured payload.
#[derive(Debug)]
pub struct ServerCommand {
    pub command: ServerCommandType,
    pub data: ServerCommandData,
}

impl ServerCommand {
    /// Classifies and decodes one length-deframed packet.
    pub fn from_packet(packet: &[u8]) -> Result<ServerCommand, ProtocolError> {
        match classify(packet) {
            Classification::Unknown => {
                Err(ProtocolError::unparseable(
                    &command_prefix(packet),
                    "no matching command literal",
                    packet,
                ))
            }
            Classification::EmptyPayload(command) => {
                log::debug!("recv {} with empty payload", command.literal());
                Ok(ServerCommand {
                    command,
                    data: ServerCommandData::Empty(command),
                })
            }
            Classification::Payload(command, payload) => {
                let data = decode(command, payload).map_err(|e| match e {
                    // Underflow inside a known command is a structural error
                    // of that command; keep the raw bytes for diagnostics.
                    ProtocolError::Truncated { .. }
                    | ProtocolError::BadDigit(_)
                    | ProtocolError::DecimalOverflow(_) => {
                        ProtocolError::unparseable(command.literal(), e, packet)
                    }
                    other => other,
                })?;
                Ok(ServerCommand { command, data })
            }
        }
    }
}

fn decode(command: ServerCommandType, payload: &[u8]) -> Result<ServerCommandData, ProtocolError> {
    let mut r = PacketReader::new(payload);
    let data = match command {
        ServerCommandType::Version => {
            let cs_version = r.get_ascii_int(Some(b' '))? as u32;
            let sc_version = r.get_ascii_int(Some(b' '))? as u32;
            let info = r.get_remaining_string();
            ServerCommandData::Version {
                cs_version,
                sc_version,
                info,
            }
        }
        ServerCommandType::Setup => decode_setup(&mut r, payload)?,
        ServerCommandType::Stats => decode_stats(&mut r, payload)?,
        ServerCommandType::Item2 => decode_item2(&mut r)?,
        ServerCommandType::DelInv => ServerCommandData::DelInv {
            tag: r.get_ascii_int(None)? as u32,
        },
        ServerCommandType::DelItem => {
            let mut tags = Vec::new();
            while r.has_remaining() {
                tags.push(r.get_u32()?);
            }
            ServerCommandData::DelItem { tags }
        }
        ServerCommandType::UpdItem => decode_upditem(&mut r, payload)?,
        ServerCommandType::Player => {
            let tag = r.get_u32()?;
            let weight = r.get_u32()?;
            let face = r.get_u32()?;
            let name_len = r.get_u8()? as usize;
            let name = r.get_string(name_len)?;
            check_no_excess(&r, command, payload)?;
            ServerCommandData::Player {
                tag,
                weight,
                face,
                name,
            }
        }
        ServerCommandType::AddSpell => decode_addspell(&mut r)?,
        ServerCommandType::UpdSpell => decode_updspell(&mut r, payload)?,
        ServerCommandType::DelSpell => {
            let tag = r.get_u32()?;
            check_no_excess(&r, command, payload)?;
            ServerCommandData::DelSpell { tag }
        }
        ServerCommandType::AddQuest => decode_addquest(&mut r)?,
        ServerCommandType::UpdQuest => {
            let code = r.get_u32()?;
            let end = r.get_u8()? != 0;
            let step_len = r.get_u16()? as usize;
            let step = r.get_string(step_len)?;
            check_no_excess(&r, command, payload)?;
            ServerCommandData::UpdQuest { code, end, step }
        }
        ServerCommandType::AddKnowledge => {
            let mut entries = Vec::new();
            while r.has_remaining() {
                let index = r.get_u32()?;
                let type_len = r.get_u16()? as usize;
                let knowledge_type = r.get_string(type_len)?;
                let title_len = r.get_u16()? as usize;
                let title = r.get_string(title_len)?;
                let face = r.get_u32()?;
                entries.push(Knowledge {
                    index,
                    knowledge_type,
                    title,
                    face,
                });
            }
            ServerCommandData::AddKnowledge { entries }
        }
        ServerCommandType::DrawInfo => {
            let color = r.get_ascii_int(Some(b' '))? as u8;
            let message = r.get_remaining_string();
            ServerCommandData::DrawInfo { color, message }
        }
        ServerCommandType::DrawExtInfo => {
            let color = r.get_ascii_int(Some(b' '))? as u8;
            let message_type = r.get_ascii_int(Some(b' '))? as u16;
            let subtype = r.get_ascii_int(Some(b' '))? as u16;
            let message = r.get_remaining_string();
            ServerCommandData::DrawExtInfo {
                color,
                message_type,
                subtype,
                message,
            }
        }
        ServerCommandType::Query => {
            let flags = r.get_ascii_int(Some(b' '))? as u8;
            let text = r.get_remaining_string();
            ServerCommandData::Query { flags, text }
        }
        ServerCommandType::Sound => {
            let x = r.get_i8()?;
            let y = r.get_i8()?;
            let num = r.get_u16()?;
            let sound_type = r.get_u8()?;
            check_no_excess(&r, command, payload)?;
            ServerCommandData::Sound {
                x,
                y,
                num,
                sound_type,
            }
        }
        ServerCommandType::Sound2 => {
            let x = r.get_i8()?;
            let y = r.get_i8()?;
            let dir = r.get_i8()?;
            let volume = r.get_u8()?;
            let sound_type = r.get_u8()?;
            let action_len = r.get_u8()? as usize;
            let action = r.get_string(action_len)?;
            let name_len = r.get_u8()? as usize;
            let name = r.get_string(name_len)?;
            check_no_excess(&r, command, payload)?;
            ServerCommandData::Sound2 {
                x,
                y,
                dir,
                volume,
                sound_type,
                action,
                name,
            }
        }
        ServerCommandType::Music => ServerCommandData::Music {
            name: r.get_remaining_string(),
        },
        ServerCommandType::Face2 => {
            let num = r.get_u16()?;
            let set = r.get_u8()?;
            let checksum = r.get_u32()?;
            let name = r.get_remaining_string();
            ServerCommandData::Face2 {
                num,
                set,
                checksum,
                name,
            }
        }
        ServerCommandType::Image2 => {
            let face = r.get_u32()?;
            let set = r.get_u8()?;
            let len = r.get_u32()? as usize;
            if len != r.remaining() {
                return Err(ProtocolError::unparseable(
                    command.literal(),
                    format!("image length {len} does not match {} payload bytes", r.remaining()),
                    payload,
                ));
            }
            let data = r.get_bytes(len)?.to_vec();
            ServerCommandData::Image2 { face, set, data }
        }
        ServerCommandType::Anim => {
            let num = r.get_u16()?;
            if num & !cf_core::constants::ANIM_MASK != 0 {
                return Err(ProtocolError::unparseable(
                    command.literal(),
                    format!("invalid animation id {num}"),
                    payload,
                ));
            }
            let flags = r.get_u16()?;
            let mut faces = Vec::new();
            while r.has_remaining() {
                faces.push(r.get_u16()?);
            }
            ServerCommandData::Anim { num, flags, faces }
        }
        ServerCommandType::Smooth => {
            let face = r.get_u16()?;
            let smooth_pic = r.get_u16()?;
            check_no_excess(&r, command, payload)?;
            ServerCommandData::Smooth { face, smooth_pic }
        }
        ServerCommandType::Comc => {
            let packet_no = r.get_u16()?;
            let time = r.get_u32()?;
            check_no_excess(&r, command, payload)?;
            ServerCommandData::Comc { packet_no, time }
        }
        ServerCommandType::Tick => {
            let tick_no = r.get_u32()?;
            check_no_excess(&r, command, payload)?;
            ServerCommandData::Tick { tick_no }
        }
        ServerCommandType::Pickup => {
            let mode = r.get_u32()?;
            check_no_excess(&r, command, payload)?;
            ServerCommandData::Pickup { mode }
        }
        ServerCommandType::Goodbye => {
            check_no_excess(&r, command, payload)?;
            ServerCommandData::Goodbye
        }
        ServerCommandType::Failure => {
            let command_name = r.get_string_delim(b' ');
            let message = r.get_remaining_string();
            ServerCommandData::Failure {
                command: command_name,
                message,
            }
        }
        ServerCommandType::AddmeSuccess => ServerCommandData::AddmeSuccess,
        ServerCommandType::AddmeFailed => ServerCommandData::AddmeFailed,
        ServerCommandType::AccountPlayers => decode_accountplayers(&mut r, payload)?,
        ServerCommandType::NewMap => ServerCommandData::NewMap,
        ServerCommandType::Map2 => ServerCommandData::Map2(map2::decode_map2(payload)?),
        ServerCommandType::Replyinfo => {
            let info_type = r.get_string_delim(b'\n');
            let data = replyinfo::decode_replyinfo(&info_type, &mut r)?;
            ServerCommandData::Replyinfo { info_type, data }
        }
        ServerCommandType::MapExtended
        | ServerCommandType::ExtendedInfoSet
        | ServerCommandType::ExtendedTextSet => {
            log::debug!("ignoring {} command", command.literal());
            ServerCommandData::Ignored(command)
        }
    };
    Ok(data)
}

fn check_no_excess(
    r: &PacketReader<'_>,
    command: ServerCommandType,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    if r.has_remaining() {
        return Err(ProtocolError::unparseable(
            command.literal(),
            format!("excess data at end of {} command", command.literal()),
            payload,
        ));
    }
    Ok(())
}

/// `setup` payloads are space-separated name/value token pairs.
fn decode_setup(
    r: &mut PacketReader<'_>,
    payload: &[u8],
) -> Result<ServerCommandData, ProtocolError> {
    let mut tokens = Vec::new();
    while r.has_remaining() {
        while r.peek() == Some(b' ') {
            let _ = r.get_u8();
        }
        if !r.has_remaining() {
            break;
        }
        tokens.push(r.get_string_delim(b' '));
    }
    if tokens.len() % 2 != 0 {
        return Err(ProtocolError::unparseable(
            "setup",
            "odd number of arguments in setup command",
            payload,
        ));
    }
    let options = tokens
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect();
    Ok(ServerCommandData::Setup { options })
}

fn decode_stats(
    r: &mut PacketReader<'_>,
    payload: &[u8],
) -> Result<ServerCommandData, ProtocolError> {
    let mut updates = Vec::new();
    while r.has_remaining() {
        let stat = r.get_u8()?;
        let update = match stat {
            s if (CS_STAT_RESIST_START..CS_STAT_RESIST_START + RESIST_TYPES).contains(&s) => {
                StatUpdate::Resist {
                    stat: s,
                    value: r.get_i16()?,
                }
            }
            s if (CS_STAT_SKILLINFO..CS_STAT_SKILLINFO + CS_NUM_SKILLS).contains(&s) => {
                StatUpdate::Skill {
                    stat: s,
                    level: r.get_u8()?,
                    experience: r.get_u64()?,
                }
            }
            CS_STAT_EXP | CS_STAT_SPEED | CS_STAT_WEAP_SP | CS_STAT_WEIGHT_LIM => {
                StatUpdate::Int4 {
                    stat,
                    value: r.get_i32()?,
                }
            }
            s if (CS_STAT_SPELL_ATTUNE..=CS_STAT_SPELL_DENY).contains(&s) => StatUpdate::Int4 {
                stat,
                value: r.get_i32()?,
            },
            CS_STAT_EXP64 => StatUpdate::Int8 {
                stat,
                value: r.get_u64()? as i64,
            },
            CS_STAT_RANGE | CS_STAT_TITLE => {
                let len = r.get_u8()? as usize;
                StatUpdate::Text {
                    stat,
                    value: r.get_string(len)?,
                }
            }
            s if (CS_STAT_HP..=CS_STAT_ARMOUR).contains(&s)
                || s == CS_STAT_FOOD
                || (CS_STAT_POW..=CS_STAT_FLAGS).contains(&s)
                || (CS_STAT_RACE_STR..=CS_STAT_GOLEM_MAXHP).contains(&s) =>
            {
                StatUpdate::Int2 {
                    stat: s,
                    value: r.get_i16()?,
                }
            }
            _ => {
                return Err(ProtocolError::unparseable(
                    "stats",
                    format!("unknown stat id {stat}"),
                    payload,
                ));
            }
        };
        updates.push(update);
    }
    Ok(ServerCommandData::Stats { updates })
}

/// Splits the name field of an item: `name NUL name_pl` or just `name`.
fn split_item_names(raw: &[u8]) -> (String, String) {
    match raw.iter().position(|&b| b == 0) {
        Some(pos) => (
            String::from_utf8_lossy(&raw[..pos]).into_owned(),
            String::from_utf8_lossy(&raw[pos + 1..]).into_owned(),
        ),
        None => {
            let name = String::from_utf8_lossy(raw).into_owned();
            (name.clone(), name)
        }
    }
}

fn decode_item2(r: &mut PacketReader<'_>) -> Result<ServerCommandData, ProtocolError> {
    let location = r.get_u32()?;
    let mut items = Vec::new();
    while r.has_remaining() {
        let tag = r.get_u32()?;
        let flags = r.get_u32()?;
        let weight = r.get_u32()?;
        let face = r.get_u32()?;
        let name_len = r.get_u8()? as usize;
        let (name, name_pl) = split_item_names(r.get_bytes(name_len)?);
        let anim = r.get_u16()?;
        let anim_speed = r.get_u8()?;
        let nrof = r.get_u32()?;
        let item_type = r.get_u16()?;
        items.push(Item {
            tag,
            flags,
            weight,
            face,
            name,
            name_pl,
            anim,
            anim_speed,
            nrof,
            item_type,
        });
    }
    Ok(ServerCommandData::Item2 { location, items })
}

fn decode_upditem(
    r: &mut PacketReader<'_>,
    payload: &[u8],
) -> Result<ServerCommandData, ProtocolError> {
    let raw_flags = r.get_u8()?;
    let flags = UpdItemFlags::from_bits(raw_flags).ok_or_else(|| {
        ProtocolError::unparseable(
            "upditem",
            format!("invalid flags 0x{raw_flags:02x}"),
            payload,
        )
    })?;
    let tag = r.get_u32()?;
    let mut update = UpdItem {
        tag,
        location: None,
        flags: None,
        weight: None,
        face: None,
        names: None,
        anim: None,
        anim_speed: None,
        nrof: None,
    };
    if flags.contains(UpdItemFlags::LOCATION) {
        update.location = Some(r.get_u32()?);
    }
    if flags.contains(UpdItemFlags::FLAGS) {
        update.flags = Some(r.get_u32()?);
    }
    if flags.contains(UpdItemFlags::WEIGHT) {
        update.weight = Some(r.get_u32()?);
    }
    if flags.contains(UpdItemFlags::FACE) {
        update.face = Some(r.get_u32()?);
    }
    if flags.contains(UpdItemFlags::NAME) {
        let name_len = r.get_u8()? as usize;
        update.names = Some(split_item_names(r.get_bytes(name_len)?));
    }
    if flags.contains(UpdItemFlags::ANIM) {
        update.anim = Some(r.get_u16()?);
    }
    if flags.contains(UpdItemFlags::ANIM_SPEED) {
        update.anim_speed = Some(r.get_u8()?);
    }
    if flags.contains(UpdItemFlags::NROF) {
        update.nrof = Some(r.get_u32()?);
    }
    check_no_excess(r, ServerCommandType::UpdItem, payload)?;
    Ok(ServerCommandData::UpdItem(update))
}

fn decode_addspell(r: &mut PacketReader<'_>) -> Result<ServerCommandData, ProtocolError> {
    let mut spells = Vec::new();
    while r.has_remaining() {
        let tag = r.get_u32()?;
        let level = r.get_i16()?;
        let casting_time = r.get_i16()?;
        let mana = r.get_i16()?;
        let grace = r.get_i16()?;
        let damage = r.get_i16()?;
        let skill = r.get_u8()?;
        let path = r.get_u32()?;
        let face = r.get_u32()?;
        let name_len = r.get_u8()? as usize;
        let name = r.get_string(name_len)?;
        let message_len = r.get_u16()? as usize;
        let message = r.get_string(message_len)?;
        spells.push(Spell {
            tag,
            level,
            casting_time,
            mana,
            grace,
            damage,
            skill,
            path,
            face,
            name,
            message,
        });
    }
    Ok(ServerCommandData::AddSpells { spells })
}

fn decode_updspell(
    r: &mut PacketReader<'_>,
    payload: &[u8],
) -> Result<ServerCommandData, ProtocolError> {
    let raw_flags = r.get_u8()?;
    let flags = UpdSpellFlags::from_bits(raw_flags).ok_or_else(|| {
        ProtocolError::unparseable(
            "updspell",
            format!("invalid flags 0x{raw_flags:02x}"),
            payload,
        )
    })?;
    let tag = r.get_u32()?;
    let mana = flags
        .contains(UpdSpellFlags::MANA)
        .then(|| r.get_i16())
        .transpose()?;
    let grace = flags
        .contains(UpdSpellFlags::GRACE)
        .then(|| r.get_i16())
        .transpose()?;
    let damage = flags
        .contains(UpdSpellFlags::DAMAGE)
        .then(|| r.get_i16())
        .transpose()?;
    check_no_excess(r, ServerCommandType::UpdSpell, payload)?;
    Ok(ServerCommandData::UpdSpell(UpdSpell {
        tag,
        mana,
        grace,
        damage,
    }))
}

fn decode_addquest(r: &mut PacketReader<'_>) -> Result<ServerCommandData, ProtocolError> {
    let mut quests = Vec::new();
    while r.has_remaining() {
        let code = r.get_u32()?;
        let title_len = r.get_u16()? as usize;
        let title = r.get_string(title_len)?;
        let face = r.get_u32()?;
        let replay = r.get_u8()? != 0;
        let parent = r.get_u32()?;
        let end = r.get_u8()? != 0;
        let step_len = r.get_u16()? as usize;
        let step = r.get_string(step_len)?;
        quests.push(Quest {
            code,
            title,
            face,
            replay,
            parent,
            end,
            step,
        });
    }
    Ok(ServerCommandData::AddQuests { quests })
}

fn decode_accountplayers(
    r: &mut PacketReader<'_>,
    payload: &[u8],
) -> Result<ServerCommandData, ProtocolError> {
    let count = r.get_u8()?;
    let mut characters = Vec::new();
    for _ in 0..count {
        let mut info = CharacterInfo::default();
        loop {
            let len = r.get_u8()? as usize;
            if len == 0 {
                break;
            }
            let field = r.get_u8()?;
            match field {
                cf_core::constants::ACL_NAME => info.name = r.get_string(len - 1)?,
                cf_core::constants::ACL_CLASS => info.class_name = r.get_string(len - 1)?,
                cf_core::constants::ACL_RACE => info.race = r.get_string(len - 1)?,
                cf_core::constants::ACL_LEVEL => info.level = r.get_u16()?,
                cf_core::constants::ACL_FACE => info.face = r.get_string(len - 1)?,
                cf_core::constants::ACL_PARTY => info.party = r.get_string(len - 1)?,
                cf_core::constants::ACL_MAP => info.map = r.get_string(len - 1)?,
                cf_core::constants::ACL_FACE_NUM => info.face_num = r.get_u16()?,
                _ => {
                    // Unknown field codes are skipped so newer servers stay
                    // usable; the length byte bounds the skip.
                    log::warn!("ignoring unknown accountplayers field {field}");
                    let _ = r.get_bytes(len - 1)?;
                }
            }
        }
        characters.push(info);
    }
    check_no_excess(r, ServerCommandType::AccountPlayers, payload)?;
    Ok(ServerCommandData::AccountPlayers { count, characters })
}
