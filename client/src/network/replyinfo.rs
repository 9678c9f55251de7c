//! Decoders for the `replyinfo` command family.
//!
//! The payload starts with the info type terminated by a newline; the rest
//! is type-specific, some of it line-oriented text and some of it binary.
//! Unknown info types are reported but do not kill the connection, so a
//! newer server can answer requests this client never made.

use cf_core::byte_operations::PacketReader;
use cf_core::error::ProtocolError;

use crate::network::server_commands::StatUpdate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillInfo {
    pub id: u16,
    pub face: Option<u16>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnowledgeInfoEntry {
    pub knowledge_type: String,
    pub name: String,
    pub face: u32,
    pub can_attempt: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartingMapEntry {
    pub arch_name: String,
    pub name: String,
    pub description: String,
}

/// One selectable option group inside race or class creation info.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choice {
    pub name: String,
    pub description: String,
    /// Pairs of (arch name, human-readable name).
    pub options: Vec<(String, String)>,
}

/// Character creation details for one race or class arch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreationInfo {
    pub arch_name: String,
    pub name: String,
    pub description: String,
    pub stat_adjustments: Vec<StatUpdate>,
    pub choices: Vec<Choice>,
}

/// Constraints for rolling a new character.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewCharInfo {
    pub points: u32,
    pub min_stat: u32,
    pub max_stat: u32,
    pub stat_names: Vec<String>,
    /// (variable, values) lines the server marked required.
    pub required: Vec<(String, String)>,
    /// (variable, values) lines the server marked optional.
    pub optional: Vec<(String, String)>,
}

#[derive(Debug, PartialEq)]
pub enum ReplyinfoData {
    ImageInfo {
        face_sets: u32,
        info: String,
    },
    SkillInfo {
        skills: Vec<SkillInfo>,
    },
    /// Experience needed per level; index 0 is level 1.
    ExpTable {
        levels: Vec<u64>,
    },
    KnowledgeInfo {
        entries: Vec<KnowledgeInfoEntry>,
    },
    StartingMap {
        entries: Vec<StartingMapEntry>,
    },
    RaceList {
        races: Vec<String>,
    },
    ClassList {
        classes: Vec<String>,
    },
    RaceInfo(CreationInfo),
    ClassInfo(CreationInfo),
    NewCharInfo(NewCharInfo),
    /// An info type this client does not know. Kept verbatim.
    Unknown {
        data: Vec<u8>,
    },
}

/// Decodes the type-specific part of a `replyinfo` payload. `r` is
/// positioned just past the info type and its newline.
pub fn decode_replyinfo(
    info_type: &str,
    r: &mut PacketReader<'_>,
) -> Result<ReplyinfoData, ProtocolError> {
    match info_type {
        "image_info" => decode_image_info(r),
        "skill_info" => decode_skill_info(r),
        "exp_table" => decode_exp_table(r),
        "knowledge_info" => decode_knowledge_info(r),
        "startingmap" => decode_startingmap(r),
        "race_list" => Ok(ReplyinfoData::RaceList {
            races: decode_bar_list(r),
        }),
        "class_list" => Ok(ReplyinfoData::ClassList {
            classes: decode_bar_list(r),
        }),
        "race_info" => Ok(ReplyinfoData::RaceInfo(decode_creation_info(r)?)),
        "class_info" => Ok(ReplyinfoData::ClassInfo(decode_creation_info(r)?)),
        "newcharinfo" => decode_newcharinfo(r),
        other => {
            log::warn!("ignoring replyinfo for unknown info type {other:?}");
            let data = r.get_bytes(r.remaining())?.to_vec();
            Ok(ReplyinfoData::Unknown { data })
        }
    }
}

fn decode_image_info(r: &mut PacketReader<'_>) -> Result<ReplyinfoData, ProtocolError> {
    let face_sets = r.get_ascii_int(Some(b'\n'))? as u32;
    Ok(ReplyinfoData::ImageInfo {
        face_sets,
        info: r.get_remaining_string(),
    })
}

/// Lines of `id:name` or `id:face:name`.
fn decode_skill_info(r: &mut PacketReader<'_>) -> Result<ReplyinfoData, ProtocolError> {
    let mut skills = Vec::new();
    while r.has_remaining() {
        let line = r.get_string_delim(b'\n');
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.splitn(3, ':').collect();
        let parsed = match fields.as_slice() {
            [id, name] => id.parse::<u16>().ok().map(|id| SkillInfo {
                id,
                face: None,
                name: (*name).to_string(),
            }),
            [id, face, name] => match (id.parse::<u16>(), face.parse::<u16>()) {
                (Ok(id), Ok(face)) => Some(SkillInfo {
                    id,
                    face: Some(face),
                    name: (*name).to_string(),
                }),
                _ => None,
            },
            _ => None,
        };
        match parsed {
            Some(skill) => skills.push(skill),
            None => {
                return Err(ProtocolError::unparseable(
                    "replyinfo",
                    format!("malformed skill_info line {line:?}"),
                    line.as_bytes(),
                ));
            }
        }
    }
    Ok(ReplyinfoData::SkillInfo { skills })
}

/// Binary: a 16-bit level count, then one 64-bit value per level below the
/// count.
fn decode_exp_table(r: &mut PacketReader<'_>) -> Result<ReplyinfoData, ProtocolError> {
    let num_levels = r.get_u16()?;
    let mut levels = Vec::with_capacity(num_levels.saturating_sub(1) as usize);
    for _ in 1..num_levels {
        levels.push(r.get_u64()?);
    }
    Ok(ReplyinfoData::ExpTable { levels })
}

/// Lines of `type:name:face:can_attempt`.
fn decode_knowledge_info(r: &mut PacketReader<'_>) -> Result<ReplyinfoData, ProtocolError> {
    let mut entries = Vec::new();
    while r.has_remaining() {
        let line = r.get_string_delim(b'\n');
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() != 4 {
            return Err(ProtocolError::unparseable(
                "replyinfo",
                format!("malformed knowledge_info line {line:?}"),
                line.as_bytes(),
            ));
        }
        let face = fields[2].parse::<u32>().map_err(|_| {
            ProtocolError::unparseable(
                "replyinfo",
                format!("bad face in knowledge_info line {line:?}"),
                line.as_bytes(),
            )
        })?;
        entries.push(KnowledgeInfoEntry {
            knowledge_type: fields[0].to_string(),
            name: fields[1].to_string(),
            face,
            can_attempt: fields[3] == "1",
        });
    }
    Ok(ReplyinfoData::KnowledgeInfo { entries })
}

const INFO_MAP_ARCH_NAME: u8 = 1;
const INFO_MAP_NAME: u8 = 2;
const INFO_MAP_DESCRIPTION: u8 = 3;

/// Binary blocks of (type, 16-bit length, bytes); an arch name block opens
/// a new entry.
fn decode_startingmap(r: &mut PacketReader<'_>) -> Result<ReplyinfoData, ProtocolError> {
    let mut entries: Vec<StartingMapEntry> = Vec::new();
    while r.has_remaining() {
        let block_type = r.get_u8()?;
        let len = r.get_u16()? as usize;
        let value = r.get_string(len)?;
        match block_type {
            INFO_MAP_ARCH_NAME => entries.push(StartingMapEntry {
                arch_name: value,
                ..StartingMapEntry::default()
            }),
            INFO_MAP_NAME | INFO_MAP_DESCRIPTION => {
                let entry = entries.last_mut().ok_or_else(|| {
                    ProtocolError::unparseable(
                        "replyinfo",
                        "startingmap attribute before any arch name",
                        &[],
                    )
                })?;
                if block_type == INFO_MAP_NAME {
                    entry.name = value;
                } else {
                    entry.description = value;
                }
            }
            other => {
                // Length-prefixed, so unknown blocks can be stepped over.
                log::warn!("ignoring unknown startingmap block type {other}");
            }
        }
    }
    Ok(ReplyinfoData::StartingMap { entries })
}

/// A `|`-separated list with a leading bar, e.g. `|human|elf|dwarf`.
fn decode_bar_list(r: &mut PacketReader<'_>) -> Vec<String> {
    r.get_remaining_string()
        .split('|')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Reads a token terminated by space, newline, or end of input and returns
/// it with its terminator.
fn read_token(r: &mut PacketReader<'_>) -> (String, Option<u8>) {
    let mut token = Vec::new();
    while let Some(b) = r.peek() {
        let _ = r.get_u8();
        if b == b' ' || b == b'\n' {
            return (String::from_utf8_lossy(&token).into_owned(), Some(b));
        }
        token.push(b);
    }
    (String::from_utf8_lossy(&token).into_owned(), None)
}

fn decode_creation_info(r: &mut PacketReader<'_>) -> Result<CreationInfo, ProtocolError> {
    let mut info = CreationInfo {
        arch_name: r.get_string_delim(b'\n'),
        ..CreationInfo::default()
    };
    while r.has_remaining() {
        let (keyword, _) = read_token(r);
        match keyword.as_str() {
            "name" => info.name = r.get_string_delim(b'\n'),
            "msg" => {
                let mut lines = Vec::new();
                loop {
                    if !r.has_remaining() {
                        return Err(ProtocolError::unparseable(
                            "replyinfo",
                            "msg section without endmsg",
                            &[],
                        ));
                    }
                    let line = r.get_string_delim(b'\n');
                    if line == "endmsg" {
                        break;
                    }
                    lines.push(line);
                }
                info.description = lines.join("\n");
            }
            "stats" => decode_creation_stats(r, &mut info.stat_adjustments)?,
            "choice" => {
                let line = r.get_string_delim(b'\n');
                let mut tokens = line.split(' ').filter(|s| !s.is_empty());
                let name = tokens.next().unwrap_or_default().to_string();
                let description = tokens.next().unwrap_or_default().to_string();
                let mut options = Vec::new();
                while let Some(arch) = tokens.next() {
                    let label = tokens.next().ok_or_else(|| {
                        ProtocolError::unparseable(
                            "replyinfo",
                            format!("unpaired choice option in line {line:?}"),
                            line.as_bytes(),
                        )
                    })?;
                    options.push((arch.to_string(), label.to_string()));
                }
                info.choices.push(Choice {
                    name,
                    description,
                    options,
                });
            }
            other => {
                return Err(ProtocolError::unparseable(
                    "replyinfo",
                    format!("unknown creation info section {other:?}"),
                    other.as_bytes(),
                ));
            }
        }
    }
    Ok(info)
}

/// Binary stat adjustments reusing the `stats` command encoding, terminated
/// by a zero stat id.
fn decode_creation_stats(
    r: &mut PacketReader<'_>,
    out: &mut Vec<StatUpdate>,
) -> Result<(), ProtocolError> {
    use cf_core::constants::{
        CS_STAT_EXP, CS_STAT_EXP64, CS_STAT_RANGE, CS_STAT_RESIST_START, CS_STAT_SKILLINFO,
        CS_STAT_SPEED, CS_STAT_TITLE, CS_STAT_WEAP_SP, CS_STAT_WEIGHT_LIM, CS_NUM_SKILLS,
        RESIST_TYPES,
    };
    loop {
        let stat = r.get_u8()?;
        if stat == 0 {
            return Ok(());
        }
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
            _ => StatUpdate::Int2 {
                stat,
                value: r.get_i16()?,
            },
        };
        out.push(update);
    }
}

/// Lines of `<kind> <variable> <values>` where kind is `V` (value), `R`
/// (required), or `O` (optional).
fn decode_newcharinfo(r: &mut PacketReader<'_>) -> Result<ReplyinfoData, ProtocolError> {
    let mut info = NewCharInfo::default();
    while r.has_remaining() {
        let line = r.get_string_delim(b'\n');
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(3, ' ');
        let kind = parts.next().unwrap_or_default();
        let variable = parts.next().unwrap_or_default().to_string();
        let values = parts.next().unwrap_or_default().to_string();
        match kind {
            "V" => match variable.as_str() {
                "points" => info.points = parse_newcharinfo_int(&line, &values)?,
                "statrange" => {
                    let mut bounds = values.split(' ');
                    info.min_stat =
                        parse_newcharinfo_int(&line, bounds.next().unwrap_or_default())?;
                    info.max_stat =
                        parse_newcharinfo_int(&line, bounds.next().unwrap_or_default())?;
                }
                "statname" => {
                    info.stat_names = values.split(' ').map(str::to_string).collect();
                }
                other => log::warn!("ignoring unknown newcharinfo value {other:?}"),
            },
            "R" => info.required.push((variable, values)),
            "O" => info.optional.push((variable, values)),
            other => {
                return Err(ProtocolError::unparseable(
                    "replyinfo",
                    format!("unknown newcharinfo line kind {other:?}"),
                    line.as_bytes(),
                ));
            }
        }
    }
    Ok(ReplyinfoData::NewCharInfo(info))
}

fn parse_newcharinfo_int(line: &str, value: &str) -> Result<u32, ProtocolError> {
    value.parse::<u32>().map_err(|_| {
        ProtocolError::unparseable(
            "replyinfo",
            format!("bad number in newcharinfo line {line:?}"),
            line.as_bytes(),
        )
    })
}
