//! Decoder and encoder for the incremental `map2` tile update sub-protocol.
//!
//! A map2 payload is a run of 2-byte coordinate headers. The top 6 bits are
//! `x+MAP2_COORD_OFFSET`, the next 6 bits `y+MAP2_COORD_OFFSET`, the bottom
//! 4 bits a header type. A `Coordinate` header is followed by one-byte
//! `len|type` tags (top 3 bits payload length, bottom 5 bits sub-type) until
//! the `0xFF` sentinel; a `Scroll` header carries a scroll delta in the
//! coordinate fields and has no sub-commands.

use cf_core::byte_operations::{put_u16, PacketReader};
use cf_core::constants::{
    ANIM_MASK, ANIM_TYPE_MASK, ANIM_TYPE_SHIFT, FACE_ANIMATION, MAP2_COORD_CLEAR_SPACE,
    MAP2_COORD_DARKNESS, MAP2_COORD_LAYER0, MAP2_COORD_OFFSET, MAP2_END, MAP2_NUM_LAYERS,
    MAP2_TYPE_COORDINATE, MAP2_TYPE_SCROLL,
};
use cf_core::error::ProtocolError;

/// One cell/layer pair of the visible map window, relative to the current
/// scroll offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub x: i32,
    pub y: i32,
    pub layer: u8,
}

/// A decoded per-tile sub-command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileUpdate {
    /// Clears the whole tile.
    Clear,
    Darkness(u8),
    /// A static face on one layer. `smooth` comes from a 3- or 4-byte
    /// payload; `anim_speed` only ever appears in the 4-byte form.
    Face {
        layer: u8,
        face: u16,
        anim_speed: Option<u8>,
        smooth: Option<u8>,
    },
    /// An animated face on one layer. `anim_speed` comes from a 3- or
    /// 4-byte payload; `smooth` only ever appears in the 4-byte form.
    Animation {
        layer: u8,
        animation: u16,
        animation_type: u8,
        anim_speed: Option<u8>,
        smooth: Option<u8>,
    },
}

/// One coordinate header and everything decoded under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Map2Command {
    Coordinate {
        x: i32,
        y: i32,
        updates: Vec<TileUpdate>,
    },
    Scroll {
        dx: i32,
        dy: i32,
    },
}

fn err(reason: impl ToString, payload: &[u8]) -> ProtocolError {
    ProtocolError::unparseable("map2", reason, payload)
}

/// Decodes a whole map2 payload into its command sequence.
///
/// The caller is expected to deliver the result to the map consumer between
/// `map_begin`/`map_end` notifications so a packet is always seen as one
/// tile-consistent snapshot.
pub fn decode_map2(payload: &[u8]) -> Result<Vec<Map2Command>, ProtocolError> {
    let mut reader = PacketReader::new(payload);
    let mut commands = Vec::new();
    while reader.has_remaining() {
        let coord = reader.get_u16().map_err(|e| err(e, payload))?;
        let x = i32::from((coord >> 10) & 0x3f) - MAP2_COORD_OFFSET;
        let y = i32::from((coord >> 4) & 0x3f) - MAP2_COORD_OFFSET;
        let coord_type = (coord & 0xf) as u8;
        match coord_type {
            MAP2_TYPE_COORDINATE => {
                let updates = decode_coordinate(&mut reader, payload)?;
                commands.push(Map2Command::Coordinate { x, y, updates });
            }
            MAP2_TYPE_SCROLL => {
                log::debug!("recv map2 scroll {x}/{y}");
                commands.push(Map2Command::Scroll { dx: x, dy: y });
            }
            _ => {
                return Err(err(
                    format!("unknown map2 coordinate type {coord_type}"),
                    payload,
                ));
            }
        }
    }
    Ok(commands)
}

fn decode_coordinate(
    reader: &mut PacketReader<'_>,
    payload: &[u8],
) -> Result<Vec<TileUpdate>, ProtocolError> {
    let mut updates = Vec::new();
    loop {
        let len_type = reader.get_u8().map_err(|e| err(e, payload))?;
        if len_type == MAP2_END {
            break;
        }

        let len = (len_type >> 5) & 7;
        let sub_type = len_type & 31;
        match sub_type {
            MAP2_COORD_CLEAR_SPACE => {
                if len != 0 {
                    return Err(err(format!("clear command with length {len}"), payload));
                }
                updates.push(TileUpdate::Clear);
            }
            MAP2_COORD_DARKNESS => {
                if len != 1 {
                    return Err(err(format!("darkness command with length {len}"), payload));
                }
                let darkness = reader.get_u8().map_err(|e| err(e, payload))?;
                updates.push(TileUpdate::Darkness(darkness));
            }
            t if (MAP2_COORD_LAYER0..MAP2_COORD_LAYER0 + MAP2_NUM_LAYERS).contains(&t) => {
                let layer = t - MAP2_COORD_LAYER0;
                updates.push(decode_layer(reader, payload, layer, len)?);
            }
            _ => {
                return Err(err(format!("unknown sub-command type {sub_type}"), payload));
            }
        }
    }
    Ok(updates)
}

fn decode_layer(
    reader: &mut PacketReader<'_>,
    payload: &[u8],
    layer: u8,
    len: u8,
) -> Result<TileUpdate, ProtocolError> {
    if !(2..=4).contains(&len) {
        return Err(err(format!("image command with length {len}"), payload));
    }
    let face = reader.get_u16().map_err(|e| err(e, payload))?;
    if len >= 3 && face == 0 {
        return Err(err(
            "smoothing or animation information for empty face",
            payload,
        ));
    }

    let animated = face & FACE_ANIMATION != 0;
    // A 3-byte payload carries smooth (static) or anim_speed (animated);
    // a 4-byte payload carries anim_speed then smooth for either kind.
    let mut anim_speed = None;
    let mut smooth = None;
    match len {
        3 if animated => anim_speed = Some(reader.get_u8().map_err(|e| err(e, payload))?),
        3 => smooth = Some(reader.get_u8().map_err(|e| err(e, payload))?),
        4 => {
            anim_speed = Some(reader.get_u8().map_err(|e| err(e, payload))?);
            smooth = Some(reader.get_u8().map_err(|e| err(e, payload))?);
        }
        _ => {}
    }

    Ok(if animated {
        TileUpdate::Animation {
            layer,
            animation: face & ANIM_MASK,
            animation_type: ((face >> ANIM_TYPE_SHIFT) & ANIM_TYPE_MASK) as u8,
            anim_speed,
            smooth,
        }
    } else {
        TileUpdate::Face {
            layer,
            face,
            anim_speed,
            smooth,
        }
    })
}

fn coord_header(x: i32, y: i32, coord_type: u8) -> u16 {
    let cx = (x + MAP2_COORD_OFFSET) as u16 & 0x3f;
    let cy = (y + MAP2_COORD_OFFSET) as u16 & 0x3f;
    (cx << 10) | (cy << 4) | u16::from(coord_type)
}

fn layer_bytes(
    buf: &mut Vec<u8>,
    layer: u8,
    face_word: u16,
    anim_speed: Option<u8>,
    smooth: Option<u8>,
) {
    let len = 2 + u8::from(anim_speed.is_some()) + u8::from(smooth.is_some());
    buf.push((len << 5) | (MAP2_COORD_LAYER0 + layer));
    put_u16(buf, face_word);
    if let Some(speed) = anim_speed {
        buf.push(speed);
    }
    if let Some(smooth) = smooth {
        buf.push(smooth);
    }
}

/// Builds the byte form of a map2 command sequence. Feeding back the output
/// of [`decode_map2`] reproduces the original payload byte for byte.
pub fn encode_map2(commands: &[Map2Command]) -> Vec<u8> {
    let mut buf = Vec::new();
    for command in commands {
        match command {
            Map2Command::Scroll { dx, dy } => {
                put_u16(&mut buf, coord_header(*dx, *dy, MAP2_TYPE_SCROLL));
            }
            Map2Command::Coordinate { x, y, updates } => {
                put_u16(&mut buf, coord_header(*x, *y, MAP2_TYPE_COORDINATE));
                for update in updates {
                    match update {
                        TileUpdate::Clear => buf.push(MAP2_COORD_CLEAR_SPACE),
                        TileUpdate::Darkness(darkness) => {
                            buf.push((1 << 5) | MAP2_COORD_DARKNESS);
                            buf.push(*darkness);
                        }
                        TileUpdate::Face {
                            layer,
                            face,
                            anim_speed,
                            smooth,
                        } => layer_bytes(&mut buf, *layer, *face, *anim_speed, *smooth),
                        TileUpdate::Animation {
                            layer,
                            animation,
                            animation_type,
                            anim_speed,
                            smooth,
                        } => {
                            let face_word = FACE_ANIMATION
                                | (u16::from(*animation_type) << ANIM_TYPE_SHIFT)
                                | (animation & ANIM_MASK);
                            layer_bytes(&mut buf, *layer, face_word, *anim_speed, *smooth);
                        }
                    }
                }
                buf.push(MAP2_END);
            }
        }
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_at_origin_produces_one_clear_and_nothing_else() {
        // (x=0, y=0, type=Coordinate), ClearSpace, sentinel.
        let payload = encode_map2(&[Map2Command::Coordinate {
            x: 0,
            y: 0,
            updates: vec![TileUpdate::Clear],
        }]);
        assert_eq!(payload, [0x3c, 0xf0, 0x00, 0xff]);

        let commands = decode_map2(&payload).unwrap();
        assert_eq!(
            commands,
            vec![Map2Command::Coordinate {
                x: 0,
                y: 0,
                updates: vec![TileUpdate::Clear],
            }]
        );
    }

    #[test]
    fn decodes_negative_coordinates_and_scroll() {
        let payload = encode_map2(&[Map2Command::Scroll { dx: -3, dy: 7 }]);
        let commands = decode_map2(&payload).unwrap();
        assert_eq!(commands, vec![Map2Command::Scroll { dx: -3, dy: 7 }]);
    }

    #[test]
    fn three_byte_layer_disambiguates_on_animation_bit() {
        let static_payload = encode_map2(&[Map2Command::Coordinate {
            x: 1,
            y: 2,
            updates: vec![TileUpdate::Face {
                layer: 4,
                face: 123,
                anim_speed: None,
                smooth: Some(7),
            }],
        }]);
        match &decode_map2(&static_payload).unwrap()[0] {
            Map2Command::Coordinate { updates, .. } => {
                assert_eq!(
                    updates[0],
                    TileUpdate::Face {
                        layer: 4,
                        face: 123,
                        anim_speed: None,
                        smooth: Some(7),
                    }
                );
            }
            other => panic!("unexpected command {other:?}"),
        }

        let animated_payload = encode_map2(&[Map2Command::Coordinate {
            x: 1,
            y: 2,
            updates: vec![TileUpdate::Animation {
                layer: 0,
                animation: 42,
                animation_type: 2,
                anim_speed: Some(5),
                smooth: None,
            }],
        }]);
        match &decode_map2(&animated_payload).unwrap()[0] {
            Map2Command::Coordinate { updates, .. } => {
                assert_eq!(
                    updates[0],
                    TileUpdate::Animation {
                        layer: 0,
                        animation: 42,
                        animation_type: 2,
                        anim_speed: Some(5),
                        smooth: None,
                    }
                );
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn round_trips_byte_identical() {
        let commands = vec![
            Map2Command::Coordinate {
                x: -15,
                y: 15,
                updates: vec![
                    TileUpdate::Darkness(200),
                    TileUpdate::Face {
                        layer: 0,
                        face: 77,
                        anim_speed: None,
                        smooth: None,
                    },
                    TileUpdate::Animation {
                        layer: 9,
                        animation: 0x1fff,
                        animation_type: 3,
                        anim_speed: Some(1),
                        smooth: Some(2),
                    },
                ],
            },
            Map2Command::Coordinate {
                x: 3,
                y: -2,
                updates: vec![TileUpdate::Clear],
            },
            Map2Command::Scroll { dx: 1, dy: -1 },
        ];
        let payload = encode_map2(&commands);
        let decoded = decode_map2(&payload).unwrap();
        assert_eq!(decoded, commands);
        assert_eq!(encode_map2(&decoded), payload);
    }

    #[test]
    fn clear_with_nonzero_length_is_fatal() {
        // (0,0) coordinate, then lenType with len=1 type=ClearSpace.
        let payload = [0x3c, 0xf0, 0x20, 0x00, 0xff];
        assert!(matches!(
            decode_map2(&payload),
            Err(ProtocolError::UnparseablePacket { .. })
        ));
    }

    #[test]
    fn darkness_requires_one_byte_payload() {
        let payload = [0x3c, 0xf0, 0x01, 0xff];
        assert!(matches!(
            decode_map2(&payload),
            Err(ProtocolError::UnparseablePacket { .. })
        ));
    }

    #[test]
    fn smoothing_for_empty_face_is_fatal() {
        // Layer 0, len=3, face=0.
        let payload = [0x3c, 0xf0, 0x70, 0x00, 0x00, 0x07, 0xff];
        assert!(matches!(
            decode_map2(&payload),
            Err(ProtocolError::UnparseablePacket { .. })
        ));
    }

    #[test]
    fn truncated_header_is_fatal() {
        assert!(decode_map2(&[0x3c]).is_err());
    }

    #[test]
    fn missing_sentinel_is_fatal() {
        let payload = [0x3c, 0xf0, 0x00];
        assert!(matches!(
            decode_map2(&payload),
            Err(ProtocolError::UnparseablePacket { .. })
        ));
    }
}
