//! Wire protocol constants shared by the decoder and encoder sides.

use bitflags::bitflags;

/// Client-to-server protocol version sent in the `version` line.
pub const VERSION_CS: u32 = 1023;

/// Server-to-client protocol version sent in the `version` line.
pub const VERSION_SC: u32 = 1027;

/// Map view size assumed before `setup mapsize` has been negotiated.
pub const DEFAULT_MAP_WIDTH: u16 = 11;
pub const DEFAULT_MAP_HEIGHT: u16 = 11;

/// Ground view count assumed before `setup num_look_objects` has been
/// negotiated.
pub const DEFAULT_NUM_LOOK_OBJECTS: u16 = 50;

/// Servers reject smaller ground views.
pub const MIN_NUM_LOOK_OBJECTS: u16 = 3;

/// Upper bound on re-request rounds for one view-size negotiation. When the
/// ladder hits this, the server's last answer is accepted as-is so waiters
/// can never hang on an adversarial server.
pub const MAX_NEGOTIATION_ATTEMPTS: u32 = 10;

// ---------------------------------------------------------------------------
// map2 sub-protocol

/// Recentering offset for the signed 6-bit coordinate fields of a map2
/// header word.
pub const MAP2_COORD_OFFSET: i32 = 15;

/// Header type: per-tile sub-commands follow.
pub const MAP2_TYPE_COORDINATE: u8 = 0;

/// Header type: the coordinate fields carry a scroll delta.
pub const MAP2_TYPE_SCROLL: u8 = 1;

/// Sub-command: clear the whole tile. Payload length must be 0.
pub const MAP2_COORD_CLEAR_SPACE: u8 = 0;

/// Sub-command: tile darkness. Payload length must be 1.
pub const MAP2_COORD_DARKNESS: u8 = 1;

/// Sub-commands `0x10..0x10+MAP2_NUM_LAYERS`: face/animation for one layer.
pub const MAP2_COORD_LAYER0: u8 = 0x10;
pub const MAP2_NUM_LAYERS: u8 = 10;

/// Terminates the sub-command loop of one coordinate header.
pub const MAP2_END: u8 = 0xff;

/// High bit of a layer's 2-byte face field: the low bits are an animation
/// id, not a face id.
pub const FACE_ANIMATION: u16 = 0x8000;

/// Mask extracting the animation id from an animated face field.
pub const ANIM_MASK: u16 = 0x1fff;

/// Shift/mask extracting the 2-bit animation type from an animated face
/// field.
pub const ANIM_TYPE_SHIFT: u16 = 13;
pub const ANIM_TYPE_MASK: u16 = 3;

// ---------------------------------------------------------------------------
// stats command

pub const CS_STAT_HP: u8 = 1;
pub const CS_STAT_MAXHP: u8 = 2;
pub const CS_STAT_SP: u8 = 3;
pub const CS_STAT_MAXSP: u8 = 4;
pub const CS_STAT_STR: u8 = 5;
pub const CS_STAT_INT: u8 = 6;
pub const CS_STAT_WIS: u8 = 7;
pub const CS_STAT_DEX: u8 = 8;
pub const CS_STAT_CON: u8 = 9;
pub const CS_STAT_CHA: u8 = 10;
pub const CS_STAT_EXP: u8 = 11;
pub const CS_STAT_LEVEL: u8 = 12;
pub const CS_STAT_WC: u8 = 13;
pub const CS_STAT_AC: u8 = 14;
pub const CS_STAT_DAM: u8 = 15;
pub const CS_STAT_ARMOUR: u8 = 16;
pub const CS_STAT_SPEED: u8 = 17;
pub const CS_STAT_FOOD: u8 = 18;
pub const CS_STAT_WEAP_SP: u8 = 19;
pub const CS_STAT_RANGE: u8 = 20;
pub const CS_STAT_TITLE: u8 = 21;
pub const CS_STAT_POW: u8 = 22;
pub const CS_STAT_GRACE: u8 = 23;
pub const CS_STAT_MAXGRACE: u8 = 24;
pub const CS_STAT_FLAGS: u8 = 25;
pub const CS_STAT_WEIGHT_LIM: u8 = 26;
pub const CS_STAT_EXP64: u8 = 28;
pub const CS_STAT_SPELL_ATTUNE: u8 = 29;
pub const CS_STAT_SPELL_REPEL: u8 = 30;
pub const CS_STAT_SPELL_DENY: u8 = 31;
pub const CS_STAT_RACE_STR: u8 = 32;
pub const CS_STAT_RACE_POW: u8 = 38;
pub const CS_STAT_BASE_STR: u8 = 39;
pub const CS_STAT_BASE_POW: u8 = 45;
pub const CS_STAT_APPLIED_STR: u8 = 46;
pub const CS_STAT_APPLIED_POW: u8 = 52;
pub const CS_STAT_GOLEM_HP: u8 = 53;
pub const CS_STAT_GOLEM_MAXHP: u8 = 54;

/// Resistances occupy a contiguous id block of signed 16-bit values.
pub const CS_STAT_RESIST_START: u8 = 100;
pub const RESIST_TYPES: u8 = 18;

/// Skill stats occupy a contiguous id block of (level, 64-bit exp) pairs.
pub const CS_STAT_SKILLINFO: u8 = 140;
pub const CS_NUM_SKILLS: u8 = 50;

// ---------------------------------------------------------------------------
// accountplayers field codes

pub const ACL_NAME: u8 = 1;
pub const ACL_CLASS: u8 = 2;
pub const ACL_RACE: u8 = 3;
pub const ACL_LEVEL: u8 = 4;
pub const ACL_FACE: u8 = 5;
pub const ACL_PARTY: u8 = 6;
pub const ACL_MAP: u8 = 7;
pub const ACL_FACE_NUM: u8 = 8;

bitflags! {
    /// Field mask of an `upditem` command; each set bit adds one field to
    /// the payload, in ascending bit order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UpdItemFlags: u8 {
        const LOCATION   = 0x01;
        const FLAGS      = 0x02;
        const WEIGHT     = 0x04;
        const FACE       = 0x08;
        const NAME       = 0x10;
        const ANIM       = 0x20;
        const ANIM_SPEED = 0x40;
        const NROF       = 0x80;
    }
}

bitflags! {
    /// Field mask of an `updspell` command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UpdSpellFlags: u8 {
        const MANA   = 0x01;
        const GRACE  = 0x02;
        const DAMAGE = 0x04;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upditem_flags_cover_the_full_byte() {
        assert_eq!(UpdItemFlags::all().bits(), 0xff);
        assert!(UpdItemFlags::from_bits(0xff).is_some());
    }

    #[test]
    fn stat_ranges_do_not_overlap() {
        assert!(CS_STAT_GOLEM_MAXHP < CS_STAT_RESIST_START);
        assert!(CS_STAT_RESIST_START + RESIST_TYPES - 1 < CS_STAT_SKILLINFO);
        assert_eq!(CS_STAT_SKILLINFO.checked_add(CS_NUM_SKILLS - 1), Some(189));
    }
}
