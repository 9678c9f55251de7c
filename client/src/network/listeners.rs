//! Listener registries converting decoded packets into typed callbacks.

use std::sync::{Arc, Mutex};

use crate::network::connection::ConnectionState;
use crate::network::map2::Location;
use crate::network::server_commands::{
    CharacterInfo, Item, Knowledge, Quest, ServerCommandType, Spell, UpdItem, UpdSpell,
};

/// An insertion-ordered listener set.
///
/// Dispatch iterates over a snapshot, so a listener removing itself (or any
/// other listener) from inside a callback neither skips nor duplicates
/// deliveries of the in-progress event.
pub struct ListenerList<T: ?Sized> {
    listeners: Mutex<Vec<Arc<T>>>,
}

impl<T: ?Sized> Default for ListenerList<T> {
    fn default() -> Self {
        ListenerList {
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl<T: ?Sized> ListenerList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<T>>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, listener: Arc<T>) {
        self.lock().push(listener);
    }

    pub fn remove(&self, listener: &Arc<T>) {
        self.lock().retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Delivers one event to every listener registered at call time.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<T>)) {
        let snapshot: Vec<Arc<T>> = self.lock().clone();
        for listener in &snapshot {
            f(listener);
        }
    }
}

pub trait MapListener: Send + Sync {
    /// Opens the tile-consistency critical section for one map2 packet.
    fn map_begin(&self) {}
    fn map_clear(&self, _x: i32, _y: i32) {}
    fn map_darkness(&self, _x: i32, _y: i32, _darkness: u8) {}
    fn map_face(&self, _location: Location, _face: u16) {}
    fn map_smooth(&self, _location: Location, _smooth: u8) {}
    fn map_animation(&self, _location: Location, _animation: u16, _animation_type: u8) {}
    fn map_animation_speed(&self, _location: Location, _anim_speed: u8) {}
    fn map_scroll(&self, _dx: i32, _dy: i32) {}
    /// Closes the critical section opened by `map_begin`.
    fn map_end(&self) {}
    /// The server started a new map; the view contents are void.
    fn new_map(&self) {}
}

pub trait StatsListener: Send + Sync {
    fn stat2(&self, _stat: u8, _value: i16) {}
    fn stat4(&self, _stat: u8, _value: i32) {}
    fn stat8(&self, _stat: u8, _value: i64) {}
    fn stat_string(&self, _stat: u8, _value: &str) {}
    fn resist(&self, _stat: u8, _value: i16) {}
    fn skill(&self, _stat: u8, _level: u8, _experience: u64) {}
}

pub trait ItemListener: Send + Sync {
    fn player(&self, _tag: u32, _weight: u32, _face: u32, _name: &str) {}
    fn add_item(&self, _location: u32, _item: &Item) {}
    fn del_inventory(&self, _tag: u32) {}
    fn del_items(&self, _tags: &[u32]) {}
    fn upd_item(&self, _update: &UpdItem) {}
    /// The server changed the active pickup mode.
    fn pickup(&self, _mode: u32) {}
}

pub trait SpellListener: Send + Sync {
    fn add_spell(&self, _spell: &Spell) {}
    fn upd_spell(&self, _update: &UpdSpell) {}
    fn del_spell(&self, _tag: u32) {}
}

pub trait QuestListener: Send + Sync {
    fn add_quest(&self, _quest: &Quest) {}
    fn upd_quest(&self, _code: u32, _end: bool, _step: &str) {}
}

pub trait KnowledgeListener: Send + Sync {
    fn add_knowledge(&self, _knowledge: &Knowledge) {}
    /// One `knowledge_info` metadata row from replyinfo.
    fn knowledge_info(&self, _knowledge_type: &str, _name: &str, _face: u32, _attempt: bool) {}
}

pub trait SoundListener: Send + Sync {
    fn sound(&self, _x: i8, _y: i8, _num: u16, _sound_type: u8) {}
    fn sound2(
        &self,
        _x: i8,
        _y: i8,
        _dir: i8,
        _volume: u8,
        _sound_type: u8,
        _action: &str,
        _name: &str,
    ) {
    }
}

pub trait MusicListener: Send + Sync {
    fn music(&self, _name: &str) {}
}

pub trait AccountListener: Send + Sync {
    fn account_players_start(&self, _count: u8) {}
    fn account_player(&self, _info: &CharacterInfo) {}
    fn account_players_end(&self) {}
}

pub trait FailureListener: Send + Sync {
    fn failure(&self, _command: &str, _message: &str) {}
}

pub trait TickListener: Send + Sync {
    fn tick(&self, _tick_no: u32) {}
}

pub trait ComcListener: Send + Sync {
    fn comc(&self, _packet_no: u16, _time: u32) {}
}

pub trait TextListener: Send + Sync {
    fn drawinfo(&self, _color: u8, _message: &str) {}
    fn drawextinfo(&self, _color: u8, _message_type: u16, _subtype: u16, _message: &str) {}
    fn query(&self, _flags: u8, _text: &str) {}
}

pub trait FaceListener: Send + Sync {
    fn face2(&self, _num: u16, _set: u8, _checksum: u32, _name: &str) {}
    fn image2(&self, _face: u32, _set: u8, _data: &[u8]) {}
    fn animation(&self, _num: u16, _flags: u16, _faces: &[u16]) {}
    fn smooth(&self, _face: u16, _smooth_pic: u16) {}
}

/// Raw packet inspection, mostly for instrumentation.
pub trait PacketWatcher: Send + Sync {
    fn packet(&self, _command: ServerCommandType, _payload: &[u8]) {}
    /// A known command arrived with a zero-length payload where a payload
    /// was expected. Distinguishes "received empty" from "never received".
    fn empty_command(&self, _command: ServerCommandType) {}
}

pub trait ConnectionListener: Send + Sync {
    fn state_changed(&self, _state: ConnectionState) {}
    fn disconnected(&self, _reason: &str) {}
}

/// One registry per event category. Per packet, internal domain state is
/// updated before any of these registries fire.
#[derive(Default)]
pub struct EventFanout {
    pub map: ListenerList<dyn MapListener>,
    pub stats: ListenerList<dyn StatsListener>,
    pub items: ListenerList<dyn ItemListener>,
    pub spells: ListenerList<dyn SpellListener>,
    pub quests: ListenerList<dyn QuestListener>,
    pub knowledge: ListenerList<dyn KnowledgeListener>,
    pub sound: ListenerList<dyn SoundListener>,
    pub music: ListenerList<dyn MusicListener>,
    pub account: ListenerList<dyn AccountListener>,
    pub failure: ListenerList<dyn FailureListener>,
    pub tick: ListenerList<dyn TickListener>,
    pub comc: ListenerList<dyn ComcListener>,
    pub text: ListenerList<dyn TextListener>,
    pub faces: ListenerList<dyn FaceListener>,
    pub packet_watchers: ListenerList<dyn PacketWatcher>,
    pub connection: ListenerList<dyn ConnectionListener>,
}

impl EventFanout {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTick {
        calls: AtomicUsize,
    }

    impl TickListener for CountingTick {
        fn tick(&self, _tick_no: u32) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn delivers_in_insertion_order() {
        let list: ListenerList<dyn TickListener> = ListenerList::new();
        let a = Arc::new(CountingTick {
            calls: AtomicUsize::new(0),
        });
        let b = Arc::new(CountingTick {
            calls: AtomicUsize::new(0),
        });
        list.add(a.clone());
        list.add(b.clone());

        let mut order = Vec::new();
        list.for_each(|l| {
            order.push(Arc::as_ptr(l));
            l.tick(1);
        });
        assert_eq!(order.len(), 2);
        assert_eq!(order[0], Arc::as_ptr(&(a.clone() as Arc<dyn TickListener>)));
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removal_during_dispatch_does_not_skip_others() {
        let list = Arc::new(ListenerList::<dyn TickListener>::new());
        let a = Arc::new(CountingTick {
            calls: AtomicUsize::new(0),
        });
        let b = Arc::new(CountingTick {
            calls: AtomicUsize::new(0),
        });
        list.add(a.clone());
        list.add(b.clone());

        // Remove the second listener while delivering to the first; the
        // snapshot must still deliver this event to both.
        let mut first = true;
        list.for_each(|l| {
            if first {
                first = false;
                list.remove(&(b.clone() as Arc<dyn TickListener>));
            }
            l.tick(7);
        });
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.calls.load(Ordering::SeqCst), 1);
        assert_eq!(list.len(), 1);
    }
}
