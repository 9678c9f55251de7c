//! View-size negotiation with the server.
//!
//! The map view size and the ground view length are both requested through
//! `setup` and answered asynchronously; the server may clamp either one.
//! Each negotiator tracks the last unanswered request and re-requests until
//! both sides agree or the retry ceiling is hit, at which point the
//! server's answer is accepted as-is. Waiters block until a value is
//! settled for the current connection.

use std::sync::{Condvar, Mutex, MutexGuard};

use cf_core::constants::{
    DEFAULT_MAP_HEIGHT, DEFAULT_MAP_WIDTH, DEFAULT_NUM_LOOK_OBJECTS, MAX_NEGOTIATION_ATTEMPTS,
    MIN_NUM_LOOK_OBJECTS,
};

struct MapSizeState {
    /// The connection is in a phase where `setup` may be sent.
    negotiable: bool,
    preferred: (u16, u16),
    /// The unanswered request, if any.
    pending: Option<(u16, u16)>,
    current: (u16, u16),
    attempts: u32,
    /// Bumped on every reset; lets waiters detect a connection change.
    generation: u64,
}

/// Negotiates the map view dimensions (`setup mapsize WxH`).
pub struct MapSizeNegotiator {
    state: Mutex<MapSizeState>,
    settled: Condvar,
}

impl Default for MapSizeNegotiator {
    fn default() -> Self {
        Self::new(DEFAULT_MAP_WIDTH, DEFAULT_MAP_HEIGHT)
    }
}

impl MapSizeNegotiator {
    pub fn new(preferred_width: u16, preferred_height: u16) -> Self {
        MapSizeNegotiator {
            state: Mutex::new(MapSizeState {
                negotiable: false,
                preferred: force_odd(preferred_width, preferred_height),
                pending: None,
                current: (DEFAULT_MAP_WIDTH, DEFAULT_MAP_HEIGHT),
                attempts: 0,
                generation: 0,
            }),
            settled: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MapSizeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The last size agreed with the server.
    pub fn current(&self) -> (u16, u16) {
        self.lock().current
    }

    /// Changes the preferred size. Returns the request to send, if any.
    pub fn set_preferred(&self, width: u16, height: u16) -> Option<(u16, u16)> {
        let preferred = force_odd(width, height);
        let mut s = self.lock();
        if s.preferred == preferred {
            return None;
        }
        s.preferred = preferred;
        s.attempts = 0;
        Self::request(&mut s, preferred)
    }

    /// The connection entered a phase where `setup` may be sent. Returns
    /// the initial request, if any.
    pub fn begin(&self) -> Option<(u16, u16)> {
        let mut s = self.lock();
        s.negotiable = true;
        s.attempts = 0;
        let preferred = s.preferred;
        Self::request(&mut s, preferred)
    }

    /// The connection went away. Wakes waiters with an error.
    pub fn reset(&self) {
        let mut s = self.lock();
        s.negotiable = false;
        s.pending = None;
        s.current = (DEFAULT_MAP_WIDTH, DEFAULT_MAP_HEIGHT);
        s.attempts = 0;
        s.generation += 1;
        self.settled.notify_all();
    }

    /// Handles a `setup mapsize` acknowledgement. Returns the follow-up
    /// request to send, if any.
    pub fn process_ack(&self, width: u16, height: u16) -> Option<(u16, u16)> {
        let mut s = self.lock();
        let Some((pending_w, pending_h)) = s.pending.take() else {
            log::warn!("unexpected mapsize acknowledgement {width}x{height}");
            s.current = (width, height);
            self.settled.notify_all();
            return None;
        };

        if s.attempts >= MAX_NEGOTIATION_ATTEMPTS {
            log::warn!("mapsize negotiation did not converge; accepting {width}x{height}");
            s.current = (width, height);
            self.settled.notify_all();
            return None;
        }
        s.attempts += 1;

        if (width, height) == (pending_w, pending_h) {
            s.current = (width, height);
            let preferred = s.preferred;
            if width != preferred.0 && height != preferred.1 {
                return self.renegotiate_or_settle(s, preferred);
            }
            self.settled.notify_all();
            return None;
        }

        log::info!(
            "server answered mapsize {width}x{height} to a request for {pending_w}x{pending_h}"
        );
        let next = if pending_w > width && pending_h > height {
            (width, height)
        } else if pending_w > width {
            (width, pending_h)
        } else if pending_h > height {
            (pending_w, height)
        } else if pending_w == width {
            (width, pending_h + 2)
        } else if pending_h == height {
            (pending_w + 2, height)
        } else if pending_w <= pending_h {
            (pending_w + 2, pending_h)
        } else {
            (pending_w, pending_h + 2)
        };
        self.renegotiate_or_settle(s, next)
    }

    fn renegotiate_or_settle(
        &self,
        mut s: MutexGuard<'_, MapSizeState>,
        next: (u16, u16),
    ) -> Option<(u16, u16)> {
        match Self::request(&mut s, next) {
            Some(request) => Some(request),
            None => {
                self.settled.notify_all();
                None
            }
        }
    }

    /// Sets `pending` and returns the request unless negotiation is not
    /// possible right now or the size is already in effect.
    fn request(s: &mut MapSizeState, requested: (u16, u16)) -> Option<(u16, u16)> {
        if !s.negotiable || s.pending.is_some() || s.current == requested {
            return None;
        }
        s.pending = Some(requested);
        Some(requested)
    }

    /// Blocks until the size is settled for the current connection.
    ///
    /// Settled means the option is negotiable in the current connection
    /// phase and no request is outstanding. The map size is negotiated
    /// during option setup, so this can return before login completes.
    pub fn wait_for_current(&self) -> Result<(u16, u16), String> {
        let mut s = self.lock();
        let generation = s.generation;
        loop {
            if s.generation != generation {
                return Err("connection closed during map size negotiation".to_string());
            }
            if s.negotiable && s.pending.is_none() {
                return Ok(s.current);
            }
            s = self.settled.wait(s).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Map view dimensions are kept odd so the player occupies a center tile.
fn force_odd(width: u16, height: u16) -> (u16, u16) {
    (width | 1, height | 1)
}

struct NumLookObjectsState {
    negotiable: bool,
    preferred: u16,
    pending: Option<u16>,
    current: u16,
    attempts: u32,
    generation: u64,
}

/// Negotiates the ground view length (`setup num_look_objects N`).
pub struct NumLookObjectsNegotiator {
    state: Mutex<NumLookObjectsState>,
    settled: Condvar,
}

impl Default for NumLookObjectsNegotiator {
    fn default() -> Self {
        Self::new(DEFAULT_NUM_LOOK_OBJECTS)
    }
}

impl NumLookObjectsNegotiator {
    pub fn new(preferred: u16) -> Self {
        NumLookObjectsNegotiator {
            state: Mutex::new(NumLookObjectsState {
                negotiable: false,
                preferred: preferred.max(MIN_NUM_LOOK_OBJECTS),
                pending: None,
                current: DEFAULT_NUM_LOOK_OBJECTS,
                attempts: 0,
                generation: 0,
            }),
            settled: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NumLookObjectsState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn current(&self) -> u16 {
        self.lock().current
    }

    pub fn set_preferred(&self, preferred: u16) -> Option<u16> {
        let preferred = preferred.max(MIN_NUM_LOOK_OBJECTS);
        let mut s = self.lock();
        if s.preferred == preferred {
            return None;
        }
        s.preferred = preferred;
        s.attempts = 0;
        Self::request(&mut s, preferred)
    }

    pub fn begin(&self) -> Option<u16> {
        let mut s = self.lock();
        s.negotiable = true;
        s.attempts = 0;
        let preferred = s.preferred;
        Self::request(&mut s, preferred)
    }

    pub fn reset(&self) {
        let mut s = self.lock();
        s.negotiable = false;
        s.pending = None;
        s.current = DEFAULT_NUM_LOOK_OBJECTS;
        s.attempts = 0;
        s.generation += 1;
        self.settled.notify_all();
    }

    /// The server answered `FALSE`: it does not support the option. The
    /// assumed default stays in effect.
    pub fn ack_failed(&self) {
        let mut s = self.lock();
        if s.pending.take().is_none() {
            log::warn!("unexpected num_look_objects failure acknowledgement");
        }
        self.settled.notify_all();
    }

    /// Handles a numeric `setup num_look_objects` acknowledgement. Returns
    /// the follow-up request to send, if any.
    pub fn process_ack(&self, value: u16) -> Option<u16> {
        let mut s = self.lock();
        let Some(pending) = s.pending.take() else {
            log::warn!("unexpected num_look_objects acknowledgement {value}");
            s.current = value;
            self.settled.notify_all();
            return None;
        };

        if value != pending {
            log::info!("server answered num_look_objects {value} to a request for {pending}");
        }
        s.current = value;
        if value != s.preferred && s.attempts < MAX_NEGOTIATION_ATTEMPTS {
            s.attempts += 1;
            let preferred = s.preferred;
            if let Some(request) = Self::request(&mut s, preferred) {
                return Some(request);
            }
        } else if value != s.preferred {
            log::warn!("num_look_objects negotiation did not converge; accepting {value}");
        }
        self.settled.notify_all();
        None
    }

    fn request(s: &mut NumLookObjectsState, requested: u16) -> Option<u16> {
        if !s.negotiable || s.pending.is_some() || s.current == requested {
            return None;
        }
        s.pending = Some(requested);
        Some(requested)
    }

    /// Blocks until the length is settled. The ground view is only
    /// negotiated after login, so this also waits for the connected
    /// phase.
    pub fn wait_for_current(&self) -> Result<u16, String> {
        let mut s = self.lock();
        let generation = s.generation;
        loop {
            if s.generation != generation {
                return Err("connection closed during ground view negotiation".to_string());
            }
            if s.negotiable && s.pending.is_none() {
                return Ok(s.current);
            }
            s = self.settled.wait(s).unwrap_or_else(|e| e.into_inner());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn mapsize_settles_on_server_clamp() {
        let n = MapSizeNegotiator::new(17, 13);
        assert_eq!(n.begin(), Some((17, 13)));

        // Server can only do 15x11; both dimensions were larger, so the
        // next request matches the answer.
        assert_eq!(n.process_ack(15, 11), Some((15, 11)));
        // Exact match commits, then one more probe toward the preferred
        // size.
        assert_eq!(n.process_ack(15, 11), Some((17, 13)));
        // The probe is clamped again; re-requesting 15x11 is skipped
        // because that size is already in effect.
        assert_eq!(n.process_ack(15, 11), None);

        assert_eq!(n.current(), (15, 11));
        assert_eq!(n.wait_for_current(), Ok((15, 11)));
    }

    #[test]
    fn mapsize_matching_answer_settles_immediately() {
        let n = MapSizeNegotiator::new(17, 13);
        assert_eq!(n.begin(), Some((17, 13)));
        assert_eq!(n.process_ack(17, 13), None);
        assert_eq!(n.current(), (17, 13));
    }

    #[test]
    fn mapsize_preferred_dimensions_are_forced_odd() {
        let n = MapSizeNegotiator::new(16, 12);
        assert_eq!(n.begin(), Some((17, 13)));
    }

    #[test]
    fn unexpected_mapsize_ack_is_adopted() {
        let n = MapSizeNegotiator::new(17, 13);
        assert_eq!(n.process_ack(15, 11), None);
        assert_eq!(n.current(), (15, 11));
    }

    #[test]
    fn mapsize_single_axis_clamp_keeps_other_axis() {
        let n = MapSizeNegotiator::new(17, 13);
        assert_eq!(n.begin(), Some((17, 13)));
        // Width clamped, height granted: retry with the clamped width.
        assert_eq!(n.process_ack(15, 13), Some((15, 13)));
        assert_eq!(n.process_ack(15, 13), None);
        assert_eq!(n.current(), (15, 13));
    }

    #[test]
    fn num_look_objects_clamp_stops_at_retry_ceiling() {
        let n = NumLookObjectsNegotiator::new(100);
        assert_eq!(n.begin(), Some(100));

        // An adversarial server keeps answering 50 to requests for 100.
        let mut requests = 0;
        let mut answer = n.process_ack(50);
        while let Some(request) = answer {
            assert_eq!(request, 100);
            requests += 1;
            assert!(requests <= MAX_NEGOTIATION_ATTEMPTS);
            answer = n.process_ack(50);
        }

        assert_eq!(n.current(), 50);
        assert_eq!(n.wait_for_current(), Ok(50));
    }

    #[test]
    fn num_look_objects_preferred_is_clamped_to_minimum() {
        let n = NumLookObjectsNegotiator::new(1);
        assert_eq!(n.begin(), Some(MIN_NUM_LOOK_OBJECTS));
    }

    #[test]
    fn num_look_objects_false_ack_keeps_default() {
        let n = NumLookObjectsNegotiator::new(100);
        assert_eq!(n.begin(), Some(100));
        n.ack_failed();
        assert_eq!(n.current(), DEFAULT_NUM_LOOK_OBJECTS);
        assert_eq!(n.wait_for_current(), Ok(DEFAULT_NUM_LOOK_OBJECTS));
    }

    #[test]
    fn reset_wakes_waiters_with_an_error() {
        let n = Arc::new(NumLookObjectsNegotiator::new(100));
        assert_eq!(n.begin(), Some(100));

        let waiter = {
            let n = n.clone();
            thread::spawn(move || n.wait_for_current())
        };
        // Give the waiter a moment to block on the unanswered request.
        thread::sleep(std::time::Duration::from_millis(50));
        n.reset();

        assert!(waiter.join().unwrap().is_err());
    }
}
