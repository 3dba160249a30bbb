//! Per-loop memory kill cache
//!
//! Records which location identities a loop is known to overwrite. The common
//! case of a single location needs no set allocation.

use crate::graph::LocationIdentity;
use fxhash::FxHashSet;

#[derive(Debug, Clone)]
pub struct LoopKillCache {
    visits: usize,
    first_location: Option<LocationIdentity>,
    killed_locations: Option<FxHashSet<LocationIdentity>>,
    kills_all: bool,
}

impl LoopKillCache {
    pub fn new(visits: usize) -> Self {
        Self {
            visits,
            first_location: None,
            killed_locations: None,
            kills_all: false,
        }
    }

    pub fn visited(&mut self) {
        self.visits += 1;
    }

    pub fn visits(&self) -> usize {
        self.visits
    }

    /// From now on every location counts as killed
    pub fn set_kills_all(&mut self) {
        self.kills_all = true;
        self.first_location = None;
        self.killed_locations = None;
    }

    pub fn kills_all(&self) -> bool {
        self.kills_all
    }

    pub fn contains_location(&self, location: LocationIdentity) -> bool {
        if self.kills_all {
            return true;
        }
        if self.first_location == Some(location) {
            return true;
        }
        self.killed_locations
            .as_ref()
            .map_or(false, |set| set.contains(&location))
    }

    pub fn remember_loop_killed_location(&mut self, location: LocationIdentity) {
        if self.kills_all {
            return;
        }
        match self.first_location {
            None => self.first_location = Some(location),
            Some(first) if first == location => {}
            Some(_) => {
                self.killed_locations
                    .get_or_insert_with(FxHashSet::default)
                    .insert(location);
            }
        }
    }

    /// Whether the loop kills anything at all
    pub fn loop_kills_locations(&self) -> bool {
        if self.kills_all {
            return true;
        }
        self.first_location.is_some()
            || self.killed_locations.as_ref().map_or(false, |set| !set.is_empty())
    }
}
