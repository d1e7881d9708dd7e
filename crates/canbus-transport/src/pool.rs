//! Console object pool -- per-session object ids from 0x100..=0x1ff.
//!
//! Allocation starts at a random offset and probes linearly so that a
//! restarted client is unlikely to reuse the id of its previous run.

use canbus_protocol::objects::{CONSOLE_MAX, CONSOLE_MIN};
use rand::Rng;

pub struct ConsoleObjectPool {
    in_use: Vec<bool>,
}

impl Default for ConsoleObjectPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleObjectPool {
    pub fn new() -> Self {
        Self {
            in_use: vec![false; (CONSOLE_MAX - CONSOLE_MIN + 1) as usize],
        }
    }

    pub fn allocate(&mut self) -> Option<u16> {
        let start = rand::thread_rng().gen_range(0..self.in_use.len());
        self.allocate_from(start)
    }

    fn allocate_from(&mut self, start: usize) -> Option<u16> {
        let size = self.in_use.len();
        let slot = (0..size)
            .map(|i| (start + i) % size)
            .find(|&i| !self.in_use[i])?;
        self.in_use[slot] = true;
        Some(CONSOLE_MIN + slot as u16)
    }

    pub fn release(&mut self, object: u16) {
        if let Some(slot) = Self::slot(object) {
            self.in_use[slot] = false;
        }
    }

    pub fn is_in_use(&self, object: u16) -> bool {
        Self::slot(object).is_some_and(|slot| self.in_use[slot])
    }

    pub fn allocated(&self) -> usize {
        self.in_use.iter().filter(|u| **u).count()
    }

    fn slot(object: u16) -> Option<usize> {
        (CONSOLE_MIN..=CONSOLE_MAX)
            .contains(&object)
            .then(|| (object - CONSOLE_MIN) as usize)
    }
}
