//! RC4 keystream used as an optional named transform over a session's
//! byte stream.
//!
//! Each direction of a connection owns its own state, and both are rebuilt
//! from the key whenever the connection is (re)established.

use crate::error::WireError;

/// RC4 keystream state
#[derive(Clone)]
pub struct Rc4 {
    state: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    /// Initialise the keystream from `key` (1..=256 bytes)
    pub fn new(key: &[u8]) -> Result<Self, WireError> {
        if key.is_empty() || key.len() > 256 {
            return Err(WireError::KeyLength(key.len()));
        }

        let mut state = [0u8; 256];
        for (i, slot) in state.iter_mut().enumerate() {
            *slot = i as u8;
        }

        let mut j: u8 = 0;
        for i in 0..256 {
            j = j.wrapping_add(state[i]).wrapping_add(key[i % key.len()]);
            state.swap(i, j as usize);
        }

        Ok(Self { state, i: 0, j: 0 })
    }

    /// XOR `data` in place with the next bytes of keystream
    pub fn apply(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.state[self.i as usize]);
            self.state.swap(self.i as usize, self.j as usize);
            let idx = self.state[self.i as usize].wrapping_add(self.state[self.j as usize]);
            *byte ^= self.state[idx as usize];
        }
    }
}

impl std::fmt::Debug for Rc4 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print keystream state
        f.debug_struct("Rc4").finish_non_exhaustive()
    }
}
