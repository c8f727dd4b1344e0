//! Message fragmentation and reassembly
//!
//! PSRP messages travel as length-prefixed fragments so transports with
//! bounded frame sizes can carry arbitrarily large messages. The header is
//! 21 bytes, big-endian: object id (u64), fragment id (u64), flags (u8,
//! bit 0 start / bit 1 end), payload length (u32).
//!
//! Outbound object ids are strictly monotonic per endpoint, starting at 1.
//! Inbound reassembly is strict: the first fragment of an object must be
//! fragment 0 with the start flag, successors must arrive in sequence with
//! the start flag clear, and at most [`MAX_INFLIGHT_OBJECTS`] objects may
//! be in flight at once.

use std::collections::BTreeMap;

use tracing::debug;

use crate::errors::{FragmentError, Result};

pub const FRAGMENT_HEADER_LEN: usize = 21;

/// Maximum number of concurrently reassembling objects.
pub const MAX_INFLIGHT_OBJECTS: usize = 256;

const FLAG_START: u8 = 0x1;
const FLAG_END: u8 = 0x2;

// ----------------------------------------------------------------------------
// Fragment
// ----------------------------------------------------------------------------

/// A single PSRP fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// The logical message this fragment belongs to.
    pub object_id: u64,
    /// Position within the object, starting at 0.
    pub fragment_id: u64,
    pub start: bool,
    pub end: bool,
    pub data: Vec<u8>,
}

impl Fragment {
    pub fn new(object_id: u64, fragment_id: u64, end: bool, data: Vec<u8>) -> Self {
        Self {
            object_id,
            fragment_id,
            start: fragment_id == 0,
            end,
            data,
        }
    }

    /// Serialize to wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAGMENT_HEADER_LEN + self.data.len());
        out.extend_from_slice(&self.object_id.to_be_bytes());
        out.extend_from_slice(&self.fragment_id.to_be_bytes());
        let mut flags = 0u8;
        if self.start {
            flags |= FLAG_START;
        }
        if self.end {
            flags |= FLAG_END;
        }
        out.push(flags);
        out.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    /// Parse one fragment from the front of a buffer. Returns the
    /// fragment and the number of bytes consumed, or `None` when the
    /// buffer does not yet hold a complete fragment.
    pub fn parse(buffer: &[u8]) -> Option<(Fragment, usize)> {
        if buffer.len() < FRAGMENT_HEADER_LEN {
            return None;
        }

        let object_id = u64::from_be_bytes(buffer[0..8].try_into().expect("8 bytes"));
        let fragment_id = u64::from_be_bytes(buffer[8..16].try_into().expect("8 bytes"));
        let flags = buffer[16];
        let length = u32::from_be_bytes(buffer[17..21].try_into().expect("4 bytes")) as usize;

        let total = FRAGMENT_HEADER_LEN + length;
        if buffer.len() < total {
            return None;
        }

        Some((
            Fragment {
                object_id,
                fragment_id,
                start: flags & FLAG_START != 0,
                end: flags & FLAG_END != 0,
                data: buffer[FRAGMENT_HEADER_LEN..total].to_vec(),
            },
            total,
        ))
    }
}

// ----------------------------------------------------------------------------
// Outbound fragmenter
// ----------------------------------------------------------------------------

/// Assigns object ids and splits packed messages into fragments.
#[derive(Debug, Clone)]
pub struct Fragmenter {
    next_object_id: u64,
}

impl Fragmenter {
    pub fn new() -> Self {
        Self { next_object_id: 1 }
    }

    /// Reserve the next object id.
    pub fn next_object_id(&mut self) -> u64 {
        let id = self.next_object_id;
        self.next_object_id += 1;
        id
    }

    /// Reset the counter, used when a pool re-keys its conversation after
    /// a reconnect.
    pub fn reset(&mut self) {
        self.next_object_id = 1;
    }

    /// Split a packed message into fragments carrying at most
    /// `max_fragment_size` payload bytes each.
    pub fn fragment(&mut self, data: &[u8], max_fragment_size: usize) -> Vec<Fragment> {
        let object_id = self.next_object_id();
        fragment_object(object_id, data, max_fragment_size)
    }
}

impl Default for Fragmenter {
    fn default() -> Self {
        Self::new()
    }
}

/// Split one object's bytes into fragments carrying at most
/// `max_fragment_size` payload bytes each.
pub fn fragment_object(object_id: u64, data: &[u8], max_fragment_size: usize) -> Vec<Fragment> {
    let chunk = max_fragment_size.max(1);
    let total = data.len().div_ceil(chunk).max(1);

    let mut fragments = Vec::with_capacity(total);
    for (index, payload) in data.chunks(chunk).enumerate() {
        fragments.push(Fragment::new(
            object_id,
            index as u64,
            index + 1 == total,
            payload.to_vec(),
        ));
    }
    if fragments.is_empty() {
        // Zero-length messages still travel as one empty fragment.
        fragments.push(Fragment::new(object_id, 0, true, Vec::new()));
    }
    fragments
}

// ----------------------------------------------------------------------------
// Inbound defragmenter
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct Reassembly {
    next_fragment_id: u64,
    data: Vec<u8>,
}

/// Reassembles inbound fragments into complete objects.
#[derive(Debug, Default)]
pub struct Defragmenter {
    inflight: BTreeMap<u64, Reassembly>,
}

impl Defragmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment. Returns the reassembled object bytes once its
    /// end fragment arrives.
    pub fn receive(&mut self, fragment: Fragment) -> Result<Option<Vec<u8>>> {
        debug!(
            object_id = fragment.object_id,
            fragment_id = fragment.fragment_id,
            start = fragment.start,
            end = fragment.end,
            length = fragment.data.len(),
            "unpacked fragment"
        );

        match self.inflight.get_mut(&fragment.object_id) {
            None => {
                if !fragment.start || fragment.fragment_id != 0 {
                    return Err(FragmentError::MissingStart {
                        object_id: fragment.object_id,
                        fragment_id: fragment.fragment_id,
                    }
                    .into());
                }
                if fragment.end {
                    return Ok(Some(fragment.data));
                }
                if self.inflight.len() >= MAX_INFLIGHT_OBJECTS {
                    return Err(FragmentError::TooManyInFlight {
                        limit: MAX_INFLIGHT_OBJECTS,
                    }
                    .into());
                }
                self.inflight.insert(
                    fragment.object_id,
                    Reassembly {
                        next_fragment_id: 1,
                        data: fragment.data,
                    },
                );
                Ok(None)
            }
            Some(buffer) => {
                if fragment.start || fragment.fragment_id != buffer.next_fragment_id {
                    let expected = buffer.next_fragment_id;
                    self.inflight.remove(&fragment.object_id);
                    return Err(FragmentError::OutOfOrder {
                        object_id: fragment.object_id,
                        expected,
                        actual: fragment.fragment_id,
                    }
                    .into());
                }

                buffer.next_fragment_id += 1;
                buffer.data.extend_from_slice(&fragment.data);

                if fragment.end {
                    let finished = self
                        .inflight
                        .remove(&fragment.object_id)
                        .expect("buffer present");
                    Ok(Some(finished.data))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Object ids still being reassembled.
    pub fn incomplete_objects(&self) -> Vec<u64> {
        self.inflight.keys().copied().collect()
    }

    /// Drop all in-flight buffers, returning the ids that were abandoned.
    pub fn reset(&mut self) -> Vec<u64> {
        let abandoned: Vec<u64> = self.inflight.keys().copied().collect();
        if !abandoned.is_empty() {
            debug!(count = abandoned.len(), "dropping unterminated objects");
        }
        self.inflight.clear();
        abandoned
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
