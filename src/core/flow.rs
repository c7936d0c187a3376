//! Flow records and windowed collections
//!
//! A capture session accumulates counters into its own `FlowCollection`
//! during one rotate window; published snapshots are merged into a
//! per-interface `FlowCollectionHistory` keyed by window timestamp.

use crate::capture::Direction;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::Ipv4Addr;
use std::sync::Mutex;

pub const DEFAULT_L3_FLOW_COLLECTION_SIZE: usize = 16;
pub const DEFAULT_L4_FLOW_COLLECTION_SIZE: usize = 64;
pub const DEFAULT_FLOW_COLLECTION_HISTORY_SIZE: usize = 300;

/// Composite key identifying a directional flow.
///
/// L3 flows leave the ports and protocol at their zero defaults; L4 flows
/// populate all five fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FlowFingerprint {
    pub src_addr: String,
    pub dst_addr: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: String,
}

impl FlowFingerprint {
    /// Overwrite the address fields in place, reusing their buffers.
    pub fn set_addrs(&mut self, src: Ipv4Addr, dst: Ipv4Addr) {
        self.src_addr.clear();
        let _ = write!(self.src_addr, "{}", src);
        self.dst_addr.clear();
        let _ = write!(self.dst_addr, "{}", dst);
    }

    pub fn set_protocol(&mut self, protocol: &str) {
        self.protocol.clear();
        self.protocol.push_str(protocol);
    }

    /// Reset to the zero fingerprint, keeping the string buffers.
    pub fn clear(&mut self) {
        self.src_addr.clear();
        self.dst_addr.clear();
        self.src_port = 0;
        self.dst_port = 0;
        self.protocol.clear();
    }
}

/// Byte, packet and duration counters for one fingerprint.
///
/// Counters only grow within a window. Durations are not measured; the
/// publisher stamps the rotate interval on the direction its session
/// observes, so merged and aggregated flows carry per-direction durations
/// that divide cleanly into rates.
#[derive(Debug, Clone, Default)]
pub struct Flow {
    pub fingerprint: FlowFingerprint,
    pub inbound_bytes: i64,
    pub inbound_packets: i64,
    pub inbound_duration: i64,
    pub outbound_bytes: i64,
    pub outbound_packets: i64,
    pub outbound_duration: i64,
}

/// Inclusive second range a snapshot covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FlowTimestamp {
    pub start: i64,
    pub end: i64,
}

impl FlowTimestamp {
    pub fn offset(&self, offset: i64) -> FlowTimestamp {
        FlowTimestamp {
            start: self.start + offset,
            end: self.end + offset,
        }
    }
}

/// One interface's current-window aggregate.
#[derive(Debug, Clone)]
pub struct FlowCollection {
    pub interface_name: String,
    pub window: FlowTimestamp,
    pub l3: HashMap<FlowFingerprint, Flow>,
    pub l4: HashMap<FlowFingerprint, Flow>,
}

impl FlowCollection {
    pub fn new(interface_name: &str) -> Self {
        Self {
            interface_name: interface_name.to_string(),
            window: FlowTimestamp::default(),
            l3: HashMap::with_capacity(DEFAULT_L3_FLOW_COLLECTION_SIZE),
            l4: HashMap::with_capacity(DEFAULT_L4_FLOW_COLLECTION_SIZE),
        }
    }

    pub fn set_timestamp(&mut self, start: i64, end: i64) {
        self.window = FlowTimestamp { start, end };
    }

    pub fn update_l3_inbound(&mut self, fp: &FlowFingerprint, bytes: i64, packets: i64) {
        match self.l3.get_mut(fp) {
            Some(flow) => {
                flow.inbound_bytes += bytes;
                flow.inbound_packets += packets;
            }
            None => {
                self.l3.insert(
                    fp.clone(),
                    Flow {
                        fingerprint: fp.clone(),
                        inbound_bytes: bytes,
                        inbound_packets: packets,
                        ..Default::default()
                    },
                );
            }
        }
    }

    pub fn update_l3_outbound(&mut self, fp: &FlowFingerprint, bytes: i64, packets: i64) {
        match self.l3.get_mut(fp) {
            Some(flow) => {
                flow.outbound_bytes += bytes;
                flow.outbound_packets += packets;
            }
            None => {
                self.l3.insert(
                    fp.clone(),
                    Flow {
                        fingerprint: fp.clone(),
                        outbound_bytes: bytes,
                        outbound_packets: packets,
                        ..Default::default()
                    },
                );
            }
        }
    }

    pub fn update_l4_inbound(&mut self, fp: &FlowFingerprint, bytes: i64, packets: i64) {
        match self.l4.get_mut(fp) {
            Some(flow) => {
                flow.inbound_bytes += bytes;
                flow.inbound_packets += packets;
            }
            None => {
                self.l4.insert(
                    fp.clone(),
                    Flow {
                        fingerprint: fp.clone(),
                        inbound_bytes: bytes,
                        inbound_packets: packets,
                        ..Default::default()
                    },
                );
            }
        }
    }

    pub fn update_l4_outbound(&mut self, fp: &FlowFingerprint, bytes: i64, packets: i64) {
        match self.l4.get_mut(fp) {
            Some(flow) => {
                flow.outbound_bytes += bytes;
                flow.outbound_packets += packets;
            }
            None => {
                self.l4.insert(
                    fp.clone(),
                    Flow {
                        fingerprint: fp.clone(),
                        outbound_bytes: bytes,
                        outbound_packets: packets,
                        ..Default::default()
                    },
                );
            }
        }
    }

    /// Stamp the rotate interval as the duration of the given direction on
    /// every flow. The opposite direction is left untouched; it is stamped
    /// by the session observing it.
    pub fn stamp_duration(&mut self, direction: Direction, interval: i64) {
        for flow in self.l3.values_mut().chain(self.l4.values_mut()) {
            match direction {
                Direction::Inbound => flow.inbound_duration = interval,
                Direction::Outbound => flow.outbound_duration = interval,
            }
        }
    }

    /// Add-or-insert every entry of `other`, summing all six counters.
    pub fn merge_from(&mut self, other: &FlowCollection) {
        for (fp, f) in &other.l3 {
            match self.l3.get_mut(fp) {
                Some(flow) => {
                    flow.inbound_bytes += f.inbound_bytes;
                    flow.inbound_packets += f.inbound_packets;
                    flow.inbound_duration += f.inbound_duration;
                    flow.outbound_bytes += f.outbound_bytes;
                    flow.outbound_packets += f.outbound_packets;
                    flow.outbound_duration += f.outbound_duration;
                }
                None => {
                    self.l3.insert(fp.clone(), f.clone());
                }
            }
        }

        for (fp, f) in &other.l4 {
            match self.l4.get_mut(fp) {
                Some(flow) => {
                    flow.inbound_bytes += f.inbound_bytes;
                    flow.inbound_packets += f.inbound_packets;
                    flow.inbound_duration += f.inbound_duration;
                    flow.outbound_bytes += f.outbound_bytes;
                    flow.outbound_packets += f.outbound_packets;
                    flow.outbound_duration += f.outbound_duration;
                }
                None => {
                    self.l4.insert(fp.clone(), f.clone());
                }
            }
        }
    }

    /// Deep clone taken at publish time; the live collection is reset and
    /// reused afterwards.
    pub fn snapshot(&self) -> FlowCollection {
        self.clone()
    }

    /// Empty both maps for the next window. The buckets are kept, so a
    /// steady flow population stops allocating after the first window.
    pub fn reset(&mut self) {
        self.l3.clear();
        self.l4.clear();
    }
}

/// One interface's published windows.
pub struct FlowCollectionHistory {
    pub interface_name: String,
    inner: Mutex<HistoryInner>,
}

struct HistoryInner {
    entries: HashMap<FlowTimestamp, FlowCollection>,
    last_timestamp: FlowTimestamp,
}

impl FlowCollectionHistory {
    pub fn new(interface_name: &str) -> Self {
        Self {
            interface_name: interface_name.to_string(),
            inner: Mutex::new(HistoryInner {
                entries: HashMap::with_capacity(DEFAULT_FLOW_COLLECTION_HISTORY_SIZE),
                last_timestamp: FlowTimestamp::default(),
            }),
        }
    }

    pub fn last_timestamp(&self) -> FlowTimestamp {
        self.inner.lock().unwrap().last_timestamp
    }

    /// Store a published snapshot under its window, merging when both
    /// direction sessions publish the same window.
    pub fn ingest(&self, collection: FlowCollection) {
        let mut inner = self.inner.lock().unwrap();
        let window = collection.window;
        match inner.entries.get_mut(&window) {
            Some(existing) => existing.merge_from(&collection),
            None => {
                inner.entries.insert(window, collection);
            }
        }
        inner.last_timestamp = window;
    }

    /// Drop every window that ended before `before`.
    pub fn prune_before(&self, before: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.retain(|ts, _| ts.end >= before);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum the trailing `duration` seconds of history into a fresh
    /// collection.
    ///
    /// The scan steps backward one second at a time from the last published
    /// window; absent windows contribute nothing. The lock is taken per
    /// lookup so ingest is not starved during the scan.
    pub fn aggregate_by_duration(&self, duration: i64) -> (FlowCollection, FlowTimestamp) {
        let mut aggregate = FlowCollection::new(&self.interface_name);
        let last_ts = self.last_timestamp();
        let window = FlowTimestamp {
            start: last_ts.offset(-duration).start + 1,
            end: last_ts.end,
        };
        aggregate.window = window;

        let mut ts = last_ts;
        while last_ts.end - ts.end < duration {
            {
                let inner = self.inner.lock().unwrap();
                if let Some(sample) = inner.entries.get(&ts) {
                    aggregate.merge_from(sample);
                }
            }
            ts = ts.offset(-1);
        }

        (aggregate, window)
    }
}
