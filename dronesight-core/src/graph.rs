//! Topology graph: plain MAC-to-MAC edges plus access-point groups with their clients.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::Serialize;

use crate::frame::FrameRecord;
use crate::mac::MacAddr;

/// Frame counts between a client and its host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClientCounts {
    /// Frames the host sent to the client.
    pub received: u64,
    /// Frames the client sent to the host.
    pub transmitted: u64,
}

/// One hotspot: the host, its advertised SSID and its clients.
#[derive(Debug, Clone, Serialize)]
pub struct Group {
    pub ssid: String,
    pub host: MacAddr,
    clients: BTreeMap<MacAddr, ClientCounts>,
    most_frequent: Option<(MacAddr, u64)>,
}

impl Group {
    pub fn new(ssid: impl Into<String>, host: MacAddr) -> Self {
        Self {
            ssid: ssid.into(),
            host,
            clients: BTreeMap::new(),
            most_frequent: None,
        }
    }

    /// Count one frame between the host and `client`. `received` is host-to-client.
    pub fn add_client(&mut self, client: MacAddr, received: bool) {
        if client == self.host {
            return;
        }
        let counts = self.clients.entry(client).or_default();
        if received {
            counts.received += 1;
            return;
        }
        counts.transmitted += 1;
        let transmitted = counts.transmitted;
        if self.most_frequent.map_or(true, |(_, best)| transmitted > best) {
            self.most_frequent = Some((client, transmitted));
        }
    }

    pub fn clients(&self) -> impl Iterator<Item = (&MacAddr, &ClientCounts)> {
        self.clients.iter()
    }

    pub fn has_client(&self, mac: MacAddr) -> bool {
        self.clients.contains_key(&mac)
    }

    pub fn counts(&self, mac: MacAddr) -> ClientCounts {
        self.clients.get(&mac).copied().unwrap_or_default()
    }

    /// Client that transmitted the most frames to the host.
    pub fn most_frequent_client(&self) -> Option<MacAddr> {
        self.most_frequent.map(|(mac, _)| mac)
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} : {}", self.ssid, self.host)?;
        for (mac, c) in &self.clients {
            writeln!(
                f,
                "\t{mac} : received {} | transmitted {}",
                c.received, c.transmitted
            )?;
        }
        Ok(())
    }
}

/// Directed interaction graph of one capture.
#[derive(Debug, Clone, Default)]
pub struct TopologyGraph {
    edges: BTreeMap<MacAddr, BTreeMap<MacAddr, u64>>,
    groups: HashMap<MacAddr, Group>,
}

impl TopologyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hotspot the first time its beacon is seen. Broadcast is ignored.
    pub fn add_group(&mut self, ssid: &str, host: MacAddr) {
        if host.is_broadcast() {
            return;
        }
        self.groups
            .entry(host)
            .or_insert_with(|| Group::new(ssid, host));
    }

    /// Route a frame between two addresses into group bookkeeping when either end is a
    /// known host, otherwise into the plain edge weights.
    pub fn add_edge(&mut self, from: MacAddr, to: MacAddr) {
        if !to.is_broadcast() {
            if let Some(group) = self.groups.get_mut(&from) {
                group.add_client(to, true);
                return;
            }
        }
        if !from.is_broadcast() {
            if let Some(group) = self.groups.get_mut(&to) {
                group.add_client(from, false);
                return;
            }
        }
        *self.edges.entry(from).or_default().entry(to).or_insert(0) += 1;
    }

    /// Beacons register groups; addressed frames add an edge.
    pub fn add_frame(&mut self, frame: &FrameRecord) {
        if frame.is_beacon() {
            if let (Some(ssid), Some(ta)) = (&frame.ssid, frame.transmitter) {
                self.add_group(ssid, ta);
            }
        }
        if let (Some(ta), Some(ra)) = (frame.transmitter, frame.receiver) {
            self.add_edge(ta, ra);
        }
    }

    pub fn is_host(&self, mac: MacAddr) -> bool {
        self.groups.contains_key(&mac)
    }

    pub fn is_client(&self, mac: MacAddr) -> bool {
        self.groups.values().any(|g| g.has_client(mac))
    }

    pub fn group(&self, host: MacAddr) -> Option<&Group> {
        self.groups.get(&host)
    }

    /// Groups in host address order.
    pub fn groups(&self) -> Vec<&Group> {
        let mut groups: Vec<&Group> = self.groups.values().collect();
        groups.sort_by_key(|g| g.host);
        groups
    }

    pub fn edge_weight(&self, from: MacAddr, to: MacAddr) -> u64 {
        self.edges
            .get(&from)
            .and_then(|tos| tos.get(&to))
            .copied()
            .unwrap_or(0)
    }

    pub fn edges(&self) -> impl Iterator<Item = (MacAddr, MacAddr, u64)> + '_ {
        self.edges
            .iter()
            .flat_map(|(from, tos)| tos.iter().map(move |(to, w)| (*from, *to, *w)))
    }

    /// For a host, its most frequent client; for a client, the host that sent it the
    /// most frames.
    pub fn most_frequent_counterpart(&self, mac: MacAddr) -> Option<MacAddr> {
        if let Some(group) = self.groups.get(&mac) {
            return group.most_frequent_client();
        }
        let mut best: Option<(MacAddr, u64)> = None;
        for group in self.groups() {
            if !group.has_client(mac) {
                continue;
            }
            let received = group.counts(mac).received;
            if best.map_or(true, |(_, n)| received > n) {
                best = Some((group.host, received));
            }
        }
        best.map(|(host, _)| host)
    }
}

impl fmt::Display for TopologyGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for group in self.groups() {
            writeln!(f, "{group}")?;
        }
        for (from, to, w) in self.edges() {
            writeln!(f, "{from} -> {to} : {w}")?;
        }
        Ok(())
    }
}
