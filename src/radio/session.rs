//! Live state of the one radio we are talking to.
use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use tokio::time::Instant;

use crate::protobuf::proto;
use crate::radio::transport::PeripheralId;
use crate::radio::uuids::CharacteristicRole;

/// Node number meaning "everyone" on send and "no more hops" in routes.
pub const BROADCAST_NUM: u32 = u32::MAX;
/// Node numbers at or below this are reserved.
pub const MINIMUM_NODE_NUM: u32 = 4;

/// A peripheral seen while scanning.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: PeripheralId,
    pub num: u32,
    pub name: String,
    pub short_name: String,
    pub long_name: String,
    pub firmware_version: String,
    pub rssi: i32,
    pub last_update: DateTime<Utc>,
}

impl Device {
    pub fn new(id: PeripheralId, name: Option<String>, rssi: i32) -> Self {
        let name = name.filter(|n| !n.is_empty()).unwrap_or_else(|| "Unknown node".into());
        Self {
            id,
            num: 0,
            long_name: name.clone(),
            name,
            short_name: "?".into(),
            firmware_version: "Unknown".into(),
            rssi,
            last_update: Utc::now(),
        }
    }
}

/// Process-wide counters that outlive a single session.
#[derive(Debug, Clone, Default)]
pub struct SessionCounters {
    nonce: u32,
}

impl SessionCounters {
    pub fn starting_at(nonce: u32) -> Self {
        Self { nonce }
    }

    pub fn current_nonce(&self) -> u32 {
        self.nonce
    }

    /// Next want-config nonce. Wraps after `u32::MAX` and never yields 0,
    /// since 0 can never be echoed as a completion.
    pub fn next_nonce(&mut self) -> u32 {
        self.nonce = if self.nonce >= u32::MAX { 0 } else { self.nonce + 1 };
        if self.nonce == 0 {
            self.nonce = 1;
        }
        self.nonce
    }
}

/// Exactly one exists while a peripheral is connected.
#[derive(Debug)]
pub struct ConnectionSession {
    pub device: Device,
    bound: HashSet<CharacteristicRole>,
    /// Nonce of the most recent want-config; 0 before the first one.
    pub nonce: u32,
    pub is_subscribed: bool,
    pub is_invalid_firmware: bool,
    pub last_connection_error: Option<String>,
    pub handshake_attempts: u32,
    pub handshake_started: Option<Instant>,
    /// App-port packets held until config-complete.
    pub deferred: VecDeque<proto::MeshPacket>,
    /// Set once a low battery notification has fired for the current episode.
    pub low_battery_latched: bool,
    pub firmware_version: Option<String>,
}

impl ConnectionSession {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            bound: HashSet::new(),
            nonce: 0,
            is_subscribed: false,
            is_invalid_firmware: false,
            last_connection_error: None,
            handshake_attempts: 0,
            handshake_started: None,
            deferred: VecDeque::new(),
            low_battery_latched: false,
            firmware_version: None,
        }
    }

    pub fn peripheral_id(&self) -> &str {
        &self.device.id
    }

    /// Node number of the connected radio, 0 until my-info arrives.
    pub fn node_num(&self) -> u32 {
        self.device.num
    }

    pub fn bind(&mut self, role: CharacteristicRole) {
        self.bound.insert(role);
    }

    pub fn is_bound(&self, role: CharacteristicRole) -> bool {
        self.bound.contains(&role)
    }

    /// True for the completion echo of the current want-config only.
    pub fn completes_handshake(&self, config_complete_id: u32) -> bool {
        config_complete_id != 0 && config_complete_id == self.nonce
    }

    /// Hold a packet until config-complete; returns true when an older one was dropped.
    pub fn defer(&mut self, packet: proto::MeshPacket, limit: usize) -> bool {
        if limit == 0 {
            return true;
        }
        let mut dropped = false;
        while self.deferred.len() >= limit {
            self.deferred.pop_front();
            dropped = true;
        }
        self.deferred.push_back(packet);
        dropped
    }
}
