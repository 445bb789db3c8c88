// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Platform capability queries and change notifications.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

/// Used when a tunneled sink advertises no HDMI rates at all.
const DEFAULT_SAMPLE_RATE: u32 = 48_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityChange {
    HdmiPlugged(bool),
    BluetoothSinkReady(bool),
    /// Supported encodings or sample rates changed.
    AudioCapabilities,
}

/// Sending half handed to a [`CapabilitySource`] on subscription.
#[derive(Debug, Clone)]
pub struct CapabilityNotifier {
    tx: Sender<CapabilityChange>,
}

impl CapabilityNotifier {
    /// Returns `false` once the subscriber is gone.
    pub fn notify(&self, change: CapabilityChange) -> bool {
        self.tx.send(change).is_ok()
    }
}

/// Audio/video output capabilities of the platform.
pub trait CapabilitySource: Send + Sync {
    /// The video decoder can render in tunneled mode.
    fn is_tunneled_playback_supported(&self) -> bool;

    fn is_hdmi_plugged(&self) -> bool;

    fn is_bluetooth_sink_ready(&self) -> bool;

    fn is_encoding_supported(&self, _mime: &str) -> bool {
        false
    }

    fn hdmi_sample_rates(&self) -> Vec<u32> {
        Vec::new()
    }

    /// Register for change notifications. Sources without dynamic state may
    /// ignore the notifier.
    fn subscribe(&self, notifier: CapabilityNotifier);
}

/// Receiving half owned by the scheduler, polled once per tick.
pub struct CapabilityWatch {
    rx: Receiver<CapabilityChange>,
}

impl CapabilityWatch {
    pub fn subscribe(source: &dyn CapabilitySource) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        source.subscribe(CapabilityNotifier { tx });
        Self { rx }
    }

    pub fn take_changes(&self) -> Vec<CapabilityChange> {
        self.rx.try_iter().collect()
    }
}

/// Fixed capabilities, for platforms without hot-plug reporting.
#[derive(Debug, Default)]
pub struct StaticCapabilities {
    pub tunneled_playback: bool,
    pub hdmi_plugged: bool,
    pub bluetooth_sink_ready: bool,
    pub hdmi_sample_rates: Vec<u32>,
    notifiers: Mutex<Vec<CapabilityNotifier>>,
}

impl StaticCapabilities {
    pub fn new(tunneled_playback: bool, hdmi_plugged: bool) -> Self {
        Self {
            tunneled_playback,
            hdmi_plugged,
            ..Self::default()
        }
    }

    pub fn with_bluetooth_sink_ready(mut self, ready: bool) -> Self {
        self.bluetooth_sink_ready = ready;
        self
    }

    pub fn with_hdmi_sample_rates(mut self, rates: Vec<u32>) -> Self {
        self.hdmi_sample_rates = rates;
        self
    }

    pub fn shared(self) -> Arc<dyn CapabilitySource> {
        Arc::new(self)
    }
}

impl CapabilitySource for StaticCapabilities {
    fn is_tunneled_playback_supported(&self) -> bool {
        self.tunneled_playback
    }

    fn is_hdmi_plugged(&self) -> bool {
        self.hdmi_plugged
    }

    fn is_bluetooth_sink_ready(&self) -> bool {
        self.bluetooth_sink_ready
    }

    fn hdmi_sample_rates(&self) -> Vec<u32> {
        self.hdmi_sample_rates.clone()
    }

    fn subscribe(&self, notifier: CapabilityNotifier) {
        self.notifiers.lock().push(notifier);
    }
}

/// Sink sample rate for a tunneled HDMI output: the preferred rate when
/// advertised, else the closest lower one, else the first advertised.
pub fn best_sample_rate(advertised: &[u32], preferred: u32) -> u32 {
    if advertised.is_empty() {
        return DEFAULT_SAMPLE_RATE;
    }
    if advertised.contains(&preferred) {
        return preferred;
    }
    advertised
        .iter()
        .copied()
        .filter(|rate| *rate < preferred)
        .max()
        .unwrap_or(advertised[0])
}
