// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The control-plane boundary: discovery and liveness notifications live
//! behind [`BrokerAdapter`], never on the data path. A real adapter (a
//! ZeroMQ client, say) is implemented outside this crate; this module
//! only defines the trait, a no-op implementation, and the fire-and-forget
//! dispatch loop every adapter needs to talk to without blocking a
//! producer or consumer thread.

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use std::thread::{self, JoinHandle};

/// Schema hashes a producer registers under a channel name, so a later
/// discoverer can detect an incompatible republish before attaching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaHashes {
    pub slot_schema_hash: u64,
    pub flex_zone_schema_hash: u64,
}

/// What a `discover_producer` lookup returns for a live channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub shm_name: String,
    pub schema: SchemaHashes,
    pub metadata: Vec<u8>,
}

/// Why a channel's producer-side registration was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    SchemaMismatch,
}

/// A broker-pushed notification delivered to a producer or consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerNotification {
    ChannelClosing { channel: String },
    ConsumerDied { channel: String, pid: u64 },
    ChannelError { channel: String, kind: String },
}

/// A core-pushed, fire-and-forget report sent to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerReport {
    ChecksumError { channel: String, slot_id: u64 },
}

/// The capabilities the core requires from a control-plane broker.
///
/// Every method here is expected to be cheap and non-blocking from the
/// data path's point of view; an implementation backed by a real network
/// client should do its own I/O off the calling thread (see
/// [`Dispatcher`]), not inside these calls.
pub trait BrokerAdapter: Send + Sync {
    fn register_producer(
        &self,
        channel: &str,
        shm_name: &str,
        schema: SchemaHashes,
        config_blob: &[u8],
    ) -> Result<(), RegisterError>;

    fn discover_producer(&self, channel: &str) -> Option<ProducerRecord>;

    fn deregister_producer(&self, channel: &str, pid: u64);

    fn register_consumer(&self, channel: &str, consumer_uid: &[u8], pid: u64);

    fn deregister_consumer(&self, channel: &str, consumer_uid: &[u8], pid: u64);

    /// Report a checksum failure observed on release. Best-effort; a
    /// `NullBrokerAdapter` simply drops it.
    fn report(&self, report: BrokerReport);
}

/// No-op adapter for single-host, discovery-less deployments where no
/// broker process is configured. Discovery always misses; registration
/// always succeeds; notifications and reports go nowhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBrokerAdapter;

impl BrokerAdapter for NullBrokerAdapter {
    fn register_producer(
        &self,
        _channel: &str,
        _shm_name: &str,
        _schema: SchemaHashes,
        _config_blob: &[u8],
    ) -> Result<(), RegisterError> {
        Ok(())
    }

    fn discover_producer(&self, _channel: &str) -> Option<ProducerRecord> {
        None
    }

    fn deregister_producer(&self, _channel: &str, _pid: u64) {}

    fn register_consumer(&self, _channel: &str, _consumer_uid: &[u8], _pid: u64) {}

    fn deregister_consumer(&self, _channel: &str, _consumer_uid: &[u8], _pid: u64) {}

    fn report(&self, _report: BrokerReport) {}
}

/// Bounded queue depth for the dispatch channel. A slow or wedged broker
/// adapter should never be able to make the core's producers/consumers
/// pile up memory; reports past this depth are dropped and logged.
const DISPATCH_QUEUE_DEPTH: usize = 1024;

/// Runs a `BrokerAdapter`'s outbound reports on a dedicated thread so
/// `report()` never blocks the caller on network I/O. Notifications
/// flowing the other way (broker -> core) are the adapter's own
/// responsibility to deliver; this type only owns the outbound half.
pub struct Dispatcher {
    sender: Sender<BrokerReport>,
    worker: Option<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn spawn(adapter: impl BrokerAdapter + 'static) -> Self {
        let (sender, receiver): (Sender<BrokerReport>, Receiver<BrokerReport>) =
            channel::bounded(DISPATCH_QUEUE_DEPTH);
        let worker = thread::Builder::new()
            .name("datahub-broker-dispatch".into())
            .spawn(move || {
                for report in receiver.iter() {
                    adapter.report(report);
                }
            })
            .expect("failed to spawn broker dispatch thread");
        Self { sender, worker: Some(worker) }
    }

    /// Enqueue a report for the dispatch thread. Never blocks; if the
    /// queue is full the report is dropped and a warning is logged,
    /// since a backed-up broker must never slow down the data path.
    pub fn report(&self, report: BrokerReport) {
        match self.sender.try_send(report) {
            Ok(()) => {}
            Err(TrySendError::Full(report)) => {
                log::warn!("broker dispatch queue full, dropping report: {report:?}");
            }
            Err(TrySendError::Disconnected(_)) => {
                log::warn!("broker dispatch thread is gone, dropping report");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Dropping `sender` closes the channel, which ends the worker's
        // `for report in receiver.iter()` loop.
        if let Some(worker) = self.worker.take() {
            worker.join().ok();
        }
    }
}
