//! Per-session statistics

use crate::tuple::Side;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Milestones of new-session construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimePoint {
    /// Request arrived at the dispatcher
    NewSessionReceived,
    /// Request offered to the listener
    DispatchRequest,
    /// Listener decided
    RequestHandled,
    /// Session object constructed
    MadeSession,
    /// New-session event offered to the listener
    DispatchNew,
    /// Listener handled the new-session event
    NewHandled,
    /// Session added to the live table
    FinishNew,
}

impl TimePoint {
    /// All milestones in order
    pub const ALL: [TimePoint; 7] = [
        TimePoint::NewSessionReceived,
        TimePoint::DispatchRequest,
        TimePoint::RequestHandled,
        TimePoint::MadeSession,
        TimePoint::DispatchNew,
        TimePoint::NewHandled,
        TimePoint::FinishNew,
    ];

    /// Milestone name
    pub fn as_str(self) -> &'static str {
        match self {
            TimePoint::NewSessionReceived => "new_session_received",
            TimePoint::DispatchRequest => "dispatch_request",
            TimePoint::RequestHandled => "request_handled",
            TimePoint::MadeSession => "made_session",
            TimePoint::DispatchNew => "dispatch_new",
            TimePoint::NewHandled => "new_handled",
            TimePoint::FinishNew => "finish_new",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Milestone recorder used while a session is being built
#[derive(Debug, Clone)]
pub(crate) struct Timeline {
    start: Instant,
    marks: [Option<u64>; 7],
}

impl Timeline {
    pub(crate) fn start() -> Self {
        let mut timeline = Self {
            start: Instant::now(),
            marks: [None; 7],
        };
        timeline.mark(TimePoint::NewSessionReceived);
        timeline
    }

    pub(crate) fn mark(&mut self, point: TimePoint) {
        let micros = u64::try_from(self.start.elapsed().as_micros()).unwrap_or(u64::MAX);
        self.marks[point.index()] = Some(micros);
    }
}

/// Counters of one session
#[derive(Debug)]
pub struct SessionStats {
    c2s_chunks: AtomicU64,
    s2c_chunks: AtomicU64,
    c2s_bytes: AtomicU64,
    s2c_bytes: AtomicU64,
    dropped_packets: AtomicU64,
    times: Option<Mutex<[Option<u64>; 7]>>,
}

impl SessionStats {
    /// Create zeroed stats, with milestone times if `detailed_times`
    pub fn new(detailed_times: bool) -> Self {
        Self {
            c2s_chunks: AtomicU64::new(0),
            s2c_chunks: AtomicU64::new(0),
            c2s_bytes: AtomicU64::new(0),
            s2c_bytes: AtomicU64::new(0),
            dropped_packets: AtomicU64::new(0),
            times: detailed_times.then(|| Mutex::new([None; 7])),
        }
    }

    /// Count a chunk that arrived from `from`
    pub fn record_chunk(&self, from: Side, len: usize) {
        let len = len as u64;
        match from {
            Side::Client => {
                self.c2s_chunks.fetch_add(1, Ordering::Relaxed);
                self.c2s_bytes.fetch_add(len, Ordering::Relaxed);
            }
            Side::Server => {
                self.s2c_chunks.fetch_add(1, Ordering::Relaxed);
                self.s2c_bytes.fetch_add(len, Ordering::Relaxed);
            }
        }
    }

    /// Count a UDP packet dropped for exceeding the packet size limit
    pub fn record_dropped_packet(&self) {
        self.dropped_packets.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether milestone times are kept
    pub fn times_enabled(&self) -> bool {
        self.times.is_some()
    }

    pub(crate) fn adopt(&self, timeline: &Timeline) {
        if let Some(ref times) = self.times {
            *times.lock() = timeline.marks;
        }
    }

    /// Copy out the counters
    pub fn snapshot(&self) -> StatsSnapshot {
        let times = self
            .times
            .as_ref()
            .map(|times| {
                let marks = *times.lock();
                TimePoint::ALL
                    .iter()
                    .filter_map(|p| marks[p.index()].map(|us| (p.as_str(), us)))
                    .collect()
            })
            .unwrap_or_default();

        StatsSnapshot {
            c2s_chunks: self.c2s_chunks.load(Ordering::Relaxed),
            s2c_chunks: self.s2c_chunks.load(Ordering::Relaxed),
            c2s_bytes: self.c2s_bytes.load(Ordering::Relaxed),
            s2c_bytes: self.s2c_bytes.load(Ordering::Relaxed),
            dropped_packets: self.dropped_packets.load(Ordering::Relaxed),
            times,
        }
    }
}

/// Point-in-time copy of [`SessionStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Chunks from the client
    pub c2s_chunks: u64,
    /// Chunks from the server
    pub s2c_chunks: u64,
    /// Bytes from the client
    pub c2s_bytes: u64,
    /// Bytes from the server
    pub s2c_bytes: u64,
    /// Oversize UDP packets dropped
    pub dropped_packets: u64,
    /// Milestone offsets in microseconds since the request arrived
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub times: BTreeMap<&'static str, u64>,
}
