//! Load-test frames.
//!
//! A client announces a run with a start frame, streams numbered data
//! frames stamped with the send time, and the server answers with a
//! result frame once every announced message has arrived.
//!
//! ## Frames
//!
//! - start (10): `message_count, message_size, interval_ms` (u32 each)
//! - data (11): `sequence_number, timestamp_ms` (u32 each) + payload
//! - result (12): `total, received, lost` (u32 each) + average, max and
//!   min latency in ms and data rate in MB/s (f32 each)

use crate::runtime::{
    build_packet, packet_body, PacketError, PacketHandler, SendBuffer, SendContext, Session,
};
use bytes::{Buf, BufMut};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const STRESS_START: u16 = 10;
pub const STRESS_DATA: u16 = 11;
pub const STRESS_RESULT: u16 = 12;

/// Largest payload carried by one data frame.
pub const MAX_STRESS_PAYLOAD: usize = 4000;

const START_BODY_LEN: usize = 12;
const DATA_HEADER_LEN: usize = 8;
const RESULT_BODY_LEN: usize = 28;

/// Wall-clock milliseconds truncated to 32 bits.
pub fn timestamp_ms() -> u32 {
    Utc::now().timestamp_millis() as u32
}

/// Parameters of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StressStart {
    pub message_count: u32,
    pub message_size: u32,
    pub interval_ms: u32,
}

impl StressStart {
    pub fn encode(&self, cx: &mut SendContext) -> Option<SendBuffer> {
        build_packet(cx, STRESS_START, START_BODY_LEN, |mut body| {
            body.put_u32_le(self.message_count);
            body.put_u32_le(self.message_size);
            body.put_u32_le(self.interval_ms);
        })
    }

    pub fn decode(packet: &[u8]) -> Result<Self, PacketError> {
        let (_, mut body) = packet_body(packet, START_BODY_LEN)?;
        Ok(Self {
            message_count: body.get_u32_le(),
            message_size: body.get_u32_le(),
            interval_ms: body.get_u32_le(),
        })
    }

    /// Payload size actually sent per data frame.
    pub fn payload_len(&self) -> usize {
        (self.message_size as usize).min(MAX_STRESS_PAYLOAD)
    }
}

/// Data frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StressData {
    pub sequence_number: u32,
    pub timestamp_ms: u32,
}

impl StressData {
    /// Encode with a payload of `payload_len` filler bytes.
    pub fn encode(&self, cx: &mut SendContext, payload_len: usize) -> Option<SendBuffer> {
        let payload_len = payload_len.min(MAX_STRESS_PAYLOAD);
        build_packet(cx, STRESS_DATA, DATA_HEADER_LEN + payload_len, |mut body| {
            body.put_u32_le(self.sequence_number);
            body.put_u32_le(self.timestamp_ms);
            for (i, b) in body.iter_mut().enumerate() {
                *b = i as u8;
            }
        })
    }

    /// Decode the header and return the payload length.
    pub fn decode(packet: &[u8]) -> Result<(Self, usize), PacketError> {
        let (_, mut body) = packet_body(packet, DATA_HEADER_LEN)?;
        let data = Self {
            sequence_number: body.get_u32_le(),
            timestamp_ms: body.get_u32_le(),
        };
        Ok((data, body.remaining()))
    }
}

/// Outcome of a run as measured by the receiver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StressResult {
    pub total_messages: u32,
    pub received_messages: u32,
    pub lost_messages: u32,
    pub avg_latency_ms: f32,
    pub max_latency_ms: f32,
    pub min_latency_ms: f32,
    pub data_rate_mbps: f32,
}

impl StressResult {
    pub fn encode(&self, cx: &mut SendContext) -> Option<SendBuffer> {
        build_packet(cx, STRESS_RESULT, RESULT_BODY_LEN, |mut body| {
            body.put_u32_le(self.total_messages);
            body.put_u32_le(self.received_messages);
            body.put_u32_le(self.lost_messages);
            body.put_f32_le(self.avg_latency_ms);
            body.put_f32_le(self.max_latency_ms);
            body.put_f32_le(self.min_latency_ms);
            body.put_f32_le(self.data_rate_mbps);
        })
    }

    pub fn decode(packet: &[u8]) -> Result<Self, PacketError> {
        let (_, mut body) = packet_body(packet, RESULT_BODY_LEN)?;
        Ok(Self {
            total_messages: body.get_u32_le(),
            received_messages: body.get_u32_le(),
            lost_messages: body.get_u32_le(),
            avg_latency_ms: body.get_f32_le(),
            max_latency_ms: body.get_f32_le(),
            min_latency_ms: body.get_f32_le(),
            data_rate_mbps: body.get_f32_le(),
        })
    }
}

/// Running statistics for one run.
#[derive(Debug, Default)]
struct StressStats {
    expected: u32,
    received: u32,
    bytes: u64,
    latency_sum_ms: f64,
    latency_max_ms: u32,
    latency_min_ms: Option<u32>,
    first_arrival: Option<DateTime<Utc>>,
    last_arrival: Option<DateTime<Utc>>,
}

impl StressStats {
    fn start(expected: u32) -> Self {
        Self {
            expected,
            ..Self::default()
        }
    }

    fn record(&mut self, data: &StressData, payload_len: usize, now: DateTime<Utc>) {
        let latency = (now.timestamp_millis() as u32).wrapping_sub(data.timestamp_ms);

        self.received += 1;
        self.bytes += payload_len as u64;
        self.latency_sum_ms += latency as f64;
        self.latency_max_ms = self.latency_max_ms.max(latency);
        self.latency_min_ms = Some(self.latency_min_ms.map_or(latency, |min| min.min(latency)));
        self.first_arrival.get_or_insert(now);
        self.last_arrival = Some(now);
    }

    fn is_complete(&self) -> bool {
        self.expected > 0 && self.received >= self.expected
    }

    fn result(&self) -> StressResult {
        let avg = if self.received > 0 {
            self.latency_sum_ms / self.received as f64
        } else {
            0.0
        };

        let elapsed = match (self.first_arrival, self.last_arrival) {
            (Some(first), Some(last)) => (last - first).num_milliseconds() as f64 / 1000.0,
            _ => 0.0,
        };
        let rate = if elapsed > 0.0 {
            self.bytes as f64 / (1024.0 * 1024.0) / elapsed
        } else {
            0.0
        };

        StressResult {
            total_messages: self.expected,
            received_messages: self.received,
            lost_messages: self.expected.saturating_sub(self.received),
            avg_latency_ms: avg as f32,
            max_latency_ms: self.latency_max_ms as f32,
            min_latency_ms: self.latency_min_ms.unwrap_or(0) as f32,
            data_rate_mbps: rate as f32,
        }
    }
}

/// Server side: measures a run and replies with its result.
#[derive(Debug, Default)]
pub struct StressReceiver {
    stats: Mutex<StressStats>,
}

impl StressReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(
        &self,
        session: &Arc<Session>,
        cx: &mut SendContext,
        packet: &[u8],
    ) -> Result<(), PacketError> {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());

        match packet_body(packet, 0)?.0.id {
            STRESS_START => {
                let start = StressStart::decode(packet)?;
                info!(
                    session = session.id(),
                    messages = start.message_count,
                    size = start.message_size,
                    interval_ms = start.interval_ms,
                    "Stress run started"
                );
                *stats = StressStats::start(start.message_count);
            }
            STRESS_DATA => {
                let (data, payload_len) = StressData::decode(packet)?;
                stats.record(&data, payload_len, Utc::now());

                if stats.is_complete() {
                    let result = stats.result();
                    info!(
                        session = session.id(),
                        received = result.received_messages,
                        avg_latency_ms = result.avg_latency_ms,
                        rate_mbps = result.data_rate_mbps,
                        "Stress run finished"
                    );
                    *stats = StressStats::default();
                    match result.encode(cx) {
                        Some(reply) => session.send(reply),
                        None => warn!(session = session.id(), "No send buffer for stress result"),
                    }
                }
            }
            id => return Err(PacketError::UnexpectedId(id)),
        }
        Ok(())
    }
}

impl PacketHandler for StressReceiver {
    fn on_recv_packet(&self, session: &Arc<Session>, cx: &mut SendContext, packet: &[u8]) {
        if let Err(e) = self.handle(session, cx, packet) {
            warn!(session = session.id(), error = %e, "Malformed stress frame");
            session.disconnect("malformed stress frame");
        }
    }
}

/// Stream one run over `session`. Returns the number of data frames sent.
pub async fn run_stress(session: Arc<Session>, start: StressStart) -> u32 {
    let mut cx = session.send_buffers().context();
    match start.encode(&mut cx) {
        Some(frame) => session.send(frame),
        None => return 0,
    }

    let interval = Duration::from_millis(start.interval_ms as u64);
    let mut sent = 0;
    for sequence_number in 0..start.message_count {
        if !session.is_connected() {
            debug!(session = session.id(), sent, "Stress run interrupted");
            break;
        }

        let data = StressData {
            sequence_number,
            timestamp_ms: timestamp_ms(),
        };
        let Some(frame) = data.encode(&mut cx, start.payload_len()) else {
            break;
        };
        session.send(frame);
        sent += 1;

        if !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
    }
    sent
}

/// Why a client session ended without a result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StressError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("disconnected before the result arrived")]
    Disconnected,
}

/// What one client session reports when it ends.
pub type StressOutcome = Result<StressResult, StressError>;

/// Client side: starts a run on connect and reports the result.
///
/// Every session reports exactly one outcome: the server's result, or
/// the reason it never arrived.
pub struct StressClientHandler {
    start: StressStart,
    results: Option<mpsc::UnboundedSender<StressOutcome>>,
    reported: AtomicBool,
}

impl StressClientHandler {
    pub fn new(start: StressStart) -> Self {
        Self {
            start,
            results: None,
            reported: AtomicBool::new(false),
        }
    }

    pub fn with_results(mut self, results: mpsc::UnboundedSender<StressOutcome>) -> Self {
        self.results = Some(results);
        self
    }

    fn report(&self, outcome: StressOutcome) {
        if self.reported.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(results) = &self.results {
            let _ = results.send(outcome);
        }
    }
}

impl PacketHandler for StressClientHandler {
    fn on_connected(&self, session: &Arc<Session>, _cx: &mut SendContext) {
        let runtime = session.runtime().clone();
        runtime.spawn(run_stress(Arc::clone(session), self.start));
    }

    fn on_recv_packet(&self, session: &Arc<Session>, _cx: &mut SendContext, packet: &[u8]) {
        match StressResult::decode(packet) {
            Ok(result) => {
                info!(
                    session = session.id(),
                    total = result.total_messages,
                    received = result.received_messages,
                    lost = result.lost_messages,
                    avg_latency_ms = result.avg_latency_ms,
                    max_latency_ms = result.max_latency_ms,
                    min_latency_ms = result.min_latency_ms,
                    rate_mbps = result.data_rate_mbps,
                    "Stress result"
                );
                self.report(Ok(result));
            }
            Err(e) => warn!(session = session.id(), error = %e, "Malformed stress result"),
        }
    }

    fn on_disconnected(&self, session: &Arc<Session>) {
        if !self.reported.load(Ordering::Acquire) {
            warn!(session = session.id(), "Stress session closed without a result");
        }
        self.report(Err(StressError::Disconnected));
    }

    fn on_connect_failed(&self, session: &Arc<Session>, error: &std::io::Error) {
        warn!(session = session.id(), error = %error, "Stress client could not connect");
        self.report(Err(StressError::ConnectFailed(error.to_string())));
    }
}
