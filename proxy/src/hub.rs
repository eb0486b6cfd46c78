//! Publish/subscribe hub: the stream registry and the fan-out.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info};
use parking_lot::Mutex;
use serde::Serialize;
use strand_media::CodecParameters;
use strand_wire as wire;
use strand_wire::MediaType;
use tokio::sync::Notify;

/// The single source of truth for "what streams exist", plus the routing of
/// each stream's packets to its current subscribers.
///
/// Locking: one mutex for the registry, one per subscriber queue. The
/// registry lock is released before any queue is touched and is never held
/// across I/O.
pub struct StreamHub {
    send_queue_max: usize,
    next_session: AtomicU64,
    registry: Mutex<HashMap<String, StreamEntry>>,
}

#[derive(Default)]
struct StreamEntry {
    params: HashMap<MediaType, CodecParameters>,
    subscribers: Vec<Arc<Subscriber>>,
}

/// One subscriber session's hub-side handle: its bounded outbound queue and
/// the doorbell of the writer task.
pub struct Subscriber {
    id: u64,
    stream_id: String,
    queue: Mutex<SendQueue>,
    notify: Notify,
    closed: AtomicBool,
}

impl Subscriber {
    /// Waits until there is something to send or the hub shut down.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    /// Takes the next serialized packet, if any.
    pub fn try_next(&self) -> Option<Bytes> {
        self.queue.lock().pop()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn enqueue(&self, buf: Bytes, key: bool) {
        let dropped = {
            let mut q = self.queue.lock();
            q.push(buf, key)
        };
        if dropped {
            debug!(
                "stream[{}] session {} slow, dropped one buffer",
                self.stream_id, self.id
            );
        }
        self.notify.notify_one();
    }
}

/// Bounded FIFO of serialized packets with eldest-drop. On overflow the
/// eldest non-keyframe goes first; only when every queued buffer is a
/// keyframe is the eldest of those dropped.
struct SendQueue {
    buffers: VecDeque<(Bytes, bool)>,
    max: usize,
}

impl SendQueue {
    fn new(max: usize) -> SendQueue {
        SendQueue {
            buffers: VecDeque::with_capacity(max.min(64)),
            max,
        }
    }

    /// Returns true when an old buffer had to be dropped.
    fn push(&mut self, buf: Bytes, key: bool) -> bool {
        let mut dropped = false;
        if self.max > 0 && self.buffers.len() >= self.max {
            let victim = self
                .buffers
                .iter()
                .position(|(_, key)| !*key)
                .unwrap_or(0);
            self.buffers.remove(victim);
            dropped = true;
        }
        self.buffers.push_back((buf, key));
        dropped
    }

    fn pop(&mut self) -> Option<Bytes> {
        self.buffers.pop_front().map(|(buf, _)| buf)
    }
}

/// One entry of the JSON stream index.
#[derive(Serialize)]
pub struct StreamIndexEntry {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<Track>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<Track>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<Track>,
}

#[derive(Serialize)]
pub struct Track {
    pub codecpar: CodecParameters,
}

impl StreamHub {
    pub fn new(send_queue_max: usize) -> StreamHub {
        StreamHub {
            send_queue_max,
            next_session: AtomicU64::new(1),
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Routes one packet to every current subscriber of `id`, registering
    /// the stream on first sight and refreshing its codec parameters.
    ///
    /// The packet is serialized once; all subscribers share the buffer.
    pub fn publish(
        &self,
        id: &str,
        media_type: MediaType,
        params: &CodecParameters,
        pkt: &wire::Packet,
    ) {
        let buf = pkt.encode();
        let key = pkt.is_key();
        let subscribers: Vec<Arc<Subscriber>> = {
            let mut reg = self.registry.lock();
            let entry = reg.entry(id.to_string()).or_insert_with(|| {
                info!("stream[{}] start", id);
                StreamEntry::default()
            });
            // Overwritten on every publish: a looped source may come back
            // with different parameters.
            entry.params.insert(media_type, params.clone());
            entry.subscribers.clone()
        };
        for sub in subscribers {
            sub.enqueue(buf.clone(), key);
        }
    }

    /// True when `id` is a registered stream.
    pub fn contains(&self, id: &str) -> bool {
        self.registry.lock().contains_key(id)
    }

    /// Adds a session to a stream's subscriber set. `None` when the stream
    /// is unknown.
    pub fn join(&self, id: &str) -> Option<Arc<Subscriber>> {
        let mut reg = self.registry.lock();
        let entry = reg.get_mut(id)?;
        let sub = Arc::new(Subscriber {
            id: self.next_session.fetch_add(1, Ordering::Relaxed),
            stream_id: id.to_string(),
            queue: Mutex::new(SendQueue::new(self.send_queue_max)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        entry.subscribers.push(sub.clone());
        info!("stream[{}] session {} joined", id, sub.id);
        Some(sub)
    }

    /// Removes a session from its stream. Idempotent; called on every
    /// terminal session event.
    pub fn leave(&self, sub: &Arc<Subscriber>) {
        let mut reg = self.registry.lock();
        if let Some(entry) = reg.get_mut(&sub.stream_id) {
            let before = entry.subscribers.len();
            entry.subscribers.retain(|s| s.id != sub.id);
            if entry.subscribers.len() != before {
                info!("stream[{}] session {} left", sub.stream_id, sub.id);
            }
        }
    }

    /// Marks every subscriber closed and rings its doorbell so writer tasks
    /// wind down.
    pub fn shutdown(&self) {
        let reg = self.registry.lock();
        for entry in reg.values() {
            for sub in &entry.subscribers {
                sub.closed.store(true, Ordering::Relaxed);
                sub.notify.notify_one();
            }
        }
    }

    /// Snapshot for `GET /streams`, ordered by id.
    pub fn stream_index(&self) -> Vec<StreamIndexEntry> {
        let reg = self.registry.lock();
        let mut out: Vec<StreamIndexEntry> = reg
            .iter()
            .map(|(id, entry)| {
                let track = |t: MediaType| {
                    entry.params.get(&t).map(|p| Track {
                        codecpar: p.clone(),
                    })
                };
                StreamIndexEntry {
                    id: id.clone(),
                    video: track(MediaType::Video),
                    audio: track(MediaType::Audio),
                    subtitle: track(MediaType::Subtitle),
                }
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn queue_len(sub: &Subscriber) -> usize {
        sub.queue.lock().buffers.len()
    }

    fn packet(pts: i64, key: bool) -> wire::Packet {
        wire::Packet {
            media_type: MediaType::Video,
            pts,
            dts: pts,
            payload: Bytes::from(vec![pts as u8; 16]),
            stream_index: 0,
            flags: if key { wire::FLAG_KEY } else { 0 },
            side_data: Vec::new(),
            duration: 1,
            pos: -1,
        }
    }

    fn params() -> CodecParameters {
        CodecParameters {
            codec_type: 0,
            codec_id: 27,
            width: Some(640),
            height: Some(480),
            ..CodecParameters::default()
        }
    }

    #[test]
    fn registry_starts_on_first_publish() {
        let hub = StreamHub::new(5);
        assert!(!hub.contains("a"));
        assert!(hub.join("a").is_none());
        hub.publish("a", MediaType::Video, &params(), &packet(0, true));
        assert!(hub.contains("a"));
        assert!(hub.join("a").is_some());
    }

    #[test]
    fn fan_out_is_byte_identical() {
        let hub = StreamHub::new(5);
        hub.publish("a", MediaType::Video, &params(), &packet(0, true));
        let s1 = hub.join("a").unwrap();
        let s2 = hub.join("a").unwrap();
        for i in 1..4 {
            hub.publish("a", MediaType::Video, &params(), &packet(i, i == 1));
        }
        let b1: Vec<Bytes> = std::iter::from_fn(|| s1.try_next()).collect();
        let b2: Vec<Bytes> = std::iter::from_fn(|| s2.try_next()).collect();
        assert_eq!(b1.len(), 3);
        assert_eq!(b1, b2);
        let decoded = wire::Packet::decode(&b1[0]).unwrap();
        assert_eq!(decoded.pts, 1);
        assert!(decoded.is_key());
    }

    #[test]
    fn subscribers_only_see_their_stream() {
        let hub = StreamHub::new(5);
        hub.publish("a", MediaType::Video, &params(), &packet(0, true));
        hub.publish("b", MediaType::Video, &params(), &packet(100, true));
        let sa = hub.join("a").unwrap();
        hub.publish("a", MediaType::Video, &params(), &packet(1, false));
        hub.publish("b", MediaType::Video, &params(), &packet(101, false));
        let got = wire::Packet::decode(&sa.try_next().unwrap()).unwrap();
        assert_eq!(got.pts, 1);
        assert!(sa.try_next().is_none());
    }

    #[test]
    fn queue_bound_holds_and_prefers_dropping_delta_frames() {
        let hub = StreamHub::new(5);
        hub.publish("a", MediaType::Video, &params(), &packet(0, true));
        let sub = hub.join("a").unwrap();

        // Stalled subscriber: publish a key and then plenty of deltas.
        hub.publish("a", MediaType::Video, &params(), &packet(1, true));
        for i in 2..10 {
            hub.publish("a", MediaType::Video, &params(), &packet(i, false));
        }
        assert_eq!(queue_len(&sub), 5);

        // The keyframe survived the drops and is still first out.
        let first = wire::Packet::decode(&sub.try_next().unwrap()).unwrap();
        assert!(first.is_key());
        assert_eq!(first.pts, 1);
        // The rest are the newest deltas.
        let mut rest = Vec::new();
        while let Some(buf) = sub.try_next() {
            rest.push(wire::Packet::decode(&buf).unwrap().pts);
        }
        assert_eq!(rest, vec![6, 7, 8, 9]);
    }

    #[test]
    fn all_key_queue_drops_eldest_key() {
        let mut q = SendQueue::new(2);
        assert!(!q.push(Bytes::from_static(b"k1"), true));
        assert!(!q.push(Bytes::from_static(b"k2"), true));
        assert!(q.push(Bytes::from_static(b"k3"), true));
        assert_eq!(q.len(), 2);
        assert_eq!(&q.pop().unwrap()[..], b"k2");
        assert_eq!(&q.pop().unwrap()[..], b"k3");
    }

    #[test]
    fn leave_is_idempotent_and_stops_delivery() {
        let hub = StreamHub::new(5);
        hub.publish("a", MediaType::Video, &params(), &packet(0, true));
        let sub = hub.join("a").unwrap();
        hub.leave(&sub);
        hub.leave(&sub);
        hub.publish("a", MediaType::Video, &params(), &packet(1, false));
        assert!(sub.try_next().is_none());
    }

    #[test]
    fn params_overwritten_on_publish() {
        let hub = StreamHub::new(5);
        hub.publish("a", MediaType::Video, &params(), &packet(0, true));
        let mut p2 = params();
        p2.width = Some(1920);
        p2.height = Some(1080);
        hub.publish("a", MediaType::Video, &p2, &packet(1, true));
        let index = hub.stream_index();
        assert_eq!(index.len(), 1);
        assert_eq!(index[0].id, "a");
        let video = index[0].video.as_ref().unwrap();
        assert_eq!(video.codecpar.width, Some(1920));
        assert!(index[0].audio.is_none());
    }

    #[test]
    fn shutdown_marks_subscribers_closed() {
        let hub = StreamHub::new(5);
        hub.publish("a", MediaType::Video, &params(), &packet(0, true));
        let sub = hub.join("a").unwrap();
        assert!(!sub.is_closed());
        hub.shutdown();
        assert!(sub.is_closed());
    }
}
