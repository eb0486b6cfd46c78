//! The per-stream ingest worker: one thread owning one source and its
//! filter chain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use log::debug;
use parking_lot::Mutex;
use strand_wire as wire;
use strand_wire::MediaType;

use crate::filter::FilterChain;
use crate::options::{FilterOptions, SourceOptions};
use crate::packet;
use crate::params::CodecParameters;
use crate::rate::Rate;
use crate::source::Source;
use crate::Error;

/// Lifecycle events of one ingest worker.
#[derive(Debug)]
pub enum StreamEvent {
    /// About to open the source.
    Open,
    /// Source opened and probed.
    Opened,
    /// One packet pulled from the demuxer.
    GetPacket { stream_index: usize },
    /// One frame decoded, for frame-level consumers.
    GetFrame { media_type: MediaType },
    /// About to close the source.
    Close,
    /// Source closed.
    Closed,
    /// Upstream hit EOF; the source is being re-opened.
    Loop,
    /// The worker failed; it transitions to `Failed` and stops.
    Error(Error),
}

/// Receives lifecycle events, on the worker thread.
pub type EventSink = Box<dyn Fn(&StreamEvent) + Send>;

/// Receives every packet that fell out of the filter chain, together with
/// the sub-stream's current codec parameters.
pub type PublishSink = Box<dyn Fn(MediaType, &CodecParameters, &wire::Packet) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Opening,
    Running,
    Closing,
    Failed,
}

/// Configuration of one worker.
pub struct WorkerConfig {
    pub id: String,
    pub source: SourceOptions,
    pub filters: Vec<FilterOptions>,
    /// Pull cadence in Hz.
    pub frequency: u32,
    /// Re-open the source on EOF instead of stopping.
    pub loop_on_eof: bool,
}

impl WorkerConfig {
    pub fn new(id: impl Into<String>, source: SourceOptions) -> WorkerConfig {
        WorkerConfig {
            id: id.into(),
            source,
            filters: Vec::new(),
            frequency: 20,
            loop_on_eof: true,
        }
    }
}

/// Handle to a running ingest worker. Dropping it stops the thread.
pub struct IngestWorker {
    id: String,
    running: Arc<AtomicBool>,
    state: Arc<Mutex<WorkerState>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl IngestWorker {
    /// Spawns the worker thread and starts the open/run loop.
    pub fn start(
        config: WorkerConfig,
        events: EventSink,
        publish: PublishSink,
    ) -> Result<IngestWorker, Error> {
        if config.frequency == 0 {
            return Err(Error::Config("stream frequency must be positive".into()));
        }
        let running = Arc::new(AtomicBool::new(true));
        let state = Arc::new(Mutex::new(WorkerState::Idle));
        let id = config.id.clone();
        let thread = thread::Builder::new()
            .name(format!("stream-{}", id))
            .spawn({
                let running = running.clone();
                let state = state.clone();
                move || run(config, &running, &state, events, publish)
            })
            .map_err(|e| Error::Config(format!("can't spawn worker thread: {}", e)))?;
        Ok(IngestWorker {
            id,
            running,
            state,
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Requests a stop and joins the thread at the next tick boundary.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for IngestWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    config: WorkerConfig,
    running: &AtomicBool,
    state: &Mutex<WorkerState>,
    events: EventSink,
    publish: PublishSink,
) {
    loop {
        *state.lock() = WorkerState::Opening;
        events(&StreamEvent::Open);
        let mut source = match Source::open(&config.source) {
            Ok(s) => s,
            Err(e) => {
                events(&StreamEvent::Error(e));
                *state.lock() = WorkerState::Failed;
                break;
            }
        };
        events(&StreamEvent::Opened);

        let (video_index, params_slot, mut chain) = {
            let video = match source.sub_stream(MediaType::Video) {
                Ok(v) => v,
                Err(e) => {
                    events(&StreamEvent::Error(e));
                    *state.lock() = WorkerState::Failed;
                    break;
                }
            };
            let chain = match FilterChain::new(video, &config.filters) {
                Ok(c) => c,
                Err(e) => {
                    events(&StreamEvent::Error(e));
                    *state.lock() = WorkerState::Failed;
                    break;
                }
            };
            (video.index(), video.params_slot(), chain)
        };

        *state.lock() = WorkerState::Running;
        let mut rate = Rate::new(config.frequency);
        let mut result = Ok(());
        while running.load(Ordering::Relaxed) {
            match source.next_packet() {
                Ok(pkt) => {
                    events(&StreamEvent::GetPacket {
                        stream_index: pkt.stream(),
                    });
                    if pkt.stream() == video_index {
                        let fed = chain.feed(&pkt, &mut |out| {
                            let params = params_slot.read().clone();
                            publish(MediaType::Video, &params, &packet::to_wire(out, MediaType::Video));
                            Ok(())
                        });
                        if let Err(e) = fed {
                            result = Err(e);
                            break;
                        }
                    }
                    // `pkt` is released here, before the sleep.
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
            rate.sleep();
        }

        match result {
            Err(Error::Eof) if config.loop_on_eof && running.load(Ordering::Relaxed) => {
                // Recoverable: re-open and keep feeding subscribers.
                debug!("{}: eof, looping", config.id);
                events(&StreamEvent::Loop);
                source.close();
                continue;
            }
            Err(e) if !e.is_eof() => {
                events(&StreamEvent::Error(e));
                *state.lock() = WorkerState::Failed;
                break;
            }
            // Explicit stop, or EOF without loop: orderly close.
            _ => {
                *state.lock() = WorkerState::Closing;
                events(&StreamEvent::Close);
                source.close();
                events(&StreamEvent::Closed);
                break;
            }
        }
    }
    *state.lock() = WorkerState::Idle;
}
