//! Bounded-queue batch pipeline: one producer, N workers, an optional sink.
//!
//! Termination protocol
//! - The producer pushes exactly one [`Message::Stop`] after its last batch.
//! - A worker that takes `Stop` pushes it back onto its input queue (waking the
//!   next sibling), then pushes one `Stop` downstream, then exits.
//! - The sink exits after seeing one `Stop` per worker feeding it.
//!
//! A failed worker or sink keeps draining its queue until it sees `Stop`, so a
//! failure never leaves a sibling or the producer blocked. Panics inside a
//! processor, sink or reader are caught and count as failures, so the relay still
//! happens. All threads run inside
//! one `std::thread::scope`; the first recorded failure is returned after every
//! thread has joined.

use std::any::Any;
use std::io::BufRead;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{debug, error, info};

use crate::error::{KmerError, Result, Stage};

/// Raw text record (one input line, without the line terminator).
pub type Record = String;

/// Unit of queue traffic: a batch of items, or the end-of-stream marker.
#[derive(Debug)]
pub enum Message<T> {
    Data(Vec<T>),
    Stop,
}

/// Bounded multi-producer multi-consumer queue of [`Message`]s.
///
/// The queue keeps both channel ends alive, so `push` only blocks (when full)
/// and `take` only blocks (when empty).
pub struct BatchQueue<T> {
    tx: Sender<Message<T>>,
    rx: Receiver<Message<T>>,
}

impl<T> BatchQueue<T> {
    /// Queue holding at most `capacity` messages (at least 1).
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        BatchQueue { tx, rx }
    }

    /// Push a message, blocking while the queue is full.
    pub fn push(&self, msg: Message<T>) -> Result<()> {
        self.tx.send(msg).map_err(|_| KmerError::QueueClosed)
    }

    /// Take the next message, blocking while the queue is empty.
    pub fn take(&self) -> Message<T> {
        self.rx.recv().unwrap_or(Message::Stop)
    }

    /// Non-blocking take.
    pub fn try_take(&self) -> Option<Message<T>> {
        self.rx.try_recv().ok()
    }

    /// Messages currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Pipeline sizing. Queue capacity × batch size bounds in-flight records.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    threads: usize,
    in_buffer_size: usize,
    in_queue_capacity: usize,
    out_buffer_size: usize,
    out_queue_capacity: usize,
    startup_warn_interval: Duration,
    startup_timeout: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let threads = num_cpus::get().max(1);
        Self {
            threads,
            in_buffer_size: 1000,
            in_queue_capacity: 2 * threads,
            out_buffer_size: 1000,
            out_queue_capacity: 2 * threads,
            startup_warn_interval: Duration::from_secs(5),
            startup_timeout: None,
        }
    }
}

impl PipelineConfig {
    /// Worker threads per stage, clamped to `1..=available parallelism`.
    pub fn threads(mut self, n: usize) -> Self {
        self.threads = n.clamp(1, num_cpus::get().max(1));
        self
    }
    /// Worker threads without the hardware clamp (tests, oversubscription).
    pub fn threads_unchecked(mut self, n: usize) -> Self {
        self.threads = n.max(1);
        self
    }
    /// Records per input batch.
    pub fn in_buffer_size(mut self, n: usize) -> Self {
        self.in_buffer_size = n.max(1);
        self
    }
    /// Input batches in flight.
    pub fn in_queue_capacity(mut self, n: usize) -> Self {
        self.in_queue_capacity = n.max(1);
        self
    }
    /// Records per output batch.
    pub fn out_buffer_size(mut self, n: usize) -> Self {
        self.out_buffer_size = n.max(1);
        self
    }
    /// Output batches in flight.
    pub fn out_queue_capacity(mut self, n: usize) -> Self {
        self.out_queue_capacity = n.max(1);
        self
    }
    /// Period of warnings while waiting for the input to open.
    pub fn startup_warn_interval(mut self, d: Duration) -> Self {
        self.startup_warn_interval = d.max(Duration::from_millis(1));
        self
    }
    /// Give up waiting for the input to open after `d`.
    pub fn startup_timeout(mut self, d: Duration) -> Self {
        self.startup_timeout = Some(d);
        self
    }

    pub fn thread_count(&self) -> usize {
        self.threads
    }
    pub(crate) fn warn_interval(&self) -> Duration {
        self.startup_warn_interval
    }
    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.startup_timeout
    }
}

// ---------------- Worker-side seams ----------------

/// Per-worker output buffer forwarding full batches downstream.
pub struct Emitter<'q, U> {
    queue: Option<&'q BatchQueue<U>>,
    buf: Vec<U>,
    batch_size: usize,
}

impl<'q, U> Emitter<'q, U> {
    pub fn new(queue: Option<&'q BatchQueue<U>>, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Emitter {
            queue,
            buf: Vec::with_capacity(if queue.is_some() { batch_size } else { 0 }),
            batch_size,
        }
    }

    /// Queue an item; a full buffer is pushed downstream (blocking on backpressure).
    /// Items are dropped when there is no downstream queue.
    pub fn emit(&mut self, item: U) -> Result<()> {
        if self.queue.is_none() {
            return Ok(());
        }
        self.buf.push(item);
        if self.buf.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Push any buffered items downstream.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(q) = self.queue {
            if !self.buf.is_empty() {
                let batch = std::mem::replace(&mut self.buf, Vec::with_capacity(self.batch_size));
                q.push(Message::Data(batch))?;
            }
        }
        Ok(())
    }
}

/// Processing logic of one worker thread.
pub trait BatchProcessor {
    type Input;
    type Output;
    /// Returned by the worker when it exits cleanly.
    type Summary;

    fn process(
        &mut self,
        batch: Vec<Self::Input>,
        out: &mut Emitter<'_, Self::Output>,
    ) -> Result<()>;

    fn finish(self) -> Self::Summary;
}

/// Terminal consumer of an output queue.
pub trait BatchSink {
    type Item;
    type Summary;

    fn write_batch(&mut self, batch: Vec<Self::Item>) -> Result<()>;

    fn finish(self) -> Result<Self::Summary>;
}

// ---------------- Role loops ----------------

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run `f`, turning a panic into [`KmerError::Panic`].
fn guarded<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(KmerError::Panic(panic_message(&*payload))))
}

/// Read lines from `reader` into batches of `batch_size`, push them, then push one
/// `Stop`. `Stop` is pushed even when reading fails. Returns `(records, batches)`.
pub fn run_producer<R: BufRead>(
    mut reader: R,
    queue: &BatchQueue<Record>,
    batch_size: usize,
) -> Result<(u64, u64)> {
    let batch_size = batch_size.max(1);
    let mut records = 0u64;
    let mut batches = 0u64;

    let outcome = guarded(|| {
        let mut batch = Vec::with_capacity(batch_size);
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line)? == 0 {
                break;
            }
            if line.ends_with('\n') {
                line.pop();
                if line.ends_with('\r') {
                    line.pop();
                }
            }
            batch.push(line);
            records += 1;
            if batch.len() == batch_size {
                queue.push(Message::Data(std::mem::replace(
                    &mut batch,
                    Vec::with_capacity(batch_size),
                )))?;
                batches += 1;
            }
        }
        if !batch.is_empty() {
            queue.push(Message::Data(batch))?;
            batches += 1;
        }
        Ok(())
    });

    queue.push(Message::Stop)?;
    outcome.map(|_| (records, batches))
}

/// Worker loop: process batches until `Stop`, then relay `Stop` to the input
/// queue and the output queue.
pub fn run_worker<P>(
    mut processor: P,
    input: &BatchQueue<P::Input>,
    output: Option<&BatchQueue<P::Output>>,
    out_batch_size: usize,
) -> Result<P::Summary>
where
    P: BatchProcessor,
{
    let mut emitter = Emitter::new(output, out_batch_size);
    let mut failure: Option<KmerError> = None;

    loop {
        match input.take() {
            Message::Stop => break,
            Message::Data(batch) => {
                if failure.is_some() {
                    continue;
                }
                if let Err(e) = guarded(|| processor.process(batch, &mut emitter)) {
                    failure = Some(e);
                }
            }
        }
    }

    if failure.is_none() {
        if let Err(e) = emitter.flush() {
            failure = Some(e);
        }
    }

    // Relay: the next sibling sees Stop, and the sink gets one Stop from us.
    let relay_in = input.push(Message::Stop);
    let relay_out = output.map_or(Ok(()), |q| q.push(Message::Stop));

    match failure {
        Some(e) => Err(e),
        None => {
            relay_in?;
            relay_out?;
            Ok(processor.finish())
        }
    }
}

/// Sink loop: write batches until one `Stop` per upstream worker has been seen.
pub fn run_sink<S>(mut sink: S, queue: &BatchQueue<S::Item>, upstream: usize) -> Result<S::Summary>
where
    S: BatchSink,
{
    let mut live = upstream;
    let mut failure: Option<KmerError> = None;

    while live > 0 {
        match queue.take() {
            Message::Stop => live -= 1,
            Message::Data(batch) => {
                if failure.is_none() {
                    if let Err(e) = guarded(|| sink.write_batch(batch)) {
                        failure = Some(e);
                    }
                }
            }
        }
    }

    match failure {
        Some(e) => Err(e),
        None => guarded(move || sink.finish()),
    }
}

// ---------------- Orchestrator ----------------

/// Outcome of a completed pipeline run.
#[derive(Debug)]
pub struct PipelineReport<W, S> {
    pub records: u64,
    pub batches: u64,
    pub workers: Vec<W>,
    pub sink: Option<S>,
}

/// Sink used when a stage has no downstream consumer.
struct Discard<T>(PhantomData<T>);

impl<T> BatchSink for Discard<T> {
    type Item = T;
    type Summary = ();

    fn write_batch(&mut self, _batch: Vec<T>) -> Result<()> {
        Ok(())
    }

    fn finish(self) -> Result<()> {
        Ok(())
    }
}

/// One producer, `threads` workers and an optional sink wired by bounded queues.
pub struct Pipeline {
    name: &'static str,
    cfg: PipelineConfig,
}

impl Pipeline {
    pub fn new(name: &'static str, cfg: PipelineConfig) -> Self {
        Pipeline { name, cfg }
    }

    /// Run workers built by `factory(worker_id)` over the lines of `reader`;
    /// worker output is discarded.
    pub fn consume<R, P, F>(&self, reader: R, factory: F) -> Result<PipelineReport<P::Summary, ()>>
    where
        R: BufRead + Send,
        P: BatchProcessor<Input = Record>,
        P::Output: Send,
        P::Summary: Send,
        F: Fn(usize) -> P + Sync,
    {
        self.run(reader, factory, None::<Discard<P::Output>>)
    }

    /// Run workers and drain their output into `sink`.
    pub fn run_with_sink<R, P, F, S>(
        &self,
        reader: R,
        factory: F,
        sink: S,
    ) -> Result<PipelineReport<P::Summary, S::Summary>>
    where
        R: BufRead + Send,
        P: BatchProcessor<Input = Record>,
        P::Output: Send,
        P::Summary: Send,
        F: Fn(usize) -> P + Sync,
        S: BatchSink<Item = P::Output> + Send,
        S::Summary: Send,
    {
        self.run(reader, factory, Some(sink))
    }

    fn run<R, P, F, S>(
        &self,
        reader: R,
        factory: F,
        sink: Option<S>,
    ) -> Result<PipelineReport<P::Summary, S::Summary>>
    where
        R: BufRead + Send,
        P: BatchProcessor<Input = Record>,
        P::Output: Send,
        P::Summary: Send,
        F: Fn(usize) -> P + Sync,
        S: BatchSink<Item = P::Output> + Send,
        S::Summary: Send,
    {
        let name = self.name;
        let threads = self.cfg.threads;
        let in_queue: BatchQueue<Record> = BatchQueue::bounded(self.cfg.in_queue_capacity);
        let out_queue: Option<BatchQueue<P::Output>> = sink
            .as_ref()
            .map(|_| BatchQueue::bounded(self.cfg.out_queue_capacity));
        let out_batch = self.cfg.out_buffer_size;
        let in_batch = self.cfg.in_buffer_size;

        debug!(pipeline = name, threads, in_batch, out_batch, "starting pipeline");

        let (produced, worker_results, sink_result) = std::thread::scope(|scope| {
            let in_q = &in_queue;
            let out_q = out_queue.as_ref();
            let factory = &factory;

            let producer = scope.spawn(move || run_producer(reader, in_q, in_batch));

            let workers: Vec<_> = (0..threads)
                .map(|id| {
                    scope.spawn(move || run_worker(factory(id), in_q, out_q, out_batch))
                })
                .collect();

            let sink_handle = match (sink, out_q) {
                (Some(sink), Some(q)) => Some(scope.spawn(move || run_sink(sink, q, threads))),
                _ => None,
            };

            let joined =
                |payload: Box<dyn Any + Send>| KmerError::Panic(panic_message(&*payload));
            let produced = producer.join().unwrap_or_else(|p| Err(joined(p)));
            let worker_results: Vec<Result<P::Summary>> = workers
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|p| Err(joined(p))))
                .collect();
            let sink_result = sink_handle.map(|h| h.join().unwrap_or_else(|p| Err(joined(p))));
            (produced, worker_results, sink_result)
        });

        let wrap = |stage: Stage, e: KmerError| match e {
            KmerError::Panic(message) => KmerError::Panicked {
                pipeline: name,
                stage,
                message,
            },
            e => KmerError::Stage {
                pipeline: name,
                stage,
                source: Box::new(e),
            },
        };

        let mut first: Option<KmerError> = None;
        let mut note = |stage: Stage, e: KmerError| {
            error!(pipeline = name, %stage, error = %e, "pipeline thread failed");
            if first.is_none() {
                first = Some(wrap(stage, e));
            }
        };

        let (records, batches) = match produced {
            Ok(counts) => counts,
            Err(e) => {
                note(Stage::Reader, e);
                (0, 0)
            }
        };
        let mut workers = Vec::with_capacity(threads);
        for (id, r) in worker_results.into_iter().enumerate() {
            match r {
                Ok(summary) => workers.push(summary),
                Err(e) => note(Stage::Worker(id), e),
            }
        }
        let sink = match sink_result {
            Some(Ok(summary)) => Some(summary),
            Some(Err(e)) => {
                note(Stage::Writer, e);
                None
            }
            None => None,
        };

        if let Some(e) = first {
            return Err(e);
        }
        info!(pipeline = name, records, batches, threads, "pipeline finished");
        Ok(PipelineReport {
            records,
            batches,
            workers,
            sink,
        })
    }
}
