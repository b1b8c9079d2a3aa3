use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;
use kmatch::pipeline::*;
use kmatch::{KmerError, Result, Stage};

/// Upper-cases records and forwards them.
struct Shout;

impl BatchProcessor for Shout {
    type Input = Record;
    type Output = Record;
    type Summary = usize;

    fn process(&mut self, batch: Vec<Record>, out: &mut Emitter<'_, Record>) -> Result<()> {
        for r in batch {
            out.emit(r.to_uppercase())?;
        }
        Ok(())
    }

    fn finish(self) -> usize {
        0
    }
}

/// Counts records, fails on a poisoned one.
struct Picky {
    seen: usize,
}

impl BatchProcessor for Picky {
    type Input = Record;
    type Output = Record;
    type Summary = usize;

    fn process(&mut self, batch: Vec<Record>, out: &mut Emitter<'_, Record>) -> Result<()> {
        for r in batch {
            if r == "poison" {
                return Err(KmerError::IndexFull { limit: 0 });
            }
            self.seen += 1;
            out.emit(r)?;
        }
        Ok(())
    }

    fn finish(self) -> usize {
        self.seen
    }
}

/// Panics on the record "boom".
struct Boom;

impl BatchProcessor for Boom {
    type Input = Record;
    type Output = Record;
    type Summary = usize;

    fn process(&mut self, batch: Vec<Record>, out: &mut Emitter<'_, Record>) -> Result<()> {
        for r in batch {
            if r == "boom" {
                panic!("cannot process {r}");
            }
            out.emit(r)?;
        }
        Ok(())
    }

    fn finish(self) -> usize {
        0
    }
}

/// Sink that panics on its first batch.
struct Grumpy;

impl BatchSink for Grumpy {
    type Item = Record;
    type Summary = ();

    fn write_batch(&mut self, _batch: Vec<Record>) -> Result<()> {
        panic!("sink refuses");
    }

    fn finish(self) -> Result<()> {
        Ok(())
    }
}

/// Run `f` on a helper thread and fail the test if it does not return in time.
fn within<T: Send + 'static>(secs: u64, f: impl FnOnce() -> T + Send + 'static) -> T {
    let (tx, rx) = bounded(1);
    thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(Duration::from_secs(secs))
        .expect("pipeline did not return in time")
}

#[derive(Clone, Default)]
struct Collect(Arc<Mutex<Vec<String>>>);

impl BatchSink for Collect {
    type Item = Record;
    type Summary = usize;

    fn write_batch(&mut self, batch: Vec<Record>) -> Result<()> {
        self.0.lock().unwrap().extend(batch);
        Ok(())
    }

    fn finish(self) -> Result<usize> {
        Ok(self.0.lock().unwrap().len())
    }
}

fn lines(n: usize) -> String {
    (0..n).map(|i| format!("rec{i}\n")).collect()
}

#[test]
fn test_pipeline_terminates_for_any_worker_count() {
    for workers in 1..=8 {
        for n in [0usize, 1, 7, 100, 1001] {
            let cfg = PipelineConfig::default()
                .threads_unchecked(workers)
                .in_buffer_size(16)
                .in_queue_capacity(1)
                .out_buffer_size(5)
                .out_queue_capacity(1);
            let sink = Collect::default();
            let report = Pipeline::new("test", cfg)
                .run_with_sink(Cursor::new(lines(n)), |_| Shout, sink.clone())
                .unwrap();
            assert_eq!(report.records, n as u64);
            assert_eq!(report.workers.len(), workers);
            assert_eq!(report.sink, Some(n));

            let mut got = sink.0.lock().unwrap().clone();
            got.sort();
            let mut want: Vec<String> = (0..n).map(|i| format!("REC{i}")).collect();
            want.sort();
            assert_eq!(got, want);
        }
    }
}

#[test]
fn test_single_worker_preserves_order() {
    let cfg = PipelineConfig::default()
        .threads_unchecked(1)
        .in_buffer_size(3)
        .out_buffer_size(2);
    let sink = Collect::default();
    Pipeline::new("ordered", cfg)
        .run_with_sink(Cursor::new(lines(50)), |_| Shout, sink.clone())
        .unwrap();
    let want: Vec<String> = (0..50).map(|i| format!("REC{i}")).collect();
    assert_eq!(*sink.0.lock().unwrap(), want);
}

#[test]
fn test_each_worker_relays_exactly_one_stop() {
    let workers = 5;
    let input: BatchQueue<Record> = BatchQueue::bounded(2);
    let output: BatchQueue<Record> = BatchQueue::bounded(64);

    thread::scope(|s| {
        let handles: Vec<_> = (0..workers)
            .map(|_| s.spawn(|| run_worker(Shout, &input, Some(&output), 4)))
            .collect();
        for i in 0..10 {
            input.push(Message::Data(vec![format!("r{i}")])).unwrap();
        }
        input.push(Message::Stop).unwrap();
        for h in handles {
            h.join().unwrap().unwrap();
        }
    });

    let mut stops = 0;
    let mut records = 0;
    while let Some(msg) = output.try_take() {
        match msg {
            Message::Stop => stops += 1,
            Message::Data(b) => records += b.len(),
        }
    }
    assert_eq!(stops, workers);
    assert_eq!(records, 10);
    // the last relayed Stop is left on the input queue
    assert!(matches!(input.try_take(), Some(Message::Stop)));
    assert!(input.is_empty());
}

#[test]
fn test_empty_batch_is_not_stop() {
    let input: BatchQueue<Record> = BatchQueue::bounded(4);
    let output: BatchQueue<Record> = BatchQueue::bounded(4);
    input.push(Message::Data(Vec::new())).unwrap();
    input.push(Message::Data(vec!["after".into()])).unwrap();
    input.push(Message::Stop).unwrap();
    let seen = run_worker(Picky { seen: 0 }, &input, Some(&output), 10).unwrap();
    assert_eq!(seen, 1);
}

#[test]
fn test_producer_backpressure() {
    let queue: BatchQueue<Record> = BatchQueue::bounded(1);

    thread::scope(|s| {
        let producer = s.spawn(|| run_producer(Cursor::new(lines(3)), &queue, 1));

        // first batch fits, second push blocks
        thread::sleep(Duration::from_millis(100));
        assert_eq!(queue.len(), 1);
        assert!(!producer.is_finished());

        let mut data = 0;
        loop {
            match queue.take() {
                Message::Data(b) => {
                    assert_eq!(b.len(), 1);
                    data += 1;
                }
                Message::Stop => break,
            }
        }
        assert_eq!(data, 3);
        assert_eq!(producer.join().unwrap().unwrap(), (3, 3));
    });
}

#[test]
fn test_sink_waits_for_every_upstream_stop() {
    let queue: BatchQueue<Record> = BatchQueue::bounded(8);
    queue.push(Message::Data(vec!["a".into()])).unwrap();
    queue.push(Message::Stop).unwrap();
    queue.push(Message::Data(vec!["b".into(), "c".into()])).unwrap();
    queue.push(Message::Stop).unwrap();
    queue.push(Message::Data(vec!["never".into()])).unwrap();

    let sink = Collect::default();
    let n = run_sink(sink.clone(), &queue, 2).unwrap();
    assert_eq!(n, 3);
    assert_eq!(queue.len(), 1);
}

#[test]
fn test_worker_failure_drains_and_reports_stage() {
    let mut input = lines(200);
    input.push_str("poison\n");
    input.push_str(&lines(200));

    let cfg = PipelineConfig::default()
        .threads_unchecked(4)
        .in_buffer_size(10)
        .in_queue_capacity(1)
        .out_queue_capacity(1);
    let err = Pipeline::new("picky", cfg)
        .run_with_sink(Cursor::new(input), |_| Picky { seen: 0 }, Collect::default())
        .unwrap_err();

    match &err {
        KmerError::Stage {
            pipeline, stage, ..
        } => {
            assert_eq!(*pipeline, "picky");
            assert!(matches!(stage, Stage::Worker(_)));
        }
        other => panic!("expected stage error, got {other:?}"),
    }
    assert!(matches!(err.root(), KmerError::IndexFull { .. }));
    assert!(err.to_string().contains("picky worker"));
}

#[test]
fn test_consume_without_sink() {
    let cfg = PipelineConfig::default().threads_unchecked(3).in_buffer_size(7);
    let report = Pipeline::new("count", cfg)
        .consume(Cursor::new(lines(100)), |_| Picky { seen: 0 })
        .unwrap();
    assert_eq!(report.workers.iter().sum::<usize>(), 100);
    assert_eq!(report.batches, 15);
    assert!(report.sink.is_none());
}

#[test]
fn test_worker_panic_relays_stop_and_reports() {
    let cfg = PipelineConfig::default()
        .threads_unchecked(2)
        .in_buffer_size(1)
        .out_buffer_size(1);
    let err = within(10, move || {
        Pipeline::new("panicky", cfg).run_with_sink(
            Cursor::new("a\nboom\nb\n".to_string()),
            |_| Boom,
            Collect::default(),
        )
    })
    .unwrap_err();

    match &err {
        KmerError::Panicked {
            pipeline,
            stage,
            message,
        } => {
            assert_eq!(*pipeline, "panicky");
            assert!(matches!(stage, Stage::Worker(_)));
            assert!(message.contains("cannot process boom"));
        }
        other => panic!("expected panic error, got {other:?}"),
    }
    assert!(err.is_fatal());
}

#[test]
fn test_sink_panic_keeps_workers_unblocked() {
    let cfg = PipelineConfig::default()
        .threads_unchecked(3)
        .in_buffer_size(2)
        .in_queue_capacity(1)
        .out_buffer_size(1)
        .out_queue_capacity(1);
    let err = within(10, move || {
        Pipeline::new("grumpy", cfg).run_with_sink(Cursor::new(lines(300)), |_| Shout, Grumpy)
    })
    .unwrap_err();
    assert!(matches!(
        err,
        KmerError::Panicked {
            stage: Stage::Writer,
            ..
        }
    ));
}

#[test]
fn test_worker_panic_alone_still_drains_input() {
    let input: BatchQueue<Record> = BatchQueue::bounded(8);
    let output: BatchQueue<Record> = BatchQueue::bounded(8);
    input.push(Message::Data(vec!["boom".into()])).unwrap();
    input.push(Message::Data(vec!["later".into()])).unwrap();
    input.push(Message::Stop).unwrap();

    let err = run_worker(Boom, &input, Some(&output), 4).unwrap_err();
    assert!(matches!(err, KmerError::Panic(_)));
    // Stop was relayed both ways and nothing after the panic was forwarded
    assert!(matches!(input.try_take(), Some(Message::Stop)));
    assert!(matches!(output.try_take(), Some(Message::Stop)));
    assert!(output.is_empty());
}
