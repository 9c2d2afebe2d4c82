//! The windowing runtime. It starts one partition task and one timer task per configured
//! partition, stamps incoming elements with the processing time and routes them to a partition by
//! the hash of their key. Every result of every partition is sent to a single output channel.

use std::hash::{DefaultHasher, Hasher};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::WindowConfig;
use crate::error::{Error, Result};
use crate::function::WindowFunction;
use crate::message::{Element, NON_KEYED_STREAM, WindowResult};
use crate::operator::WindowOperator;
use crate::partition::{PartitionMessage, PartitionTask};
use crate::timer::{Clock, TimerHandle, TimerScheduler};
use crate::windower::{WindowAssigner, WindowCapabilities};

struct PartitionHandle<T> {
    tx: mpsc::Sender<PartitionMessage<T>>,
    timer: TimerHandle,
    task_handle: JoinHandle<Result<()>>,
    timer_handle: JoinHandle<()>,
}

pub struct WindowRuntime<F: WindowFunction> {
    assigner: WindowAssigner,
    keyed: bool,
    clock: Arc<dyn Clock>,
    partitions: Vec<PartitionHandle<F::Input>>,
    cln_token: CancellationToken,
}

impl<F: WindowFunction> WindowRuntime<F> {
    /// Validates the configuration and starts the partitions. The runtime stops when `cln_token`
    /// is cancelled or [Self::shutdown] is called.
    pub fn start(
        config: &WindowConfig,
        function: Arc<F>,
        clock: Arc<dyn Clock>,
        output_tx: mpsc::Sender<WindowResult<F::Output>>,
        cln_token: CancellationToken,
    ) -> Result<Self> {
        let assigner = config.assigner()?;
        let cln_token = cln_token.child_token();

        let partitions = (0..config.partitions)
            .map(|partition| {
                let (tx, rx) = mpsc::channel(config.channel_size);
                let scheduler = TimerScheduler::new(&assigner, Arc::clone(&clock), partition);
                let timer = scheduler.handle();
                let timer_handle = scheduler.start(tx.clone(), PartitionMessage::Timer);

                let operator = WindowOperator::new(
                    assigner,
                    Arc::clone(&function),
                    config.accumulation_mode,
                    partition,
                );
                let task_handle = PartitionTask::new(
                    partition,
                    operator,
                    rx,
                    output_tx.clone(),
                    timer.clone(),
                    cln_token.clone(),
                )
                .start();

                PartitionHandle {
                    tx,
                    timer,
                    task_handle,
                    timer_handle,
                }
            })
            .collect();

        info!(
            size_ms = assigner.size_millis(),
            slide_ms = assigner.slide_millis(),
            partitions = config.partitions,
            keyed = config.keyed,
            mode = %config.accumulation_mode,
            "Window runtime started"
        );

        Ok(Self {
            assigner,
            keyed: config.keyed,
            clock,
            partitions,
            cln_token,
        })
    }

    /// Stamps the element with the current processing time and sends it to the partition owning
    /// its key. Elements of a stream that is not keyed all share [NON_KEYED_STREAM].
    pub async fn send(&self, key: Option<&str>, value: F::Input) -> Result<()> {
        let key = match key {
            Some(key) if self.keyed => key.to_string(),
            _ => NON_KEYED_STREAM.to_string(),
        };
        let processing_time = self.clock.now();

        let partition = self.partition_for(&key);
        let handle = self
            .partitions
            .get(partition)
            .ok_or_else(|| Error::Partition(format!("partition {partition} does not exist")))?;

        handle
            .tx
            .send(PartitionMessage::Element(Element {
                key,
                value,
                processing_time,
            }))
            .await
            .map_err(|_| Error::Partition(format!("partition {partition} is not running")))
    }

    /// Determines the partition owning the key by hashing it.
    fn partition_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        hasher.write(key.as_bytes());
        (hasher.finish() % self.partitions.len() as u64) as usize
    }

    pub fn partitions(&self) -> usize {
        self.partitions.len()
    }

    pub fn capabilities(&self) -> WindowCapabilities {
        self.assigner.capabilities()
    }

    /// Pending windows and panes are bound to the partition which registered them and cannot be
    /// moved, only the current partition count is accepted.
    pub fn rescale(&self, partitions: usize) -> Result<()> {
        if partitions == self.partitions.len() {
            return Ok(());
        }
        if !self.capabilities().rescalable {
            return Err(Error::Unsupported(format!(
                "processing-time windows cannot be rescaled from {} to {partitions} partitions",
                self.partitions.len()
            )));
        }
        Ok(())
    }

    /// Window state of processing-time windows is not snapshotted, so there is nothing to resume.
    pub fn restore(&self) -> Result<()> {
        if !self.capabilities().restorable {
            return Err(Error::Unsupported(
                "processing-time windows cannot be restored from a previous run".to_string(),
            ));
        }
        Ok(())
    }

    /// Stops every partition and timer, discarding pending windows. Returns the first partition
    /// error, if any partition stopped with one.
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down window runtime");
        self.cln_token.cancel();

        let mut result = Ok(());
        for (partition, handle) in self.partitions.into_iter().enumerate() {
            handle.timer.cancel();
            drop(handle.tx);

            let partition_result = match handle.task_handle.await {
                Ok(result) => result,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = handle.timer_handle.await {
                error!(partition, ?e, "Timer task failed");
            }

            if let Err(e) = partition_result
                && result.is_ok()
            {
                result = Err(e);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};
    use parking_lot::Mutex;

    use super::*;
    use crate::function::{AccumulationMode, Count, Sum};
    use crate::timer::MonotonicClock;
    use crate::windower::Window;

    fn ts(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    /// A clock which only moves when the test sets it, possibly backwards.
    struct SteppingClock(Mutex<DateTime<Utc>>);

    impl SteppingClock {
        fn set(&self, now: DateTime<Utc>) {
            *self.0.lock() = now;
        }
    }

    impl Clock for SteppingClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock()
        }
    }

    fn config(size_ms: u64, slide_ms: u64, partitions: u16, keyed: bool) -> WindowConfig {
        WindowConfig {
            size: Duration::from_millis(size_ms),
            slide: Duration::from_millis(slide_ms),
            partitions,
            keyed,
            accumulation_mode: AccumulationMode::Aggregating,
            channel_size: 10,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_sliding() {
        let clock = Arc::new(MonotonicClock::starting_at(ts(0)));
        let (output_tx, mut output_rx) = mpsc::channel(10);
        let runtime = WindowRuntime::start(
            &config(10, 5, 1, false),
            Arc::new(Sum),
            clock,
            output_tx,
            CancellationToken::new(),
        )
        .unwrap();

        tokio::time::advance(Duration::from_millis(2)).await;
        runtime.send(None, 1).await.unwrap();
        tokio::time::advance(Duration::from_millis(4)).await;
        runtime.send(None, 1).await.unwrap();
        tokio::time::advance(Duration::from_millis(3)).await;
        runtime.send(None, 1).await.unwrap();

        let result = output_rx.recv().await.unwrap();
        assert_eq!(result.key, NON_KEYED_STREAM);
        assert_eq!(result.window, Window::new(ts(0), ts(10)));
        assert_eq!(result.value, 3);

        // the clock is at 10 now, the element lands in the pane [10, 15)
        tokio::time::advance(Duration::from_millis(2)).await;
        runtime.send(None, 1).await.unwrap();

        let result = output_rx.recv().await.unwrap();
        assert_eq!(result.window, Window::new(ts(5), ts(15)));
        assert_eq!(result.value, 3);

        let result = output_rx.recv().await.unwrap();
        assert_eq!(result.window, Window::new(ts(10), ts(20)));
        assert_eq!(result.value, 1);

        runtime.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_keyed_partitions() {
        let clock = Arc::new(MonotonicClock::starting_at(ts(1_000)));
        let (output_tx, mut output_rx) = mpsc::channel(10);
        let runtime = WindowRuntime::start(
            &config(100, 100, 3, true),
            Arc::new(Count::<i64>::default()),
            clock,
            output_tx,
            CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(runtime.partitions(), 3);

        for key in ["a", "b", "c", "a", "a"] {
            runtime.send(Some(key), 0).await.unwrap();
        }

        let mut counts = Vec::new();
        for _ in 0..3 {
            let result = output_rx.recv().await.unwrap();
            assert_eq!(result.window, Window::new(ts(1_000), ts(1_100)));
            counts.push((result.key, result.value));
        }
        counts.sort();
        assert_eq!(
            counts,
            vec![
                ("a".to_string(), 3),
                ("b".to_string(), 1),
                ("c".to_string(), 1)
            ]
        );

        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_operations() {
        let (output_tx, _output_rx) = mpsc::channel::<WindowResult<i64>>(10);
        let runtime = WindowRuntime::start(
            &config(1_000, 500, 2, true),
            Arc::new(Sum),
            Arc::new(MonotonicClock::new()),
            output_tx,
            CancellationToken::new(),
        )
        .unwrap();

        assert!(runtime.rescale(2).is_ok());
        assert!(matches!(runtime.rescale(4), Err(Error::Unsupported(_))));
        assert!(matches!(runtime.restore(), Err(Error::Unsupported(_))));
        assert!(!runtime.capabilities().rescalable);

        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let (output_tx, _output_rx) = mpsc::channel::<WindowResult<i64>>(10);
        let result = WindowRuntime::start(
            &config(1_000, 300, 1, false),
            Arc::new(Sum),
            Arc::new(MonotonicClock::new()),
            output_tx.clone(),
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(Error::Config(_))));

        let result = WindowRuntime::start(
            &config(1_000, 1_000, 0, false),
            Arc::new(Sum),
            Arc::new(MonotonicClock::new()),
            output_tx,
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_partition_rejects_elements() {
        let (output_tx, _output_rx) = mpsc::channel(10);
        let runtime = WindowRuntime::start(
            &config(10, 10, 1, false),
            Arc::new(Sum),
            Arc::new(MonotonicClock::starting_at(ts(0))),
            output_tx,
            CancellationToken::new(),
        )
        .unwrap();

        runtime.send(None, i64::MAX).await.unwrap();
        runtime.send(None, 1).await.unwrap();

        // [0, 10) overflows when it fires, the partition stops and drops its queue
        let mut rejected = false;
        for _ in 0..100 {
            if runtime.send(None, 0).await.is_err() {
                rejected = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(rejected);
        assert!(matches!(runtime.shutdown().await, Err(Error::Aggregate(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_elements_stamped_before_the_last_deadline_are_kept() {
        let clock = Arc::new(SteppingClock(Mutex::new(ts(3))));
        let (output_tx, mut output_rx) = mpsc::channel(10);
        let runtime = WindowRuntime::start(
            &config(10, 10, 1, false),
            Arc::new(Sum),
            Arc::clone(&clock) as Arc<dyn Clock>,
            output_tx,
            CancellationToken::new(),
        )
        .unwrap();

        runtime.send(None, 1).await.unwrap();
        let result = output_rx.recv().await.unwrap();
        assert_eq!(result.window, Window::new(ts(0), ts(10)));
        assert_eq!(result.value, 1);

        // the clock stepped back behind the deadline which already closed [0, 10)
        clock.set(ts(8));
        runtime.send(None, 5).await.unwrap();

        let result = output_rx.recv().await.unwrap();
        assert_eq!(result.window, Window::new(ts(10), ts(20)));
        assert_eq!(result.value, 5);

        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_parent_token_stops_the_runtime() {
        let (output_tx, mut output_rx) = mpsc::channel::<WindowResult<i64>>(10);
        let cln_token = CancellationToken::new();
        let runtime = WindowRuntime::start(
            &config(60_000, 60_000, 2, false),
            Arc::new(Sum),
            Arc::new(MonotonicClock::new()),
            output_tx,
            cln_token.clone(),
        )
        .unwrap();
        runtime.send(None, 1).await.unwrap();

        cln_token.cancel();
        // every partition exits and drops its output sender
        assert!(output_rx.recv().await.is_none());
        runtime.shutdown().await.unwrap();
    }
}
