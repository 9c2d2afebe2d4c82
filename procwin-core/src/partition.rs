//! A partition owns one [WindowOperator] and processes, one at a time, the elements routed to it
//! and the deadlines of its timer. Both arrive over the same queue, so a deadline delivered after an
//! element is applied after it and the operator state needs no locking.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::function::WindowFunction;
use crate::message::{Element, WindowResult};
use crate::operator::WindowOperator;
use crate::timer::TimerHandle;

/// Messages processed by a partition task.
#[derive(Debug)]
pub(crate) enum PartitionMessage<T> {
    Element(Element<T>),
    Timer(DateTime<Utc>),
}

pub(crate) struct PartitionTask<F: WindowFunction> {
    partition: u16,
    operator: WindowOperator<F>,
    receiver: mpsc::Receiver<PartitionMessage<F::Input>>,
    output_tx: mpsc::Sender<WindowResult<F::Output>>,
    timer: TimerHandle,
    cln_token: CancellationToken,
}

impl<F: WindowFunction> PartitionTask<F> {
    pub(crate) fn new(
        partition: u16,
        operator: WindowOperator<F>,
        receiver: mpsc::Receiver<PartitionMessage<F::Input>>,
        output_tx: mpsc::Sender<WindowResult<F::Output>>,
        timer: TimerHandle,
        cln_token: CancellationToken,
    ) -> Self {
        Self {
            partition,
            operator,
            receiver,
            output_tx,
            timer,
            cln_token,
        }
    }

    /// Starts the partition and returns the handle of its task. The task ends with an error if the
    /// window function fails, otherwise when the token is cancelled or every sender is dropped.
    pub(crate) fn start(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        info!(partition = self.partition, "Partition started");
        let result = self.process().await;

        // the timer must not outlive the partition
        self.timer.cancel();

        // pending windows are not flushed on shutdown
        let discarded = self.operator.discard();
        if discarded > 0 {
            info!(
                partition = self.partition,
                discarded, "Discarded pending windows without firing"
            );
        }

        match &result {
            Ok(()) => info!(partition = self.partition, "Partition stopped"),
            Err(e) => error!(partition = self.partition, ?e, "Partition stopped with error"),
        }
        result
    }

    async fn process(&mut self) -> Result<()> {
        loop {
            let message = tokio::select! {
                biased;
                _ = self.cln_token.cancelled() => return Ok(()),
                message = self.receiver.recv() => message,
            };

            let Some(message) = message else {
                return Ok(());
            };

            match message {
                PartitionMessage::Element(element) => {
                    self.operator.on_element(
                        &element.key,
                        element.value,
                        element.processing_time,
                    )?;
                }
                PartitionMessage::Timer(deadline) => {
                    for result in self.operator.on_timer(deadline)? {
                        tokio::select! {
                            biased;
                            _ = self.cln_token.cancelled() => return Ok(()),
                            sent = self.output_tx.send(result) => sent.map_err(|_| {
                                Error::Partition(format!(
                                    "output receiver of partition {} was dropped",
                                    self.partition
                                ))
                            })?,
                        }
                    }
                }
            }
        }
    }
}
