//! Long-Write Coordinator
//!
//! Splits a payload into batches no larger than the batch limit and writes
//! them one queued operation at a time. After every acknowledged batch the
//! ack policy decides when to continue; after a failed batch the retry policy
//! decides whether to rewind to that batch or give up.

use crate::connection::Connection;
use crate::error::GattError;
use crate::operations::{CharacteristicWrite, SingleResponse};
use crate::platform::GattLink;
use crate::queue::OperationQueue;
use crate::relay::lock;
use crate::router::GattEventRouter;
use crate::types::Characteristic;
use crate::Result;
use async_trait::async_trait;
use core::fmt;
use core::time::Duration;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

// ----------------------------------------------------------------------------
// Policies
// ----------------------------------------------------------------------------

/// A batch that could not be written
#[derive(Debug, Clone, PartialEq)]
pub struct LongWriteFailure {
    pub batch_index: usize,
    pub cause: GattError,
}

/// Gates progression after each acknowledged batch
#[async_trait]
pub trait AckPolicy: Send + Sync {
    /// Resolve to continue with the next batch; an error aborts the write
    async fn on_batch_acknowledged(&self, batch_index: usize, remaining_batches: usize) -> Result<()>;
}

/// Decides what happens after a batch failed
#[async_trait]
pub trait RetryPolicy: Send + Sync {
    /// Resolve to retry the failed batch; an error aborts the write
    async fn on_batch_failed(&self, failure: LongWriteFailure) -> Result<()>;
}

/// Continue with the next batch right away
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateAck;

#[async_trait]
impl AckPolicy for ImmediateAck {
    async fn on_batch_acknowledged(&self, _batch_index: usize, _remaining_batches: usize) -> Result<()> {
        Ok(())
    }
}

/// Pause between batches, for peripherals that need time to process each one
#[derive(Debug, Clone, Copy)]
pub struct DelayedAck(pub Duration);

#[async_trait]
impl AckPolicy for DelayedAck {
    async fn on_batch_acknowledged(&self, _batch_index: usize, remaining_batches: usize) -> Result<()> {
        if remaining_batches > 0 {
            tokio::time::sleep(self.0).await;
        }
        Ok(())
    }
}

/// Fail the whole write on the first failed batch
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

#[async_trait]
impl RetryPolicy for NoRetry {
    async fn on_batch_failed(&self, failure: LongWriteFailure) -> Result<()> {
        Err(failure.cause)
    }
}

/// Retry each batch up to a fixed number of times
#[derive(Debug)]
pub struct RetryAttempts {
    max_attempts: u32,
    attempts: Mutex<HashMap<usize, u32>>,
}

impl RetryAttempts {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            attempts: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl RetryPolicy for RetryAttempts {
    async fn on_batch_failed(&self, failure: LongWriteFailure) -> Result<()> {
        let mut attempts = lock(&self.attempts);
        let used = attempts.entry(failure.batch_index).or_insert(0);
        if *used >= self.max_attempts {
            return Err(failure.cause);
        }
        *used += 1;
        debug!(batch = failure.batch_index, attempt = *used, cause = %failure.cause, "Retrying batch");
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Options
// ----------------------------------------------------------------------------

#[derive(Clone)]
pub struct LongWriteOptions {
    /// Largest batch; defaults to what fits in the current MTU
    pub max_batch_size: Option<usize>,
    pub ack_policy: Arc<dyn AckPolicy>,
    pub retry_policy: Arc<dyn RetryPolicy>,
}

impl Default for LongWriteOptions {
    fn default() -> Self {
        Self {
            max_batch_size: None,
            ack_policy: Arc::new(ImmediateAck),
            retry_policy: Arc::new(NoRetry),
        }
    }
}

impl fmt::Debug for LongWriteOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LongWriteOptions")
            .field("max_batch_size", &self.max_batch_size)
            .finish_non_exhaustive()
    }
}

/// Fluent construction of a long write on a connection
pub struct LongWriteBuilder {
    connection: Connection,
    characteristic: Option<Characteristic>,
    payload: Vec<u8>,
    options: LongWriteOptions,
}

impl LongWriteBuilder {
    pub(crate) fn new(connection: Connection) -> Self {
        Self {
            connection,
            characteristic: None,
            payload: Vec::new(),
            options: LongWriteOptions::default(),
        }
    }

    pub fn with_characteristic(mut self, characteristic: Characteristic) -> Self {
        self.characteristic = Some(characteristic);
        self
    }

    pub fn with_bytes(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.options.max_batch_size = Some(max_batch_size);
        self
    }

    pub fn with_ack_policy(mut self, policy: impl AckPolicy + 'static) -> Self {
        self.options.ack_policy = Arc::new(policy);
        self
    }

    pub fn with_retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.options.retry_policy = Arc::new(policy);
        self
    }

    /// Run the write; resolves with the full payload once every batch is acknowledged
    pub async fn execute(self) -> Result<Vec<u8>> {
        let characteristic = self
            .characteristic
            .ok_or_else(|| GattError::InvalidArgument("long write needs a characteristic".into()))?;
        self.connection
            .write_long(&characteristic, &self.payload, self.options)
            .await
    }
}

// ----------------------------------------------------------------------------
// Coordinator
// ----------------------------------------------------------------------------

/// Only attribute-level rejections and refused starts are worth retrying
fn is_retryable(error: &GattError) -> bool {
    matches!(
        error,
        GattError::CharacteristicStatus { .. } | GattError::CannotStart { .. }
    )
}

pub(crate) struct LongWriteCoordinator {
    pub(crate) queue: OperationQueue,
    pub(crate) link: Arc<dyn GattLink>,
    pub(crate) router: Arc<GattEventRouter>,
    pub(crate) operation_timeout: Duration,
}

impl LongWriteCoordinator {
    pub(crate) async fn write(
        &self,
        characteristic: &Characteristic,
        payload: &[u8],
        batch_size: usize,
        options: &LongWriteOptions,
    ) -> Result<Vec<u8>> {
        if batch_size == 0 {
            return Err(GattError::InvalidArgument("batch size must be greater than zero".into()));
        }

        let total = payload.len();
        let batch_count = total.div_ceil(batch_size);
        info!(
            characteristic = %characteristic.id(),
            bytes = total,
            batch_size,
            batch_count,
            "Starting long write"
        );

        let mut cursor = 0;
        while cursor < total {
            let batch_index = cursor / batch_size;
            let end = (cursor + batch_size).min(total);
            let batch = CharacteristicWrite::batch(characteristic.clone(), payload[cursor..end].to_vec());
            let written = self
                .queue
                .enqueue(SingleResponse::new(
                    batch,
                    self.link.clone(),
                    self.router.clone(),
                    self.operation_timeout,
                ))
                .single()
                .await;

            match written {
                Ok(_) => {
                    cursor = end;
                    let remaining_batches = batch_count - batch_index - 1;
                    options
                        .ack_policy
                        .on_batch_acknowledged(batch_index, remaining_batches)
                        .await?;
                }
                Err(cause) if is_retryable(&cause) => {
                    options
                        .retry_policy
                        .on_batch_failed(LongWriteFailure { batch_index, cause })
                        .await?;
                    cursor = batch_index * batch_size;
                    debug!(batch_index, cursor, "Rewound long write");
                }
                Err(cause) => return Err(cause),
            }
        }

        debug!(characteristic = %characteristic.id(), "Long write finished");
        Ok(payload.to_vec())
    }
}
