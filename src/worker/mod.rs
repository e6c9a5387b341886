//! Parser worker: pull-when-idle task consumer.
//!
//! Capacity is a pool of tokens sized to `2 × available parallelism − 1`.
//! The main loop takes a token, asks the dispatcher for one leased row, and
//! hands the row to a spawned unit that streams the member's compressed
//! bytes from the gateway, inflates and decodes them off the async runtime,
//! writes rows to the analytics sink, and reports the terminal row state:
//! `2` done, `-1` source vanished (gateway 404), `-2` decoder or I/O
//! failure. Exactly as many rows are in flight as the worker can sustain,
//! which keeps the dispatcher stateless.

pub mod decode;
pub mod fetch;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tracing::{debug, info, warn};

use crate::backend::{BackendClient, NdsFileRecord, ParsedUpdate, parsed};
use crate::error::{ErrorKind, NdsError, Result};
use crate::gateway::client::GatewayClient;
use crate::signal::wait_or_shutdown;

use decode::{AnalyticsSink, MeasurementRow};

const MODULE: &str = "worker";

/// Sleep between polls when the dispatcher queue is empty.
const IDLE_INTERVAL: Duration = Duration::from_secs(5);

/// Capacity heuristic: one slot is reserved for the runtime itself, the
/// rest are doubled because units spend most of their life waiting on the
/// gateway.
pub fn default_capacity() -> usize {
    let threads = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
    if threads > 1 { threads * 2 - 1 } else { 1 }
}

pub struct Worker {
    backend: BackendClient,
    gateway: GatewayClient,
    sink: Arc<dyn AnalyticsSink>,
    tokens: Arc<Semaphore>,
    capacity: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
}

impl Worker {
    pub fn new(
        backend: BackendClient,
        gateway: GatewayClient,
        sink: Arc<dyn AnalyticsSink>,
        capacity: usize,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            backend,
            gateway,
            sink,
            tokens: Arc::new(Semaphore::new(capacity)),
            capacity: AtomicUsize::new(capacity),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Elastically change the number of concurrent units by adding or
    /// draining capacity tokens. Shrinking lets running units finish; their
    /// tokens are forgotten as they come back.
    pub fn resize(&self, new_capacity: usize) {
        let new_capacity = new_capacity.max(1);
        let old = self.capacity.swap(new_capacity, Ordering::SeqCst);
        if new_capacity > old {
            self.tokens.add_permits(new_capacity - old);
        } else {
            self.tokens.forget_permits(old - new_capacity);
        }
        info!(module = MODULE, old, new = new_capacity, "capacity resized");
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    /// Units currently processing a task.
    pub fn active(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Pull and process tasks until shutdown, then drain in-flight units.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(module = MODULE, capacity = self.capacity(), "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            // A token is idle capacity; only then ask for work.
            let permit = tokio::select! {
                permit = Arc::clone(&self.tokens).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                result = shutdown.wait_for(|stop| *stop) => {
                    if result.is_ok() {
                        break;
                    }
                    continue;
                }
            };

            match self.backend.get_task().await {
                Ok(Some(task)) => {
                    self.in_flight.fetch_add(1, Ordering::SeqCst);
                    let worker = Arc::clone(&self);
                    tokio::spawn(async move {
                        worker.handle_task(task).await;
                        worker.in_flight.fetch_sub(1, Ordering::SeqCst);
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    if wait_or_shutdown(&mut shutdown, IDLE_INTERVAL).await {
                        break;
                    }
                }
                Err(err) => {
                    warn!(module = MODULE, "get-task failed: {err}");
                    drop(permit);
                    if wait_or_shutdown(&mut shutdown, IDLE_INTERVAL).await {
                        break;
                    }
                }
            }
        }

        while self.active() > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        info!(module = MODULE, "worker stopped");
    }

    /// One unit of work: fetch, decode, sink, report.
    async fn handle_task(&self, task: NdsFileRecord) {
        debug!(
            module = MODULE,
            nds_id = task.nds_id,
            file = %task.file_path,
            member = %task.sub_file_name,
            "task started"
        );

        let outcome = self.process(&task).await;
        let state = terminal_state(&outcome);
        match &outcome {
            Ok(rows) => {
                debug!(module = MODULE, member = %task.sub_file_name, rows, "task done")
            }
            Err(err) => warn!(
                module = MODULE,
                member = %task.sub_file_name,
                state,
                "task failed: {err}"
            ),
        }

        let update = ParsedUpdate { file_hash: task.file_hash.clone(), parsed: state };
        if let Err(err) = self.backend.update_parsed(&[update]).await {
            // The lease janitor will requeue the row; redelivery is safe
            // because sink writes are idempotent.
            warn!(module = MODULE, member = %task.sub_file_name, "status report failed: {err}");
        }
    }

    async fn process(&self, task: &NdsFileRecord) -> Result<usize> {
        let raw = fetch::fetch_member(&self.gateway, task).await?;

        // Inflate + decode are the CPU-heavy part; keep them off the
        // async runtime.
        let compress_type = task.compress_type;
        let data_type = task.data_type;
        let rows: Vec<MeasurementRow> = tokio::task::spawn_blocking(move || {
            let data = decode::inflate(&raw, compress_type)?;
            decode::decoder_for(data_type).decode(&data)
        })
        .await
        .map_err(|e| NdsError::io(MODULE, format!("decode task: {e}")))??;

        self.sink.insert(task, &rows).await?;
        Ok(rows.len())
    }
}

/// Map a unit's outcome onto the row state machine.
fn terminal_state(outcome: &Result<usize>) -> i8 {
    match outcome {
        Ok(_) => parsed::DONE,
        Err(err) if err.kind == ErrorKind::SourceMissing => parsed::SOURCE_MISSING,
        Err(_) => parsed::PARSE_ERROR,
    }
}
