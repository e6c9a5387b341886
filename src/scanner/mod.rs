//! Differential NDS scanner.
//!
//! One long-lived loop per enabled NDS, all fed by a supervisor that polls
//! the store's NDS list. A pass: reload config (exit when disabled or
//! deleted), hold off while a backlog is pending, list MRO and MDT paths
//! through the gateway, diff against the store, parse central directories
//! in small batches and submit member rows. A single NDS never has two
//! scans in flight, since a second listing would re-discover work the first has
//! not yet reserved.

pub mod diff;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{BackendClient, DataType, NdsFileRecord, file_hash, parsed};
use crate::error::Result;
use crate::gateway::client::GatewayClient;
use crate::nds::NdsConfig;
use crate::signal::wait_or_shutdown;
use crate::zip::MemberInfo;

use diff::{ScanFile, dedup, extract_archive_time, format_time, within_ranges};

/// Base scan period per NDS.
const SCAN_INTERVAL: Duration = Duration::from_secs(300);
/// Floor for the inter-pass sleep.
const MIN_INTERVAL: Duration = Duration::from_secs(5);
/// Sleep while the NDS still has unparsed backlog.
const TASK_CHECK_INTERVAL: Duration = Duration::from_secs(30);
/// How often the supervisor re-reads the NDS list.
const SUPERVISOR_INTERVAL: Duration = Duration::from_secs(30);
/// Archives per zip-info call; small batches bound how long one scanner
/// monopolizes a shared gateway connection.
const ZIP_INFO_BATCH: usize = 2;

/// Per-NDS scan telemetry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanStatus {
    pub last_scan_time: Option<String>,
    pub next_scan_time: Option<String>,
    pub new_files_count: usize,
    pub scan_duration: f64,
    pub is_scanning: bool,
    pub last_error: Option<String>,
}

pub struct Scanner {
    backend: BackendClient,
    gateway: GatewayClient,
    status: Mutex<HashMap<i64, ScanStatus>>,
    loops: Mutex<HashMap<i64, JoinHandle<()>>>,
}

impl Scanner {
    pub fn new(backend: BackendClient, gateway: GatewayClient) -> Self {
        Self {
            backend,
            gateway,
            status: Mutex::new(HashMap::new()),
            loops: Mutex::new(HashMap::new()),
        }
    }

    /// Supervise the per-NDS loops until shutdown flips.
    ///
    /// New enabled NDS rows get a loop at the next poll; loops notice
    /// disablement themselves. Finished handles are reaped so a re-enabled
    /// NDS starts fresh.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("scanner started");
        loop {
            match self.backend.nds_list().await {
                Ok(configs) => {
                    let mut loops = self.loops.lock().await;
                    loops.retain(|_, handle| !handle.is_finished());
                    for config in configs.into_iter().filter(NdsConfig::enabled) {
                        if loops.contains_key(&config.id) {
                            continue;
                        }
                        info!(nds_id = config.id, "starting scan loop");
                        let handle = tokio::spawn(
                            Arc::clone(&self).scan_loop(config.id, shutdown.clone()),
                        );
                        loops.insert(config.id, handle);
                    }
                }
                Err(err) => warn!("nds list fetch failed: {err}"),
            }

            let snapshot = self.status_snapshot().await;
            let scanning = snapshot.values().filter(|status| status.is_scanning).count();
            debug!(loops = snapshot.len(), scanning, "scanner heartbeat");

            if wait_or_shutdown(&mut shutdown, SUPERVISOR_INTERVAL).await {
                break;
            }
        }

        let handles: Vec<(i64, JoinHandle<()>)> =
            self.loops.lock().await.drain().collect();
        for (nds_id, handle) in handles {
            if let Err(err) = handle.await {
                warn!(nds_id, "scan loop join failed: {err}");
            }
        }
        info!("scanner stopped");
    }

    /// Scan telemetry for all NDS loops, keyed by id.
    pub async fn status_snapshot(&self) -> HashMap<i64, ScanStatus> {
        self.status.lock().await.clone()
    }

    async fn scan_loop(self: Arc<Self>, nds_id: i64, mut shutdown: watch::Receiver<bool>) {
        self.status.lock().await.insert(nds_id, ScanStatus::default());

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Reload the config every pass: credentials drift and the
            // Switch flag is the operator's off button.
            let config = match self.backend.nds_config(nds_id).await {
                Ok(Some(config)) if config.enabled() => config,
                Ok(_) => {
                    info!(nds_id, "NDS disabled or removed, scan loop exiting");
                    break;
                }
                Err(err) => {
                    self.record_error(nds_id, &err.to_string()).await;
                    if wait_or_shutdown(&mut shutdown, MIN_INTERVAL).await {
                        break;
                    }
                    continue;
                }
            };

            // Backlog gate: do not pile new discoveries onto a queue the
            // workers have not drained.
            match self.backend.has_pending_tasks(nds_id).await {
                Ok(true) => {
                    debug!(nds_id, "backlog pending, deferring scan");
                    if wait_or_shutdown(&mut shutdown, TASK_CHECK_INTERVAL).await {
                        break;
                    }
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    self.record_error(nds_id, &err.to_string()).await;
                    if wait_or_shutdown(&mut shutdown, MIN_INTERVAL).await {
                        break;
                    }
                    continue;
                }
            }

            let started = Local::now();
            self.mark_scanning(nds_id, true).await;
            let outcome = self.scan_pass(&config).await;
            let duration = (Local::now() - started).num_milliseconds() as f64 / 1000.0;

            let sleep = match outcome {
                Ok(new_files) => {
                    self.record_pass(nds_id, started.naive_local(), duration, new_files).await;
                    SCAN_INTERVAL.saturating_sub(Duration::from_secs_f64(duration)).max(MIN_INTERVAL)
                }
                Err(err) => {
                    self.record_error(nds_id, &err.to_string()).await;
                    MIN_INTERVAL
                }
            };
            self.note_next_scan(nds_id, sleep).await;
            self.mark_scanning(nds_id, false).await;

            if wait_or_shutdown(&mut shutdown, sleep).await {
                break;
            }
        }

        self.status.lock().await.remove(&nds_id);
    }

    /// One full pass; returns the number of new archives discovered.
    async fn scan_pass(&self, config: &NdsConfig) -> Result<usize> {
        let nds_id = config.id;

        let mut remote = Vec::new();
        let listings = [
            (&config.mro_path, &config.mro_filter, DataType::Mro),
            (&config.mdt_path, &config.mdt_filter, DataType::Mdt),
        ];
        for (path, filter, data_type) in listings {
            let Some(path) = path.as_deref() else { continue };
            let files = self.gateway.scan(nds_id, path, filter.as_deref()).await?;
            remote.extend(files.into_iter().map(|path| ScanFile { path, data_type }));
        }
        let remote = dedup(remote);

        let store = self.backend.nds_files(nds_id).await?;
        let (candidates, vanished) = diff::diff(&remote, &store.files);

        if !vanished.is_empty() {
            info!(nds_id, count = vanished.len(), "removing vanished archives");
            self.backend.remove_files(nds_id, &vanished).await?;
        }

        // Keep only candidates whose archive time parses and falls inside
        // an active task range.
        let gated: Vec<(ScanFile, NaiveDateTime)> = candidates
            .into_iter()
            .filter_map(|file| {
                let name = file.path.rsplit('/').next().unwrap_or(&file.path);
                extract_archive_time(name).map(|time| (file, time))
            })
            .filter(|(_, time)| within_ranges(*time, &store.times))
            .collect();

        let discovered = gated.len();
        if discovered > 0 {
            info!(nds_id, count = discovered, "new archives to parse");
        }

        for batch in gated.chunks(ZIP_INFO_BATCH) {
            let paths: Vec<String> = batch.iter().map(|(file, _)| file.path.clone()).collect();
            let mut infos = self.gateway.zip_info(nds_id, &paths).await?;

            for (file, archive_time) in batch {
                match infos.remove(&file.path) {
                    Some(Ok(members)) => {
                        let records = build_records(
                            nds_id,
                            &file.path,
                            file.data_type,
                            *archive_time,
                            &members,
                        );
                        if !records.is_empty() {
                            self.backend.submit_batch(&records).await?;
                        }
                    }
                    Some(Err(message)) => {
                        // Corrupt or unreadable archive: no rows, next scan
                        // retries once the store still lacks the path.
                        warn!(nds_id, path = %file.path, "zip-info error: {message}");
                    }
                    None => warn!(nds_id, path = %file.path, "zip-info response missing path"),
                }
            }
        }

        Ok(discovered)
    }

    async fn mark_scanning(&self, nds_id: i64, scanning: bool) {
        if let Some(status) = self.status.lock().await.get_mut(&nds_id) {
            status.is_scanning = scanning;
        }
    }

    async fn record_pass(&self, nds_id: i64, at: NaiveDateTime, duration: f64, new_files: usize) {
        if let Some(status) = self.status.lock().await.get_mut(&nds_id) {
            status.last_scan_time = Some(format_time(at));
            status.scan_duration = duration;
            status.new_files_count = new_files;
            status.last_error = None;
        }
    }

    async fn record_error(&self, nds_id: i64, message: &str) {
        warn!(nds_id, "scan pass failed: {message}");
        if let Some(status) = self.status.lock().await.get_mut(&nds_id) {
            status.last_error = Some(message.to_string());
        }
    }

    async fn note_next_scan(&self, nds_id: i64, sleep: Duration) {
        if let Some(status) = self.status.lock().await.get_mut(&nds_id) {
            let next = Local::now().naive_local()
                + chrono::Duration::from_std(sleep).unwrap_or(chrono::Duration::zero());
            status.next_scan_time = Some(format_time(next));
        }
    }
}

/// Member rows for one parsed archive, `Parsed = 0`.
///
/// A member's own name usually embeds the wallclock; the archive's is the
/// fallback so the dispatcher can always order by `FileTime`.
fn build_records(
    nds_id: i64,
    file_path: &str,
    data_type: DataType,
    archive_time: NaiveDateTime,
    members: &[MemberInfo],
) -> Vec<NdsFileRecord> {
    members
        .iter()
        .map(|member| {
            let time =
                extract_archive_time(&member.sub_file_name).unwrap_or(archive_time);
            NdsFileRecord {
                file_hash: file_hash(nds_id, file_path, &member.sub_file_name),
                nds_id,
                file_path: file_path.to_string(),
                sub_file_name: member.sub_file_name.clone(),
                header_offset: member.header_offset,
                compress_size: member.compress_size,
                file_size: member.file_size,
                flag_bits: member.flag_bits,
                compress_type: member.compress_type,
                data_type,
                enodeb_id: member.enodebid,
                file_time: format_time(time),
                parsed: parsed::PENDING,
            }
        })
        .collect()
}
