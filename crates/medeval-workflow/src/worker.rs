//! Background maintenance: periodic expired-lease sweeps and optional QC scans.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument};

use medeval_core::defaults::{EVENT_BUS_CAPACITY, QC_EVERY_N_SWEEPS, SWEEP_INTERVAL_MS};
use medeval_core::{QcProgressRequest, QcProgressResult, Repositories, Result};

use crate::config::WorkflowConfig;
use crate::qc::QcPipeline;
use crate::seeding::Seeder;

/// Configuration for the maintenance worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Interval between sweeps in milliseconds.
    pub sweep_interval_ms: u64,
    /// Run QC on every Nth sweep; `0` never runs QC.
    pub qc_every_n_sweeps: u32,
    /// QC parameters used when a scan is due.
    pub qc_request: QcProgressRequest,
    /// Whether to run the loop at all.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: SWEEP_INTERVAL_MS,
            qc_every_n_sweeps: QC_EVERY_N_SWEEPS,
            qc_request: QcProgressRequest::default(),
            enabled: true,
        }
    }
}

impl WorkerConfig {
    pub fn from_workflow(config: &WorkflowConfig) -> Self {
        Self {
            sweep_interval_ms: config.sweep_interval_ms,
            qc_every_n_sweeps: config.qc_every_n_sweeps,
            qc_request: config.qc_request(),
            enabled: config.worker_enabled,
        }
    }

    pub fn with_sweep_interval(mut self, ms: u64) -> Self {
        self.sweep_interval_ms = ms;
        self
    }

    pub fn with_qc_every(mut self, sweeps: u32, request: QcProgressRequest) -> Self {
        self.qc_every_n_sweeps = sweeps;
        self.qc_request = request;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    fn qc_due(&self, sweep: u64) -> bool {
        self.qc_every_n_sweeps > 0 && sweep % u64::from(self.qc_every_n_sweeps) == 0
    }
}

/// Event emitted by the maintenance worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// Worker started.
    WorkerStarted,
    /// An expired-lease sweep finished.
    SweepCompleted { sweep: u64, recycled: u64 },
    /// A QC scan finished.
    QcCompleted { sweep: u64, result: QcProgressResult },
    /// A sweep or QC scan failed; the loop keeps running.
    TickFailed { sweep: u64, error: String },
    /// Worker stopped.
    WorkerStopped,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
}

impl WorkerHandle {
    /// Signal the worker to shut down gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx.send(()).await.map_err(|_| {
            medeval_core::Error::Internal("Failed to send shutdown signal".into())
        })?;
        Ok(())
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

/// Periodically reclaims expired leases and, optionally, runs QC.
pub struct MaintenanceWorker {
    seeder: Seeder,
    qc: QcPipeline,
    config: WorkerConfig,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl MaintenanceWorker {
    pub fn new(repos: Repositories, config: WorkerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            seeder: Seeder::new(repos.clone()),
            qc: QcPipeline::new(repos),
            config,
            event_tx,
        }
    }

    /// Use a custom QC pipeline (e.g. one with configured boolean markers).
    pub fn with_qc(mut self, qc: QcPipeline) -> Self {
        self.qc = qc;
        self
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        let worker = Arc::new(self);
        tokio::spawn(async move {
            worker.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
        }
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    #[instrument(skip(self, shutdown_rx))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Maintenance worker is disabled, not starting");
            let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
            return;
        }

        info!(
            sweep_interval_ms = self.config.sweep_interval_ms,
            qc_every_n_sweeps = self.config.qc_every_n_sweeps,
            "Maintenance worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let interval = Duration::from_millis(self.config.sweep_interval_ms.max(1));
        let mut sweep: u64 = 0;

        loop {
            sweep += 1;
            self.tick(sweep).await;

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Maintenance worker received shutdown signal");
                    break;
                }
                _ = sleep(interval) => {}
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!(sweeps = sweep, "Maintenance worker stopped");
    }

    async fn tick(&self, sweep: u64) {
        let start = Instant::now();

        match self.seeder.recycle_expired(Utc::now()).await {
            Ok(recycled) => {
                let _ = self
                    .event_tx
                    .send(WorkerEvent::SweepCompleted { sweep, recycled });
            }
            Err(e) => {
                error!(subsystem = "worker", sweep, error = %e, "Expired-lease sweep failed");
                let _ = self.event_tx.send(WorkerEvent::TickFailed {
                    sweep,
                    error: e.to_string(),
                });
                return;
            }
        }

        if self.config.qc_due(sweep) {
            match self.qc.run(&self.config.qc_request).await {
                Ok(result) => {
                    let _ = self.event_tx.send(WorkerEvent::QcCompleted { sweep, result });
                }
                Err(e) => {
                    error!(subsystem = "worker", sweep, error = %e, "Scheduled QC scan failed");
                    let _ = self.event_tx.send(WorkerEvent::TickFailed {
                        sweep,
                        error: e.to_string(),
                    });
                }
            }
        }

        debug!(
            subsystem = "worker",
            sweep,
            duration_ms = start.elapsed().as_millis() as u64,
            "Maintenance tick finished"
        );
    }
}
