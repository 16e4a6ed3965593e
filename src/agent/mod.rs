//! Agent wiring: receives capture requests and drives the state machine.
//!
//! The capture core is synchronous; the agent bridges it onto the tokio
//! runtime. Requests arrive on an mpsc channel (the RPC / watchdog seam) and
//! are handled one at a time through `spawn_blocking`, which also serializes
//! the delayed Dump transitions the scheduler posts back onto the same
//! channel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::dyntrace::event::AppCallerEvent;
use crate::dyntrace::gate::DynamicTraceGate;
use crate::dyntrace::ports::{DumpScheduler, EventPublisher, TraceSubsystem};
use crate::dyntrace::{AppTraceContext, TraceStage};
use crate::flow::{CallerClass, TraceFlowController};
use crate::storage::TraceDb;

const REQUEST_QUEUE_DEPTH: usize = 16;

/// A transition request for the capture state machine.
#[derive(Debug)]
pub struct CaptureRequest {
    pub target: TraceStage,
    pub event: AppCallerEvent,
}

/// Owns the capture context and the request loop around it.
pub struct Agent {
    ctx: Arc<AppTraceContext>,
    tx: mpsc::Sender<CaptureRequest>,
    rx: Option<mpsc::Receiver<CaptureRequest>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Builds the full capture stack from config and the injected ports.
    ///
    /// Must be called from within a tokio runtime; the dump scheduler
    /// captures the current runtime handle.
    pub fn new(
        cfg: &Config,
        subsystem: Arc<dyn TraceSubsystem>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&cfg.share_dir).with_context(|| {
            format!("creating share directory {}", cfg.share_dir.display())
        })?;
        let db = Arc::new(TraceDb::open(&cfg.db_path).context("opening collection database")?);

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let gate = Arc::new(DynamicTraceGate::new(cfg.enable_dynamic_trace));
        let flow = TraceFlowController::new(
            CallerClass::App,
            db,
            Arc::clone(&clock),
            cfg.flow_settings(),
        );

        let (tx, rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let cancel = CancellationToken::new();
        let scheduler = Arc::new(TokioDumpScheduler {
            tx: tx.clone(),
            cancel: cancel.clone(),
            handle: tokio::runtime::Handle::current(),
        });

        let ctx = Arc::new(AppTraceContext::new(
            gate,
            subsystem,
            publisher,
            scheduler,
            flow,
            clock,
            cfg.capture_settings(),
        ));

        Ok(Self {
            ctx,
            tx,
            rx: Some(rx),
            cancel,
        })
    }

    /// Sender half of the request channel, handed to the RPC/watchdog seam.
    pub fn request_sender(&self) -> mpsc::Sender<CaptureRequest> {
        self.tx.clone()
    }

    /// Queues a new capture for the app described by `event`.
    pub fn request_capture(&self, event: AppCallerEvent) {
        if self
            .tx
            .try_send(CaptureRequest {
                target: TraceStage::Start,
                event,
            })
            .is_err()
        {
            warn!("capture request queue full, dropping request");
        }
    }

    /// Spawns the request loop.
    pub async fn start(&mut self) -> Result<()> {
        let mut rx = self.rx.take().context("agent already started")?;
        let ctx = Arc::clone(&self.ctx);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    _ = cancel.cancelled() => break,
                    request = rx.recv() => match request {
                        Some(request) => request,
                        None => break,
                    },
                };
                handle_request(&ctx, request).await;
            }
            info!("capture request loop stopped");
        });

        info!("agent started");
        Ok(())
    }

    /// Cancels the request loop and any pending delayed dumps.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();
        info!("agent stopped");
        Ok(())
    }
}

async fn handle_request(ctx: &Arc<AppTraceContext>, request: CaptureRequest) {
    let ctx = Arc::clone(ctx);
    let joined = tokio::task::spawn_blocking(move || {
        let CaptureRequest { target, mut event } = request;
        let result = ctx.transfer_to(target, &mut event);
        (target, event, result)
    })
    .await;

    match joined {
        Ok((target, event, Ok(()))) => {
            debug!(stage = %target, uid = event.uid, pid = event.pid, "transition complete");
        }
        Ok((target, event, Err(err))) => {
            info!(
                stage = %target,
                uid = event.uid,
                pid = event.pid,
                code = event.wire_code(),
                error = %err,
                "transition failed"
            );
        }
        Err(err) => {
            warn!(error = %err, "capture task panicked");
        }
    }
}

/// Posts the Start -> Dump auto-transition back onto the request loop after
/// the recording window elapses.
struct TokioDumpScheduler {
    tx: mpsc::Sender<CaptureRequest>,
    cancel: CancellationToken,
    handle: tokio::runtime::Handle,
}

impl DumpScheduler for TokioDumpScheduler {
    fn schedule_dump(&self, event: AppCallerEvent, delay: Duration) {
        let tx = self.tx.clone();
        let cancel = self.cancel.clone();
        self.handle.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let request = CaptureRequest {
                        target: TraceStage::Dump,
                        event,
                    };
                    if tx.send(request).await.is_err() {
                        warn!("request loop gone, dropping delayed dump");
                    }
                }
            }
        });
    }
}
