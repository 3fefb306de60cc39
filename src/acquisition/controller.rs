//! Run controller: owns the acquirers of one session and the fatal channel.
//!
//! Acquirers report fatal errors through a [`ChannelReporter`]; the
//! controller is the single receiver. The reporter trips a session-wide
//! stop the moment a fatal error is raised, so every other acquirer winds
//! down on its own; receiving the message then joins and releases them all.
//! All acquirers are configured before any is started so that the streams
//! share one start window.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::ProbeSettings;
use crate::error::{AcqError, AcqResult, ChannelReporter, FatalErrorReporter};

use super::{Acquirer, AnyAcquirer, FifoStatus};

pub struct RunController {
    reporter: Arc<ChannelReporter>,
    fatal_rx: mpsc::UnboundedReceiver<String>,
    acquirers: Vec<AnyAcquirer>,
    running: bool,
}

impl RunController {
    /// Empty controller with its own fatal channel.
    pub fn new() -> Self {
        let (reporter, fatal_rx) = ChannelReporter::channel();
        Self {
            reporter: Arc::new(reporter),
            fatal_rx,
            acquirers: Vec::new(),
            running: false,
        }
    }

    /// Reporter to hand to every acquirer built for this controller.
    pub fn reporter(&self) -> Arc<dyn FatalErrorReporter> {
        self.reporter.clone()
    }

    /// Append an acquirer; it is configured and run in insertion order.
    pub fn add(&mut self, acquirer: impl Into<AnyAcquirer>) {
        self.acquirers.push(acquirer.into());
    }

    /// Acquirers in start order.
    pub fn acquirers(&self) -> &[AnyAcquirer] {
        &self.acquirers
    }

    /// True between a successful [`start`](Self::start) and the next stop,
    /// including the stop forced by a fatal error.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Configure every acquirer, then run them in order.
    ///
    /// Any failure stops everything already started and is returned.
    pub fn start(&mut self) -> AcqResult<()> {
        if self.running {
            return Err(AcqError::Configuration("run already started".into()));
        }
        while let Ok(stale) = self.fatal_rx.try_recv() {
            tracing::debug!(error = %stale, "Discarding fatal error from previous run");
        }
        self.reporter.reset();
        let result = self.start_all();
        match result {
            Ok(()) => {
                self.running = true;
                tracing::info!(sources = self.acquirers.len(), "Run started");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Run failed to start");
                self.stop_all();
                Err(e)
            }
        }
    }

    fn start_all(&mut self) -> AcqResult<()> {
        for acq in &mut self.acquirers {
            let _span = tracing::info_span!("configure", source = acq.name()).entered();
            acq.configure()?;
        }
        for acq in &mut self.acquirers {
            let _span = tracing::info_span!("run", source = acq.name()).entered();
            acq.run()?;
        }
        Ok(())
    }

    /// Wait up to `timeout` for a fatal error from any acquirer.
    ///
    /// A received error stops every acquirer before it is returned.
    pub async fn wait_for_fatal(&mut self, timeout: Duration) -> Option<String> {
        let fatal = tokio::time::timeout(timeout, self.fatal_rx.recv())
            .await
            .ok()
            .flatten();
        self.on_fatal(fatal)
    }

    /// Fatal error already reported, if any. Stops the run like
    /// [`wait_for_fatal`](Self::wait_for_fatal).
    pub fn try_fatal(&mut self) -> Option<String> {
        let fatal = self.fatal_rx.try_recv().ok();
        self.on_fatal(fatal)
    }

    fn on_fatal(&mut self, fatal: Option<String>) -> Option<String> {
        if let Some(msg) = &fatal {
            tracing::error!(error = %msg, "Fatal acquisition error, stopping all sources");
            self.stop();
        }
        fatal
    }

    pub fn fifo_status(&self) -> Vec<FifoStatus> {
        self.acquirers.iter().flat_map(|a| a.fifo_status()).collect()
    }

    /// Route a probe update to acquirer `source`.
    pub fn update(&mut self, source: usize, probe: usize, settings: ProbeSettings) -> AcqResult<()> {
        let acq = self
            .acquirers
            .get_mut(source)
            .ok_or_else(|| AcqError::Configuration(format!("no acquisition source {source}")))?;
        acq.update(probe, settings)
    }

    /// Stop every acquirer, last started first.
    pub fn stop(&mut self) {
        self.stop_all();
        if self.running {
            tracing::info!("Run stopped");
        }
        self.running = false;
    }

    fn stop_all(&mut self) {
        for acq in self.acquirers.iter_mut().rev() {
            acq.stop();
        }
    }
}

impl Default for RunController {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RunController {
    fn drop(&mut self) {
        if self.running {
            self.stop();
        }
    }
}
