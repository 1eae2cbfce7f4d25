//! Crosslink runtime
//!
//! Owns the background tasks that keep a coordinator alive: the inbound
//! pump, the maintenance ticker (tracker sweep + stream timeout reaping)
//! and the dispatcher flush timer. Construction wires the component graph
//! explicitly; `start` spawns the tasks and `stop` tears them down.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crosslink_core::config::CrosslinkConfig;
use crosslink_core::errors::CrosslinkError;
use crosslink_core::types::{ExecutionContext, SystemTimeSource, TimeSource};
use crosslink_core::Result;

use crate::channel::TransportChannel;
use crate::coordinator::Coordinator;
use crate::dispatcher::{ResultDispatcher, ResultSink};
use crate::transport::{InboundReceiver, Transport};

// ----------------------------------------------------------------------------
// Crosslink Runtime
// ----------------------------------------------------------------------------

/// Task owner for one endpoint of the coordination layer
pub struct CrosslinkRuntime {
    config: CrosslinkConfig,
    coordinator: Arc<Coordinator>,
    pump_handle: Option<JoinHandle<()>>,
    maintenance_handle: Option<JoinHandle<()>>,
    flush_handle: Option<JoinHandle<()>>,
    running: bool,
}

impl CrosslinkRuntime {
    /// Build a runtime over the given transport and result sink, using the
    /// system clock
    pub fn new(
        config: CrosslinkConfig,
        local_context: ExecutionContext,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Self> {
        Self::with_time_source(config, local_context, transport, sink, Arc::new(SystemTimeSource))
    }

    /// Build a runtime with an injected clock (simulations and tests)
    pub fn with_time_source(
        config: CrosslinkConfig,
        local_context: ExecutionContext,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn ResultSink>,
        time_source: Arc<dyn TimeSource>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(CrosslinkError::config_error)?;

        let channel = Arc::new(TransportChannel::new(
            transport,
            config.delivery.clone(),
            config.breaker.clone(),
            Arc::clone(&time_source),
        ));
        let dispatcher = Arc::new(ResultDispatcher::new(
            config.dispatcher.clone(),
            sink,
            Arc::clone(&time_source),
        ));
        let coordinator = Arc::new(Coordinator::new(
            config.clone(),
            local_context,
            channel,
            dispatcher,
            time_source,
        ));

        Ok(Self {
            config,
            coordinator,
            pump_handle: None,
            maintenance_handle: None,
            flush_handle: None,
            running: false,
        })
    }

    /// The coordinator driven by this runtime
    pub fn coordinator(&self) -> Arc<Coordinator> {
        Arc::clone(&self.coordinator)
    }

    /// Spawn the background tasks. `inbound` is the stream of envelopes
    /// arriving at this endpoint.
    pub fn start(&mut self, mut inbound: InboundReceiver) -> Result<()> {
        if self.running {
            return Err(CrosslinkError::config_error("runtime already started"));
        }

        let pump_coordinator = self.coordinator();
        self.pump_handle = Some(tokio::spawn(async move {
            while let Some(envelope) = inbound.recv().await {
                pump_coordinator.handle_inbound(envelope).await;
            }
            debug!("inbound pump finished");
        }));

        let sweep_interval = self.config.tracker.sweep_interval;
        let maintenance_coordinator = self.coordinator();
        self.maintenance_handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                maintenance_coordinator.reap_stream_timeouts();
                maintenance_coordinator.run_sweep();
            }
        }));

        let flush_interval = self.config.dispatcher.queue_flush_interval;
        let flush_coordinator = self.coordinator();
        self.flush_handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                flush_coordinator.flush_dispatcher().await;
            }
        }));

        self.running = true;
        info!("crosslink runtime started");
        Ok(())
    }

    /// Abort the background tasks
    pub fn stop(&mut self) {
        for handle in [
            self.pump_handle.take(),
            self.maintenance_handle.take(),
            self.flush_handle.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
        self.running = false;
        info!("crosslink runtime stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

impl Drop for CrosslinkRuntime {
    fn drop(&mut self) {
        if self.running {
            self.stop();
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
