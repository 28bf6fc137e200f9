//! Ordered shutdown
//!
//! Shutdown runs a fixed sequence: cancel tickets, destroy poll groups,
//! close connections and listen sockets, release the callback bridge, then
//! tear down the provider module. The coordinator refuses to enter a step
//! out of order. Provider teardown additionally needs the token produced by
//! releasing the bridge, so the two cannot be swapped even by mistake.
//!
//! Each step is best effort: a provider that refuses to release one object
//! does not stop the rest of the step. An interrupted shutdown resumes from
//! the step that failed on the next call.

use relaynet_core::{RelayNetError, Result, ShutdownStep, TransportProvider};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::context::RelayContext;

// ----------------------------------------------------------------------------
// Shutdown Coordinator
// ----------------------------------------------------------------------------

/// Enforces the shutdown step order
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    completed: Vec<ShutdownStep>,
    in_progress: Option<ShutdownStep>,
    report: ShutdownReport,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Step that must run next; `None` once teardown completed
    pub fn next_step(&self) -> Option<ShutdownStep> {
        match self.completed.last() {
            None => Some(ShutdownStep::SEQUENCE[0]),
            Some(last) => last.next(),
        }
    }

    pub fn enter(&mut self, step: ShutdownStep) -> Result<()> {
        let expected = self.next_step();
        if expected != Some(step) {
            error!(?expected, attempted = %step, "Shutdown step out of order");
            return Err(RelayNetError::ShutdownOrderViolation {
                expected,
                attempted: step,
            });
        }
        debug!(%step, "Entering shutdown step");
        self.in_progress = Some(step);
        Ok(())
    }

    pub fn complete(&mut self, step: ShutdownStep) -> Result<()> {
        if self.in_progress != Some(step) {
            return Err(RelayNetError::ShutdownOrderViolation {
                expected: self.in_progress,
                attempted: step,
            });
        }
        self.in_progress = None;
        self.completed.push(step);
        self.report.steps.push(step);
        Ok(())
    }

    /// Whether any step has been entered
    pub fn has_started(&self) -> bool {
        self.in_progress.is_some() || !self.completed.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.next_step().is_none()
    }

    pub fn completed_steps(&self) -> &[ShutdownStep] {
        &self.completed
    }

    pub fn report(&self) -> &ShutdownReport {
        &self.report
    }

    pub(crate) fn report_mut(&mut self) -> &mut ShutdownReport {
        &mut self.report
    }
}

/// What shutdown released
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub tickets_canceled: usize,
    pub poll_groups_destroyed: usize,
    pub connections_closed: usize,
    pub listen_sockets_closed: usize,
    /// Native events still queued when the bridge was released
    pub events_discarded: usize,
    /// Steps completed, in order
    pub steps: Vec<ShutdownStep>,
}

// ----------------------------------------------------------------------------
// Context Shutdown
// ----------------------------------------------------------------------------

impl<P: TransportProvider> RelayContext<P> {
    /// Release everything in dependency order; safe to call more than once
    ///
    /// Never waits on the provider: pending tickets are canceled, live
    /// connections are closed without draining, and a relay bootstrap that is
    /// still running is simply abandoned.
    pub fn shutdown_all(&mut self) -> Result<ShutdownReport> {
        if self.coordinator.is_complete() {
            return Ok(self.coordinator.report().clone());
        }
        info!(resumed = self.coordinator.has_started(), "Shutting down relay context");

        while let Some(step) = self.coordinator.next_step() {
            self.coordinator.enter(step)?;
            self.run_step(step)?;
            self.coordinator.complete(step)?;
        }

        let report = self.coordinator.report().clone();
        info!(
            tickets = report.tickets_canceled,
            poll_groups = report.poll_groups_destroyed,
            connections = report.connections_closed,
            discarded = report.events_discarded,
            "Relay context shut down"
        );
        Ok(report)
    }

    fn run_step(&mut self, step: ShutdownStep) -> Result<()> {
        match step {
            ShutdownStep::CancelTickets => {
                let canceled = self.tickets.cancel_all(&mut self.provider);
                self.tickets.teardown(&mut self.provider);
                self.coordinator.report_mut().tickets_canceled += canceled;
            }
            ShutdownStep::DestroyPollGroups => {
                for group in self.registry.poll_group_handles() {
                    match self
                        .poll_groups
                        .destroy(&mut self.registry, &mut self.provider, group)
                    {
                        Ok(_) => self.coordinator.report_mut().poll_groups_destroyed += 1,
                        Err(err) => warn!(%group, error = %err, "Failed to destroy poll group"),
                    }
                }
            }
            ShutdownStep::CloseConnections => {
                let reason = self.config.connections.shutdown_reason_code;
                let linger = self.config.connections.linger_on_shutdown;
                for connection in self.registry.connection_handles() {
                    if self.connections.close(
                        &mut self.registry,
                        &mut self.provider,
                        connection,
                        reason,
                        "context shutdown",
                        linger,
                    ) {
                        self.coordinator.report_mut().connections_closed += 1;
                    }
                }
                for socket in self.registry.listen_socket_handles() {
                    if self.connections.close_listen_socket(
                        &mut self.registry,
                        &mut self.provider,
                        socket,
                    ) {
                        self.coordinator.report_mut().listen_sockets_closed += 1;
                    }
                }
            }
            ShutdownStep::ReleaseBridge => {
                let released = self.bridge.shutdown(&mut self.provider)?;
                self.coordinator.report_mut().events_discarded += released.discarded();
                self.released = Some(released);
            }
            ShutdownStep::TeardownProvider => {
                let released =
                    self.released
                        .take()
                        .ok_or(RelayNetError::ShutdownOrderViolation {
                            expected: Some(ShutdownStep::ReleaseBridge),
                            attempted: ShutdownStep::TeardownProvider,
                        })?;
                self.provider.teardown_module(released)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinator_runs_in_order() {
        let mut coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.has_started());

        for step in ShutdownStep::SEQUENCE {
            coordinator.enter(step).unwrap();
            assert!(coordinator.has_started());
            coordinator.complete(step).unwrap();
        }
        assert!(coordinator.is_complete());
        assert_eq!(coordinator.completed_steps(), &ShutdownStep::SEQUENCE);
    }

    #[test]
    fn test_teardown_before_release_is_rejected() {
        let mut coordinator = ShutdownCoordinator::new();
        for step in &ShutdownStep::SEQUENCE[..3] {
            coordinator.enter(*step).unwrap();
            coordinator.complete(*step).unwrap();
        }

        let err = coordinator
            .enter(ShutdownStep::TeardownProvider)
            .unwrap_err();
        assert!(matches!(
            err,
            RelayNetError::ShutdownOrderViolation {
                expected: Some(ShutdownStep::ReleaseBridge),
                attempted: ShutdownStep::TeardownProvider,
            }
        ));
        assert!(!coordinator.is_complete());
    }

    #[test]
    fn test_complete_requires_matching_enter() {
        let mut coordinator = ShutdownCoordinator::new();
        assert!(coordinator.complete(ShutdownStep::CancelTickets).is_err());
        coordinator.enter(ShutdownStep::CancelTickets).unwrap();
        assert!(coordinator.complete(ShutdownStep::DestroyPollGroups).is_err());
        assert!(coordinator.complete(ShutdownStep::CancelTickets).is_ok());
    }
}
