//! Per-execution resource enforcement.
//!
//! A [`ResourceEnforcer`] is armed for every execute/resume span. It owns
//! the on-CPU deadline and the per-invocation counters; every host ABI call
//! charges it, and the engine binding polls it at yield points. Time spent
//! parked does not count: the clock is disarmed at suspension and re-armed
//! with a fresh budget on resume.

use crate::config::ExecutionLimits;
use crate::error::{AbiFault, AbiResult, ResourceKind};
use std::time::{Duration, Instant};

/// Budget for re-arming the enforcer on resume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeBudget {
    /// Full default budget (the configured timeout)
    Reset,
    /// Explicit remainder supplied by the host, in milliseconds
    Remainder(u32),
}

/// Armed per-invocation limits and counters
#[derive(Debug)]
pub struct ResourceEnforcer {
    limits: ExecutionLimits,
    deadline: Option<Instant>,
    host_calls: u32,
    state_mutations: u32,
    events: u32,
}

impl ResourceEnforcer {
    /// Create a disarmed enforcer with the given limits
    pub fn new(limits: ExecutionLimits) -> Self {
        Self {
            limits,
            deadline: None,
            host_calls: 0,
            state_mutations: 0,
            events: 0,
        }
    }

    /// The limits this enforcer was created with
    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    /// Arm the deadline for a fresh execute span. Counters reset.
    pub fn arm(&mut self) {
        self.deadline = Some(Instant::now() + Duration::from_millis(self.limits.timeout_ms as u64));
        self.host_calls = 0;
        self.state_mutations = 0;
        self.events = 0;
    }

    /// Disarm the deadline at a suspension. Counters are kept; they bound
    /// the whole invocation, not a single span.
    pub fn park(&mut self) {
        self.deadline = None;
    }

    /// Re-arm the deadline on resume.
    pub fn resume(&mut self, budget: ResumeBudget) {
        let ms = match budget {
            ResumeBudget::Reset => self.limits.timeout_ms,
            ResumeBudget::Remainder(ms) => ms,
        };
        self.deadline = Some(Instant::now() + Duration::from_millis(ms as u64));
    }

    /// Milliseconds until the deadline, saturating at zero. Used by the
    /// engine binding to program its interrupt mechanism.
    pub fn remaining_ms(&self) -> Option<u64> {
        self.deadline.map(|d| {
            d.checked_duration_since(Instant::now())
                .map(|r| r.as_millis() as u64)
                .unwrap_or(0)
        })
    }

    /// Deadline check with no counter charge. This is the yield point the
    /// bootstrap calls from generated code.
    pub fn check_deadline(&self) -> AbiResult<()> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(AbiFault::Timeout),
            _ => Ok(()),
        }
    }

    /// Charge one host ABI call. Every inbound ABI entry goes through this;
    /// the deadline is checked here too, so a looping handler that keeps
    /// calling the host is interrupted without waiting for a yield tick.
    pub fn charge_host_call(&mut self) -> AbiResult<()> {
        self.check_deadline()?;
        self.host_calls += 1;
        if self.host_calls > self.limits.max_host_calls {
            return Err(AbiFault::ResourceLimit(ResourceKind::HostCalls));
        }
        Ok(())
    }

    /// Charge one state mutation (set or delete)
    pub fn charge_state_mutation(&mut self) -> AbiResult<()> {
        self.state_mutations += 1;
        if self.state_mutations > self.limits.max_state_mutations {
            return Err(AbiFault::ResourceLimit(ResourceKind::StateMutations));
        }
        Ok(())
    }

    /// Charge one event emission
    pub fn charge_event(&mut self) -> AbiResult<()> {
        self.events += 1;
        if self.events > self.limits.max_events {
            return Err(AbiFault::ResourceLimit(ResourceKind::Events));
        }
        Ok(())
    }

    /// Host ABI calls charged so far this invocation
    pub fn host_calls(&self) -> u32 {
        self.host_calls
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    fn limits(timeout_ms: u32) -> ExecutionLimits {
        RuntimeConfig::default().execution_limits(Some(timeout_ms))
    }

    #[test]
    fn test_host_call_ceiling() {
        let mut lims = limits(5000);
        lims.max_host_calls = 2;
        let mut enforcer = ResourceEnforcer::new(lims);
        enforcer.arm();

        assert!(enforcer.charge_host_call().is_ok());
        assert!(enforcer.charge_host_call().is_ok());
        assert_eq!(
            enforcer.charge_host_call(),
            Err(AbiFault::ResourceLimit(ResourceKind::HostCalls))
        );
    }

    #[test]
    fn test_mutation_and_event_ceilings() {
        let mut lims = limits(5000);
        lims.max_state_mutations = 1;
        lims.max_events = 1;
        let mut enforcer = ResourceEnforcer::new(lims);
        enforcer.arm();

        assert!(enforcer.charge_state_mutation().is_ok());
        assert_eq!(
            enforcer.charge_state_mutation(),
            Err(AbiFault::ResourceLimit(ResourceKind::StateMutations))
        );

        assert!(enforcer.charge_event().is_ok());
        assert_eq!(
            enforcer.charge_event(),
            Err(AbiFault::ResourceLimit(ResourceKind::Events))
        );
    }

    #[test]
    fn test_deadline_expiry() {
        let mut enforcer = ResourceEnforcer::new(limits(1));
        enforcer.arm();
        std::thread::sleep(std::time::Duration::from_millis(5));

        assert_eq!(enforcer.check_deadline(), Err(AbiFault::Timeout));
        assert_eq!(enforcer.charge_host_call(), Err(AbiFault::Timeout));
    }

    #[test]
    fn test_parked_time_does_not_expire() {
        let mut enforcer = ResourceEnforcer::new(limits(1));
        enforcer.arm();
        enforcer.park();
        std::thread::sleep(std::time::Duration::from_millis(5));

        // Disarmed while parked: no deadline to exceed.
        assert!(enforcer.check_deadline().is_ok());

        enforcer.resume(ResumeBudget::Reset);
        assert!(enforcer.check_deadline().is_ok());
    }

    #[test]
    fn test_counters_survive_park() {
        let mut lims = limits(5000);
        lims.max_host_calls = 2;
        let mut enforcer = ResourceEnforcer::new(lims);
        enforcer.arm();

        assert!(enforcer.charge_host_call().is_ok());
        enforcer.park();
        enforcer.resume(ResumeBudget::Reset);
        assert!(enforcer.charge_host_call().is_ok());
        assert!(enforcer.charge_host_call().is_err());
    }

    #[test]
    fn test_remainder_budget() {
        let mut enforcer = ResourceEnforcer::new(limits(5000));
        enforcer.arm();
        enforcer.park();
        enforcer.resume(ResumeBudget::Remainder(0));

        assert_eq!(enforcer.check_deadline(), Err(AbiFault::Timeout));
    }
}
