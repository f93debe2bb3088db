//! Breakpoint bookkeeping (§3, §4.4, §4.5): user breakpoints with handler
//! callbacks, one-shot coverage breakpoints, and the transient state the
//! step-over protocol needs. This module only tracks *where* breakpoints are
//! and *what* they mean; the `0xCC` bytes themselves live in
//! [`aero_snapshot::Ram`] — callers are expected to call `Ram::add_breakpoint`
//! / `Ram::remove_breakpoint` alongside the methods here.

use std::collections::{HashMap, HashSet};

use aero_types::{Gpa, Gva};

use crate::error::BackendError;

/// A coverage identifier, as carried over the wire (§6) and compared for
/// set membership in the master's aggregated coverage.
pub type CoverageId = u64;

/// What a user breakpoint handler is allowed to do; the step-over protocol
/// (§4.5) inspects which of these happened to decide whether to single-step
/// over the original instruction.
pub trait BreakpointContext {
    fn get_reg(&self, reg: aero_cpu_core::Register) -> u64;
    fn set_reg(&mut self, reg: aero_cpu_core::Register, value: u64);
    /// Request the current run stop with this terminal result.
    fn stop(&mut self, result: aero_snapshot::TestcaseResult);
    /// True if `stop` was called by this handler invocation.
    fn stop_requested(&self) -> bool;
}

pub type Handler = Box<dyn FnMut(&mut dyn BreakpointContext) + Send>;

struct UserBreakpoint {
    gpa: Gpa,
    handler: Handler,
}

/// Transient step-over state: at most one breakpoint can be "stepped over"
/// at a time since a backend drives a single VCPU (§5).
struct StepOver {
    gva: Gva,
    gpa: Gpa,
    /// Whether this breakpoint also carries a coverage id that must be
    /// reported once the step completes, re-removed immediately after.
    coverage_id: Option<CoverageId>,
}

#[derive(Default)]
pub struct Breakpoints {
    user: HashMap<u64, UserBreakpoint>,
    /// One-shot coverage breakpoints: Gva -> (Gpa, coverage id).
    coverage: HashMap<u64, (Gpa, CoverageId)>,
    last_new_coverage: HashSet<CoverageId>,
    step_over: Option<StepOver>,
}

/// What the run loop should do in response to hitting an armed `0xCC`.
pub enum Hit {
    /// A user breakpoint's handler ran; `step_rip` is `Some` if the caller
    /// must now remove the byte, set `RFLAGS.TF`, and single-step.
    User { step_rip: Option<Gva> },
    /// A one-shot coverage breakpoint was consumed; its id was added to
    /// `last_new_coverage`.
    Coverage(CoverageId),
    /// No breakpoint is registered at this Gva (stale/foreign `0xCC`).
    Unknown,
}

impl Breakpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user_breakpoint(&mut self, gva: Gva, gpa: Gpa, handler: Handler) -> Result<(), BackendError> {
        if self.user.contains_key(&gva.raw()) || self.coverage.contains_key(&gva.raw()) {
            return Err(BackendError::BreakpointCollision { gva: gva.to_string() });
        }
        self.user.insert(gva.raw(), UserBreakpoint { gpa, handler });
        Ok(())
    }

    pub fn add_coverage_breakpoint(&mut self, gva: Gva, gpa: Gpa) -> Result<(), BackendError> {
        if self.user.contains_key(&gva.raw()) {
            return Err(BackendError::BreakpointCollision { gva: gva.to_string() });
        }
        self.coverage.insert(gva.raw(), (gpa, gva.raw()));
        Ok(())
    }

    pub fn coverage_breakpoint_count(&self) -> usize {
        self.coverage.len()
    }

    pub fn has_breakpoint(&self, gva: Gva) -> bool {
        self.user.contains_key(&gva.raw()) || self.coverage.contains_key(&gva.raw())
    }

    /// Dispatch a hit `0xCC` at `gva`. For a user breakpoint, invokes its
    /// handler through `ctx` and reports whether a step-over is now needed.
    /// For a coverage breakpoint, removes it (one-shot) and records the id.
    pub fn on_hit(&mut self, gva: Gva, ctx: &mut dyn BreakpointContext) -> Hit {
        if let Some((gpa, id)) = self.coverage.remove(&gva.raw()) {
            let _ = gpa;
            self.last_new_coverage.insert(id);
            return Hit::Coverage(id);
        }

        if let Some(bp) = self.user.get_mut(&gva.raw()) {
            let rip_before = ctx.get_reg(aero_cpu_core::Register::Rip);
            (bp.handler)(ctx);
            let rip_after = ctx.get_reg(aero_cpu_core::Register::Rip);

            if ctx.stop_requested() || rip_after != rip_before {
                return Hit::User { step_rip: None };
            }

            self.step_over = Some(StepOver { gva, gpa: bp.gpa, coverage_id: None });
            return Hit::User { step_rip: Some(gva) };
        }

        Hit::Unknown
    }

    /// Record a synthetic (edge/LAF/CompCov) coverage id directly, bypassing
    /// the breakpoint table (§4.4: these sources never carry a `0xCC`).
    pub fn record_synthetic(&mut self, id: CoverageId) {
        self.last_new_coverage.insert(id);
    }

    /// §4.5 step 4: the next `#DB` after a step-over — returns the Gva/Gpa to
    /// re-arm, clearing the transient state.
    pub fn finish_step_over(&mut self) -> Option<(Gva, Gpa)> {
        let state = self.step_over.take()?;
        Some((state.gva, state.gpa))
    }

    pub fn is_stepping_over(&self) -> bool {
        self.step_over.is_some()
    }

    /// Peek the `Gpa` of the breakpoint currently being stepped over without
    /// clearing the transient state (§4.5 step 3: the caller needs this to
    /// remove the `0xCC` before single-stepping; `finish_step_over` is only
    /// called once the step has retired).
    pub fn step_over_gpa(&self) -> Option<Gpa> {
        self.step_over.as_ref().map(|s| s.gpa)
    }

    pub fn last_new_coverage(&self) -> &HashSet<CoverageId> {
        &self.last_new_coverage
    }

    pub fn take_last_new_coverage(&mut self) -> HashSet<CoverageId> {
        std::mem::take(&mut self.last_new_coverage)
    }

    /// §4.4 "on Timedout, revoke_last_new_coverage re-installs them": put
    /// every id reported this run back into the one-shot coverage table,
    /// since we only ever remove the *entry*, and the caller is responsible
    /// for re-arming the `0xCC` byte in `Ram` for each returned Gva.
    pub fn revoke_last_new_coverage(&mut self) -> Vec<Gva> {
        let ids = self.take_last_new_coverage();
        let mut revoked = Vec::with_capacity(ids.len());
        for id in ids {
            // Coverage-breakpoint ids are the Gva itself (§4.4); synthetic
            // edge/LAF/CompCov ids have no corresponding breakpoint to
            // re-arm and are simply dropped from the per-run set.
            let gva = Gva::new(id);
            if !self.coverage.contains_key(&gva.raw()) {
                revoked.push(gva);
            }
        }
        revoked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeCtx {
        rip: u64,
        stopped: bool,
    }

    impl BreakpointContext for FakeCtx {
        fn get_reg(&self, reg: aero_cpu_core::Register) -> u64 {
            match reg {
                aero_cpu_core::Register::Rip => self.rip,
                _ => 0,
            }
        }
        fn set_reg(&mut self, reg: aero_cpu_core::Register, value: u64) {
            if let aero_cpu_core::Register::Rip = reg {
                self.rip = value;
            }
        }
        fn stop(&mut self, _result: aero_snapshot::TestcaseResult) {
            self.stopped = true;
        }
        fn stop_requested(&self) -> bool {
            self.stopped
        }
    }

    #[test]
    fn coverage_breakpoint_is_one_shot() {
        let mut bps = Breakpoints::new();
        let gva = Gva::new(0x1000);
        bps.add_coverage_breakpoint(gva, Gpa::new(0x2000)).unwrap();
        assert_eq!(bps.coverage_breakpoint_count(), 1);

        let mut ctx = FakeCtx { rip: gva.raw(), stopped: false };
        let hit = bps.on_hit(gva, &mut ctx);
        assert!(matches!(hit, Hit::Coverage(id) if id == gva.raw()));
        assert_eq!(bps.coverage_breakpoint_count(), 0);
        assert!(bps.last_new_coverage().contains(&gva.raw()));
    }

    #[test]
    fn user_breakpoint_handler_that_does_not_move_rip_requires_step_over() {
        let mut bps = Breakpoints::new();
        let gva = Gva::new(0x3000);
        bps.add_user_breakpoint(gva, Gpa::new(0x4000), Box::new(|_ctx| {})).unwrap();

        let mut ctx = FakeCtx { rip: gva.raw(), stopped: false };
        let hit = bps.on_hit(gva, &mut ctx);
        assert!(matches!(hit, Hit::User { step_rip: Some(_) }));
        assert!(bps.is_stepping_over());

        let (revived_gva, _gpa) = bps.finish_step_over().unwrap();
        assert_eq!(revived_gva, gva);
        assert!(!bps.is_stepping_over());
    }

    #[test]
    fn user_breakpoint_handler_that_moves_rip_skips_step_over() {
        let mut bps = Breakpoints::new();
        let gva = Gva::new(0x3000);
        bps.add_user_breakpoint(
            gva,
            Gpa::new(0x4000),
            Box::new(|ctx| ctx.set_reg(aero_cpu_core::Register::Rip, 0x5000)),
        )
        .unwrap();

        let mut ctx = FakeCtx { rip: gva.raw(), stopped: false };
        let hit = bps.on_hit(gva, &mut ctx);
        assert!(matches!(hit, Hit::User { step_rip: None }));
        assert!(!bps.is_stepping_over());
    }

    #[test]
    fn colliding_breakpoints_are_refused() {
        let mut bps = Breakpoints::new();
        let gva = Gva::new(0x1000);
        bps.add_coverage_breakpoint(gva, Gpa::new(0x2000)).unwrap();
        let err = bps.add_user_breakpoint(gva, Gpa::new(0x2000), Box::new(|_| {})).unwrap_err();
        assert!(matches!(err, BackendError::BreakpointCollision { .. }));
    }

    #[test]
    fn timeout_revokes_coverage_ids_without_rearming_synthetic_ones() {
        let mut bps = Breakpoints::new();
        let gva = Gva::new(0x1000);
        bps.add_coverage_breakpoint(gva, Gpa::new(0x2000)).unwrap();
        let mut ctx = FakeCtx { rip: gva.raw(), stopped: false };
        bps.on_hit(gva, &mut ctx);
        bps.record_synthetic(0xdead_beef);

        let to_rearm = bps.revoke_last_new_coverage();
        assert_eq!(to_rearm, vec![gva]);
        assert!(bps.last_new_coverage().is_empty());
    }
}
