//! Operating Mode State Machine
//!
//! The camera has exactly one live configuration. Every transition goes
//! through [`ModeController`], which:
//!
//! 1. takes the exclusive transition slot (bounded wait),
//! 2. closes the gate so running operations see themselves as stale and
//!    waits for the outstanding-operation count to reach zero,
//! 3. runs the caller's reconfiguration,
//! 4. commits the new mode, or leaves the controller `Idle` on failure.
//!
//! Operations register through [`ModeController::begin`], which performs the
//! transition and the registration under the same slot, so no other
//! transition can land between the two.

use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ControlError, Result};

/// Session operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    /// Not configured: before the first transition or after a failed one
    Idle,
    /// Free-running acquisition for live monitoring
    Preview,
    /// Software-triggered single shots
    Capture,
}

impl OperatingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            OperatingMode::Idle => "idle",
            OperatingMode::Preview => "preview",
            OperatingMode::Capture => "capture",
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exposure and gain for a capture
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CaptureParams {
    /// Exposure time in seconds
    pub exposure_s: f64,
    pub gain: i32,
}

/// Target of a mode transition
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModeRequest {
    Preview,
    Capture(CaptureParams),
}

impl ModeRequest {
    pub fn mode(&self) -> OperatingMode {
        match self {
            ModeRequest::Preview => OperatingMode::Preview,
            ModeRequest::Capture(_) => OperatingMode::Capture,
        }
    }
}

/// Result of a transition request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Already in the requested mode, nothing was touched
    Unchanged,
    /// The device was reconfigured
    Switched { from: OperatingMode },
}

#[derive(Debug)]
struct ModeState {
    mode: OperatingMode,
    /// Registered operations (the drain barrier count)
    in_flight: usize,
    /// Someone owns the transition slot
    slot_held: bool,
    /// A transition is draining or reconfiguring; operations must stop
    gate_closed: bool,
}

/// Guarded mode state machine with a counted drain barrier
pub struct ModeController {
    state: Mutex<ModeState>,
    changed: Condvar,
    lock_timeout: Duration,
}

impl ModeController {
    /// New controller in `Idle`. `lock_timeout` bounds the wait for the transition slot.
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(ModeState {
                mode: OperatingMode::Idle,
                in_flight: 0,
                slot_held: false,
                gate_closed: false,
            }),
            changed: Condvar::new(),
            lock_timeout,
        }
    }

    pub fn mode(&self) -> OperatingMode {
        self.lock().mode
    }

    /// Number of registered operations
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// A transition is draining operations or reconfiguring the device
    pub fn is_transitioning(&self) -> bool {
        self.lock().gate_closed
    }

    /// Switch to `target`, running `reconfigure` once every operation has drained.
    pub fn request<F>(&self, target: OperatingMode, reconfigure: F) -> Result<Transition>
    where
        F: FnOnce() -> Result<()>,
    {
        self.transition(target, false, reconfigure, || Ok(()))
    }

    /// Like [`request`](Self::request), but when already in `target` runs
    /// `adjust` under the transition slot instead.
    pub fn request_with<F, A>(
        &self,
        target: OperatingMode,
        reconfigure: F,
        adjust: A,
    ) -> Result<Transition>
    where
        F: FnOnce() -> Result<()>,
        A: FnOnce() -> Result<()>,
    {
        self.transition(target, false, reconfigure, adjust)
    }

    /// Switch to `target` if needed and register one operation in it.
    pub fn begin<F>(&self, target: OperatingMode, reconfigure: F) -> Result<OperationGuard<'_>>
    where
        F: FnOnce() -> Result<()>,
    {
        self.begin_with(target, reconfigure, || Ok(()))
    }

    /// Like [`begin`](Self::begin), with `adjust` run on the unchanged path
    /// before the operation registers.
    ///
    /// `adjust` holds the transition slot, so it must not call back into the
    /// controller.
    pub fn begin_with<F, A>(
        &self,
        target: OperatingMode,
        reconfigure: F,
        adjust: A,
    ) -> Result<OperationGuard<'_>>
    where
        F: FnOnce() -> Result<()>,
        A: FnOnce() -> Result<()>,
    {
        self.transition(target, true, reconfigure, adjust)?;
        Ok(OperationGuard {
            controller: self,
            mode: target,
        })
    }

    /// Run `f` while holding the transition slot, without draining.
    ///
    /// For parameter changes the device accepts while streaming. Callers must
    /// not hold an [`OperationGuard`]: a transition draining that guard would
    /// keep the slot until the wait times out.
    pub fn exclusive<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let mut state = self.acquire_slot()?;
        state.slot_held = true;
        drop(state);

        let _slot = HeldSlot {
            controller: self,
            commit: None,
            register: false,
        };
        f()
    }

    /// With `register`, the caller owns one count of `in_flight` on success.
    fn transition<F, A>(
        &self,
        target: OperatingMode,
        register: bool,
        reconfigure: F,
        adjust: A,
    ) -> Result<Transition>
    where
        F: FnOnce() -> Result<()>,
        A: FnOnce() -> Result<()>,
    {
        let mut state = self.acquire_slot()?;

        if state.mode == target {
            debug!("Camera already in {} mode", target);
            state.slot_held = true;
            drop(state);

            let mut slot = HeldSlot {
                controller: self,
                commit: None,
                register: false,
            };
            adjust()?;
            slot.register = register;
            drop(slot);
            return Ok(Transition::Unchanged);
        }

        let from = state.mode;
        state.slot_held = true;
        state.gate_closed = true;
        if state.in_flight > 0 {
            debug!("Draining {} operation(s) before switching to {}", state.in_flight, target);
        }
        let state = self
            .changed
            .wait_while(state, |s| s.in_flight > 0)
            .unwrap_or_else(|p| p.into_inner());
        drop(state);

        // Releases the slot on every exit path, including a panicking reconfigure.
        let mut slot = HeldSlot {
            controller: self,
            commit: Some(OperatingMode::Idle),
            register: false,
        };

        match reconfigure() {
            Ok(()) => {
                slot.commit = Some(target);
                slot.register = register;
                drop(slot);
                info!("Camera mode {} -> {}", from, target);
                metrics::counter!("camera_mode_transitions_total", "mode" => target.as_str())
                    .increment(1);
                Ok(Transition::Switched { from })
            }
            Err(e) => {
                drop(slot);
                warn!("Switching to {} mode failed, camera left idle: {}", target, e);
                Err(e)
            }
        }
    }

    /// Wait for the transition slot; returns with the state lock held
    fn acquire_slot(&self) -> Result<MutexGuard<'_, ModeState>> {
        let state = self.lock();
        let (state, wait) = self
            .changed
            .wait_timeout_while(state, self.lock_timeout, |s| s.slot_held)
            .unwrap_or_else(|p| p.into_inner());
        if wait.timed_out() && state.slot_held {
            return Err(ControlError::TransitionBusy(self.lock_timeout.as_millis() as u64));
        }
        Ok(state)
    }

    fn lock(&self) -> MutexGuard<'_, ModeState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn release(&self) {
        let mut state = self.lock();
        state.in_flight -= 1;
        drop(state);
        self.changed.notify_all();
    }
}

/// Owned transition slot, released on drop
struct HeldSlot<'a> {
    controller: &'a ModeController,
    /// Mode to store on release; `None` leaves the mode alone
    commit: Option<OperatingMode>,
    register: bool,
}

impl Drop for HeldSlot<'_> {
    fn drop(&mut self) {
        let mut state = self.controller.lock();
        if let Some(mode) = self.commit {
            state.mode = mode;
        }
        // Commit and registration share one critical section.
        if self.register {
            state.in_flight += 1;
        }
        state.slot_held = false;
        state.gate_closed = false;
        drop(state);
        self.controller.changed.notify_all();
    }
}

/// One registered operation. Dropping it deregisters.
pub struct OperationGuard<'a> {
    controller: &'a ModeController,
    mode: OperatingMode,
}

impl OperationGuard<'_> {
    /// Mode the operation was started in
    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    /// Still the session's mode and no transition is waiting on us
    pub fn is_active(&self) -> bool {
        self.ensure_active().is_ok()
    }

    /// `Ok` while active, `ModeChanged` otherwise
    pub fn ensure_active(&self) -> Result<()> {
        self.check(true)
    }

    /// Like [`ensure_active`](Self::ensure_active), but ignores a transition
    /// that is waiting for this operation to finish
    pub fn ensure_mode(&self) -> Result<()> {
        self.check(false)
    }

    fn check(&self, respect_gate: bool) -> Result<()> {
        let state = self.controller.lock();
        if state.mode == self.mode && !(respect_gate && state.gate_closed) {
            Ok(())
        } else {
            Err(ControlError::ModeChanged {
                expected: self.mode,
                current: state.mode,
            })
        }
    }
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.controller.release();
    }
}

impl fmt::Debug for OperationGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationGuard").field("mode", &self.mode).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camera_driver::{CameraError, ErrorKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn controller() -> ModeController {
        ModeController::new(Duration::from_millis(500))
    }

    #[test]
    fn test_starts_idle() {
        let modes = controller();
        assert_eq!(modes.mode(), OperatingMode::Idle);
        assert_eq!(modes.in_flight(), 0);
    }

    #[test]
    fn test_same_mode_is_noop() {
        let modes = controller();
        let calls = AtomicUsize::new(0);
        let reconfigure = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };

        assert_eq!(
            modes.request(OperatingMode::Preview, reconfigure).unwrap(),
            Transition::Switched { from: OperatingMode::Idle }
        );
        let again = modes
            .request(OperatingMode::Preview, || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert_eq!(again, Transition::Unchanged);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_transition_leaves_idle() {
        let modes = controller();
        modes.request(OperatingMode::Preview, || Ok(())).unwrap();

        let err = modes
            .request(OperatingMode::Capture, || {
                Err(CameraError::new(ErrorKind::IoError, "CameraPlay", "bus error").into())
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoError);
        assert_eq!(modes.mode(), OperatingMode::Idle);
        assert!(!modes.is_transitioning());

        // Nothing is assumed about the device: asking for preview again reconfigures.
        let t = modes.request(OperatingMode::Preview, || Ok(())).unwrap();
        assert_eq!(t, Transition::Switched { from: OperatingMode::Idle });
    }

    #[test]
    fn test_begin_registers_operation() {
        let modes = controller();
        let op = modes.begin(OperatingMode::Preview, || Ok(())).unwrap();
        assert_eq!(modes.in_flight(), 1);
        assert!(op.is_active());
        drop(op);
        assert_eq!(modes.in_flight(), 0);
    }

    #[test]
    fn test_transition_waits_for_drain() {
        let modes = Arc::new(controller());
        let reconfigured_with = Arc::new(AtomicUsize::new(usize::MAX));

        let op = modes.begin(OperatingMode::Preview, || Ok(())).unwrap();

        std::thread::scope(|scope| {
            let modes_ref = &modes;
            let seen = reconfigured_with.clone();
            let switcher = scope.spawn(move || {
                modes_ref.request(OperatingMode::Capture, || {
                    seen.store(modes_ref.in_flight(), Ordering::SeqCst);
                    Ok(())
                })
            });

            // The running operation notices the closed gate.
            let deadline = Instant::now() + Duration::from_secs(2);
            while op.is_active() {
                assert!(Instant::now() < deadline, "gate never closed");
                std::thread::sleep(Duration::from_millis(1));
            }
            assert!(matches!(
                op.ensure_active(),
                Err(ControlError::ModeChanged { expected: OperatingMode::Preview, .. })
            ));
            drop(op);

            switcher.join().unwrap().unwrap();
        });

        assert_eq!(reconfigured_with.load(Ordering::SeqCst), 0);
        assert_eq!(modes.mode(), OperatingMode::Capture);
    }

    #[test]
    fn test_single_shot_ignores_closed_gate() {
        let modes = Arc::new(controller());
        let op = modes.begin(OperatingMode::Capture, || Ok(())).unwrap();

        std::thread::scope(|scope| {
            let switcher = scope.spawn(|| modes.request(OperatingMode::Preview, || Ok(())));
            while !modes.is_transitioning() {
                std::thread::sleep(Duration::from_millis(1));
            }
            assert!(op.ensure_mode().is_ok());
            assert!(op.ensure_active().is_err());
            drop(op);
            switcher.join().unwrap().unwrap();
        });
        assert_eq!(modes.mode(), OperatingMode::Preview);
    }

    #[test]
    fn test_exclusive_does_not_stop_operations() {
        let modes = controller();
        let op = modes.begin(OperatingMode::Preview, || Ok(())).unwrap();
        let value = modes
            .exclusive(|| {
                assert!(op.is_active());
                Ok(7)
            })
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(modes.mode(), OperatingMode::Preview);
    }

    #[test]
    fn test_adjust_runs_before_registration() {
        let modes = controller();
        modes.request(OperatingMode::Capture, || Ok(())).unwrap();

        let op = modes
            .begin_with(
                OperatingMode::Capture,
                || panic!("already in capture"),
                || {
                    assert_eq!(modes.in_flight(), 0);
                    Ok(())
                },
            )
            .unwrap();
        assert_eq!(modes.in_flight(), 1);
        drop(op);

        let err = modes
            .begin_with(
                OperatingMode::Capture,
                || Ok(()),
                || Err(ControlError::InvalidParameter("gain".to_string())),
            )
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidParameter(_)));
        assert_eq!(modes.in_flight(), 0);
        assert_eq!(modes.mode(), OperatingMode::Capture);
    }

    #[test]
    fn test_adjust_does_not_wait_on_pending_transition() {
        let modes = ModeController::new(Duration::from_millis(300));
        modes.request(OperatingMode::Capture, || Ok(())).unwrap();

        let modes_ref = &modes;
        std::thread::scope(|scope| {
            let mut switcher = None;
            let started = Instant::now();
            let op = modes
                .begin_with(
                    OperatingMode::Capture,
                    || Ok(()),
                    || {
                        // A stream client asks for preview while the capture adjusts.
                        switcher = Some(scope.spawn(move || {
                            modes_ref.request(OperatingMode::Preview, || Ok(()))
                        }));
                        std::thread::sleep(Duration::from_millis(20));
                        assert!(!modes_ref.is_transitioning());
                        Ok(())
                    },
                )
                .unwrap();
            assert!(started.elapsed() < Duration::from_millis(300));
            assert!(op.ensure_mode().is_ok());
            drop(op);

            let switched = switcher.take().unwrap().join().unwrap().unwrap();
            assert_eq!(switched, Transition::Switched { from: OperatingMode::Capture });
        });
        assert_eq!(modes.mode(), OperatingMode::Preview);
    }

    #[test]
    fn test_slot_timeout_is_busy() {
        let modes = ModeController::new(Duration::from_millis(20));
        let _op = modes.begin(OperatingMode::Preview, || Ok(())).unwrap();

        std::thread::scope(|scope| {
            // Blocks draining `_op`, holding the slot.
            scope.spawn(|| modes.request(OperatingMode::Capture, || Ok(())));
            while !modes.is_transitioning() {
                std::thread::sleep(Duration::from_millis(1));
            }
            let err = modes.request(OperatingMode::Preview, || Ok(())).unwrap_err();
            assert!(matches!(err, ControlError::TransitionBusy(20)));
            assert_eq!(err.kind(), ErrorKind::DeviceBusy);
            drop(_op);
        });
    }
}
