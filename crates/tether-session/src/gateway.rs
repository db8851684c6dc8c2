//! Fire-and-forget vehicle commands against the live session.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info};

use tether_fc::{RemoteError, RemoteErrorCode, RemoteSystem};
use tether_mission::{encode_plan, PlanConfig, PlanError};
use tether_proto::GeoPoint;

use crate::session::{LiveLink, SessionHandle};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum GatewayError {
    #[error("not connected")]
    NotConnected,
    #[error("no waypoints selected")]
    EmptyPlan,
    #[error("geofence needs at least one point")]
    EmptyPolygon,
    #[error(transparent)]
    Plan(#[from] PlanError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Arm,
    Takeoff,
    Kill,
    Land,
    ReturnToLaunch,
    UploadMission,
    StartMission,
    PauseMission,
    ClearMission,
    TakePhoto,
    UploadGeofence,
    ClearGeofence,
}

impl Action {
    pub fn label(self) -> &'static str {
        match self {
            Action::Arm => "Arm",
            Action::Takeoff => "Takeoff",
            Action::Kill => "Kill",
            Action::Land => "Land",
            Action::ReturnToLaunch => "Return",
            Action::UploadMission => "Mission Upload",
            Action::StartMission => "Mission Start",
            Action::PauseMission => "Mission Pause",
            Action::ClearMission => "Mission Clear",
            Action::TakePhoto => "Photo",
            Action::UploadGeofence => "Geofence Upload",
            Action::ClearGeofence => "Geofence Clear",
        }
    }
}

/// Completion of one remote request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub action: Action,
    pub error: Option<RemoteErrorCode>,
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.error {
            None => write!(f, "{} Done", self.action.label()),
            Some(code) => write!(f, "{} Error: {}", self.action.label(), code),
        }
    }
}

/// Holds the last outcome only. A new outcome replaces an unread one.
#[derive(Debug, Default)]
pub struct OutcomeMailbox {
    slot: Mutex<Option<Outcome>>,
}

impl OutcomeMailbox {
    fn slot(&self) -> MutexGuard<'_, Option<Outcome>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, action: Action, result: Result<(), RemoteError>) -> bool {
        let outcome = Outcome { action, error: result.err().map(|e| e.code) };
        info!("gateway: {}", outcome);
        *self.slot() = Some(outcome);
        outcome.is_ok()
    }

    /// Read and clear.
    pub fn take(&self) -> Option<Outcome> {
        self.slot().take()
    }

    pub fn peek(&self) -> Option<Outcome> {
        *self.slot()
    }
}

/// Mailbox writer bound to the session a request was issued on. Completions
/// that arrive after that session ended are logged and dropped.
struct Recorder {
    session: u64,
    live: watch::Receiver<Option<LiveLink>>,
    mailbox: Arc<OutcomeMailbox>,
}

impl Recorder {
    fn record(&self, action: Action, result: Result<(), RemoteError>) -> bool {
        let current = self.live.borrow().as_ref().map(|live| live.session);
        if current != Some(self.session) {
            debug!("gateway: {} from ended session {} dropped ({:?})", action.label(), self.session, result);
            return false;
        }
        self.mailbox.record(action, result)
    }
}

pub struct CommandGateway {
    live: watch::Receiver<Option<LiveLink>>,
    mailbox: Arc<OutcomeMailbox>,
    plan: PlanConfig,
}

impl CommandGateway {
    pub fn new(session: &SessionHandle, plan: PlanConfig) -> Self {
        Self { live: session.watch_live(), mailbox: Arc::new(OutcomeMailbox::default()), plan }
    }

    pub fn mailbox(&self) -> Arc<OutcomeMailbox> {
        self.mailbox.clone()
    }

    pub fn take_outcome(&self) -> Option<Outcome> {
        self.mailbox.take()
    }

    fn remote(&self) -> Result<(Arc<dyn RemoteSystem>, Recorder), GatewayError> {
        let guard = self.live.borrow();
        let live = guard.as_ref().ok_or(GatewayError::NotConnected)?;
        let recorder = Recorder { session: live.session, live: self.live.clone(), mailbox: self.mailbox.clone() };
        Ok((live.remote.clone(), recorder))
    }

    /// Run `op` on its own task and drop the result into the mailbox.
    fn submit<F, Fut>(&self, action: Action, op: F) -> Result<(), GatewayError>
    where
        F: FnOnce(Arc<dyn RemoteSystem>) -> Fut,
        Fut: Future<Output = Result<(), RemoteError>> + Send + 'static,
    {
        let (remote, recorder) = self.remote()?;
        let pending = op(remote);
        debug!("gateway: {} submitted", action.label());
        tokio::spawn(async move {
            recorder.record(action, pending.await);
        });
        Ok(())
    }

    pub fn arm(&self) -> Result<(), GatewayError> {
        self.submit(Action::Arm, |r| async move { r.arm().await })
    }

    /// Arm, then take off. Each step records its outcome; a failed arm stops the chain.
    pub fn takeoff(&self, alt_m: f32) -> Result<(), GatewayError> {
        let (remote, recorder) = self.remote()?;
        tokio::spawn(async move {
            if recorder.record(Action::Arm, remote.arm().await) {
                recorder.record(Action::Takeoff, remote.takeoff(alt_m).await);
            }
        });
        Ok(())
    }

    pub fn kill(&self) -> Result<(), GatewayError> {
        self.submit(Action::Kill, |r| async move { r.kill().await })
    }

    pub fn land(&self) -> Result<(), GatewayError> {
        self.submit(Action::Land, |r| async move { r.land().await })
    }

    pub fn return_to_launch(&self) -> Result<(), GatewayError> {
        self.submit(Action::ReturnToLaunch, |r| async move { r.return_to_launch().await })
    }

    /// Encode `points` (flight order, origin first if any) and upload them.
    pub fn upload_mission(&self, points: &[GeoPoint]) -> Result<(), GatewayError> {
        self.remote()?;
        if points.is_empty() {
            return Err(GatewayError::EmptyPlan);
        }
        let items = encode_plan(points, &self.plan)?;
        debug!("gateway: mission of {} items for {} points", items.len(), points.len());
        self.submit(Action::UploadMission, move |r| async move { r.upload_mission(items).await })
    }

    /// Arm, then start the uploaded mission.
    pub fn start_mission(&self) -> Result<(), GatewayError> {
        let (remote, recorder) = self.remote()?;
        tokio::spawn(async move {
            if recorder.record(Action::Arm, remote.arm().await) {
                recorder.record(Action::StartMission, remote.start_mission().await);
            }
        });
        Ok(())
    }

    pub fn pause_mission(&self) -> Result<(), GatewayError> {
        self.submit(Action::PauseMission, |r| async move { r.pause_mission().await })
    }

    pub fn clear_mission(&self) -> Result<(), GatewayError> {
        self.submit(Action::ClearMission, |r| async move { r.clear_mission().await })
    }

    pub fn capture_photo(&self) -> Result<(), GatewayError> {
        self.submit(Action::TakePhoto, |r| async move { r.take_photo().await })
    }

    pub fn upload_geofence(&self, polygon: &[GeoPoint]) -> Result<(), GatewayError> {
        self.remote()?;
        if polygon.is_empty() {
            return Err(GatewayError::EmptyPolygon);
        }
        let polygon = polygon.to_vec();
        self.submit(Action::UploadGeofence, move |r| async move { r.upload_geofence(polygon).await })
    }

    pub fn clear_geofence(&self) -> Result<(), GatewayError> {
        self.submit(Action::ClearGeofence, |r| async move { r.clear_geofence().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_text() {
        let done = Outcome { action: Action::Land, error: None };
        assert_eq!(done.to_string(), "Land Done");
        let failed = Outcome { action: Action::UploadMission, error: Some(RemoteErrorCode::Timeout) };
        assert_eq!(failed.to_string(), "Mission Upload Error: TIMEOUT");
    }

    #[test]
    fn mailbox_keeps_only_the_last_outcome() {
        let mailbox = OutcomeMailbox::default();
        assert_eq!(mailbox.take(), None);

        assert!(mailbox.record(Action::Arm, Ok(())));
        assert!(!mailbox.record(Action::Land, Err(RemoteErrorCode::Denied.into())));

        assert_eq!(mailbox.peek(), Some(Outcome { action: Action::Land, error: Some(RemoteErrorCode::Denied) }));
        assert_eq!(mailbox.take().map(|o| o.to_string()).as_deref(), Some("Land Error: COMMAND_DENIED"));
        assert_eq!(mailbox.take(), None);
    }
}
