//! The session supervisor: one task owning one camera's live connection.
//!
//! State machine:
//!
//! ```text
//! Disconnected -> Validating -> Connecting -> Connected
//!                     |             |            |  \
//!                     v             v            |   v
//!                   Failed    (backoff retry)    |  Reconciling -> Connected
//!                                                |       |
//!                                                v       v
//!                                          Disconnected (ended)
//! ```
//!
//! Two signals can end a session: the authoritative `inference_stopped` text
//! message (trusted immediately), and frame silence past [`FRAME_TIMEOUT`]
//! confirmed inactive by a status check.  Silence alone never ends a
//! session, and at most one status check runs per silence window.
//!
//! Re-entrancy: the task applies one transition at a time, and an in-flight
//! status check is dropped the moment a frame or close event supersedes it,
//! so stale responses cannot override newer state.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::control::{ControlPlane, InferenceStatus};
use crate::sink::{DisplayFrame, FrameSink};
use crate::store::SessionStore;
use crate::transport::{SocketMessage, Transport};
use crate::{
    ActiveCamera, ConnectionState, Result, SessionError, SessionStatus, FRAME_TIMEOUT,
    RECONNECT_BASE, RECONNECT_MAX,
};

/// Authoritative server signal that inference has ended.
pub const INFERENCE_STOPPED: &str = "inference_stopped";

/// Capped exponential reconnect delay: 3s, 6s, 12s, 24s, 30s, 30s, ...
/// A successful connection resets the sequence to its base.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    delay: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            delay: base,
        }
    }

    /// Delay to wait before the next attempt; doubles for the one after.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay;
        self.delay = (delay * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.delay = self.base;
    }
}

enum Command {
    Start(ActiveCamera),
    Shutdown,
}

/// Why a supervision run ended.
enum Exit {
    /// Inference ended (authoritative signal or confirmed by status check).
    Ended,
    /// Validation or connection failed terminally for this attempt.
    Failed,
    /// The user switched cameras; tear down and start the new one.
    Restart(ActiveCamera),
    Shutdown,
}

enum PumpEnd {
    Closed,
    Ended,
    Halt(Exit),
}

enum Reconciled {
    StillActive,
    Ended,
    Closed,
    Halt(Exit),
}

fn exit_for(cmd: Option<Command>) -> Exit {
    match cmd {
        Some(Command::Start(camera)) => Exit::Restart(camera),
        Some(Command::Shutdown) | None => Exit::Shutdown,
    }
}

/// Handle to a spawned supervisor.  Observers clone the watch receivers;
/// dropping the handle does not stop the task, `shutdown` does.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionStatus>,
    frames: watch::Receiver<Option<Arc<DisplayFrame>>>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Begin (or switch to) supervising `camera`.  A record missing its id
    /// or source URI is a no-op, not an error.
    pub fn start(&self, camera: ActiveCamera) -> Result<()> {
        self.commands
            .send(Command::Start(camera))
            .map_err(|_| SessionError::SupervisorGone)
    }

    /// Explicit user-initiated teardown: cancels pending retries, closes the
    /// socket, releases the current frame.  Terminal for this supervisor.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn frames(&self) -> watch::Receiver<Option<Arc<DisplayFrame>>> {
        self.frames.clone()
    }

    /// Wait for the supervisor task to finish after `shutdown`.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

pub struct SessionSupervisor {
    transport: Arc<dyn Transport>,
    control: Arc<dyn ControlPlane>,
    store: Arc<dyn SessionStore>,
    status_tx: watch::Sender<SessionStatus>,
    sink: FrameSink,
}

impl SessionSupervisor {
    pub fn spawn(
        transport: Arc<dyn Transport>,
        control: Arc<dyn ControlPlane>,
        store: Arc<dyn SessionStore>,
    ) -> SessionHandle {
        let (status_tx, status_rx) = watch::channel(SessionStatus::idle());
        let (sink, frames) = FrameSink::new();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            transport,
            control,
            store,
            status_tx,
            sink,
        };
        let task = tokio::spawn(supervisor.run(cmd_rx));
        SessionHandle {
            commands: cmd_tx,
            status: status_rx,
            frames,
            task,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut pending: Option<ActiveCamera> = None;
        loop {
            let camera = match pending.take() {
                Some(camera) => camera,
                None => match commands.recv().await {
                    Some(Command::Start(camera)) => camera,
                    Some(Command::Shutdown) | None => break,
                },
            };
            if !camera.is_supervisable() {
                debug!("camera record incomplete; nothing to supervise");
                continue;
            }
            match self.supervise(camera, &mut commands).await {
                Exit::Restart(next) => {
                    self.sink.clear();
                    pending = Some(next);
                }
                Exit::Ended | Exit::Failed => {
                    self.sink.clear();
                }
                Exit::Shutdown => break,
            }
        }
        self.sink.clear();
        self.publish(ConnectionState::Disconnected, None);
    }

    /// One full supervision run for one camera: validate, then connect and
    /// pump frames until the session ends or is torn down.
    async fn supervise(
        &mut self,
        camera: ActiveCamera,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Exit {
        info!(
            "supervising camera {} ({})",
            camera.camera_id, camera.source_uri
        );

        if camera.is_local() {
            debug!("local capture source; skipping stream validation");
        } else {
            self.publish(ConnectionState::Validating, None);
            let control = Arc::clone(&self.control);
            let source_uri = camera.source_uri.clone();
            let check = async move { control.check_stream(&source_uri).await };
            tokio::pin!(check);
            let validated = tokio::select! {
                result = &mut check => result,
                cmd = commands.recv() => return exit_for(cmd),
            };
            if let Err(err) = validated {
                let reason = err.to_string();
                warn!("stream validation failed: {reason}");
                self.publish(ConnectionState::Failed, Some(reason));
                return Exit::Failed;
            }
        }

        let mut backoff = Backoff::new(RECONNECT_BASE, RECONNECT_MAX);
        loop {
            self.publish(ConnectionState::Connecting, None);
            let transport = Arc::clone(&self.transport);
            let camera_id = camera.camera_id.clone();
            let connect = async move { transport.connect(&camera_id).await };
            tokio::pin!(connect);
            let connected = tokio::select! {
                result = &mut connect => result,
                cmd = commands.recv() => return exit_for(cmd),
            };

            let mut stream = match connected {
                Ok(stream) => stream,
                Err(err) => {
                    let delay = backoff.next_delay();
                    warn!("socket connect failed ({err}); retrying in {}s", delay.as_secs());
                    self.publish(
                        ConnectionState::Disconnected,
                        Some(format!("reconnecting in {}s", delay.as_secs())),
                    );
                    tokio::select! {
                        _ = sleep(delay) => continue,
                        cmd = commands.recv() => return exit_for(cmd),
                    }
                }
            };

            backoff.reset();
            info!("socket connected for camera {}", camera.camera_id);
            self.publish(ConnectionState::Connected, None);

            match self.pump(&camera, &mut stream, commands).await {
                PumpEnd::Closed => {
                    let delay = backoff.next_delay();
                    warn!("socket closed unexpectedly; retrying in {}s", delay.as_secs());
                    self.publish(
                        ConnectionState::Disconnected,
                        Some(format!("reconnecting in {}s", delay.as_secs())),
                    );
                    tokio::select! {
                        _ = sleep(delay) => continue,
                        cmd = commands.recv() => return exit_for(cmd),
                    }
                }
                PumpEnd::Ended => {
                    if let Err(err) = self.store.clear_inference_started(&camera.camera_id) {
                        warn!("failed to clear inference flag: {err}");
                    }
                    self.publish(
                        ConnectionState::Disconnected,
                        Some("inference ended".to_string()),
                    );
                    return Exit::Ended;
                }
                PumpEnd::Halt(exit) => return exit,
            }
        }
    }

    /// Connected state: forward frames to the sink, watch the liveness
    /// window, and handle server signals.  The liveness clock resets only
    /// on a new frame, a successful reconnection, or a still-active
    /// reconciliation outcome.
    async fn pump(
        &mut self,
        camera: &ActiveCamera,
        stream: &mut ReceiverStream<SocketMessage>,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> PumpEnd {
        let mut deadline = Instant::now() + FRAME_TIMEOUT;
        loop {
            tokio::select! {
                message = stream.next() => match message {
                    Some(SocketMessage::Frame(payload)) => {
                        self.sink.install(payload);
                        deadline = Instant::now() + FRAME_TIMEOUT;
                    }
                    Some(SocketMessage::Text(text)) => {
                        if text == INFERENCE_STOPPED {
                            info!(
                                "server reported inference stopped for camera {}",
                                camera.camera_id
                            );
                            return PumpEnd::Ended;
                        }
                        debug!("ignoring server signal: {text}");
                    }
                    None => return PumpEnd::Closed,
                },
                _ = sleep_until(deadline) => {
                    debug!(
                        "no frames for {}ms; reconciling with inference status",
                        FRAME_TIMEOUT.as_millis()
                    );
                    self.publish(ConnectionState::Reconciling, None);
                    match self.reconcile(camera, stream, commands).await {
                        Reconciled::StillActive => {
                            deadline = Instant::now() + FRAME_TIMEOUT;
                            self.publish(ConnectionState::Connected, None);
                        }
                        Reconciled::Ended => return PumpEnd::Ended,
                        Reconciled::Closed => return PumpEnd::Closed,
                        Reconciled::Halt(exit) => return PumpEnd::Halt(exit),
                    }
                }
                cmd = commands.recv() => return PumpEnd::Halt(exit_for(cmd)),
            }
        }
    }

    /// One status round-trip per silence window.  The socket stays open the
    /// whole time, and a frame arriving mid-check supersedes the check: the
    /// in-flight future is dropped, so its late response cannot override
    /// newer state.
    async fn reconcile(
        &mut self,
        camera: &ActiveCamera,
        stream: &mut ReceiverStream<SocketMessage>,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Reconciled {
        let control = Arc::clone(&self.control);
        let camera_id = camera.camera_id.clone();
        let probe = async move { control.inference_status(&camera_id).await };
        tokio::pin!(probe);
        loop {
            tokio::select! {
                outcome = &mut probe => {
                    return match outcome {
                        InferenceStatus::Inactive => {
                            info!(
                                "inference inactive for camera {}; ending session",
                                camera.camera_id
                            );
                            Reconciled::Ended
                        }
                        InferenceStatus::Active => {
                            debug!("inference still active; frames are just slow");
                            Reconciled::StillActive
                        }
                        InferenceStatus::Unknown(err) => {
                            warn!("inference status check inconclusive ({err}); keeping session alive");
                            Reconciled::StillActive
                        }
                    };
                }
                message = stream.next() => match message {
                    Some(SocketMessage::Frame(payload)) => {
                        self.sink.install(payload);
                        return Reconciled::StillActive;
                    }
                    Some(SocketMessage::Text(text)) => {
                        if text == INFERENCE_STOPPED {
                            return Reconciled::Ended;
                        }
                        debug!("ignoring server signal: {text}");
                    }
                    None => return Reconciled::Closed,
                },
                cmd = commands.recv() => return Reconciled::Halt(exit_for(cmd)),
            }
        }
    }

    fn publish(&self, state: ConnectionState, error: Option<String>) {
        debug!("session state -> {state:?}");
        let _ = self.status_tx.send(SessionStatus {
            state,
            connected: state.is_connected(),
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(RECONNECT_BASE, RECONNECT_MAX);
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![3000, 6000, 12000, 24000, 30000, 30000]);
    }

    #[test]
    fn backoff_resets_to_base_on_success() {
        let mut backoff = Backoff::new(RECONNECT_BASE, RECONNECT_MAX);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), RECONNECT_BASE);
    }
}
