use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use notify::Config;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::ControllerError;

/// Why a restart cycle was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum RestartReason {
    #[display("startup")]
    Startup,
    #[display("kubelet socket created")]
    KubeletRestarted,
    #[display("SIGHUP")]
    Hangup,
}

/// Input of the controller loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    Restart(RestartReason),
    /// Stop everything and leave the loop, carries the signal name
    Shutdown(&'static str),
}

/// A create event for the kubelet socket means the kubelet restarted and
/// forgot every registration.
pub fn is_kubelet_restart(event: &Event, kubelet_socket: &Path) -> bool {
    matches!(event.kind, EventKind::Create(_)) && event.paths.iter().any(|p| p == kubelet_socket)
}

/// Watch the plugin directory for the kubelet socket being recreated.
pub fn watch_plugin_dir(
    plugin_dir: &Path,
    kubelet_socket: PathBuf,
    tx: mpsc::Sender<ControlEvent>,
) -> Result<RecommendedWatcher, Report<ControllerError>> {
    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                debug!("Filesystem event: {:?}", event);
                if is_kubelet_restart(&event, &kubelet_socket) {
                    info!("inotify: {} created, restarting", kubelet_socket.display());
                    // runs on the watcher thread, outside the runtime
                    let _ = tx.blocking_send(ControlEvent::Restart(RestartReason::KubeletRestarted));
                }
            }
            Err(e) => warn!("inotify: {e}"),
        },
        Config::default(),
    )
    .change_context(ControllerError::Watcher {
        path: plugin_dir.to_path_buf(),
    })?;

    watcher
        .watch(plugin_dir, RecursiveMode::NonRecursive)
        .change_context(ControllerError::Watcher {
            path: plugin_dir.to_path_buf(),
        })?;

    Ok(watcher)
}

/// Forward SIGHUP as a restart and SIGINT, SIGTERM or SIGQUIT as a shutdown.
pub fn spawn_signal_listener(
    tx: mpsc::Sender<ControlEvent>,
) -> Result<JoinHandle<()>, Report<ControllerError>> {
    let mut hangup = signal(SignalKind::hangup()).change_context(ControllerError::Signal)?;
    let mut interrupt = signal(SignalKind::interrupt()).change_context(ControllerError::Signal)?;
    let mut terminate = signal(SignalKind::terminate()).change_context(ControllerError::Signal)?;
    let mut quit = signal(SignalKind::quit()).change_context(ControllerError::Signal)?;

    Ok(tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = hangup.recv() => {
                    info!("Received SIGHUP, restarting.");
                    ControlEvent::Restart(RestartReason::Hangup)
                }
                _ = interrupt.recv() => ControlEvent::Shutdown("SIGINT"),
                _ = terminate.recv() => ControlEvent::Shutdown("SIGTERM"),
                _ = quit.recv() => ControlEvent::Shutdown("SIGQUIT"),
            };

            let is_shutdown = matches!(event, ControlEvent::Shutdown(_));
            if tx.send(event).await.is_err() || is_shutdown {
                break;
            }
        }
    }))
}

/// The filesystem watcher and signal listener feeding one channel.
pub struct EventSources {
    pub events: mpsc::Receiver<ControlEvent>,
    _watcher: RecommendedWatcher,
    signals: JoinHandle<()>,
}

impl EventSources {
    pub fn start(
        plugin_dir: &Path,
        kubelet_socket: PathBuf,
    ) -> Result<Self, Report<ControllerError>> {
        let (tx, events) = mpsc::channel(16);

        info!("Starting new FS watcher on {}", plugin_dir.display());
        let watcher = watch_plugin_dir(plugin_dir, kubelet_socket, tx.clone())?;

        info!("Starting new OS watcher");
        let signals = spawn_signal_listener(tx)?;

        Ok(Self {
            events,
            _watcher: watcher,
            signals,
        })
    }
}

impl Drop for EventSources {
    fn drop(&mut self) {
        self.signals.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;
    use std::time::Duration;

    use notify::event::CreateKind;
    use notify::event::ModifyKind;
    use notify::event::RemoveKind;
    use similar_asserts::assert_eq;
    use tempfile::TempDir;
    use test_log::test;

    use super::*;

    const KUBELET_SOCKET: &str = "/var/lib/kubelet/device-plugins/kubelet.sock";

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn kubelet_socket_creation_triggers_restart() {
        let socket = Path::new(KUBELET_SOCKET);
        assert!(is_kubelet_restart(
            &event(EventKind::Create(CreateKind::File), KUBELET_SOCKET),
            socket
        ));
        assert!(is_kubelet_restart(
            &event(EventKind::Create(CreateKind::Any), KUBELET_SOCKET),
            socket
        ));
    }

    #[test]
    fn other_events_are_ignored() {
        let socket = Path::new(KUBELET_SOCKET);
        assert!(!is_kubelet_restart(
            &event(EventKind::Remove(RemoveKind::File), KUBELET_SOCKET),
            socket
        ));
        assert!(!is_kubelet_restart(
            &event(EventKind::Modify(ModifyKind::Any), KUBELET_SOCKET),
            socket
        ));
        assert!(!is_kubelet_restart(
            &event(
                EventKind::Create(CreateKind::File),
                "/var/lib/kubelet/device-plugins/kr-vf-eth0-vf0.sock"
            ),
            socket
        ));
    }

    #[test]
    fn restart_reasons_display() {
        assert_eq!(RestartReason::Hangup.to_string(), "SIGHUP");
        assert_eq!(
            RestartReason::KubeletRestarted.to_string(),
            "kubelet socket created"
        );
    }

    #[test(tokio::test)]
    async fn watcher_requires_plugin_dir() {
        let dir = TempDir::new().expect("should create temp dir");
        let missing = dir.path().join("device-plugins");
        let (tx, _rx) = mpsc::channel(1);

        let result = watch_plugin_dir(&missing, missing.join("kubelet.sock"), tx);
        let report = result.err().expect("should fail for a missing directory");
        assert!(matches!(
            report.current_context(),
            ControllerError::Watcher { .. }
        ));
    }

    #[test(tokio::test(flavor = "multi_thread"))]
    async fn watcher_reports_kubelet_socket() {
        let dir = TempDir::new().expect("should create temp dir");
        let kubelet_socket = dir.path().join("kubelet.sock");
        let (tx, mut rx) = mpsc::channel(4);

        let _watcher = watch_plugin_dir(dir.path(), kubelet_socket.clone(), tx)
            .expect("should watch plugin dir");
        std::fs::write(dir.path().join("other.sock"), "").expect("should create other file");
        std::fs::write(&kubelet_socket, "").expect("should create kubelet socket");

        let event = tokio::time::timeout(std::time::Duration::from_secs(10), rx.recv())
            .await
            .expect("should observe the kubelet socket");
        assert_eq!(
            event,
            Some(ControlEvent::Restart(RestartReason::KubeletRestarted))
        );
    }

    fn raise(signal: &str) {
        let status = Command::new("kill")
            .args([format!("-{signal}"), std::process::id().to_string()])
            .status()
            .expect("should run kill");
        assert!(status.success(), "kill -{signal} failed");
    }

    async fn next_event(rx: &mut mpsc::Receiver<ControlEvent>) -> Option<ControlEvent> {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("should receive an event for the signal")
    }

    async fn wait_finished(listener: JoinHandle<()>) {
        tokio::time::timeout(Duration::from_secs(10), listener)
            .await
            .expect("listener should exit after a shutdown signal")
            .expect("listener should not panic");
    }

    // one test for every signal, a delivered signal reaches every listener
    #[test(tokio::test)]
    async fn signals_map_to_control_events() {
        let (tx, mut rx) = mpsc::channel(4);
        let listener = spawn_signal_listener(tx).expect("should register signal handlers");

        raise("HUP");
        assert_eq!(
            next_event(&mut rx).await,
            Some(ControlEvent::Restart(RestartReason::Hangup))
        );
        raise("TERM");
        assert_eq!(
            next_event(&mut rx).await,
            Some(ControlEvent::Shutdown("SIGTERM"))
        );
        wait_finished(listener).await;

        for (signal, name) in [("INT", "SIGINT"), ("QUIT", "SIGQUIT")] {
            let (tx, mut rx) = mpsc::channel(4);
            let listener = spawn_signal_listener(tx).expect("should register signal handlers");

            raise(signal);
            assert_eq!(next_event(&mut rx).await, Some(ControlEvent::Shutdown(name)));
            wait_finished(listener).await;
        }
    }
}
