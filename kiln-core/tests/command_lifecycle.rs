//! Integration tests for the build and push command lifecycles.
//!
//! These tests verify:
//! - The started/completed/done lifecycle and run report
//! - Engine dispatch bootstraps only the clients it needs
//! - Runtime-load fan-out skips the runtime that built the image
//! - Unsupported engines and missing daemon connection info exit with
//!   their distinguished codes before any client is opened
//! - The registry push step and the standalone push command
//!
//! Tests use mock clients and a panicking exit hook for portability.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;

use kiln_core::engine::{
    BuildParams, ClientProvider, DaemonApi, GenericParams, ImageBuilder, ImageLoader,
    DOCKER_ENGINE, DOCKER_RUNTIME, PODMAN_RUNTIME, SIMPLE_ENGINE,
};
use kiln_core::error::Result;
use kiln_core::registry::{RegistryApi, RegistryCredentials};
use kiln_core::{
    build, push, ExecutionContext, ExitCause, ExitCode, KilnError, OutMessage, Output,
    OutputFormat,
};

#[derive(Default)]
struct MockDaemon {
    builds: Mutex<Vec<String>>,
    loads: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl ImageBuilder for MockDaemon {
    async fn build(&self, params: &BuildParams, _out: &Output) -> Result<PathBuf> {
        self.builds.lock().unwrap().push(params.image_name.clone());
        Ok(PathBuf::from(&params.image_archive_file))
    }
}

#[async_trait]
impl ImageLoader for MockDaemon {
    async fn load_image(&self, archive: &Path, _out: &Output) -> Result<()> {
        self.loads.lock().unwrap().push(archive.to_path_buf());
        Ok(())
    }
}

#[derive(Default)]
struct MockBuilder {
    builds: Mutex<Vec<String>>,
}

#[async_trait]
impl ImageBuilder for MockBuilder {
    async fn build(&self, params: &BuildParams, _out: &Output) -> Result<PathBuf> {
        self.builds.lock().unwrap().push(params.image_name.clone());
        Ok(PathBuf::from(&params.image_archive_file))
    }
}

#[derive(Default)]
struct MockRegistry {
    auth_calls: Mutex<Vec<(bool, String)>>,
    pushes: Mutex<Vec<(PathBuf, String)>>,
    saves: Mutex<Vec<(String, PathBuf)>>,
}

#[async_trait]
impl RegistryApi for MockRegistry {
    async fn configure_auth(
        &self,
        use_stored_creds: bool,
        account: &str,
        secret: &str,
    ) -> Result<RegistryCredentials> {
        self.auth_calls.lock().unwrap().push((use_stored_creds, account.to_string()));
        if account.is_empty() {
            Ok(RegistryCredentials::Anonymous)
        } else {
            Ok(RegistryCredentials::Basic {
                username: account.to_string(),
                password: secret.to_string(),
            })
        }
    }

    async fn push_from_archive(
        &self,
        archive_path: &Path,
        image_name: &str,
        _creds: &RegistryCredentials,
    ) -> Result<()> {
        self.pushes.lock().unwrap().push((archive_path.to_path_buf(), image_name.to_string()));
        Ok(())
    }

    async fn save_to_archive(
        &self,
        image_ref: &str,
        dest: &Path,
        _creds: &RegistryCredentials,
    ) -> Result<()> {
        self.saves.lock().unwrap().push((image_ref.to_string(), dest.to_path_buf()));
        Ok(())
    }
}

struct MockProvider {
    docker: Arc<MockDaemon>,
    podman: Arc<MockDaemon>,
    docker_connects: bool,
    docker_inits: AtomicUsize,
    podman_inits: AtomicUsize,
    simple: Arc<MockBuilder>,
    registry: Arc<MockRegistry>,
}

impl MockProvider {
    fn connected() -> Self {
        Self {
            docker: Arc::new(MockDaemon::default()),
            podman: Arc::new(MockDaemon::default()),
            docker_connects: true,
            docker_inits: AtomicUsize::new(0),
            podman_inits: AtomicUsize::new(0),
            simple: Arc::new(MockBuilder::default()),
            registry: Arc::new(MockRegistry::default()),
        }
    }

    fn without_docker() -> Self {
        Self { docker_connects: false, ..Self::connected() }
    }
}

#[async_trait]
impl ClientProvider for MockProvider {
    async fn docker_daemon(&self) -> Result<Arc<dyn DaemonApi>> {
        self.docker_inits.fetch_add(1, Ordering::SeqCst);
        if !self.docker_connects {
            return Err(KilnError::NoDaemonConnectInfo { runtime: "docker".to_string() });
        }
        Ok(self.docker.clone())
    }

    async fn podman_daemon(&self) -> Result<Arc<dyn DaemonApi>> {
        self.podman_inits.fetch_add(1, Ordering::SeqCst);
        Ok(self.podman.clone())
    }

    fn remote_builder(&self, _engine: &str, _params: &BuildParams) -> Result<Arc<dyn ImageBuilder>> {
        Ok(self.simple.clone())
    }

    fn simple_builder(&self) -> Arc<dyn ImageBuilder> {
        self.simple.clone()
    }

    fn registry(&self) -> Arc<dyn RegistryApi> {
        self.registry.clone()
    }
}

type CapturedExit = Arc<Mutex<Option<i32>>>;

fn hooked_context(
    format: OutputFormat,
    channels: HashMap<String, mpsc::UnboundedSender<OutMessage>>,
) -> (ExecutionContext, CapturedExit) {
    let captured: CapturedExit = Arc::new(Mutex::new(None));
    let sink = captured.clone();
    let xc = ExecutionContext::with_exit_hook(
        "build",
        false,
        format,
        channels,
        Box::new(move |code| {
            *sink.lock().unwrap() = Some(code);
            panic!("terminated with {}", code);
        }),
    );
    (xc, captured)
}

fn subscription_channel() -> (
    HashMap<String, mpsc::UnboundedSender<OutMessage>>,
    mpsc::UnboundedReceiver<OutMessage>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut channels = HashMap::new();
    channels.insert("events".to_string(), tx);
    (channels, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<OutMessage>) -> Vec<OutMessage> {
    let mut messages = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        messages.push(msg);
    }
    messages
}

fn states(messages: &[OutMessage]) -> Vec<&str> {
    messages.iter().filter_map(|m| m.get("state").map(String::as_str)).collect()
}

fn infos(messages: &[OutMessage]) -> Vec<&str> {
    messages.iter().filter_map(|m| m.get("info").map(String::as_str)).collect()
}

#[tokio::test]
async fn test_simple_engine_runs_to_done_without_daemon_clients() {
    let dir = TempDir::new().unwrap();
    let report_path = dir.path().join("build.report.json");
    let (channels, mut rx) = subscription_channel();
    let (xc, captured) = hooked_context(OutputFormat::Subscription, channels);
    let provider = MockProvider::connected();

    let gparams = GenericParams {
        report_location: report_path.display().to_string(),
        ..Default::default()
    };
    let cparams = BuildParams {
        engine: SIMPLE_ENGINE.to_string(),
        image_archive_file: dir.path().join("img.tar").display().to_string(),
        ..Default::default()
    };

    build::run(&xc, &gparams, &cparams, &provider).await;
    xc.out().shutdown().await;

    let messages = drain(&mut rx);
    assert_eq!(states(&messages), vec!["started", "completed", "done"]);
    assert!(infos(&messages).contains(&"runtime.load.image.none"));

    assert_eq!(provider.docker_inits.load(Ordering::SeqCst), 0);
    assert_eq!(provider.podman_inits.load(Ordering::SeqCst), 0);
    assert_eq!(*provider.simple.builds.lock().unwrap(), vec![cparams.image_name.clone()]);
    assert!(provider.registry.pushes.lock().unwrap().is_empty());
    assert_eq!(*captured.lock().unwrap(), None);

    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(report["command"], "build");
    assert_eq!(report["state"], "done");
}

#[tokio::test]
async fn test_load_into_building_runtime_is_skipped() {
    let dir = TempDir::new().unwrap();
    let (channels, mut rx) = subscription_channel();
    let (xc, _) = hooked_context(OutputFormat::Subscription, channels);
    let provider = MockProvider::connected();

    let cparams = BuildParams {
        engine: DOCKER_ENGINE.to_string(),
        load_runtimes: vec![DOCKER_RUNTIME.to_string()],
        image_archive_file: dir.path().join("img.tar").display().to_string(),
        ..Default::default()
    };

    build::run(&xc, &GenericParams::default(), &cparams, &provider).await;
    xc.out().shutdown().await;

    let messages = drain(&mut rx);
    assert!(infos(&messages).contains(&"same.image.engine.runtime"));

    assert_eq!(provider.docker_inits.load(Ordering::SeqCst), 1);
    assert_eq!(provider.docker.builds.lock().unwrap().len(), 1);
    assert!(provider.docker.loads.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_load_into_other_runtime_runs() {
    let dir = TempDir::new().unwrap();
    let archive = dir.path().join("img.tar");
    let (xc, _) = hooked_context(OutputFormat::Text, HashMap::new());
    let provider = MockProvider::connected();

    let cparams = BuildParams {
        engine: DOCKER_ENGINE.to_string(),
        load_runtimes: vec![PODMAN_RUNTIME.to_string()],
        image_archive_file: archive.display().to_string(),
        ..Default::default()
    };

    build::run(&xc, &GenericParams::default(), &cparams, &provider).await;

    assert_eq!(provider.podman_inits.load(Ordering::SeqCst), 1);
    assert_eq!(*provider.podman.loads.lock().unwrap(), vec![archive]);
    assert!(provider.docker.loads.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unsupported_engine_exits_without_client_init() {
    let (xc, captured) = hooked_context(OutputFormat::Text, HashMap::new());
    let provider = Arc::new(MockProvider::connected());

    let task_provider = provider.clone();
    let handle = tokio::spawn(async move {
        let cparams = BuildParams { engine: "bazel".to_string(), ..Default::default() };
        build::run(&xc, &GenericParams::default(), &cparams, task_provider.as_ref()).await;
    });

    let err = handle.await.unwrap_err();
    assert!(err.is_panic());

    assert_eq!(
        *captured.lock().unwrap(),
        Some(ExitCode::common(ExitCause::UnsupportedEngine).value())
    );
    assert_eq!(provider.docker_inits.load(Ordering::SeqCst), 0);
    assert_eq!(provider.podman_inits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_missing_docker_connect_info_remediation_and_exit_code() {
    let (channels, mut rx) = subscription_channel();
    let (xc, captured) = hooked_context(OutputFormat::Subscription, channels);
    let provider = Arc::new(MockProvider::without_docker());

    let task_provider = provider.clone();
    let handle = tokio::spawn(async move {
        let gparams =
            GenericParams { in_container: true, is_kiln_image: true, ..Default::default() };
        let cparams = BuildParams { engine: DOCKER_ENGINE.to_string(), ..Default::default() };
        build::run(&xc, &gparams, &cparams, task_provider.as_ref()).await;
    });

    let err = handle.await.unwrap_err();
    assert!(err.is_panic());

    assert_eq!(
        *captured.lock().unwrap(),
        Some(ExitCode::common(ExitCause::NoDaemonConnectInfo).value())
    );
    assert!(provider.docker.builds.lock().unwrap().is_empty());

    // The context (and its sink) dropped with the task, so the stream ends.
    let mut messages = Vec::new();
    while let Some(msg) = rx.recv().await {
        messages.push(msg);
    }

    let remediation = messages
        .iter()
        .find(|m| m.get("info").map(String::as_str) == Some("docker.connect.error"))
        .expect("remediation event was not forwarded");
    assert!(remediation
        .get("message")
        .is_some_and(|m| m.contains("pass the Docker connect parameters to the kiln container")));
    assert!(states(&messages).contains(&"exited"));
}

#[tokio::test]
async fn test_duplicate_load_targets_collapse() {
    let dir = TempDir::new().unwrap();
    let archive = dir.path().join("img.tar");
    let (xc, _) = hooked_context(OutputFormat::Text, HashMap::new());
    let provider = MockProvider::connected();

    let cparams = BuildParams {
        engine: SIMPLE_ENGINE.to_string(),
        load_runtimes: vec![PODMAN_RUNTIME.to_string(), PODMAN_RUNTIME.to_string()],
        image_archive_file: archive.display().to_string(),
        ..Default::default()
    };

    build::run(&xc, &GenericParams::default(), &cparams, &provider).await;

    assert_eq!(provider.podman_inits.load(Ordering::SeqCst), 1);
    assert_eq!(*provider.podman.loads.lock().unwrap(), vec![archive]);
}

#[tokio::test]
async fn test_registry_push_after_build() {
    let dir = TempDir::new().unwrap();
    let archive = dir.path().join("img.tar");
    let (xc, _) = hooked_context(OutputFormat::Text, HashMap::new());
    let provider = MockProvider::connected();

    let cparams = BuildParams {
        engine: SIMPLE_ENGINE.to_string(),
        image_archive_file: archive.display().to_string(),
        registry_push: true,
        creds_account: "bob".to_string(),
        creds_secret: "builder".to_string(),
        ..Default::default()
    };

    build::run(&xc, &GenericParams::default(), &cparams, &provider).await;

    assert_eq!(*provider.registry.auth_calls.lock().unwrap(), vec![(false, "bob".to_string())]);
    assert_eq!(
        *provider.registry.pushes.lock().unwrap(),
        vec![(archive, cparams.image_name.clone())]
    );
}

#[tokio::test]
async fn test_push_command_retags_through_temp_archive() {
    let dir = TempDir::new().unwrap();
    let report_path = dir.path().join("push.report.json");
    let (xc, _) = hooked_context(OutputFormat::Text, HashMap::new());
    let provider = MockProvider::connected();

    let gparams = GenericParams {
        report_location: report_path.display().to_string(),
        ..Default::default()
    };
    let cparams = push::PushParams {
        target_ref: "acme/widget:1.0".to_string(),
        as_tag: "acme/widget:2.0".to_string(),
        ..Default::default()
    };

    push::run(&xc, &gparams, &cparams, &provider).await;

    let saves = provider.registry.saves.lock().unwrap();
    assert_eq!(saves.len(), 1);
    assert_eq!(saves[0].0, "acme/widget:1.0");

    let pushes = provider.registry.pushes.lock().unwrap();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].0, saves[0].1);
    assert_eq!(pushes[0].1, "acme/widget:2.0");

    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(report["command"], "push");
    assert_eq!(report["state"], "done");
}
