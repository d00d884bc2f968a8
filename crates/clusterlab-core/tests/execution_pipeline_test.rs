use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use clusterlab_core::errors::{ContainerRuntimeError, SandboxError, SecurityRule};
use clusterlab_core::executors::SandboxRuntime;
use clusterlab_core::harness::{ENVELOPE_BEGIN, ENVELOPE_END};
use clusterlab_core::workspace::WORKSPACE_PREFIX;
use clusterlab_core::{CodeExecutionService, ExecutionRequest, SandboxConfig, Workspace};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

type Script = Box<dyn Fn(&Workspace) -> Result<String, SandboxError> + Send + Sync>;

/// In-memory runtime: counts launches and answers with a fixed script.
struct ScriptedRuntime {
    launches: AtomicUsize,
    workspaces: Mutex<Vec<PathBuf>>,
    timeouts: Mutex<Vec<Duration>>,
    script: Script,
}

impl ScriptedRuntime {
    fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            launches: AtomicUsize::new(0),
            workspaces: Mutex::new(Vec::new()),
            timeouts: Mutex::new(Vec::new()),
            script,
        })
    }

    fn printing(raw: String) -> Arc<Self> {
        Self::new(Box::new(move |_| Ok(raw.clone())))
    }

    fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    fn seen_workspaces(&self) -> Vec<PathBuf> {
        self.workspaces.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxRuntime for ScriptedRuntime {
    async fn ensure_image(&self) -> Result<(), ContainerRuntimeError> {
        Ok(())
    }

    async fn run(&self, workspace: &Workspace, timeout: Duration) -> Result<String, SandboxError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.workspaces.lock().unwrap().push(workspace.path().to_path_buf());
        self.timeouts.lock().unwrap().push(timeout);
        (self.script)(workspace)
    }
}

fn service_with(runtime: Arc<ScriptedRuntime>) -> (CodeExecutionService, TempDir) {
    let root = tempfile::tempdir().unwrap();
    let mut config = SandboxConfig::default();
    config.workspace.root = Some(root.path().to_path_buf());
    let service = CodeExecutionService::new(config, runtime).unwrap();
    (service, root)
}

fn envelope_output(json: &str) -> String {
    format!("{}\n{}\n{}\n", ENVELOPE_BEGIN, json, ENVELOPE_END)
}

fn workspace_dirs(root: &Path) -> usize {
    std::fs::read_dir(root)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|entry| entry.file_name().to_string_lossy().starts_with(WORKSPACE_PREFIX))
                .count()
        })
        .unwrap_or(0)
}

fn tiny_png() -> String {
    let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    bytes.extend_from_slice(b"\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01");
    STANDARD.encode(bytes)
}

#[tokio::test]
async fn forbidden_import_never_reaches_the_runtime() {
    let runtime = ScriptedRuntime::printing(String::new());
    let (service, root) = service_with(runtime.clone());

    let violation = service
        .execute(ExecutionRequest::new("import os\nos.listdir('/')"))
        .await
        .unwrap_err();

    assert_eq!(violation.rule, SecurityRule::Pattern);
    assert!(violation.message.contains("os"));
    assert_eq!(runtime.launches(), 0);
    assert_eq!(workspace_dirs(root.path()), 0);
}

#[tokio::test]
async fn every_denylisted_construct_is_rejected_before_launch() {
    let runtime = ScriptedRuntime::printing(String::new());
    let (service, _root) = service_with(runtime.clone());

    for code in [
        "import sys",
        "import subprocess",
        "eval('1')",
        "exec('x = 1')",
        "open('/etc/passwd')",
        "__import__('os')",
        "import shutil\nshutil.rmtree('/')",
    ] {
        assert!(
            service.execute(ExecutionRequest::new(code)).await.is_err(),
            "accepted: {}",
            code
        );
    }
    assert_eq!(runtime.launches(), 0);
}

#[tokio::test]
async fn rejection_is_normalized_by_execute_envelope() {
    let runtime = ScriptedRuntime::printing(String::new());
    let (service, _root) = service_with(runtime.clone());

    let envelope = service
        .execute_envelope(ExecutionRequest::new("import os"))
        .await;
    assert!(!envelope.success());
    assert!(envelope.error().contains("os"));
    assert_eq!(envelope.output(), "");
    assert!(envelope.images().is_empty());
}

#[tokio::test]
async fn successful_run_returns_parsed_envelope_and_removes_workspace() {
    let raw = envelope_output(r#"{"output": "2\n", "error": "", "images": [], "success": true}"#);
    let runtime = ScriptedRuntime::new(Box::new(move |workspace| {
        // The harness must be in place while the container runs.
        let harness = std::fs::read_to_string(workspace.harness_path()).unwrap();
        assert!(harness.contains("        print(1+1)\n"));
        Ok(raw.clone())
    }));
    let (service, root) = service_with(runtime.clone());

    let envelope = service
        .execute(ExecutionRequest::new("print(1+1)"))
        .await
        .unwrap();

    assert!(envelope.success());
    assert_eq!(envelope.output(), "2\n");
    assert_eq!(envelope.error(), "");
    assert!(envelope.images().is_empty());
    assert_eq!(runtime.launches(), 1);
    for path in runtime.seen_workspaces() {
        assert!(!path.exists(), "workspace left behind: {}", path.display());
    }
    assert_eq!(workspace_dirs(root.path()), 0);
}

#[tokio::test]
async fn timeout_yields_timeout_envelope_and_no_workspace() {
    let runtime = ScriptedRuntime::new(Box::new(|_| {
        Err(ContainerRuntimeError::Timeout(Duration::from_secs(2)).into())
    }));
    let (service, root) = service_with(runtime.clone());

    let envelope = service
        .execute(ExecutionRequest::new("while True:\n    pass").with_timeout(Duration::from_secs(2)))
        .await
        .unwrap();

    assert!(!envelope.success());
    assert_eq!(envelope.error(), "Execution timed out after 2s");
    assert_eq!(workspace_dirs(root.path()), 0);
    assert_eq!(*runtime.timeouts.lock().unwrap(), vec![Duration::from_secs(2)]);
}

#[tokio::test]
async fn requested_timeout_is_clamped_to_the_maximum() {
    let raw = envelope_output(r#"{"output": "", "error": "", "images": [], "success": true}"#);
    let runtime = ScriptedRuntime::printing(raw);
    let (service, _root) = service_with(runtime.clone());

    service
        .execute(ExecutionRequest::new("x = 1").with_timeout(Duration::from_secs(10_000)))
        .await
        .unwrap();
    service.execute(ExecutionRequest::new("x = 1")).await.unwrap();

    assert_eq!(
        *runtime.timeouts.lock().unwrap(),
        vec![Duration::from_secs(120), Duration::from_secs(30)]
    );
}

#[tokio::test]
async fn oom_kill_without_envelope_is_a_generic_failure() {
    let runtime = ScriptedRuntime::new(Box::new(|_| {
        Err(ContainerRuntimeError::NonZeroExit {
            code: 137,
            output: "partial\n".to_string(),
        }
        .into())
    }));
    let (service, root) = service_with(runtime);

    let envelope = service
        .execute(ExecutionRequest::new("x = [0] * 10**10"))
        .await
        .unwrap();

    assert!(!envelope.success());
    assert_eq!(
        envelope.error(),
        "Execution failed: sandbox exited with code 137 (memory limit exceeded?)"
    );
    assert_eq!(envelope.output(), "");
    assert_eq!(workspace_dirs(root.path()), 0);
}

#[tokio::test]
async fn crash_before_the_envelope_does_not_leak_the_traceback() {
    let runtime = ScriptedRuntime::new(Box::new(|_| {
        Err(ContainerRuntimeError::NonZeroExit {
            code: 1,
            output: concat!(
                "  File \"/app/main.py\", line 3\n",
                "    from __future__ import annotations\n",
                "SyntaxError: from __future__ imports must occur at the beginning of the file\n",
            )
            .to_string(),
        }
        .into())
    }));
    let (service, _root) = service_with(runtime);

    let envelope = service
        .execute(ExecutionRequest::new("print(1)"))
        .await
        .unwrap();

    assert!(!envelope.success());
    assert_eq!(envelope.error(), "Execution failed: sandbox exited with code 1");
    assert_eq!(envelope.output(), "");
    let json = envelope.to_json();
    assert!(!json.contains("main.py"));
    assert!(!json.contains("SyntaxError"));
}

#[tokio::test]
async fn future_imports_are_rejected_before_launch() {
    let runtime = ScriptedRuntime::printing(String::new());
    let (service, _root) = service_with(runtime.clone());

    let violation = service
        .execute(ExecutionRequest::new("from __future__ import annotations\nprint(1)"))
        .await
        .unwrap_err();

    assert_eq!(violation.rule, SecurityRule::Syntax);
    assert_eq!(runtime.launches(), 0);
}

#[tokio::test]
async fn envelope_printed_before_a_non_zero_exit_is_kept() {
    let raw = envelope_output(
        r#"{"output": "", "error": "Execution error: SystemExit: 3", "images": [], "success": false}"#,
    );
    let runtime = ScriptedRuntime::new(Box::new(move |_| {
        Err(ContainerRuntimeError::NonZeroExit {
            code: 3,
            output: raw.clone(),
        }
        .into())
    }));
    let (service, _root) = service_with(runtime);

    let envelope = service
        .execute(ExecutionRequest::new("quit(3)"))
        .await
        .unwrap();
    assert!(!envelope.success());
    assert_eq!(envelope.error(), "Execution error: SystemExit: 3");
}

#[tokio::test]
async fn engine_failures_do_not_leak_details() {
    let runtime = ScriptedRuntime::new(Box::new(|_| {
        Err(ContainerRuntimeError::Launch(
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock".to_string(),
        )
        .into())
    }));
    let (service, root) = service_with(runtime);

    let envelope = service.execute(ExecutionRequest::new("print(1)")).await.unwrap();

    assert!(!envelope.success());
    assert_eq!(envelope.error(), "Execution failed: the sandbox is unavailable");
    assert!(!envelope.to_json().contains("docker.sock"));
    assert_eq!(workspace_dirs(root.path()), 0);
}

#[tokio::test]
async fn output_without_braces_degrades_without_panicking() {
    let runtime = ScriptedRuntime::printing("Segmentation fault (core dumped)\n".to_string());
    let (service, root) = service_with(runtime);

    let envelope = service.execute(ExecutionRequest::new("print(1)")).await.unwrap();

    assert!(!envelope.success());
    assert!(envelope.error().contains("no output"));
    assert!(envelope.images().is_empty());
    assert_eq!(workspace_dirs(root.path()), 0);
}

#[tokio::test]
async fn figures_come_back_in_creation_order() {
    let json = format!(
        r#"{{"output": "", "error": "", "images": [{{"id": 0, "data": "{0}"}}, {{"id": 1, "data": "{0}"}}], "success": true}}"#,
        tiny_png()
    );
    let runtime = ScriptedRuntime::printing(envelope_output(&json));
    let (service, _root) = service_with(runtime);

    let envelope = service
        .execute(ExecutionRequest::new("plt.scatter([1], [2])\nplt.figure()\nplt.plot([1, 2])"))
        .await
        .unwrap();

    assert!(envelope.success());
    let ids: Vec<i64> = envelope.images().iter().map(|image| image.id).collect();
    assert_eq!(ids, vec![0, 1]);
    for image in envelope.images() {
        let bytes = STANDARD.decode(&image.data).unwrap();
        assert!(bytes.starts_with(b"\x89PNG"));
    }
}

#[tokio::test]
async fn deterministic_snippet_yields_identical_output() {
    let raw = envelope_output(r#"{"output": "[0 0 1 1]\n", "error": "", "images": [], "success": true}"#);
    let runtime = ScriptedRuntime::printing(raw);
    let (service, _root) = service_with(runtime);
    let code = "print(np.array([0, 0, 1, 1]))";

    let first = service.execute(ExecutionRequest::new(code)).await.unwrap();
    let second = service.execute(ExecutionRequest::new(code)).await.unwrap();
    assert_eq!(first.output(), second.output());
}

#[tokio::test]
async fn reap_removes_stale_workspaces() {
    let runtime = ScriptedRuntime::printing(String::new());
    let (service, root) = service_with(runtime);
    std::fs::create_dir(root.path().join(format!("{}crashed", WORKSPACE_PREFIX))).unwrap();

    let report = service.reap(Some(Duration::ZERO)).await.unwrap();

    assert_eq!(report.workspaces, 1);
    assert_eq!(report.containers, 0);
    assert_eq!(workspace_dirs(root.path()), 0);
}

#[tokio::test]
#[ignore] // Requires a running Docker daemon
async fn live_print_scenario() {
    let service = CodeExecutionService::connect(SandboxConfig::default()).unwrap();
    service.initialize().await.unwrap();

    let envelope = service.execute(ExecutionRequest::new("print(1+1)")).await.unwrap();

    assert!(envelope.success(), "{}", envelope.error());
    assert_eq!(envelope.output(), "2\n");
    assert_eq!(envelope.error(), "");
    assert!(envelope.images().is_empty());
}

#[tokio::test]
#[ignore] // Requires a running Docker daemon
async fn live_scatter_plot_scenario() {
    let service = CodeExecutionService::connect(SandboxConfig::default()).unwrap();
    let code = "X, _ = make_blobs(n_samples=50, centers=3, random_state=0)\n\
                labels = KMeans(n_clusters=3, n_init=10, random_state=0).fit_predict(X)\n\
                plt.scatter(X[:, 0], X[:, 1], c=labels)";

    let envelope = service
        .execute(ExecutionRequest::new(code).with_algorithm_hint("kmeans"))
        .await
        .unwrap();

    assert!(envelope.success(), "{}", envelope.error());
    assert_eq!(envelope.images().len(), 1);
}

#[tokio::test]
#[ignore] // Requires a running Docker daemon
async fn live_infinite_loop_is_cut_off() {
    let service = CodeExecutionService::connect(SandboxConfig::default()).unwrap();
    let started = std::time::Instant::now();

    let envelope = service
        .execute(ExecutionRequest::new("while True:\n    pass").with_timeout(Duration::from_secs(3)))
        .await
        .unwrap();

    assert!(!envelope.success());
    assert_eq!(envelope.error(), "Execution timed out after 3s");
    assert!(started.elapsed() < Duration::from_secs(3 + 5 + 2));
}
