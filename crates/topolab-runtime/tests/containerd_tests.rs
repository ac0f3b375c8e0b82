//! Integration tests for the containerd driver over an in-memory engine.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;

use topolab_common::{Context, TopoError, TopoResult};
use topolab_network::{MgmtNet, PluginExec};
use topolab_oci::{ContainerStatus, ExitStatus};
use topolab_runtime::containerd::{ContainerInfo, ContainerdApi, CreateRequest};
use topolab_runtime::{
    ContainerRuntime, ContainerdRuntime, DeploymentStatus, ExecResult, ExitWatch, GenericContainer,
    GenericFilter, NetworkMode, NodeSpec, RuntimeConfig, RuntimeEvent, TaskSnapshot, wait_for_container_running,
};

type Log = Arc<Mutex<Vec<String>>>;

#[derive(Default)]
struct EngineState {
    images: HashSet<String>,
    pulls: Vec<String>,
    containers: BTreeMap<String, ContainerInfo>,
    tasks: HashMap<String, TaskSnapshot>,
    fail_start: bool,
}

/// containerd stand-in keeping containers and tasks in memory.
struct FakeContainerd {
    state: Mutex<EngineState>,
    log: Log,
}

impl FakeContainerd {
    fn new(log: Log) -> Self {
        let mut state = EngineState::default();
        state.images.insert("docker.io/library/alpine:latest".to_string());
        Self {
            state: Mutex::new(state),
            log,
        }
    }

    fn record(&self, call: impl Into<String>) {
        self.log.lock().push(call.into());
    }
}

/// Evaluate the subset of the filter grammar the driver emits.
fn filter_matches(info: &ContainerInfo, filter: &str) -> bool {
    filter.split(',').filter(|f| !f.is_empty()).all(|expr| {
        if let Some(name) = expr.strip_prefix("id~=\"^").and_then(|r| r.strip_suffix("$\"")) {
            return info.id == name.replace("\\\\", "");
        }
        let Some(label) = expr.strip_prefix("labels.\"") else {
            return false;
        };
        match label.split_once("\"==\"") {
            Some((key, value)) => info.labels.get(key).map(String::as_str) == value.strip_suffix('"'),
            None => info.labels.contains_key(label.trim_end_matches('"')),
        }
    })
}

#[async_trait]
impl ContainerdApi for FakeContainerd {
    async fn image_exists(&self, _ctx: &Context, image: &str) -> TopoResult<bool> {
        Ok(self.state.lock().images.contains(image))
    }

    async fn pull_image(&self, _ctx: &Context, image: &str) -> TopoResult<()> {
        let mut state = self.state.lock();
        state.pulls.push(image.to_string());
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn create_container(&self, _ctx: &Context, req: &CreateRequest) -> TopoResult<()> {
        self.record("create");
        self.state.lock().containers.insert(
            req.id.clone(),
            ContainerInfo {
                id: req.id.clone(),
                image: req.image.clone(),
                labels: req.labels.clone(),
            },
        );
        Ok(())
    }

    async fn container_info(&self, _ctx: &Context, id: &str) -> TopoResult<Option<ContainerInfo>> {
        Ok(self.state.lock().containers.get(id).cloned())
    }

    async fn list_containers(&self, _ctx: &Context, filter: &str) -> TopoResult<Vec<ContainerInfo>> {
        Ok(self
            .state
            .lock()
            .containers
            .values()
            .filter(|info| filter_matches(info, filter))
            .cloned()
            .collect())
    }

    async fn set_labels(
        &self,
        _ctx: &Context,
        id: &str,
        labels: &BTreeMap<String, String>,
    ) -> TopoResult<()> {
        self.record("label");
        if let Some(info) = self.state.lock().containers.get_mut(id) {
            info.labels.extend(labels.clone());
        }
        Ok(())
    }

    async fn delete_container(&self, _ctx: &Context, id: &str) -> TopoResult<()> {
        self.record("delete container");
        self.state.lock().containers.remove(id);
        Ok(())
    }

    async fn start_task(&self, _ctx: &Context, id: &str, log: &Path) -> TopoResult<()> {
        self.record(format!("start {}", log.file_name().unwrap().to_string_lossy()));
        let mut state = self.state.lock();
        if state.fail_start {
            return Err(TopoError::engine(id, "failed to create shim task"));
        }
        state.tasks.insert(
            id.to_string(),
            TaskSnapshot {
                status: ContainerStatus::Running,
                pid: 4242,
                exit: None,
            },
        );
        Ok(())
    }

    async fn task(&self, _ctx: &Context, id: &str) -> TopoResult<Option<TaskSnapshot>> {
        Ok(self.state.lock().tasks.get(id).copied())
    }

    async fn watch_exit(&self, _ctx: &Context, _id: &str) -> TopoResult<ExitWatch> {
        self.record("watch");
        Ok(ExitWatch::spawn(async { Ok(ExitStatus::code_only(137)) }))
    }

    async fn resume_task(&self, _ctx: &Context, _id: &str) -> TopoResult<()> {
        self.record("resume");
        Ok(())
    }

    async fn kill_task(&self, _ctx: &Context, id: &str) -> TopoResult<()> {
        self.record("kill");
        if let Some(task) = self.state.lock().tasks.get_mut(id) {
            task.status = ContainerStatus::Stopped;
        }
        Ok(())
    }

    async fn delete_task(&self, _ctx: &Context, id: &str) -> TopoResult<ExitStatus> {
        self.record("delete task");
        self.state.lock().tasks.remove(id);
        Ok(ExitStatus::code_only(137))
    }

    async fn exec(&self, _ctx: &Context, _id: &str, cmd: &[String], detach: bool) -> TopoResult<ExecResult> {
        self.record(if detach { "exec detached" } else { "exec" });
        Ok(ExecResult {
            stdout: cmd.join(" ").into_bytes(),
            stderr: Vec::new(),
            exit_code: 0,
        })
    }
}

/// Plugin executor answering ADD with fixed addresses.
struct FakePlugins {
    log: Log,
}

#[async_trait]
impl PluginExec for FakePlugins {
    async fn find_plugin(&self, plugin: &str, _paths: &[PathBuf]) -> TopoResult<PathBuf> {
        Ok(PathBuf::from("/opt/cni/bin").join(plugin))
    }

    async fn exec_plugin(
        &self,
        _ctx: &Context,
        binary: &Path,
        _stdin: Vec<u8>,
        env: Vec<(String, String)>,
    ) -> TopoResult<Vec<u8>> {
        let command = env
            .iter()
            .find(|(k, _)| k == "CNI_COMMAND")
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        let plugin = binary.file_name().unwrap().to_string_lossy();
        self.log.lock().push(format!("{command} {plugin}"));
        if command != "ADD" {
            return Ok(Vec::new());
        }
        Ok(serde_json::to_vec(&json!({
            "cniVersion": "0.4.0",
            "ips": [
                { "version": "4", "address": "172.20.20.2/24", "gateway": "172.20.20.1" },
                { "version": "6", "address": "3fff:172:20:20::2/64", "gateway": "3fff:172:20:20::1" }
            ]
        }))
        .unwrap())
    }
}

struct Harness {
    runtime: ContainerdRuntime,
    engine: Arc<FakeContainerd>,
    log: Log,
    root: TempDir,
}

impl Harness {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        let log = Log::default();
        let engine = Arc::new(FakeContainerd::new(Arc::clone(&log)));
        let plugins = Arc::new(FakePlugins {
            log: Arc::clone(&log),
        });
        let config = RuntimeConfig::default().with_root(root.path());
        let runtime = ContainerdRuntime::with_client(config, engine.clone(), plugins);
        runtime.set_mgmt_net(MgmtNet::new("clab", "172.20.20.0/24", "3fff:172:20:20::/64"));
        Self {
            runtime,
            engine,
            log,
            root,
        }
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    fn netns_link(&self, name: &str) -> PathBuf {
        self.root.path().join("netns").join(name)
    }
}

fn node(short: &str) -> NodeSpec {
    NodeSpec::new(short, format!("clab-lab-{short}"), "alpine")
        .with_cmd("sleep infinity")
        .with_label("containerlab", "lab")
}

#[tokio::test]
async fn pulls_missing_image_once() {
    let h = Harness::new();
    let ctx = Context::background();
    h.runtime.pull_image_if_required(&ctx, "frrouting/frr:v8.4.0").await.unwrap();
    h.runtime.pull_image_if_required(&ctx, "frrouting/frr:v8.4.0").await.unwrap();
    h.runtime.pull_image_if_required(&ctx, "alpine").await.unwrap();
    assert_eq!(h.engine.state.lock().pulls, ["docker.io/frrouting/frr:v8.4.0"]);
}

#[test_log::test(tokio::test)]
async fn bridge_container_is_attached_and_labelled() {
    let h = Harness::new();
    let ctx = Context::background();
    let mut events = h.runtime.subscribe();
    let mut srl1 = node("srl1");

    h.runtime.create_container(&ctx, &mut srl1).await.unwrap();

    assert_eq!(srl1.deployment_status, DeploymentStatus::Created);
    assert_eq!(srl1.container_id.as_deref(), Some("clab-lab-srl1"));
    assert_eq!(srl1.ns_path, Some(PathBuf::from("/proc/4242/ns/net")));
    assert_eq!(srl1.mgmt_ips.ipv4_addr(), "172.20.20.2");
    assert_eq!(srl1.mgmt_ips.ipv4_prefix_len(), 24);
    assert_eq!(srl1.mgmt_ips.ipv6_gateway(), "3fff:172:20:20::1");

    assert_eq!(
        h.log(),
        [
            "create",
            "start clab-lab-srl1.log",
            "ADD bridge",
            "ADD tuning",
            "ADD portmap",
            "label",
        ]
    );
    let link = std::fs::read_link(h.netns_link("clab-lab-srl1")).unwrap();
    assert_eq!(link, PathBuf::from("/proc/4242/ns/net"));

    let inspected = h.runtime.container_inspect(&ctx, "clab-lab-srl1").await.unwrap();
    assert_eq!(inspected.status(), "Up");
    assert_eq!(inspected.pid(), Some(4242));
    assert_eq!(inspected.labels()["clab.ipv4.addr"], "172.20.20.2");
    assert_eq!(inspected.mgmt_ips().ipv4_addr(), "172.20.20.2");
    assert_eq!(inspected.mgmt_ips().ipv6_prefix_len(), 64);

    assert!(matches!(events.recv().await.unwrap(), RuntimeEvent::NodeStarted { .. }));
    assert!(matches!(events.recv().await.unwrap(), RuntimeEvent::NodeCreated { .. }));
}

#[tokio::test]
async fn host_mode_skips_attach() {
    let h = Harness::new();
    let mut host = node("host1").with_network_mode(NetworkMode::Host);
    h.runtime.create_container(&Context::background(), &mut host).await.unwrap();

    assert!(!host.mgmt_ips.is_set());
    assert!(h.log().iter().all(|call| !call.starts_with("ADD")));
}

#[tokio::test]
async fn missing_image_fails_before_create() {
    let h = Harness::new();
    let mut srl = NodeSpec::new("srl1", "clab-lab-srl1", "ghcr.io/nokia/srlinux");
    let err = h
        .runtime
        .create_container(&Context::background(), &mut srl)
        .await
        .unwrap_err();
    assert!(matches!(err, TopoError::ImageNotFound { .. }));
    assert!(h.log().is_empty());
}

#[tokio::test]
async fn invalid_name_is_rejected() {
    let h = Harness::new();
    let mut bad = NodeSpec::new("n1", "clab lab n1", "alpine");
    let err = h
        .runtime
        .create_container(&Context::background(), &mut bad)
        .await
        .unwrap_err();
    assert!(matches!(err, TopoError::InvalidContainerName { .. }));
}

#[test_log::test(tokio::test)]
async fn failed_start_removes_the_container() {
    let h = Harness::new();
    h.engine.state.lock().fail_start = true;
    let mut srl1 = node("srl1");

    let err = h
        .runtime
        .create_container(&Context::background(), &mut srl1)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("failed to create shim task"));
    assert!(h.engine.state.lock().containers.is_empty());
    assert_eq!(srl1.container_id, None);
    assert_eq!(srl1.deployment_status, DeploymentStatus::Pending);
}

#[tokio::test]
async fn delete_stops_detaches_then_removes() {
    let h = Harness::new();
    let ctx = Context::background();
    let mut srl1 = node("srl1");
    h.runtime.create_container(&ctx, &mut srl1).await.unwrap();
    let container = h.runtime.container_inspect(&ctx, "clab-lab-srl1").await.unwrap();
    h.log.lock().clear();

    h.runtime.delete_container(&ctx, &container).await.unwrap();

    assert_eq!(
        h.log(),
        [
            "watch",
            "kill",
            "delete task",
            "DEL portmap",
            "DEL tuning",
            "DEL bridge",
            "delete container",
        ]
    );
    assert!(h.netns_link("clab-lab-srl1").symlink_metadata().is_err());
    assert!(matches!(
        h.runtime.container_inspect(&ctx, "clab-lab-srl1").await,
        Err(TopoError::ContainerNotFound { .. })
    ));
}

#[tokio::test]
async fn list_applies_label_filters() {
    let h = Harness::new();
    let ctx = Context::background();
    let mut a = node("a").with_label("clab-node-kind", "linux");
    let mut b = node("b").with_network_mode(NetworkMode::None);
    h.runtime.create_container(&ctx, &mut a).await.unwrap();
    h.runtime.create_container(&ctx, &mut b).await.unwrap();

    let all = h
        .runtime
        .list_containers(&ctx, &[GenericFilter::label("containerlab", "lab")])
        .await
        .unwrap();
    assert_eq!(all.len(), 2);

    let kinds = h
        .runtime
        .list_containers(&ctx, &[GenericFilter::label_exists("clab-node-kind")])
        .await
        .unwrap();
    assert_eq!(kinds.len(), 1);
    assert_eq!(kinds[0].id(), "clab-lab-a");

    let none = h
        .runtime
        .list_containers(&ctx, &[GenericFilter::label("containerlab", "other")])
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn ns_path_requires_a_task() {
    let h = Harness::new();
    let ctx = Context::background();
    assert!(matches!(
        h.runtime.get_ns_path(&ctx, "clab-lab-ghost").await,
        Err(TopoError::NoTask { .. })
    ));

    let mut srl1 = node("srl1");
    h.runtime.create_container(&ctx, &mut srl1).await.unwrap();
    h.runtime.stop_container(&ctx, "clab-lab-srl1", None).await.unwrap();
    let stopped = h.runtime.container_inspect(&ctx, "clab-lab-srl1").await.unwrap();
    assert_eq!(stopped.state(), ContainerStatus::Unknown);
    assert_eq!(stopped.status(), "Unknown");
    assert_eq!(stopped.pid(), None);
}

#[tokio::test]
async fn exec_returns_output() {
    let h = Harness::new();
    let ctx = Context::background();
    let cmd = vec!["echo".to_string(), "hi".to_string()];
    let out = h.runtime.exec(&ctx, "clab-lab-srl1", &cmd).await.unwrap();
    assert_eq!(out.stdout_str(), "echo hi");
    assert_eq!(out.exit_code, 0);

    h.runtime.exec_not_wait(&ctx, "clab-lab-srl1", &cmd).await.unwrap();
    assert_eq!(h.log(), ["exec", "exec detached"]);
}

#[tokio::test]
async fn wait_for_running_honors_deadline() {
    let h = Harness::new();
    let ctx = Context::background();
    let mut srl1 = node("srl1");
    h.runtime.create_container(&ctx, &mut srl1).await.unwrap();

    let poll = Duration::from_millis(10);
    let running = wait_for_container_running(&h.runtime, &ctx, "clab-lab-srl1", poll)
        .await
        .unwrap();
    assert_eq!(running.state(), ContainerStatus::Running);

    h.runtime.stop_container(&ctx, "clab-lab-srl1", None).await.unwrap();
    let short = Context::background().with_timeout(Duration::from_millis(50));
    let err = wait_for_container_running(&h.runtime, &short, "clab-lab-srl1", poll)
        .await
        .unwrap_err();
    assert!(matches!(err, TopoError::DeadlineExceeded { .. }), "{err}");
}

#[tokio::test]
async fn stopping_twice_signals_once() {
    let h = Harness::new();
    let ctx = Context::background();
    let mut srl1 = node("srl1");
    h.runtime.create_container(&ctx, &mut srl1).await.unwrap();
    h.log.lock().clear();

    h.runtime.stop_container(&ctx, "clab-lab-srl1", None).await.unwrap();
    h.runtime.stop_container(&ctx, "clab-lab-srl1", None).await.unwrap();

    assert_eq!(h.log(), ["watch", "kill", "delete task"]);
}

#[test_log::test(tokio::test)]
async fn unreadable_cache_still_detaches() {
    let h = Harness::new();
    let ctx = Context::background();
    let mut srl1 = node("srl1");
    h.runtime.create_container(&ctx, &mut srl1).await.unwrap();

    let results = h.root.path().join("cni-cache").join("results");
    std::fs::remove_dir_all(&results).unwrap();
    std::fs::write(&results, b"").unwrap();
    h.log.lock().clear();

    // no recorded addresses, so only the cache check can trigger the detach
    let bare = GenericContainer::new("clab-lab-srl1", "alpine", BTreeMap::new(), None);
    h.runtime.delete_container(&ctx, &bare).await.unwrap();

    assert_eq!(
        h.log(),
        [
            "watch",
            "kill",
            "delete task",
            "DEL portmap",
            "DEL tuning",
            "DEL bridge",
            "delete container",
        ]
    );
}
