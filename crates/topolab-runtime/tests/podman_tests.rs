//! Integration tests for the podman driver over an in-memory engine.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use topolab_common::{Context, TopoError, TopoResult};
use topolab_network::{LinkTuning, MgmtNet};
use topolab_oci::{ContainerStatus, ExitStatus};
use topolab_runtime::podman::client::{
    InspectConfig, InspectNetwork, InspectNetworkSettings, InspectState,
};
use topolab_runtime::podman::{CreateSpec, InspectInfo, NetworkSpec, PodmanApi, PsEntry};
use topolab_runtime::{
    ContainerRuntime, DeploymentStatus, ExecResult, ExitWatch, GenericFilter, NetworkMode,
    NodeSpec, PodmanRuntime, RuntimeConfig,
};

type Log = Arc<Mutex<Vec<String>>>;

#[derive(Default)]
struct EngineState {
    networks: HashSet<String>,
    network_specs: Vec<NetworkSpec>,
    creates: Vec<CreateSpec>,
    containers: BTreeMap<String, InspectInfo>,
}

/// podman stand-in that attaches bridge containers at 172.20.20.5.
struct FakePodman {
    state: Mutex<EngineState>,
    log: Log,
}

impl FakePodman {
    fn record(&self, call: impl Into<String>) {
        self.log.lock().push(call.into());
    }

    fn with_container<T>(&self, name: &str, f: impl FnOnce(&mut InspectInfo) -> T) -> TopoResult<T> {
        let mut state = self.state.lock();
        let info = state
            .containers
            .values_mut()
            .find(|info| info.name == name || info.id == name)
            .ok_or_else(|| TopoError::ContainerNotFound { id: name.to_string() })?;
        Ok(f(info))
    }
}

fn label_matches(labels: &BTreeMap<String, String>, filter: &str) -> bool {
    let Some(label) = filter.strip_prefix("label=") else {
        return false;
    };
    match label.split_once('=') {
        Some((key, value)) => labels.get(key).is_some_and(|v| v == value),
        None => labels.contains_key(label),
    }
}

#[async_trait]
impl PodmanApi for FakePodman {
    async fn image_exists(&self, _ctx: &Context, image: &str) -> TopoResult<bool> {
        Ok(image == "docker.io/library/alpine:latest")
    }

    async fn pull_image(&self, _ctx: &Context, image: &str) -> TopoResult<()> {
        self.record(format!("pull {image}"));
        Ok(())
    }

    async fn network_exists(&self, _ctx: &Context, name: &str) -> TopoResult<bool> {
        Ok(self.state.lock().networks.contains(name))
    }

    async fn create_network(&self, _ctx: &Context, spec: &NetworkSpec) -> TopoResult<()> {
        self.record("network create");
        let mut state = self.state.lock();
        state.networks.insert(spec.name.clone());
        state.network_specs.push(spec.clone());
        Ok(())
    }

    async fn remove_network(&self, _ctx: &Context, name: &str) -> TopoResult<()> {
        self.record("network rm");
        self.state.lock().networks.remove(name);
        Ok(())
    }

    async fn create_container(&self, _ctx: &Context, spec: &CreateSpec) -> TopoResult<String> {
        self.record("create");
        let id = format!("{:0>64}", spec.name.len());
        let mut state = self.state.lock();
        state.creates.push(spec.clone());
        state.containers.insert(
            spec.name.clone(),
            InspectInfo {
                id: id.clone(),
                name: spec.name.clone(),
                image_name: spec.image.clone(),
                state: InspectState {
                    status: "created".to_string(),
                    ..InspectState::default()
                },
                config: InspectConfig {
                    labels: Some(spec.labels.clone()),
                },
                network_settings: InspectNetworkSettings::default(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, _ctx: &Context, name: &str) -> TopoResult<()> {
        self.record("start");
        let network = self
            .state
            .lock()
            .creates
            .iter()
            .find(|spec| spec.name == name)
            .map(|spec| spec.network.clone())
            .unwrap_or_default();
        self.with_container(name, |info| {
            info.state.status = "running".to_string();
            info.state.pid = 5151;
            let bridge = network.split(':').next().unwrap_or_default();
            if !matches!(bridge, "host" | "none" | "container") {
                let attachment = InspectNetwork {
                    ip_address: "172.20.20.5".to_string(),
                    ip_prefix_len: 24,
                    gateway: "172.20.20.1".to_string(),
                    ..InspectNetwork::default()
                };
                info.network_settings.networks =
                    Some(HashMap::from([(bridge.to_string(), attachment)]));
            }
        })
    }

    async fn inspect(&self, _ctx: &Context, name: &str) -> TopoResult<Option<InspectInfo>> {
        Ok(self.with_container(name, |info| info.clone()).ok())
    }

    async fn list(&self, _ctx: &Context, filters: &[String]) -> TopoResult<Vec<PsEntry>> {
        Ok(self
            .state
            .lock()
            .containers
            .values()
            .filter(|info| {
                let labels = info.config.labels.clone().unwrap_or_default();
                filters.iter().all(|f| label_matches(&labels, f))
            })
            .map(|info| PsEntry {
                id: info.id.clone(),
                names: vec![info.name.clone()],
            })
            .collect())
    }

    async fn unpause(&self, _ctx: &Context, _name: &str) -> TopoResult<()> {
        self.record("unpause");
        Ok(())
    }

    async fn kill(&self, _ctx: &Context, name: &str, signal: &str) -> TopoResult<()> {
        self.record(format!("kill {signal}"));
        self.with_container(name, |info| {
            info.state.status = "exited".to_string();
            info.state.exit_code = 137;
            info.state.pid = 0;
        })
    }

    async fn wait(&self, _ctx: &Context, _name: &str) -> TopoResult<ExitWatch> {
        self.record("wait");
        Ok(ExitWatch::spawn(async { Ok(ExitStatus::code_only(137)) }))
    }

    async fn remove(&self, _ctx: &Context, name: &str) -> TopoResult<()> {
        self.record("remove");
        self.state.lock().containers.remove(name);
        Ok(())
    }

    async fn exec(&self, _ctx: &Context, _name: &str, _cmd: &[String], _detach: bool) -> TopoResult<ExecResult> {
        Ok(ExecResult {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: 0,
        })
    }
}

#[derive(Default)]
struct FakeTuning {
    links: Mutex<Vec<String>>,
}

#[async_trait]
impl LinkTuning for FakeTuning {
    async fn disable_tx_offload(&self, _ctx: &Context, link: &str) -> TopoResult<()> {
        self.links.lock().push(link.to_string());
        Ok(())
    }
}

struct Harness {
    runtime: PodmanRuntime,
    engine: Arc<FakePodman>,
    tuning: Arc<FakeTuning>,
    log: Log,
    root: TempDir,
}

impl Harness {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        let log = Log::default();
        let engine = Arc::new(FakePodman {
            state: Mutex::default(),
            log: Arc::clone(&log),
        });
        let tuning = Arc::new(FakeTuning::default());
        let config = RuntimeConfig::default().with_root(root.path());
        let runtime = PodmanRuntime::with_client(config, engine.clone(), tuning.clone());
        runtime.set_mgmt_net(MgmtNet::new("clab", "172.20.20.0/24", "").with_mtu("1500"));
        Self {
            runtime,
            engine,
            tuning,
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

#[tokio::test]
async fn management_network_is_created_once() {
    let h = Harness::new();
    let ctx = Context::background();
    h.runtime.create_net(&ctx).await.unwrap();
    h.runtime.create_net(&ctx).await.unwrap();
    assert_eq!(h.log(), ["network create"]);

    let specs = h.engine.state.lock().network_specs.clone();
    assert_eq!(specs[0].interface, "br-clab");
    assert_eq!(specs[0].options["mtu"], "1500");
    assert!(!specs[0].ipv6);

    h.runtime.delete_net(&ctx).await.unwrap();
    h.runtime.delete_net(&ctx).await.unwrap();
    assert_eq!(h.log(), ["network create", "network rm"]);
}

#[tokio::test]
async fn pull_skips_present_image() {
    let h = Harness::new();
    let ctx = Context::background();
    h.runtime.pull_image_if_required(&ctx, "alpine").await.unwrap();
    h.runtime.pull_image_if_required(&ctx, "frrouting/frr:v8.4.0").await.unwrap();
    assert_eq!(h.log(), ["pull docker.io/frrouting/frr:v8.4.0"]);
}

#[test_log::test(tokio::test)]
async fn bridge_container_reports_engine_addresses() {
    let h = Harness::new();
    let ctx = Context::background();
    let mut srl1 = NodeSpec::new("srl1", "clab-lab-srl1", "alpine")
        .with_label("containerlab", "lab")
        .with_mgmt_addresses("172.20.20.5", "");

    h.runtime.create_container(&ctx, &mut srl1).await.unwrap();

    let create = h.engine.state.lock().creates[0].clone();
    assert_eq!(create.network, "clab:ip=172.20.20.5");
    assert_eq!(create.labels["clab-net-mgmt"], "clab");

    assert_eq!(srl1.deployment_status, DeploymentStatus::Created);
    assert_eq!(srl1.container_id.as_deref().map(str::len), Some(64));
    assert_eq!(srl1.ns_path, Some(PathBuf::from("/proc/5151/ns/net")));
    assert_eq!(srl1.mgmt_ips.ipv4_addr(), "172.20.20.5");
    assert_eq!(srl1.mgmt_ips.ipv4_gateway(), "172.20.20.1");
    assert_eq!(srl1.mgmt_ips.ipv6_addr(), "");
    assert_eq!(*h.tuning.links.lock(), ["br-clab"]);
    assert!(h.netns_link("clab-lab-srl1").symlink_metadata().is_ok());
}

#[tokio::test]
async fn host_mode_has_no_addresses_or_tuning() {
    let h = Harness::new();
    let mut host = NodeSpec::new("h1", "clab-lab-h1", "alpine").with_network_mode(NetworkMode::Host);
    h.runtime.create_container(&Context::background(), &mut host).await.unwrap();

    assert_eq!(h.engine.state.lock().creates[0].network, "host");
    assert!(!host.mgmt_ips.is_set());
    assert!(h.tuning.links.lock().is_empty());
}

#[tokio::test]
async fn missing_image_is_reported() {
    let h = Harness::new();
    let mut node = NodeSpec::new("n1", "clab-lab-n1", "ghcr.io/nokia/srlinux");
    let err = h
        .runtime
        .create_container(&Context::background(), &mut node)
        .await
        .unwrap_err();
    assert!(matches!(err, TopoError::ImageNotFound { .. }));
}

#[tokio::test]
async fn delete_stops_then_removes() {
    let h = Harness::new();
    let ctx = Context::background();
    let mut srl1 = NodeSpec::new("srl1", "clab-lab-srl1", "alpine").with_label("containerlab", "lab");
    h.runtime.create_container(&ctx, &mut srl1).await.unwrap();

    let listed = h
        .runtime
        .list_containers(&ctx, &[GenericFilter::label("containerlab", "lab")])
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].names(), ["clab-lab-srl1"]);
    assert_eq!(listed[0].state(), ContainerStatus::Running);
    assert_eq!(listed[0].mgmt_ips().ipv4_prefix_len(), 24);

    h.log.lock().clear();
    h.runtime.delete_container(&ctx, &listed[0]).await.unwrap();

    assert_eq!(h.log(), ["wait", "kill KILL", "remove"]);
    assert!(h.netns_link("clab-lab-srl1").symlink_metadata().is_err());
    assert!(matches!(
        h.runtime.container_inspect(&ctx, "clab-lab-srl1").await,
        Err(TopoError::ContainerNotFound { .. })
    ));
}

#[tokio::test]
async fn stopped_container_has_no_namespace() {
    let h = Harness::new();
    let ctx = Context::background();
    let mut srl1 = NodeSpec::new("srl1", "clab-lab-srl1", "alpine");
    h.runtime.create_container(&ctx, &mut srl1).await.unwrap();
    h.runtime.stop_container(&ctx, "clab-lab-srl1", None).await.unwrap();

    let stopped = h.runtime.container_inspect(&ctx, "clab-lab-srl1").await.unwrap();
    assert_eq!(stopped.state(), ContainerStatus::Stopped);
    assert!(stopped.status().starts_with("Exited (137)"), "{}", stopped.status());
    assert!(matches!(
        h.runtime.get_ns_path(&ctx, "clab-lab-srl1").await,
        Err(TopoError::NoTask { .. })
    ));
}

#[tokio::test]
async fn stopping_twice_signals_once() {
    let h = Harness::new();
    let ctx = Context::background();
    let mut srl1 = NodeSpec::new("srl1", "clab-lab-srl1", "alpine");
    h.runtime.create_container(&ctx, &mut srl1).await.unwrap();
    h.log.lock().clear();

    h.runtime.stop_container(&ctx, "clab-lab-srl1", None).await.unwrap();
    h.runtime.stop_container(&ctx, "clab-lab-srl1", None).await.unwrap();

    assert_eq!(h.log(), ["wait", "kill KILL"]);
}
