//! Attaching container namespaces to the management network.
//!
//! An attachment lives for a single ADD or DEL. ADD walks the chain in
//! order, feeding each plugin the previous plugin's result, and caches the
//! final result on disk. DEL walks the chain in reverse with that cached
//! result and removes the cache afterwards.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use topolab_common::{Context, RuntimePaths, TopoError, TopoResult};

use crate::cni::{NetworkConfList, declared_capabilities, parse_mac, plugin_type};
use crate::exec::PluginExec;
use crate::mgmt::MgmtNet;
use crate::portmap::PortMapping;

/// Interface name of the management link inside the container.
pub const MGMT_IFNAME: &str = "eth0";

const CACHE_KIND: &str = "cniCacheV1";

/// Plugin command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Add,
    Del,
}

impl Command {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Del => "DEL",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CachedResult {
    kind: String,
    container_id: String,
    if_name: String,
    network_name: String,
    #[serde(default)]
    capability_args: Map<String, Value>,
    result: Value,
}

/// One container's management network attachment.
#[derive(Debug, Clone)]
pub struct NetworkAttachment {
    conf: NetworkConfList,
    container_id: String,
    ifname: String,
    netns: Option<PathBuf>,
    capability_args: Map<String, Value>,
    plugin_dirs: Vec<PathBuf>,
    cache: PathBuf,
    cni_path: String,
}

impl NetworkAttachment {
    /// Prepare an attachment of `container_id` to `mgmt`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the chain cannot be built.
    pub fn new(mgmt: &MgmtNet, container_id: &str, paths: &RuntimePaths) -> TopoResult<Self> {
        let conf = NetworkConfList::mgmt_chain(mgmt)?;
        let cache = paths.cni_result(&conf.name, container_id, MGMT_IFNAME);
        Ok(Self {
            conf,
            container_id: container_id.to_string(),
            ifname: MGMT_IFNAME.to_string(),
            netns: None,
            capability_args: Map::new(),
            plugin_dirs: paths.cni_bin.clone(),
            cache,
            cni_path: paths.cni_path_env(),
        })
    }

    /// Request a fixed MAC address on the container interface.
    ///
    /// # Errors
    ///
    /// Returns [`TopoError::InvalidMac`] naming the value.
    pub fn with_mac(mut self, mac: &str) -> TopoResult<Self> {
        let mac = parse_mac(mac)?;
        self.capability_args.insert("mac".to_string(), json!(mac));
        Ok(self)
    }

    /// Publish ports through the `portmap` plugin.
    #[must_use]
    pub fn with_port_mappings(mut self, mappings: Vec<PortMapping>) -> Self {
        if !mappings.is_empty() {
            self.capability_args
                .insert("portMappings".to_string(), json!(mappings));
        }
        self
    }

    /// Set the container network namespace path.
    ///
    /// Known only after the container started; left empty for a DEL
    /// whose namespace is already gone.
    #[must_use]
    pub fn with_netns(mut self, netns: Option<PathBuf>) -> Self {
        self.netns = netns;
        self
    }

    /// The chain configuration.
    #[must_use]
    pub const fn conf(&self) -> &NetworkConfList {
        &self.conf
    }

    /// Capability arguments passed to plugins that declare them.
    #[must_use]
    pub const fn capability_args(&self) -> &Map<String, Value> {
        &self.capability_args
    }

    /// Attach the container, returning the raw chain result.
    ///
    /// # Errors
    ///
    /// Fails if no namespace path is set, a plugin is missing, or a
    /// plugin reports an error.
    pub async fn add(&self, ctx: &Context, exec: &dyn PluginExec) -> TopoResult<Value> {
        if self.netns.is_none() {
            return Err(TopoError::Internal {
                message: format!(
                    "network attach for {} requested before its namespace exists",
                    self.container_id
                ),
            });
        }

        tracing::debug!(
            container = %self.container_id,
            network = %self.conf.name,
            "attaching management network"
        );

        let mut prev: Option<Value> = None;
        for plugin in &self.conf.plugins {
            let out = self.invoke(ctx, exec, Command::Add, plugin, prev.as_ref()).await?;
            let result: Value = serde_json::from_slice(&out)?;
            prev = Some(result);
        }
        let result = prev.unwrap_or(Value::Null);

        self.write_cache(&result).await?;
        Ok(result)
    }

    /// Detach the container.
    ///
    /// A missing cached result is tolerated; plugins then run without a
    /// previous result.
    ///
    /// # Errors
    ///
    /// Fails if a plugin is missing or reports an error.
    pub async fn del(&self, ctx: &Context, exec: &dyn PluginExec) -> TopoResult<()> {
        tracing::debug!(
            container = %self.container_id,
            network = %self.conf.name,
            netns = ?self.netns,
            "detaching management network"
        );

        let cached = self.read_cache().await;
        for plugin in self.conf.plugins.iter().rev() {
            self.invoke(ctx, exec, Command::Del, plugin, cached.as_ref())
                .await?;
        }

        match tokio::fs::remove_file(&self.cache).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.cache.display(), error = %e, "failed to remove cached result");
            }
        }
        Ok(())
    }

    async fn invoke(
        &self,
        ctx: &Context,
        exec: &dyn PluginExec,
        command: Command,
        plugin: &Value,
        prev: Option<&Value>,
    ) -> TopoResult<Vec<u8>> {
        let kind = plugin_type(plugin)?;
        let binary = exec.find_plugin(kind, &self.plugin_dirs).await?;
        let stdin = serde_json::to_vec(&self.plugin_config(plugin, prev))?;

        tracing::trace!(plugin = kind, command = command.as_str(), container = %self.container_id, "running plugin");
        exec.exec_plugin(ctx, &binary, stdin, self.env(command)).await
    }

    /// The configuration one plugin sees on stdin.
    fn plugin_config(&self, plugin: &Value, prev: Option<&Value>) -> Value {
        let mut conf = plugin.clone();
        let Some(obj) = conf.as_object_mut() else {
            return conf;
        };
        obj.insert("name".to_string(), json!(self.conf.name));
        obj.insert("cniVersion".to_string(), json!(self.conf.cni_version));

        let runtime: Map<String, Value> = declared_capabilities(plugin)
            .into_iter()
            .filter_map(|cap| {
                self.capability_args
                    .get(cap)
                    .map(|arg| (cap.to_string(), arg.clone()))
            })
            .collect();
        if !runtime.is_empty() {
            obj.insert("runtimeConfig".to_string(), Value::Object(runtime));
        }

        if let Some(prev) = prev {
            obj.insert("prevResult".to_string(), prev.clone());
        }
        conf
    }

    fn env(&self, command: Command) -> Vec<(String, String)> {
        let netns = self
            .netns
            .as_deref()
            .map(Path::display)
            .map(|p| p.to_string())
            .unwrap_or_default();
        vec![
            ("CNI_COMMAND".to_string(), command.as_str().to_string()),
            ("CNI_CONTAINERID".to_string(), self.container_id.clone()),
            ("CNI_NETNS".to_string(), netns),
            ("CNI_IFNAME".to_string(), self.ifname.clone()),
            ("CNI_ARGS".to_string(), String::new()),
            ("CNI_PATH".to_string(), self.cni_path.clone()),
        ]
    }

    async fn write_cache(&self, result: &Value) -> TopoResult<()> {
        let entry = CachedResult {
            kind: CACHE_KIND.to_string(),
            container_id: self.container_id.clone(),
            if_name: self.ifname.clone(),
            network_name: self.conf.name.clone(),
            capability_args: self.capability_args.clone(),
            result: result.clone(),
        };
        if let Some(dir) = self.cache.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&self.cache, serde_json::to_vec(&entry)?).await?;
        Ok(())
    }

    async fn read_cache(&self) -> Option<Value> {
        let raw = match tokio::fs::read(&self.cache).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!(path = %self.cache.display(), error = %e, "no cached attach result");
                return None;
            }
        };
        match serde_json::from_slice::<CachedResult>(&raw) {
            Ok(entry) if entry.kind == CACHE_KIND => Some(entry.result),
            Ok(entry) => {
                tracing::warn!(kind = %entry.kind, "ignoring cached result of unknown kind");
                None
            }
            Err(e) => {
                tracing::warn!(path = %self.cache.display(), error = %e, "ignoring unreadable cached result");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(root: &Path) -> NetworkAttachment {
        let mgmt = MgmtNet::new("clab", "172.20.20.0/24", "").with_default_bridge();
        NetworkAttachment::new(&mgmt, "clab-lab-srl1", &RuntimePaths::with_root(root)).unwrap()
    }

    #[test]
    fn capabilities_reach_only_declaring_plugins() {
        let dir = tempfile::tempdir().unwrap();
        let att = attachment(dir.path())
            .with_mac("02:42:ac:14:14:02")
            .unwrap()
            .with_port_mappings(vec![PortMapping::tcp(8080, 80)]);

        let plugins = &att.conf().plugins;
        let bridge = att.plugin_config(&plugins[0], None);
        assert!(bridge.get("runtimeConfig").is_none());
        assert_eq!(bridge["name"], "clabmgmt");

        let tuning = att.plugin_config(&plugins[1], None);
        assert_eq!(tuning["runtimeConfig"]["mac"], "02:42:ac:14:14:02");
        assert!(tuning["runtimeConfig"].get("portMappings").is_none());

        let portmap = att.plugin_config(&plugins[2], Some(&json!({"ips": []})));
        assert_eq!(portmap["runtimeConfig"]["portMappings"][0]["hostPort"], 8080);
        assert_eq!(portmap["prevResult"], json!({"ips": []}));
    }

    #[test]
    fn no_port_mappings_no_capability() {
        let dir = tempfile::tempdir().unwrap();
        let att = attachment(dir.path()).with_port_mappings(Vec::new());
        assert!(att.capability_args().is_empty());
    }

    #[test]
    fn bad_mac_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            attachment(dir.path()).with_mac("02:42"),
            Err(TopoError::InvalidMac { .. })
        ));
    }

    #[test]
    fn env_carries_call_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let att = attachment(dir.path()).with_netns(Some("/proc/42/ns/net".into()));
        let env = att.env(Command::Add);
        let get = |k: &str| env.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str());
        assert_eq!(get("CNI_COMMAND"), Some("ADD"));
        assert_eq!(get("CNI_CONTAINERID"), Some("clab-lab-srl1"));
        assert_eq!(get("CNI_NETNS"), Some("/proc/42/ns/net"));
        assert_eq!(get("CNI_IFNAME"), Some("eth0"));
    }
}
