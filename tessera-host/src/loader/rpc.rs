//! Subprocess RPC backend
//!
//! Runs plugins as child processes. The host picks a loopback address,
//! injects it through `PLUGIN_RPC_ADDRESS`, spawns the executable and then
//! dials the address with bounded retries. Calls are newline-delimited JSON
//! frames with sequential ids over a single connection; a background
//! heartbeat task marks the process unhealthy when pings fail or go stale.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use tessera_plugin_api::{
    BackendKind, HealthStatus, Plugin, PluginContext, PluginError, PluginInfo, PluginMetrics,
};

use super::{LoadedPlugin, LoaderError, PluginLoader};

/// Environment variable carrying the address the plugin must listen on
pub const RPC_ADDRESS_ENV: &str = "PLUGIN_RPC_ADDRESS";

/// Configuration for the RPC loader
#[derive(Debug, Clone)]
pub struct RpcLoaderConfig {
    /// Connect attempts before giving up on a freshly spawned process
    pub max_retries: u32,
    /// Delay between connect attempts
    pub retry_delay: Duration,
    /// Per-request read deadline
    pub request_timeout: Duration,
    /// Interval between heartbeat pings
    pub heartbeat_interval: Duration,
    /// A heartbeat older than this marks the process unhealthy
    pub staleness_threshold: Duration,
}

impl Default for RpcLoaderConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            retry_delay: Duration::from_millis(200),
            request_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            staleness_threshold: Duration::from_secs(90),
        }
    }
}

/// Optional process settings read from a `<artifact>.config.json` sidecar
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcessConfig {
    /// Executable to run instead of the artifact itself
    #[serde(default)]
    pub executable: Option<PathBuf>,
    /// Arguments passed to the process
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the process
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
}

impl ProcessConfig {
    /// Load the sidecar for an artifact, if one exists
    pub fn for_artifact(path: &Path) -> Result<Self, LoaderError> {
        let sidecar = PathBuf::from(format!("{}.config.json", path.display()));
        if !sidecar.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&sidecar)?;
        serde_json::from_str(&content).map_err(|e| LoaderError::InvalidFormat {
            reason: format!("sidecar config is invalid: {e}"),
        })
    }
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    id: u64,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

/// One JSON-line call channel to a plugin process.
///
/// A single mutex covers write and read so requests and responses stay
/// paired; ids are checked anyway to catch a desynchronized peer.
pub struct RpcChannel {
    stream: Mutex<(BufReader<TcpStream>, TcpStream)>,
    seq: AtomicU64,
}

impl RpcChannel {
    /// Wrap a connected stream
    pub fn new(stream: TcpStream, request_timeout: Duration) -> std::io::Result<Self> {
        stream.set_read_timeout(Some(request_timeout))?;
        let writer = stream.try_clone()?;
        Ok(Self {
            stream: Mutex::new((BufReader::new(stream), writer)),
            seq: AtomicU64::new(1),
        })
    }

    /// Issue one request and wait for its response
    pub fn request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, PluginError> {
        let id = self.seq.fetch_add(1, Ordering::SeqCst);
        let frame = serde_json::to_string(&RpcRequest { id, method, params })?;

        let mut guard = self.stream.lock().expect("rpc channel poisoned");
        let (reader, writer) = &mut *guard;

        writer
            .write_all(frame.as_bytes())
            .and_then(|_| writer.write_all(b"\n"))
            .map_err(|e| PluginError::Internal(format!("rpc write failed: {e}")))?;

        let mut line = String::new();
        reader
            .read_line(&mut line)
            .map_err(|e| PluginError::Internal(format!("rpc read failed: {e}")))?;
        if line.is_empty() {
            return Err(PluginError::Internal("rpc peer closed connection".to_string()));
        }

        let response: RpcResponse = serde_json::from_str(&line)?;
        if response.id != id {
            return Err(PluginError::Internal(format!(
                "rpc response id mismatch: sent {id}, got {}",
                response.id
            )));
        }
        if let Some(error) = response.error {
            return Err(PluginError::Internal(error));
        }
        Ok(response.result.unwrap_or(serde_json::Value::Null))
    }
}

/// Plugin contract satisfied by forwarding calls over the channel
pub struct RpcPlugin {
    channel: Arc<RpcChannel>,
    info: PluginInfo,
    capabilities: Vec<String>,
    dependencies: Vec<String>,
    config: serde_json::Map<String, serde_json::Value>,
}

impl RpcPlugin {
    fn handshake(
        channel: Arc<RpcChannel>,
        path: &Path,
    ) -> Result<Self, LoaderError> {
        let info_value = channel
            .request("info", serde_json::json!({}))
            .map_err(|e| LoaderError::Backend(format!("info call failed: {e}")))?;
        let mut info: PluginInfo =
            serde_json::from_value(info_value).map_err(|e| LoaderError::InvalidFormat {
                reason: format!("plugin reported invalid info: {e}"),
            })?;
        if info.id.is_empty() {
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("plugin");
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            info.id = format!("{stem}-{}", &suffix[..8]);
        }
        info.kind = BackendKind::Rpc;
        info.path = path.to_path_buf();

        // Optional handshake calls; older plugins may not implement them
        let capabilities = channel
            .request("capabilities", serde_json::json!({}))
            .ok()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let dependencies = channel
            .request("dependencies", serde_json::json!({}))
            .ok()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        Ok(Self {
            channel,
            info,
            capabilities,
            dependencies,
            config: serde_json::Map::new(),
        })
    }
}

impl Plugin for RpcPlugin {
    fn info(&self) -> PluginInfo {
        self.info.clone()
    }

    fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }

    fn initialize(&mut self, ctx: &PluginContext) -> Result<(), PluginError> {
        self.config = ctx.config().clone();
        self.channel.request(
            "initialize",
            serde_json::Value::Object(self.config.clone()),
        )?;
        Ok(())
    }

    fn start(&mut self) -> Result<(), PluginError> {
        self.channel.request("start", serde_json::json!({}))?;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), PluginError> {
        self.channel.request("stop", serde_json::json!({}))?;
        Ok(())
    }

    fn cleanup(&mut self) -> Result<(), PluginError> {
        self.channel.request("cleanup", serde_json::json!({}))?;
        Ok(())
    }

    fn health_check(&self) -> Result<HealthStatus, PluginError> {
        let value = self.channel.request("health_check", serde_json::json!({}))?;
        Ok(serde_json::from_value(value)?)
    }

    fn metrics(&self) -> Result<PluginMetrics, PluginError> {
        let value = self.channel.request("metrics", serde_json::json!({}))?;
        Ok(serde_json::from_value(value)?)
    }

    fn get_config(&self) -> serde_json::Map<String, serde_json::Value> {
        self.config.clone()
    }

    fn set_config(
        &mut self,
        config: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), PluginError> {
        self.channel
            .request("set_config", serde_json::Value::Object(config.clone()))?;
        self.config = config;
        Ok(())
    }
}

struct ProcessRecord {
    plugin: LoadedPlugin,
    child: Mutex<Child>,
    healthy: Arc<AtomicBool>,
    last_success: Arc<StdRwLock<Instant>>,
    cancel: CancellationToken,
}

impl ProcessRecord {
    fn kill(&self) {
        self.cancel.cancel();
        let mut child = self.child.lock().expect("child poisoned");
        if let Err(e) = child.kill() {
            tracing::debug!(plugin = %self.plugin.id, error = %e, "kill failed (already exited?)");
        }
        let _ = child.wait();
    }
}

fn kill_child(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Update heartbeat bookkeeping after one ping.
///
/// A failed ping marks the record unhealthy. A success marks it healthy
/// again and resets the staleness clock, with a note when the previous
/// success was already past the threshold.
fn note_heartbeat(
    healthy: &AtomicBool,
    last_success: &StdRwLock<Instant>,
    ok: bool,
    staleness: Duration,
) {
    if !ok {
        healthy.store(false, Ordering::SeqCst);
        return;
    }
    let stale = last_success
        .read()
        .expect("heartbeat clock poisoned")
        .elapsed()
        >= staleness;
    *last_success.write().expect("heartbeat clock poisoned") = Instant::now();
    if stale {
        tracing::warn!("heartbeat recovered after staleness window");
    }
    healthy.store(true, Ordering::SeqCst);
}

/// A record is healthy only if its last ping succeeded and the last success
/// is still inside the staleness window. The clock side catches a process
/// whose pings hang instead of failing.
fn heartbeat_is_healthy(
    healthy: &AtomicBool,
    last_success: &StdRwLock<Instant>,
    staleness: Duration,
) -> bool {
    healthy.load(Ordering::SeqCst)
        && last_success
            .read()
            .expect("heartbeat clock poisoned")
            .elapsed()
            < staleness
}

/// Loader for subprocess RPC plugins
pub struct RpcLoader {
    config: RpcLoaderConfig,
    processes: RwLock<HashMap<String, ProcessRecord>>,
}

impl RpcLoader {
    /// Create a loader with the given configuration
    pub fn new(config: RpcLoaderConfig) -> Self {
        Self {
            config,
            processes: RwLock::new(HashMap::new()),
        }
    }

    /// Whether a plugin's process passed its most recent heartbeat and that
    /// heartbeat is not stale
    pub async fn is_healthy(&self, id: &str) -> Option<bool> {
        self.processes.read().await.get(id).map(|r| {
            heartbeat_is_healthy(&r.healthy, &r.last_success, self.config.staleness_threshold)
        })
    }

    fn pick_address() -> Result<String, LoaderError> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        drop(listener);
        Ok(addr.to_string())
    }

    fn spawn_process(
        path: &Path,
        process_config: &ProcessConfig,
        address: &str,
    ) -> Result<Child, LoaderError> {
        let executable = process_config
            .executable
            .clone()
            .unwrap_or_else(|| path.to_path_buf());

        let mut command = Command::new(&executable);
        command
            .args(&process_config.args)
            .env(RPC_ADDRESS_ENV, address)
            .envs(&process_config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(dir) = &process_config.work_dir {
            command.current_dir(dir);
        }

        command.spawn().map_err(|e| {
            LoaderError::Backend(format!(
                "failed to spawn {}: {e}",
                executable.display()
            ))
        })
    }

    async fn connect_with_retries(&self, address: &str) -> Result<TcpStream, LoaderError> {
        let mut attempt = 0;
        loop {
            match TcpStream::connect(address) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.config.max_retries {
                        return Err(LoaderError::Backend(format!(
                            "could not connect to plugin at {address} after {attempt} attempts: {e}"
                        )));
                    }
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }
    }

    fn spawn_heartbeat(
        &self,
        id: String,
        channel: Arc<RpcChannel>,
        healthy: Arc<AtomicBool>,
        last_success: Arc<StdRwLock<Instant>>,
        cancel: CancellationToken,
    ) {
        let interval = self.config.heartbeat_interval;
        let staleness = self.config.staleness_threshold;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // first tick fires immediately

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!(plugin = %id, "heartbeat stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let channel = channel.clone();
                        let ok = tokio::task::spawn_blocking(move || {
                            channel
                                .request("health_check", serde_json::json!({}))
                                .ok()
                                .and_then(|v| serde_json::from_value::<HealthStatus>(v).ok())
                                .is_some_and(|h| h.is_healthy())
                        })
                        .await
                        .unwrap_or(false);

                        if !ok {
                            tracing::warn!(plugin = %id, "heartbeat failed");
                        }
                        note_heartbeat(&healthy, &last_success, ok, staleness);
                    }
                }
            }
        });
    }
}

impl Default for RpcLoader {
    fn default() -> Self {
        Self::new(RpcLoaderConfig::default())
    }
}

#[async_trait]
impl PluginLoader for RpcLoader {
    fn kind(&self) -> BackendKind {
        BackendKind::Rpc
    }

    fn validate(&self, path: &Path) -> Result<(), LoaderError> {
        if !path.exists() {
            return Err(LoaderError::NotFound {
                path: path.to_path_buf(),
            });
        }
        // The sidecar must parse if present; executability is only provable
        // by running the process.
        ProcessConfig::for_artifact(path).map(|_| ())
    }

    async fn load(&self, path: &Path) -> Result<LoadedPlugin, LoaderError> {
        if !path.exists() {
            return Err(LoaderError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let process_config = ProcessConfig::for_artifact(path)?;
        let address = Self::pick_address()?;
        let mut child = Self::spawn_process(path, &process_config, &address)?;
        tracing::info!(
            path = %path.display(),
            address = %address,
            pid = child.id(),
            "spawned plugin process"
        );

        let stream = match self.connect_with_retries(&address).await {
            Ok(stream) => stream,
            Err(e) => {
                kill_child(&mut child);
                return Err(e);
            }
        };
        let channel = match RpcChannel::new(stream, self.config.request_timeout) {
            Ok(channel) => Arc::new(channel),
            Err(e) => {
                kill_child(&mut child);
                return Err(LoaderError::Io(e));
            }
        };

        // Liveness probe before the instance is usable
        let probe = {
            let channel = channel.clone();
            tokio::task::spawn_blocking(move || {
                channel.request("health_check", serde_json::json!({}))
            })
            .await
        };
        match probe {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                kill_child(&mut child);
                return Err(LoaderError::Backend(format!("liveness probe failed: {e}")));
            }
            Err(e) => {
                kill_child(&mut child);
                return Err(LoaderError::Backend(format!("liveness probe panicked: {e}")));
            }
        }

        let instance = match RpcPlugin::handshake(channel.clone(), path) {
            Ok(instance) => instance,
            Err(e) => {
                kill_child(&mut child);
                return Err(e);
            }
        };
        let id = instance.info.id.clone();

        let mut processes = self.processes.write().await;
        if processes.contains_key(&id) {
            kill_child(&mut child);
            return Err(LoaderError::AlreadyLoaded { id });
        }

        let plugin = LoadedPlugin::new(
            id.clone(),
            path.to_path_buf(),
            BackendKind::Rpc,
            Arc::new(Mutex::new(Box::new(instance) as Box<dyn Plugin>)),
        )
        .with_pid(child.id());

        let healthy = Arc::new(AtomicBool::new(true));
        let last_success = Arc::new(StdRwLock::new(Instant::now()));
        let cancel = CancellationToken::new();
        self.spawn_heartbeat(
            id.clone(),
            channel,
            healthy.clone(),
            last_success.clone(),
            cancel.clone(),
        );

        processes.insert(
            id.clone(),
            ProcessRecord {
                plugin: plugin.clone(),
                child: Mutex::new(child),
                healthy,
                last_success,
                cancel,
            },
        );
        tracing::info!(plugin = %id, "loaded rpc plugin");
        Ok(plugin)
    }

    async fn unload(&self, id: &str) -> Result<(), LoaderError> {
        let record = self
            .processes
            .write()
            .await
            .remove(id)
            .ok_or_else(|| LoaderError::NotLoaded { id: id.to_string() })?;
        record.kill();
        tracing::info!(plugin = %id, "unloaded rpc plugin");
        Ok(())
    }

    async fn reload(&self, id: &str) -> Result<(), LoaderError> {
        let path = {
            let processes = self.processes.read().await;
            processes
                .get(id)
                .map(|r| r.plugin.path.clone())
                .ok_or_else(|| LoaderError::NotLoaded { id: id.to_string() })?
        };
        self.unload(id).await?;
        self.load(&path).await.map(|_| ())
    }

    async fn loaded(&self) -> Vec<String> {
        self.processes.read().await.keys().cloned().collect()
    }

    async fn shutdown(&self) {
        let mut processes = self.processes.write().await;
        for (id, record) in processes.drain() {
            tracing::debug!(plugin = %id, "killing plugin process");
            record.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::net::TcpListener;

    /// Serve one connection, answering every request with a canned handler
    fn spawn_mock_server(
        handler: impl Fn(&str, serde_json::Value) -> Result<serde_json::Value, String>
        + Send
        + 'static,
    ) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap_or(0) == 0 {
                    break;
                }
                let request: serde_json::Value = serde_json::from_str(&line).unwrap();
                let id = request["id"].as_u64().unwrap();
                let method = request["method"].as_str().unwrap().to_string();
                let params = request["params"].clone();
                let frame = match handler(&method, params) {
                    Ok(result) => serde_json::json!({"id": id, "result": result}),
                    Err(error) => serde_json::json!({"id": id, "error": error}),
                };
                writeln!(writer, "{frame}").unwrap();
            }
        });
        addr
    }

    fn connect(addr: &str) -> RpcChannel {
        let stream = TcpStream::connect(addr).unwrap();
        RpcChannel::new(stream, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_channel_request_response() {
        let addr = spawn_mock_server(|method, params| {
            assert_eq!(method, "echo");
            Ok(params)
        });
        let channel = connect(&addr);

        let result = channel
            .request("echo", serde_json::json!({"n": 7}))
            .unwrap();
        assert_eq!(result["n"], 7);
    }

    #[test]
    fn test_channel_sequential_ids_stay_paired() {
        let addr = spawn_mock_server(|_, params| Ok(params));
        let channel = connect(&addr);

        for n in 0..5 {
            let result = channel
                .request("echo", serde_json::json!({"n": n}))
                .unwrap();
            assert_eq!(result["n"], n);
        }
    }

    #[test]
    fn test_channel_error_frame() {
        let addr = spawn_mock_server(|_, _| Err("plugin exploded".to_string()));
        let channel = connect(&addr);

        let err = channel.request("start", serde_json::json!({})).unwrap_err();
        assert!(err.to_string().contains("plugin exploded"));
    }

    #[test]
    fn test_channel_peer_close_is_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });
        let channel = connect(&addr);

        // Either the write or the read observes the closed peer
        assert!(channel.request("start", serde_json::json!({})).is_err());
    }

    #[test]
    fn test_rpc_plugin_over_mock_server() {
        let addr = spawn_mock_server(|method, _| match method {
            "info" => Ok(serde_json::json!({"id": "remote", "name": "Remote", "version": "2.0.0"})),
            "capabilities" => Ok(serde_json::json!(["search"])),
            "dependencies" => Ok(serde_json::json!([])),
            "health_check" => Ok(serde_json::json!({"status": "healthy"})),
            "start" | "stop" => Ok(serde_json::json!(null)),
            other => Err(format!("unknown method {other}")),
        });
        let channel = Arc::new(connect(&addr));

        let mut plugin =
            RpcPlugin::handshake(channel, Path::new("/plugins/remote")).unwrap();
        assert_eq!(plugin.info().id, "remote");
        assert_eq!(plugin.info().kind, BackendKind::Rpc);
        assert_eq!(plugin.capabilities(), vec!["search"]);
        assert_eq!(plugin.health_check().unwrap(), HealthStatus::Healthy);
        assert!(plugin.start().is_ok());
        assert!(plugin.stop().is_ok());
    }

    #[test]
    fn test_handshake_generates_id_when_missing() {
        let addr = spawn_mock_server(|method, _| match method {
            "info" => Ok(serde_json::json!({})),
            _ => Ok(serde_json::json!(null)),
        });
        let channel = Arc::new(connect(&addr));

        let plugin =
            RpcPlugin::handshake(channel, Path::new("/plugins/widget-svc")).unwrap();
        assert!(plugin.info.id.starts_with("widget-svc-"));
        assert_eq!(plugin.info.id.len(), "widget-svc-".len() + 8);
    }

    #[test]
    fn test_note_heartbeat_flips_health() {
        let healthy = AtomicBool::new(true);
        let last = StdRwLock::new(Instant::now());

        note_heartbeat(&healthy, &last, false, Duration::from_secs(90));
        assert!(!healthy.load(Ordering::SeqCst));

        note_heartbeat(&healthy, &last, true, Duration::from_secs(90));
        assert!(healthy.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stale_heartbeat_reads_unhealthy() {
        let staleness = Duration::from_millis(50);
        let healthy = AtomicBool::new(true);
        let last = StdRwLock::new(Instant::now() - Duration::from_millis(200));

        // The ping flag alone is not enough once the clock goes stale,
        // covering a process whose pings hang instead of failing
        assert!(!heartbeat_is_healthy(&healthy, &last, staleness));

        // A fresh success resets the clock and recovers
        note_heartbeat(&healthy, &last, true, staleness);
        assert!(heartbeat_is_healthy(&healthy, &last, staleness));

        // A failed ping is unhealthy even with a fresh clock
        note_heartbeat(&healthy, &last, false, staleness);
        assert!(!heartbeat_is_healthy(&healthy, &last, staleness));
    }

    #[tokio::test]
    async fn test_connect_succeeds_after_delayed_bind() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        // The listener only comes up a few retry windows in
        let bind_addr = addr.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            let listener = TcpListener::bind(&bind_addr).unwrap();
            let _ = listener.accept();
        });

        let loader = RpcLoader::new(RpcLoaderConfig {
            max_retries: 40,
            retry_delay: Duration::from_millis(25),
            ..RpcLoaderConfig::default()
        });
        assert!(loader.connect_with_retries(&addr).await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_retries_exhausted_is_backend_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let loader = RpcLoader::new(RpcLoaderConfig {
            max_retries: 3,
            retry_delay: Duration::from_millis(5),
            ..RpcLoaderConfig::default()
        });
        let err = loader.connect_with_retries(&addr).await.unwrap_err();
        assert!(matches!(err, LoaderError::Backend(_)));
        assert!(err.to_string().contains("3 attempts"));
    }

    #[test]
    fn test_sidecar_missing_is_default() {
        let config = ProcessConfig::for_artifact(Path::new("/plugins/none")).unwrap();
        assert!(config.executable.is_none());
        assert!(config.args.is_empty());
    }

    #[test]
    fn test_sidecar_parses() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("svc");
        std::fs::write(&artifact, b"").unwrap();
        std::fs::write(
            dir.path().join("svc.config.json"),
            serde_json::json!({
                "executable": "/usr/bin/python3",
                "args": ["svc.py"],
                "env": {"MODE": "test"}
            })
            .to_string(),
        )
        .unwrap();

        let config = ProcessConfig::for_artifact(&artifact).unwrap();
        assert_eq!(config.executable.as_deref(), Some(Path::new("/usr/bin/python3")));
        assert_eq!(config.args, vec!["svc.py"]);
        assert_eq!(config.env.get("MODE").map(String::as_str), Some("test"));
    }

    #[test]
    fn test_sidecar_invalid_json_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("svc");
        std::fs::write(&artifact, b"").unwrap();
        std::fs::write(dir.path().join("svc.config.json"), b"{broken").unwrap();

        let err = ProcessConfig::for_artifact(&artifact).unwrap_err();
        assert!(matches!(err, LoaderError::InvalidFormat { .. }));
    }

    #[tokio::test]
    async fn test_load_missing_artifact() {
        let loader = RpcLoader::default();
        let err = loader.load(Path::new("/missing-exe")).await.unwrap_err();
        assert!(matches!(err, LoaderError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_unload_unknown_id() {
        let loader = RpcLoader::default();
        let err = loader.unload("ghost").await.unwrap_err();
        assert!(matches!(err, LoaderError::NotLoaded { .. }));
    }
}
