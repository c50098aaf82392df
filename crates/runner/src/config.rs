use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use sandbox::{ResourceLimits, SecurityPolicy};
use sandbox_docker::{DockerConfig, Privilege};
use sandbox_pool::PoolConfig;
use serde::{Deserialize, Serialize};

use crate::cpp::CppSettings;
use crate::error::{RunnerError, RunnerResult};
use crate::python::PythonSettings;

pub(crate) const DEFAULT_PORT: u16 = 5001;
pub(crate) const DEFAULT_POOL_SIZE: usize = 5;
pub(crate) const DEFAULT_PYTHON_IMAGE: &str = "sidhu1651/kodikos-python";
pub(crate) const DEFAULT_CPP_IMAGE: &str = "cpp-runner";
pub(crate) const DEFAULT_IDLE_TIMEOUT_MS: u64 = 120_000;
pub(crate) const DEFAULT_EVICTION_INTERVAL_MS: u64 = 30_000;
pub(crate) const DEFAULT_ACQUIRE_ATTEMPTS: u32 = 50;
pub(crate) const DEFAULT_ACQUIRE_INTERVAL_MS: u64 = 100;
pub(crate) const DEFAULT_READY_DELAY_MS: u64 = 500;
pub(crate) const DEFAULT_PYTHON_TIMEOUT_MS: u64 = 6_000;
pub(crate) const DEFAULT_CPP_TIMEOUT_MS: u64 = 10_000;
pub(crate) const DEFAULT_PROGRAM_TIMEOUT_MS: u64 = 5_000;

fn keep_alive() -> Vec<String> {
    ["tail", "-f", "/dev/null"].map(String::from).to_vec()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub listen: SocketAddr,
    /// Key required on `/execute/*`. Unset means every request is accepted.
    pub api_key: Option<String>,
    pub docker: DockerSection,
    pub pool: PoolSection,
    pub python: PythonSection,
    pub cpp: CppSection,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            api_key: None,
            docker: DockerSection::default(),
            pool: PoolSection::default(),
            python: PythonSection::default(),
            cpp: CppSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerSection {
    pub binary: String,
    /// Prefix docker invocations with `sudo -n`.
    pub sudo: bool,
    pub pull_missing: bool,
    pub platform: Option<String>,
    pub ready_delay_ms: u64,
}

impl Default for DockerSection {
    fn default() -> Self {
        Self {
            binary: "docker".into(),
            sudo: false,
            pull_missing: true,
            platform: None,
            ready_delay_ms: DEFAULT_READY_DELAY_MS,
        }
    }
}

/// Pool behaviour shared by both languages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub idle_timeout_ms: u64,
    pub eviction_interval_ms: u64,
    pub acquire_attempts: u32,
    pub acquire_interval_ms: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            eviction_interval_ms: DEFAULT_EVICTION_INTERVAL_MS,
            acquire_attempts: DEFAULT_ACQUIRE_ATTEMPTS,
            acquire_interval_ms: DEFAULT_ACQUIRE_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    pub cpus: f64,
    pub memory_mb: u32,
    pub pids: u32,
}

impl Default for LimitsSection {
    fn default() -> Self {
        let limits = ResourceLimits::default();
        Self {
            cpus: limits.cpus,
            memory_mb: limits.memory_mb,
            pids: limits.pids,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PythonSection {
    pub image: String,
    pub size: usize,
    /// Command that keeps a pooled container alive.
    pub keep_alive: Vec<String>,
    pub read_only_rootfs: bool,
    pub limits: LimitsSection,
    /// Interpreter invocation; the program arrives on stdin.
    pub interpreter: Vec<String>,
    pub timeout_ms: u64,
}

impl Default for PythonSection {
    fn default() -> Self {
        Self {
            image: DEFAULT_PYTHON_IMAGE.into(),
            size: DEFAULT_POOL_SIZE,
            keep_alive: keep_alive(),
            read_only_rootfs: false,
            limits: LimitsSection::default(),
            interpreter: vec!["python3".into(), "-".into()],
            timeout_ms: DEFAULT_PYTHON_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CppSection {
    pub image: String,
    pub size: usize,
    pub keep_alive: Vec<String>,
    /// Compilation happens inside the container, so this needs a writable
    /// scratch mount when enabled.
    pub read_only_rootfs: bool,
    pub limits: LimitsSection,
    /// Extra `g++` flags placed before the source file.
    pub compiler_flags: Vec<String>,
    /// Bound on compile and run together.
    pub timeout_ms: u64,
    /// Bound on the program alone, enforced inside the container.
    pub program_timeout_ms: u64,
}

impl Default for CppSection {
    fn default() -> Self {
        Self {
            image: DEFAULT_CPP_IMAGE.into(),
            size: DEFAULT_POOL_SIZE,
            keep_alive: keep_alive(),
            read_only_rootfs: false,
            limits: LimitsSection::default(),
            compiler_flags: Vec::new(),
            timeout_ms: DEFAULT_CPP_TIMEOUT_MS,
            program_timeout_ms: DEFAULT_PROGRAM_TIMEOUT_MS,
        }
    }
}

/// Command-line and environment overrides applied on top of the YAML file.
#[derive(Debug, Default, Clone, Args)]
pub struct Overrides {
    /// YAML config file
    #[arg(long, env = "CODE_RUNNER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, env = "CODE_RUNNER_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Port to listen on (keeps the configured host)
    #[arg(long, env = "EXECUTION_SERVICE_PORT")]
    pub port: Option<u16>,

    /// API key required on /execute requests
    #[arg(long, env = "EXECUTION_SERVICE_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[arg(long, env = "PYTHON_POOL_SIZE")]
    pub python_pool_size: Option<usize>,

    #[arg(long, env = "CPP_POOL_SIZE")]
    pub cpp_pool_size: Option<usize>,

    #[arg(long, env = "PYTHON_DOCKER_IMAGE")]
    pub python_image: Option<String>,

    #[arg(long, env = "CPP_DOCKER_IMAGE")]
    pub cpp_image: Option<String>,

    /// Idle timeout for pooled containers, in milliseconds
    #[arg(long, env = "CONTAINER_IDLE_TIMEOUT")]
    pub idle_timeout_ms: Option<u64>,
}

/// Load a service config from a YAML file. Missing keys take their defaults.
///
/// Validation happens in [`resolve`], after overrides are applied.
pub async fn load(path: &Path) -> RunnerResult<ServiceConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RunnerError::Config(format!("read {}: {e}", path.display())))?;
    serde_yaml_ng::from_str(&content)
        .map_err(|e| RunnerError::Config(format!("parse {}: {e}", path.display())))
}

/// Build the effective config: YAML file (if any), then overrides, then validation.
pub async fn resolve(overrides: &Overrides) -> RunnerResult<ServiceConfig> {
    let mut config = match &overrides.config {
        Some(path) => load(path).await?,
        None => ServiceConfig::default(),
    };
    config.apply(overrides);
    config.validate()?;
    Ok(config)
}

impl ServiceConfig {
    pub fn apply(&mut self, o: &Overrides) {
        if let Some(listen) = o.listen {
            self.listen = listen;
        }
        if let Some(port) = o.port {
            self.listen.set_port(port);
        }
        if let Some(key) = &o.api_key {
            self.api_key = Some(key.clone()).filter(|k| !k.is_empty());
        }
        if let Some(size) = o.python_pool_size {
            self.python.size = size;
        }
        if let Some(size) = o.cpp_pool_size {
            self.cpp.size = size;
        }
        if let Some(image) = &o.python_image {
            self.python.image.clone_from(image);
        }
        if let Some(image) = &o.cpp_image {
            self.cpp.image.clone_from(image);
        }
        if let Some(ms) = o.idle_timeout_ms {
            self.pool.idle_timeout_ms = ms;
        }
    }

    pub fn validate(&self) -> RunnerResult<()> {
        let mut errors = Vec::new();

        for (name, size) in [("python.size", self.python.size), ("cpp.size", self.cpp.size)] {
            if size == 0 {
                errors.push(format!("{name} must be at least 1"));
            }
        }
        for (name, value) in [
            ("pool.idle_timeout_ms", self.pool.idle_timeout_ms),
            ("pool.eviction_interval_ms", self.pool.eviction_interval_ms),
            ("pool.acquire_interval_ms", self.pool.acquire_interval_ms),
            ("python.timeout_ms", self.python.timeout_ms),
            ("cpp.timeout_ms", self.cpp.timeout_ms),
            ("cpp.program_timeout_ms", self.cpp.program_timeout_ms),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be greater than 0"));
            }
        }
        if self.cpp.program_timeout_ms >= self.cpp.timeout_ms {
            errors.push("cpp.program_timeout_ms must be less than cpp.timeout_ms".into());
        }
        if self.python.interpreter.is_empty() {
            errors.push("python.interpreter must not be empty".into());
        }
        for (name, image) in [("python.image", &self.python.image), ("cpp.image", &self.cpp.image)] {
            if image.trim().is_empty() {
                errors.push(format!("{name} must not be empty"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RunnerError::Config(errors.join("; ")))
        }
    }

    pub fn docker_config(&self) -> DockerConfig {
        DockerConfig {
            binary: self.docker.binary.clone(),
            privilege: if self.docker.sudo {
                Privilege::Sudo
            } else {
                Privilege::User
            },
            pull_missing: self.docker.pull_missing,
            platform: self.docker.platform.clone(),
            ready_delay: Duration::from_millis(self.docker.ready_delay_ms),
        }
    }

    pub fn python_pool(&self) -> PoolConfig {
        let p = &self.python;
        self.pool_config("python", &p.image, p.size, &p.keep_alive, p.read_only_rootfs, &p.limits)
    }

    pub fn cpp_pool(&self) -> PoolConfig {
        let c = &self.cpp;
        self.pool_config("cpp", &c.image, c.size, &c.keep_alive, c.read_only_rootfs, &c.limits)
    }

    pub fn python_settings(&self) -> PythonSettings {
        PythonSettings {
            interpreter: self.python.interpreter.clone(),
            timeout: Duration::from_millis(self.python.timeout_ms),
        }
    }

    pub fn cpp_settings(&self) -> CppSettings {
        CppSettings {
            compiler_flags: self.cpp.compiler_flags.clone(),
            timeout: Duration::from_millis(self.cpp.timeout_ms),
            program_timeout: Duration::from_millis(self.cpp.program_timeout_ms),
        }
    }

    fn pool_config(
        &self,
        name: &str,
        image: &str,
        size: usize,
        keep_alive: &[String],
        read_only_rootfs: bool,
        limits: &LimitsSection,
    ) -> PoolConfig {
        PoolConfig {
            command: keep_alive.to_vec(),
            policy: SecurityPolicy {
                read_only_rootfs,
                limits: ResourceLimits {
                    cpus: limits.cpus,
                    memory_mb: limits.memory_mb,
                    pids: limits.pids,
                },
                ..SecurityPolicy::default()
            },
            size,
            idle_timeout: Duration::from_millis(self.pool.idle_timeout_ms),
            eviction_interval: Duration::from_millis(self.pool.eviction_interval_ms),
            acquire_attempts: self.pool.acquire_attempts,
            acquire_interval: Duration::from_millis(self.pool.acquire_interval_ms),
            ..PoolConfig::new(name, image)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_config(dir: &Path, yaml: &str) -> PathBuf {
        let path = dir.join("code-runner.yaml");
        tokio::fs::write(&path, yaml).await.unwrap();
        path
    }

    #[tokio::test]
    async fn load_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"
listen: 127.0.0.1:8080
api_key: secret
docker:
  binary: /usr/local/bin/docker
  sudo: true
  pull_missing: false
  platform: linux/amd64
  ready_delay_ms: 0
pool:
  idle_timeout_ms: 60000
  eviction_interval_ms: 10000
  acquire_attempts: 10
  acquire_interval_ms: 50
python:
  image: my/python
  size: 3
  read_only_rootfs: true
  limits:
    cpus: 1.5
    memory_mb: 512
    pids: 64
  timeout_ms: 8000
cpp:
  image: my/cpp
  size: 2
  compiler_flags: ["-O2", "-std=c++17"]
  timeout_ms: 12000
  program_timeout_ms: 4000
"#,
        )
        .await;

        let config = load(&path).await.unwrap();
        assert_eq!(config.listen, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert!(config.docker.sudo);
        assert_eq!(config.python.size, 3);
        assert_eq!(config.cpp.compiler_flags, vec!["-O2", "-std=c++17"]);

        let python = config.python_pool();
        assert_eq!(python.name, "python");
        assert_eq!(python.image, "my/python");
        assert!(python.policy.read_only_rootfs);
        assert_eq!(python.policy.limits.memory_mb, 512);
        assert_eq!(python.idle_timeout, Duration::from_secs(60));
        assert_eq!(python.acquire_attempts, 10);

        let cpp = config.cpp_pool();
        assert!(!cpp.policy.read_only_rootfs);
        assert_eq!(cpp.size, 2);

        let docker = config.docker_config();
        assert_eq!(docker.privilege, Privilege::Sudo);
        assert_eq!(docker.platform.as_deref(), Some("linux/amd64"));
        assert_eq!(docker.ready_delay, Duration::ZERO);

        assert_eq!(config.cpp_settings().program_timeout, Duration::from_secs(4));
    }

    #[tokio::test]
    async fn missing_sections_take_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "cpp:\n  size: 1\n").await;

        let config = load(&path).await.unwrap();
        assert_eq!(config.listen.port(), DEFAULT_PORT);
        assert!(config.api_key.is_none());
        assert_eq!(config.cpp.size, 1);
        assert_eq!(config.cpp.image, DEFAULT_CPP_IMAGE);
        assert_eq!(config.cpp.program_timeout_ms, DEFAULT_PROGRAM_TIMEOUT_MS);
        assert_eq!(config.python, PythonSection::default());
        assert_eq!(config.pool, PoolSection::default());
    }

    #[tokio::test]
    async fn load_rejects_unparseable_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "python: 42\n").await;
        let err = load(&path).await.unwrap_err();
        assert!(err.to_string().contains("parse"), "got: {err}");
    }

    #[tokio::test]
    async fn load_reports_missing_file() {
        let err = load(Path::new("/nonexistent/code-runner.yaml"))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Config(_)), "got: {err}");
    }

    #[tokio::test]
    async fn resolve_without_file_uses_defaults() {
        let config = resolve(&Overrides::default()).await.unwrap();
        assert_eq!(config, ServiceConfig::default());
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = ServiceConfig::default();
        assert_eq!(config.listen, "0.0.0.0:5001".parse().unwrap());
        assert_eq!(config.python.image, "sidhu1651/kodikos-python");
        assert_eq!(config.cpp.image, "cpp-runner");
        assert_eq!(config.python.size, 5);
        assert_eq!(config.cpp.size, 5);
        assert_eq!(config.python.timeout_ms, 6_000);
        assert_eq!(config.cpp.timeout_ms, 10_000);
        assert_eq!(config.cpp.program_timeout_ms, 5_000);
        assert_eq!(config.pool.idle_timeout_ms, 120_000);
        assert_eq!(config.pool.eviction_interval_ms, 30_000);
        assert!(!config.python.read_only_rootfs);
        assert!(!config.cpp.read_only_rootfs);
        config.validate().unwrap();
    }

    #[test]
    fn overrides_take_precedence() {
        let mut config = ServiceConfig::default();
        config.apply(&Overrides {
            port: Some(6000),
            api_key: Some("k".into()),
            python_pool_size: Some(2),
            cpp_pool_size: Some(7),
            python_image: Some("py:latest".into()),
            cpp_image: Some("gcc:latest".into()),
            idle_timeout_ms: Some(1_000),
            ..Overrides::default()
        });

        assert_eq!(config.listen, "0.0.0.0:6000".parse().unwrap());
        assert_eq!(config.api_key.as_deref(), Some("k"));
        assert_eq!(config.python.size, 2);
        assert_eq!(config.cpp.size, 7);
        assert_eq!(config.python.image, "py:latest");
        assert_eq!(config.cpp.image, "gcc:latest");
        assert_eq!(config.python_pool().idle_timeout, Duration::from_secs(1));
    }

    #[test]
    fn empty_api_key_override_disables_auth() {
        let mut config = ServiceConfig {
            api_key: Some("old".into()),
            ..ServiceConfig::default()
        };
        config.apply(&Overrides {
            api_key: Some(String::new()),
            ..Overrides::default()
        });
        assert!(config.api_key.is_none());
    }

    #[test]
    fn validate_collects_every_problem() {
        let mut config = ServiceConfig::default();
        config.python.size = 0;
        config.cpp.timeout_ms = 3_000;
        config.pool.idle_timeout_ms = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("python.size"), "{err}");
        assert!(err.contains("program_timeout_ms"), "{err}");
        assert!(err.contains("idle_timeout_ms"), "{err}");
    }
}
