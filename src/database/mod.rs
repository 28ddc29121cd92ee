//! Database engine lifecycle and provisioning
//!
//! Keeps the engine's data on an operator-chosen persistent path, starts and
//! stops the engine (the stop is tied to [`EngineGuard`]'s drop), waits for
//! it to accept connections and provisions the target database.

mod cluster;

pub use cluster::{link_data_dir, ClusterInfo, LinkOutcome, VERSION_MARKER};

use crate::config::PollSettings;
use crate::error::{PipelineError, PipelineResult};
use crate::process::{CommandRunner, CommandSpec};
use crate::util::poll_until;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Extensions every rendering database needs.
pub const REQUIRED_EXTENSIONS: &[&str] = &["postgis", "hstore"];
const DATABASE_ENCODING: &str = "UTF8";
const MAINTENANCE_DB: &str = "postgres";

pub struct DatabaseManager {
    runner: Arc<dyn CommandRunner>,
    db_user: String,
}

impl DatabaseManager {
    pub fn new(runner: Arc<dyn CommandRunner>, db_user: impl Into<String>) -> Self {
        Self {
            runner,
            db_user: db_user.into(),
        }
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    pub async fn detect_cluster(&self) -> PipelineResult<ClusterInfo> {
        let out = self
            .runner
            .output(&CommandSpec::new("pg_lsclusters").arg("--no-header"))
            .await
            .map_err(|e| {
                PipelineError::precondition(format!("Cannot query database engine clusters: {:#}", e))
            })?;
        if !out.success() {
            return Err(PipelineError::precondition(format!(
                "pg_lsclusters exited with status {}: {}",
                out.code,
                out.stderr.trim()
            )));
        }
        let cluster = ClusterInfo::parse_lsclusters(&out.stdout)?;
        debug!(
            version = %cluster.version,
            cluster = %cluster.name,
            data_dir = %cluster.data_dir.display(),
            "Detected database engine cluster"
        );
        Ok(cluster)
    }

    /// Points the engine's default data directory at `data_root`, seeding it
    /// on first use.
    pub async fn prepare_data_dir(
        &self,
        cluster: &ClusterInfo,
        data_root: &Path,
    ) -> PipelineResult<LinkOutcome> {
        let outcome = link_data_dir(&cluster.data_dir, data_root)?;

        if outcome.seeded {
            let owner = format!("{0}:{0}", cluster.owner);
            let chown = CommandSpec::new("chown")
                .args(["-R", owner.as_str()])
                .path_arg(data_root);
            let code = self.runner.output(&chown).await?.code;
            if code != 0 {
                return Err(PipelineError::tool_failed("chown of persistent data directory", code));
            }
        }

        Ok(outcome)
    }

    /// Starts the engine and waits until it accepts connections. The returned
    /// guard stops the engine when dropped, including when readiness fails.
    pub async fn start_engine(
        &self,
        cluster: &ClusterInfo,
        ready: PollSettings,
    ) -> PipelineResult<EngineGuard> {
        info!(version = %cluster.version, cluster = %cluster.name, "Starting database engine");
        let start = pg_ctlcluster(cluster, "start");
        let code = self.runner.output(&start).await?.code;
        if code != 0 {
            return Err(PipelineError::tool_failed("database engine start", code));
        }

        let guard = EngineGuard {
            runner: self.runner.clone(),
            stop: pg_ctlcluster(cluster, "stop"),
            stopped: false,
        };

        self.wait_ready(ready).await?;
        info!("Database engine ready");
        Ok(guard)
    }

    pub async fn wait_ready(&self, ready: PollSettings) -> PipelineResult<u32> {
        let probe = CommandSpec::new("pg_isready").args(["-q", "-U", self.db_user.as_str()]);
        let runner = self.runner.clone();
        poll_until("database engine", ready, || {
            let runner = runner.clone();
            let probe = probe.clone();
            async move {
                matches!(runner.output(&probe).await, Ok(out) if out.success())
            }
        })
        .await
    }

    pub async fn database_exists(&self, name: &str) -> PipelineResult<bool> {
        let query = format!("SELECT 1 FROM pg_database WHERE datname = '{}'", name);
        let out = self
            .runner
            .output(&self.psql(MAINTENANCE_DB).args(["-tAc", query.as_str()]))
            .await?;
        if !out.success() {
            return Err(PipelineError::tool_failed("database existence check", out.code));
        }
        Ok(out.stdout.trim() == "1")
    }

    /// Drops `name` first when `reset` is set, creates it if missing and
    /// enables [`REQUIRED_EXTENSIONS`]. Repeated calls without `reset` are no-ops.
    pub async fn ensure_database(&self, name: &str, reset: bool) -> PipelineResult<()> {
        let mut exists = self.database_exists(name).await?;

        if reset && exists {
            warn!(database = name, "Reset requested, dropping database");
            self.run_step(
                "dropdb",
                CommandSpec::new("dropdb").args(["-U", self.db_user.as_str(), name]),
            )
            .await?;
            exists = false;
        }

        if !exists {
            info!(database = name, encoding = DATABASE_ENCODING, "Creating database");
            self.run_step(
                "createdb",
                CommandSpec::new("createdb").args([
                    "-U",
                    self.db_user.as_str(),
                    "-E",
                    DATABASE_ENCODING,
                    "-T",
                    "template0",
                    name,
                ]),
            )
            .await?;
        } else {
            debug!(database = name, "Database already exists");
        }

        let sql = REQUIRED_EXTENSIONS
            .iter()
            .map(|ext| format!("CREATE EXTENSION IF NOT EXISTS {};", ext))
            .collect::<Vec<_>>()
            .join(" ");
        self.run_step("enable extensions", self.psql(name).args(["-c", sql.as_str()]))
            .await?;

        Ok(())
    }

    /// `psql` connected to `database` as the configured user, failing on the first error.
    pub fn psql(&self, database: &str) -> CommandSpec {
        CommandSpec::new("psql").args([
            "-U",
            self.db_user.as_str(),
            "-d",
            database,
            "-v",
            "ON_ERROR_STOP=1",
        ])
    }

    async fn run_step(&self, step: &str, spec: CommandSpec) -> PipelineResult<()> {
        let out = self.runner.output(&spec).await?;
        if !out.success() {
            error!(step, code = out.code, stderr = %out.stderr.trim(), "Database step failed");
            return Err(PipelineError::tool_failed(step, out.code));
        }
        Ok(())
    }
}

fn pg_ctlcluster(cluster: &ClusterInfo, action: &str) -> CommandSpec {
    CommandSpec::new("pg_ctlcluster").args([cluster.version.as_str(), cluster.name.as_str(), action])
}

/// Stops the database engine when dropped.
pub struct EngineGuard {
    runner: Arc<dyn CommandRunner>,
    stop: CommandSpec,
    stopped: bool,
}

impl EngineGuard {
    pub fn stop(mut self) -> PipelineResult<()> {
        self.stopped = true;
        info!("Stopping database engine");
        let code = self.runner.run_blocking(&self.stop)?;
        if code != 0 {
            return Err(PipelineError::tool_failed("database engine stop", code));
        }
        Ok(())
    }
}

impl Drop for EngineGuard {
    fn drop(&mut self) {
        if self.stopped {
            return;
        }
        info!("Stopping database engine");
        match self.runner.run_blocking(&self.stop) {
            Ok(0) => {}
            Ok(code) => warn!(code, "Database engine stop exited with non-zero status"),
            Err(e) => warn!("Failed to stop database engine: {:#}", e),
        }
    }
}
