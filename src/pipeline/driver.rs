//! Stage sequencing with checkpoint short-circuiting
//!
//! `import` runs the loader and the statistics refresh, `render` runs the
//! render supervisor, `all` runs both in order. Each stage is skipped when
//! its recorded token matches the one computed for the current inputs; a
//! stage that reruns first clears its own record and every downstream one.
//! The database engine is started lazily, only once a stage actually needs
//! it, and stopped when the run future completes or is dropped.

use crate::checkpoint::{CheckpointStore, PipelineStage};
use crate::config::PipelineConfig;
use crate::database::{DatabaseManager, EngineGuard};
use crate::error::{PipelineError, PipelineResult};
use crate::fingerprint::{
    analyze_token, compute_token, ImportFingerprint, RenderFingerprint, SourceIdentity,
    StageToken, IMPORT_SCHEMA_VERSION,
};
use crate::import::{missing_source, ImportRequest, ImportStage};
use crate::process::CommandRunner;
use crate::progress::{ProgressEvent, ProgressHandler};
use crate::render::style::{render_style, style_identity};
use crate::render::{RenderSettings, RenderSupervisor, STYLE_VERSION};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Which stages ran and which were satisfied by their checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub executed: Vec<PipelineStage>,
    pub skipped: Vec<PipelineStage>,
}

impl RunSummary {
    pub fn ran(&self, stage: PipelineStage) -> bool {
        self.executed.contains(&stage)
    }

    pub fn was_skipped(&self, stage: PipelineStage) -> bool {
        self.skipped.contains(&stage)
    }
}

#[derive(Default)]
struct EngineState {
    guard: Option<EngineGuard>,
    reachable: bool,
}

pub struct PipelineDriver {
    config: PipelineConfig,
    runner: Arc<dyn CommandRunner>,
    progress: Arc<dyn ProgressHandler>,
    store: Option<CheckpointStore>,
}

impl PipelineDriver {
    pub fn new(
        config: PipelineConfig,
        runner: Arc<dyn CommandRunner>,
        progress: Arc<dyn ProgressHandler>,
    ) -> Self {
        let store = config
            .checkpoints
            .then(|| CheckpointStore::new(config.state_dir_path()));
        Self {
            config,
            runner,
            progress,
            store,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// `None` when checkpointing is disabled.
    pub fn checkpoints(&self) -> Option<&CheckpointStore> {
        self.store.as_ref()
    }

    pub async fn run(&self) -> PipelineResult<RunSummary> {
        let start = Instant::now();
        self.progress.on_progress(&ProgressEvent::Started {
            selector: self.config.stage.to_string(),
        });

        let result = self.run_stages().await;

        match &result {
            Ok(_) => self.progress.on_progress(&ProgressEvent::Completed {
                total_time: start.elapsed(),
            }),
            Err(e) => self.progress.on_progress(&ProgressEvent::Failed {
                error: e.to_string(),
            }),
        }
        result
    }

    async fn run_stages(&self) -> PipelineResult<RunSummary> {
        let selector = self.config.stage;
        let mut summary = RunSummary::default();
        let db = DatabaseManager::new(self.runner.clone(), self.config.db_user.clone());
        let mut engine = EngineState::default();

        // Preconditions are checked before anything is started or cleared.
        let source = if selector.includes_import() {
            Some(self.require_source()?)
        } else {
            None
        };

        let upstream = match &source {
            Some(source) => {
                let token = self.import_token(source)?;
                self.import(&db, &mut engine, source, &token, &mut summary)
                    .await?;
                token
            }
            None => self.recorded_upstream_token()?,
        };

        if selector.includes_render() {
            self.render(&db, &mut engine, &upstream, &mut summary).await?;
        }

        if let Some(guard) = engine.guard.take() {
            if let Err(e) = guard.stop() {
                warn!("Database engine did not stop cleanly: {}", e);
            }
        }
        Ok(summary)
    }

    async fn import(
        &self,
        db: &DatabaseManager,
        engine: &mut EngineState,
        source: &Path,
        token: &StageToken,
        summary: &mut RunSummary,
    ) -> PipelineResult<()> {
        let stage = ImportStage::new(self.runner.clone());

        if self.config.reset {
            if let Some(store) = &self.store {
                debug!("Reset requested, invalidating import checkpoints");
                store.invalidate(PipelineStage::Import)?;
            }
        }

        if self.is_current(PipelineStage::Import, token)? {
            self.skip(PipelineStage::Import, token, summary);
        } else {
            self.invalidate(PipelineStage::Import)?;
            let started = self.begin(PipelineStage::Import);
            self.ensure_engine(db, engine).await?;
            db.ensure_database(&self.config.database, self.config.reset)
                .await?;
            stage.import_data(&self.import_request(source)).await?;
            self.finish(PipelineStage::Import, token, started, summary)?;
        }

        let analyze = analyze_token(token);
        if self.is_current(PipelineStage::StatisticsRefresh, &analyze)? {
            self.skip(PipelineStage::StatisticsRefresh, &analyze, summary);
        } else {
            self.invalidate(PipelineStage::StatisticsRefresh)?;
            let started = self.begin(PipelineStage::StatisticsRefresh);
            self.ensure_engine(db, engine).await?;
            stage
                .refresh_statistics(&self.config.database, &self.config.db_user)
                .await?;
            self.finish(PipelineStage::StatisticsRefresh, &analyze, started, summary)?;
        }

        Ok(())
    }

    async fn render(
        &self,
        db: &DatabaseManager,
        engine: &mut EngineState,
        upstream: &StageToken,
        summary: &mut RunSummary,
    ) -> PipelineResult<()> {
        let token = self.render_token(upstream);
        let tile_dir = self.config.tile_dir();

        if self.is_current(PipelineStage::Render, &token)? {
            if tile_dir.is_dir() {
                self.skip(PipelineStage::Render, &token, summary);
                return Ok(());
            }
            warn!(
                tile_dir = %tile_dir.display(),
                "Render checkpoint matches but tile directory is gone, rendering again"
            );
        }

        self.invalidate(PipelineStage::Render)?;
        let started = self.begin(PipelineStage::Render);
        self.ensure_engine(db, engine).await?;
        db.ensure_database(&self.config.database, false).await?;

        let settings = RenderSettings::from_config(&self.config)?;
        let mut supervisor =
            RenderSupervisor::new(self.runner.clone(), self.progress.clone(), settings);
        let report = supervisor.run().await?;
        info!(
            tiles = report.tiles,
            min_zoom = self.config.min_zoom,
            max_zoom = self.config.max_zoom,
            "Tile job finished"
        );

        self.finish(PipelineStage::Render, &token, started, summary)
    }

    /// Starts the engine on first use when managed; otherwise only confirms
    /// it accepts connections.
    async fn ensure_engine(
        &self,
        db: &DatabaseManager,
        engine: &mut EngineState,
    ) -> PipelineResult<()> {
        if engine.reachable {
            return Ok(());
        }

        if self.config.manage_engine {
            let cluster = db.detect_cluster().await?;
            if let Some(data_root) = &self.config.data_root {
                let outcome = db.prepare_data_dir(&cluster, data_root).await?;
                debug!(
                    seeded = outcome.seeded,
                    linked = outcome.linked,
                    "Persistent data directory prepared"
                );
            }
            engine.guard = Some(db.start_engine(&cluster, self.config.engine_ready).await?);
        } else {
            let attempts = db.wait_ready(self.config.engine_ready).await?;
            debug!(attempts, "External database engine reachable");
        }

        engine.reachable = true;
        Ok(())
    }

    fn require_source(&self) -> PipelineResult<PathBuf> {
        match &self.config.source {
            Some(path) if path.is_file() => Ok(path.clone()),
            Some(path) => Err(missing_source(path)),
            None => Err(PipelineError::precondition(
                "No source file configured (use --source or TILEPIPE_SOURCE)",
            )),
        }
    }

    fn import_request(&self, source: &Path) -> ImportRequest {
        ImportRequest {
            database: self.config.database.clone(),
            db_user: self.config.db_user.clone(),
            source: source.to_path_buf(),
            cache_mb: self.config.cache_mb,
            processes: self.config.import_processes,
            flat_nodes: self.config.flat_nodes.clone(),
            extra_args: self.config.loader_extra_args.clone(),
        }
    }

    pub fn import_token(&self, source: &Path) -> PipelineResult<StageToken> {
        let identity = SourceIdentity::of(source)?;
        Ok(ImportFingerprint {
            source: &identity,
            cache_mb: self.config.cache_mb,
            processes: self.config.import_processes,
            flat_nodes: self.config.flat_nodes.as_deref(),
            extra_args: &self.config.loader_extra_args,
        }
        .token())
    }

    pub fn render_token(&self, upstream: &StageToken) -> StageToken {
        let identity = style_identity(&render_style(&self.config.database, &self.config.db_user));
        RenderFingerprint {
            import_token: upstream,
            style_version: STYLE_VERSION,
            min_zoom: self.config.min_zoom,
            max_zoom: self.config.max_zoom,
            threads: self.config.render_threads,
            style_identity: &identity,
        }
        .token()
    }

    /// Upstream token for a render-only run: the current source when it is
    /// readable, else the recorded import checkpoint.
    fn recorded_upstream_token(&self) -> PipelineResult<StageToken> {
        if let Some(source) = self.config.source.as_deref().filter(|p| p.is_file()) {
            return self.import_token(source);
        }
        if let Some(store) = &self.store {
            if let Some(recorded) = store.read(PipelineStage::Import)? {
                debug!(token = recorded.short(), "Using recorded import checkpoint");
                return Ok(recorded);
            }
        }
        warn!("No source file or import checkpoint, render checkpoint will not track the import");
        Ok(compute_token("import", IMPORT_SCHEMA_VERSION, ["unrecorded"]))
    }

    fn is_current(&self, stage: PipelineStage, token: &StageToken) -> PipelineResult<bool> {
        match &self.store {
            Some(store) => store.matches(stage, token),
            None => Ok(false),
        }
    }

    fn invalidate(&self, stage: PipelineStage) -> PipelineResult<()> {
        match &self.store {
            Some(store) => store.invalidate(stage),
            None => Ok(()),
        }
    }

    fn begin(&self, stage: PipelineStage) -> Instant {
        self.progress
            .on_progress(&ProgressEvent::StageStarted { stage });
        Instant::now()
    }

    fn skip(&self, stage: PipelineStage, token: &StageToken, summary: &mut RunSummary) {
        self.progress.on_progress(&ProgressEvent::StageSkipped {
            stage,
            token: token.as_str().to_string(),
        });
        summary.skipped.push(stage);
    }

    fn finish(
        &self,
        stage: PipelineStage,
        token: &StageToken,
        started: Instant,
        summary: &mut RunSummary,
    ) -> PipelineResult<()> {
        if let Some(store) = &self.store {
            store.mark(stage, token)?;
        }
        self.progress.on_progress(&ProgressEvent::StageComplete {
            stage,
            duration: started.elapsed(),
        });
        summary.executed.push(stage);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PollSettings, StageSelector};
    use crate::import::LOADER_PROGRAM;
    use crate::process::{MockReply, MockRunner};
    use crate::progress::NoOpHandler;
    use crate::render::strategy::TILE_TOOL;
    use crate::render::supervisor::DAEMON_PROGRAM;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Env {
        dir: TempDir,
        runner: Arc<MockRunner>,
    }

    impl Env {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            fs::create_dir_all(dir.path().join("plugins")).unwrap();
            fs::create_dir_all(dir.path().join("fonts")).unwrap();
            fs::write(dir.path().join("region.osm.pbf"), b"pbf").unwrap();

            let runner = Arc::new(MockRunner::new());
            let socket = dir.path().join("run/renderd.sock");
            runner.on(DAEMON_PROGRAM, move |_| {
                fs::write(&socket, "").unwrap();
                MockReply::ok()
            });
            Self { dir, runner }
        }

        fn config(&self, stage: StageSelector) -> PipelineConfig {
            let root = self.dir.path();
            let mut config = PipelineConfig::default();
            config.source = Some(root.join("region.osm.pbf"));
            config.output_root = root.join("output");
            config.socket_path = root.join("run/renderd.sock");
            config.plugin_dirs = vec![root.join("plugins")];
            config.font_dirs = vec![root.join("fonts")];
            config.min_zoom = 0;
            config.max_zoom = 2;
            config.manage_engine = false;
            config.checkpoints = true;
            config.reset = false;
            config.loader_extra_args = Vec::new();
            config.engine_ready = PollSettings::new(2, Duration::ZERO);
            config.socket_ready = PollSettings::new(2, Duration::ZERO);
            config.stage = stage;
            config
        }

        fn driver(&self, config: PipelineConfig) -> PipelineDriver {
            PipelineDriver::new(config, self.runner.clone(), Arc::new(NoOpHandler))
        }
    }

    #[tokio::test]
    async fn test_all_runs_every_stage_once() {
        let env = Env::new();
        let summary = env
            .driver(env.config(StageSelector::All))
            .run()
            .await
            .unwrap();

        assert_eq!(summary.executed, PipelineStage::ALL.to_vec());
        assert!(summary.skipped.is_empty());
        assert_eq!(env.runner.count(LOADER_PROGRAM), 1);
        assert_eq!(env.runner.count(TILE_TOOL), 1);
    }

    #[tokio::test]
    async fn test_second_run_skips_everything() {
        let env = Env::new();
        env.driver(env.config(StageSelector::All)).run().await.unwrap();
        env.runner.clear_calls();

        let summary = env
            .driver(env.config(StageSelector::All))
            .run()
            .await
            .unwrap();
        assert!(summary.executed.is_empty());
        assert_eq!(summary.skipped, PipelineStage::ALL.to_vec());
        assert!(env.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_reset_forces_import() {
        let env = Env::new();
        env.driver(env.config(StageSelector::Import)).run().await.unwrap();
        env.runner.clear_calls();

        let mut config = env.config(StageSelector::Import);
        config.reset = true;
        let summary = env.driver(config).run().await.unwrap();
        assert!(summary.ran(PipelineStage::Import));
        assert!(summary.ran(PipelineStage::StatisticsRefresh));
        assert_eq!(env.runner.count(LOADER_PROGRAM), 1);
    }

    #[tokio::test]
    async fn test_failed_statistics_refresh_reruns_alone() {
        let env = Env::new();
        env.runner.on("psql", |spec| {
            if spec.value_of("-c") == Some("ANALYZE;") {
                MockReply::code(1)
            } else {
                MockReply::ok()
            }
        });
        let err = env
            .driver(env.config(StageSelector::Import))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ToolFailed { .. }));

        env.runner.reply("psql", MockReply::ok());
        env.runner.clear_calls();
        let summary = env
            .driver(env.config(StageSelector::Import))
            .run()
            .await
            .unwrap();
        assert!(summary.was_skipped(PipelineStage::Import));
        assert!(summary.ran(PipelineStage::StatisticsRefresh));
        assert_eq!(env.runner.count(LOADER_PROGRAM), 0);
    }

    #[tokio::test]
    async fn test_missing_tile_dir_forces_render() {
        let env = Env::new();
        let config = env.config(StageSelector::All);
        let tiles = config.tile_dir();
        env.driver(config).run().await.unwrap();
        fs::remove_dir_all(&tiles).unwrap();

        let summary = env
            .driver(env.config(StageSelector::All))
            .run()
            .await
            .unwrap();
        assert!(summary.was_skipped(PipelineStage::Import));
        assert!(summary.ran(PipelineStage::Render));
    }

    #[tokio::test]
    async fn test_missing_source_touches_nothing() {
        let env = Env::new();
        let mut config = env.config(StageSelector::All);
        config.source = Some(env.dir.path().join("absent.pbf"));

        let err = env.driver(config).run().await.unwrap_err();
        assert!(matches!(err, PipelineError::Precondition(_)));
        assert!(env.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_render_only_uses_recorded_import_token() {
        let env = Env::new();
        env.driver(env.config(StageSelector::All)).run().await.unwrap();

        let mut config = env.config(StageSelector::Render);
        config.source = None;
        let summary = env.driver(config).run().await.unwrap();
        assert_eq!(summary.skipped, vec![PipelineStage::Render]);
    }

    #[tokio::test]
    async fn test_checkpoints_disabled_always_runs() {
        let env = Env::new();
        let mut config = env.config(StageSelector::Import);
        config.checkpoints = false;
        env.driver(config.clone()).run().await.unwrap();
        env.driver(config).run().await.unwrap();
        assert_eq!(env.runner.count(LOADER_PROGRAM), 2);
    }

    #[tokio::test]
    async fn test_managed_engine_started_and_stopped() {
        let env = Env::new();
        env.runner.reply(
            "pg_lsclusters",
            MockReply::stdout("16 main 5432 down postgres /var/lib/postgresql/16/main /var/log/pg.log\n"),
        );
        let mut config = env.config(StageSelector::Import);
        config.manage_engine = true;
        env.driver(config).run().await.unwrap();

        let actions: Vec<String> = env
            .runner
            .calls_to("pg_ctlcluster")
            .iter()
            .filter_map(|c| c.args.last().cloned())
            .collect();
        assert_eq!(actions, vec!["start", "stop"]);
    }

    #[tokio::test]
    async fn test_all_skipped_does_not_start_engine() {
        let env = Env::new();
        env.runner.reply(
            "pg_lsclusters",
            MockReply::stdout("16 main 5432 down postgres /var/lib/postgresql/16/main /var/log/pg.log\n"),
        );
        let mut config = env.config(StageSelector::All);
        config.manage_engine = true;
        env.driver(config.clone()).run().await.unwrap();
        env.runner.clear_calls();

        env.driver(config).run().await.unwrap();
        assert_eq!(env.runner.count("pg_ctlcluster"), 0);
    }

    #[test]
    fn test_render_token_tracks_zoom_and_upstream() {
        let env = Env::new();
        let driver = env.driver(env.config(StageSelector::All));
        let a = compute_token("import", 1, ["a"]);
        let b = compute_token("import", 1, ["b"]);
        assert_ne!(driver.render_token(&a), driver.render_token(&b));

        let mut config = env.config(StageSelector::All);
        config.max_zoom = 3;
        assert_ne!(env.driver(config).render_token(&a), driver.render_token(&a));
    }
}
