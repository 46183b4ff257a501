//! Pipeline assembly and lifecycle.
//!
//! Stages are declared with an explicit input, either an external directory
//! a capture tool writes to or the name of an upstream stage whose output
//! directory becomes this stage's watch directory. [`PipelineGraph::build`]
//! resolves the wiring once and rejects graphs that could never deliver
//! results: unknown upstreams, cycles, duplicate names and capture stages
//! nobody harvests.
//!
//! [`PipelineGraph::start`] registers one non-recursive watcher per stage and
//! one worker thread draining that watcher's events, so stages run
//! concurrently while each stage sees its own files in order.
//! [`PipelineGraph::stop`] unregisters every watch and joins the workers.
//! Engine processes already launched keep running.
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, unbounded};
use log::{debug, info, warn};
use notify::event::{AccessKind, AccessMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::config::Config;
use crate::stage::{Outcome, PipelineStage, Routine, RoutineKind, StageContext};

const POLL: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("duplicate stage name: {0}")]
    DuplicateStage(String),
    #[error("stage {stage} reads from unknown stage {upstream}")]
    UnknownUpstream { stage: String, upstream: String },
    #[error("stage wiring forms a cycle through {0}")]
    Cycle(String),
    #[error("stage {0} produces results no stage watches")]
    Dangling(String),
    #[error("invalid pattern for stage {stage}: {source}")]
    Pattern {
        stage: String,
        #[source]
        source: globset::Error,
    },
    #[error(transparent)]
    Regex(#[from] regex::Error),
    #[error("cannot create {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
    #[error("cannot start worker for stage {stage}: {source}")]
    Worker {
        stage: String,
        #[source]
        source: std::io::Error,
    },
    #[error("pipeline already running")]
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    External(PathBuf),
    Upstream(String),
}

#[derive(Debug, Clone)]
pub struct StageSpec {
    pub name: String,
    pub input: Input,
    pub output_dir: PathBuf,
    pub patterns: Vec<String>,
    pub routine: RoutineKind,
}

impl StageSpec {
    pub fn new(name: &str, input: Input, output_dir: PathBuf, routine: RoutineKind) -> Self {
        Self {
            name: name.to_string(),
            input,
            output_dir,
            patterns: routine.default_patterns(),
            routine,
        }
    }
}

struct Running {
    watchers: Vec<(PathBuf, RecommendedWatcher)>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

pub struct PipelineGraph {
    /// Downstream stages first, so a watcher is in place before anything
    /// upstream can produce for it.
    stages: Vec<Arc<PipelineStage>>,
    running: Option<Running>,
}

impl std::fmt::Debug for PipelineGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineGraph")
            .field("stages", &self.stages)
            .field("running", &self.running.is_some())
            .finish()
    }
}

impl PipelineGraph {
    pub fn build(
        specs: Vec<StageSpec>,
        junk_dir: &Path,
        ctx: Arc<StageContext>,
    ) -> Result<Self, GraphError> {
        let mut by_name: HashMap<&str, &StageSpec> = HashMap::new();
        for spec in &specs {
            if by_name.insert(spec.name.as_str(), spec).is_some() {
                return Err(GraphError::DuplicateStage(spec.name.clone()));
            }
        }
        for spec in &specs {
            if let Input::Upstream(up) = &spec.input {
                if !by_name.contains_key(up.as_str()) {
                    return Err(GraphError::UnknownUpstream {
                        stage: spec.name.clone(),
                        upstream: up.clone(),
                    });
                }
            }
        }
        // Each stage has at most one upstream, so walking the chain finds any
        // cycle.
        for spec in &specs {
            let mut visited: HashSet<&str> = HashSet::new();
            let mut cur: &StageSpec = spec;
            while let Input::Upstream(up) = &cur.input {
                if !visited.insert(cur.name.as_str()) {
                    return Err(GraphError::Cycle(spec.name.clone()));
                }
                cur = by_name[up.as_str()];
            }
        }
        let consumed: HashSet<&str> = specs
            .iter()
            .filter_map(|s| match &s.input {
                Input::Upstream(up) => Some(up.as_str()),
                Input::External(_) => None,
            })
            .collect();
        for spec in &specs {
            if !spec.routine.is_terminal() && !consumed.contains(spec.name.as_str()) {
                return Err(GraphError::Dangling(spec.name.clone()));
            }
        }

        let depth = |spec: &StageSpec| {
            let mut d = 0usize;
            let mut cur = spec;
            while let Input::Upstream(up) = &cur.input {
                d += 1;
                cur = by_name[up.as_str()];
            }
            d
        };
        let mut ordered: Vec<(usize, &StageSpec)> = specs.iter().map(|s| (depth(s), s)).collect();
        ordered.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.name.cmp(&b.1.name)));

        let mut stages = Vec::with_capacity(specs.len());
        for (_, spec) in ordered {
            let watch_dir = match &spec.input {
                Input::External(dir) => dir.clone(),
                Input::Upstream(up) => by_name[up.as_str()].output_dir.clone(),
            };
            let stage = PipelineStage::new(
                &spec.name,
                watch_dir,
                spec.output_dir.clone(),
                junk_dir.to_path_buf(),
                spec.patterns.clone(),
                Routine::new(spec.routine)?,
                Arc::clone(&ctx),
            )
            .map_err(|source| GraphError::Pattern {
                stage: spec.name.clone(),
                source,
            })?;
            stages.push(Arc::new(stage));
        }
        Ok(Self {
            stages,
            running: None,
        })
    }

    /// The standard topology: each configured capture source feeds a
    /// harvest stage watching its output directory.
    pub fn from_config(cfg: &Config, ctx: Arc<StageContext>) -> Result<Self, GraphError> {
        let creds = cfg.creds_dir();
        let mut specs = Vec::new();
        let sources = [
            ("responder", &cfg.responder, RoutineKind::Responder),
            ("secretsdump", &cfg.secretsdump, RoutineKind::Secretsdump),
        ];
        for (name, watch, routine) in sources {
            let Some(watch) = watch else { continue };
            specs.push(StageSpec::new(
                name,
                Input::External(watch.watch_path.clone()),
                cfg.stage_out_dir(name),
                routine,
            ));
            specs.push(StageSpec::new(
                &format!("{}_harvest", name),
                Input::Upstream(name.to_string()),
                creds.clone(),
                RoutineKind::Harvest,
            ));
        }
        Self::build(specs, &cfg.junk_dir(), ctx)
    }

    pub fn stages(&self) -> &[Arc<PipelineStage>] {
        &self.stages
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn start(&mut self) -> Result<(), GraphError> {
        if self.running.is_some() {
            return Err(GraphError::AlreadyRunning);
        }
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut running = Running {
            watchers: Vec::new(),
            workers: Vec::new(),
            shutdown: Arc::clone(&shutdown),
        };
        for stage in &self.stages {
            for dir in [&stage.watch_dir, &stage.output_dir, &stage.junk_dir] {
                fs::create_dir_all(dir).map_err(|source| GraphError::Directory {
                    path: dir.clone(),
                    source,
                })?;
            }
            let (tx, rx) = unbounded::<notify::Result<Event>>();
            let watch_err = |source: notify::Error| GraphError::Watch {
                path: stage.watch_dir.clone(),
                source,
            };
            let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
                let _ = tx.send(res);
            })
            .map_err(watch_err)?;
            watcher
                .watch(&stage.watch_dir, RecursiveMode::NonRecursive)
                .map_err(watch_err)?;
            info!(
                "watching ({}) for files with ({})",
                stage.watch_dir.display(),
                stage.patterns.join(", ")
            );
            running.watchers.push((stage.watch_dir.clone(), watcher));

            let worker_stage = Arc::clone(stage);
            let stop = Arc::clone(&shutdown);
            let handle = std::thread::Builder::new()
                .name(format!("stage-{}", stage.name))
                .spawn(move || run_stage(&worker_stage, &rx, &stop))
                .map_err(|source| GraphError::Worker {
                    stage: stage.name.clone(),
                    source,
                })?;
            running.workers.push(handle);
        }
        self.running = Some(running);
        Ok(())
    }

    /// Unregister all watches and wait for the workers to drain.
    pub fn stop(&mut self) {
        let Some(mut running) = self.running.take() else {
            return;
        };
        for (dir, watcher) in running.watchers.iter_mut() {
            if let Err(e) = watcher.unwatch(dir) {
                debug!("unwatch {}: {}", dir.display(), e);
            }
        }
        running.watchers.clear();
        running.shutdown.store(true, Ordering::SeqCst);
        for worker in running.workers {
            if worker.join().is_err() {
                warn!("stage worker panicked");
            }
        }
    }
}

impl Drop for PipelineGraph {
    fn drop(&mut self) {
        self.stop();
    }
}

fn wants(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(_)
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}

fn run_stage(
    stage: &PipelineStage,
    rx: &crossbeam_channel::Receiver<notify::Result<Event>>,
    stop: &AtomicBool,
) {
    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let event = match rx.recv_timeout(POLL) {
            Ok(Ok(event)) => event,
            Ok(Err(e)) => {
                warn!("{}: watch error: {}", stage.name, e);
                continue;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };
        if !wants(&event.kind) {
            continue;
        }
        for path in &event.paths {
            match stage.handle(path) {
                Ok(Outcome::Processed {
                    launched,
                    recovered,
                }) => debug!(
                    "{}: {} -> {} launch(es), {} credential(s)",
                    stage.name,
                    path.display(),
                    launched,
                    recovered
                ),
                Ok(_) => {}
                // Files can vanish between the event and the read.
                Err(e) => warn!("{}: {}: {:#}", stage.name, path.display(), e),
            }
        }
    }
}
