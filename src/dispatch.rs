//! Hands assembled workflow descriptors to the external simulation engine,
//! one execution directory per scenario. Engine artifacts (`out.osw`,
//! `finished.job`, `failed.job`, log files) are looked up relative to that
//! directory.

use crate::errors::DispatchError;
use crate::model::Scenario;
use crate::workflow::Workflow;
use indexmap::IndexMap;
use parking_lot::Mutex;
use rayon::prelude::*;
use serde_json::Value;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{error, info, warn};

pub const WORKFLOW_DESCRIPTOR: &str = "in.osw";
pub const COMPLETION_DESCRIPTOR: &str = "out.osw";
pub const FINISHED_SENTINEL: &str = "finished.job";
pub const FAILED_SENTINEL: &str = "failed.job";
pub const SUCCESS_STATUS: &str = "Success";
const FATAL_MARKER: &str = "**FATAL";
const LOG_ARTIFACTS: [&str; 2] = ["eplusout.err", "stdout"];

/// Seam to the external engine. The production implementation shells out to
/// the engine binary; tests substitute a fake that writes sentinel artifacts.
pub trait EngineRunner: Sync {
    fn run(&self, run_dir: &Path, descriptor: &Path) -> anyhow::Result<()>;
}

#[derive(Debug)]
pub struct ProcessEngineRunner {
    binary: PathBuf,
}

impl ProcessEngineRunner {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }
}

impl EngineRunner for ProcessEngineRunner {
    fn run(&self, run_dir: &Path, descriptor: &Path) -> anyhow::Result<()> {
        // no timeout: a hung invocation blocks its worker slot
        let output = Command::new(&self.binary)
            .arg("run")
            .arg("--workflow")
            .arg(descriptor)
            .current_dir(run_dir)
            .output()?;
        if !output.status.success() {
            // non-zero exit is not itself fatal; the sentinel checks decide
            warn!(
                status = %output.status,
                run_dir = %run_dir.display(),
                "engine exited non-zero"
            );
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DispatchOptions {
    /// Worker pool size for concurrent scenario dispatch.
    pub pool_size: usize,
    /// Hard cap on concurrent engine invocations, independent of pool size.
    /// The smaller of the two bounds governs actual parallelism.
    pub max_engine_processes: usize,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            pool_size: 4,
            max_engine_processes: 8,
        }
    }
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

pub struct Dispatcher<'a, R: EngineRunner> {
    runner: &'a R,
    options: DispatchOptions,
}

impl<'a, R: EngineRunner> Dispatcher<'a, R> {
    pub fn new(runner: &'a R, options: DispatchOptions) -> Self {
        Self { runner, options }
    }

    /// Run every simulated scenario in the slice. Failure of one scenario's
    /// engine run never prevents the others from completing; failed scenario
    /// ids are collected, not raised.
    pub fn dispatch_batch(
        &self,
        scenarios: &mut [Scenario],
        base_dir: &Path,
    ) -> anyhow::Result<BatchOutcome> {
        disambiguate_run_directories(scenarios);
        let workers = self
            .options
            .pool_size
            .min(self.options.max_engine_processes)
            .max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()?;

        let succeeded = Mutex::new(Vec::new());
        let failed = Mutex::new(Vec::new());
        pool.install(|| {
            scenarios.par_iter_mut().for_each(|scenario| {
                if !scenario.is_simulated() {
                    return;
                }
                let id = scenario.id().to_string();
                match self.dispatch_scenario(scenario, base_dir) {
                    Ok(true) => succeeded.lock().push(id),
                    Ok(false) => failed.lock().push(id),
                    Err(dispatch_error) => {
                        error!(scenario_id = %id, %dispatch_error, "scenario dispatch failed");
                        failed.lock().push(id);
                    }
                }
            });
        });

        Ok(BatchOutcome {
            succeeded: succeeded.into_inner(),
            failed: failed.into_inner(),
        })
    }

    /// Materialize one scenario's descriptor and invoke the engine. `Ok(bool)`
    /// reports engine success; `Err` is a dispatch failure fatal for this
    /// scenario only.
    pub fn dispatch_scenario(
        &self,
        scenario: &mut Scenario,
        base_dir: &Path,
    ) -> Result<bool, DispatchError> {
        let workflow = scenario
            .workflow()
            .cloned()
            .ok_or_else(|| DispatchError::MissingWorkflow {
                scenario_id: scenario.id().to_string(),
            })?;

        let run_dir = prepare_run_directory(base_dir, scenario)?;
        scenario.set_output_dir(run_dir.clone());
        let descriptor = write_descriptor(&run_dir, &workflow)?;

        info!(scenario_id = scenario.id(), run_dir = %run_dir.display(), "invoking engine");
        self.runner
            .run(&run_dir, &descriptor)
            .map_err(|source| DispatchError::EngineInvocation {
                scenario_id: scenario.id().to_string(),
                source,
            })?;

        let (success, problems) = determine_success(&run_dir);
        for problem in &problems {
            error!(scenario_id = scenario.id(), "{problem}");
        }
        Ok(success)
    }
}

/// Scenarios sharing a name would otherwise share a run directory and
/// clobber each other's artifacts mid-batch. Colliding names get the
/// scenario id suffixed; unique names are left alone.
fn disambiguate_run_directories(scenarios: &mut [Scenario]) {
    let mut counts: IndexMap<String, usize> = IndexMap::new();
    for scenario in scenarios.iter().filter(|s| s.is_simulated()) {
        *counts.entry(scenario.run_directory_name()).or_insert(0) += 1;
    }
    for scenario in scenarios.iter_mut().filter(|s| s.is_simulated()) {
        let base = scenario.run_directory_name();
        if counts.get(&base).copied().unwrap_or(0) > 1 {
            let id = scenario.id().replace(['/', '\\', ':'], "_");
            scenario.set_run_directory(format!("{base}_{id}"));
        }
    }
}

pub fn prepare_run_directory(
    base_dir: &Path,
    scenario: &Scenario,
) -> Result<PathBuf, DispatchError> {
    let run_dir = base_dir.join(scenario.run_directory_name());
    fs::create_dir_all(&run_dir).map_err(|source| DispatchError::CreateRunDirectory {
        path: run_dir.clone(),
        source,
    })?;
    Ok(run_dir)
}

/// Serialize the descriptor into the run directory. A failed write is fatal
/// for the scenario; there are no retries.
pub fn write_descriptor(run_dir: &Path, workflow: &Workflow) -> Result<PathBuf, DispatchError> {
    let path = run_dir.join(WORKFLOW_DESCRIPTOR);
    let write = || -> anyhow::Result<()> {
        let file = BufWriter::new(File::create(&path)?);
        serde_json::to_writer_pretty(file, workflow)?;
        Ok(())
    };
    write().map_err(|source| DispatchError::WriteDescriptor {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

/// The four-check success determination. All checks run and all failing
/// checks contribute a message, so one pass gives the full diagnostic
/// picture of a bad run.
pub fn determine_success(run_dir: &Path) -> (bool, Vec<String>) {
    let mut problems = Vec::new();

    let completion = run_dir.join(COMPLETION_DESCRIPTOR);
    match fs::read_to_string(&completion)
        .map_err(anyhow::Error::from)
        .and_then(|raw| Ok(serde_json::from_str::<Value>(&raw)?))
    {
        Ok(descriptor) => {
            let status = descriptor
                .get("completed_status")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if status != SUCCESS_STATUS {
                problems.push(format!(
                    "completion status is \"{status}\", expected \"{SUCCESS_STATUS}\""
                ));
            }
        }
        Err(read_error) => {
            problems.push(format!(
                "could not read completion descriptor {}: {read_error}",
                completion.display()
            ));
        }
    }

    if !run_dir.join(FINISHED_SENTINEL).exists() {
        problems.push(format!("{FINISHED_SENTINEL} sentinel is missing"));
    }
    if run_dir.join(FAILED_SENTINEL).exists() {
        problems.push(format!("{FAILED_SENTINEL} sentinel is present"));
    }

    for artifact in LOG_ARTIFACTS {
        let path = run_dir.join(artifact);
        if !path.exists() {
            continue;
        }
        if let Ok(contents) = fs::read_to_string(&path) {
            if contents.contains(FATAL_MARKER) {
                problems.push(format!("{artifact} contains a fatal error marker"));
            }
        }
    }

    (problems.is_empty(), problems)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::parse_document;
    use pretty_assertions::assert_eq;
    use rstest::*;
    use std::fs;
    use tempfile::tempdir;
    use walkdir::WalkDir;

    fn scenario(id: &str, name: Option<&str>) -> Scenario {
        let name_element = name
            .map(|name| format!("<Name>{name}</Name>"))
            .unwrap_or_default();
        let xml = format!(
            r#"<Scenario ID="{id}">{name_element}
              <ScenarioType><PackageOfMeasures/></ScenarioType>
            </Scenario>"#
        );
        let mut scenario =
            Scenario::from_element(&parse_document(xml.as_bytes()).unwrap()).unwrap();
        scenario.set_workflow(Workflow::base_template(vec![]));
        scenario
    }

    /// Fake engine: writes success artifacts unless told to fail a scenario,
    /// in which case the `finished.job` sentinel is withheld.
    struct FakeEngine {
        fail_for: Vec<String>,
    }

    impl EngineRunner for FakeEngine {
        fn run(&self, run_dir: &Path, _descriptor: &Path) -> anyhow::Result<()> {
            let dir_name = run_dir.file_name().unwrap().to_string_lossy().to_string();
            if self.fail_for.contains(&dir_name) {
                fs::write(run_dir.join(COMPLETION_DESCRIPTOR), r#"{"completed_status":"Fail"}"#)?;
                fs::write(run_dir.join(FAILED_SENTINEL), "")?;
            } else {
                fs::write(
                    run_dir.join(COMPLETION_DESCRIPTOR),
                    r#"{"completed_status":"Success"}"#,
                )?;
                fs::write(run_dir.join(FINISHED_SENTINEL), "")?;
            }
            Ok(())
        }
    }

    #[rstest]
    fn run_directory_prefers_name_over_id() {
        let with_name = scenario("S-1", Some("Deep Retrofit"));
        assert_eq!(with_name.run_directory_name(), "Deep Retrofit");
        let without_name = scenario("S-2", None);
        assert_eq!(without_name.run_directory_name(), "S-2");
    }

    #[rstest]
    fn descriptor_is_written_into_the_run_directory() {
        let base = tempdir().unwrap();
        let mut subject = scenario("S-1", Some("Baseline"));
        let runner = FakeEngine { fail_for: vec![] };
        let dispatcher = Dispatcher::new(&runner, DispatchOptions::default());
        assert!(dispatcher.dispatch_scenario(&mut subject, base.path()).unwrap());

        let descriptor_path = base.path().join("Baseline").join(WORKFLOW_DESCRIPTOR);
        let raw = fs::read_to_string(&descriptor_path).unwrap();
        let round_tripped: Workflow = serde_json::from_str(&raw).unwrap();
        assert_eq!(round_tripped, Workflow::base_template(vec![]));
        assert_eq!(subject.output_dir(), Some(base.path().join("Baseline").as_path()));

        let artifacts: Vec<String> = WalkDir::new(base.path())
            .min_depth(2)
            .into_iter()
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        assert!(artifacts.contains(&WORKFLOW_DESCRIPTOR.to_string()));
        assert!(artifacts.contains(&FINISHED_SENTINEL.to_string()));
    }

    #[rstest]
    fn missing_workflow_is_fatal_for_that_scenario_only() {
        let base = tempdir().unwrap();
        let xml = r#"<Scenario ID="Bare"><ScenarioType><PackageOfMeasures/></ScenarioType></Scenario>"#;
        let mut bare = Scenario::from_element(&parse_document(xml.as_bytes()).unwrap()).unwrap();
        let runner = FakeEngine { fail_for: vec![] };
        let dispatcher = Dispatcher::new(&runner, DispatchOptions::default());
        let error = dispatcher.dispatch_scenario(&mut bare, base.path()).unwrap_err();
        assert!(matches!(error, DispatchError::MissingWorkflow { .. }));
    }

    #[rstest]
    fn batch_collects_the_failing_scenario_without_aborting() {
        let base = tempdir().unwrap();
        let mut scenarios = vec![
            scenario("S-1", Some("One")),
            scenario("S-2", Some("Two")),
            scenario("S-3", Some("Three")),
        ];
        let runner = FakeEngine {
            fail_for: vec!["Two".to_string()],
        };
        let dispatcher = Dispatcher::new(&runner, DispatchOptions::default());
        let outcome = dispatcher.dispatch_batch(&mut scenarios, base.path()).unwrap();

        assert_eq!(outcome.failed, vec!["S-2".to_string()]);
        let mut succeeded = outcome.succeeded.clone();
        succeeded.sort();
        assert_eq!(succeeded, vec!["S-1".to_string(), "S-3".to_string()]);
    }

    #[rstest]
    fn colliding_scenario_names_get_distinct_run_directories() {
        let base = tempdir().unwrap();
        let mut scenarios = vec![
            scenario("S-1", Some("Retrofit")),
            scenario("S-2", Some("Retrofit")),
        ];
        let runner = FakeEngine { fail_for: vec![] };
        let dispatcher = Dispatcher::new(&runner, DispatchOptions::default());
        let outcome = dispatcher.dispatch_batch(&mut scenarios, base.path()).unwrap();

        let mut succeeded = outcome.succeeded.clone();
        succeeded.sort();
        assert_eq!(succeeded, vec!["S-1".to_string(), "S-2".to_string()]);
        assert!(base.path().join("Retrofit_S-1").join(WORKFLOW_DESCRIPTOR).exists());
        assert!(base.path().join("Retrofit_S-2").join(WORKFLOW_DESCRIPTOR).exists());
        assert!(!base.path().join("Retrofit").exists());
    }

    #[rstest]
    fn success_determination_accumulates_every_failing_check() {
        let run = tempdir().unwrap();
        // no out.osw, no finished.job, an explicit failed.job and a fatal log
        fs::write(run.path().join(FAILED_SENTINEL), "").unwrap();
        fs::write(run.path().join("eplusout.err"), "**FATAL: divide by zero").unwrap();

        let (success, problems) = determine_success(run.path());
        assert!(!success);
        assert_eq!(problems.len(), 4);
    }

    #[rstest]
    fn success_requires_all_four_checks() {
        let run = tempdir().unwrap();
        fs::write(
            run.path().join(COMPLETION_DESCRIPTOR),
            r#"{"completed_status":"Success"}"#,
        )
        .unwrap();
        fs::write(run.path().join(FINISHED_SENTINEL), "").unwrap();
        // benign logs do not fail the run
        fs::write(run.path().join("eplusout.err"), "** Warning ** minor").unwrap();

        let (success, problems) = determine_success(run.path());
        assert!(success, "unexpected problems: {problems:?}");
    }
}
