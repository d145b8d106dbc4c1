pub mod dispatch;
pub mod errors;
pub mod model;
pub mod output;
pub mod results;
pub mod units;
pub mod workflow;
pub mod xml;

pub use crate::dispatch::{DispatchOptions, Dispatcher, EngineRunner, ProcessEngineRunner};
pub use crate::errors::Diagnostic;
pub use crate::model::{AuditDocument, Facility};
pub use crate::output::Output;
pub use crate::workflow::{Workflow, WorkflowAssembler, CATEGORY_TABLE};

use crate::model::Report;
use crate::results::{aggregate_scenario, compute_package_savings, load_engine_results};
use chrono::Datelike;
use csv::WriterBuilder;
use std::io::Read;
use std::path::PathBuf;
use strum_macros::Display;
use tracing::{error, info};

pub const TRANSLATED_DOCUMENT_KEY: &str = "translated.xml";
pub const SUMMARY_KEY: &str = "summary.csv";

#[derive(Clone, Debug)]
pub struct TranslationOptions {
    /// Module search roots written into every workflow descriptor.
    pub measure_paths: Vec<String>,
    /// Directory under which per-scenario run directories are created.
    pub run_root: PathBuf,
    pub dispatch: DispatchOptions,
    /// Calendar year stamped onto monthly time series. Defaults to the
    /// report's first audit date, then to the current year.
    pub baseline_year: Option<i32>,
}

impl Default for TranslationOptions {
    fn default() -> Self {
        Self {
            measure_paths: vec![],
            run_root: PathBuf::from("run"),
            dispatch: DispatchOptions::default(),
            baseline_year: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum ScenarioStatus {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Clone, Debug)]
pub struct ScenarioSummary {
    pub id: String,
    pub classification: &'static str,
    pub status: ScenarioStatus,
}

#[derive(Debug, Default)]
pub struct TranslationSummary {
    pub scenarios: Vec<ScenarioSummary>,
    pub diagnostics: Vec<Diagnostic>,
}

/// The whole translation, end to end: parse the audit document, assemble one
/// workflow descriptor per simulated scenario, dispatch the batch to the
/// engine, fold results and package savings back into the document, and write
/// the updated document plus a run summary through `output`.
pub fn run_translation(
    input: impl Read,
    output: impl Output,
    runner: &impl EngineRunner,
    options: &TranslationOptions,
) -> Result<TranslationSummary, anyhow::Error> {
    let mut document = AuditDocument::parse(input)?;
    let mut facility = Facility::from_document(&document)?;
    let mut diagnostics = Vec::new();

    let simulated = facility
        .report
        .scenarios()
        .iter()
        .filter(|scenario| scenario.is_simulated())
        .count();
    info!(
        scenarios = facility.report.scenarios().len(),
        simulated, "audit document parsed"
    );

    let template = Workflow::base_template(options.measure_paths.clone());
    {
        let Facility {
            context,
            measures,
            report,
            ..
        } = &mut facility;
        let assembler = WorkflowAssembler::new(&template, &CATEGORY_TABLE, context);
        for scenario in report.scenarios_mut() {
            if !scenario.is_simulated() {
                continue;
            }
            let workflow =
                assembler.configure_workflow_for_scenario(scenario, measures, &mut diagnostics);
            scenario.set_workflow(workflow);
        }
    }

    let dispatcher = Dispatcher::new(runner, options.dispatch);
    let outcome = dispatcher.dispatch_batch(facility.report.scenarios_mut(), &options.run_root)?;
    info!(
        succeeded = outcome.succeeded.len(),
        failed = outcome.failed.len(),
        "engine batch finished"
    );
    let mut failed = outcome.failed;

    let year = resolve_baseline_year(&facility.report, options.baseline_year);
    for scenario in facility.report.scenarios_mut() {
        if !scenario.is_simulated() || failed.iter().any(|id| id == scenario.id()) {
            continue;
        }
        let Some(run_dir) = scenario.output_dir().map(PathBuf::from) else {
            continue;
        };
        match load_engine_results(&run_dir) {
            Ok(results) => {
                aggregate_scenario(scenario, &results, year, &mut diagnostics);
                scenario.set_engine_results(results);
            }
            Err(load_error) => {
                error!(scenario_id = scenario.id(), %load_error, "could not load engine results");
                diagnostics.push(Diagnostic::error(format!(
                    "could not load engine results for scenario \"{}\": {load_error}",
                    scenario.id()
                )));
                failed.push(scenario.id().to_string());
            }
        }
    }

    for scenario_id in compute_package_savings(&mut facility.report, &mut diagnostics) {
        if !failed.contains(&scenario_id) {
            failed.push(scenario_id);
        }
    }

    document.write_back(&facility.report)?;
    if !output.is_noop() {
        document.serialize(output.writer_for_location_key(TRANSLATED_DOCUMENT_KEY)?)?;
    }

    let scenarios = facility
        .report
        .scenarios()
        .iter()
        .map(|scenario| ScenarioSummary {
            id: scenario.id().to_string(),
            classification: scenario.classification(),
            status: if !scenario.is_simulated() {
                ScenarioStatus::Skipped
            } else if failed.iter().any(|id| id == scenario.id()) {
                ScenarioStatus::Failed
            } else {
                ScenarioStatus::Succeeded
            },
        })
        .collect::<Vec<_>>();

    if !output.is_noop() {
        write_summary(&output, &scenarios)?;
    }

    Ok(TranslationSummary {
        scenarios,
        diagnostics,
    })
}

fn resolve_baseline_year(report: &Report, explicit: Option<i32>) -> i32 {
    explicit
        .or_else(|| {
            report
                .audit_dates
                .iter()
                .find_map(|audit| audit.date.map(|date| date.year()))
        })
        .unwrap_or_else(|| chrono::Utc::now().year())
}

fn write_summary(output: &impl Output, scenarios: &[ScenarioSummary]) -> Result<(), anyhow::Error> {
    let mut writer = WriterBuilder::new().from_writer(output.writer_for_location_key(SUMMARY_KEY)?);
    writer.write_record(["scenario_id", "classification", "status"])?;
    for scenario in scenarios {
        let status = scenario.status.to_string();
        writer.write_record([scenario.id.as_str(), scenario.classification, status.as_str()])?;
    }
    writer.flush()?;
    Ok(())
}
