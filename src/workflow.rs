use crate::errors::Diagnostic;
use crate::model::{FacilityContext, Measure, Scenario};
use indexmap::IndexMap;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::str::FromStr;
use strum_macros::{Display, EnumString};
use tracing::error;

/// Argument name carrying the engine's skip flag. A step whose skip flag is
/// explicitly `true` is purged from the final descriptor; a missing flag or
/// an explicit `false` both mean "keep".
pub const SKIP_ARGUMENT: &str = "__SKIP__";

/// The descriptor handed to the external engine for one scenario: module
/// search roots plus an ordered list of computation steps.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Workflow {
    pub measure_paths: Vec<String>,
    pub steps: Vec<WorkflowStep>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct WorkflowStep {
    pub module_name: String,
    #[serde(default)]
    pub arguments: IndexMap<String, Value>,
}

impl WorkflowStep {
    pub fn bare(module_name: impl Into<String>) -> Self {
        Self {
            module_name: module_name.into(),
            arguments: IndexMap::new(),
        }
    }

    pub fn with_arguments(
        module_name: impl Into<String>,
        arguments: impl IntoIterator<Item = (&'static str, Value)>,
    ) -> Self {
        Self {
            module_name: module_name.into(),
            arguments: arguments
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
        }
    }
}

impl Workflow {
    /// The generic template every scenario's descriptor starts from.
    /// Scenario-specific measures are bound onto an independent deep copy.
    pub fn base_template(measure_paths: Vec<String>) -> Self {
        Self {
            measure_paths,
            steps: vec![
                WorkflowStep::with_arguments("set_run_period", [("timesteps_per_hour", json!(4))]),
                WorkflowStep::bare("annual_end_use_report"),
                WorkflowStep::bare("monthly_consumption_report"),
            ],
        }
    }
}

/// Coarse module discriminator. Steps are ordered by kind in the descriptor;
/// ordinal insertion is relative to a kind's group.
#[derive(Clone, Copy, Debug, Display, Eq, Ord, PartialEq, PartialOrd)]
pub enum ModuleKind {
    Model,
    EnergyPlus,
    Reporting,
}

lazy_static! {
    static ref MODULE_KINDS: IndexMap<&'static str, ModuleKind> = IndexMap::from([
        ("set_run_period", ModuleKind::Model),
        ("set_lighting_loads_by_lpd", ModuleKind::Model),
        ("add_daylight_sensors", ModuleKind::Model),
        ("reduce_electric_equipment_loads_by_percentage", ModuleKind::Model),
        ("add_plug_load_controls", ModuleKind::Model),
        ("reduce_space_infiltration_by_percentage", ModuleKind::Model),
        ("increase_insulation_r_value_for_exterior_walls", ModuleKind::Model),
        ("replace_boiler_burner", ModuleKind::Model),
        ("enable_demand_controlled_ventilation", ModuleKind::Model),
        ("reduce_water_use_by_percentage", ModuleKind::Model),
        ("add_output_variables", ModuleKind::EnergyPlus),
        ("annual_end_use_report", ModuleKind::Reporting),
        ("monthly_consumption_report", ModuleKind::Reporting),
    ]);
}

pub fn module_kind(module_name: &str) -> ModuleKind {
    MODULE_KINDS
        .get(module_name)
        .copied()
        .unwrap_or(ModuleKind::Model)
}

/// Insert `step` so that it becomes the `position`-th step of its kind.
///
/// The walk counts steps of the target kind; when the running count reaches
/// the requested position the step goes in just before the cursor. Crossing
/// into a later kind anchors insertion for a kind with no existing steps.
/// Returns `false`, leaving the workflow untouched, when no valid position
/// exists; callers must check rather than assume insertion happened.
pub fn insert_module_at_position(
    workflow: &mut Workflow,
    step: WorkflowStep,
    kind: ModuleKind,
    position: usize,
) -> bool {
    let mut seen = 0;
    for idx in 0..workflow.steps.len() {
        let step_kind = module_kind(&workflow.steps[idx].module_name);
        if step_kind == kind {
            if seen == position {
                workflow.steps.insert(idx, step);
                return true;
            }
            seen += 1;
        } else if step_kind > kind {
            if seen == position {
                workflow.steps.insert(idx, step);
                return true;
            }
            return false;
        }
    }
    if seen == position {
        workflow.steps.push(step);
        return true;
    }
    false
}

/// Condition gating an argument binding, evaluated against explicit facility
/// context rather than ambient state.
#[derive(Clone, Debug)]
pub enum Predicate {
    BuildingTypeEquals(&'static str),
    SystemTypeContains(&'static str),
}

impl Predicate {
    pub fn matches(&self, context: &FacilityContext) -> bool {
        match self {
            Predicate::BuildingTypeEquals(building_type) => {
                context.building_type.as_deref() == Some(*building_type)
            }
            Predicate::SystemTypeContains(needle) => context
                .system_type
                .as_deref()
                .is_some_and(|system_type| system_type.contains(needle)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ArgumentSpec {
    pub name: &'static str,
    pub value: Value,
    pub condition: Option<Predicate>,
}

impl ArgumentSpec {
    fn new(name: &'static str, value: Value) -> Self {
        Self {
            name,
            value,
            condition: None,
        }
    }

    fn when(name: &'static str, value: Value, condition: Predicate) -> Self {
        Self {
            name,
            value,
            condition: Some(condition),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ModuleBinding {
    pub module_name: &'static str,
    pub arguments: Vec<ArgumentSpec>,
}

#[derive(Clone, Copy, Debug, Display, EnumString, Eq, Hash, PartialEq)]
pub enum MeasureCategory {
    LightingImprovements,
    PlugLoadReductions,
    BuildingEnvelopeModifications,
    #[strum(serialize = "OtherHVAC")]
    OtherHvac,
    WaterAndSewerConservationSystems,
}

/// Maps (category, measure name) to a module binding. IndexMap keeps the iteration
/// order deterministic, which the assembly ordering contract depends on.
pub type CategoryTable = IndexMap<MeasureCategory, IndexMap<&'static str, ModuleBinding>>;

lazy_static! {
    pub static ref CATEGORY_TABLE: CategoryTable = build_category_table();
}

fn build_category_table() -> CategoryTable {
    let binding = |module_name, arguments| ModuleBinding {
        module_name,
        arguments,
    };
    IndexMap::from([
        (
            MeasureCategory::LightingImprovements,
            IndexMap::from([
                (
                    "Retrofit with light emitting diode technologies",
                    binding(
                        "set_lighting_loads_by_lpd",
                        vec![
                            ArgumentSpec::new("lpd", json!(0.6)),
                            ArgumentSpec::when(
                                "excluded_space_types",
                                json!("Warehouse - unconditioned"),
                                Predicate::BuildingTypeEquals("Warehouse"),
                            ),
                        ],
                    ),
                ),
                (
                    "Add daylight controls",
                    binding(
                        "add_daylight_sensors",
                        vec![
                            ArgumentSpec::new("setpoint_lux", json!(300.0)),
                            ArgumentSpec::when(
                                "fraction_of_zone_controlled",
                                json!(0.5),
                                Predicate::BuildingTypeEquals("Office"),
                            ),
                        ],
                    ),
                ),
            ]),
        ),
        (
            MeasureCategory::PlugLoadReductions,
            IndexMap::from([
                (
                    "Replace with ENERGY STAR rated",
                    binding(
                        "reduce_electric_equipment_loads_by_percentage",
                        vec![ArgumentSpec::new(
                            "elecequip_power_reduction_percent",
                            json!(10.0),
                        )],
                    ),
                ),
                (
                    "Install plug load controls",
                    binding(
                        "add_plug_load_controls",
                        vec![
                            ArgumentSpec::new("occupancy_sensing", json!(true)),
                            ArgumentSpec::when(
                                "schedule_reduction_fraction",
                                json!(0.25),
                                Predicate::BuildingTypeEquals("Office"),
                            ),
                        ],
                    ),
                ),
            ]),
        ),
        (
            MeasureCategory::BuildingEnvelopeModifications,
            IndexMap::from([
                (
                    "Air seal envelope",
                    binding(
                        "reduce_space_infiltration_by_percentage",
                        vec![ArgumentSpec::new(
                            "space_infiltration_reduction_percent",
                            json!(25.0),
                        )],
                    ),
                ),
                (
                    "Increase wall insulation",
                    binding(
                        "increase_insulation_r_value_for_exterior_walls",
                        vec![ArgumentSpec::new("r_value", json!(13.0))],
                    ),
                ),
            ]),
        ),
        (
            MeasureCategory::OtherHvac,
            IndexMap::from([
                (
                    "Replace burner",
                    binding(
                        "replace_boiler_burner",
                        vec![
                            ArgumentSpec::new("efficiency", json!(0.93)),
                            ArgumentSpec::when(
                                "fuel_type",
                                json!("NaturalGas"),
                                Predicate::SystemTypeContains("Hot Water"),
                            ),
                        ],
                    ),
                ),
                (
                    "Install demand control ventilation",
                    binding(
                        "enable_demand_controlled_ventilation",
                        vec![ArgumentSpec::new("dcv_type", json!("EnabledAtAllAHUs"))],
                    ),
                ),
            ]),
        ),
        (
            MeasureCategory::WaterAndSewerConservationSystems,
            IndexMap::from([(
                "Install low-flow faucets",
                binding(
                    "reduce_water_use_by_percentage",
                    vec![ArgumentSpec::new("water_use_reduction_percent", json!(15.0))],
                ),
            )]),
        ),
    ])
}

/// Turns the shared template plus a scenario's measure references into a
/// scenario-specific descriptor. The template and table are read-only; each
/// scenario gets an independent deep copy, so concurrent assembly cannot
/// interfere.
pub struct WorkflowAssembler<'a> {
    template: &'a Workflow,
    table: &'a CategoryTable,
    context: &'a FacilityContext,
}

impl<'a> WorkflowAssembler<'a> {
    pub fn new(
        template: &'a Workflow,
        table: &'a CategoryTable,
        context: &'a FacilityContext,
    ) -> Self {
        Self {
            template,
            table,
            context,
        }
    }

    pub fn configure_workflow_for_scenario(
        &self,
        scenario: &Scenario,
        measures: &IndexMap<String, Measure>,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Workflow {
        let mut workflow = self.template.clone();
        let expected = scenario.measure_ids().len();
        let mut found = 0_usize;

        for measure_id in scenario.measure_ids() {
            let Some(measure) = measures.get(measure_id) else {
                diagnostics.push(Diagnostic::warning(format!(
                    "scenario \"{}\" references unknown measure \"{measure_id}\"",
                    scenario.id()
                )));
                continue;
            };
            if self.bind_measure(&mut workflow, measure, diagnostics) {
                found += 1;
            } else {
                diagnostics.push(Diagnostic::error(format!(
                    "no workflow steps bound for measure \"{measure_id}\""
                )));
            }
        }

        // expected-vs-found reconciliation; a mismatch is surfaced but never
        // aborts assembly
        if found != expected {
            error!(
                scenario_id = scenario.id(),
                expected, found, "measure count mismatch during workflow assembly"
            );
            diagnostics.push(Diagnostic::error(format!(
                "expected {expected} measure(s) for scenario \"{}\" but bound {found}",
                scenario.id()
            )));
        }

        purge_skipped_steps(&mut workflow);
        workflow
    }

    fn bind_measure(
        &self,
        workflow: &mut Workflow,
        measure: &Measure,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> bool {
        let Some(category_tag) = measure.category.as_deref() else {
            diagnostics.push(Diagnostic::warning(format!(
                "measure \"{}\" has no technology category",
                measure.id
            )));
            return false;
        };
        let bindings = MeasureCategory::from_str(category_tag)
            .ok()
            .and_then(|category| self.table.get(&category));
        let Some(bindings) = bindings else {
            diagnostics.push(Diagnostic::warning(format!(
                "category \"{category_tag}\" is not in the workflow mapping table"
            )));
            return false;
        };
        let Some(name) = measure.effective_name() else {
            diagnostics.push(Diagnostic::warning(format!(
                "measure \"{}\" has no usable name",
                measure.id
            )));
            return false;
        };

        let mut bound = 0_usize;
        for (entry_name, binding) in bindings {
            if *entry_name != name {
                continue;
            }
            if self.bind_module(workflow, binding) {
                bound += 1;
            }
        }
        if bound == 0 {
            diagnostics.push(Diagnostic::warning(format!(
                "measure name \"{name}\" not found under category \"{category_tag}\""
            )));
        }
        bound > 0
    }

    fn bind_module(&self, workflow: &mut Workflow, binding: &ModuleBinding) -> bool {
        if !workflow
            .steps
            .iter()
            .any(|step| step.module_name == binding.module_name)
        {
            let kind = module_kind(binding.module_name);
            let position = workflow
                .steps
                .iter()
                .filter(|step| module_kind(&step.module_name) == kind)
                .count();
            let step = WorkflowStep::bare(binding.module_name);
            if !insert_module_at_position(workflow, step, kind, position) {
                return false;
            }
        }

        for step in workflow
            .steps
            .iter_mut()
            .filter(|step| step.module_name == binding.module_name)
        {
            for argument in &binding.arguments {
                let applies = argument
                    .condition
                    .as_ref()
                    .map(|condition| condition.matches(self.context))
                    .unwrap_or(true);
                if applies {
                    step.arguments
                        .insert(argument.name.to_string(), argument.value.clone());
                }
            }
        }
        true
    }
}

fn purge_skipped_steps(workflow: &mut Workflow) {
    workflow
        .steps
        .retain(|step| step.arguments.get(SKIP_ARGUMENT) != Some(&Value::Bool(true)));
}
