use crate::errors::Diagnostic;
use crate::model::{
    EnergyResource, PackageSavings, Report, ResourceUse, Scenario, TimeSeries, ALL_END_USES,
};
use crate::units::{convert, EnergyUnit};
use anyhow::{bail, Context};
use chrono::{Duration, Months, NaiveDate, NaiveDateTime};
use indexmap::IndexMap;
use lazy_static::lazy_static;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::error;

pub const RESULTS_FILE: &str = "results.json";
pub const IP_UNITS: &str = "IP";
const ANNUAL_COST_KEY: &str = "annual_utility_cost_dollars";
const MONTH_KEYS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

/// The engine's structured numeric output: a units gate plus flat key/value
/// maps for annual and monthly quantities.
#[derive(Clone, Debug, Deserialize)]
pub struct EngineResults {
    pub units: String,
    #[serde(default)]
    pub completed_status: Option<String>,
    #[serde(default)]
    pub annual: IndexMap<String, f64>,
    #[serde(default)]
    pub monthly: IndexMap<String, f64>,
}

pub fn parse_engine_results(raw: &str) -> anyhow::Result<EngineResults> {
    let results: EngineResults = serde_json::from_str(raw)?;
    if results.units != IP_UNITS {
        bail!(
            "engine results are in \"{}\" units; only {IP_UNITS} results are supported",
            results.units
        );
    }
    Ok(results)
}

pub fn load_engine_results(run_dir: &Path) -> anyhow::Result<EngineResults> {
    let path = run_dir.join(RESULTS_FILE);
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("could not read engine results {}", path.display()))?;
    parse_engine_results(&raw)
}

#[derive(Clone, Copy, Debug)]
pub enum ResourceUseField {
    ConsistentUnits,
    PeakConsistentUnits,
    NativeUnits,
}

#[derive(Clone, Copy, Debug)]
pub struct FieldMapping {
    pub engine_key: &'static str,
    pub engine_unit: EnergyUnit,
    pub field: ResourceUseField,
    pub document_unit: EnergyUnit,
}

/// Declarative mapping from engine output keys to one resource use's fields,
/// plus the key template for its monthly output block.
#[derive(Clone, Debug)]
pub struct ResourceMapping {
    pub resource: EnergyResource,
    pub end_use: &'static str,
    pub fields: Vec<FieldMapping>,
    pub monthly_key_template: Option<&'static str>,
    pub monthly_unit: EnergyUnit,
}

#[derive(Clone, Copy, Debug)]
pub enum TotalField {
    SiteEnergyUse,
    SiteEnergyUseIntensity,
}

#[derive(Clone, Copy, Debug)]
pub struct TotalMapping {
    pub engine_key: &'static str,
    pub engine_unit: EnergyUnit,
    pub field: TotalField,
    pub document_unit: EnergyUnit,
}

lazy_static! {
    pub static ref RESOURCE_MAPPINGS: Vec<ResourceMapping> = vec![
        ResourceMapping {
            resource: EnergyResource::Electricity,
            end_use: ALL_END_USES,
            fields: vec![
                FieldMapping {
                    engine_key: "fuel_electricity",
                    engine_unit: EnergyUnit::KBtu,
                    field: ResourceUseField::ConsistentUnits,
                    document_unit: EnergyUnit::MMBtu,
                },
                FieldMapping {
                    engine_key: "fuel_electricity",
                    engine_unit: EnergyUnit::KBtu,
                    field: ResourceUseField::NativeUnits,
                    document_unit: EnergyUnit::KilowattHours,
                },
                FieldMapping {
                    engine_key: "annual_peak_electric_demand",
                    engine_unit: EnergyUnit::Kilowatts,
                    field: ResourceUseField::PeakConsistentUnits,
                    document_unit: EnergyUnit::Kilowatts,
                },
            ],
            monthly_key_template: Some("electricity_ip_{month}"),
            monthly_unit: EnergyUnit::KBtu,
        },
        ResourceMapping {
            resource: EnergyResource::NaturalGas,
            end_use: ALL_END_USES,
            fields: vec![
                FieldMapping {
                    engine_key: "fuel_natural_gas",
                    engine_unit: EnergyUnit::KBtu,
                    field: ResourceUseField::ConsistentUnits,
                    document_unit: EnergyUnit::MMBtu,
                },
                FieldMapping {
                    engine_key: "fuel_natural_gas",
                    engine_unit: EnergyUnit::KBtu,
                    field: ResourceUseField::NativeUnits,
                    document_unit: EnergyUnit::MMBtu,
                },
            ],
            monthly_key_template: Some("natural_gas_ip_{month}"),
            monthly_unit: EnergyUnit::KBtu,
        },
    ];

    pub static ref TOTAL_MAPPINGS: Vec<TotalMapping> = vec![
        TotalMapping {
            engine_key: "total_site_energy",
            engine_unit: EnergyUnit::KBtu,
            field: TotalField::SiteEnergyUse,
            document_unit: EnergyUnit::KBtu,
        },
        TotalMapping {
            engine_key: "total_site_eui",
            engine_unit: EnergyUnit::KBtuPerSquareFoot,
            field: TotalField::SiteEnergyUseIntensity,
            document_unit: EnergyUnit::KBtuPerSquareFoot,
        },
    ];
}

/// First instant of the month and the last minute of the month. The end is
/// start-of-next-month minus one minute, a closed-interval convention
/// downstream consumers depend on. `None` when the year falls outside the
/// calendar range chrono can represent.
fn month_bounds(year: i32, month: u32) -> Option<(NaiveDateTime, NaiveDateTime)> {
    let start_date = NaiveDate::from_ymd_opt(year, month, 1)?;
    let start = start_date.and_hms_opt(0, 0, 0)?;
    let next_month = start_date
        .checked_add_months(Months::new(1))?
        .and_hms_opt(0, 0, 0)?;
    Some((start, next_month - Duration::minutes(1)))
}

/// Fold one scenario's engine output back into the model. Result records are
/// regenerated from scratch; every missing datum is a logged diagnostic, not
/// an abort.
pub fn aggregate_scenario(
    scenario: &mut Scenario,
    results: &EngineResults,
    year: i32,
    diagnostics: &mut Vec<Diagnostic>,
) {
    scenario.clear_results();

    for mapping in RESOURCE_MAPPINGS.iter() {
        for field in &mapping.fields {
            let Some(&raw) = results.annual.get(field.engine_key) else {
                diagnostics.push(Diagnostic::error(format!(
                    "engine output has no value for key \"{}\"",
                    field.engine_key
                )));
                continue;
            };
            match convert(raw, field.engine_unit, field.document_unit) {
                Ok(value) => {
                    let resource_use =
                        scenario.ensure_resource_use(mapping.resource, mapping.end_use);
                    match field.field {
                        ResourceUseField::ConsistentUnits => {
                            resource_use.annual_fuel_use_consistent_units = Some(value);
                        }
                        ResourceUseField::PeakConsistentUnits => {
                            resource_use.annual_peak_consistent_units = Some(value);
                        }
                        ResourceUseField::NativeUnits => {
                            resource_use.annual_fuel_use_native_units = Some(value);
                        }
                    }
                }
                Err(conversion_error) => {
                    diagnostics.push(Diagnostic::error(conversion_error.to_string()));
                }
            }
        }
    }

    for mapping in TOTAL_MAPPINGS.iter() {
        let Some(&raw) = results.annual.get(mapping.engine_key) else {
            diagnostics.push(Diagnostic::error(format!(
                "engine output has no value for key \"{}\"",
                mapping.engine_key
            )));
            continue;
        };
        match convert(raw, mapping.engine_unit, mapping.document_unit) {
            Ok(value) => {
                let total = scenario.ensure_all_resource_total(ALL_END_USES);
                match mapping.field {
                    TotalField::SiteEnergyUse => total.site_energy_use = Some(value),
                    TotalField::SiteEnergyUseIntensity => {
                        total.site_energy_use_intensity = Some(value)
                    }
                }
            }
            Err(conversion_error) => {
                diagnostics.push(Diagnostic::error(conversion_error.to_string()));
            }
        }
    }

    // utility cost is already in dollars; no unit conversion applies
    scenario.set_annual_cost(results.annual.get(ANNUAL_COST_KEY).copied());

    aggregate_monthly(scenario, results, year, diagnostics);
}

/// Month-by-month time series, restricted to resources reporting against
/// "All end uses". Missing keys are skipped; partial monthly data is an
/// accepted outcome.
fn aggregate_monthly(
    scenario: &mut Scenario,
    results: &EngineResults,
    year: i32,
    diagnostics: &mut Vec<Diagnostic>,
) {
    // an unrepresentable year poisons every timestamp, so reject it once
    // up front instead of emitting twelve diagnostics per resource
    if month_bounds(year, 1).is_none() || month_bounds(year, 12).is_none() {
        diagnostics.push(Diagnostic::error(format!(
            "year {year} is outside the supported calendar range; monthly time series skipped"
        )));
        return;
    }

    let scenario_id = scenario.id().to_string();
    for mapping in RESOURCE_MAPPINGS.iter() {
        let Some(template) = mapping.monthly_key_template else {
            continue;
        };
        if mapping.end_use != ALL_END_USES {
            continue;
        }
        let resource_use_id =
            ResourceUse::synthetic_id(&scenario_id, mapping.resource, mapping.end_use);
        let native_unit = mapping.resource.native_unit();

        for (month_idx, month_key) in MONTH_KEYS.iter().enumerate() {
            let key = template.replace("{month}", month_key);
            let Some(&raw) = results.monthly.get(&key) else {
                error!(scenario_id = %scenario_id, key, "monthly engine output key missing");
                diagnostics.push(Diagnostic::error(format!(
                    "monthly engine output key \"{key}\" missing for scenario \"{scenario_id}\""
                )));
                continue;
            };
            let value = match convert(raw, mapping.monthly_unit, native_unit) {
                Ok(value) => value,
                Err(conversion_error) => {
                    diagnostics.push(Diagnostic::error(conversion_error.to_string()));
                    continue;
                }
            };
            let month = month_idx as u32 + 1;
            let Some((start, end)) = month_bounds(year, month) else {
                continue;
            };
            scenario.push_time_series(TimeSeries {
                id: format!("{resource_use_id}-TS-{month:02}"),
                reading_type: "Total".to_string(),
                quantity: "Energy".to_string(),
                start_timestamp: start,
                end_timestamp: end,
                interval_frequency: "Month".to_string(),
                interval_reading: value,
                resource_use_id: resource_use_id.clone(),
            });
        }
    }
}

/// Baseline-minus-scenario savings for every package-of-measures scenario.
/// Returns the ids of scenarios for which the delta could not be computed; a
/// missing baseline and a missing scenario result are both non-fatal.
pub fn compute_package_savings(
    report: &mut Report,
    diagnostics: &mut Vec<Diagnostic>,
) -> Vec<String> {
    let baseline = report
        .cb_modeled()
        .map(|baseline| (baseline.site_energy_use(), baseline.annual_cost()));
    let pom_indices = report.pom_indices().to_vec();
    let mut failed = Vec::new();

    for idx in pom_indices {
        let scenario = report.scenario_at_mut(idx);
        let scenario_id = scenario.id().to_string();

        let Some((baseline_energy, baseline_cost)) = baseline else {
            diagnostics.push(Diagnostic::error(format!(
                "no current-building modeled baseline; cannot compute savings for \"{scenario_id}\""
            )));
            failed.push(scenario_id);
            continue;
        };
        let (Some(baseline_energy), Some(scenario_energy)) =
            (baseline_energy, scenario.site_energy_use())
        else {
            diagnostics.push(Diagnostic::error(format!(
                "missing site energy results; cannot compute savings for \"{scenario_id}\""
            )));
            failed.push(scenario_id);
            continue;
        };

        let energy_savings = match convert(
            baseline_energy - scenario_energy,
            EnergyUnit::KBtu,
            EnergyUnit::MMBtu,
        ) {
            Ok(value) => value,
            Err(conversion_error) => {
                diagnostics.push(Diagnostic::error(conversion_error.to_string()));
                failed.push(scenario_id);
                continue;
            }
        };
        let cost_savings = match (baseline_cost, scenario.annual_cost()) {
            (Some(baseline_cost), Some(scenario_cost)) => Some(baseline_cost - scenario_cost),
            _ => None,
        };
        let source_completion_status = scenario
            .engine_results()
            .and_then(|results| results.completed_status.clone());

        scenario.set_package_savings(PackageSavings {
            annual_savings_site_energy: Some(energy_savings),
            annual_savings_cost: cost_savings,
            source_completion_status,
        });
    }

    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AuditDocument, Facility};
    use crate::xml::parse_document;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use rstest::*;
    use serde_json::json;

    fn pom_scenario(id: &str) -> Scenario {
        let xml = format!(
            r#"<Scenario ID="{id}"><ScenarioType><PackageOfMeasures/></ScenarioType></Scenario>"#
        );
        Scenario::from_element(&parse_document(xml.as_bytes()).unwrap()).unwrap()
    }

    fn engine_results(missing_month: Option<&str>) -> EngineResults {
        let mut monthly = IndexMap::new();
        for month in MONTH_KEYS {
            if Some(month) != missing_month {
                monthly.insert(format!("electricity_ip_{month}"), 8000.0);
            }
            monthly.insert(format!("natural_gas_ip_{month}"), 4000.0);
        }
        EngineResults {
            units: IP_UNITS.to_string(),
            completed_status: Some("Success".to_string()),
            annual: IndexMap::from([
                ("fuel_electricity".to_string(), 100_000.0),
                ("annual_peak_electric_demand".to_string(), 120.0),
                ("fuel_natural_gas".to_string(), 50_000.0),
                ("total_site_energy".to_string(), 150_000.0),
                ("total_site_eui".to_string(), 45.2),
                (ANNUAL_COST_KEY.to_string(), 123_456.0),
            ]),
            monthly,
        }
    }

    #[rstest]
    #[case(2021, 1, "2021-01-01T00:00:00", "2021-01-31T23:59:00")]
    #[case(2021, 4, "2021-04-01T00:00:00", "2021-04-30T23:59:00")]
    #[case(2020, 2, "2020-02-01T00:00:00", "2020-02-29T23:59:00")]
    #[case(2021, 12, "2021-12-01T00:00:00", "2021-12-31T23:59:00")]
    fn month_bounds_use_last_minute_of_month(
        #[case] year: i32,
        #[case] month: u32,
        #[case] expected_start: &str,
        #[case] expected_end: &str,
    ) {
        let (start, end) = month_bounds(year, month).unwrap();
        assert_eq!(start.format("%Y-%m-%dT%H:%M:%S").to_string(), expected_start);
        assert_eq!(end.format("%Y-%m-%dT%H:%M:%S").to_string(), expected_end);
    }

    #[rstest]
    fn out_of_range_year_is_a_diagnostic_not_a_panic() {
        assert!(month_bounds(i32::MAX, 1).is_none());

        let mut scenario = pom_scenario("POM-1");
        let mut diagnostics = Vec::new();
        aggregate_scenario(&mut scenario, &engine_results(None), i32::MAX, &mut diagnostics);

        assert!(scenario.get_time_series_data().is_empty());
        assert!(diagnostics
            .iter()
            .any(|d| d.message.contains("outside the supported calendar range")));
        // the annual pass is year-independent and still runs
        assert_eq!(scenario.get_resource_uses().len(), 2);
    }

    #[rstest]
    fn si_results_are_rejected() {
        let raw = json!({"units": "SI", "annual": {}}).to_string();
        let error = parse_engine_results(&raw).unwrap_err();
        assert!(error.to_string().contains("only IP results are supported"));
    }

    #[rstest]
    fn annual_pass_converts_and_fills_resource_uses() {
        let mut scenario = pom_scenario("POM-1");
        let mut diagnostics = Vec::new();
        aggregate_scenario(&mut scenario, &engine_results(None), 2021, &mut diagnostics);

        let electricity = scenario
            .get_resource_uses()
            .iter()
            .find(|ru| ru.energy_resource == EnergyResource::Electricity)
            .unwrap();
        assert_relative_eq!(
            electricity.annual_fuel_use_consistent_units.unwrap(),
            100.0,
            max_relative = 0.01
        );
        assert_relative_eq!(
            electricity.annual_fuel_use_native_units.unwrap(),
            29_307.1,
            max_relative = 0.01
        );
        assert_eq!(electricity.annual_peak_consistent_units, Some(120.0));

        let gas = scenario
            .get_resource_uses()
            .iter()
            .find(|ru| ru.energy_resource == EnergyResource::NaturalGas)
            .unwrap();
        assert_relative_eq!(
            gas.annual_fuel_use_consistent_units.unwrap(),
            50.0,
            max_relative = 0.01
        );

        let total = &scenario.get_all_resource_totals()[0];
        assert_eq!(total.end_use, ALL_END_USES);
        assert_eq!(total.site_energy_use, Some(150_000.0));
        assert_eq!(total.site_energy_use_intensity, Some(45.2));
        assert_eq!(scenario.annual_cost(), Some(123_456.0));
    }

    #[rstest]
    fn monthly_pass_generates_twelve_series_per_resource() {
        let mut scenario = pom_scenario("POM-1");
        let mut diagnostics = Vec::new();
        aggregate_scenario(&mut scenario, &engine_results(None), 2021, &mut diagnostics);

        assert_eq!(scenario.get_time_series_data().len(), 24);
        let january = &scenario.get_time_series_data()[0];
        assert_eq!(
            january.resource_use_id,
            ResourceUse::synthetic_id("POM-1", EnergyResource::Electricity, ALL_END_USES)
        );
        assert_eq!(january.interval_frequency, "Month");
        // 8000 kBtu converted to the electricity native unit (kWh)
        assert_relative_eq!(january.interval_reading, 2344.57, max_relative = 0.01);
        // gas stays in MMBtu
        let gas_january = scenario
            .get_time_series_data()
            .iter()
            .find(|ts| ts.resource_use_id.contains("Naturalgas"))
            .unwrap();
        assert_relative_eq!(gas_january.interval_reading, 4.0, max_relative = 0.01);
    }

    #[rstest]
    fn missing_monthly_key_is_skipped_not_fatal() {
        let mut scenario = pom_scenario("POM-1");
        let mut diagnostics = Vec::new();
        aggregate_scenario(&mut scenario, &engine_results(Some("jun")), 2021, &mut diagnostics);

        // 11 electricity months + 12 gas months
        assert_eq!(scenario.get_time_series_data().len(), 23);
        assert!(diagnostics
            .iter()
            .any(|d| d.message.contains("electricity_ip_jun")));
    }

    #[rstest]
    fn aggregation_is_regeneration_not_patching() {
        let mut scenario = pom_scenario("POM-1");
        let mut diagnostics = Vec::new();
        aggregate_scenario(&mut scenario, &engine_results(None), 2021, &mut diagnostics);
        let first_run_series = scenario.get_time_series_data().len();
        aggregate_scenario(&mut scenario, &engine_results(None), 2021, &mut diagnostics);
        assert_eq!(scenario.get_time_series_data().len(), first_run_series);
        assert_eq!(scenario.get_resource_uses().len(), 2);
    }

    fn report_with_baseline_and_pom(include_baseline: bool) -> Report {
        let baseline = if include_baseline {
            r#"<Scenario ID="Baseline"><ScenarioType>
              <CurrentBuilding><CalculationMethod><Modeled/></CalculationMethod></CurrentBuilding>
            </ScenarioType></Scenario>"#
        } else {
            ""
        };
        let xml = format!(
            r#"<BuildingSync><Facilities><Facility ID="F"><Reports><Report ID="R"><Scenarios>
              {baseline}
              <Scenario ID="POM-1"><ScenarioType><PackageOfMeasures/></ScenarioType></Scenario>
            </Scenarios></Report></Reports></Facility></Facilities></BuildingSync>"#
        );
        let document = AuditDocument::parse(xml.as_bytes()).unwrap();
        Facility::from_document(&document).unwrap().report
    }

    #[rstest]
    fn savings_are_baseline_minus_scenario() {
        let mut report = report_with_baseline_and_pom(true);
        let mut diagnostics = Vec::new();
        {
            let baseline_idx = 0;
            let baseline = report.scenario_at_mut(baseline_idx);
            baseline.ensure_all_resource_total(ALL_END_USES).site_energy_use = Some(150_000.0);
            baseline.set_annual_cost(Some(100_000.0));
        }
        {
            let pom = report.scenario_at_mut(1);
            pom.ensure_all_resource_total(ALL_END_USES).site_energy_use = Some(120_000.0);
            pom.set_annual_cost(Some(90_000.0));
        }

        let failed = compute_package_savings(&mut report, &mut diagnostics);
        assert!(failed.is_empty());
        let savings = report
            .poms()
            .next()
            .unwrap()
            .package_savings()
            .unwrap()
            .clone();
        // 30,000 kBtu of savings expressed in MMBtu
        assert_relative_eq!(
            savings.annual_savings_site_energy.unwrap(),
            30.0,
            max_relative = 0.01
        );
        assert_eq!(savings.annual_savings_cost, Some(10_000.0));
    }

    #[rstest]
    fn missing_baseline_adds_scenario_to_failed_list() {
        let mut report = report_with_baseline_and_pom(false);
        let mut diagnostics = Vec::new();
        let failed = compute_package_savings(&mut report, &mut diagnostics);
        assert_eq!(failed, vec!["POM-1".to_string()]);
        assert!(report.poms().next().unwrap().package_savings().is_none());
    }

    #[rstest]
    fn missing_scenario_result_adds_scenario_to_failed_list() {
        let mut report = report_with_baseline_and_pom(true);
        let mut diagnostics = Vec::new();
        report
            .scenario_at_mut(0)
            .ensure_all_resource_total(ALL_END_USES)
            .site_energy_use = Some(150_000.0);
        // the pom itself has no results
        let failed = compute_package_savings(&mut report, &mut diagnostics);
        assert_eq!(failed, vec!["POM-1".to_string()]);
    }
}
