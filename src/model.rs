use crate::errors::StructuralError;
use crate::results::EngineResults;
use crate::units::EnergyUnit;
use crate::workflow::Workflow;
use crate::xml::{parse_document, write_document, Element};
use chrono::{NaiveDate, NaiveDateTime};
use indexmap::IndexMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use strum_macros::{Display, EnumString};
use tracing::{debug, warn};

pub const ALL_END_USES: &str = "All end uses";
pub const OTHER_MEASURE_NAME: &str = "Other";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// The parsed audit document. The element tree stays the single source of
/// truth for everything the typed model does not interpret; scenario result
/// elements are regenerated from the model on [`AuditDocument::write_back`].
#[derive(Clone, Debug)]
pub struct AuditDocument {
    root: Element,
}

impl AuditDocument {
    pub fn parse(input: impl Read) -> anyhow::Result<Self> {
        let root = parse_document(input)?;
        let document = Self { root };
        // single-facility invariant is a parse-time hard error
        document.facility_element()?;
        Ok(document)
    }

    pub fn root(&self) -> &Element {
        &self.root
    }

    pub fn facility_element(&self) -> Result<&Element, StructuralError> {
        let mut found = Vec::new();
        collect_facilities(&self.root, &mut found);
        match found.as_slice() {
            [single] => Ok(single),
            _ => Err(StructuralError::FacilityCount(found.len())),
        }
    }

    /// Replace each simulated scenario's persisted result elements with
    /// elements regenerated from the model. Old elements are deleted and
    /// rebuilt, not patched, so the document cannot drift from the latest
    /// engine run. Scenarios the engine never touches (measured, benchmark,
    /// target, unclassified) keep their authored elements untouched.
    pub fn write_back(&mut self, report: &Report) -> Result<(), StructuralError> {
        self.facility_element()?;
        let facility = find_facility_mut(&mut self.root)
            .expect("facility presence was just validated");
        let Some(scenarios_element) = facility.tag_path_mut(&["Reports", "Report", "Scenarios"])
        else {
            return Ok(());
        };
        for scenario in report.scenarios() {
            if !scenario.is_simulated() {
                continue;
            }
            let matching = scenarios_element
                .children
                .iter_mut()
                .find(|el| el.tag == "Scenario" && el.attribute("ID") == Some(scenario.id()));
            if let Some(element) = matching {
                scenario.regenerate_element(element);
            }
        }
        Ok(())
    }

    pub fn serialize(&self, out: impl Write) -> anyhow::Result<()> {
        write_document(&self.root, out)
    }
}

fn collect_facilities<'a>(element: &'a Element, found: &mut Vec<&'a Element>) {
    if element.tag == "Facility" {
        found.push(element);
        return;
    }
    for child in &element.children {
        collect_facilities(child, found);
    }
}

fn find_facility_mut(element: &mut Element) -> Option<&mut Element> {
    if element.tag == "Facility" {
        return Some(element);
    }
    for child in &mut element.children {
        if let Some(found) = find_facility_mut(child) {
            return Some(found);
        }
    }
    None
}

/// The handful of facility attributes the workflow assembler's conditional
/// predicates read, passed explicitly rather than through ambient state.
#[derive(Clone, Debug, Default)]
pub struct FacilityContext {
    pub building_type: Option<String>,
    pub system_type: Option<String>,
    pub gross_floor_area: Option<f64>,
}

#[derive(Clone, Debug)]
pub struct Facility {
    pub id: Option<String>,
    pub site: Option<Site>,
    pub context: FacilityContext,
    pub measures: IndexMap<String, Measure>,
    pub report: Report,
}

impl Facility {
    pub fn from_document(document: &AuditDocument) -> Result<Self, StructuralError> {
        Self::from_element(document.facility_element()?)
    }

    pub fn from_element(element: &Element) -> Result<Self, StructuralError> {
        element.expect_tag("Facility")?;
        let id = element.attribute("ID").map(str::to_string);

        let site_elements: Vec<&Element> = element
            .tag_path(&["Sites"])
            .map(|sites| sites.children_with_tag("Site").collect())
            .unwrap_or_default();
        if site_elements.len() > 1 {
            return Err(StructuralError::TooMany {
                tag: "Site",
                count: site_elements.len(),
            });
        }
        let site = site_elements
            .first()
            .map(|el| Site::from_element(el))
            .transpose()?;

        let mut measures = IndexMap::new();
        if let Some(measures_element) = element.tag_path(&["Measures"]) {
            for measure_element in measures_element.children_with_tag("Measure") {
                let measure = Measure::from_element(measure_element)?;
                measures.insert(measure.id.clone(), measure);
            }
        }

        let report_element =
            element
                .tag_path(&["Reports", "Report"])
                .ok_or(StructuralError::MissingChild {
                    tag: "Facility",
                    child: "Report",
                })?;
        let report = Report::from_element(report_element)?;

        let building = site.as_ref().and_then(|site| site.building.as_ref());
        let context = FacilityContext {
            building_type: building
                .and_then(|b| b.occupancy_classification.clone())
                .or_else(|| site.as_ref().and_then(|s| s.occupancy_classification.clone())),
            system_type: element
                .tag_path_text(&[
                    "Systems",
                    "HVACSystems",
                    "HVACSystem",
                    "PrincipalHVACSystemType",
                ])
                .map(str::to_string),
            gross_floor_area: building.and_then(|b| b.gross_floor_area),
        };

        Ok(Self {
            id,
            site,
            context,
            measures,
            report,
        })
    }
}

#[derive(Clone, Debug)]
pub struct Site {
    pub id: Option<String>,
    pub occupancy_classification: Option<String>,
    pub building: Option<Building>,
}

impl Site {
    pub fn from_element(element: &Element) -> Result<Self, StructuralError> {
        element.expect_tag("Site")?;
        let building_elements: Vec<&Element> = element
            .tag_path(&["Buildings"])
            .map(|buildings| buildings.children_with_tag("Building").collect())
            .unwrap_or_default();
        if building_elements.len() > 1 {
            return Err(StructuralError::TooMany {
                tag: "Building",
                count: building_elements.len(),
            });
        }
        let building = building_elements
            .first()
            .map(|el| Building::from_element(el))
            .transpose()?;
        Ok(Self {
            id: element.attribute("ID").map(str::to_string),
            occupancy_classification: element
                .tag_path_text(&["OccupancyClassification"])
                .map(str::to_string),
            building,
        })
    }
}

#[derive(Clone, Debug)]
pub struct Building {
    pub id: Option<String>,
    pub name: Option<String>,
    pub occupancy_classification: Option<String>,
    pub gross_floor_area: Option<f64>,
    pub sections: Vec<Section>,
}

impl Building {
    pub fn from_element(element: &Element) -> Result<Self, StructuralError> {
        element.expect_tag("Building")?;
        let gross_floor_area = element
            .tag_path(&["FloorAreas"])
            .and_then(|areas| {
                areas.children_with_tag("FloorArea").find(|area| {
                    area.tag_path_text(&["FloorAreaType"]) == Some("Gross")
                })
            })
            .and_then(|area| area.tag_path_text(&["FloorAreaValue"]))
            .and_then(|value| value.parse::<f64>().ok());
        let sections = element
            .tag_path(&["Sections"])
            .map(|sections| {
                sections
                    .children_with_tag("Section")
                    .map(Section::from_element)
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?
            .unwrap_or_default();
        Ok(Self {
            id: element.attribute("ID").map(str::to_string),
            name: element.tag_path_text(&["PremisesName"]).map(str::to_string),
            occupancy_classification: element
                .tag_path_text(&["OccupancyClassification"])
                .map(str::to_string),
            gross_floor_area,
            sections,
        })
    }
}

#[derive(Clone, Debug)]
pub struct Section {
    pub id: Option<String>,
    pub section_type: Option<String>,
    pub occupancy_classification: Option<String>,
}

impl Section {
    pub fn from_element(element: &Element) -> Result<Self, StructuralError> {
        element.expect_tag("Section")?;
        Ok(Self {
            id: element.attribute("ID").map(str::to_string),
            section_type: element.tag_path_text(&["SectionType"]).map(str::to_string),
            occupancy_classification: element
                .tag_path_text(&["OccupancyClassification"])
                .map(str::to_string),
        })
    }
}

/// One named efficiency measure. The category is the tag nested under
/// `TechnologyCategories/TechnologyCategory`, mirroring the structural
/// classification used for scenarios.
#[derive(Clone, Debug)]
pub struct Measure {
    pub id: String,
    pub category: Option<String>,
    pub name: Option<String>,
    pub custom_name: Option<String>,
}

impl Measure {
    pub fn from_element(element: &Element) -> Result<Self, StructuralError> {
        element.expect_tag("Measure")?;
        let id = element
            .attribute("ID")
            .ok_or(StructuralError::MissingAttribute {
                tag: "Measure",
                attribute: "ID",
            })?
            .to_string();
        let category_element = element
            .tag_path(&["TechnologyCategories", "TechnologyCategory"])
            .and_then(|tc| tc.children.first());
        Ok(Self {
            id,
            category: category_element.map(|el| el.tag.clone()),
            name: category_element
                .and_then(|el| el.tag_path_text(&["MeasureName"]))
                .map(str::to_string),
            custom_name: category_element
                .and_then(|el| el.tag_path_text(&["CustomMeasureName"]))
                .map(str::to_string),
        })
    }

    /// Name used for module lookup. The `Other` sentinel redirects to the
    /// measure's custom name.
    pub fn effective_name(&self) -> Option<&str> {
        match self.name.as_deref() {
            Some(OTHER_MEASURE_NAME) => self.custom_name.as_deref(),
            other => other,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AuditDate {
    pub date: Option<NaiveDate>,
    pub date_type: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Report {
    scenarios: Vec<Scenario>,
    pub audit_dates: Vec<AuditDate>,
    pub utility_ids: Vec<String>,
    cb_modeled: Option<usize>,
    cb_measured: Vec<usize>,
    poms: Vec<usize>,
}

impl Report {
    pub fn from_element(element: &Element) -> Result<Self, StructuralError> {
        element.expect_tag("Report")?;
        let scenarios = element
            .tag_path(&["Scenarios"])
            .map(|scenarios| {
                scenarios
                    .children_with_tag("Scenario")
                    .map(Scenario::from_element)
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?
            .unwrap_or_default();

        let audit_dates = element
            .tag_path(&["AuditDates"])
            .map(|dates| {
                dates
                    .children_with_tag("AuditDate")
                    .map(|date| AuditDate {
                        date: date
                            .tag_path_text(&["Date"])
                            .and_then(|text| NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()),
                        date_type: date.tag_path_text(&["DateType"]).map(str::to_string),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let utility_ids = element
            .tag_path(&["Utilities"])
            .map(|utilities| {
                utilities
                    .children_with_tag("Utility")
                    .filter_map(|utility| utility.attribute("ID"))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        // classification views are derived once, at construction
        let mut cb_modeled = None;
        let mut cb_measured = Vec::new();
        let mut poms = Vec::new();
        for (idx, scenario) in scenarios.iter().enumerate() {
            if scenario.is_modeled() {
                if cb_modeled.is_some() {
                    warn!(
                        scenario_id = scenario.id(),
                        "more than one current-building modeled scenario; keeping the first"
                    );
                } else {
                    cb_modeled = Some(idx);
                }
            }
            if scenario.is_measured() {
                cb_measured.push(idx);
            }
            if scenario.is_package_of_measures() {
                poms.push(idx);
            }
        }

        Ok(Self {
            scenarios,
            audit_dates,
            utility_ids,
            cb_modeled,
            cb_measured,
            poms,
        })
    }

    pub fn scenarios(&self) -> &[Scenario] {
        &self.scenarios
    }

    pub fn scenarios_mut(&mut self) -> &mut [Scenario] {
        &mut self.scenarios
    }

    pub fn cb_modeled(&self) -> Option<&Scenario> {
        self.cb_modeled.map(|idx| &self.scenarios[idx])
    }

    pub fn cb_measured(&self) -> impl Iterator<Item = &Scenario> {
        self.cb_measured.iter().map(|&idx| &self.scenarios[idx])
    }

    pub fn poms(&self) -> impl Iterator<Item = &Scenario> {
        self.poms.iter().map(|&idx| &self.scenarios[idx])
    }

    pub fn pom_indices(&self) -> &[usize] {
        &self.poms
    }

    pub fn scenario_at_mut(&mut self, idx: usize) -> &mut Scenario {
        &mut self.scenarios[idx]
    }

    // benchmark/target existence is checked on demand, not cached
    pub fn has_benchmark(&self) -> bool {
        self.scenarios.iter().any(Scenario::is_benchmark)
    }

    pub fn has_target(&self) -> bool {
        self.scenarios.iter().any(Scenario::is_target)
    }
}

#[derive(Clone, Debug)]
pub struct Scenario {
    id: String,
    name: Option<String>,
    is_modeled: bool,
    is_measured: bool,
    is_pom: bool,
    is_benchmark: bool,
    is_target: bool,
    measure_ids: Vec<String>,
    resource_uses: Vec<ResourceUse>,
    all_resource_totals: Vec<AllResourceTotal>,
    time_series: Vec<TimeSeries>,
    annual_cost: Option<f64>,
    package_savings: Option<PackageSavings>,
    // transient execution state, never persisted to the document
    run_directory: Option<String>,
    output_dir: Option<PathBuf>,
    workflow: Option<Workflow>,
    engine_results: Option<EngineResults>,
}

impl Scenario {
    pub fn from_element(element: &Element) -> Result<Self, StructuralError> {
        element.expect_tag("Scenario")?;
        let id = element
            .attribute("ID")
            .ok_or(StructuralError::MissingAttribute {
                tag: "Scenario",
                attribute: "ID",
            })?
            .to_string();
        let name = element.tag_path_text(&["Name"]).map(str::to_string);

        let scenario_type = element.tag_path(&["ScenarioType"]);
        let calculation_method =
            scenario_type.and_then(|st| st.tag_path(&["CurrentBuilding", "CalculationMethod"]));
        let is_modeled = calculation_method
            .map(|cm| cm.child("Modeled").is_some())
            .unwrap_or(false);
        let is_measured = calculation_method
            .map(|cm| cm.child("Measured").is_some())
            .unwrap_or(false);
        let is_pom = scenario_type
            .map(|st| st.child("PackageOfMeasures").is_some())
            .unwrap_or(false);
        let is_benchmark = scenario_type
            .map(|st| st.child("Benchmark").is_some())
            .unwrap_or(false);
        let is_target = scenario_type
            .map(|st| st.child("Target").is_some())
            .unwrap_or(false);

        let measure_ids = scenario_type
            .and_then(|st| st.tag_path(&["PackageOfMeasures", "MeasureIDs"]))
            .map(|ids| {
                ids.children_with_tag("MeasureID")
                    .filter_map(|id| id.attribute("IDref"))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut resource_uses = Vec::new();
        let mut all_resource_totals = Vec::new();
        let mut time_series = Vec::new();
        if is_modeled || is_pom {
            // results for these scenarios are always engine-derived; any
            // previously-persisted data is purged on construction
            let persisted = element
                .tag_path(&["ResourceUses"])
                .map(|uses| uses.children.len())
                .unwrap_or(0)
                + element
                    .tag_path(&["AllResourceTotals"])
                    .map(|totals| totals.children.len())
                    .unwrap_or(0)
                + element
                    .tag_path(&["TimeSeriesData"])
                    .map(|data| data.children.len())
                    .unwrap_or(0);
            if persisted > 0 {
                debug!(scenario_id = %id, count = persisted, "purging persisted result elements");
            }
        } else {
            if let Some(uses) = element.tag_path(&["ResourceUses"]) {
                for resource_use in uses.children_with_tag("ResourceUse") {
                    resource_uses.push(ResourceUse::from_element(resource_use)?);
                }
            }
            if let Some(totals) = element.tag_path(&["AllResourceTotals"]) {
                for total in totals.children_with_tag("AllResourceTotal") {
                    all_resource_totals.push(AllResourceTotal::from_element(total)?);
                }
            }
            if let Some(data) = element.tag_path(&["TimeSeriesData"]) {
                for series in data.children_with_tag("TimeSeries") {
                    time_series.push(TimeSeries::from_element(series)?);
                }
            }
        }

        Ok(Self {
            id,
            name,
            is_modeled,
            is_measured,
            is_pom,
            is_benchmark,
            is_target,
            measure_ids,
            resource_uses,
            all_resource_totals,
            time_series,
            annual_cost: None,
            package_savings: None,
            run_directory: None,
            output_dir: None,
            workflow: None,
            engine_results: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_modeled(&self) -> bool {
        self.is_modeled
    }

    pub fn is_measured(&self) -> bool {
        self.is_measured
    }

    pub fn is_package_of_measures(&self) -> bool {
        self.is_pom
    }

    pub fn is_benchmark(&self) -> bool {
        self.is_benchmark
    }

    pub fn is_target(&self) -> bool {
        self.is_target
    }

    /// Whether this scenario is handed to the simulation engine.
    pub fn is_simulated(&self) -> bool {
        self.is_modeled || self.is_pom
    }

    pub fn classification(&self) -> &'static str {
        if self.is_modeled {
            "cb_modeled"
        } else if self.is_measured {
            "cb_measured"
        } else if self.is_pom {
            "pom"
        } else if self.is_benchmark {
            "benchmark"
        } else if self.is_target {
            "target"
        } else {
            "unclassified"
        }
    }

    pub fn measure_ids(&self) -> &[String] {
        &self.measure_ids
    }

    pub fn get_resource_uses(&self) -> &[ResourceUse] {
        &self.resource_uses
    }

    pub fn get_all_resource_totals(&self) -> &[AllResourceTotal] {
        &self.all_resource_totals
    }

    pub fn get_time_series_data(&self) -> &[TimeSeries] {
        &self.time_series
    }

    /// Drop all result records ahead of re-aggregation.
    pub fn clear_results(&mut self) {
        self.resource_uses.clear();
        self.all_resource_totals.clear();
        self.time_series.clear();
        self.annual_cost = None;
    }

    /// Locate or create the resource use for a (resource, end use) pair; the
    /// synthetic element id is deterministic so repeated aggregation runs
    /// converge on the same document.
    pub fn ensure_resource_use(
        &mut self,
        resource: EnergyResource,
        end_use: &str,
    ) -> &mut ResourceUse {
        let id = ResourceUse::synthetic_id(&self.id, resource, end_use);
        if let Some(idx) = self.resource_uses.iter().position(|ru| ru.id == id) {
            &mut self.resource_uses[idx]
        } else {
            self.resource_uses.push(ResourceUse {
                id,
                energy_resource: resource,
                end_use: end_use.to_string(),
                annual_fuel_use_consistent_units: None,
                annual_peak_consistent_units: None,
                annual_fuel_use_native_units: None,
            });
            self.resource_uses.last_mut().unwrap()
        }
    }

    pub fn ensure_all_resource_total(&mut self, end_use: &str) -> &mut AllResourceTotal {
        let id = format!("{}-AllResourceTotal-{}", self.id, end_use).replace(' ', "");
        if let Some(idx) = self.all_resource_totals.iter().position(|t| t.id == id) {
            &mut self.all_resource_totals[idx]
        } else {
            self.all_resource_totals.push(AllResourceTotal {
                id,
                end_use: end_use.to_string(),
                site_energy_use: None,
                site_energy_use_intensity: None,
            });
            self.all_resource_totals.last_mut().unwrap()
        }
    }

    pub fn push_time_series(&mut self, series: TimeSeries) {
        self.time_series.push(series);
    }

    pub fn site_energy_use(&self) -> Option<f64> {
        self.all_resource_totals
            .iter()
            .find(|total| total.end_use == ALL_END_USES)
            .and_then(|total| total.site_energy_use)
    }

    pub fn annual_cost(&self) -> Option<f64> {
        self.annual_cost
    }

    pub fn set_annual_cost(&mut self, cost: Option<f64>) {
        self.annual_cost = cost;
    }

    pub fn package_savings(&self) -> Option<&PackageSavings> {
        self.package_savings.as_ref()
    }

    pub fn set_package_savings(&mut self, savings: PackageSavings) {
        self.package_savings = Some(savings);
    }

    pub fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_deref()
    }

    pub fn set_output_dir(&mut self, dir: PathBuf) {
        self.output_dir = Some(dir);
    }

    pub fn workflow(&self) -> Option<&Workflow> {
        self.workflow.as_ref()
    }

    pub fn set_workflow(&mut self, workflow: Workflow) {
        self.workflow = Some(workflow);
    }

    pub fn engine_results(&self) -> Option<&EngineResults> {
        self.engine_results.as_ref()
    }

    pub fn set_engine_results(&mut self, results: EngineResults) {
        self.engine_results = Some(results);
    }

    /// Name for the scenario's execution directory: an assigned override
    /// first, then the human-readable name, then the id.
    pub fn run_directory_name(&self) -> String {
        if let Some(assigned) = &self.run_directory {
            return assigned.clone();
        }
        self.name
            .as_deref()
            .unwrap_or(&self.id)
            .replace(['/', '\\', ':'], "_")
    }

    /// Assign an explicit run directory name, overriding the name/id default.
    /// Used to keep directories distinct when scenario names collide.
    pub fn set_run_directory(&mut self, name: String) {
        self.run_directory = Some(name);
    }

    fn regenerate_element(&self, element: &mut Element) {
        element.remove_children("ResourceUses");
        element.remove_children("AllResourceTotals");
        element.remove_children("TimeSeriesData");

        if !self.resource_uses.is_empty() {
            let uses = element.ensure_child("ResourceUses");
            for resource_use in &self.resource_uses {
                uses.push_child(resource_use.to_element());
            }
        }
        if !self.all_resource_totals.is_empty() {
            let totals = element.ensure_child("AllResourceTotals");
            for total in &self.all_resource_totals {
                totals.push_child(total.to_element());
            }
        }
        if !self.time_series.is_empty() {
            let data = element.ensure_child("TimeSeriesData");
            for series in &self.time_series {
                data.push_child(series.to_element());
            }
        }

        if let Some(savings) = &self.package_savings {
            if let Some(pom) = element.tag_path_mut(&["ScenarioType", "PackageOfMeasures"]) {
                if let Some(value) = savings.annual_savings_site_energy {
                    pom.remove_children("AnnualSavingsSiteEnergy");
                    pom.push_child(Element::with_text(
                        "AnnualSavingsSiteEnergy",
                        value.to_string(),
                    ));
                }
                if let Some(value) = savings.annual_savings_cost {
                    pom.remove_children("AnnualSavingsCost");
                    pom.push_child(Element::with_text("AnnualSavingsCost", value.to_string()));
                }
            }
            if let Some(status) = &savings.source_completion_status {
                let fields = element.ensure_child("UserDefinedFields");
                fields.children.retain(|field| {
                    field.tag_path_text(&["FieldName"]) != Some("Source Completion Status")
                });
                let mut field = Element::new("UserDefinedField");
                field.push_child(Element::with_text("FieldName", "Source Completion Status"));
                field.push_child(Element::with_text("FieldValue", status.clone()));
                fields.push_child(field);
            }
        }
    }
}

/// Savings fields computed for a package-of-measures scenario against the
/// current-building modeled baseline.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PackageSavings {
    pub annual_savings_site_energy: Option<f64>,
    pub annual_savings_cost: Option<f64>,
    pub source_completion_status: Option<String>,
}

#[derive(Clone, Copy, Debug, Display, EnumString, Eq, Hash, PartialEq)]
pub enum EnergyResource {
    #[strum(serialize = "Electricity")]
    Electricity,
    #[strum(serialize = "Natural gas")]
    NaturalGas,
}

impl EnergyResource {
    /// The unit the resource is natively metered in.
    pub fn native_unit(&self) -> EnergyUnit {
        match self {
            EnergyResource::Electricity => EnergyUnit::KilowattHours,
            EnergyResource::NaturalGas => EnergyUnit::MMBtu,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResourceUse {
    pub id: String,
    pub energy_resource: EnergyResource,
    pub end_use: String,
    /// Annual consumption in MMBtu.
    pub annual_fuel_use_consistent_units: Option<f64>,
    /// Annual peak in kW.
    pub annual_peak_consistent_units: Option<f64>,
    /// Annual consumption in the resource's native unit.
    pub annual_fuel_use_native_units: Option<f64>,
}

impl ResourceUse {
    pub fn synthetic_id(scenario_id: &str, resource: EnergyResource, end_use: &str) -> String {
        format!("{scenario_id}-{resource}-{end_use}").replace(' ', "")
    }

    pub fn from_element(element: &Element) -> Result<Self, StructuralError> {
        element.expect_tag("ResourceUse")?;
        let id = element
            .attribute("ID")
            .ok_or(StructuralError::MissingAttribute {
                tag: "ResourceUse",
                attribute: "ID",
            })?
            .to_string();
        let resource_text =
            element
                .tag_path_text(&["EnergyResource"])
                .ok_or(StructuralError::MissingChild {
                    tag: "ResourceUse",
                    child: "EnergyResource",
                })?;
        let energy_resource = resource_text.parse().map_err(|_| {
            StructuralError::Malformed(format!("unknown energy resource \"{resource_text}\""))
        })?;
        Ok(Self {
            id,
            energy_resource,
            end_use: element
                .tag_path_text(&["EndUse"])
                .unwrap_or(ALL_END_USES)
                .to_string(),
            annual_fuel_use_consistent_units: parse_float(element, "AnnualFuelUseConsistentUnits"),
            annual_peak_consistent_units: parse_float(element, "AnnualPeakConsistentUnits"),
            annual_fuel_use_native_units: parse_float(element, "AnnualFuelUseNativeUnits"),
        })
    }

    pub fn to_element(&self) -> Element {
        let mut element = Element::new("ResourceUse");
        element.set_attribute("ID", self.id.clone());
        element.push_child(Element::with_text(
            "EnergyResource",
            self.energy_resource.to_string(),
        ));
        element.push_child(Element::with_text(
            "ResourceUnits",
            self.energy_resource.native_unit().to_string(),
        ));
        element.push_child(Element::with_text("EndUse", self.end_use.clone()));
        if let Some(value) = self.annual_fuel_use_native_units {
            element.push_child(Element::with_text(
                "AnnualFuelUseNativeUnits",
                value.to_string(),
            ));
        }
        if let Some(value) = self.annual_fuel_use_consistent_units {
            element.push_child(Element::with_text(
                "AnnualFuelUseConsistentUnits",
                value.to_string(),
            ));
        }
        if let Some(value) = self.annual_peak_consistent_units {
            element.push_child(Element::with_text(
                "AnnualPeakConsistentUnits",
                value.to_string(),
            ));
        }
        element
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AllResourceTotal {
    pub id: String,
    pub end_use: String,
    /// Total site energy in kBtu.
    pub site_energy_use: Option<f64>,
    /// Site EUI in kBtu/ft².
    pub site_energy_use_intensity: Option<f64>,
}

impl AllResourceTotal {
    pub fn from_element(element: &Element) -> Result<Self, StructuralError> {
        element.expect_tag("AllResourceTotal")?;
        let id = element
            .attribute("ID")
            .ok_or(StructuralError::MissingAttribute {
                tag: "AllResourceTotal",
                attribute: "ID",
            })?
            .to_string();
        Ok(Self {
            id,
            end_use: element
                .tag_path_text(&["EndUse"])
                .unwrap_or(ALL_END_USES)
                .to_string(),
            site_energy_use: parse_float(element, "SiteEnergyUse"),
            site_energy_use_intensity: parse_float(element, "SiteEnergyUseIntensity"),
        })
    }

    pub fn to_element(&self) -> Element {
        let mut element = Element::new("AllResourceTotal");
        element.set_attribute("ID", self.id.clone());
        element.push_child(Element::with_text("EndUse", self.end_use.clone()));
        if let Some(value) = self.site_energy_use {
            element.push_child(Element::with_text("SiteEnergyUse", value.to_string()));
        }
        if let Some(value) = self.site_energy_use_intensity {
            element.push_child(Element::with_text(
                "SiteEnergyUseIntensity",
                value.to_string(),
            ));
        }
        element
    }
}

/// One month's reading for one resource use. The end timestamp is the last
/// minute of the month, a closed-interval convention downstream consumers
/// rely on.
#[derive(Clone, Debug, PartialEq)]
pub struct TimeSeries {
    pub id: String,
    pub reading_type: String,
    pub quantity: String,
    pub start_timestamp: NaiveDateTime,
    pub end_timestamp: NaiveDateTime,
    pub interval_frequency: String,
    pub interval_reading: f64,
    pub resource_use_id: String,
}

impl TimeSeries {
    pub fn from_element(element: &Element) -> Result<Self, StructuralError> {
        element.expect_tag("TimeSeries")?;
        let id = element
            .attribute("ID")
            .ok_or(StructuralError::MissingAttribute {
                tag: "TimeSeries",
                attribute: "ID",
            })?
            .to_string();
        let parse_timestamp = |tag: &str| -> Result<NaiveDateTime, StructuralError> {
            let text = element.tag_path_text(&[tag]).ok_or_else(|| {
                StructuralError::Malformed(format!("TimeSeries {id} is missing {tag}"))
            })?;
            NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT).map_err(|_| {
                StructuralError::Malformed(format!("TimeSeries {id} has bad timestamp {text}"))
            })
        };
        Ok(Self {
            start_timestamp: parse_timestamp("StartTimestamp")?,
            end_timestamp: parse_timestamp("EndTimestamp")?,
            reading_type: element
                .tag_path_text(&["ReadingType"])
                .unwrap_or("Total")
                .to_string(),
            quantity: element
                .tag_path_text(&["TimeSeriesReadingQuantity"])
                .unwrap_or("Energy")
                .to_string(),
            interval_frequency: element
                .tag_path_text(&["IntervalFrequency"])
                .unwrap_or("Month")
                .to_string(),
            interval_reading: parse_float(element, "IntervalReading").unwrap_or(0.),
            resource_use_id: element
                .tag_path(&["ResourceUseID"])
                .and_then(|id| id.attribute("IDref"))
                .unwrap_or_default()
                .to_string(),
            id,
        })
    }

    pub fn to_element(&self) -> Element {
        let mut element = Element::new("TimeSeries");
        element.set_attribute("ID", self.id.clone());
        element.push_child(Element::with_text("ReadingType", self.reading_type.clone()));
        element.push_child(Element::with_text(
            "TimeSeriesReadingQuantity",
            self.quantity.clone(),
        ));
        element.push_child(Element::with_text(
            "StartTimestamp",
            self.start_timestamp.format(TIMESTAMP_FORMAT).to_string(),
        ));
        element.push_child(Element::with_text(
            "EndTimestamp",
            self.end_timestamp.format(TIMESTAMP_FORMAT).to_string(),
        ));
        element.push_child(Element::with_text(
            "IntervalFrequency",
            self.interval_frequency.clone(),
        ));
        element.push_child(Element::with_text(
            "IntervalReading",
            self.interval_reading.to_string(),
        ));
        let mut reference = Element::new("ResourceUseID");
        reference.set_attribute("IDref", self.resource_use_id.clone());
        element.push_child(reference);
        element
    }
}

fn parse_float(element: &Element, tag: &str) -> Option<f64> {
    element
        .tag_path_text(&[tag])
        .and_then(|text| text.parse::<f64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::*;

    fn document_with_facilities(count: usize) -> String {
        let facilities = (0..count)
            .map(|idx| {
                format!(
                    r#"<auc:Facility ID="Facility-{idx}">
                      <auc:Reports><auc:Report ID="Report-{idx}"/></auc:Reports>
                    </auc:Facility>"#
                )
            })
            .collect::<String>();
        format!(
            r#"<auc:BuildingSync xmlns:auc="http://buildingsync.net/schemas/bedes-auc/2019">
              <auc:Facilities>{facilities}</auc:Facilities>
            </auc:BuildingSync>"#
        )
    }

    #[fixture]
    fn audit_xml() -> String {
        r#"<BuildingSync xmlns="http://buildingsync.net/schemas/bedes-auc/2019">
          <Facilities>
            <Facility ID="Facility-1">
              <Sites>
                <Site ID="Site-1">
                  <Buildings>
                    <Building ID="Building-1">
                      <PremisesName>HQ</PremisesName>
                      <OccupancyClassification>Office</OccupancyClassification>
                      <FloorAreas>
                        <FloorArea>
                          <FloorAreaType>Gross</FloorAreaType>
                          <FloorAreaValue>52000</FloorAreaValue>
                        </FloorArea>
                      </FloorAreas>
                      <Sections>
                        <Section ID="Section-1">
                          <SectionType>Whole building</SectionType>
                        </Section>
                      </Sections>
                    </Building>
                  </Buildings>
                </Site>
              </Sites>
              <Systems>
                <HVACSystems>
                  <HVACSystem ID="HVACSystem-1">
                    <PrincipalHVACSystemType>Packaged Rooftop VAV with Hot Water Reheat</PrincipalHVACSystemType>
                  </HVACSystem>
                </HVACSystems>
              </Systems>
              <Measures>
                <Measure ID="Measure-LED">
                  <TechnologyCategories>
                    <TechnologyCategory>
                      <LightingImprovements>
                        <MeasureName>Retrofit with light emitting diode technologies</MeasureName>
                      </LightingImprovements>
                    </TechnologyCategory>
                  </TechnologyCategories>
                </Measure>
                <Measure ID="Measure-Custom">
                  <TechnologyCategories>
                    <TechnologyCategory>
                      <PlugLoadReductions>
                        <MeasureName>Other</MeasureName>
                        <CustomMeasureName>Install plug load controls</CustomMeasureName>
                      </PlugLoadReductions>
                    </TechnologyCategory>
                  </TechnologyCategories>
                </Measure>
              </Measures>
              <Reports>
                <Report ID="Report-1">
                  <Scenarios>
                    <Scenario ID="Baseline">
                      <ScenarioType>
                        <CurrentBuilding><CalculationMethod><Modeled/></CalculationMethod></CurrentBuilding>
                      </ScenarioType>
                      <ResourceUses>
                        <ResourceUse ID="Stale">
                          <EnergyResource>Electricity</EnergyResource>
                          <AnnualFuelUseConsistentUnits>999</AnnualFuelUseConsistentUnits>
                        </ResourceUse>
                      </ResourceUses>
                    </Scenario>
                    <Scenario ID="Measured">
                      <ScenarioType>
                        <CurrentBuilding><CalculationMethod><Measured/></CalculationMethod></CurrentBuilding>
                      </ScenarioType>
                      <ResourceUses>
                        <ResourceUse ID="Bills">
                          <EnergyResource>Electricity</EnergyResource>
                          <EndUse>All end uses</EndUse>
                          <AnnualFuelUseConsistentUnits>1234.5</AnnualFuelUseConsistentUnits>
                          <AnnualFuelCost>5000</AnnualFuelCost>
                        </ResourceUse>
                      </ResourceUses>
                      <AllResourceTotals>
                        <AllResourceTotal ID="BillsTotal">
                          <EndUse>All end uses</EndUse>
                          <SiteEnergyUse>1234500</SiteEnergyUse>
                        </AllResourceTotal>
                      </AllResourceTotals>
                    </Scenario>
                    <Scenario ID="POM-1">
                      <Name>LED Package</Name>
                      <ScenarioType>
                        <PackageOfMeasures ID="Package-1">
                          <MeasureIDs>
                            <MeasureID IDref="Measure-LED"/>
                            <MeasureID IDref="Measure-Custom"/>
                          </MeasureIDs>
                        </PackageOfMeasures>
                      </ScenarioType>
                    </Scenario>
                    <Scenario ID="Bench">
                      <ScenarioType><Benchmark/></ScenarioType>
                    </Scenario>
                  </Scenarios>
                </Report>
              </Reports>
            </Facility>
          </Facilities>
        </BuildingSync>"#
            .to_string()
    }

    #[fixture]
    fn facility(audit_xml: String) -> Facility {
        let document = AuditDocument::parse(audit_xml.as_bytes()).unwrap();
        Facility::from_document(&document).unwrap()
    }

    #[rstest]
    #[case(0)]
    #[case(2)]
    fn facility_singleton_is_enforced(#[case] count: usize) {
        let error = AuditDocument::parse(document_with_facilities(count).as_bytes()).unwrap_err();
        assert_eq!(
            error.to_string(),
            format!("document must contain exactly one Facility, found {count}")
        );
    }

    #[rstest]
    fn single_facility_parses() {
        assert!(AuditDocument::parse(document_with_facilities(1).as_bytes()).is_ok());
    }

    #[rstest]
    fn wrong_tag_is_a_structural_error(audit_xml: String) {
        let document = AuditDocument::parse(audit_xml.as_bytes()).unwrap();
        let error = Scenario::from_element(document.facility_element().unwrap()).unwrap_err();
        assert!(matches!(error, StructuralError::WrongTag { .. }));
    }

    #[rstest]
    fn facility_context_is_derived(facility: Facility) {
        assert_eq!(facility.context.building_type.as_deref(), Some("Office"));
        assert_eq!(
            facility.context.system_type.as_deref(),
            Some("Packaged Rooftop VAV with Hot Water Reheat")
        );
        assert_eq!(facility.context.gross_floor_area, Some(52000.));
    }

    #[rstest]
    fn classification_views_are_derived_at_construction(facility: Facility) {
        let report = &facility.report;
        assert_eq!(report.cb_modeled().unwrap().id(), "Baseline");
        assert_eq!(
            report.cb_measured().map(Scenario::id).collect::<Vec<_>>(),
            vec!["Measured"]
        );
        assert_eq!(report.poms().map(Scenario::id).collect::<Vec<_>>(), vec!["POM-1"]);
        assert!(report.has_benchmark());
        assert!(!report.has_target());
    }

    #[rstest]
    fn second_modeled_scenario_warns_and_first_wins() {
        let xml = r#"<BuildingSync>
          <Facilities><Facility ID="F"><Reports><Report ID="R"><Scenarios>
            <Scenario ID="First"><ScenarioType>
              <CurrentBuilding><CalculationMethod><Modeled/></CalculationMethod></CurrentBuilding>
            </ScenarioType></Scenario>
            <Scenario ID="Second"><ScenarioType>
              <CurrentBuilding><CalculationMethod><Modeled/></CalculationMethod></CurrentBuilding>
            </ScenarioType></Scenario>
          </Scenarios></Report></Reports></Facility></Facilities>
        </BuildingSync>"#;
        let document = AuditDocument::parse(xml.as_bytes()).unwrap();
        let facility = Facility::from_document(&document).unwrap();
        assert_eq!(facility.report.cb_modeled().unwrap().id(), "First");
    }

    #[rstest]
    fn modeled_and_pom_scenarios_purge_persisted_results(facility: Facility) {
        let baseline = facility.report.cb_modeled().unwrap();
        assert!(baseline.get_resource_uses().is_empty());
        assert!(baseline.get_all_resource_totals().is_empty());
        assert!(baseline.get_time_series_data().is_empty());
    }

    #[rstest]
    fn measured_scenario_retains_persisted_results(facility: Facility) {
        let measured = facility.report.cb_measured().next().unwrap();
        assert_eq!(measured.get_resource_uses().len(), 1);
        assert_eq!(
            measured.get_resource_uses()[0].annual_fuel_use_consistent_units,
            Some(1234.5)
        );
        assert_eq!(measured.site_energy_use(), Some(1234500.));
    }

    #[rstest]
    fn scenario_without_classification_satisfies_no_predicate() {
        let xml = r#"<Scenario ID="Odd"><ScenarioType/></Scenario>"#;
        let element = crate::xml::parse_document(xml.as_bytes()).unwrap();
        let scenario = Scenario::from_element(&element).unwrap();
        assert!(!scenario.is_modeled());
        assert!(!scenario.is_measured());
        assert!(!scenario.is_package_of_measures());
        assert!(!scenario.is_benchmark());
        assert!(!scenario.is_target());
        assert_eq!(scenario.classification(), "unclassified");
    }

    #[rstest]
    fn scenario_requires_id_attribute() {
        let element = crate::xml::parse_document("<Scenario/>".as_bytes()).unwrap();
        assert!(matches!(
            Scenario::from_element(&element),
            Err(StructuralError::MissingAttribute { .. })
        ));
    }

    #[rstest]
    fn measure_other_redirects_to_custom_name(facility: Facility) {
        let custom = &facility.measures["Measure-Custom"];
        assert_eq!(custom.category.as_deref(), Some("PlugLoadReductions"));
        assert_eq!(custom.effective_name(), Some("Install plug load controls"));
        let led = &facility.measures["Measure-LED"];
        assert_eq!(
            led.effective_name(),
            Some("Retrofit with light emitting diode technologies")
        );
    }

    #[rstest]
    fn pom_scenario_lists_measure_references(facility: Facility) {
        let pom = facility.report.poms().next().unwrap();
        assert_eq!(pom.measure_ids(), &["Measure-LED", "Measure-Custom"]);
        assert_eq!(pom.run_directory_name(), "LED Package");
    }

    #[rstest]
    fn synthetic_resource_use_ids_are_deterministic() {
        assert_eq!(
            ResourceUse::synthetic_id("POM-1", EnergyResource::Electricity, ALL_END_USES),
            "POM-1-Electricity-Allenduses"
        );
        assert_eq!(
            ResourceUse::synthetic_id("POM-1", EnergyResource::NaturalGas, ALL_END_USES),
            "POM-1-Naturalgas-Allenduses"
        );
    }

    #[rstest]
    fn write_back_regenerates_scenario_elements(audit_xml: String) {
        let mut document = AuditDocument::parse(audit_xml.as_bytes()).unwrap();
        let mut facility = Facility::from_document(&document).unwrap();

        let pom_idx = facility.report.pom_indices()[0];
        let scenario = facility.report.scenario_at_mut(pom_idx);
        let resource_use = scenario.ensure_resource_use(EnergyResource::Electricity, ALL_END_USES);
        resource_use.annual_fuel_use_consistent_units = Some(432.1);
        scenario.set_package_savings(PackageSavings {
            annual_savings_site_energy: Some(120.5),
            annual_savings_cost: Some(10250.),
            source_completion_status: Some("Success".to_string()),
        });

        document.write_back(&facility.report).unwrap();
        let mut buffer = Vec::new();
        document.serialize(&mut buffer).unwrap();
        let rendered = String::from_utf8(buffer).unwrap();
        assert!(rendered.contains("POM-1-Electricity-Allenduses"));
        assert!(rendered.contains("<AnnualSavingsSiteEnergy>120.5</AnnualSavingsSiteEnergy>"));
        assert!(rendered.contains("<FieldValue>Success</FieldValue>"));
        // stale baseline elements were dropped, not retained
        assert!(!rendered.contains("ResourceUse ID=\"Stale\""));
    }

    #[rstest]
    fn write_back_leaves_measured_scenario_elements_untouched(audit_xml: String) {
        let mut document = AuditDocument::parse(audit_xml.as_bytes()).unwrap();
        let facility = Facility::from_document(&document).unwrap();

        document.write_back(&facility.report).unwrap();
        let mut buffer = Vec::new();
        document.serialize(&mut buffer).unwrap();
        let rendered = String::from_utf8(buffer).unwrap();

        // authored elements survive even where the typed model has no field
        // for them, and no synthesized units element is injected
        assert!(rendered.contains("<AnnualFuelCost>5000</AnnualFuelCost>"));
        assert!(rendered.contains("ResourceUse ID=\"Bills\""));
        assert!(rendered.contains("AllResourceTotal ID=\"BillsTotal\""));
        assert!(!rendered.contains("<ResourceUnits>"));
    }
}
