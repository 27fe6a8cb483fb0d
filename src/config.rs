//! Pipeline configuration and endpoint tables.
//!
//! Endpoint tables are plain data handed to the pipelines. The built-in
//! defaults ([`EndpointTable::default`]) cover the Bioportal reports and the
//! HHS/CDC datasets; a JSON file with the same shape replaces them:
//!
//! ```json
//! {
//!   "bioportal": [
//!     { "name": "deaths", "version": "v1",
//!       "location": "https://example.org/deaths/summary", "shape": "array" }
//!   ],
//!   "openData": [
//!     { "domain": "data.cdc.gov",
//!       "datasets": [ { "name": "covid_vaccinations_state", "id": "unsk-b7fc" } ] }
//!   ]
//! }
//! ```

use crate::endpoint::{Endpoint, EndpointSpec, validate_path_component};
use crate::error::{Error, Result};
use crate::io::parquet::TableOptions;
use crate::io::transcode::RecordShape;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const BIOPORTAL_URL: &str = "https://bioportal.salud.pr.gov/api/administration/reports";

/// Directory family the open-data datasets are filed under.
pub const OPEN_DATA_FAMILY: &str = "HHS";

/// Default layout version for open-data datasets.
pub const OPEN_DATA_VERSION: &str = "v2";

/// Which artifacts survive into the sync root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Retention {
    /// Raw, row-delimited, and columnar artifacts.
    #[default]
    All,
    /// Only the columnar artifact; intermediates are discarded.
    ColumnarOnly,
}

/// Settings shared by both pipeline families.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Root of the tree handed to the bulk-sync step.
    pub sync_root: PathBuf,
    /// Parent of per-run staging directories; the system temp dir if `None`.
    pub work_dir: Option<PathBuf>,
    pub retention: Retention,
    pub table: TableOptions,
}

impl PipelineConfig {
    pub fn new(sync_root: impl Into<PathBuf>) -> Self {
        Self {
            sync_root: sync_root.into(),
            work_dir: None,
            retention: Retention::default(),
            table: TableOptions::default(),
        }
    }
}

/// One dataset on an open-data platform.
///
/// `name` and `version` become directory and file names below the sync root,
/// and `id` becomes a URL path segment, so all three are validated on
/// construction and on deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "OpenDatasetSpec")]
pub struct OpenDataset {
    name: String,
    id: String,
    version: String,
}

impl OpenDataset {
    /// A dataset filed under the default version.
    ///
    /// # Errors
    /// [`Error::Configuration`] if `name` is not a usable path component or
    /// `id` is not a usable URL path segment.
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Result<Self> {
        Self::with_version(name, id, OPEN_DATA_VERSION)
    }

    /// # Errors
    /// As for [`OpenDataset::new`], plus an unusable `version`.
    pub fn with_version(
        name: impl Into<String>,
        id: impl Into<String>,
        version: impl Into<String>,
    ) -> Result<Self> {
        let (name, id, version) = (name.into(), id.into(), version.into());
        validate_path_component("dataset name", &name)?;
        validate_path_component("dataset version", &version)?;
        validate_dataset_id(&name, &id)?;
        Ok(Self { name, id, version })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

/// Serialized form of an [`OpenDataset`].
#[derive(Debug, Deserialize)]
struct OpenDatasetSpec {
    name: String,
    id: String,
    #[serde(default = "default_open_data_version")]
    version: String,
}

impl TryFrom<OpenDatasetSpec> for OpenDataset {
    type Error = Error;

    fn try_from(spec: OpenDatasetSpec) -> Result<Self> {
        Self::with_version(spec.name, spec.id, spec.version)
    }
}

fn default_open_data_version() -> String {
    OPEN_DATA_VERSION.to_string()
}

fn validate_dataset_id(name: &str, id: &str) -> Result<()> {
    let bad = id.is_empty()
        || id == "."
        || id == ".."
        || id
            .chars()
            .any(|c| matches!(c, '/' | '\\' | '?' | '#' | '%') || c.is_whitespace() || c.is_control());
    if bad {
        return Err(Error::Configuration(format!(
            "dataset {name:?}: id {id:?} is not a usable URL path segment"
        )));
    }
    Ok(())
}

/// Datasets hosted on one open-data domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenDataSource {
    pub domain: String,
    pub datasets: Vec<OpenDataset>,
}

/// All endpoints known to one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointTable {
    #[serde(default)]
    pub bioportal: Vec<EndpointSpec>,
    #[serde(default)]
    pub open_data: Vec<OpenDataSource>,
}

impl EndpointTable {
    /// Load a table from a JSON file.
    ///
    /// # Errors
    /// [`Error::Filesystem`] if the file cannot be read,
    /// [`Error::Configuration`] if it is not a valid table.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::fs(path, e))?;
        let table: Self = serde_json::from_str(&text)
            .map_err(|e| Error::Configuration(format!("endpoint table {}: {e}", path.display())))?;
        info!(
            path = %path.display(),
            bioportal = table.bioportal.len(),
            open_data = table.open_data.len(),
            "loaded endpoint table"
        );
        Ok(table)
    }

    /// Validated Bioportal endpoints.
    ///
    /// # Errors
    /// [`Error::Configuration`] for the first invalid entry.
    pub fn bioportal_endpoints(&self) -> Result<Vec<Endpoint>> {
        self.bioportal.iter().cloned().map(Endpoint::try_from).collect()
    }
}

impl Default for EndpointTable {
    fn default() -> Self {
        let portal = |name: &str, path: &str, shape| EndpointSpec {
            name: name.to_string(),
            version: "v1".to_string(),
            location: format!("{BIOPORTAL_URL}/{path}"),
            shape,
        };
        let datasets = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .map(|&(name, id)| OpenDataset {
                    name: name.to_string(),
                    id: id.to_string(),
                    version: default_open_data_version(),
                })
                .collect::<Vec<_>>()
        };
        Self {
            bioportal: vec![
                portal("deaths", "deaths/summary", RecordShape::Array),
                portal("minimal-info-unique-tests", "minimal-info-unique-tests", RecordShape::Array),
                portal("orders-basic", "orders/basic", RecordShape::ItemMember),
            ],
            open_data: vec![
                OpenDataSource {
                    domain: "healthdata.gov".to_string(),
                    datasets: datasets(&[
                        ("covid-19_community_profile_report_county", "di4u-7yu6"),
                        ("covid-19_diagnostic_lab_testing", "j8mb-icvb"),
                        ("estimated_icu", "7ctx-gtb7"),
                        ("estimated_inpatient_all", "jjp9-htie"),
                        ("estimated_inpatient_covid", "py8k-j5rq"),
                        ("reported_hospital_utilization", "6xf2-c3ie"),
                        ("reported_hospital_utilization_timeseries", "g62h-syeh"),
                        (
                            "reported_hospital_capacity_admissions_facility_level_weekly_average_timeseries",
                            "anag-cw7u",
                        ),
                        (
                            "reported_hospital_capacity_admissions_facility_level_weekly_average_timeseries_raw",
                            "uqq2-txqb",
                        ),
                    ]),
                },
                OpenDataSource {
                    domain: "data.cdc.gov".to_string(),
                    datasets: datasets(&[
                        ("covid_vaccinations_state", "unsk-b7fc"),
                        ("covid_vaccinations_county", "8xkx-amqh"),
                        ("covid_vaccine_allocations_state_pfizer", "saz5-9hgg"),
                        ("covid_vaccine_allocations_state_moderna", "b7pe-5nws"),
                        ("covid_vaccine_allocations_state_janssen", "w9zu-fywh"),
                        ("nationwide_commercial_laborator_seroprevalence_survey", "d2tw-32xv"),
                        ("nationwide_blood_donor_seroprevalence", "wi5c-cscz"),
                        (
                            "rates_of_covid_19_cases_or_deaths_by_age_group_and_vaccination_status",
                            "3rge-nu2a",
                        ),
                        (
                            "rates_of_covid_19_cases_or_deaths_by_age_group_and_vaccination_status_and_booster_dose",
                            "d6p8-wqjm",
                        ),
                        (
                            "rates_of_covid_19_cases_or_deaths_by_age_group_and_vaccination_status_and_second_booster_dose",
                            "ukww-au2k",
                        ),
                        ("united_states_covid_19_community_levels_by_county", "3nnm-4jni"),
                    ]),
                },
            ],
        }
    }
}

/// Resolve the open-data app token from the process environment.
///
/// # Errors
/// See [`resolve_app_token_with`].
pub fn resolve_app_token(cli_token: Option<&str>, env_var: Option<&str>) -> Result<Option<String>> {
    resolve_app_token_with(cli_token, env_var, |key| std::env::var(key).ok())
}

/// Resolve the app token: command-line value first, then the environment
/// variable named by `env_var`, then none (requests may be throttled).
///
/// # Errors
/// [`Error::Configuration`] if `env_var` names a variable that is not set.
pub fn resolve_app_token_with(
    cli_token: Option<&str>,
    env_var: Option<&str>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Option<String>> {
    if let Some(token) = cli_token {
        info!("using app token from command line");
        return Ok(Some(token.to_string()));
    }
    if let Some(var) = env_var {
        info!(var, "using app token from environment variable");
        return lookup(var)
            .map(Some)
            .ok_or_else(|| Error::Configuration(format!("environment variable {var} not set")));
    }
    warn!("no app token; the open-data API may throttle us");
    Ok(None)
}
