//! Endpoint descriptors and artifact naming.
//!
//! An [`Endpoint`] is pure data: a `(name, version)` identity, the remote
//! location, and the JSON shape its payload arrives in. Naming helpers here
//! own the two timestamp renderings:
//!
//! - [`record_stamp`] - ISO-8601 with colons, embedded in record payloads
//! - [`filename_stamp`] - compact and colon-free, embedded in filenames
//!
//! Both render the same instant; keep them apart.

use crate::error::{Error, Result};
use crate::io::transcode::RecordShape;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Characters that are not allowed in portable file names.
const ILLEGAL_FILENAME_CHARS: &[char] = &[':', '/', '\\', '<', '>', '"', '|', '?', '*'];

/// A named, versioned remote data source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    name: String,
    version: String,
    location: Url,
    shape: RecordShape,
}

impl Endpoint {
    /// Build an endpoint, validating name, version, and location.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if the name or version is empty or
    /// contains characters illegal in a path, or if `location` is not an
    /// absolute URL.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        location: &str,
        shape: RecordShape,
    ) -> Result<Self> {
        let name = name.into();
        let version = version.into();
        validate_path_component("endpoint name", &name)?;
        validate_path_component("endpoint version", &version)?;
        let location = Url::parse(location)
            .map_err(|e| Error::Configuration(format!("endpoint {name}: bad location {location:?}: {e}")))?;
        Ok(Self {
            name,
            version,
            location,
            shape,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn location(&self) -> &Url {
        &self.location
    }

    pub fn shape(&self) -> RecordShape {
        self.shape
    }

    /// Canonical artifact file name for a run at `stamped_at`.
    pub fn file_name(&self, stamped_at: DateTime<Utc>, extension: &str) -> String {
        artifact_file_name(&self.name, stamped_at, extension)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Serialized form of an endpoint, as found in endpoint table files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSpec {
    pub name: String,
    pub version: String,
    pub location: String,
    #[serde(default)]
    pub shape: RecordShape,
}

impl TryFrom<EndpointSpec> for Endpoint {
    type Error = Error;

    fn try_from(spec: EndpointSpec) -> Result<Self> {
        Endpoint::new(spec.name, spec.version, &spec.location, spec.shape)
    }
}

/// ISO-8601 rendering embedded in records, e.g. `2022-03-01T00:00:00Z`.
pub fn record_stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Colon-free rendering embedded in file names, e.g. `20220301T000000`.
pub fn filename_stamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%S").to_string()
}

/// `{name}_{filename_stamp}.{extension}`
pub fn artifact_file_name(name: &str, stamped_at: DateTime<Utc>, extension: &str) -> String {
    format!("{name}_{}.{extension}", filename_stamp(stamped_at))
}

pub(crate) fn validate_path_component(what: &str, value: &str) -> Result<()> {
    if value.is_empty() || value == "." || value == ".." {
        return Err(Error::Configuration(format!("{what} {value:?} is not a usable path component")));
    }
    if let Some(c) = value.chars().find(|c| ILLEGAL_FILENAME_CHARS.contains(c) || c.is_control()) {
        return Err(Error::Configuration(format!("{what} {value:?} contains illegal character {c:?}")));
    }
    Ok(())
}
