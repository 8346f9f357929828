use std::{fs, path::Path};

use anyhow::Error;
use schemars::schema_for;

use crate::{
    feature_flags::{FeatureFlag, FlagContext, FlagUpdate},
    service_discovery::{ServiceRecord, ServiceRegistration, ServiceStats},
};

/// The entry point invoked by `main.rs` for `Commands::Schema`.
///
/// Writes one `<name>.schema.json` per public data type into `out_dir` and
/// returns the file names written.
pub fn write_schema(out_dir: &Path) -> Result<Vec<String>, Error> {
    fs::create_dir_all(out_dir)?;

    let schemas = [
        ("feature-flag", serde_json::to_string_pretty(&schema_for!(FeatureFlag))?),
        ("flag-update", serde_json::to_string_pretty(&schema_for!(FlagUpdate))?),
        ("flag-context", serde_json::to_string_pretty(&schema_for!(FlagContext))?),
        ("service-record", serde_json::to_string_pretty(&schema_for!(ServiceRecord))?),
        (
            "service-registration",
            serde_json::to_string_pretty(&schema_for!(ServiceRegistration))?,
        ),
        ("service-stats", serde_json::to_string_pretty(&schema_for!(ServiceStats))?),
    ];

    let mut written = Vec::with_capacity(schemas.len());
    for (name, json) in schemas {
        let file = format!("{name}.schema.json");
        fs::write(out_dir.join(&file), json)?;
        written.push(file);
    }
    Ok(written)
}
