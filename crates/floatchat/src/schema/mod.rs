use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result, bail};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const ARGO_DESCRIPTOR_VERSION: &str = "floatchat.argo-profiles.v1";
pub const DEFAULT_TABLE_NAME: &str = "profiles";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ColumnRole {
    Identifier,
    MeasurementScalar,
    MeasurementArray,
    QcFlag,
    Categorical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    Integer,
    Real,
    Date,
    Text,
    RealArray,
    Flags,
}

/// What a column measures, independent of its name. Drives the spatial and
/// temporal query policy and the chart capability taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ColumnMeaning {
    Latitude,
    Longitude,
    ProfileDate,
    Platform,
    Pressure,
    Temperature,
    Salinity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ColumnDescriptor {
    pub name: String,
    pub semantic_type: SemanticType,
    pub role: ColumnRole,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meaning: Option<ColumnMeaning>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SchemaDescriptor {
    pub version: String,
    pub table: String,
    pub columns: Vec<ColumnDescriptor>,
    pub default_projection: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl SchemaDescriptor {
    /// The ARGO profile table the dashboard was built around: one row per
    /// profile, measurement arrays serialized into text columns.
    #[must_use]
    pub fn argo_profiles(table: &str) -> Self {
        use ColumnMeaning as M;
        use ColumnRole as R;
        use SemanticType as T;

        let columns = vec![
            column("rowid", T::Integer, R::Identifier, None, "primary identifier"),
            column(
                "PLATFORM_NUMBER",
                T::Real,
                R::Identifier,
                Some(M::Platform),
                "WMO float identifier",
            ),
            column("CYCLE_NUMBER", T::Integer, R::Identifier, None, "profile cycle of the float"),
            column("LATITUDE", T::Real, R::MeasurementScalar, Some(M::Latitude), "degrees north"),
            column("LONGITUDE", T::Real, R::MeasurementScalar, Some(M::Longitude), "degrees east"),
            column(
                "PROFILE_DATE",
                T::Date,
                R::MeasurementScalar,
                Some(M::ProfileDate),
                "YYYY-MM-DD string",
            ),
            column("PRES", T::RealArray, R::MeasurementArray, Some(M::Pressure), "dbar per level"),
            column(
                "TEMP",
                T::RealArray,
                R::MeasurementArray,
                Some(M::Temperature),
                "degrees Celsius per level",
            ),
            column("PSAL", T::RealArray, R::MeasurementArray, Some(M::Salinity), "PSU per level"),
            column("TEMP_QC", T::Flags, R::QcFlag, None, "quality flags for TEMP"),
            column("PSAL_QC", T::Flags, R::QcFlag, None, "quality flags for PSAL"),
            column("PRES_QC", T::Flags, R::QcFlag, None, "quality flags for PRES"),
            column("N_LEVELS", T::Integer, R::MeasurementScalar, None, "levels in the profile"),
            column("DATA_MODE", T::Text, R::Categorical, None, "'R', 'D' or 'A'"),
        ];

        Self {
            version: ARGO_DESCRIPTOR_VERSION.to_string(),
            table: table.to_string(),
            columns,
            default_projection: [
                "PLATFORM_NUMBER",
                "CYCLE_NUMBER",
                "LATITUDE",
                "LONGITUDE",
                "PROFILE_DATE",
                "PRES",
                "TEMP",
                "PSAL",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
            notes: Some(
                "Each row is one profile; PRES, TEMP and PSAL hold serialized per-level arrays."
                    .to_string(),
            ),
        }
    }

    pub fn load_toml(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read schema descriptor: {}", path.display()))?;
        let descriptor: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse schema descriptor: {}", path.display()))?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn validate(&self) -> Result<()> {
        if self.table.trim().is_empty() {
            bail!("schema descriptor table name is empty");
        }
        if self.columns.is_empty() {
            bail!("schema descriptor `{}` declares no columns", self.table);
        }

        let mut seen = BTreeSet::new();
        for column in &self.columns {
            if column.name.trim().is_empty() {
                bail!("schema descriptor contains a column with an empty name");
            }
            if !seen.insert(column.name.to_ascii_lowercase()) {
                bail!("duplicate column `{}` in schema descriptor", column.name);
            }
        }

        if self.default_projection.is_empty() {
            bail!("schema descriptor default projection is empty");
        }
        for name in &self.default_projection {
            if self.column(name).is_none() {
                bail!("default projection column `{name}` is not declared in the descriptor");
            }
        }

        Ok(())
    }

    /// Case-insensitive lookup, matching SQLite identifier semantics.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns
            .iter()
            .find(|column| column.name.eq_ignore_ascii_case(name))
    }

    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    #[must_use]
    pub fn is_table(&self, name: &str) -> bool {
        self.table.eq_ignore_ascii_case(name)
    }

    #[must_use]
    pub fn column_with_meaning(&self, meaning: ColumnMeaning) -> Option<&ColumnDescriptor> {
        self.columns
            .iter()
            .find(|column| column.meaning == Some(meaning))
    }

    #[must_use]
    pub fn meaning_of(&self, name: &str) -> Option<ColumnMeaning> {
        self.column(name).and_then(|column| column.meaning)
    }

    #[must_use]
    pub fn default_projection_sql(&self) -> String {
        self.default_projection.join(", ")
    }

    /// Schema block interpolated into generation prompts.
    #[must_use]
    pub fn render_prompt_text(&self) -> String {
        let mut text = format!("Table `{}` columns:\n", self.table);
        for column in &self.columns {
            let kind = match column.semantic_type {
                SemanticType::Integer => "int",
                SemanticType::Real => "float",
                SemanticType::Date => "date",
                SemanticType::Text => "string",
                SemanticType::RealArray => "array",
                SemanticType::Flags => "qc flags",
            };
            match column.notes.as_deref() {
                Some(notes) => text.push_str(&format!("- {} ({kind}, {notes})\n", column.name)),
                None => text.push_str(&format!("- {} ({kind})\n", column.name)),
            }
        }
        if let Some(notes) = self.notes.as_deref() {
            text.push_str("Notes: ");
            text.push_str(notes);
            text.push('\n');
        }
        text
    }

    /// DDL matching the descriptor; used to stand up fixture stores.
    #[must_use]
    pub fn create_table_sql(&self) -> String {
        let columns = self
            .columns
            .iter()
            .filter(|column| !column.name.eq_ignore_ascii_case("rowid"))
            .map(|column| {
                let declared = match column.semantic_type {
                    SemanticType::Integer => "INTEGER",
                    SemanticType::Real => "REAL",
                    SemanticType::Date
                    | SemanticType::Text
                    | SemanticType::RealArray
                    | SemanticType::Flags => "TEXT",
                };
                format!("    {} {declared}", column.name)
            })
            .collect::<Vec<_>>()
            .join(",\n");
        format!("CREATE TABLE IF NOT EXISTS {} (\n{columns}\n)", self.table)
    }
}

fn column(
    name: &str,
    semantic_type: SemanticType,
    role: ColumnRole,
    meaning: Option<ColumnMeaning>,
    notes: &str,
) -> ColumnDescriptor {
    ColumnDescriptor {
        name: name.to_string(),
        semantic_type,
        role,
        meaning,
        notes: Some(notes.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::{ColumnMeaning, ColumnRole, DEFAULT_TABLE_NAME, SchemaDescriptor};

    #[test]
    fn builtin_descriptor_is_valid() {
        let descriptor = SchemaDescriptor::argo_profiles(DEFAULT_TABLE_NAME);
        descriptor.validate().expect("built-in descriptor should be valid");
        assert_eq!(descriptor.table, "profiles");
        assert_eq!(
            descriptor.column("psal").map(|column| column.role),
            Some(ColumnRole::MeasurementArray)
        );
        assert_eq!(
            descriptor
                .column_with_meaning(ColumnMeaning::ProfileDate)
                .map(|column| column.name.as_str()),
            Some("PROFILE_DATE")
        );
    }

    #[test]
    fn rejects_duplicate_columns_ignoring_case() {
        let mut descriptor = SchemaDescriptor::argo_profiles("profiles");
        let mut duplicate = descriptor.columns[3].clone();
        duplicate.name = "latitude".to_string();
        descriptor.columns.push(duplicate);

        let err = descriptor.validate().expect_err("duplicate must fail");
        assert!(err.to_string().contains("duplicate column"), "unexpected: {err}");
    }

    #[test]
    fn rejects_unknown_default_projection_column() {
        let mut descriptor = SchemaDescriptor::argo_profiles("profiles");
        descriptor.default_projection.push("DOXY".to_string());

        let err = descriptor.validate().expect_err("unknown projection must fail");
        assert!(err.to_string().contains("DOXY"), "unexpected: {err}");
    }

    #[test]
    fn prompt_text_lists_every_column() {
        let descriptor = SchemaDescriptor::argo_profiles("profiles");
        let text = descriptor.render_prompt_text();
        assert!(text.starts_with("Table `profiles` columns:"));
        for column in &descriptor.columns {
            assert!(text.contains(&format!("- {} (", column.name)));
        }
        assert!(text.contains("Notes: Each row is one profile"));
    }

    #[test]
    fn create_table_sql_skips_implicit_rowid() {
        let sql = SchemaDescriptor::argo_profiles("profiles").create_table_sql();
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS profiles ("));
        assert!(sql.contains("PLATFORM_NUMBER REAL"));
        assert!(sql.contains("TEMP TEXT"));
        assert!(!sql.contains("rowid"));
    }
}
