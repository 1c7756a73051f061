use serde::Serialize;

use crate::schema::{ColumnMeaning, SchemaDescriptor};
use crate::store::ResultTable;

pub const NO_MEASUREMENTS_NOTE: &str = "No PRES/TEMP/PSAL columns found in result.";
pub const NO_RESULTS_NOTE: &str = "No results.";

/// What a result table can be drawn as. The measurement capabilities are
/// mutually exclusive; `LocationMap` is reported alongside them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    LocationMap,
    FullProfile,
    SalinityOnly,
    TemperatureOnly,
    PressureOnly,
    NoMeasurements,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    FloatLocations,
    TemperaturePressure,
    TemperatureProfile,
    SalinityProfile,
    TemperatureSalinity,
    TemperatureDistribution,
    SalinityOverTime,
    TemperatureOverTime,
    PressureOverTime,
}

impl ChartKind {
    #[must_use]
    pub fn title(self) -> &'static str {
        match self {
            Self::FloatLocations => "Float Locations",
            Self::TemperaturePressure => "Temperature-Pressure (T-P) Diagram",
            Self::TemperatureProfile => "Temperature Profiles",
            Self::SalinityProfile => "Salinity Profiles",
            Self::TemperatureSalinity => "Temperature-Salinity (T-S) Diagram",
            Self::TemperatureDistribution => "Temperature Distribution",
            Self::SalinityOverTime => "Salinity Variation Over Time",
            Self::TemperatureOverTime => "Temperature Variation Over Time",
            Self::PressureOverTime => "Pressure Variation Over Time",
        }
    }

    /// `(x, y, y_reversed)`; a box plot has no x axis.
    fn axes(self) -> (Option<ColumnMeaning>, ColumnMeaning, bool) {
        use ColumnMeaning::{Latitude, Longitude, Pressure, ProfileDate, Salinity, Temperature};
        match self {
            Self::FloatLocations => (Some(Longitude), Latitude, false),
            Self::TemperaturePressure => (Some(Pressure), Temperature, false),
            Self::TemperatureProfile => (Some(Temperature), Pressure, true),
            Self::SalinityProfile => (Some(Salinity), Pressure, true),
            Self::TemperatureSalinity => (Some(Salinity), Temperature, false),
            Self::TemperatureDistribution => (None, Temperature, false),
            Self::SalinityOverTime => (Some(ProfileDate), Salinity, false),
            Self::TemperatureOverTime => (Some(ProfileDate), Temperature, false),
            Self::PressureOverTime => (Some(ProfileDate), Pressure, false),
        }
    }
}

impl Capability {
    #[must_use]
    pub fn charts(self) -> &'static [ChartKind] {
        match self {
            Self::LocationMap => &[ChartKind::FloatLocations],
            Self::FullProfile => &[
                ChartKind::TemperaturePressure,
                ChartKind::TemperatureProfile,
                ChartKind::SalinityProfile,
                ChartKind::TemperatureSalinity,
                ChartKind::TemperatureDistribution,
                ChartKind::SalinityOverTime,
                ChartKind::TemperatureOverTime,
                ChartKind::PressureOverTime,
            ],
            Self::SalinityOnly => &[ChartKind::SalinityOverTime],
            Self::TemperatureOnly => &[ChartKind::TemperatureOverTime],
            Self::PressureOnly => &[ChartKind::PressureOverTime],
            Self::NoMeasurements => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, schemars::JsonSchema)]
pub struct ChartPlan {
    pub kind: ChartKind,
    pub title: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    pub y: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    pub y_reversed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, schemars::JsonSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChartOutcome {
    Planned { plan: ChartPlan },
    Skipped { kind: ChartKind, reason: String },
}

impl ChartOutcome {
    #[must_use]
    pub fn kind(&self) -> ChartKind {
        match self {
            Self::Planned { plan } => plan.kind,
            Self::Skipped { kind, .. } => *kind,
        }
    }

    #[must_use]
    pub fn is_planned(&self) -> bool {
        matches!(self, Self::Planned { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, schemars::JsonSchema)]
pub struct VisualizationPlan {
    pub capabilities: Vec<Capability>,
    pub charts: Vec<ChartOutcome>,
    pub notes: Vec<String>,
}

/// Result columns keyed by what they mean, resolved through the descriptor.
struct ResolvedColumns<'a> {
    table: &'a ResultTable,
    descriptor: &'a SchemaDescriptor,
}

impl ResolvedColumns<'_> {
    fn find(&self, meaning: ColumnMeaning) -> Option<&str> {
        self.table
            .columns
            .iter()
            .find(|column| self.descriptor.meaning_of(column) == Some(meaning))
            .map(String::as_str)
    }

    fn has(&self, meaning: ColumnMeaning) -> bool {
        self.find(meaning).is_some()
    }
}

#[must_use]
pub fn capabilities(table: &ResultTable, descriptor: &SchemaDescriptor) -> Vec<Capability> {
    let columns = ResolvedColumns { table, descriptor };
    let mut capabilities = Vec::new();
    if columns.has(ColumnMeaning::Latitude) && columns.has(ColumnMeaning::Longitude) {
        capabilities.push(Capability::LocationMap);
    }

    let pressure = columns.has(ColumnMeaning::Pressure);
    let temperature = columns.has(ColumnMeaning::Temperature);
    let salinity = columns.has(ColumnMeaning::Salinity);
    capabilities.push(if pressure && temperature && salinity {
        Capability::FullProfile
    } else if salinity {
        Capability::SalinityOnly
    } else if temperature {
        Capability::TemperatureOnly
    } else if pressure {
        Capability::PressureOnly
    } else {
        Capability::NoMeasurements
    });
    capabilities
}

/// Plans every chart the table's capabilities call for. Charts are
/// evaluated independently; one that cannot be drawn is skipped with a
/// reason and the others still stand.
#[must_use]
pub fn plan_charts(table: &ResultTable, descriptor: &SchemaDescriptor) -> VisualizationPlan {
    if table.rows.is_empty() {
        return VisualizationPlan {
            capabilities: Vec::new(),
            charts: Vec::new(),
            notes: vec![NO_RESULTS_NOTE.to_string()],
        };
    }

    let capabilities = capabilities(table, descriptor);
    let columns = ResolvedColumns { table, descriptor };
    let color = columns.find(ColumnMeaning::Platform).map(ToString::to_string);

    let charts = capabilities
        .iter()
        .flat_map(|capability| capability.charts().iter().copied())
        .map(|kind| evaluate_chart(kind, &columns, color.clone()))
        .collect();

    let mut notes = Vec::new();
    if capabilities.contains(&Capability::NoMeasurements) {
        notes.push(NO_MEASUREMENTS_NOTE.to_string());
    }

    VisualizationPlan {
        capabilities,
        charts,
        notes,
    }
}

fn evaluate_chart(
    kind: ChartKind,
    columns: &ResolvedColumns<'_>,
    color: Option<String>,
) -> ChartOutcome {
    let (x_meaning, y_meaning, y_reversed) = kind.axes();

    let x = match x_meaning {
        Some(meaning) => match require_column(columns, meaning) {
            Ok(name) => Some(name),
            Err(reason) => return ChartOutcome::Skipped { kind, reason },
        },
        None => None,
    };
    let y = match require_column(columns, y_meaning) {
        Ok(name) => name,
        Err(reason) => return ChartOutcome::Skipped { kind, reason },
    };

    ChartOutcome::Planned {
        plan: ChartPlan {
            kind,
            title: kind.title().to_string(),
            x,
            y,
            color,
            y_reversed,
        },
    }
}

fn require_column(columns: &ResolvedColumns<'_>, meaning: ColumnMeaning) -> Result<String, String> {
    let Some(name) = columns.find(meaning) else {
        let wanted = columns
            .descriptor
            .column_with_meaning(meaning)
            .map_or_else(|| format!("{meaning:?}"), |column| column.name.clone());
        return Err(format!("column {wanted} not in result"));
    };
    if columns.table.column_values(name).all(|cell| cell.is_null()) {
        return Err(format!("column {name} has no values"));
    }
    Ok(name.to_string())
}
