use anyhow::{Context, Result};
use prettytable::{format::FormatBuilder, Cell, Row, Table};
use serde::Serialize;
use sessiongate_core::{AksClusterInfo, ClusterInfo};
use std::io::Write;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Format {
    #[default]
    Table,
    Json,
    Yaml,
}

/// A record that can be shown as one row of a listing.
pub trait Tabular: Serialize {
    const HEADERS: &'static [&'static str];

    fn cells(&self) -> Vec<String>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostedClusterRow {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub subscription_id: String,
    pub resource_group: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_endpoint: Option<String>,
}

pub fn write<T: Tabular>(out: &mut dyn Write, format: Format, items: &[T]) -> Result<()> {
    match format {
        Format::Table => {
            let mut table = Table::new();
            table.set_titles(Row::new(T::HEADERS.iter().map(|h| Cell::new(h)).collect()));
            for item in items {
                table.add_row(Row::new(item.cells().iter().map(|c| Cell::new(c)).collect()));
            }
            let format = FormatBuilder::new().column_separator(' ').padding(0, 2).build();
            table.set_format(format);
            table.print(out).context("writing table")?;
        }
        Format::Json => {
            serde_json::to_writer_pretty(&mut *out, items).context("writing JSON")?;
            writeln!(out)?;
        }
        Format::Yaml => {
            let yaml = serde_yaml::to_string(items).context("writing YAML")?;
            out.write_all(yaml.as_bytes())?;
        }
    }
    Ok(())
}

// === impl Tabular ===

impl Tabular for AksClusterInfo {
    const HEADERS: &'static [&'static str] =
        &["NAME", "LOCATION", "RESOURCE GROUP", "SUBSCRIPTION", "STATE"];

    fn cells(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.location.clone(),
            self.resource_group.clone(),
            self.subscription_name.clone(),
            self.state.clone().unwrap_or_default(),
        ]
    }
}

impl From<ClusterInfo> for HostedClusterRow {
    fn from(info: ClusterInfo) -> Self {
        Self {
            namespace: info.namespace(),
            id: info.id,
            name: info.name,
            subscription_id: info.subscription_id,
            resource_group: info.resource_group,
            api_endpoint: info.api_endpoint,
        }
    }
}

impl Tabular for HostedClusterRow {
    const HEADERS: &'static [&'static str] =
        &["ID", "NAME", "NAMESPACE", "SUBSCRIPTION", "RESOURCE GROUP"];

    fn cells(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.name.clone(),
            self.namespace.clone(),
            self.subscription_id.clone(),
            self.resource_group.clone(),
        ]
    }
}
