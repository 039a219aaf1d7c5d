//! Serde-deserializable shape of analysis records in the remote store.
//!
//! These types are separate from domain types so remote naming and loose
//! typing stay at the boundary.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::types::{AnalysisStatus, HistoryItem, Severity};
use crate::remote::Record;

/// Re-serialize a value through JSON to convert between compatible types.
pub fn reserialize<T: DeserializeOwned>(value: impl Serialize) -> serde_json::Result<T> {
  serde_json::from_value(serde_json::to_value(value)?)
}

/// Numbers sometimes arrive as strings from older clients.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ApiNumber {
  Number(f64),
  Text(String),
}

impl ApiNumber {
  fn value(&self) -> Option<f64> {
    match self {
      ApiNumber::Number(n) => Some(*n),
      ApiNumber::Text(s) => s.trim().parse().ok(),
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiAnalysis {
  pub id: String,
  #[serde(rename = "userId")]
  pub user_id: String,
  #[serde(alias = "createdAt")]
  pub timestamp: DateTime<Utc>,
  #[serde(rename = "vehicleInfo", alias = "vehicle")]
  pub vehicle_info: Option<String>,
  #[serde(rename = "damageType", default)]
  pub damage_type: Option<String>,
  #[serde(default)]
  pub severity: Option<Severity>,
  #[serde(rename = "estimatedCost", default)]
  pub estimated_cost: Option<ApiNumber>,
  #[serde(default)]
  pub status: Option<AnalysisStatus>,
  #[serde(alias = "imageData", default)]
  pub image: Option<String>,
}

impl ApiAnalysis {
  pub fn from_record(record: Record) -> Result<Self> {
    let id = record.id.clone();
    reserialize(record).map_err(|e| eyre!("Invalid analysis record {}: {}", id, e))
  }

  pub fn into_history_item(self) -> Result<HistoryItem> {
    if self.id.trim().is_empty() {
      return Err(eyre!("Analysis record has an empty id"));
    }

    let estimated_cost = match &self.estimated_cost {
      Some(n) => n
        .value()
        .ok_or_else(|| eyre!("Analysis {} has a non-numeric estimatedCost", self.id))?,
      None => 0.0,
    };

    Ok(HistoryItem {
      id: self.id,
      owner_id: self.user_id,
      created_at: self.timestamp,
      vehicle: self.vehicle_info.filter(|v| !v.trim().is_empty()),
      damage_type: self
        .damage_type
        .unwrap_or_else(|| "Unspecified".to_string()),
      severity: self.severity.unwrap_or(Severity::Unknown),
      estimated_cost,
      status: self.status.unwrap_or(AnalysisStatus::Pending),
      image: self.image,
    })
  }
}
