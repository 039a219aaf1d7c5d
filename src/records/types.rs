use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
  Minor,
  Moderate,
  Severe,
  #[serde(other)]
  Unknown,
}

impl Severity {
  pub fn as_str(&self) -> &'static str {
    match self {
      Severity::Minor => "minor",
      Severity::Moderate => "moderate",
      Severity::Severe => "severe",
      Severity::Unknown => "unknown",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
  Pending,
  Processing,
  Completed,
  Failed,
  #[serde(other)]
  Unknown,
}

/// One damage analysis as shown on the history and recents pages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
  pub id: String,
  pub owner_id: String,
  pub created_at: DateTime<Utc>,
  pub vehicle: Option<String>,
  pub damage_type: String,
  pub severity: Severity,
  pub estimated_cost: f64,
  pub status: AnalysisStatus,
  /// Embedded image payload; absent when fetched under a reduced projection
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub image: Option<String>,
}

/// Partial update applied by `update_recent`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryPatch {
  pub vehicle: Option<String>,
  pub damage_type: Option<String>,
  pub severity: Option<Severity>,
  pub estimated_cost: Option<f64>,
  pub status: Option<AnalysisStatus>,
}

impl HistoryItem {
  pub fn apply(&mut self, patch: &HistoryPatch) {
    if let Some(vehicle) = &patch.vehicle {
      self.vehicle = Some(vehicle.clone());
    }
    if let Some(damage_type) = &patch.damage_type {
      self.damage_type = damage_type.clone();
    }
    if let Some(severity) = patch.severity {
      self.severity = severity;
    }
    if let Some(cost) = patch.estimated_cost {
      self.estimated_cost = cost;
    }
    if let Some(status) = patch.status {
      self.status = status;
    }
  }

  /// Case-insensitive match against the text fields shown in lists.
  pub fn matches(&self, query: &str) -> bool {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
      return true;
    }
    self.damage_type.to_lowercase().contains(&query)
      || self
        .vehicle
        .as_deref()
        .map(|v| v.to_lowercase().contains(&query))
        .unwrap_or(false)
      || self.severity.as_str().contains(&query)
  }
}

/// Aggregate figures for the analytics dashboard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Analytics {
  pub total_analyses: u64,
  pub total_estimated_cost: f64,
  pub average_cost: f64,
  /// Analyses per severity name
  pub by_severity: BTreeMap<String, u64>,
  /// Analyses per `YYYY-MM`
  pub by_month: BTreeMap<String, u64>,
}

impl Analytics {
  pub fn from_items(items: &[HistoryItem]) -> Self {
    let mut analytics = Analytics {
      total_analyses: items.len() as u64,
      ..Default::default()
    };

    for item in items {
      analytics.total_estimated_cost += item.estimated_cost;
      *analytics
        .by_severity
        .entry(item.severity.as_str().to_string())
        .or_insert(0) += 1;
      *analytics
        .by_month
        .entry(item.created_at.format("%Y-%m").to_string())
        .or_insert(0) += 1;
    }

    if !items.is_empty() {
      analytics.average_cost = analytics.total_estimated_cost / items.len() as f64;
    }
    analytics
  }
}

/// Per-user counters for the dashboard header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserStats {
  pub total_analyses: u64,
  pub completed: u64,
  pub pending: u64,
  pub last_activity: Option<DateTime<Utc>>,
}

impl UserStats {
  pub fn from_items(items: &[HistoryItem]) -> Self {
    UserStats {
      total_analyses: items.len() as u64,
      completed: items
        .iter()
        .filter(|i| i.status == AnalysisStatus::Completed)
        .count() as u64,
      pending: items
        .iter()
        .filter(|i| matches!(i.status, AnalysisStatus::Pending | AnalysisStatus::Processing))
        .count() as u64,
      last_activity: items.iter().map(|i| i.created_at).max(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn item(id: &str, month: u32, severity: Severity, cost: f64, status: AnalysisStatus) -> HistoryItem {
    HistoryItem {
      id: id.to_string(),
      owner_id: "u1".to_string(),
      created_at: Utc.with_ymd_and_hms(2024, month, 10, 12, 0, 0).unwrap(),
      vehicle: Some("Civic".to_string()),
      damage_type: "Dent".to_string(),
      severity,
      estimated_cost: cost,
      status,
      image: None,
    }
  }

  #[test]
  fn test_analytics_aggregates() {
    let items = vec![
      item("a", 1, Severity::Minor, 100.0, AnalysisStatus::Completed),
      item("b", 1, Severity::Severe, 300.0, AnalysisStatus::Pending),
      item("c", 2, Severity::Minor, 200.0, AnalysisStatus::Completed),
    ];

    let analytics = Analytics::from_items(&items);
    assert_eq!(analytics.total_analyses, 3);
    assert_eq!(analytics.total_estimated_cost, 600.0);
    assert_eq!(analytics.average_cost, 200.0);
    assert_eq!(analytics.by_severity["minor"], 2);
    assert_eq!(analytics.by_month["2024-01"], 2);

    let stats = UserStats::from_items(&items);
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.last_activity, Some(items[2].created_at));
  }

  #[test]
  fn test_empty_analytics() {
    let analytics = Analytics::from_items(&[]);
    assert_eq!(analytics.average_cost, 0.0);
    assert_eq!(UserStats::from_items(&[]).last_activity, None);
  }

  #[test]
  fn test_patch_and_match() {
    let mut it = item("a", 1, Severity::Minor, 100.0, AnalysisStatus::Pending);
    it.apply(&HistoryPatch {
      status: Some(AnalysisStatus::Completed),
      estimated_cost: Some(150.0),
      ..Default::default()
    });
    assert_eq!(it.status, AnalysisStatus::Completed);
    assert_eq!(it.estimated_cost, 150.0);
    assert_eq!(it.damage_type, "Dent");

    assert!(it.matches("civ"));
    assert!(it.matches(" DENT "));
    assert!(it.matches(""));
    assert!(!it.matches("scratch"));
  }
}
