//! Deterministic sample data served when nothing is cached and the remote
//! store cannot be reached.

use chrono::{DateTime, Utc};

use super::types::{AnalysisStatus, Analytics, HistoryItem, Severity, UserStats};

fn at(secs: i64) -> DateTime<Utc> {
  DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

pub fn sample_history() -> Vec<HistoryItem> {
  let sample = |id: &str, secs, vehicle: &str, damage: &str, severity, cost, status| HistoryItem {
    id: id.to_string(),
    owner_id: "sample".to_string(),
    created_at: at(secs),
    vehicle: Some(vehicle.to_string()),
    damage_type: damage.to_string(),
    severity,
    estimated_cost: cost,
    status,
    image: None,
  };

  vec![
    sample(
      "sample-3",
      1_706_745_600,
      "2020 Toyota Corolla",
      "Bumper dent",
      Severity::Moderate,
      850.0,
      AnalysisStatus::Completed,
    ),
    sample(
      "sample-2",
      1_704_067_200,
      "2018 Honda Civic",
      "Door scratch",
      Severity::Minor,
      320.0,
      AnalysisStatus::Completed,
    ),
    sample(
      "sample-1",
      1_701_388_800,
      "2021 Ford F-150",
      "Windshield crack",
      Severity::Severe,
      1_450.0,
      AnalysisStatus::Pending,
    ),
  ]
}

pub fn sample_analytics() -> Analytics {
  Analytics::from_items(&sample_history())
}

pub fn sample_user_stats() -> UserStats {
  UserStats::from_items(&sample_history())
}
