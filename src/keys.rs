//! Cache keys for the dashboard's cached reads.

use sha2::{Digest, Sha256};

use crate::cache::Ttl;
use crate::sync::EntityType;

/// Reads the data hooks serve through the TTL cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataQuery {
  /// Goal list for an organization
  StrategicGoals { organization_id: String },
  /// A single goal with its key results
  GoalDetail { goal_id: String },
  /// Initiatives, optionally scoped to one goal
  Initiatives { goal_id: Option<String> },
  /// Aggregated figures shown on the dashboard landing page
  DashboardMetrics { organization_id: String },
  /// Members of one team
  TeamRoster { team_id: String },
  /// Enabled ERP modules
  ErpModules,
  /// Filtered list of one entity type
  Search { entity_type: EntityType, filter: String },
}

impl DataQuery {
  /// Readable, stable key; free-form filters are hashed to a fixed length.
  pub fn cache_key(&self) -> String {
    match self {
      Self::StrategicGoals { organization_id } => format!("strategic-goals:{}", organization_id),
      Self::GoalDetail { goal_id } => format!("goal:{}", goal_id),
      Self::Initiatives { goal_id } => {
        format!("initiatives:{}", goal_id.as_deref().unwrap_or("all"))
      }
      Self::DashboardMetrics { organization_id } => {
        format!("dashboard-metrics:{}", organization_id)
      }
      Self::TeamRoster { team_id } => format!("team-members:{}", team_id),
      Self::ErpModules => "erp-modules".to_string(),
      Self::Search {
        entity_type,
        filter,
      } => format!("search:{}:{}", entity_type, hash_filter(filter)),
    }
  }

  /// How long a result stays valid, by how often the data changes.
  pub fn ttl(&self) -> Ttl {
    match self {
      Self::GoalDetail { .. } | Self::Search { .. } => Ttl::Short,
      Self::StrategicGoals { .. } | Self::Initiatives { .. } | Self::DashboardMetrics { .. } => {
        Ttl::Medium
      }
      Self::TeamRoster { .. } | Self::ErpModules => Ttl::Long,
    }
  }

  /// Human readable description for logs and the CLI.
  pub fn description(&self) -> String {
    match self {
      Self::StrategicGoals { organization_id } => format!("goals for {}", organization_id),
      Self::GoalDetail { goal_id } => format!("goal {}", goal_id),
      Self::Initiatives { goal_id: Some(g) } => format!("initiatives for goal {}", g),
      Self::Initiatives { goal_id: None } => "all initiatives".to_string(),
      Self::DashboardMetrics { organization_id } => format!("dashboard for {}", organization_id),
      Self::TeamRoster { team_id } => format!("members of team {}", team_id),
      Self::ErpModules => "ERP modules".to_string(),
      Self::Search {
        entity_type,
        filter,
      } => format!("{} matching {}", entity_type, filter),
    }
  }
}

/// SHA256 of the normalized filter: trimmed and lowercased so equivalent
/// filters share an entry.
fn hash_filter(filter: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(filter.trim().to_lowercase().as_bytes());
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_readable_keys() {
    let q = DataQuery::StrategicGoals {
      organization_id: "org1".into(),
    };
    assert_eq!(q.cache_key(), "strategic-goals:org1");
    assert_eq!(
      DataQuery::Initiatives { goal_id: None }.cache_key(),
      "initiatives:all"
    );
  }

  #[test]
  fn test_search_keys_normalize_filter() {
    let a = DataQuery::Search {
      entity_type: EntityType::Goal,
      filter: "Status = Active ".into(),
    };
    let b = DataQuery::Search {
      entity_type: EntityType::Goal,
      filter: "status = active".into(),
    };
    assert_eq!(a.cache_key(), b.cache_key());
    assert_eq!(a.cache_key().len(), "search:goal:".len() + 64);
  }

  #[test]
  fn test_dashboard_aggregates_use_medium() {
    let q = DataQuery::DashboardMetrics {
      organization_id: "org1".into(),
    };
    assert_eq!(q.ttl(), Ttl::Medium);
    assert_eq!(DataQuery::ErpModules.ttl(), Ttl::Long);
  }
}
