//! Entity types tracked by the pending-change queue and their partial-update shapes.
//!
//! Each entity type gets its own patch struct so a queued change is checked
//! against the fields that record actually has. Unknown fields are rejected
//! when a stored patch is decoded.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// The closed set of record categories the queue tracks independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityType {
  Goal,
  Dashboard,
  Analytics,
  Organization,
  Team,
  TeamMember,
}

impl EntityType {
  pub const ALL: [EntityType; 6] = [
    EntityType::Goal,
    EntityType::Dashboard,
    EntityType::Analytics,
    EntityType::Organization,
    EntityType::Team,
    EntityType::TeamMember,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      EntityType::Goal => "goal",
      EntityType::Dashboard => "dashboard",
      EntityType::Analytics => "analytics",
      EntityType::Organization => "organization",
      EntityType::Team => "team",
      EntityType::TeamMember => "team-member",
    }
  }

  /// Remote table holding records of this type.
  pub fn table(self) -> &'static str {
    match self {
      EntityType::Goal => "strategic_goals",
      EntityType::Dashboard => "dashboards",
      EntityType::Analytics => "analytics_snapshots",
      EntityType::Organization => "organizations",
      EntityType::Team => "teams",
      EntityType::TeamMember => "team_members",
    }
  }
}

impl fmt::Display for EntityType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for EntityType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    EntityType::ALL
      .into_iter()
      .find(|t| t.as_str() == s)
      .ok_or_else(|| {
        let known = EntityType::ALL.map(EntityType::as_str).join(", ");
        format!("unknown entity type '{}' (expected one of: {})", s, known)
      })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
  Draft,
  Active,
  OnHold,
  Completed,
  Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
  Low,
  Medium,
  High,
  Critical,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GoalPatch {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<GoalStatus>,
  /// Percent complete, 0-100
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub progress: Option<u8>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub priority: Option<Priority>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub target_date: Option<NaiveDate>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub owner_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DashboardPatch {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  /// Widget grid as stored by the dashboard editor
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub layout: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub widgets: Option<Vec<String>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub is_default: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalyticsPatch {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub metric: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub value: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub target: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub period: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrganizationPatch {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub industry: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub mission: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub vision: Option<String>,
  /// Month number, 1-12
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub fiscal_year_start: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TeamPatch {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub lead_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub department: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TeamMemberPatch {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub team_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub role: Option<String>,
  /// Percent of time allocated to the team, 0-100
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub allocation: Option<u8>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub active: Option<bool>,
}

/// A partial update for one record, tagged with its entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "fields", rename_all = "kebab-case")]
pub enum EntityPatch {
  Goal(GoalPatch),
  Dashboard(DashboardPatch),
  Analytics(AnalyticsPatch),
  Organization(OrganizationPatch),
  Team(TeamPatch),
  TeamMember(TeamMemberPatch),
}

impl EntityPatch {
  pub fn entity_type(&self) -> EntityType {
    match self {
      EntityPatch::Goal(_) => EntityType::Goal,
      EntityPatch::Dashboard(_) => EntityType::Dashboard,
      EntityPatch::Analytics(_) => EntityType::Analytics,
      EntityPatch::Organization(_) => EntityType::Organization,
      EntityPatch::Team(_) => EntityType::Team,
      EntityPatch::TeamMember(_) => EntityType::TeamMember,
    }
  }

  /// Build a patch of type `entity_type` from loose JSON fields.
  pub fn from_fields(entity_type: EntityType, fields: Value) -> serde_json::Result<Self> {
    Ok(match entity_type {
      EntityType::Goal => EntityPatch::Goal(serde_json::from_value(fields)?),
      EntityType::Dashboard => EntityPatch::Dashboard(serde_json::from_value(fields)?),
      EntityType::Analytics => EntityPatch::Analytics(serde_json::from_value(fields)?),
      EntityType::Organization => EntityPatch::Organization(serde_json::from_value(fields)?),
      EntityType::Team => EntityPatch::Team(serde_json::from_value(fields)?),
      EntityType::TeamMember => EntityPatch::TeamMember(serde_json::from_value(fields)?),
    })
  }

  /// The changed fields as a JSON object, ready for the remote update call.
  pub fn fields(&self) -> serde_json::Result<Value> {
    match self {
      EntityPatch::Goal(p) => serde_json::to_value(p),
      EntityPatch::Dashboard(p) => serde_json::to_value(p),
      EntityPatch::Analytics(p) => serde_json::to_value(p),
      EntityPatch::Organization(p) => serde_json::to_value(p),
      EntityPatch::Team(p) => serde_json::to_value(p),
      EntityPatch::TeamMember(p) => serde_json::to_value(p),
    }
  }

  /// Check value ranges the type system can't express.
  pub fn validate(&self) -> Result<(), String> {
    let empty = self
      .fields()
      .map(|v| v.as_object().map_or(true, |o| o.is_empty()))
      .unwrap_or(true);
    if empty {
      return Err("patch has no fields".to_string());
    }

    match self {
      EntityPatch::Goal(GoalPatch {
        progress: Some(p), ..
      }) if *p > 100 => Err(format!("goal progress {} is over 100", p)),
      EntityPatch::Organization(OrganizationPatch {
        fiscal_year_start: Some(m),
        ..
      }) if !(1..=12).contains(m) => Err(format!("fiscal year start month {} is not 1-12", m)),
      EntityPatch::TeamMember(TeamMemberPatch {
        allocation: Some(a),
        ..
      }) if *a > 100 => Err(format!("allocation {} is over 100", a)),
      EntityPatch::Analytics(AnalyticsPatch {
        value: Some(v), ..
      }) if !v.is_finite() => Err("analytics value must be finite".to_string()),
      _ => Ok(()),
    }
  }
}
