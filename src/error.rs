use thiserror::Error;

use crate::sync::{EntityType, SyncReport};

/// Failures of the TTL cache write path.
///
/// These never escape as panics; a rejected write just means the next read
/// misses and the caller goes back to the remote service.
#[derive(Error, Debug)]
pub enum CacheError {
  #[error("Failed to serialize cache entry {key}: {source}")]
  Serialization {
    key: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("Cache entry {key} is {size} bytes, limit is {max}")]
  Oversize { key: String, size: usize, max: usize },

  #[error("Storage error: {0}")]
  Storage(String),
}

#[derive(Error, Debug)]
pub enum QueueError {
  #[error("Invalid {entity_type} patch for '{entity_id}': {reason}")]
  InvalidPatch {
    entity_type: EntityType,
    entity_id: String,
    reason: String,
  },

  #[error("Failed to encode pending changes for {key}: {source}")]
  Encode {
    key: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("Failed to decode pending changes for {key}: {source}")]
  Decode {
    key: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("Storage error: {0}")]
  Storage(String),
}

#[derive(Error, Debug)]
pub enum SyncError {
  #[error("Cannot sync while offline")]
  Unavailable,

  #[error("Sync failed for {}", failed_types(.report))]
  PartialFailure { report: SyncReport },
}

impl SyncError {
  /// Entity types whose queues were kept because dispatch failed.
  pub fn failed(&self) -> Vec<EntityType> {
    match self {
      SyncError::PartialFailure { report } => {
        report.failed.iter().map(|f| f.entity_type).collect()
      }
      _ => Vec::new(),
    }
  }
}

fn failed_types(report: &SyncReport) -> String {
  report
    .failed
    .iter()
    .map(|f| f.entity_type.as_str())
    .collect::<Vec<_>>()
    .join(", ")
}

/// Why one remote update did not go through.
#[derive(Error, Debug)]
pub enum RemoteError {
  #[error("Rejected with {status}: {body}")]
  Rejected { status: u16, body: String },

  #[error("Rate limited by the data service")]
  RateLimited,

  #[error("Data service failed with {status}: {body}")]
  Server { status: u16, body: String },

  #[error("Network error: {0}")]
  Network(#[from] reqwest::Error),

  #[error("Timed out after {0:?}")]
  Timeout(std::time::Duration),

  #[error("Connection lost")]
  Disconnected,

  #[error("No endpoint for {0}")]
  Endpoint(#[from] url::ParseError),

  #[error("Failed to encode patch: {0}")]
  Encode(#[from] serde_json::Error),
}

/// Characters of a response body kept in an error
const BODY_EXCERPT_CHARS: usize = 300;

impl RemoteError {
  /// Classify a non-success response.
  pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
    let status = status.as_u16();
    let body = excerpt(body);
    match status {
      429 => RemoteError::RateLimited,
      500..=u16::MAX => RemoteError::Server { status, body },
      _ => RemoteError::Rejected { status, body },
    }
  }

  /// Whether the same update may succeed if sent again later.
  pub fn is_transient(&self) -> bool {
    match self {
      RemoteError::Rejected { status, .. } => *status == 408,
      RemoteError::Endpoint(_) | RemoteError::Encode(_) => false,
      _ => true,
    }
  }
}

fn excerpt(body: &str) -> String {
  match body.char_indices().nth(BODY_EXCERPT_CHARS) {
    Some((cut, _)) => format!("{}... ({} bytes)", &body[..cut], body.len()),
    None => body.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::StatusCode;

  #[test]
  fn test_from_status_classifies() {
    assert!(matches!(
      RemoteError::from_status(StatusCode::UNAUTHORIZED, ""),
      RemoteError::Rejected { status: 401, .. }
    ));
    assert!(matches!(
      RemoteError::from_status(StatusCode::TOO_MANY_REQUESTS, ""),
      RemoteError::RateLimited
    ));
    assert!(matches!(
      RemoteError::from_status(StatusCode::BAD_GATEWAY, "upstream"),
      RemoteError::Server { status: 502, ref body } if body == "upstream"
    ));
  }

  #[test]
  fn test_transient_errors() {
    assert!(RemoteError::RateLimited.is_transient());
    assert!(RemoteError::Disconnected.is_transient());
    assert!(!RemoteError::from_status(StatusCode::FORBIDDEN, "rls").is_transient());
    assert!(RemoteError::from_status(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
  }

  #[test]
  fn test_long_bodies_are_cut_on_char_boundary() {
    let body = "é".repeat(1_000);
    match RemoteError::from_status(StatusCode::FORBIDDEN, &body) {
      RemoteError::Rejected { body: msg, .. } => {
        assert!(msg.starts_with(&"é".repeat(BODY_EXCERPT_CHARS)));
        assert!(msg.ends_with("(2000 bytes)"));
      }
      other => panic!("unexpected {other:?}"),
    }
  }
}
