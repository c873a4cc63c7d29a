use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sift_memory::RepositoryId;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type, Serialize, Deserialize,
)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether the job will not change state again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling priority; lower rank is served first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    High,
    #[default]
    Normal,
    Low,
}

impl JobPriority {
    #[must_use]
    pub fn rank(self) -> i64 {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }

    #[must_use]
    pub fn from_rank(rank: i64) -> Self {
        match rank {
            i64::MIN..=0 => Self::High,
            1 => Self::Normal,
            _ => Self::Low,
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Some(Self::High),
            "normal" => Some(Self::Normal),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        })
    }
}

/// One request to embed every unembedded chunk of a repository.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbeddingJob {
    pub id: JobId,
    pub repository_id: RepositoryId,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub attempts: u32,
    pub max_attempts: u32,
    pub total_chunks: u64,
    pub processed_chunks: u64,
    pub failed_chunks: u64,
    /// Percentage of `total_chunks` processed, 0 to 100.
    pub progress: f64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// The job is not claimed again before this instant.
    pub next_attempt_at: DateTime<Utc>,
}

impl EmbeddingJob {
    #[must_use]
    pub fn attempts_left(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }
}

/// Number of jobs per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("paused"), None);
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
    }

    #[test]
    fn priority_ranks_order_high_first() {
        assert!(JobPriority::High.rank() < JobPriority::Normal.rank());
        assert!(JobPriority::Normal.rank() < JobPriority::Low.rank());
        assert_eq!(JobPriority::from_rank(2), JobPriority::Low);
        assert_eq!(JobPriority::parse("HIGH"), Some(JobPriority::High));
        assert_eq!(JobPriority::default(), JobPriority::Normal);
    }

    #[test]
    fn queue_stats_total() {
        let stats = QueueStats {
            pending: 1,
            processing: 2,
            completed: 3,
            failed: 4,
        };
        assert_eq!(stats.total(), 10);
    }
}
