use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Scheduling priority of a task.
///
/// Priorities are only related through [`Priority::preemptible`]; there is no
/// transitive ordering beyond the declared pairs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
    Background,
}

const PREEMPTS_FROM_CRITICAL: &[Priority] = &[
    Priority::High,
    Priority::Normal,
    Priority::Low,
    Priority::Background,
];
const PREEMPTS_FROM_HIGH: &[Priority] = &[Priority::Normal, Priority::Low, Priority::Background];
const PREEMPTS_NOTHING: &[Priority] = &[];

impl Priority {
    /// All priorities, highest bucket first. Queue scans walk this order.
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Background,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
            Self::Background => "background",
        }
    }

    /// Queue bucket index (0 = critical).
    pub fn bucket(&self) -> usize {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
            Self::Background => 4,
        }
    }

    /// Preemption matrix row: the priorities a task of this priority may preempt.
    pub fn preemptible(&self) -> &'static [Priority] {
        match self {
            Self::Critical => PREEMPTS_FROM_CRITICAL,
            Self::High => PREEMPTS_FROM_HIGH,
            Self::Normal | Self::Low | Self::Background => PREEMPTS_NOTHING,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            "background" => Ok(Self::Background),
            other => Err(format!(
                "Invalid priority '{}'. Valid values: critical, high, normal, low, background",
                other
            )),
        }
    }
}

/// Whether an incoming task may preempt a running one.
pub fn should_preempt(running: Priority, incoming: Priority) -> bool {
    incoming.preemptible().contains(&running)
}

/// Which kind of caller produced a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Subagent,
    AgentTeam,
    Orchestration,
    Loop,
    #[default]
    Direct,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subagent => "subagent",
            Self::AgentTeam => "agent_team",
            Self::Orchestration => "orchestration",
            Self::Loop => "loop",
            Self::Direct => "direct",
        }
    }

    /// Prefix used for generated task ids of this kind.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            Self::Subagent => "sub",
            Self::AgentTeam => "team",
            Self::Orchestration => "orch",
            Self::Loop => "loop",
            Self::Direct => "task",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// `(provider, model)` pair keying every limiter table.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelKey {
    pub provider: String,
    pub model: String,
}

impl ModelKey {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }

    /// Parse `provider:model`. The model part may itself contain `:`.
    pub fn parse(spec: &str) -> Option<Self> {
        let (provider, model) = spec.split_once(':')?;
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self::new(provider, model))
    }
}

impl std::fmt::Display for ModelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.provider, self.model)
    }
}

/// Cost estimate attached to a task by an upstream estimator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostEstimate {
    pub estimated_tokens: u64,
    pub estimated_duration_ms: u64,
}

/// Output format for CLI responses
#[derive(Clone, Debug, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_rows() {
        assert_eq!(Priority::Critical.preemptible().len(), 4);
        assert_eq!(Priority::High.preemptible().len(), 3);
        assert!(Priority::Normal.preemptible().is_empty());
        assert!(Priority::Low.preemptible().is_empty());
        assert!(Priority::Background.preemptible().is_empty());
    }

    #[test]
    fn test_should_preempt_all_pairs() {
        for running in Priority::ALL {
            for incoming in Priority::ALL {
                let expected = incoming.preemptible().contains(&running);
                assert_eq!(
                    should_preempt(running, incoming),
                    expected,
                    "running={running} incoming={incoming}"
                );
                if running == incoming {
                    assert!(!should_preempt(running, incoming));
                }
            }
        }
    }

    #[test]
    fn test_critical_preempts_high_not_reverse() {
        assert!(should_preempt(Priority::High, Priority::Critical));
        assert!(!should_preempt(Priority::Critical, Priority::High));
        assert!(!should_preempt(Priority::Low, Priority::Normal));
    }

    #[test]
    fn test_priority_from_str() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!(
            " background ".parse::<Priority>().unwrap(),
            Priority::Background
        );
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_priority_serde_lowercase() {
        let json = serde_json::to_string(&Priority::Critical).unwrap();
        assert_eq!(json, "\"critical\"");
        let back: Priority = serde_json::from_str("\"low\"").unwrap();
        assert_eq!(back, Priority::Low);
    }

    #[test]
    fn test_buckets_follow_all_order() {
        for (idx, priority) in Priority::ALL.iter().enumerate() {
            assert_eq!(priority.bucket(), idx);
        }
    }

    #[test]
    fn test_model_key_display_and_parse() {
        let key = ModelKey::new("openai", "gpt-4");
        assert_eq!(key.to_string(), "openai:gpt-4");
        assert_eq!(ModelKey::parse("openai:gpt-4"), Some(key));

        let nested = ModelKey::parse("ollama:llama3:8b").unwrap();
        assert_eq!(nested.provider, "ollama");
        assert_eq!(nested.model, "llama3:8b");

        assert!(ModelKey::parse("no-colon").is_none());
        assert!(ModelKey::parse(":model").is_none());
        assert!(ModelKey::parse("provider:").is_none());
    }

    #[test]
    fn test_cost_estimate_camel_case() {
        let cost = CostEstimate {
            estimated_tokens: 1200,
            estimated_duration_ms: 3000,
        };
        let json = serde_json::to_string(&cost).unwrap();
        assert!(json.contains("estimatedTokens"));
        assert!(json.contains("estimatedDurationMs"));
    }
}
