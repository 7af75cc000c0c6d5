use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::MeteringError;

/// key: billing-resource-registry -> billable categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Roasts,
    CommentAnalysis,
    ApiCalls,
    ShieldActions,
}

impl ResourceType {
    pub const ALL: [ResourceType; 4] = [
        ResourceType::Roasts,
        ResourceType::CommentAnalysis,
        ResourceType::ApiCalls,
        ResourceType::ShieldActions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Roasts => "roasts",
            ResourceType::CommentAnalysis => "comment_analysis",
            ResourceType::ApiCalls => "api_calls",
            ResourceType::ShieldActions => "shield_actions",
        }
    }

    /// Name used in alert and denial messages.
    pub fn display_name(&self) -> &'static str {
        match self {
            ResourceType::Roasts => "roast responses",
            ResourceType::CommentAnalysis => "comment analyses",
            ResourceType::ApiCalls => "API calls",
            ResourceType::ShieldActions => "shield actions",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = MeteringError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "roasts" => Ok(ResourceType::Roasts),
            "comment_analysis" => Ok(ResourceType::CommentAnalysis),
            "api_calls" => Ok(ResourceType::ApiCalls),
            "shield_actions" => Ok(ResourceType::ShieldActions),
            other => Err(MeteringError::UnknownResource(other.to_string())),
        }
    }
}

/// key: billing-operation-registry -> operation kind to resource + unit cost
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    GenerateReply,
    AnalyzeToxicity,
    FetchComment,
    PostResponse,
    ShieldAction,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::GenerateReply => "generate_reply",
            OperationKind::AnalyzeToxicity => "analyze_toxicity",
            OperationKind::FetchComment => "fetch_comment",
            OperationKind::PostResponse => "post_response",
            OperationKind::ShieldAction => "shield_action",
        }
    }

    pub fn resource_type(&self) -> ResourceType {
        match self {
            OperationKind::GenerateReply => ResourceType::Roasts,
            OperationKind::AnalyzeToxicity => ResourceType::CommentAnalysis,
            OperationKind::FetchComment | OperationKind::PostResponse => ResourceType::ApiCalls,
            OperationKind::ShieldAction => ResourceType::ShieldActions,
        }
    }

    /// Default cost per unit, in cents.
    pub fn unit_cost_cents(&self) -> i64 {
        match self {
            OperationKind::GenerateReply => 5,
            OperationKind::AnalyzeToxicity => 1,
            OperationKind::FetchComment
            | OperationKind::PostResponse
            | OperationKind::ShieldAction => 0,
        }
    }
}

impl FromStr for OperationKind {
    type Err = MeteringError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "generate_reply" => Ok(OperationKind::GenerateReply),
            "analyze_toxicity" => Ok(OperationKind::AnalyzeToxicity),
            "fetch_comment" => Ok(OperationKind::FetchComment),
            "post_response" => Ok(OperationKind::PostResponse),
            "shield_action" => Ok(OperationKind::ShieldAction),
            other => Err(MeteringError::UnknownResource(other.to_string())),
        }
    }
}
