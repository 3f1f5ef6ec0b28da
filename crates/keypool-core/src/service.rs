use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::PoolError;

/// Canonical identifiers for the external services a key pool serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    OpenRouter,
    SerpApi,
    Jina,
    Firecrawl,
    Tavily,
    Exa,
}

impl ServiceKind {
    pub const ALL: [Self; 6] = [
        Self::OpenRouter,
        Self::SerpApi,
        Self::Jina,
        Self::Firecrawl,
        Self::Tavily,
        Self::Exa,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OpenRouter => "openrouter",
            Self::SerpApi => "serpapi",
            Self::Jina => "jina",
            Self::Firecrawl => "firecrawl",
            Self::Tavily => "tavily",
            Self::Exa => "exa",
        }
    }

    pub const fn display_name(self) -> &'static str {
        match self {
            Self::OpenRouter => "OpenRouter.ai",
            Self::SerpApi => "SerpApi",
            Self::Jina => "Jina AI",
            Self::Firecrawl => "Firecrawl",
            Self::Tavily => "Tavily",
            Self::Exa => "Exa",
        }
    }
}

impl Display for ServiceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = PoolError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openrouter" => Ok(Self::OpenRouter),
            "serpapi" => Ok(Self::SerpApi),
            "jina" => Ok(Self::Jina),
            "firecrawl" => Ok(Self::Firecrawl),
            "tavily" => Ok(Self::Tavily),
            "exa" => Ok(Self::Exa),
            other => Err(PoolError::UnknownService {
                value: other.to_owned(),
            }),
        }
    }
}
