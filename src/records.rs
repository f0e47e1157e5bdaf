use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::wiki::{QualityLabel, RevisionId};

/// One roster row. The name doubles as the article title.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PoliticianRecord {
    pub name: String,
    pub url: String,
    pub country: String,
}

/// Output row. Field order is the column order of the output file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichedRecord {
    pub country: String,
    pub region: String,
    pub population: f64,
    pub article_title: String,
    pub revision_id: RevisionId,
    pub article_quality: QualityLabel,
}

pub const ENRICHED_COLUMNS: [&str; 6] = [
    "country",
    "region",
    "population",
    "article_title",
    "revision_id",
    "article_quality",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    PageInfo,
    QualityScore,
    RegionLookup,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::PageInfo, Stage::QualityScore, Stage::RegionLookup];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::PageInfo => "pageinfo",
            Stage::QualityScore => "quality_score",
            Stage::RegionLookup => "region_lookup",
        }
    }

    pub fn parse(s: &str) -> Option<Stage> {
        Stage::ALL.into_iter().find(|stage| stage.as_str() == s)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailureRecord {
    pub politician: PoliticianRecord,
    pub stage: Stage,
    pub error: String,
    pub raw_response: Option<Value>,
}
