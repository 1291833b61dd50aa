//! Project / chart / round documents.
//!
//! Field names serialize in camelCase to match the persisted document shape.
//! A project's round content lives in per-round sub-documents ([`RoundDoc`]);
//! [`Project::root_document`] and [`Project::round_documents`] split a project
//! into those pieces and [`Project::from_documents`] puts it back together.

use std::collections::HashMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub type Timestamp = DateTime<Utc>;

pub fn now() -> Timestamp {
    Utc::now()
}

pub fn from_millis(ms: i64) -> Timestamp {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// Next modification time after `previous`: wall clock, but never earlier
/// than one millisecond past the previous value.
pub fn advance(previous: Timestamp, now: Timestamp) -> Timestamp {
    let floor = previous + Duration::milliseconds(1);
    if now > floor {
        now
    } else {
        floor
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Legacy single-pattern rounds. Empty once a project has charts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pattern: Vec<Round>,
    #[serde(default)]
    pub current_round: u32,
    #[serde(default)]
    pub current_stitch: u32,
    /// `None` marks a document written before charts existed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charts: Option<Vec<Chart>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_chart_id: Option<String>,
    #[serde(default)]
    pub yarns: Vec<Yarn>,
    #[serde(default)]
    pub sessions: Vec<WorkSession>,
    pub created_date: Timestamp,
    pub last_modified: Timestamp,
    #[serde(default)]
    pub is_completed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chart {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub rounds: Vec<Round>,
    #[serde(default)]
    pub current_round: u32,
    #[serde(default)]
    pub current_stitch: u32,
    pub created_date: Timestamp,
    pub last_modified: Timestamp,
    #[serde(default)]
    pub is_completed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Round {
    pub id: String,
    pub round_number: i64,
    #[serde(default)]
    pub stitches: Vec<Stitch>,
    #[serde(default)]
    pub stitch_groups: Vec<StitchGroup>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pattern_items: Vec<PatternItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stitch {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "one")]
    pub count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StitchGroup {
    pub id: String,
    #[serde(default)]
    pub stitches: Vec<Stitch>,
    #[serde(default = "one")]
    pub repeat_count: u32,
}

fn one() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternItem {
    pub order: i64,
    pub created_at: Timestamp,
    pub item: PatternItemKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum PatternItemKind {
    Stitch(Stitch),
    Group(StitchGroup),
}

impl PatternItem {
    pub fn id(&self) -> &str {
        match &self.item {
            PatternItemKind::Stitch(s) => &s.id,
            PatternItemKind::Group(g) => &g.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Yarn {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkSession {
    pub id: String,
    pub start_time: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<Timestamp>,
    #[serde(default)]
    pub rounds_completed: u32,
}

/// The authoritative progress pointer of a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub chart_id: Option<String>,
    pub round: u32,
    pub stitch: u32,
}

impl Project {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let ts = now();
        Self {
            id: id.into(),
            name: name.into(),
            source: None,
            notes: None,
            pattern: Vec::new(),
            current_round: 0,
            current_stitch: 0,
            charts: Some(Vec::new()),
            current_chart_id: None,
            yarns: Vec::new(),
            sessions: Vec::new(),
            created_date: ts,
            last_modified: ts,
            is_completed: false,
        }
    }

    pub fn charts(&self) -> &[Chart] {
        self.charts.as_deref().unwrap_or(&[])
    }

    pub fn current_chart(&self) -> Option<&Chart> {
        let id = self.current_chart_id.as_deref()?;
        self.charts().iter().find(|c| c.id == id)
    }

    pub fn current_chart_mut(&mut self) -> Option<&mut Chart> {
        let id = self.current_chart_id.clone()?;
        self.charts.as_mut()?.iter_mut().find(|c| c.id == id)
    }

    pub fn progress(&self) -> Progress {
        match self.current_chart() {
            Some(chart) => Progress {
                chart_id: Some(chart.id.clone()),
                round: chart.current_round,
                stitch: chart.current_stitch,
            },
            None => Progress {
                chart_id: None,
                round: self.current_round,
                stitch: self.current_stitch,
            },
        }
    }

    /// Moves the authoritative progress pointer. The legacy fields mirror it.
    pub fn set_progress(&mut self, round: u32, stitch: u32) {
        let ts = now();
        if let Some(chart) = self.current_chart_mut() {
            chart.current_round = round;
            chart.current_stitch = stitch;
            chart.last_modified = advance(chart.last_modified, ts);
        }
        self.current_round = round;
        self.current_stitch = stitch;
        self.last_modified = advance(self.last_modified, ts);
    }

    pub fn touch(&mut self) {
        self.last_modified = advance(self.last_modified, now());
    }

    pub fn last_modified_millis(&self) -> i64 {
        self.last_modified.timestamp_millis()
    }

    /// Every round in the project, legacy pattern included.
    pub fn all_rounds(&self) -> impl Iterator<Item = &Round> {
        self.pattern
            .iter()
            .chain(self.charts().iter().flat_map(|c| c.rounds.iter()))
    }

    /// Root document as stored remotely: rounds live in sub-documents instead.
    pub fn root_document(&self) -> Project {
        let mut root = self.clone();
        root.pattern.clear();
        if let Some(charts) = root.charts.as_mut() {
            for chart in charts {
                chart.rounds.clear();
            }
        }
        root
    }

    pub fn round_documents(&self) -> Vec<RoundDoc> {
        let legacy = self.pattern.iter().map(|r| RoundDoc::from_round(r, None));
        let charted = self
            .charts()
            .iter()
            .flat_map(|c| c.rounds.iter().map(move |r| RoundDoc::from_round(r, Some(&c.id))));
        legacy.chain(charted).collect()
    }

    /// Reattaches round sub-documents to their charts, or to the legacy
    /// pattern when they carry no chart id. Rounds naming an unknown chart
    /// fall back to the legacy pattern so nothing is dropped.
    pub fn from_documents(root: Project, rounds: Vec<RoundDoc>) -> Project {
        let mut project = root;
        project.pattern.clear();

        let mut by_chart: HashMap<String, Vec<Round>> = HashMap::new();
        let mut legacy = Vec::new();
        let chart_ids: Vec<String> = project.charts().iter().map(|c| c.id.clone()).collect();

        for doc in rounds {
            match doc.chart_id.clone() {
                Some(chart_id) if chart_ids.contains(&chart_id) => {
                    by_chart.entry(chart_id).or_default().push(doc.into_round());
                }
                _ => legacy.push(doc.into_round()),
            }
        }

        if let Some(charts) = project.charts.as_mut() {
            for chart in charts {
                let mut rounds = by_chart.remove(&chart.id).unwrap_or_default();
                rounds.sort_by_key(|r| r.round_number);
                chart.rounds = rounds;
            }
        }
        legacy.sort_by_key(|r| r.round_number);
        project.pattern = legacy;
        project
    }
}

impl Round {
    pub fn new(id: impl Into<String>, round_number: i64) -> Self {
        Self {
            id: id.into(),
            round_number,
            stitches: Vec::new(),
            stitch_groups: Vec::new(),
            pattern_items: Vec::new(),
            notes: None,
        }
    }

    /// Items in working order. Rounds written before pattern items existed
    /// yield their stitches, then their groups.
    pub fn ordered_items(&self) -> Vec<PatternItem> {
        if !self.pattern_items.is_empty() {
            let mut items = self.pattern_items.clone();
            items.sort_by(|a, b| a.order.cmp(&b.order).then(a.created_at.cmp(&b.created_at)));
            return items;
        }

        let epoch = Timestamp::default();
        self.stitches
            .iter()
            .cloned()
            .map(PatternItemKind::Stitch)
            .chain(self.stitch_groups.iter().cloned().map(PatternItemKind::Group))
            .enumerate()
            .map(|(i, item)| PatternItem {
                order: i as i64,
                created_at: epoch,
                item,
            })
            .collect()
    }

    /// Saturates at `u32::MAX`.
    pub fn total_stitches(&self) -> u32 {
        let group_total = |g: &StitchGroup| {
            g.stitches
                .iter()
                .fold(0u32, |acc, s| acc.saturating_add(s.count))
                .saturating_mul(g.repeat_count)
        };
        self.ordered_items()
            .iter()
            .map(|item| match &item.item {
                PatternItemKind::Stitch(s) => s.count,
                PatternItemKind::Group(g) => group_total(g),
            })
            .fold(0u32, u32::saturating_add)
    }
}

impl Chart {
    pub fn new(id: impl Into<String>, name: impl Into<String>, at: Timestamp) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            notes: None,
            rounds: Vec::new(),
            current_round: 0,
            current_stitch: 0,
            created_date: at,
            last_modified: at,
            is_completed: false,
        }
    }
}

/// A round as stored under its project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundDoc {
    #[serde(flatten)]
    pub round: Round,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_id: Option<String>,
}

impl RoundDoc {
    pub fn from_round(round: &Round, chart_id: Option<&str>) -> Self {
        Self {
            round: round.clone(),
            chart_id: chart_id.map(str::to_string),
        }
    }

    pub fn id(&self) -> &str {
        &self.round.id
    }

    pub fn into_round(self) -> Round {
        self.round
    }
}
