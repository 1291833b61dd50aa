#![allow(dead_code)]

use sync_engine::model::from_millis;
use sync_engine::{Chart, Project, Round, RoundDoc, Stitch, StitchGroup};

pub fn generate_round(project: usize, idx: usize) -> Round {
    let kinds = ["sc", "hdc", "dc", "inc", "dec"];
    let colors = ["cream", "rust", "sage", "navy"];

    let mut round = Round::new(format!("p{}-r{}", project, idx), idx as i64 + 1);
    for s in 0..6 {
        round.stitches.push(Stitch {
            id: format!("p{}-r{}-s{}", project, idx, s),
            kind: kinds[(idx + s) % 5].into(),
            count: 1 + (s as u32 % 3),
            color: Some(colors[idx % 4].into()),
        });
    }
    round.stitch_groups.push(StitchGroup {
        id: format!("p{}-r{}-g", project, idx),
        stitches: round.stitches[..2].to_vec(),
        repeat_count: 3,
    });
    round
}

/// A project with `charts` charts of `rounds` rounds each.
pub fn create_project(idx: usize, charts: usize, rounds: usize) -> Project {
    let mut project = Project::new(format!("p{}", idx), format!("Project {}", idx));
    project.last_modified = from_millis(1_704_067_200_000 + idx as i64);

    let mut all = Vec::with_capacity(charts);
    for c in 0..charts {
        let mut chart = Chart::new(format!("p{}-c{}", idx, c), format!("Chart {}", c), project.created_date);
        chart.rounds = (0..rounds).map(|r| generate_round(idx, c * rounds + r)).collect();
        all.push(chart);
    }
    project.current_chart_id = all.first().map(|c| c.id.clone());
    project.charts = Some(all);
    project
}

pub fn create_legacy_project(idx: usize, rounds: usize) -> Project {
    let mut project = Project::new(format!("legacy{}", idx), format!("Legacy {}", idx));
    project.charts = None;
    project.pattern = (0..rounds).map(|r| generate_round(idx, r)).collect();
    project.current_round = (rounds / 2) as u32;
    project
}

pub fn round_docs(project: &Project) -> Vec<RoundDoc> {
    project.round_documents()
}

/// Same ids, every round carries an extra note.
pub fn touched_rounds(project: &Project) -> Vec<RoundDoc> {
    project
        .round_documents()
        .into_iter()
        .map(|mut doc| {
            doc.round.notes = Some("edited".into());
            doc
        })
        .collect()
}
