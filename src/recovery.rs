use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;
use walkdir::WalkDir;

use crate::errors::ChemsimError;
use crate::protocol::{NodeId, ProtocolTree, StepKind, StepStatus};

pub(crate) const ARTIFACT_EXTENSIONS: [&str; 8] =
    ["mdp", "tpr", "gro", "xtc", "trr", "cpt", "log", "edr"];
pub(crate) const SUPERSEDED_MARKER: &str = "_prev";
pub(crate) const DEFAULT_TEMPERATURE_TAG: u32 = 300;
const MINIMIZATION_NAME: &str = "minim";

fn staged_step_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(gen|equil|prod)(?:_?(\d+))?(?:_(?:b|batch|r|rep)(\d+))?$")
            .unwrap_or_else(|error| panic!("invalid step name pattern: {error}"))
    })
}

/// A step name recognized from a storage listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepCandidate {
    pub name: String,
    pub kind: StepKind,
    pub temperature: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DroppedCandidate {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct Reconstruction {
    pub tree: ProtocolTree,
    pub dropped: Vec<DroppedCandidate>,
}

/// Strips one known artifact extension; other files yield nothing.
pub(crate) fn candidate_base_name(file_name: &str) -> Option<&str> {
    let (base, extension) = file_name.rsplit_once('.')?;
    if base.is_empty() {
        return None;
    }
    let extension = extension.to_lowercase();
    ARTIFACT_EXTENSIONS
        .contains(&extension.as_str())
        .then_some(base)
}

pub(crate) fn classify_step_name(name: &str) -> Option<StepCandidate> {
    if name.contains(SUPERSEDED_MARKER) {
        return None;
    }

    if name == MINIMIZATION_NAME {
        return Some(StepCandidate {
            name: name.to_string(),
            kind: StepKind::Minimization,
            temperature: None,
        });
    }

    let captures = staged_step_pattern().captures(name)?;
    let kind = match captures.get(1).map(|value| value.as_str()) {
        Some("gen") => StepKind::Generation,
        Some("equil") => StepKind::Equilibration,
        Some("prod") => StepKind::Production,
        _ => return None,
    };
    if captures.get(3).is_some() && kind != StepKind::Production {
        return None;
    }

    Some(StepCandidate {
        name: name.to_string(),
        kind,
        temperature: temperature_tag(captures.get(2).map(|value| value.as_str())),
    })
}

/// 3-4 digit suffixes are temperatures; bare names and 1-2 digit stage
/// indices get the default tag; anything else is ambiguous.
fn temperature_tag(suffix: Option<&str>) -> Option<u32> {
    match suffix {
        None => Some(DEFAULT_TEMPERATURE_TAG),
        Some(digits) if digits.len() <= 2 => Some(DEFAULT_TEMPERATURE_TAG),
        Some(digits) if digits.len() <= 4 => digits.parse().ok(),
        Some(_) => None,
    }
}

/// Recognized step candidates in listing order, one per base name.
pub(crate) fn extract_candidates<'a>(
    file_names: impl IntoIterator<Item = &'a str>,
) -> Vec<StepCandidate> {
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();

    for file_name in file_names {
        let Some(base) = candidate_base_name(file_name) else {
            continue;
        };
        if !seen.insert(base.to_string()) {
            continue;
        }
        if let Some(candidate) = classify_step_name(base) {
            candidates.push(candidate);
        }
    }

    candidates
}

pub fn reconstruct_from_names<'a>(file_names: impl IntoIterator<Item = &'a str>) -> Reconstruction {
    let candidates = extract_candidates(file_names);
    let mut tree = ProtocolTree::new();
    let mut dropped = Vec::new();

    let mut minimizations = Vec::new();
    let mut generations = Vec::new();
    let mut equilibrations = Vec::new();
    let mut productions = Vec::new();
    for candidate in candidates {
        match candidate.kind {
            StepKind::Minimization => minimizations.push(candidate),
            StepKind::Generation => generations.push(candidate),
            StepKind::Equilibration => equilibrations.push(candidate),
            StepKind::Production => productions.push(candidate),
        }
    }
    generations.sort_by(|a, b| a.name.cmp(&b.name));
    equilibrations.sort_by(|a, b| a.name.cmp(&b.name));
    productions.sort_by(|a, b| a.name.cmp(&b.name));

    let root = minimizations
        .first()
        .and_then(|candidate| attach(&mut tree, None, candidate, &mut dropped));

    let mut attached_generations: Vec<(NodeId, Option<u32>)> = Vec::new();
    for candidate in &generations {
        let Some(root) = root else {
            dropped.push(drop_reason(candidate, "no minimization step to attach to"));
            continue;
        };
        if let Some(id) = attach(&mut tree, Some(root), candidate, &mut dropped) {
            attached_generations.push((id, candidate.temperature));
        }
    }

    let attached_equilibrations =
        attach_by_temperature(&mut tree, &equilibrations, &attached_generations, &mut dropped);
    attach_by_temperature(&mut tree, &productions, &attached_equilibrations, &mut dropped);

    for candidate in minimizations.iter().skip(1) {
        dropped.push(drop_reason(candidate, "only one minimization root is kept"));
    }

    for entry in &dropped {
        log::warn!(
            "[recovery] dropped step candidate {}: {}",
            entry.name,
            entry.reason
        );
    }

    Reconstruction { tree, dropped }
}

fn attach_by_temperature(
    tree: &mut ProtocolTree,
    candidates: &[StepCandidate],
    parents: &[(NodeId, Option<u32>)],
    dropped: &mut Vec<DroppedCandidate>,
) -> Vec<(NodeId, Option<u32>)> {
    let mut attached = Vec::new();

    for candidate in candidates {
        let Some(temperature) = candidate.temperature else {
            dropped.push(drop_reason(candidate, "no temperature tag"));
            continue;
        };
        let parent = parents
            .iter()
            .find(|(_, tag)| *tag == Some(temperature))
            .map(|(id, _)| *id);
        let Some(parent) = parent else {
            dropped.push(drop_reason(
                candidate,
                &format!("no parent step tagged {temperature}"),
            ));
            continue;
        };
        if let Some(id) = attach(tree, Some(parent), candidate, dropped) {
            attached.push((id, candidate.temperature));
        }
    }

    attached
}

fn attach(
    tree: &mut ProtocolTree,
    parent: Option<NodeId>,
    candidate: &StepCandidate,
    dropped: &mut Vec<DroppedCandidate>,
) -> Option<NodeId> {
    let result = tree.add_child(parent, &candidate.name, candidate.kind).and_then(|id| {
        tree.set_status(id, StepStatus::Running)?;
        tree.set_status(id, StepStatus::Completed)?;
        Ok(id)
    });

    match result {
        Ok(id) => Some(id),
        Err(error) => {
            dropped.push(drop_reason(candidate, &error.to_string()));
            None
        }
    }
}

fn drop_reason(candidate: &StepCandidate, reason: &str) -> DroppedCandidate {
    DroppedCandidate {
        name: candidate.name.clone(),
        reason: reason.to_string(),
    }
}

/// File names directly inside `storage_dir`, sorted.
pub(crate) fn list_storage_files(storage_dir: &Path) -> Result<Vec<String>, ChemsimError> {
    let mut names = Vec::new();
    for entry in WalkDir::new(storage_dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|error| {
            ChemsimError::Io(format!(
                "Failed to list {}: {error}",
                storage_dir.display()
            ))
        })?;
        if entry.file_type().is_file() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    Ok(names)
}

pub fn reconstruct_from_directory(storage_dir: &Path) -> Result<Reconstruction, ChemsimError> {
    let names = list_storage_files(storage_dir)?;
    Ok(reconstruct_from_names(names.iter().map(String::as_str)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::StepRecord;
    use tempfile::TempDir;

    fn names(records: &[StepRecord]) -> Vec<&str> {
        records.iter().map(|record| record.name.as_str()).collect()
    }

    #[test]
    fn rebuilds_single_chain_and_skips_superseded_files() {
        let files = [
            "minim.gro", "minim.tpr", "minim.log", "minim.edr", "minim_prev.gro",
            "gen1.mdp", "gen1.gro", "gen1.cpt", "equil1.tpr", "equil1.xtc",
            "prod1.gro", "prod1.edr", "topol.top", "packmol.inp",
        ];
        let result = reconstruct_from_names(files);
        let records = result.tree.to_records();

        assert_eq!(names(&records), vec!["minim"]);
        let gen = &records[0].children;
        assert_eq!(names(gen), vec!["gen1"]);
        let equil = &gen[0].children;
        assert_eq!(names(equil), vec!["equil1"]);
        let prod = &equil[0].children;
        assert_eq!(names(prod), vec!["prod1"]);
        assert!(prod[0].children.is_empty());
        assert_eq!(result.tree.len(), 4);
        assert!(result.tree.find("minim_prev").is_none());
        assert!(result.dropped.is_empty());
    }

    #[test]
    fn marks_every_rebuilt_step_completed() {
        let result = reconstruct_from_names(["minim.gro", "gen.gro", "equil.gro", "prod.gro"]);
        let mut stack = result.tree.to_records();
        assert_eq!(result.tree.len(), 4);
        while let Some(record) = stack.pop() {
            assert_eq!(record.status, StepStatus::Completed);
            stack.extend(record.children);
        }
    }

    #[test]
    fn drops_equilibration_without_matching_generation() {
        let result = reconstruct_from_names([
            "minim.gro",
            "gen_310.gro",
            "equil_320.gro",
            "prod_320.gro",
        ]);

        assert!(result.tree.find("gen_310").is_some());
        assert!(result.tree.find("equil_320").is_none());
        assert!(result.tree.find("prod_320").is_none());
        let dropped = result
            .dropped
            .iter()
            .map(|entry| entry.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(dropped, vec!["equil_320", "prod_320"]);
    }

    #[test]
    fn branches_by_temperature_tag() {
        let result = reconstruct_from_names([
            "minim.tpr",
            "gen_300.gro",
            "gen_350.gro",
            "equil_350.gro",
            "equil_300.gro",
            "prod_350_b1.xtc",
            "prod_350_b2.xtc",
        ]);
        let records = result.tree.to_records();
        let gens = &records[0].children;

        assert_eq!(names(gens), vec!["gen_300", "gen_350"]);
        assert_eq!(names(&gens[0].children), vec!["equil_300"]);
        assert_eq!(names(&gens[1].children), vec!["equil_350"]);
        assert_eq!(
            names(&gens[1].children[0].children),
            vec!["prod_350_b1", "prod_350_b2"]
        );
    }

    #[test]
    fn classifies_names_against_step_grammar() {
        assert_eq!(classify_step_name("gen").unwrap().temperature, Some(300));
        assert_eq!(classify_step_name("equil2").unwrap().temperature, Some(300));
        assert_eq!(classify_step_name("prod_1000").unwrap().temperature, Some(1000));
        assert_eq!(classify_step_name("prod_12345").unwrap().temperature, None);
        assert!(classify_step_name("equil_300_b2").is_none());
        assert!(classify_step_name("gen_prev").is_none());
        assert!(classify_step_name("nvt").is_none());
        assert!(classify_step_name("minim2").is_none());
    }

    #[test]
    fn keeps_first_occurrence_of_each_base_name() {
        let candidates = extract_candidates(["gen1.gro", "gen1.xtc", "notes.txt", ".gro"]);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name, "gen1");
    }

    #[test]
    fn drops_ambiguous_and_orphan_candidates() {
        let result = reconstruct_from_names(["gen_300.gro", "equil_12345.gro"]);
        assert!(result.tree.is_empty());
        assert_eq!(result.dropped.len(), 2);
    }

    #[test]
    fn scans_storage_directory_listing() {
        let dir = TempDir::new().unwrap();
        for file in ["minim.gro", "gen.gro", "system.gro", "topol.top"] {
            std::fs::write(dir.path().join(file), "").unwrap();
        }
        std::fs::create_dir(dir.path().join("equil.gro")).unwrap();

        let result = reconstruct_from_directory(dir.path()).unwrap();
        assert_eq!(result.tree.len(), 2);
        assert!(result.tree.find("equil").is_none());
    }
}
