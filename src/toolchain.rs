use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::AppConfig;
use crate::errors::ChemsimError;
use crate::mdp::{step_parameter_path, PARAMETER_EXTENSION};
use crate::process::ProcessSpec;
use crate::protocol::{artifact_file_name, BASE_STRUCTURE_FILE};
use crate::store::write_atomic;
use crate::topology::read_molar_mass;
use crate::workspace::{normalize_output_name, normalize_step_name, path_is_file};

pub(crate) const PACKER_INPUT_FILE: &str = "packmol.inp";
pub(crate) const PACKED_STRUCTURE_FILE: &str = "system_init.pdb";
pub(crate) const TOPOLOGY_FILE: &str = "topol.top";
pub(crate) const INDEX_FILE: &str = "index.ndx";
const AVOGADRO: f64 = 6.022e23;
const CM3_TO_A3: f64 = 1e24;
const DEFAULT_PACKER_TOLERANCE: f64 = 2.0;

/// One molecule species to pack into the initial box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackerComponent {
    pub pdb: String,
    pub count: u32,
    /// g/mol; read from the structure file when absent.
    #[serde(default)]
    pub molar_mass: Option<f64>,
    pub density_kg_m3: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackerPlan {
    pub box_edge_angstrom: f64,
    pub box_edge_nm: f64,
    pub input_path: String,
    pub molar_masses: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AnalysisRequest {
    Energy {
        step: String,
        output: String,
        terms: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Rdf {
        step: String,
        output: String,
        reference: String,
        selection: String,
        #[serde(default)]
        center_of_mass: bool,
    },
    /// Makes molecules whole across periodic boundaries and centers a group.
    #[serde(rename_all = "camelCase")]
    Trjconv {
        step: String,
        output: String,
        center_group: String,
        output_group: String,
    },
    #[serde(rename_all = "camelCase")]
    TravisRdf {
        step: String,
        output: String,
        first: String,
        second: String,
        #[serde(default)]
        structure: Option<String>,
    },
}

impl AnalysisRequest {
    pub fn step(&self) -> &str {
        match self {
            AnalysisRequest::Energy { step, .. }
            | AnalysisRequest::Rdf { step, .. }
            | AnalysisRequest::Trjconv { step, .. }
            | AnalysisRequest::TravisRdf { step, .. } => step,
        }
    }
}

/// A file the tool writes under its own name, moved to the requested
/// output once the tool exits cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedOutput {
    pub produced: PathBuf,
    pub target: PathBuf,
}

impl CollectedOutput {
    pub fn collect(&self, program: &str) -> Result<(), ChemsimError> {
        if !path_is_file(&self.produced) {
            return Err(ChemsimError::ProcessFailure {
                program: program.to_string(),
                exit_code: Some(0),
                output: format!("expected output `{}` was not written", self.produced.display()),
            });
        }
        if path_is_file(&self.target) {
            fs::remove_file(&self.target).map_err(|error| ChemsimError::io_at("replace", &self.target, error))?;
        }
        fs::rename(&self.produced, &self.target)
            .map_err(|error| ChemsimError::io_at("move", &self.produced, error))
    }
}

fn require_groups(tool: &str, groups: [&str; 2]) -> Result<(), ChemsimError> {
    if groups.iter().any(|group| group.is_empty()) {
        return Err(ChemsimError::InvalidName(format!("{tool} needs two groups.")));
    }
    Ok(())
}

/// Cube edge in Angstrom holding every component at its pure-liquid density
/// (ideal mixing), widened by `margin_percent`. Components without a
/// positive density or a known molar mass contribute no volume.
pub fn box_edge_angstrom(components: &[PackerComponent], margin_percent: f64) -> f64 {
    let volume_a3: f64 = components
        .iter()
        .filter(|component| component.density_kg_m3 > 0.0)
        .map(|component| {
            let molar_mass = component.molar_mass.unwrap_or(0.0);
            let mass_g = molar_mass * f64::from(component.count) / AVOGADRO;
            let volume_cm3 = mass_g / (component.density_kg_m3 / 1000.0);
            volume_cm3 * CM3_TO_A3
        })
        .sum();

    let edge = volume_a3.cbrt() * (1.0 + margin_percent / 100.0);
    (edge * 100.0).round() / 100.0
}

pub fn render_packer_input(components: &[PackerComponent], box_edge: f64, tolerance: f64) -> String {
    let mut input = format!("tolerance {tolerance}\nfiletype pdb\noutput {PACKED_STRUCTURE_FILE}\n\n");
    for component in components {
        input.push_str(&format!(
            "structure {}\n  number {}\n  inside cube 0. 0. 0. {box_edge}\nend structure\n\n",
            component.pdb, component.count
        ));
    }
    input
}

/// Computes the box and writes the packer input next to the component files.
pub fn write_packer_input(
    storage_dir: &Path,
    components: &[PackerComponent],
    margin_percent: f64,
    tolerance: Option<f64>,
) -> Result<PackerPlan, ChemsimError> {
    if components.is_empty() {
        return Err(ChemsimError::InvalidName(
            "at least one component is required to build a box.".to_string(),
        ));
    }
    if let Some(missing) = components
        .iter()
        .find(|component| !path_is_file(&storage_dir.join(&component.pdb)))
    {
        return Err(ChemsimError::MissingInput(missing.pdb.clone()));
    }

    let mut resolved = components.to_vec();
    for component in &mut resolved {
        if component.molar_mass.is_none() {
            let mass = read_molar_mass(&storage_dir.join(&component.pdb))?;
            log::debug!("[toolchain] {} weighs {mass} g/mol", component.pdb);
            component.molar_mass = Some(mass);
        }
    }
    let components = resolved.as_slice();

    let box_edge = box_edge_angstrom(components, margin_percent);
    if !(box_edge.is_finite() && box_edge > 0.0) {
        return Err(ChemsimError::InvalidName(
            "components must have positive counts, molar masses and densities.".to_string(),
        ));
    }

    let path = storage_dir.join(PACKER_INPUT_FILE);
    let body = render_packer_input(
        components,
        box_edge,
        tolerance.unwrap_or(DEFAULT_PACKER_TOLERANCE),
    );
    write_atomic(&path, &body)?;

    Ok(PackerPlan {
        box_edge_angstrom: box_edge,
        box_edge_nm: box_edge / 10.0,
        input_path: path.display().to_string(),
        molar_masses: components
            .iter()
            .map(|component| component.molar_mass.unwrap_or(0.0))
            .collect(),
    })
}

fn format_box_edge(nm: f64) -> String {
    let formatted = format!("{nm:.3}");
    formatted
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

/// Argument shapes of the packer and the molecular-dynamics engine. Every
/// spec runs inside the system's storage directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    md_engine: String,
    packer: String,
    travis: String,
    grompp_maxwarn: u32,
}

impl Toolchain {
    pub fn from_config(config: &AppConfig) -> Self {
        Toolchain {
            md_engine: config.md_engine_binary.clone(),
            packer: config.packer_binary.clone(),
            travis: config.travis_binary.clone(),
            grompp_maxwarn: config.grompp_maxwarn,
        }
    }

    pub fn pack(&self, storage_dir: &Path) -> ProcessSpec {
        let input = storage_dir.join(PACKER_INPUT_FILE);
        ProcessSpec::new(&self.packer, storage_dir)
            .stdin_file(&input)
            .requires(input)
    }

    pub fn build_structure(&self, storage_dir: &Path, box_edge_nm: f64) -> Result<ProcessSpec, ChemsimError> {
        if !(box_edge_nm.is_finite() && box_edge_nm > 0.0) {
            return Err(ChemsimError::InvalidName(format!(
                "box edge must be a positive number of nanometres (got {box_edge_nm})."
            )));
        }
        let edge = format_box_edge(box_edge_nm);
        Ok(ProcessSpec::new(&self.md_engine, storage_dir)
            .args(["editconf", "-f", PACKED_STRUCTURE_FILE, "-o", BASE_STRUCTURE_FILE, "-box"])
            .args([edge.as_str(), edge.as_str(), edge.as_str()])
            .requires(storage_dir.join(PACKED_STRUCTURE_FILE)))
    }

    pub fn compile(&self, storage_dir: &Path, step: &str, input: &Path) -> ProcessSpec {
        let parameters = artifact_file_name(step, PARAMETER_EXTENSION);
        let input_name = input
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| input.display().to_string());
        ProcessSpec::new(&self.md_engine, storage_dir)
            .args(["grompp", "-f", parameters.as_str(), "-c", input_name.as_str()])
            .args(["-p", TOPOLOGY_FILE, "-o"])
            .args([artifact_file_name(step, "tpr"), "-maxwarn".to_string(), self.grompp_maxwarn.to_string()])
            .requires(step_parameter_path(storage_dir, step))
            .requires(storage_dir.join(TOPOLOGY_FILE))
            .requires(input)
    }

    pub fn run(&self, storage_dir: &Path, step: &str) -> ProcessSpec {
        ProcessSpec::new(&self.md_engine, storage_dir)
            .args(["mdrun", "-deffnm", step])
            .requires(storage_dir.join(artifact_file_name(step, "tpr")))
    }

    /// Writes the interactive selection script the tool reads from stdin and
    /// returns the `ProcessSpec` that feeds it.
    pub fn analysis(
        &self,
        storage_dir: &Path,
        request: &AnalysisRequest,
    ) -> Result<ProcessSpec, ChemsimError> {
        match request {
            AnalysisRequest::Energy { step, output, terms } => {
                let step = normalize_step_name(step)?;
                let output = normalize_output_name(output)?;
                let terms: Vec<&str> = terms
                    .iter()
                    .map(|term| term.trim())
                    .filter(|term| !term.is_empty())
                    .collect();
                if terms.is_empty() {
                    return Err(ChemsimError::InvalidName(
                        "select at least one energy term.".to_string(),
                    ));
                }

                let energy_file = storage_dir.join(artifact_file_name(&step, "edr"));
                let script = write_selection_script(storage_dir, &output, &format!("{}\n0\n", terms.join("\n")))?;
                Ok(ProcessSpec::new(&self.md_engine, storage_dir)
                    .args(["energy", "-f"])
                    .args([artifact_file_name(&step, "edr"), "-o".to_string(), artifact_file_name(&output, "xvg")])
                    .stdin_file(&script)
                    .requires(energy_file))
            }
            AnalysisRequest::Rdf {
                step,
                output,
                reference,
                selection,
                center_of_mass,
            } => {
                let step = normalize_step_name(step)?;
                let output = normalize_output_name(output)?;
                let (reference, selection) = (reference.trim(), selection.trim());
                if reference.is_empty() || selection.is_empty() {
                    return Err(ChemsimError::InvalidName(
                        "rdf needs both a reference and a selection group.".to_string(),
                    ));
                }

                let topology = storage_dir.join(artifact_file_name(&step, "tpr"));
                let trajectory = storage_dir.join(artifact_file_name(&step, "xtc"));
                let script = write_selection_script(storage_dir, &output, &format!("{reference}\n{selection}\n"))?;
                let mut spec = ProcessSpec::new(&self.md_engine, storage_dir)
                    .args(["rdf", "-s"])
                    .args([
                        artifact_file_name(&step, "tpr"),
                        "-f".to_string(),
                        artifact_file_name(&step, "xtc"),
                        "-o".to_string(),
                        artifact_file_name(&output, "xvg"),
                    ]);
                if path_is_file(&storage_dir.join(INDEX_FILE)) {
                    spec = spec.args(["-n", INDEX_FILE]);
                }
                if *center_of_mass {
                    spec = spec.args(["-selrpos", "mol_com", "-seltype", "mol_com"]);
                }
                Ok(spec.stdin_file(&script).requires(topology).requires(trajectory))
            }
            AnalysisRequest::Trjconv {
                step,
                output,
                center_group,
                output_group,
            } => {
                let step = normalize_step_name(step)?;
                let output = normalize_output_name(output)?;
                let (center_group, output_group) = (center_group.trim(), output_group.trim());
                require_groups("trjconv", [center_group, output_group])?;

                let script =
                    write_selection_script(storage_dir, &output, &format!("{center_group}\n{output_group}\n"))?;
                Ok(ProcessSpec::new(&self.md_engine, storage_dir)
                    .args(["trjconv", "-s"])
                    .args([
                        artifact_file_name(&step, "tpr"),
                        "-f".to_string(),
                        artifact_file_name(&step, "xtc"),
                        "-o".to_string(),
                        artifact_file_name(&output, "xtc"),
                    ])
                    .args(["-pbc", "mol", "-center"])
                    .stdin_file(&script)
                    .requires(storage_dir.join(artifact_file_name(&step, "tpr")))
                    .requires(storage_dir.join(artifact_file_name(&step, "xtc"))))
            }
            AnalysisRequest::TravisRdf {
                step,
                output,
                first,
                second,
                structure,
            } => {
                let step = normalize_step_name(step)?;
                let output = normalize_output_name(output)?;
                let (first, second) = (first.trim(), second.trim());
                require_groups("travis rdf", [first, second])?;
                if first.contains(char::is_whitespace) || second.contains(char::is_whitespace) {
                    return Err(ChemsimError::InvalidName(
                        "travis molecule names cannot contain spaces.".to_string(),
                    ));
                }
                let structure = structure
                    .as_deref()
                    .map(str::trim)
                    .filter(|structure| !structure.is_empty())
                    .unwrap_or(PACKED_STRUCTURE_FILE);

                let script = write_selection_script(
                    storage_dir,
                    &output,
                    &format!("rdf molecule {first} molecule {second}\n"),
                )?;
                Ok(ProcessSpec::new(&self.travis, storage_dir)
                    .args(["-p", structure, "-i"])
                    .args([artifact_file_name(&step, "xtc")])
                    .stdin_file(&script)
                    .requires(storage_dir.join(structure))
                    .requires(storage_dir.join(artifact_file_name(&step, "xtc"))))
            }
        }
    }

    /// Output the tool names on its own that has to be moved into place
    /// after a clean exit.
    pub fn collected_output(&self, storage_dir: &Path, request: &AnalysisRequest) -> Option<CollectedOutput> {
        match request {
            AnalysisRequest::TravisRdf {
                output,
                first,
                second,
                ..
            } => Some(CollectedOutput {
                produced: storage_dir.join(format!(
                    "rdf_molecule_{}_molecule_{}.csv",
                    first.trim(),
                    second.trim()
                )),
                target: storage_dir.join(artifact_file_name(output.trim(), "csv")),
            }),
            _ => None,
        }
    }
}

fn write_selection_script(storage_dir: &Path, output: &str, body: &str) -> Result<PathBuf, ChemsimError> {
    let path = storage_dir.join(format!("{output}_selection.txt"));
    write_atomic(&path, body)?;
    Ok(path)
}
