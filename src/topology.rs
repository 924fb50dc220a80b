use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::errors::ChemsimError;
use crate::store::write_atomic;
use crate::toolchain::TOPOLOGY_FILE;
use crate::workspace::path_is_file;

pub(crate) const MERGED_ATOMTYPES_FILE: &str = "merged_atomtypes.itp";
const CLEAN_PREFIX: &str = "clean_";
const DEFAULT_FORCEFIELD: &str = "oplsaa.ff";
const DEFAULT_SYSTEM_TITLE: &str = "chemsim system";

/// g/mol, keyed by upper-case element symbol.
const ATOMIC_MASSES: [(&str, f64); 24] = [
    ("H", 1.008),
    ("HE", 4.0026),
    ("LI", 6.94),
    ("BE", 9.0122),
    ("B", 10.81),
    ("C", 12.011),
    ("N", 14.007),
    ("O", 15.999),
    ("F", 18.998),
    ("NE", 20.180),
    ("NA", 22.990),
    ("MG", 24.305),
    ("AL", 26.982),
    ("SI", 28.085),
    ("P", 30.974),
    ("S", 32.06),
    ("CL", 35.45),
    ("K", 39.098),
    ("AR", 39.948),
    ("CA", 40.078),
    ("FE", 55.845),
    ("ZN", 65.38),
    ("BR", 79.904),
    ("I", 126.90),
];

fn atomic_mass(element: &str) -> Option<f64> {
    ATOMIC_MASSES
        .iter()
        .find(|(symbol, _)| *symbol == element)
        .map(|(_, mass)| *mass)
}

fn default_forcefield() -> String {
    DEFAULT_FORCEFIELD.to_string()
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyMolecule {
    pub name: String,
    pub count: u32,
    #[serde(default)]
    pub itp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyRequest {
    #[serde(default = "default_forcefield")]
    pub forcefield: String,
    #[serde(default)]
    pub global_includes: Vec<String>,
    pub molecules: Vec<TopologyMolecule>,
    #[serde(default = "enabled")]
    pub sanitize: bool,
    #[serde(default)]
    pub include_water: bool,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MoleculeCount {
    pub name: String,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyReport {
    pub path: String,
    pub global_includes: Vec<String>,
    pub molecule_includes: Vec<String>,
    pub molecules: Vec<MoleculeCount>,
    pub sanitized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

fn strip_comment(line: &str) -> &str {
    line.split(';').next().unwrap_or_default().trim()
}

fn section_name(line: &str) -> Option<&str> {
    let line = line.trim();
    line.strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .map(str::trim)
}

/// First entry of the `[ moleculetype ]` section, which is the name the
/// `[ molecules ]` table has to use.
pub fn moleculetype_name(itp: &str) -> Option<String> {
    let mut in_moleculetype = false;
    for line in itp.lines() {
        let clean = strip_comment(line);
        if clean.is_empty() {
            continue;
        }
        if let Some(section) = section_name(clean) {
            in_moleculetype = section == "moleculetype";
            continue;
        }
        if in_moleculetype {
            return clean.split_whitespace().next().map(str::to_string);
        }
    }
    None
}

pub fn read_moleculetype_name(path: &Path) -> Result<Option<String>, ChemsimError> {
    let text = fs::read_to_string(path).map_err(|error| ChemsimError::io_at("read", path, error))?;
    Ok(moleculetype_name(&text))
}

/// Sum of atomic masses over ATOM/HETATM records. The element column wins;
/// otherwise the atom name decides, preferring a known two-letter symbol.
/// Unknown elements weigh nothing.
pub fn molar_mass_from_pdb(pdb: &str) -> f64 {
    let total: f64 = pdb
        .lines()
        .filter(|line| line.starts_with("ATOM") || line.starts_with("HETATM"))
        .filter_map(|line| {
            let element = line
                .get(76..78)
                .map(|column| column.trim().to_uppercase())
                .filter(|column| !column.is_empty())
                .or_else(|| element_from_atom_name(line))?;
            atomic_mass(&element)
        })
        .sum();
    (total * 1000.0).round() / 1000.0
}

fn element_from_atom_name(line: &str) -> Option<String> {
    let atom_name = line.get(12..16.min(line.len()))?.trim().to_uppercase();
    let mut chars = atom_name.chars();
    let first = chars.next()?;
    if let Some(second) = chars.next().filter(|second| second.is_ascii_alphabetic()) {
        let pair: String = [first, second].iter().collect();
        if atomic_mass(&pair).is_some() {
            return Some(pair);
        }
    }
    Some(first.to_string())
}

pub fn read_molar_mass(path: &Path) -> Result<f64, ChemsimError> {
    let text = fs::read_to_string(path).map_err(|error| ChemsimError::io_at("read", path, error))?;
    Ok(molar_mass_from_pdb(&text))
}

fn atomtype_prefix(file_name: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| file_name.to_string());
    let clean: String = stem
        .chars()
        .filter(|character| *character != '.' && *character != ' ')
        .collect();
    format!("{}_", clean.to_uppercase())
}

/// Rewrites one fragment: its `[ atomtypes ]` move out (renamed with the
/// file prefix) and the type column of `[ atoms ]` follows the rename.
/// Atom names stay untouched so they keep matching the structure file.
fn sanitize_fragment(file_name: &str, text: &str) -> (String, Vec<String>) {
    let prefix = atomtype_prefix(file_name);
    let mut renamed = BTreeMap::new();
    let mut atomtypes = Vec::new();

    let mut section: Option<String> = None;
    for line in text.lines() {
        if let Some(name) = section_name(line) {
            section = Some(name.to_string());
            continue;
        }
        let data = strip_comment(line);
        if section.as_deref() != Some("atomtypes") || data.is_empty() {
            continue;
        }
        let mut parts: Vec<String> = data.split_whitespace().map(str::to_string).collect();
        let new_type = format!("{prefix}{}", parts[0]);
        renamed.insert(parts[0].clone(), new_type.clone());
        parts[0] = new_type;
        atomtypes.push(format!("{} ; from {file_name}", parts.join(" ")));
    }

    let mut body = format!("; atom types prefixed with {prefix}\n");
    section = None;
    for line in text.lines() {
        if let Some(name) = section_name(line) {
            section = Some(name.to_string());
            if name == "atomtypes" {
                body.push_str(&format!("; [ atomtypes ] moved to {MERGED_ATOMTYPES_FILE}\n"));
            } else {
                body.push_str(line);
                body.push('\n');
            }
            continue;
        }
        match section.as_deref() {
            Some("atomtypes") => {}
            Some("atoms") if !line.trim().is_empty() && !line.trim_start().starts_with(';') => {
                let mut parts: Vec<&str> = line.split_whitespace().collect();
                if parts.len() >= 5 {
                    if let Some(new_type) = renamed.get(parts[1]) {
                        parts[1] = new_type;
                    }
                    body.push_str(&parts.join("\t"));
                } else {
                    body.push_str(line);
                }
                body.push('\n');
            }
            _ => {
                body.push_str(line);
                body.push('\n');
            }
        }
    }
    (body, atomtypes)
}

/// Writes `clean_<name>` for every fragment plus the merged atom type table.
/// Returns the clean file name for each input name.
pub fn sanitize_itps(
    storage_dir: &Path,
    itp_files: &[String],
) -> Result<BTreeMap<String, String>, ChemsimError> {
    let mut mapping = BTreeMap::new();
    let mut merged = vec![
        "[ atomtypes ]".to_string(),
        "; name  at.num  mass  charge  ptype  sigma  epsilon".to_string(),
    ];

    for file_name in itp_files {
        if mapping.contains_key(file_name) {
            continue;
        }
        let source = storage_dir.join(file_name);
        let text = fs::read_to_string(&source).map_err(|error| ChemsimError::io_at("read", &source, error))?;
        let (body, atomtypes) = sanitize_fragment(file_name, &text);
        let clean_name = format!("{CLEAN_PREFIX}{file_name}");
        write_atomic(&storage_dir.join(&clean_name), &body)?;
        merged.extend(atomtypes);
        mapping.insert(file_name.clone(), clean_name);
    }

    merged.push(String::new());
    write_atomic(&storage_dir.join(MERGED_ATOMTYPES_FILE), &merged.join("\n"))?;
    Ok(mapping)
}

fn include_line(file: &str) -> String {
    let name = Path::new(file)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| file.to_string());
    format!("#include \"{name}\"\n")
}

pub fn render_topology(
    forcefield: &str,
    global_includes: &[String],
    molecule_includes: &[String],
    molecules: &[MoleculeCount],
    include_water: bool,
    title: &str,
) -> String {
    let mut top = String::from("; generated by chemsim\n\n");
    if forcefield.ends_with(".itp") {
        top.push_str(&format!("#include \"{forcefield}\"\n\n"));
    } else {
        top.push_str(&format!("#include \"{forcefield}/forcefield.itp\"\n\n"));
    }

    if !global_includes.is_empty() {
        top.push_str("; Global parameters\n");
        global_includes.iter().for_each(|file| top.push_str(&include_line(file)));
        top.push('\n');
    }
    if !molecule_includes.is_empty() {
        top.push_str("; Molecule topologies\n");
        molecule_includes.iter().for_each(|file| top.push_str(&include_line(file)));
        top.push('\n');
    }
    if include_water {
        let forcefield_dir = forcefield.trim_end_matches("/forcefield.itp");
        top.push_str(&format!(
            "; Water and ions\n#include \"{forcefield_dir}/spce.itp\"\n#include \"{forcefield_dir}/ions.itp\"\n\n"
        ));
    }

    top.push_str(&format!("[ system ]\n; Name\n{title}\n\n"));
    top.push_str("[ molecules ]\n; Compound    #mols\n");
    for molecule in molecules {
        top.push_str(&format!("{:<15} {}\n", molecule.name, molecule.count));
    }
    top
}

/// Writes `topol.top` for the storage directory. Fragments are sanitized
/// first when asked; a failed sanitization falls back to the originals and
/// is reported as a warning. Molecule names come from each fragment's
/// `[ moleculetype ]` when it declares one.
pub fn write_topology(storage_dir: &Path, request: &TopologyRequest) -> Result<TopologyReport, ChemsimError> {
    if request.molecules.is_empty() {
        return Err(ChemsimError::InvalidName(
            "a topology needs at least one molecule.".to_string(),
        ));
    }
    if let Some(molecule) = request.molecules.iter().find(|molecule| molecule.name.trim().is_empty()) {
        return Err(ChemsimError::InvalidName(format!(
            "molecule with {} copies needs a name.",
            molecule.count
        )));
    }

    let raw_itps: Vec<String> = request
        .molecules
        .iter()
        .filter_map(|molecule| molecule.itp.as_deref())
        .map(|itp| itp.trim().to_string())
        .filter(|itp| !itp.is_empty())
        .collect();
    if let Some(missing) = raw_itps.iter().find(|itp| !path_is_file(&storage_dir.join(itp))) {
        return Err(ChemsimError::MissingInput(missing.clone()));
    }

    let mut global_includes = request.global_includes.clone();
    let mut mapping: BTreeMap<String, String> =
        raw_itps.iter().map(|itp| (itp.clone(), itp.clone())).collect();
    let mut sanitized = false;
    let mut warning = None;
    if request.sanitize && !raw_itps.is_empty() {
        match sanitize_itps(storage_dir, &raw_itps) {
            Ok(clean) => {
                mapping = clean;
                sanitized = true;
                if !global_includes.iter().any(|file| file == MERGED_ATOMTYPES_FILE) {
                    global_includes.insert(0, MERGED_ATOMTYPES_FILE.to_string());
                }
            }
            Err(error) => {
                log::warn!("[topology] sanitization failed, using original fragments: {error}");
                warning = Some(format!("Sanitization failed, original fragments used: {error}"));
            }
        }
    }

    let mut molecules = Vec::with_capacity(request.molecules.len());
    for molecule in &request.molecules {
        let mut name = molecule.name.trim().to_string();
        if let Some(file) = molecule
            .itp
            .as_deref()
            .map(str::trim)
            .and_then(|itp| mapping.get(itp))
        {
            if let Some(declared) = read_moleculetype_name(&storage_dir.join(file))? {
                name = declared;
            }
        }
        molecules.push(MoleculeCount {
            name,
            count: molecule.count,
        });
    }

    let molecule_includes: Vec<String> = mapping
        .values()
        .cloned()
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();
    let title = request
        .title
        .as_deref()
        .map(str::trim)
        .filter(|title| !title.is_empty())
        .unwrap_or(DEFAULT_SYSTEM_TITLE);
    let body = render_topology(
        request.forcefield.trim(),
        &global_includes,
        &molecule_includes,
        &molecules,
        request.include_water,
        title,
    );
    let path = storage_dir.join(TOPOLOGY_FILE);
    write_atomic(&path, &body)?;
    log::info!("[topology] wrote {} ({} molecule types)", path.display(), molecules.len());

    Ok(TopologyReport {
        path: path.display().to_string(),
        global_includes,
        molecule_includes,
        molecules,
        sanitized,
        warning,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CO2_ITP: &str = "\
[ atomtypes ]
; name  at.num  mass  charge  ptype  sigma  epsilon
C_co2   6  12.011  0.70  A  0.280  0.224 ; carbon
O_co2   8  15.999 -0.35  A  0.305  0.657

[ moleculetype ]
; name  nrexcl
CO2N    1

[ atoms ]
;  nr  type  resnr  res  atom  cgnr  charge  mass
   1   C_co2   1   CO2   C    1   0.70  12.011
   2   O_co2   1   CO2   O1   1  -0.35  15.999
   3   O_co2   1   CO2   O2   1  -0.35  15.999

[ bonds ]
1 2
";

    fn pdb_line(atom_name: &str, element: &str) -> String {
        format!(
            "HETATM    1 {atom_name:<4} CO2 A   1       0.000   0.000   0.000  1.00  0.00          {element:>2}"
        )
    }

    #[test]
    fn reads_moleculetype_name_after_comments() {
        assert_eq!(moleculetype_name(CO2_ITP).as_deref(), Some("CO2N"));
        assert_eq!(moleculetype_name("[ atoms ]\n1 C 1 X C\n"), None);
    }

    #[test]
    fn sums_masses_from_element_column_or_atom_name() {
        let co2 = [pdb_line("C", "C"), pdb_line("O1", "O"), pdb_line("O2", "O")].join("\n");
        assert!((molar_mass_from_pdb(&co2) - 44.009).abs() < 1e-9);

        let without_elements = "ATOM      1 CL   CLM A   1\nATOM      2 C1   CLM A   1\nREMARK ignored\n";
        assert!((molar_mass_from_pdb(without_elements) - 47.461).abs() < 1e-9);
        assert_eq!(molar_mass_from_pdb("ATOM      1 XX   UNK A   1\n"), 0.0);
    }

    #[test]
    fn sanitizing_prefixes_atom_types_and_keeps_atom_names() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("co2.trappe.itp"), CO2_ITP).unwrap();

        let mapping = sanitize_itps(dir.path(), &["co2.trappe.itp".to_string()]).unwrap();
        assert_eq!(mapping["co2.trappe.itp"], "clean_co2.trappe.itp");

        let clean = fs::read_to_string(dir.path().join("clean_co2.trappe.itp")).unwrap();
        assert!(!clean.contains("[ atomtypes ]\n"));
        assert!(clean.contains("1\tCO2TRAPPE_C_co2\t1\tCO2\tC\t1\t0.70\t12.011"));
        assert!(clean.contains("3\tCO2TRAPPE_O_co2\t1\tCO2\tO2"));
        assert!(clean.contains("[ bonds ]\n1 2\n"));

        let merged = fs::read_to_string(dir.path().join(MERGED_ATOMTYPES_FILE)).unwrap();
        assert!(merged.starts_with("[ atomtypes ]\n"));
        assert!(merged.contains("CO2TRAPPE_C_co2 6 12.011 0.70 A 0.280 0.224 ; from co2.trappe.itp"));
        assert!(merged.contains("CO2TRAPPE_O_co2 8 15.999 -0.35"));
    }

    #[test]
    fn writes_topology_with_declared_molecule_names() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("co2.itp"), CO2_ITP).unwrap();
        let request = TopologyRequest {
            forcefield: "oplsaa.ff".to_string(),
            global_includes: Vec::new(),
            molecules: vec![
                TopologyMolecule {
                    name: "CO2".to_string(),
                    count: 500,
                    itp: Some("co2.itp".to_string()),
                },
                TopologyMolecule {
                    name: "SOL".to_string(),
                    count: 20,
                    itp: None,
                },
            ],
            sanitize: true,
            include_water: true,
            title: None,
        };

        let report = write_topology(dir.path(), &request).unwrap();
        assert!(report.sanitized);
        assert_eq!(report.global_includes, vec![MERGED_ATOMTYPES_FILE]);
        assert_eq!(report.molecule_includes, vec!["clean_co2.itp"]);
        assert_eq!(report.molecules[0].name, "CO2N");

        let top = fs::read_to_string(dir.path().join(TOPOLOGY_FILE)).unwrap();
        let forcefield = top.find("#include \"oplsaa.ff/forcefield.itp\"").unwrap();
        let merged = top.find("#include \"merged_atomtypes.itp\"").unwrap();
        let molecule = top.find("#include \"clean_co2.itp\"").unwrap();
        assert!(forcefield < merged && merged < molecule);
        assert!(top.contains("#include \"oplsaa.ff/spce.itp\"\n#include \"oplsaa.ff/ions.itp\"\n"));
        assert!(top.ends_with("[ molecules ]\n; Compound    #mols\nCO2N            500\nSOL             20\n"));
    }

    #[test]
    fn topology_without_sanitizing_uses_original_fragments() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("co2.itp"), CO2_ITP).unwrap();
        let request: TopologyRequest = serde_json::from_value(serde_json::json!({
            "forcefield": "custom.itp",
            "molecules": [{"name": "CO2", "count": 10, "itp": "co2.itp"}],
            "sanitize": false
        }))
        .unwrap();

        let report = write_topology(dir.path(), &request).unwrap();
        assert!(!report.sanitized);
        assert_eq!(report.molecule_includes, vec!["co2.itp"]);
        let top = fs::read_to_string(dir.path().join(TOPOLOGY_FILE)).unwrap();
        assert!(top.starts_with("; generated by chemsim\n\n#include \"custom.itp\"\n"));
        assert!(!top.contains("spce.itp"));
        assert!(!dir.path().join(MERGED_ATOMTYPES_FILE).exists());
    }

    #[test]
    fn topology_rejects_missing_fragments_and_empty_lists() {
        let dir = TempDir::new().unwrap();
        let mut request: TopologyRequest = serde_json::from_value(serde_json::json!({
            "molecules": [{"name": "CO2", "count": 10, "itp": "co2.itp"}]
        }))
        .unwrap();
        assert_eq!(
            write_topology(dir.path(), &request),
            Err(ChemsimError::MissingInput("co2.itp".to_string()))
        );

        request.molecules.clear();
        assert!(matches!(
            write_topology(dir.path(), &request),
            Err(ChemsimError::InvalidName(_))
        ));
    }
}
