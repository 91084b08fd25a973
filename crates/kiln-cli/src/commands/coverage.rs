use super::{json_pretty, open_kiln, CliError, CmdResult, EXIT_CONFIG_ERROR, EXIT_SUCCESS};
use crate::Output;
use kiln_schema::{ContainerId, KilnConfig};
use std::collections::BTreeMap;
use std::path::Path;

pub fn run(
    config: KilnConfig,
    container: &str,
    filemap: Option<&Path>,
    out: Output,
) -> CmdResult {
    let filemap = match filemap {
        Some(path) => read_filemap(path)?,
        None => BTreeMap::new(),
    };
    let kiln = open_kiln(config, out.verbose)?;
    let records = kiln.get_coverage(&ContainerId::from(container), &filemap)?;
    println!("{}", json_pretty(&records)?);
    Ok(EXIT_SUCCESS)
}

/// A JSON object mapping in-container paths to host paths.
fn read_filemap(path: &Path) -> Result<BTreeMap<String, String>, CliError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        CliError::new(
            EXIT_CONFIG_ERROR,
            format!("failed to read filemap {}: {e}", path.display()),
        )
    })?;
    serde_json::from_str(&content).map_err(|e| {
        CliError::new(
            EXIT_CONFIG_ERROR,
            format!("invalid filemap {}: {e}", path.display()),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filemap_is_a_path_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filemap.json");
        std::fs::write(&path, r#"{"/var/hg/ext/a.py": "hgext/a.py"}"#).unwrap();
        let map = read_filemap(&path).unwrap();
        assert_eq!(map["/var/hg/ext/a.py"], "hgext/a.py");
    }

    #[test]
    fn bad_filemap_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filemap.json");
        std::fs::write(&path, "[1, 2]").unwrap();
        assert_eq!(read_filemap(&path).unwrap_err().code, EXIT_CONFIG_ERROR);
        assert_eq!(
            read_filemap(&dir.path().join("missing.json")).unwrap_err().code,
            EXIT_CONFIG_ERROR
        );
    }
}
