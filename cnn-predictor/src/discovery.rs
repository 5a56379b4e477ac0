//! Lists the checkpoints saved in a results directory.

use crate::checkpoint::META_SUFFIX;
use crate::Result;
use std::fs;
use std::path::Path;

/// Base names (without `.meta`) of every checkpoint directly inside
/// `model_dir` whose file name starts with `prefix`, e.g. `step1_`.
/// Matching ignores case; the returned names keep theirs. Sorted.
pub fn get_all_models(model_dir: impl AsRef<Path>, prefix: &str) -> Result<Vec<String>> {
    let prefix = prefix.to_lowercase();
    let mut models = Vec::new();
    for entry in fs::read_dir(model_dir.as_ref())? {
        let entry = entry?;
        // Follows symlinks, like a stat of the joined path would.
        if !entry.path().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            tracing::debug!(path = %entry.path().display(), "Skipping non UTF-8 file name");
            continue;
        };
        if !name.to_lowercase().starts_with(&prefix) {
            continue;
        }
        if let Some(base) = strip_suffix_ignore_case(&name, META_SUFFIX) {
            models.push(base.to_string());
        }
    }
    models.sort();
    tracing::debug!(dir = %model_dir.as_ref().display(), count = models.len(), "Listed models");
    Ok(models)
}

fn strip_suffix_ignore_case<'a>(name: &'a str, suffix: &str) -> Option<&'a str> {
    let split = name.len().checked_sub(suffix.len())?;
    if !name.is_char_boundary(split) || !name[split..].eq_ignore_ascii_case(suffix) {
        return None;
    }
    Some(&name[..split])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn empty_directory_has_no_models() {
        let dir = tempfile::tempdir().unwrap();
        assert!(get_all_models(dir.path(), "step1_").unwrap().is_empty());
    }

    #[test]
    fn matches_prefix_and_suffix_ignoring_case() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "step1_a.meta",
            "STEP1_B.META",
            "step1_a.weights",
            "step2_c.meta",
            "notes.txt",
            "step1_meta",
        ] {
            File::create(dir.path().join(name)).unwrap();
        }
        fs::create_dir(dir.path().join("step1_dir.meta")).unwrap();

        let models = get_all_models(dir.path(), "step1_").unwrap();
        assert_eq!(models, vec!["STEP1_B".to_string(), "step1_a".to_string()]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn non_utf8_names_are_skipped() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join(OsStr::from_bytes(b"step1_\xff.meta"))).unwrap();
        File::create(dir.path().join("step1_ok.meta")).unwrap();

        let models = get_all_models(dir.path(), "step1_").unwrap();
        assert_eq!(models, vec!["step1_ok".to_string()]);
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(get_all_models(dir.path().join("nope"), "").is_err());
    }
}
