//! Model and tokenizer path resolution.

use std::path::{Path, PathBuf};

use fornax::{Error, Result};
use tracing::{info, warn};

/// Resolve the model and tokenizer files from a user-supplied path.
///
/// A directory is expected to contain `model.bin` and `tokenizer.bin`. A
/// file is used as the model directly, with `tokenizer.bin` looked up in
/// the same directory and, failing that, the current directory.
///
/// # Errors
/// Returns an error if the path does not exist or a directory is missing
/// either file.
pub fn resolve_model_paths(input: &Path) -> Result<(PathBuf, PathBuf)> {
    if input.is_dir() {
        let model_path = input.join("model.bin");
        let tokenizer_path = input.join("tokenizer.bin");

        if !model_path.exists() {
            return Err(Error::Config(format!(
                "model.bin not found in directory: {}",
                input.display()
            )));
        }
        if !tokenizer_path.exists() {
            return Err(Error::Config(format!(
                "tokenizer.bin not found in directory: {}",
                input.display()
            )));
        }
        info!(dir = %input.display(), "found model.bin and tokenizer.bin");
        Ok((model_path, tokenizer_path))
    } else if input.is_file() {
        let parent = input.parent().unwrap_or_else(|| Path::new(""));
        let mut tokenizer_path = parent.join("tokenizer.bin");
        if !tokenizer_path.exists() {
            warn!(
                dir = %parent.display(),
                "tokenizer.bin not found next to model, trying current directory"
            );
            tokenizer_path = PathBuf::from("tokenizer.bin");
        }
        Ok((input.to_path_buf(), tokenizer_path))
    } else {
        Err(Error::Config(format!(
            "path does not exist: {}",
            input.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn directory_with_both_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("model.bin"), b"m").unwrap();
        fs::write(dir.path().join("tokenizer.bin"), b"t").unwrap();

        let (model, tokenizer) = resolve_model_paths(dir.path()).unwrap();
        assert_eq!(model, dir.path().join("model.bin"));
        assert_eq!(tokenizer, dir.path().join("tokenizer.bin"));
    }

    #[test]
    fn directory_missing_model_fails() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("tokenizer.bin"), b"t").unwrap();
        assert!(resolve_model_paths(dir.path()).is_err());
    }

    #[test]
    fn directory_missing_tokenizer_fails() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("model.bin"), b"m").unwrap();
        assert!(resolve_model_paths(dir.path()).is_err());
    }

    #[test]
    fn model_file_finds_sibling_tokenizer() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("stories.bin");
        fs::write(&model, b"m").unwrap();
        fs::write(dir.path().join("tokenizer.bin"), b"t").unwrap();

        let (model_path, tokenizer_path) = resolve_model_paths(&model).unwrap();
        assert_eq!(model_path, model);
        assert_eq!(tokenizer_path, dir.path().join("tokenizer.bin"));
    }

    #[test]
    fn model_file_without_sibling_falls_back_to_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("stories.bin");
        fs::write(&model, b"m").unwrap();

        let (_, tokenizer_path) = resolve_model_paths(&model).unwrap();
        assert_eq!(tokenizer_path, PathBuf::from("tokenizer.bin"));
    }

    #[test]
    fn missing_path_fails() {
        assert!(resolve_model_paths(Path::new("/nonexistent/model.bin")).is_err());
    }
}
