//! Best-effort skill injection at spawn time.
//!
//! Extensions live under `$HOME/.agentide/extensions/<name>/` with a
//! `manifest.json` (`{"name": …, "enabled": …}`) and a `skills/`
//! directory. Enabled extensions get their skills copied into the
//! session's working tree before the agent starts. Failures are logged
//! and never abort the spawn.

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct ExtensionManifest {
    name: String,
    #[serde(default)]
    enabled: bool,
}

/// Copy skills from every enabled extension into
/// `<working_directory>/.claude/skills/<extension>/`.
pub fn inject_extensions(working_directory: &Path) {
    let extensions_dir = crate::config::base_dir().join("extensions");
    let entries = match std::fs::read_dir(&extensions_dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let extension_dir = entry.path();
        if !extension_dir.is_dir() {
            continue;
        }

        let manifest_path = extension_dir.join("manifest.json");
        let manifest: ExtensionManifest = match std::fs::read_to_string(&manifest_path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
        {
            Some(manifest) => manifest,
            None => {
                tracing::debug!(path = %manifest_path.display(), "Skipping extension without manifest");
                continue;
            }
        };
        if !manifest.enabled {
            continue;
        }

        let skills_src = extension_dir.join("skills");
        if !skills_src.is_dir() {
            continue;
        }
        let skills_dst = working_directory
            .join(".claude")
            .join("skills")
            .join(&manifest.name);

        match copy_tree(&skills_src, &skills_dst) {
            Ok(count) => {
                tracing::debug!(extension = %manifest.name, files = count, "Injected extension skills");
            }
            Err(e) => {
                tracing::warn!(
                    extension = %manifest.name,
                    error = %e,
                    "Failed to inject extension skills"
                );
            }
        }
    }
}

fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<usize> {
    std::fs::create_dir_all(dst)?;
    let mut copied = 0;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if src_path.is_dir() {
            copied += copy_tree(&src_path, &dst_path)?;
        } else {
            std::fs::copy(&src_path, &dst_path)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_tree_replicates_nested_layout() {
        let src = tempfile::TempDir::new().expect("src");
        let dst = tempfile::TempDir::new().expect("dst");

        std::fs::create_dir_all(src.path().join("nested")).expect("mkdir");
        std::fs::write(src.path().join("top.md"), "top").expect("write");
        std::fs::write(src.path().join("nested/deep.md"), "deep").expect("write");

        let copied = copy_tree(src.path(), &dst.path().join("out")).expect("copy");
        assert_eq!(copied, 2);
        assert!(dst.path().join("out/top.md").exists());
        assert!(dst.path().join("out/nested/deep.md").exists());
    }
}
