//! Assembles the REAPI Action for a spawn: the Merkle input root, the
//! Command proto, and the blob set that has to reach the CAS before
//! execution.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use prost::Message;
use tracing::{error, instrument};

use nimbus_castore::merkle::{FileEntry, NestedDirectory};
use nimbus_castore::path::{
    has_path_prefix, last_n_segments, normalize_path, parent_directory_level,
};
use nimbus_castore::DigestFunction;
use nimbus_reapi::proto::{
    platform, Action, ActionResult, Command, Digest, OutputSymlink, Platform,
};

use crate::config::RbeConfig;
use crate::spawn::RemoteSpawn;
use crate::Error;

/// The REAPI revision spoken to the server. From 2.1 on outputs are
/// declared via `output_paths`; from 2.2 on the platform is duplicated onto
/// the Action.
pub const REAPI_VERSION: f32 = 2.2;

/// An action ready for upload: the Action itself, its digest, and the blob
/// maps the CAS may be missing.
pub struct ActionBundle {
    pub action: Action,
    pub action_digest: Digest,
    pub input_root_digest: Digest,
    /// Serialized protos (directories, Command, Action) keyed by digest.
    pub blobs: HashMap<Digest, Bytes>,
    /// Input files on disk keyed by digest.
    pub file_inputs: HashMap<Digest, String>,
    /// The declared output paths.
    pub products: BTreeSet<String>,
    pub working_directory: String,
}

/// The working directory is the common-ancestor-relative tail of the build
/// cwd: deep enough that no input or output needs to escape it with more
/// `..` segments than it has.
fn common_ancestor_path(
    deps: &BTreeSet<String>,
    products: &BTreeSet<String>,
    work_dir: &str,
) -> Result<String, Error> {
    let mut parents_needed = 0;
    for dep in deps {
        parents_needed = parents_needed.max(parent_directory_level(dep));
    }
    for product in products {
        parents_needed = parents_needed.max(parent_directory_level(product));
    }
    last_n_segments(work_dir, parents_needed).ok_or_else(|| {
        Error::InvalidAction(format!(
            "not enough segments in '{}' for {} parent levels",
            work_dir, parents_needed
        ))
    })
}

/// Where an input path lives on disk: relative inputs resolve against the
/// build cwd.
fn disk_path(path: &str, config: &RbeConfig) -> PathBuf {
    if path.starts_with('/') {
        PathBuf::from(path)
    } else {
        Path::new(&config.cwd).join(path)
    }
}

/// Hash every input into the Merkle tree. Paths are placed at their
/// (work-dir-joined, normalized) location; anything outside the project
/// root is silently excluded from the input root.
async fn build_merkle_tree(
    deps: &BTreeSet<String>,
    cmd_work_dir: &str,
    config: &RbeConfig,
    digest_function: DigestFunction,
    nested_dir: &mut NestedDirectory,
    file_inputs: &mut HashMap<Digest, String>,
) -> Result<(), Error> {
    for dep in deps {
        let mut merkle_path = dep.clone();
        if !merkle_path.starts_with('/') && !cmd_work_dir.is_empty() {
            merkle_path = format!("{}/{}", cmd_work_dir, dep);
        }
        merkle_path = normalize_path(&merkle_path);
        if merkle_path.starts_with('/') && !has_path_prefix(&merkle_path, &config.project_root) {
            continue;
        }
        let file =
            FileEntry::from_path(&disk_path(dep, config), digest_function, false).await?;
        file_inputs.insert(file.digest.clone(), dep.clone());
        nested_dir.add(file, &merkle_path);
    }
    Ok(())
}

fn platform_from_properties(properties: &BTreeMap<String, String>) -> Platform {
    Platform {
        properties: properties
            .iter()
            .map(|(name, value)| platform::Property {
                name: name.clone(),
                value: value.clone(),
            })
            .collect(),
    }
}

fn command_proto(
    arguments: &[String],
    outputs: &BTreeSet<String>,
    working_directory: &str,
    properties: &BTreeMap<String, String>,
) -> Command {
    let mut command = Command {
        arguments: arguments.to_vec(),
        working_directory: working_directory.to_string(),
        platform: Some(platform_from_properties(properties)),
        ..Default::default()
    };
    // REAPI 2.1 deprecated per-kind output lists in favor of output_paths.
    if REAPI_VERSION >= 2.1 {
        command.output_paths = outputs.iter().cloned().collect();
    } else {
        command.output_files = outputs.iter().cloned().collect();
    }
    command
}

/// Build the Action (and everything it references) for `spawn`.
#[instrument(skip_all, fields(rule = %spawn.rule))]
pub async fn build_action(
    spawn: &RemoteSpawn,
    config: &RbeConfig,
    digest_function: DigestFunction,
) -> Result<ActionBundle, Error> {
    let deps: BTreeSet<String> = spawn.inputs.iter().cloned().collect();
    let products: BTreeSet<String> = spawn.outputs.iter().cloned().collect();

    let mut cmd_work_dir = common_ancestor_path(&deps, &products, &config.cwd)?;

    let mut nested_dir = NestedDirectory::default();
    let mut blobs = HashMap::new();
    let mut file_inputs = HashMap::new();
    build_merkle_tree(
        &deps,
        &cmd_work_dir,
        config,
        digest_function,
        &mut nested_dir,
        &mut file_inputs,
    )
    .await?;
    if !cmd_work_dir.is_empty() {
        cmd_work_dir = normalize_path(&cmd_work_dir);
        nested_dir.add_directory(&cmd_work_dir);
    }
    let input_root_digest = nested_dir.to_digest(digest_function, &mut blobs);

    let command = command_proto(
        &spawn.arguments,
        &products,
        &cmd_work_dir,
        &config.rbe_properties,
    );
    let command_blob: Bytes = command.encode_to_vec().into();
    let command_digest = digest_function.digest_of(&command_blob);
    blobs.insert(command_digest.clone(), command_blob);

    let action = Action {
        command_digest: Some(command_digest),
        input_root_digest: Some(input_root_digest.clone()),
        timeout: None,
        do_not_cache: false,
        // From 2.2 on servers may read the platform straight off the
        // Action, without dereferencing the Command.
        platform: if REAPI_VERSION >= 2.2 {
            command.platform.clone()
        } else {
            None
        },
    };
    let action_blob: Bytes = action.encode_to_vec().into();
    let action_digest = digest_function.digest_of(&action_blob);
    blobs.insert(action_digest.clone(), action_blob);

    Ok(ActionBundle {
        action,
        action_digest,
        input_root_digest,
        blobs,
        file_inputs,
        products,
        working_directory: cmd_work_dir,
    })
}

/// After a local cache-miss execution, assemble the ActionResult to publish:
/// produced files (dependency files elided), symlinks resolved, exit code 0.
#[instrument(skip_all, fields(rule = %spawn.rule))]
pub async fn build_action_result(
    spawn: &RemoteSpawn,
    config: &RbeConfig,
    digest_function: DigestFunction,
) -> Result<(ActionResult, HashMap<Digest, Bytes>, HashMap<Digest, String>), Error> {
    let deps: BTreeSet<String> = spawn.inputs.iter().cloned().collect();
    let products: BTreeSet<String> = spawn.outputs.iter().cloned().collect();
    let cmd_work_dir = common_ancestor_path(&deps, &products, &config.cwd)?;

    let mut result = ActionResult::default();
    let mut blobs = HashMap::new();
    let mut output_files = HashMap::new();
    for product in &products {
        // Dependency files are not part of the published result.
        if product.contains(".o.d") {
            continue;
        }
        if product.starts_with('/') && !has_path_prefix(product, &config.project_root) {
            continue;
        }
        let on_disk = disk_path(product, config);
        let metadata = tokio::fs::symlink_metadata(&on_disk).await?;
        if metadata.file_type().is_symlink() {
            let target = match tokio::fs::read_link(&on_disk).await {
                Ok(target) => target.to_string_lossy().into_owned(),
                Err(e) => {
                    error!("error reading symlink {}: {}", product, e);
                    String::new()
                }
            };
            result.output_symlinks.push(OutputSymlink {
                path: product.clone(),
                target,
                node_properties: None,
            });
        } else {
            let file = FileEntry::from_path(&on_disk, digest_function, false).await?;
            output_files.insert(file.digest.clone(), product.clone());
            result.output_files.push(file.to_output_file(product));
        }
    }

    let command = command_proto(
        &spawn.arguments,
        &products,
        &cmd_work_dir,
        &config.rbe_properties,
    );
    let command_blob: Bytes = command.encode_to_vec().into();
    let command_digest = digest_function.digest_of(&command_blob);
    blobs.insert(command_digest, command_blob);

    result.exit_code = 0;
    Ok((result, blobs, output_files))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[rstest]
    #[case(&["a.c"], &["a.o"], "/p/build", "")]
    #[case(&["../src/a.c"], &["a.o"], "/p/build", "build")]
    #[case(&["../../src/a.c"], &["a.o"], "/p/sub/build", "sub/build")]
    #[case(&["a.c"], &["../out/a.o"], "/p/build", "build")]
    fn ancestor_matches_deepest_escape(
        #[case] deps: &[&str],
        #[case] products: &[&str],
        #[case] cwd: &str,
        #[case] expected: &str,
    ) {
        assert_eq!(
            common_ancestor_path(&set(deps), &set(products), cwd).unwrap(),
            expected
        );
    }

    #[test]
    fn ancestor_fails_when_cwd_is_too_shallow() {
        assert!(common_ancestor_path(&set(&["../../../x.c"]), &set(&[]), "/p").is_err());
    }

    #[test]
    fn command_proto_uses_output_paths_and_workdir() {
        let mut properties = BTreeMap::new();
        properties.insert("container-image".to_string(), "docker://img".to_string());
        let command = command_proto(
            &["gcc".to_string(), "-c".to_string(), "a.c".to_string()],
            &set(&["a.o"]),
            "build",
            &properties,
        );
        assert_eq!(command.output_paths, vec!["a.o"]);
        assert!(command.output_files.is_empty());
        assert_eq!(command.working_directory, "build");
        let platform = command.platform.unwrap();
        assert_eq!(platform.properties[0].name, "container-image");
    }

    #[tokio::test]
    async fn empty_input_tree_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let config = RbeConfig {
            project_root: dir.path().to_string_lossy().into_owned(),
            cwd: dir.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        let spawn = RemoteSpawn {
            command: "true".to_string(),
            origin_command: "true".to_string(),
            rule: "phony".to_string(),
            arguments: vec!["true".to_string()],
            inputs: vec![],
            outputs: vec![],
            can_remote: true,
        };
        let bundle = build_action(&spawn, &config, DigestFunction::Sha256)
            .await
            .unwrap();
        // The input root is the digest of an empty Directory message.
        assert_eq!(
            bundle.input_root_digest,
            DigestFunction::Sha256.digest_of(b"")
        );
        assert!(bundle.file_inputs.is_empty());
    }

    #[tokio::test]
    async fn inputs_outside_project_root_are_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("p");
        tokio::fs::create_dir_all(root.join("build")).await.unwrap();
        tokio::fs::write(root.join("build/a.c"), b"int main;").await.unwrap();

        let config = RbeConfig {
            project_root: root.to_string_lossy().into_owned(),
            cwd: root.join("build").to_string_lossy().into_owned(),
            ..Default::default()
        };
        let spawn = RemoteSpawn {
            command: "gcc -c a.c -o a.o".to_string(),
            origin_command: "gcc -c a.c -o a.o".to_string(),
            rule: "cc".to_string(),
            arguments: parser_args("gcc -c a.c -o a.o"),
            // The absolute path escapes the project root and is dropped
            // from the tree; the relative one is hashed.
            inputs: vec!["/etc/hostname".to_string(), "a.c".to_string()],
            outputs: vec!["a.o".to_string()],
            can_remote: true,
        };
        let bundle = build_action(&spawn, &config, DigestFunction::Sha256)
            .await
            .unwrap();
        assert_eq!(bundle.file_inputs.len(), 1);
        assert_eq!(
            bundle.file_inputs.values().next().unwrap(),
            "a.c"
        );
        assert_eq!(bundle.working_directory, "");
        // Directories, command and action are all in the upload set.
        assert!(bundle.blobs.len() >= 3);
        assert!(bundle.blobs.contains_key(&bundle.action_digest));
    }

    fn parser_args(command: &str) -> Vec<String> {
        crate::parser::split_command(command)
    }
}
