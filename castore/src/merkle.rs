//! The Merkle input tree an action is executed against.
//!
//! A [NestedDirectory] is builder state: it is created per action, filled
//! with the action's input files, serialized into canonical [Directory]
//! messages (collecting their blobs for upload), and discarded once the root
//! digest is known.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::SystemTime;

use bytes::Bytes;
use prost::Message;

use nimbus_reapi::proto::{
    Digest, Directory, DirectoryNode, FileNode, NodeProperties, OutputFile, SymlinkNode,
};

use crate::{fsutil, DigestFunction, Error};

/// An input file: its content digest, executable bit and (optionally
/// captured) mtime. `name` is supplied at serialization time, so one entry
/// can be reused under several names.
#[derive(Clone, Debug, PartialEq)]
pub struct FileEntry {
    pub digest: Digest,
    pub executable: bool,
    pub mtime: Option<SystemTime>,
}

impl FileEntry {
    /// Stat and hash the file at `path`. `capture_mtime` additionally
    /// records the modification time into the node properties.
    pub async fn from_path(
        path: &Path,
        digest_function: DigestFunction,
        capture_mtime: bool,
    ) -> Result<Self, Error> {
        let metadata = tokio::fs::metadata(path).await?;
        let digest = digest_function.digest_of_path(path).await?;
        Ok(FileEntry {
            digest,
            executable: fsutil::is_executable(&metadata),
            mtime: if capture_mtime {
                metadata.modified().ok()
            } else {
                None
            },
        })
    }

    fn node_properties(&self) -> Option<NodeProperties> {
        self.mtime.map(|mtime| NodeProperties {
            properties: vec![],
            mtime: fsutil::mtime_timestamp(mtime),
        })
    }

    pub fn to_file_node(&self, name: &str) -> FileNode {
        FileNode {
            name: name.to_string(),
            digest: Some(self.digest.clone()),
            is_executable: self.executable,
            node_properties: self.node_properties(),
        }
    }

    pub fn to_output_file(&self, path: &str) -> OutputFile {
        OutputFile {
            path: path.to_string(),
            digest: Some(self.digest.clone()),
            is_executable: self.executable,
            contents: Bytes::new(),
            node_properties: self.node_properties(),
        }
    }
}

/// Builder for an action input root. The maps keep entries sorted by name,
/// so serialization is canonical by construction.
#[derive(Default)]
pub struct NestedDirectory {
    files: BTreeMap<String, FileEntry>,
    symlinks: BTreeMap<String, String>,
    subdirs: BTreeMap<String, NestedDirectory>,
}

impl NestedDirectory {
    /// Place `file` at `relative_path`, creating intermediate directories.
    pub fn add(&mut self, file: FileEntry, relative_path: &str) {
        match relative_path.split_once('/') {
            Some(("", rest)) => self.add(file, rest),
            Some((subdir, rest)) => self
                .subdirs
                .entry(subdir.to_string())
                .or_default()
                .add(file, rest),
            None => {
                self.files.insert(relative_path.to_string(), file);
            }
        }
    }

    /// Record a symlink node at `relative_path`.
    pub fn add_symlink(&mut self, target: &str, relative_path: &str) {
        match relative_path.split_once('/') {
            Some(("", rest)) => self.add_symlink(target, rest),
            Some((subdir, rest)) => self
                .subdirs
                .entry(subdir.to_string())
                .or_default()
                .add_symlink(target, rest),
            None => {
                self.symlinks
                    .insert(relative_path.to_string(), target.to_string());
            }
        }
    }

    /// Ensure an (empty, if absent) directory exists at `directory`.
    pub fn add_directory(&mut self, directory: &str) {
        // A forward slash by itself is not a valid input directory.
        if directory == "/" {
            return;
        }
        match directory.split_once('/') {
            Some(("", rest)) => self.add_directory(rest),
            Some((subdir, rest)) => self
                .subdirs
                .entry(subdir.to_string())
                .or_default()
                .add_directory(rest),
            None => {
                self.subdirs.entry(directory.to_string()).or_default();
            }
        }
    }

    /// Serialize the tree bottom-up into canonical Directory messages,
    /// recording each serialized blob under its digest, and return the root
    /// digest.
    pub fn to_digest(
        &self,
        digest_function: DigestFunction,
        blobs: &mut HashMap<Digest, Bytes>,
    ) -> Digest {
        let mut dir_msg = Directory::default();
        for (name, file) in &self.files {
            dir_msg.files.push(file.to_file_node(name));
        }
        for (name, target) in &self.symlinks {
            dir_msg.symlinks.push(SymlinkNode {
                name: name.clone(),
                target: target.clone(),
                node_properties: None,
            });
        }
        for (name, subdir) in &self.subdirs {
            let subdir_digest = subdir.to_digest(digest_function, blobs);
            dir_msg.directories.push(DirectoryNode {
                name: name.clone(),
                digest: Some(subdir_digest),
            });
        }
        let blob: Bytes = dir_msg.encode_to_vec().into();
        let digest = digest_function.digest_of(&blob);
        blobs.insert(digest.clone(), blob);
        digest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(hash: &str) -> FileEntry {
        FileEntry {
            digest: Digest {
                hash: hash.to_string(),
                size_bytes: 1,
            },
            executable: false,
            mtime: None,
        }
    }

    #[test]
    fn empty_tree_digest_is_digest_of_empty_message() {
        let mut blobs = HashMap::new();
        let digest = NestedDirectory::default().to_digest(DigestFunction::Sha256, &mut blobs);
        // An empty Directory message serializes to zero bytes.
        assert_eq!(digest, DigestFunction::Sha256.digest_of(b""));
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs.get(&digest).unwrap().len(), 0);
    }

    #[test]
    fn nested_paths_create_intermediate_directories() {
        let mut root = NestedDirectory::default();
        root.add(entry("aa"), "src/main.c");
        root.add(entry("bb"), "src/util/helper.c");
        root.add(entry("cc"), "top.c");

        let mut blobs = HashMap::new();
        let root_digest = root.to_digest(DigestFunction::Sha256, &mut blobs);

        let root_msg = Directory::decode(blobs.get(&root_digest).unwrap().clone()).unwrap();
        assert_eq!(root_msg.files.len(), 1);
        assert_eq!(root_msg.files[0].name, "top.c");
        assert_eq!(root_msg.directories.len(), 1);
        assert_eq!(root_msg.directories[0].name, "src");

        let src_digest = root_msg.directories[0].digest.clone().unwrap();
        let src_msg = Directory::decode(blobs.get(&src_digest).unwrap().clone()).unwrap();
        assert_eq!(src_msg.files[0].name, "main.c");
        assert_eq!(src_msg.directories[0].name, "util");
    }

    #[test]
    fn serialization_is_sorted_by_name() {
        let mut root = NestedDirectory::default();
        root.add(entry("aa"), "zebra.c");
        root.add(entry("bb"), "alpha.c");
        root.add(entry("cc"), "mid.c");

        let mut blobs = HashMap::new();
        let digest = root.to_digest(DigestFunction::Sha256, &mut blobs);
        let msg = Directory::decode(blobs.get(&digest).unwrap().clone()).unwrap();
        let names: Vec<_> = msg.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["alpha.c", "mid.c", "zebra.c"]);
    }

    #[test]
    fn insertion_order_does_not_change_digest() {
        let mut a = NestedDirectory::default();
        a.add(entry("aa"), "x/one.c");
        a.add(entry("bb"), "x/two.c");
        let mut b = NestedDirectory::default();
        b.add(entry("bb"), "x/two.c");
        b.add(entry("aa"), "x/one.c");

        let mut blobs_a = HashMap::new();
        let mut blobs_b = HashMap::new();
        assert_eq!(
            a.to_digest(DigestFunction::Sha256, &mut blobs_a),
            b.to_digest(DigestFunction::Sha256, &mut blobs_b)
        );
    }

    #[test]
    fn directory_round_trips_byte_identical() {
        let mut root = NestedDirectory::default();
        root.add(entry("aa"), "a/b.c");
        root.add_symlink("../target", "a/link");
        let mut blobs = HashMap::new();
        let digest = root.to_digest(DigestFunction::Sha256, &mut blobs);

        let blob = blobs.get(&digest).unwrap().clone();
        let decoded = Directory::decode(blob.clone()).unwrap();
        let re_encoded: Bytes = decoded.encode_to_vec().into();
        assert_eq!(blob, re_encoded);
        assert_eq!(DigestFunction::Sha256.digest_of(&re_encoded), digest);
    }

    #[test]
    fn explicit_directories_and_slash_guard() {
        let mut root = NestedDirectory::default();
        root.add_directory("/");
        root.add_directory("build/sub");

        let mut blobs = HashMap::new();
        let digest = root.to_digest(DigestFunction::Sha256, &mut blobs);
        let msg = Directory::decode(blobs.get(&digest).unwrap().clone()).unwrap();
        assert_eq!(msg.directories.len(), 1);
        assert_eq!(msg.directories[0].name, "build");
    }
}
