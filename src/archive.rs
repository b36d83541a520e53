//! Member-level decryption and re-encryption of the backup zip container.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{Cursor, Read, Seek, Write};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::cipher;
use crate::error::{Error, Result};

/// The control document listing the MD5 of every other member.
pub const MANIFEST_MEMBER: &str = "0.musicolet.backup";

/// Plaintext MD5 of the serialized manifest. The only member stored unencrypted.
pub const HASH_MEMBER: &str = "0.musicolet.backup.md5";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The member is stored in plaintext by convention and was not decrypted.
    Verbatim,
    /// The padding check failed after decryption.
    Padding,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Verbatim => f.write_str("verbatim"),
            FailureReason::Padding => f.write_str("invalid padding"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptFailure {
    pub name: String,

    pub reason: FailureReason,
}

#[derive(Debug, Default)]
pub struct DecryptedArchive {
    pub members: BTreeMap<String, Vec<u8>>,

    pub failures: Vec<DecryptFailure>,
}

/// The decrypted manifest. Only the hash table is interpreted, the remaining
/// fields are carried through untouched.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ManifestRecord {
    pub md5: BTreeMap<String, String>,

    #[serde(flatten)]
    pub other: serde_json::Map<String, Value>,
}

impl ManifestRecord {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        return Ok(serde_json::from_slice(data)?);
    }

    /// Keys are emitted in sorted order so the digest of the output is reproducible.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        return Ok(serde_json::to_vec(self)?);
    }
}

/// Decrypts every member of the backup at `path`.
///
/// Members that fail the padding check are reported in
/// [`DecryptedArchive::failures`] and left out of the member map. A missing
/// or unreadable container is an error.
pub fn decrypt_archive(path: &Path) -> Result<DecryptedArchive> {
    let file = File::open(path)?;

    let archive = decrypt_container(file)?;

    tracing::info!(
        ?path,
        members = archive.members.len(),
        failures = archive.failures.len(),
        "decrypted backup"
    );

    return Ok(archive);
}

pub fn decrypt_container<R: Read + Seek>(reader: R) -> Result<DecryptedArchive> {
    let mut zip = ZipArchive::new(reader)?;

    let mut archive = DecryptedArchive::default();

    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;

        if entry.is_dir() {
            continue;
        }

        let name = entry.name().to_string();

        let mut buffer = Vec::new();

        entry.read_to_end(&mut buffer)?;

        if name == HASH_MEMBER {
            tracing::debug!(%name, "keeping hash member verbatim");
            archive.failures.push(DecryptFailure {
                name,
                reason: FailureReason::Verbatim,
            });
            continue;
        }

        match cipher::decrypt(&buffer) {
            Ok(decrypted) => {
                tracing::debug!(%name, len = decrypted.len(), "decrypted member");
                if archive.members.insert(name.clone(), decrypted).is_some() {
                    tracing::warn!(%name, "duplicate member name, keeping the later entry");
                }
            }
            Err(Error::Padding) => {
                tracing::warn!(%name, "decryption failed: invalid padding");
                archive.failures.push(DecryptFailure {
                    name,
                    reason: FailureReason::Padding,
                });
            }
            Err(error) => return Err(error),
        }
    }

    return Ok(archive);
}

struct StagedMember {
    digest: String,

    encrypted: Vec<u8>,
}

/// Re-encrypts an exported backup directory into a container at `output`.
///
/// The manifest must list exactly the files present in the tree. Its hash
/// table is rewritten with fresh digests and a new hash member is generated.
/// Nothing is written unless every check passes.
pub fn encrypt_tree(source_dir: &Path, output: &Path) -> Result<()> {
    let mut manifests = Vec::new();

    let mut staged = BTreeMap::new();

    for entry in WalkDir::new(source_dir).sort_by_file_name() {
        let entry = entry?;

        if !entry.file_type().is_file() {
            continue;
        }

        let name = member_name(source_dir, entry.path())?;

        if entry.file_name() == MANIFEST_MEMBER {
            manifests.push((name, entry.into_path()));
            continue;
        }

        if name == HASH_MEMBER {
            tracing::debug!(%name, "ignoring stale hash member");
            continue;
        }

        let content = fs::read(entry.path())?;

        staged.insert(
            name,
            StagedMember {
                digest: format!("{:x}", md5::compute(&content)),
                encrypted: cipher::encrypt(&content)?,
            },
        );
    }

    let (manifest_name, manifest_path) = match manifests.len() {
        0 => return Err(Error::MissingRequiredMember(MANIFEST_MEMBER.to_string())),
        1 => manifests.remove(0),
        _ => return Err(Error::DuplicateManifest(manifests.into_iter().map(|(_, path)| path).collect())),
    };

    let mut manifest = ManifestRecord::from_bytes(&fs::read(&manifest_path)?)?;

    for (name, digest) in manifest.md5.iter_mut() {
        let member = staged
            .get(name)
            .ok_or_else(|| Error::ManifestMismatch(name.clone()))?;
        *digest = member.digest.clone();
    }

    // TODO: members missing from the manifest could be added with a fresh
    // digest once it is known whether the app accepts unlisted entries.
    if let Some(name) = staged.keys().find(|name| !manifest.md5.contains_key(*name)) {
        return Err(Error::UnlistedFile(name.clone()));
    }

    let manifest_bytes = manifest.to_bytes()?;

    let manifest_digest = format!("{:x}", md5::compute(&manifest_bytes));

    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));

    writer.start_file(manifest_name.as_str(), options)?;
    writer.write_all(&cipher::encrypt(&manifest_bytes)?)?;

    for (name, member) in &staged {
        writer.start_file(name.as_str(), options)?;
        writer.write_all(&member.encrypted)?;
    }

    writer.start_file(HASH_MEMBER, options)?;
    writer.write_all(manifest_digest.as_bytes())?;

    let container = writer.finish()?.into_inner();

    fs::write(output, container)?;

    tracing::info!(?output, members = staged.len() + 2, "encrypted backup");

    return Ok(());
}

fn member_name(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| Error::UnsafeMemberName(path.display().to_string()))?;

    let parts = relative
        .components()
        .map(|component| match component {
            Component::Normal(part) => Ok(part.to_string_lossy().into_owned()),
            _ => Err(Error::UnsafeMemberName(relative.display().to_string())),
        })
        .collect::<Result<Vec<String>>>()?;

    return Ok(parts.join("/"));
}

/// Writes each member to `target/<name>`, creating directories as needed
/// and overwriting existing files.
pub fn export_members(members: &BTreeMap<String, Vec<u8>>, target: &Path) -> Result<()> {
    fs::create_dir_all(target)?;

    for (name, data) in members {
        let path = member_path(target, name)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::debug!(?path, "writing member");

        fs::write(&path, data)?;
    }

    return Ok(());
}

fn member_path(target: &Path, name: &str) -> Result<PathBuf> {
    let relative = Path::new(name);

    let safe = relative.components().next().is_some()
        && relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));

    if !safe {
        return Err(Error::UnsafeMemberName(name.to_string()));
    }

    return Ok(target.join(relative));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_container(path: &Path, encrypted: &[(&str, &[u8])], verbatim: &[(&str, &[u8])]) {
        let mut writer = ZipWriter::new(File::create(path).unwrap());
        for (name, data) in encrypted {
            writer.start_file(*name, FileOptions::default()).unwrap();
            writer.write_all(&cipher::encrypt(data).unwrap()).unwrap();
        }
        for (name, data) in verbatim {
            writer.start_file(*name, FileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }

    fn raw_member(path: &Path, name: &str) -> Vec<u8> {
        let mut zip = ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut entry = zip.by_name(name).unwrap();
        let mut buffer = Vec::new();
        entry.read_to_end(&mut buffer).unwrap();
        buffer
    }

    fn write_tree(root: &Path, files: &[(&str, &[u8])]) {
        for (name, data) in files {
            let path = root.join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, data).unwrap();
        }
    }

    #[test]
    fn hash_member_is_the_only_failure() {
        let dir = tempfile::tempdir().unwrap();
        let backup = dir.path().join("backup.zip");
        write_container(
            &backup,
            &[(MANIFEST_MEMBER, b"{\"md5\":{}}"), ("DB_SONGS_LOG", b"sqlite bytes")],
            &[(HASH_MEMBER, b"0123456789abcdef0123456789abcdef")],
        );

        let archive = decrypt_archive(&backup).unwrap();

        assert_eq!(archive.members.len(), 2);
        assert_eq!(archive.members["DB_SONGS_LOG"], b"sqlite bytes");
        assert!(!archive.members.contains_key(HASH_MEMBER));
        assert_eq!(
            archive.failures,
            vec![DecryptFailure {
                name: HASH_MEMBER.to_string(),
                reason: FailureReason::Verbatim,
            }]
        );
    }

    #[test]
    fn plaintext_member_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let backup = dir.path().join("backup.zip");
        write_container(&backup, &[("a", b"alpha")], &[("notes.txt", b"plain text here")]);

        let archive = decrypt_archive(&backup).unwrap();

        assert_eq!(archive.members.keys().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(archive.failures[0].name, "notes.txt");
        assert_eq!(archive.failures[0].reason, FailureReason::Padding);
    }

    #[test]
    fn missing_container_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(decrypt_archive(&dir.path().join("nope.zip")), Err(Error::Io(_))));
    }

    #[test]
    fn corrupt_container_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let backup = dir.path().join("backup.zip");
        fs::write(&backup, b"not a zip at all").unwrap();
        assert!(matches!(decrypt_archive(&backup), Err(Error::Zip(_))));
    }

    #[test]
    fn oversized_header_length_is_not_trusted() {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::default().compression_method(CompressionMethod::Stored);
        writer.start_file("a", options).unwrap();
        writer.write_all(&cipher::encrypt(b"alpha").unwrap()).unwrap();
        let mut container = writer.finish().unwrap().into_inner();

        // claim ~2 GiB of uncompressed data in both the local and central headers
        for (signature, offset) in [([0x50u8, 0x4b, 0x03, 0x04], 22usize), ([0x50, 0x4b, 0x01, 0x02], 24)] {
            let start = container
                .windows(4)
                .position(|window| window == &signature[..])
                .unwrap();
            container[start + offset..start + offset + 4].copy_from_slice(&0x7fff_fff0u32.to_le_bytes());
        }

        let archive = decrypt_container(Cursor::new(container)).unwrap();

        assert_eq!(archive.members["a"], b"alpha");
    }

    #[test]
    fn encrypt_tree_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("export");
        let manifest = json!({
            "md5": { "DB_SONGS_LOG": "stale", "Lists/road.playlist": "stale" },
            "version": 7,
        });
        write_tree(
            &source,
            &[
                (MANIFEST_MEMBER, &serde_json::to_vec(&manifest).unwrap()),
                ("DB_SONGS_LOG", b"database"),
                ("Lists/road.playlist", b"{}"),
                (HASH_MEMBER, b"old hash"),
            ],
        );
        let backup = dir.path().join("backup.zip");

        encrypt_tree(&source, &backup).unwrap();

        let archive = decrypt_archive(&backup).unwrap();
        assert_eq!(archive.members["DB_SONGS_LOG"], b"database");
        assert_eq!(archive.members["Lists/road.playlist"], b"{}");

        let manifest_bytes = &archive.members[MANIFEST_MEMBER];
        let manifest = ManifestRecord::from_bytes(manifest_bytes).unwrap();
        assert_eq!(manifest.md5["DB_SONGS_LOG"], format!("{:x}", md5::compute(b"database")));
        assert_eq!(manifest.md5["Lists/road.playlist"], format!("{:x}", md5::compute(b"{}")));
        assert_eq!(manifest.other["version"], json!(7));

        let hash = raw_member(&backup, HASH_MEMBER);
        assert_eq!(hash, format!("{:x}", md5::compute(manifest_bytes)).into_bytes());
    }

    #[test]
    fn encrypt_tree_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("export");
        let manifest = json!({ "zeta": 1, "md5": { "a": "" }, "alpha": [1, 2] });
        write_tree(
            &source,
            &[(MANIFEST_MEMBER, &serde_json::to_vec(&manifest).unwrap()), ("a", b"content")],
        );

        let first = dir.path().join("first.zip");
        let second = dir.path().join("second.zip");
        encrypt_tree(&source, &first).unwrap();
        encrypt_tree(&source, &second).unwrap();

        assert_eq!(raw_member(&first, HASH_MEMBER), raw_member(&second, HASH_MEMBER));
    }

    #[test]
    fn missing_manifest_entry_aborts_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("export");
        let manifest = json!({ "md5": { "DB_SONGS_LOG": "", "Music/a.mp3": "" } });
        write_tree(
            &source,
            &[(MANIFEST_MEMBER, &serde_json::to_vec(&manifest).unwrap()), ("DB_SONGS_LOG", b"db")],
        );
        let backup = dir.path().join("backup.zip");

        let error = encrypt_tree(&source, &backup).unwrap_err();

        assert!(matches!(&error, Error::ManifestMismatch(name) if name == "Music/a.mp3"));
        assert!(!backup.exists());
    }

    #[test]
    fn unlisted_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("export");
        let manifest = json!({ "md5": { "DB_SONGS_LOG": "" } });
        write_tree(
            &source,
            &[
                (MANIFEST_MEMBER, &serde_json::to_vec(&manifest).unwrap()),
                ("DB_SONGS_LOG", b"db"),
                ("extra.playlist", b"{}"),
            ],
        );
        let backup = dir.path().join("backup.zip");

        let error = encrypt_tree(&source, &backup).unwrap_err();

        assert!(matches!(&error, Error::UnlistedFile(name) if name == "extra.playlist"));
        assert!(!backup.exists());
    }

    #[test]
    fn tree_without_manifest_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path(), &[("DB_SONGS_LOG", b"db")]);

        let error = encrypt_tree(dir.path(), &dir.path().join("out.zip")).unwrap_err();

        assert!(matches!(error, Error::MissingRequiredMember(name) if name == MANIFEST_MEMBER));
    }

    #[test]
    fn manifest_without_hash_table_is_a_record_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("export");
        write_tree(&source, &[(MANIFEST_MEMBER, b"{\"version\":1}")]);

        let error = encrypt_tree(&source, &dir.path().join("out.zip")).unwrap_err();

        assert!(matches!(error, Error::Record(_)));
    }

    #[test]
    fn export_writes_nested_members_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("DB_SONGS_LOG"), b"old").unwrap();

        let mut members = BTreeMap::new();
        members.insert("DB_SONGS_LOG".to_string(), b"new".to_vec());
        members.insert("Lists/a.playlist".to_string(), b"{}".to_vec());

        export_members(&members, &target).unwrap();

        assert_eq!(fs::read(target.join("DB_SONGS_LOG")).unwrap(), b"new");
        assert_eq!(fs::read(target.join("Lists").join("a.playlist")).unwrap(), b"{}");
    }

    #[test]
    fn export_rejects_escaping_names() {
        let dir = tempfile::tempdir().unwrap();

        for name in ["../evil", "/etc/passwd", ""] {
            let mut members = BTreeMap::new();
            members.insert(name.to_string(), Vec::new());
            assert!(
                matches!(export_members(&members, dir.path()), Err(Error::UnsafeMemberName(_))),
                "{name}"
            );
        }
    }
}
