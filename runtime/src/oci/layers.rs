//! OCI layer extraction.
//!
//! Applies one layer (a possibly gzip-compressed tar stream) onto a staging
//! directory: later entries replace earlier ones, directories merge, and
//! whiteouts delete content contributed by lower layers.
//!
//! Every write goes to a path resolved inside the target directory.
//! Symlinked parents are followed the way they would be inside the guest
//! (absolute link targets are re-rooted at the target, `..` stops at it), so
//! no entry can reach the host filesystem through a link planted by an
//! earlier entry.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::ffi::OsString;
use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use ocifs_core::error::{Result, RootfsError};
use tar::{Archive, EntryType};

pub const OCI_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Marker that empties the directory it appears in.
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";
const WHITEOUT_PREFIX: &str = ".wh.";

/// Symlink hops allowed while resolving one path.
const MAX_SYMLINK_HOPS: usize = 40;

/// Compression of a layer blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerCompression {
    Gzip,
    Uncompressed,
}

impl LayerCompression {
    /// Map a layer media type. Unknown or unsupported compressions
    /// (e.g. zstd) are an error rather than a silently skipped layer.
    pub fn from_media_type(media_type: &str) -> Result<Self> {
        if media_type.is_empty()
            || media_type.ends_with("+gzip")
            || media_type.ends_with(".tar.gzip")
        {
            Ok(LayerCompression::Gzip)
        } else if media_type.ends_with(".tar") || media_type.ends_with("v1.tar") {
            Ok(LayerCompression::Uncompressed)
        } else {
            Err(RootfsError::ArchiveRead(format!(
                "unsupported layer media type: {}",
                media_type
            )))
        }
    }
}

/// What applying one layer did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerStats {
    pub files: u64,
    pub directories: u64,
    pub symlinks: u64,
    pub hardlinks: u64,
    pub whiteouts: u64,
    /// Device nodes, unsafe paths and unsupported entry types
    pub skipped: u64,
    /// Declared modes of directories, applied once staging is complete.
    /// Keys are relative to the target directory.
    pub directory_modes: BTreeMap<PathBuf, u32>,
}

/// Extract a gzip-compressed tar layer into `target_dir`.
pub fn extract_layer<R: Read>(reader: R, target_dir: &Path) -> Result<LayerStats> {
    let mut decoder = GzDecoder::new(reader);
    let stats = apply_tar(&mut decoder, target_dir)?;
    // Read through the gzip trailer and whatever follows so that stream
    // level checks (digest, size) run before the layer counts as applied.
    drain(&mut decoder)?;
    drain(&mut decoder.into_inner())?;
    Ok(stats)
}

/// Extract a layer whose compression is given by `media_type`.
pub fn extract_layer_as<R: Read>(
    reader: R,
    target_dir: &Path,
    media_type: &str,
) -> Result<LayerStats> {
    match LayerCompression::from_media_type(media_type)? {
        LayerCompression::Gzip => extract_layer(reader, target_dir),
        LayerCompression::Uncompressed => {
            let mut reader = reader;
            let stats = apply_tar(&mut reader, target_dir)?;
            drain(&mut reader)?;
            Ok(stats)
        }
    }
}

/// True when `name` is exactly one plain path component.
fn is_single_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Apply an uncompressed tar stream onto `target_dir`.
pub fn apply_tar<R: Read>(reader: R, target_dir: &Path) -> Result<LayerStats> {
    fs::create_dir_all(target_dir).map_err(|e| {
        RootfsError::ExtractionIo(format!(
            "failed to create target directory {}: {}",
            target_dir.display(),
            e
        ))
    })?;
    let root = fs::canonicalize(target_dir).map_err(extraction_io)?;

    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);

    let mut stats = LayerStats::default();
    // Paths written by this layer survive an opaque whiteout in the same layer.
    let mut written: HashSet<PathBuf> = HashSet::new();

    for entry in archive.entries().map_err(archive_io)? {
        let mut entry = entry.map_err(archive_io)?;
        let raw_path = entry.path().map_err(archive_io)?.into_owned();

        let Some(rel) = sanitize(&raw_path) else {
            tracing::warn!(path = %raw_path.display(), "Skipping entry with unsafe path");
            stats.skipped += 1;
            continue;
        };
        let Some(file_name) = rel.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            // The archive root itself.
            continue;
        };
        let parent_rel = rel.parent().unwrap_or_else(|| Path::new(""));

        if file_name == OPAQUE_WHITEOUT {
            let dir = resolve_in_root(&root, parent_rel)?;
            clear_directory(&root, &dir, &written)?;
            stats.whiteouts += 1;
            continue;
        }
        if let Some(name) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            if !is_single_name(name) {
                tracing::warn!(path = %raw_path.display(), "Skipping whiteout with unsafe name");
                stats.skipped += 1;
                continue;
            }
            let victim = resolve_in_root(&root, parent_rel)?.join(name);
            remove_path(&victim)?;
            stats.whiteouts += 1;
            continue;
        }

        let entry_type = entry.header().entry_type();
        let parent = resolve_in_root(&root, parent_rel)?;
        let dest = parent.join(&file_name);

        match entry_type {
            EntryType::Directory => {
                let mode = entry.header().mode().map_err(archive_io)? & 0o7777;
                ensure_directory(&parent)?;
                if let Ok(meta) = fs::symlink_metadata(&dest) {
                    if !meta.is_dir() {
                        remove_path(&dest)?;
                    }
                }
                fs::create_dir_all(&dest).map_err(extraction_io)?;
                fs::set_permissions(&dest, fs::Permissions::from_mode(mode | 0o700))
                    .map_err(extraction_io)?;
                let key = dest.strip_prefix(&root).unwrap_or(&rel).to_path_buf();
                stats.directory_modes.insert(key, mode);
                stats.directories += 1;
            }
            EntryType::Regular
            | EntryType::Continuous
            | EntryType::GNUSparse
            | EntryType::Symlink => {
                ensure_directory(&parent)?;
                replace_existing(&dest)?;
                entry.unpack(&dest).map_err(classify_io)?;
                if entry_type == EntryType::Symlink {
                    stats.symlinks += 1;
                } else {
                    stats.files += 1;
                }
            }
            EntryType::Fifo => {
                let mode = entry.header().mode().map_err(archive_io)? & 0o7777;
                ensure_directory(&parent)?;
                replace_existing(&dest)?;
                make_fifo(&dest, mode).map_err(extraction_io)?;
                stats.files += 1;
            }
            EntryType::Link => {
                let Some(link_name) = entry.link_name().map_err(archive_io)? else {
                    return Err(RootfsError::ArchiveRead(format!(
                        "hard link {} has no target",
                        raw_path.display()
                    )));
                };
                let Some(link_rel) = sanitize(&link_name) else {
                    tracing::warn!(
                        path = %raw_path.display(),
                        target = %link_name.display(),
                        "Skipping hard link with unsafe target"
                    );
                    stats.skipped += 1;
                    continue;
                };
                let source = match (link_rel.parent(), link_rel.file_name()) {
                    (Some(dir), Some(name)) => resolve_in_root(&root, dir)?.join(name),
                    _ => root.clone(),
                };
                ensure_directory(&parent)?;
                replace_existing(&dest)?;
                fs::hard_link(&source, &dest).map_err(|e| {
                    RootfsError::ExtractionIo(format!(
                        "failed to link {} -> {}: {}",
                        rel.display(),
                        link_rel.display(),
                        e
                    ))
                })?;
                stats.hardlinks += 1;
            }
            EntryType::Char | EntryType::Block => {
                tracing::debug!(path = %rel.display(), "Skipping device node");
                stats.skipped += 1;
                continue;
            }
            other => {
                tracing::debug!(path = %rel.display(), entry_type = ?other, "Skipping entry");
                stats.skipped += 1;
                continue;
            }
        }
        written.insert(dest.strip_prefix(&root).unwrap_or(&rel).to_path_buf());
    }

    Ok(stats)
}

/// Re-root an archive path: drop `/` and `.`, refuse `..`.
/// Returns `None` for paths that try to climb.
fn sanitize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

enum Part {
    Up,
    Name(OsString),
}

fn parts_of(path: &Path) -> impl Iterator<Item = Part> + '_ {
    path.components().filter_map(|c| match c {
        Component::Normal(name) => Some(Part::Name(name.to_os_string())),
        Component::ParentDir => Some(Part::Up),
        _ => None,
    })
}

/// Resolve `rel` below `root`, following symlinks as if `root` were `/`.
///
/// The result always lies under `root`. Missing components are kept
/// verbatim; they will be created as plain directories.
pub(crate) fn resolve_in_root(root: &Path, rel: &Path) -> Result<PathBuf> {
    let mut resolved = PathBuf::new();
    let mut pending: VecDeque<Part> = parts_of(rel).collect();
    let mut hops = 0;

    while let Some(part) = pending.pop_front() {
        let name = match part {
            Part::Up => {
                resolved.pop();
                continue;
            }
            Part::Name(name) => name,
        };
        let candidate = resolved.join(&name);
        let on_disk = root.join(&candidate);
        match fs::symlink_metadata(&on_disk) {
            Ok(meta) if meta.file_type().is_symlink() => {
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return Err(RootfsError::ArchiveRead(format!(
                        "too many levels of symbolic links below {}",
                        rel.display()
                    )));
                }
                let target = fs::read_link(&on_disk).map_err(extraction_io)?;
                if target.is_absolute() {
                    resolved = PathBuf::new();
                }
                let mut expanded: Vec<Part> = parts_of(&target).collect();
                while let Some(p) = expanded.pop() {
                    pending.push_front(p);
                }
            }
            _ => resolved = candidate,
        }
    }

    Ok(root.join(resolved))
}

fn ensure_directory(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| {
        RootfsError::ExtractionIo(format!("failed to create {}: {}", dir.display(), e))
    })
}

/// Clear whatever sits at `dest` so a non-directory entry never writes
/// through an existing link or into an existing directory.
fn replace_existing(dest: &Path) -> Result<()> {
    if fs::symlink_metadata(dest).is_ok() {
        remove_path(dest)?;
    }
    Ok(())
}

fn make_fifo(dest: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::ffi::OsStrExt;

    let path = std::ffi::CString::new(dest.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    // SAFETY: `path` is a valid NUL-terminated C string.
    let rc = unsafe { libc::mkfifo(path.as_ptr(), 0o600) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    fs::set_permissions(dest, fs::Permissions::from_mode(mode))
}

fn remove_path(path: &Path) -> Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => Err(e),
    };
    result.map_err(|e| {
        RootfsError::ExtractionIo(format!("failed to remove {}: {}", path.display(), e))
    })
}

/// Empty `dir`, keeping entries this layer already wrote.
fn clear_directory(root: &Path, dir: &Path, keep: &HashSet<PathBuf>) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(extraction_io(e)),
    };
    for entry in entries {
        let path = entry.map_err(extraction_io)?.path();
        let rel = path.strip_prefix(root).unwrap_or(&path);
        if !keep.contains(rel) {
            remove_path(&path)?;
        }
    }
    Ok(())
}

fn drain<R: Read>(reader: &mut R) -> Result<()> {
    io::copy(reader, &mut io::sink()).map_err(classify_io)?;
    Ok(())
}

/// Errors from the archive framing itself.
fn archive_io(e: io::Error) -> RootfsError {
    match e.kind() {
        io::ErrorKind::TimedOut => RootfsError::Timeout(e.to_string()),
        _ => RootfsError::ArchiveRead(e.to_string()),
    }
}

fn extraction_io(e: io::Error) -> RootfsError {
    RootfsError::ExtractionIo(e.to_string())
}

/// Errors that may come from either side of an entry copy: a corrupt
/// stream surfaces as data errors, everything else is the filesystem.
fn classify_io(e: io::Error) -> RootfsError {
    match e.kind() {
        io::ErrorKind::InvalidData
        | io::ErrorKind::InvalidInput
        | io::ErrorKind::UnexpectedEof => RootfsError::ArchiveRead(e.to_string()),
        io::ErrorKind::TimedOut => RootfsError::Timeout(e.to_string()),
        _ => RootfsError::ExtractionIo(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{noise, targz_layer, LayerBuilder};
    use std::os::unix::fs::FileTypeExt;
    use tempfile::TempDir;

    fn apply(target: &Path, layer: Vec<u8>) -> LayerStats {
        extract_layer(&layer[..], target).unwrap()
    }

    #[test]
    fn test_extract_creates_target_directory() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("extracted");
        apply(&target, targz_layer(&[("test.txt", b"hello")]));
        assert!(target.is_dir());
        assert_eq!(fs::read_to_string(target.join("test.txt")).unwrap(), "hello");
    }

    #[test]
    fn test_nested_files_get_parents() {
        let temp = TempDir::new().unwrap();
        let stats = apply(
            temp.path(),
            targz_layer(&[("file1.txt", b"content1"), ("dir/sub/file2.txt", b"content2")]),
        );
        assert_eq!(stats.files, 2);
        assert_eq!(
            fs::read_to_string(temp.path().join("dir/sub/file2.txt")).unwrap(),
            "content2"
        );
    }

    #[test]
    fn test_later_layer_wins() {
        let temp = TempDir::new().unwrap();
        apply(temp.path(), targz_layer(&[("etc/motd", b"version 1")]));
        apply(temp.path(), targz_layer(&[("etc/motd", b"version 2")]));
        assert_eq!(
            fs::read_to_string(temp.path().join("etc/motd")).unwrap(),
            "version 2"
        );
    }

    #[test]
    fn test_directories_union() {
        let temp = TempDir::new().unwrap();
        apply(
            temp.path(),
            LayerBuilder::new().dir("usr/bin", 0o755).file("usr/bin/a", b"a", 0o755).gzip(),
        );
        apply(
            temp.path(),
            LayerBuilder::new().dir("usr/bin", 0o755).file("usr/bin/b", b"b", 0o755).gzip(),
        );
        assert!(temp.path().join("usr/bin/a").exists());
        assert!(temp.path().join("usr/bin/b").exists());
    }

    #[test]
    fn test_file_modes_preserved() {
        let temp = TempDir::new().unwrap();
        apply(
            temp.path(),
            LayerBuilder::new()
                .file("bin/tool", b"#!/bin/sh\n", 0o755)
                .file("etc/shadow", b"root:*", 0o640)
                .gzip(),
        );
        let mode = |p: &str| fs::metadata(temp.path().join(p)).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode("bin/tool"), 0o755);
        assert_eq!(mode("etc/shadow"), 0o640);
    }

    #[test]
    fn test_directory_mode_deferred() {
        let temp = TempDir::new().unwrap();
        let stats = apply(
            temp.path(),
            LayerBuilder::new().dir("ro", 0o555).file("ro/file", b"x", 0o644).gzip(),
        );
        assert_eq!(stats.directory_modes.get(Path::new("ro")), Some(&0o555));
        // Still writable while staging.
        let mode = fs::metadata(temp.path().join("ro")).unwrap().permissions().mode();
        assert_eq!(mode & 0o700, 0o700);
        apply(temp.path(), targz_layer(&[("ro/later", b"y")]));
        assert!(temp.path().join("ro/later").exists());
    }

    #[test]
    fn test_parent_traversal_skipped() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("rootfs");
        let layer = LayerBuilder::new()
            .raw_file("../escape.txt", b"evil")
            .raw_file("ok/../../escape2.txt", b"evil")
            .file("safe.txt", b"ok", 0o644)
            .gzip();
        let stats = apply(&target, layer);
        assert_eq!(stats.skipped, 2);
        assert!(!temp.path().join("escape.txt").exists());
        assert!(!temp.path().join("escape2.txt").exists());
        assert!(target.join("safe.txt").exists());
    }

    #[test]
    fn test_whiteout_cannot_name_parent_or_self() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("rootfs");
        fs::write(temp.path().join("precious"), b"keep").unwrap();
        apply(&target, LayerBuilder::new().file("etc/keep", b"1", 0o644).gzip());

        let layer = LayerBuilder::new()
            .raw_file(".wh...", b"")
            .raw_file("etc/.wh..", b"")
            .raw_file("etc/.wh.", b"")
            .gzip();
        let stats = apply(&target, layer);

        assert_eq!(stats.skipped, 3);
        assert_eq!(stats.whiteouts, 0);
        assert!(temp.path().join("precious").exists());
        assert!(target.join("etc/keep").exists());
    }

    #[test]
    fn test_is_single_name() {
        assert!(is_single_name("passwd"));
        assert!(is_single_name("..hidden"));
        assert!(!is_single_name(""));
        assert!(!is_single_name("."));
        assert!(!is_single_name(".."));
        assert!(!is_single_name("a/b"));
        assert!(!is_single_name("/abs"));
    }

    #[test]
    fn test_absolute_paths_rerooted() {
        let temp = TempDir::new().unwrap();
        let layer = LayerBuilder::new().raw_file("/etc/hostname", b"box").gzip();
        apply(temp.path(), layer);
        assert_eq!(
            fs::read_to_string(temp.path().join("etc/hostname")).unwrap(),
            "box"
        );
    }

    #[test]
    fn test_symlinked_parent_stays_inside_target() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("rootfs");
        let outside = temp.path().join("outside");
        fs::create_dir_all(&outside).unwrap();

        // Layer 1 plants an absolute symlink, layer 2 writes through it.
        apply(
            &target,
            LayerBuilder::new()
                .symlink("var/run", outside.to_str().unwrap())
                .symlink("lib", "usr/lib")
                .dir("usr/lib", 0o755)
                .gzip(),
        );
        apply(
            &target,
            LayerBuilder::new()
                .file("var/run/pid", b"1", 0o644)
                .file("lib/libc.so", b"elf", 0o755)
                .gzip(),
        );

        assert_eq!(fs::read_dir(&outside).unwrap().count(), 0);
        let rerooted = target.join(outside.strip_prefix("/").unwrap()).join("pid");
        assert!(rerooted.exists());
        assert!(target.join("usr/lib/libc.so").exists());
    }

    #[test]
    fn test_symlinks_and_hardlinks() {
        let temp = TempDir::new().unwrap();
        let stats = apply(
            temp.path(),
            LayerBuilder::new()
                .file("bin/busybox", b"bb", 0o755)
                .symlink("bin/sh", "/bin/busybox")
                .hardlink("bin/ls", "bin/busybox")
                .gzip(),
        );
        assert_eq!(stats.symlinks, 1);
        assert_eq!(stats.hardlinks, 1);
        assert_eq!(
            fs::read_link(temp.path().join("bin/sh")).unwrap(),
            PathBuf::from("/bin/busybox")
        );
        assert_eq!(fs::read(temp.path().join("bin/ls")).unwrap(), b"bb");
    }

    #[test]
    fn test_file_replaces_symlink_without_following() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("rootfs");
        let victim = temp.path().join("victim");
        fs::write(&victim, b"original").unwrap();

        apply(
            &target,
            LayerBuilder::new().symlink("etc/passwd", victim.to_str().unwrap()).gzip(),
        );
        apply(&target, targz_layer(&[("etc/passwd", b"root:x:0:0")]));

        assert_eq!(fs::read(&victim).unwrap(), b"original");
        assert_eq!(fs::read(target.join("etc/passwd")).unwrap(), b"root:x:0:0");
    }

    #[test]
    fn test_whiteout_removes_lower_entry() {
        let temp = TempDir::new().unwrap();
        apply(
            temp.path(),
            targz_layer(&[("etc/keep", b"k"), ("etc/remove", b"r"), ("opt/tree/x", b"x")]),
        );
        let stats = apply(
            temp.path(),
            LayerBuilder::new()
                .file("etc/.wh.remove", b"", 0o644)
                .file("opt/.wh.tree", b"", 0o644)
                .gzip(),
        );
        assert_eq!(stats.whiteouts, 2);
        assert!(temp.path().join("etc/keep").exists());
        assert!(!temp.path().join("etc/remove").exists());
        assert!(!temp.path().join("etc/.wh.remove").exists());
        assert!(!temp.path().join("opt/tree").exists());
    }

    #[test]
    fn test_opaque_whiteout_clears_lower_contents() {
        let temp = TempDir::new().unwrap();
        apply(temp.path(), targz_layer(&[("app/old1", b"1"), ("app/old2", b"2")]));
        apply(
            temp.path(),
            LayerBuilder::new()
                .dir("app", 0o755)
                .file("app/new", b"n", 0o644)
                .file("app/.wh..wh..opq", b"", 0o644)
                .gzip(),
        );
        let names: Vec<_> = fs::read_dir(temp.path().join("app"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![OsString::from("new")]);
    }

    #[test]
    fn test_fifo_created_and_devices_skipped() {
        let temp = TempDir::new().unwrap();
        let stats = apply(
            temp.path(),
            LayerBuilder::new()
                .special("run/pipe", EntryType::Fifo)
                .special("dev/null", EntryType::Char)
                .gzip(),
        );
        assert_eq!(stats.skipped, 1);
        let meta = fs::symlink_metadata(temp.path().join("run/pipe")).unwrap();
        assert!(meta.file_type().is_fifo());
        assert!(!temp.path().join("dev/null").exists());
    }

    #[test]
    fn test_uncompressed_layer() {
        let temp = TempDir::new().unwrap();
        let tar = LayerBuilder::new().file("plain.txt", b"p", 0o644).tar();
        extract_layer_as(&tar[..], temp.path(), OCI_LAYER_TAR).unwrap();
        assert!(temp.path().join("plain.txt").exists());
    }

    #[test]
    fn test_unsupported_media_type() {
        let temp = TempDir::new().unwrap();
        let err = extract_layer_as(
            &b""[..],
            temp.path(),
            "application/vnd.oci.image.layer.v1.tar+zstd",
        )
        .unwrap_err();
        assert!(matches!(err, RootfsError::ArchiveRead(_)));
    }

    #[test]
    fn test_corrupt_gzip_is_archive_error() {
        let temp = TempDir::new().unwrap();
        // Incompressible content so the cut lands inside the entry data.
        let data = noise(64 * 1024);
        let mut layer = LayerBuilder::new().file("blob", &data, 0o644).gzip();
        layer.truncate(layer.len() / 2);
        let err = extract_layer(&layer[..], temp.path()).unwrap_err();
        assert!(matches!(err, RootfsError::ArchiveRead(_)), "{err:?}");

        let err = extract_layer(&b"definitely not gzip"[..], temp.path()).unwrap_err();
        assert!(matches!(err, RootfsError::ArchiveRead(_)), "{err:?}");
    }

    #[test]
    fn test_compression_from_media_type() {
        assert_eq!(
            LayerCompression::from_media_type(OCI_LAYER_GZIP).unwrap(),
            LayerCompression::Gzip
        );
        assert_eq!(
            LayerCompression::from_media_type(DOCKER_LAYER_GZIP).unwrap(),
            LayerCompression::Gzip
        );
        assert_eq!(
            LayerCompression::from_media_type(OCI_LAYER_TAR).unwrap(),
            LayerCompression::Uncompressed
        );
        assert!(LayerCompression::from_media_type("text/plain").is_err());
    }

    #[test]
    fn test_resolve_in_root_clamps_parent_dirs() {
        let temp = TempDir::new().unwrap();
        let root = fs::canonicalize(temp.path()).unwrap();
        fs::create_dir_all(root.join("a")).unwrap();
        std::os::unix::fs::symlink("../../../..", root.join("a/up")).unwrap();
        let resolved = resolve_in_root(&root, Path::new("a/up/etc")).unwrap();
        assert_eq!(resolved, root.join("etc"));
    }

    #[test]
    fn test_symlink_loop_detected() {
        let temp = TempDir::new().unwrap();
        let root = fs::canonicalize(temp.path()).unwrap();
        std::os::unix::fs::symlink("b", root.join("a")).unwrap();
        std::os::unix::fs::symlink("a", root.join("b")).unwrap();
        assert!(resolve_in_root(&root, Path::new("a/x")).is_err());
    }
}
