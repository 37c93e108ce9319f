//! Layer extraction.
//!
//! Applies a gzip-compressed tar layer onto a destination tree, observing
//! the whiteouts the OCI layer format specifies:
//! <https://github.com/opencontainers/image-spec/blob/master/layer.md>
//!
//! A layer is processed in three passes over the archive: directories and
//! whiteouts first, then regular files, then links. A single streaming pass
//! cannot satisfy the format - whiteouts may appear after the files they
//! target, hard links need their targets on disk before they can be
//! created, and directories may declare modes that would make writing
//! their own children impossible.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::os::unix::fs::{symlink, DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use lazy_static::lazy_static;
use regex::Regex;
use rootpull_core::{PullError, Result};
use tar::{Archive, Entry, EntryType};
use tokio_util::sync::CancellationToken;

lazy_static! {
    // relative paths that try to escape the destination directory
    static ref UNSAFE_PATH: Regex = Regex::new(r"/?\.\./").unwrap();
}

/// Directory modes recorded during extraction, keyed by the full
/// destination path.
///
/// Directory permissions are deferred until after all layers of a pull have
/// been written: a layer may declare a read-only directory before the
/// entries inside it arrive.
pub type DirModeMap = HashMap<PathBuf, u32>;

/// Extract one layer archive into `dst`.
///
/// Directory modes are recorded into `dirmodes` instead of being applied;
/// call [`apply_directory_modes`] once all layers have been extracted.
pub fn untar_layer(
    cancel: &CancellationToken,
    archive: &Path,
    dst: &Path,
    dirmodes: &mut DirModeMap,
) -> Result<()> {
    let mut file = File::open(archive).map_err(|e| PullError::fs("open", archive, e))?;

    // pre-process the archive: unsafe names, whiteouts, directory structure
    walk(cancel, GzDecoder::new(&mut file), |entry| {
        let name = entry_name(entry);

        // detect unsafe filenames and stop everything if found
        if UNSAFE_PATH.is_match(&name) {
            return Err(PullError::UnsafePath(name));
        }

        // apply whiteout files
        if is_whiteout(&name) {
            apply_whiteout(dst, &name)?;
        }

        // create the directory structure
        if entry.header().entry_type() == EntryType::Directory {
            let dir = dst.join(&name);

            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(&dir)
                .map_err(|e| PullError::fs("mkdir", &dir, e))?;

            // store the actual mode of the directory to set it later
            dirmodes.insert(dir, entry.header().mode()?);
        }

        Ok(())
    })?;

    reset(&mut file, archive)?;

    // create all regular files
    walk(cancel, GzDecoder::new(&mut file), |entry| {
        // skip anything but regular files
        if entry.header().entry_type() != EntryType::Regular {
            return Ok(());
        }

        let name = entry_name(entry);

        // skip whiteout files
        if is_whiteout(&name) {
            return Ok(());
        }

        // remove the file if it exists
        let file = dst.join(&name);
        if let Ok(info) = fs::metadata(&file) {
            if !info.is_dir() {
                fs::remove_file(&file).map_err(|e| PullError::fs("remove", &file, e))?;
            }
        }

        // copy the file
        let mode = entry.header().mode()?;
        let mut out = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(mode)
            .open(&file)
            .map_err(|e| PullError::fs("create", &file, e))?;

        std::io::copy(entry, &mut out).map_err(|e| PullError::fs("write", &file, e))?;

        Ok(())
    })?;

    reset(&mut file, archive)?;

    // create links
    walk(cancel, GzDecoder::new(&mut file), |entry| {
        // skip anything that isn't a link
        let kind = entry.header().entry_type();
        if kind != EntryType::Link && kind != EntryType::Symlink {
            return Ok(());
        }

        let name = entry_name(entry);
        let new = dst.join(&name);

        let linkname = match entry.link_name_bytes() {
            Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            None => {
                return Err(PullError::Decode {
                    what: name,
                    message: "link entry without a link name".to_string(),
                })
            }
        };

        // hard link targets starting with a dot or without any slash are
        // relative to the directory of the new link, everything else is
        // relative to the destination root
        let old = if linkname.starts_with('.') || !linkname.contains('/') {
            new.parent().unwrap_or(dst).join(&linkname)
        } else {
            dst.join(&linkname)
        };

        // remove the link if it exists
        if let Ok(info) = fs::symlink_metadata(&new) {
            if !info.is_dir() {
                fs::remove_file(&new).map_err(|e| PullError::fs("remove", &new, e))?;
            }
        }

        // create hard links with the resolved target
        if kind == EntryType::Link {
            fs::hard_link(&old, &new).map_err(|e| PullError::fs("link", &new, e))?;
            return Ok(());
        }

        // create symbolic links with the name verbatim
        symlink(Path::new(&linkname), &new).map_err(|e| PullError::fs("symlink", &new, e))?;

        Ok(())
    })
}

/// Apply the recorded directory permissions.
///
/// Directories with longer paths are processed first, so the permissions of
/// children are set before their parents possibly lose write permission.
pub fn apply_directory_modes(dirmodes: &DirModeMap) -> Result<()> {
    let mut order = Vec::with_capacity(dirmodes.len());

    for path in dirmodes.keys() {
        match fs::metadata(path) {
            // it's possible that certain paths do not exist anymore, if a
            // whiteout was applied in the process
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(PullError::fs("stat", path, e)),
            Ok(info) if !info.is_dir() => {
                return Err(PullError::fs(
                    "chmod",
                    path,
                    std::io::Error::new(ErrorKind::Other, "not a directory"),
                ))
            }
            Ok(_) => order.push(path.clone()),
        }
    }

    order.sort_by(|a, b| b.as_os_str().len().cmp(&a.as_os_str().len()));

    for path in order {
        let mode = dirmodes[&path];
        fs::set_permissions(&path, fs::Permissions::from_mode(mode))
            .map_err(|e| PullError::fs("chmod", &path, e))?;
    }

    Ok(())
}

/// Walk the tar entries of a gzip stream, checking for cancellation
/// between entries.
fn walk<R, F>(cancel: &CancellationToken, gz: R, mut handler: F) -> Result<()>
where
    R: Read,
    F: FnMut(&mut Entry<'_, R>) -> Result<()>,
{
    let mut archive = Archive::new(gz);

    for entry in archive.entries()? {
        if cancel.is_cancelled() {
            return Err(PullError::Interrupted);
        }

        let mut entry = entry?;
        handler(&mut entry)?;
    }

    Ok(())
}

/// Seek the layer file back to the start for the next pass.
fn reset(file: &mut File, archive: &Path) -> Result<()> {
    file.seek(SeekFrom::Start(0))
        .map_err(|e| PullError::fs("seek", archive, e))?;
    Ok(())
}

/// The raw entry name as a string.
fn entry_name<R: Read>(entry: &Entry<'_, R>) -> String {
    String::from_utf8_lossy(&entry.path_bytes()).into_owned()
}

/// True if the basename marks the entry as a whiteout.
fn is_whiteout(name: &str) -> bool {
    basename(name).starts_with(".wh.")
}

/// Apply a whiteout found at the given relative path.
fn apply_whiteout(dst: &Path, whiteout: &str) -> Result<()> {
    if whiteout.ends_with(".wh..wh..opq") {
        return apply_opaque_whiteout(dst, whiteout);
    }

    apply_simple_whiteout(dst, whiteout)
}

/// An opaque whiteout clears all siblings in the directory containing it.
fn apply_opaque_whiteout(dst: &Path, whiteout: &str) -> Result<()> {
    let base = dst.join(parent(whiteout));

    let entries = match fs::read_dir(&base) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(PullError::fs("read dir", &base, e)),
    };

    for entry in entries {
        let entry = entry.map_err(|e| PullError::fs("read dir", &base, e))?;
        remove_any(&entry.path())?;
    }

    Ok(())
}

/// A simple whiteout removes the sibling it names.
fn apply_simple_whiteout(dst: &Path, whiteout: &str) -> Result<()> {
    let target = dst.join(parent(whiteout)).join(&basename(whiteout)[4..]);
    remove_any(&target)
}

/// Remove a file or directory tree, tolerating absent targets.
fn remove_any(path: &Path) -> Result<()> {
    let info = match fs::symlink_metadata(path) {
        Ok(info) => info,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(PullError::fs("stat", path, e)),
    };

    let removed = if info.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    match removed {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PullError::fs("remove", path, e)),
    }
}

fn basename(name: &str) -> &str {
    name.trim_end_matches('/').rsplit('/').next().unwrap_or("")
}

fn parent(name: &str) -> &Path {
    Path::new(name.trim_end_matches('/'))
        .parent()
        .unwrap_or_else(|| Path::new(""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::TempDir;

    enum TestEntry<'a> {
        Dir(&'a str, u32),
        File(&'a str, &'a [u8]),
        FileWithMode(&'a str, &'a [u8], u32),
        HardLink { path: &'a str, target: &'a str },
        Symlink { path: &'a str, target: &'a str },
    }

    // Writes `name` into the header's raw name field without routing through
    // `Header::set_path`, which (since tar 0.4.46) refuses paths containing
    // `..` even when constructing a fixture that deliberately exercises the
    // archive-side path-traversal guard under test.
    fn set_raw_name(header: &mut tar::Header, name: &str) {
        let field = &mut header.as_old_mut().name;
        field.iter_mut().for_each(|b| *b = 0);
        let bytes = name.as_bytes();
        field[..bytes.len()].copy_from_slice(bytes);
    }

    fn create_test_layer(path: &Path, entries: &[TestEntry<'_>]) {
        let file = File::create(path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        for entry in entries {
            let mut header = tar::Header::new_gnu();

            match entry {
                TestEntry::Dir(name, mode) => {
                    header.set_entry_type(EntryType::Directory);
                    header.set_size(0);
                    header.set_mode(*mode);
                    header.set_cksum();
                    builder
                        .append_data(&mut header, name, std::io::empty())
                        .unwrap();
                }
                TestEntry::File(name, content) => {
                    header.set_size(content.len() as u64);
                    header.set_mode(0o644);
                    set_raw_name(&mut header, name);
                    header.set_cksum();
                    builder.append(&header, *content).unwrap();
                }
                TestEntry::FileWithMode(name, content, mode) => {
                    header.set_size(content.len() as u64);
                    header.set_mode(*mode);
                    header.set_cksum();
                    builder.append_data(&mut header, name, *content).unwrap();
                }
                TestEntry::HardLink { path, target } => {
                    header.set_entry_type(EntryType::Link);
                    header.set_size(0);
                    header.set_mode(0o644);
                    header.set_cksum();
                    builder.append_link(&mut header, path, target).unwrap();
                }
                TestEntry::Symlink { path, target } => {
                    header.set_entry_type(EntryType::Symlink);
                    header.set_size(0);
                    header.set_mode(0o777);
                    header.set_cksum();
                    builder.append_link(&mut header, path, target).unwrap();
                }
            }
        }

        builder.into_inner().unwrap().finish().unwrap();
    }

    fn extract(layers: &[&Path], dst: &Path) -> Result<()> {
        let cancel = CancellationToken::new();
        let mut dirmodes = DirModeMap::new();

        fs::create_dir_all(dst).unwrap();
        for layer in layers {
            untar_layer(&cancel, layer, dst, &mut dirmodes)?;
        }

        apply_directory_modes(&dirmodes)
    }

    #[test]
    fn test_extracts_files_and_directories() {
        let tmp = TempDir::new().unwrap();
        let layer = tmp.path().join("layer.tar.gz");
        let dst = tmp.path().join("dst");

        create_test_layer(
            &layer,
            &[
                TestEntry::Dir("etc/", 0o755),
                TestEntry::File("etc/hostname", b"box\n"),
                TestEntry::File("readme", b"hello"),
            ],
        );

        extract(&[&layer], &dst).unwrap();

        assert_eq!(fs::read_to_string(dst.join("etc/hostname")).unwrap(), "box\n");
        assert_eq!(fs::read_to_string(dst.join("readme")).unwrap(), "hello");
    }

    #[test]
    fn test_later_layer_overwrites_earlier_file() {
        let tmp = TempDir::new().unwrap();
        let one = tmp.path().join("one.tar.gz");
        let two = tmp.path().join("two.tar.gz");
        let dst = tmp.path().join("dst");

        create_test_layer(&one, &[TestEntry::File("motd", b"version 1")]);
        create_test_layer(&two, &[TestEntry::File("motd", b"version 2")]);

        extract(&[&one, &two], &dst).unwrap();

        assert_eq!(fs::read_to_string(dst.join("motd")).unwrap(), "version 2");
    }

    #[test]
    fn test_whiteout_removes_earlier_file() {
        let tmp = TempDir::new().unwrap();
        let one = tmp.path().join("one.tar.gz");
        let two = tmp.path().join("two.tar.gz");
        let dst = tmp.path().join("dst");

        create_test_layer(&one, &[TestEntry::File("a", b"gone"), TestEntry::File("b", b"kept")]);
        create_test_layer(&two, &[TestEntry::File(".wh.a", b"")]);

        extract(&[&one, &two], &dst).unwrap();

        assert!(!dst.join("a").exists());
        assert!(dst.join("b").exists());
    }

    #[test]
    fn test_whiteout_removes_directory_recursively() {
        let tmp = TempDir::new().unwrap();
        let one = tmp.path().join("one.tar.gz");
        let two = tmp.path().join("two.tar.gz");
        let dst = tmp.path().join("dst");

        create_test_layer(
            &one,
            &[
                TestEntry::Dir("opt/", 0o755),
                TestEntry::Dir("opt/tool/", 0o755),
                TestEntry::File("opt/tool/bin", b"x"),
            ],
        );
        create_test_layer(&two, &[TestEntry::File("opt/.wh.tool", b"")]);

        extract(&[&one, &two], &dst).unwrap();

        assert!(dst.join("opt").is_dir());
        assert!(!dst.join("opt/tool").exists());
    }

    #[test]
    fn test_opaque_whiteout_clears_directory() {
        let tmp = TempDir::new().unwrap();
        let one = tmp.path().join("one.tar.gz");
        let two = tmp.path().join("two.tar.gz");
        let dst = tmp.path().join("dst");

        create_test_layer(
            &one,
            &[
                TestEntry::Dir("data/", 0o755),
                TestEntry::File("data/old", b"x"),
                TestEntry::Dir("data/sub/", 0o755),
                TestEntry::File("data/sub/deep", b"y"),
            ],
        );
        create_test_layer(
            &two,
            &[
                TestEntry::File("data/.wh..wh..opq", b""),
                TestEntry::File("data/new", b"z"),
            ],
        );

        extract(&[&one, &two], &dst).unwrap();

        assert!(!dst.join("data/old").exists());
        assert!(!dst.join("data/sub").exists());
        assert_eq!(fs::read_to_string(dst.join("data/new")).unwrap(), "z");
    }

    #[test]
    fn test_whiteout_of_missing_target_is_a_noop() {
        let tmp = TempDir::new().unwrap();
        let layer = tmp.path().join("layer.tar.gz");
        let dst = tmp.path().join("dst");

        create_test_layer(&layer, &[TestEntry::File(".wh.never-existed", b"")]);

        extract(&[&layer], &dst).unwrap();
    }

    #[test]
    fn test_unsafe_path_is_refused() {
        let tmp = TempDir::new().unwrap();
        let layer = tmp.path().join("layer.tar.gz");
        let dst = tmp.path().join("dst");

        create_test_layer(&layer, &[TestEntry::File("../etc/passwd", b"root")]);

        let err = extract(&[&layer], &dst).unwrap_err();
        assert!(matches!(err, PullError::UnsafePath(_)), "got {err}");
        assert!(!tmp.path().join("etc/passwd").exists());
    }

    #[test]
    fn test_directory_modes_are_deferred() {
        let tmp = TempDir::new().unwrap();
        let layer = tmp.path().join("layer.tar.gz");
        let dst = tmp.path().join("dst");

        // a read-only directory declared before its contents
        create_test_layer(
            &layer,
            &[
                TestEntry::Dir("opt/", 0o500),
                TestEntry::File("opt/x", b"inside"),
            ],
        );

        extract(&[&layer], &dst).unwrap();

        assert!(dst.join("opt/x").exists());
        let mode = fs::metadata(dst.join("opt")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o500);

        // restore write permission so the tempdir can clean up
        fs::set_permissions(dst.join("opt"), fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_hard_link_target_is_sibling_relative() {
        let tmp = TempDir::new().unwrap();
        let layer = tmp.path().join("layer.tar.gz");
        let dst = tmp.path().join("dst");

        // linkname "a" has no slash, so it resolves next to b/c, not at the root
        create_test_layer(
            &layer,
            &[
                TestEntry::Dir("b/", 0o755),
                TestEntry::File("b/a", b"linked"),
                TestEntry::HardLink {
                    path: "b/c",
                    target: "a",
                },
            ],
        );

        extract(&[&layer], &dst).unwrap();

        assert_eq!(fs::read_to_string(dst.join("b/c")).unwrap(), "linked");
        assert!(!dst.join("a").exists());
    }

    #[test]
    fn test_hard_link_target_with_slash_is_root_relative() {
        let tmp = TempDir::new().unwrap();
        let layer = tmp.path().join("layer.tar.gz");
        let dst = tmp.path().join("dst");

        create_test_layer(
            &layer,
            &[
                TestEntry::Dir("bin/", 0o755),
                TestEntry::File("bin/sh", b"#!"),
                TestEntry::Dir("usr/", 0o755),
                TestEntry::HardLink {
                    path: "usr/sh",
                    target: "bin/sh",
                },
            ],
        );

        extract(&[&layer], &dst).unwrap();

        assert_eq!(fs::read_to_string(dst.join("usr/sh")).unwrap(), "#!");
    }

    #[test]
    fn test_symlink_target_is_kept_verbatim() {
        let tmp = TempDir::new().unwrap();
        let layer = tmp.path().join("layer.tar.gz");
        let dst = tmp.path().join("dst");

        create_test_layer(
            &layer,
            &[
                TestEntry::File("target", b"t"),
                TestEntry::Symlink {
                    path: "alias",
                    target: "./target",
                },
            ],
        );

        extract(&[&layer], &dst).unwrap();

        let link = fs::read_link(dst.join("alias")).unwrap();
        assert_eq!(link, PathBuf::from("./target"));
    }

    #[test]
    fn test_link_replaces_existing_file() {
        let tmp = TempDir::new().unwrap();
        let one = tmp.path().join("one.tar.gz");
        let two = tmp.path().join("two.tar.gz");
        let dst = tmp.path().join("dst");

        create_test_layer(&one, &[TestEntry::File("alias", b"plain file")]);
        create_test_layer(
            &two,
            &[
                TestEntry::File("target", b"t"),
                TestEntry::Symlink {
                    path: "alias",
                    target: "target",
                },
            ],
        );

        extract(&[&one, &two], &dst).unwrap();

        assert!(fs::symlink_metadata(dst.join("alias")).unwrap().is_symlink());
    }

    #[test]
    fn test_cancellation_interrupts_the_walk() {
        let tmp = TempDir::new().unwrap();
        let layer = tmp.path().join("layer.tar.gz");
        let dst = tmp.path().join("dst");

        create_test_layer(&layer, &[TestEntry::File("a", b"x")]);
        fs::create_dir_all(&dst).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut dirmodes = DirModeMap::new();
        let err = untar_layer(&cancel, &layer, &dst, &mut dirmodes).unwrap_err();
        assert!(matches!(err, PullError::Interrupted));
    }

    #[test]
    fn test_vanished_directory_is_skipped_when_applying_modes() {
        let tmp = TempDir::new().unwrap();

        let mut dirmodes = DirModeMap::new();
        dirmodes.insert(tmp.path().join("never-created"), 0o700);

        apply_directory_modes(&dirmodes).unwrap();
    }

    #[test]
    fn test_mode_target_that_is_a_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("file");
        fs::write(&path, "not a directory").unwrap();

        let mut dirmodes = DirModeMap::new();
        dirmodes.insert(path, 0o700);

        assert!(apply_directory_modes(&dirmodes).is_err());
    }
}
