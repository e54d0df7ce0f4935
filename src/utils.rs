// Copyright 2026 Magisk Boot Core Authors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    ffi::CString,
    fs::{self, create_dir, create_dir_all, read_link},
    os::unix::fs::{symlink, FileTypeExt, MetadataExt, PermissionsExt},
    path::Path,
};

use anyhow::{bail, Context, Result};
#[cfg(any(target_os = "linux", target_os = "android"))]
use extattr::{lgetxattr, lsetxattr, Flags as XattrFlags};
use rustix::{
    fs::{chown, Gid, Uid},
    mount::{mount, mount_bind, MountFlags},
};

const SELINUX_XATTR: &str = "security.selinux";

/// Filesystem attributes captured from a live path and restored onto a
/// synthesized one (tmpfs roots, skeleton placeholders, overlay files).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttr {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub context: Option<String>,
}

pub fn getattr<P: AsRef<Path>>(path: P) -> Result<FileAttr> {
    let path = path.as_ref();
    let metadata = path
        .symlink_metadata()
        .with_context(|| format!("stat {}", path.display()))?;
    Ok(FileAttr {
        mode: metadata.permissions().mode() & 0o777,
        uid: metadata.uid(),
        gid: metadata.gid(),
        context: lgetfilecon(path).ok(),
    })
}

pub fn setattr<P: AsRef<Path>>(path: P, attr: &FileAttr) -> Result<()> {
    let path = path.as_ref();
    fs::set_permissions(path, fs::Permissions::from_mode(attr.mode))
        .with_context(|| format!("chmod {}", path.display()))?;
    chown(
        path,
        Some(unsafe { Uid::from_raw(attr.uid) }),
        Some(unsafe { Gid::from_raw(attr.gid) }),
    )
    .with_context(|| format!("chown {}", path.display()))?;
    if let Some(con) = &attr.context {
        lsetfilecon(path, con)?;
    }
    Ok(())
}

pub fn clone_attr<S: AsRef<Path>, D: AsRef<Path>>(src: S, dst: D) -> Result<()> {
    let attr = getattr(src)?;
    setattr(dst, &attr)
}

pub fn lsetfilecon<P: AsRef<Path>>(path: P, con: &str) -> Result<()> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        if let Err(e) = lsetxattr(
            path.as_ref(),
            SELINUX_XATTR,
            con.as_bytes(),
            XattrFlags::empty(),
        ) {
            let io_err = std::io::Error::from(e);
            log::debug!(
                "lsetfilecon: {} -> {} failed: {}",
                path.as_ref().display(),
                con,
                io_err
            );
        }
    }
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn lgetfilecon<P: AsRef<Path>>(path: P) -> Result<String> {
    let con = lgetxattr(path.as_ref(), SELINUX_XATTR).with_context(|| {
        format!(
            "Failed to get SELinux context for {}",
            path.as_ref().display()
        )
    })?;
    let con_str = String::from_utf8_lossy(&con).trim_matches('\0').to_string();

    Ok(con_str)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn lgetfilecon<P: AsRef<Path>>(_path: P) -> Result<String> {
    bail!("no xattr support on this platform")
}

pub fn ensure_dir_exists<T: AsRef<Path>>(dir: T) -> Result<()> {
    if !dir.as_ref().exists() {
        create_dir_all(&dir)?;
    }
    Ok(())
}

pub fn bind_mount<S: AsRef<Path>, D: AsRef<Path>>(from: S, to: D) -> Result<()> {
    let from = from.as_ref();
    let to = to.as_ref();
    log::debug!("bind_mount: {} <- {}", to.display(), from.display());
    mount_bind(from, to)
        .with_context(|| format!("bind_mount {} <- {}", to.display(), from.display()))?;
    Ok(())
}

pub fn mount_tmpfs<P: AsRef<Path>>(target: P) -> Result<()> {
    let target = target.as_ref();
    log::debug!("mnt_tmpfs: {}", target.display());
    mount("tmpfs", target, "tmpfs", MountFlags::empty(), "")
        .with_context(|| format!("mount tmpfs on {}", target.display()))?;
    Ok(())
}

/// Whether `path` is currently a mount point.
pub fn is_mounted<P: AsRef<Path>>(path: P) -> bool {
    let path_str = path.as_ref().to_string_lossy();
    let search = path_str.trim_end_matches('/');

    if let Ok(process) = procfs::process::Process::myself() {
        if let Ok(mountinfo) = process.mountinfo() {
            return mountinfo
                .0
                .iter()
                .any(|m| m.mount_point.to_string_lossy() == search);
        }
    }

    if let Ok(content) = fs::read_to_string("/proc/mounts") {
        for line in content.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() > 1 && parts[1] == search {
                return true;
            }
        }
    }
    false
}

/// Clones a symlink, carrying its SELinux context along.
pub fn clone_symlink<S: AsRef<Path>, D: AsRef<Path>>(src: S, dst: D) -> Result<()> {
    let src = src.as_ref();
    let dst = dst.as_ref();
    let target = read_link(src)?;
    symlink(&target, dst)?;
    if let Ok(con) = lgetfilecon(src) {
        lsetfilecon(dst, &con)?;
    }
    Ok(())
}

fn make_device_node(path: &Path, mode: u32, rdev: u64) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_encoded_bytes())?;
    let dev = rdev as libc::dev_t;
    unsafe {
        if libc::mknod(c_path.as_ptr(), mode as libc::mode_t, dev) != 0 {
            let err = std::io::Error::last_os_error();
            bail!("mknod failed for {}: {}", path.display(), err);
        }
    }
    Ok(())
}

/// Archive copy: preserves type, mode, owner and SELinux context.
/// Symlinks are copied as symlinks, never followed.
pub fn copy_afc<S: AsRef<Path>, D: AsRef<Path>>(src: S, dst: D) -> Result<()> {
    let src = src.as_ref();
    let dst = dst.as_ref();

    let metadata = src
        .symlink_metadata()
        .with_context(|| format!("stat {}", src.display()))?;
    let ft = metadata.file_type();

    if ft.is_symlink() {
        if dst.symlink_metadata().is_ok() {
            fs::remove_file(dst)?;
        }
        clone_symlink(src, dst)?;
        return Ok(());
    }

    if ft.is_dir() {
        if !dst.exists() {
            create_dir(dst)?;
        }
        clone_attr(src, dst)?;
        for entry in fs::read_dir(src)?.flatten() {
            copy_afc(entry.path(), dst.join(entry.file_name()))?;
        }
        return Ok(());
    }

    if ft.is_char_device() || ft.is_block_device() || ft.is_fifo() {
        if dst.symlink_metadata().is_ok() {
            fs::remove_file(dst)?;
        }
        make_device_node(dst, metadata.permissions().mode(), metadata.rdev())?;
    } else {
        fs::copy(src, dst).with_context(|| format!("copy {}", src.display()))?;
    }
    clone_attr(src, dst)?;
    Ok(())
}

/// Mirrors a directory with hard links: directories are recreated, every
/// other entry is hard-linked. Both trees must live on one filesystem.
pub fn link_dir<S: AsRef<Path>, D: AsRef<Path>>(src: S, dst: D) -> Result<()> {
    let src = src.as_ref();
    let dst = dst.as_ref();
    for entry in fs::read_dir(src)?.flatten() {
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let ft = entry.file_type()?;
        if ft.is_dir() {
            if !to.exists() {
                create_dir(&to)?;
            }
            clone_attr(&from, &to)?;
            link_dir(&from, &to)?;
        } else {
            fs::hard_link(&from, &to)
                .with_context(|| format!("link {} <- {}", to.display(), from.display()))?;
        }
    }
    Ok(())
}

/// Recursive delete that tolerates the path being gone already.
pub fn rm_rf<P: AsRef<Path>>(path: P) {
    let path = path.as_ref();
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    if let Err(e) = result {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("rm_rf {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn attr_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        fs::write(&src, b"x").unwrap();
        fs::write(&dst, b"y").unwrap();
        fs::set_permissions(&src, fs::Permissions::from_mode(0o741)).unwrap();

        clone_attr(&src, &dst).unwrap();

        let a = getattr(&src).unwrap();
        let b = getattr(&dst).unwrap();
        assert_eq!(a.mode, 0o741);
        assert_eq!(a, b);
    }

    #[test]
    fn copy_afc_preserves_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("tree");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("sub/file"), b"data").unwrap();
        symlink("sub/file", src.join("link")).unwrap();

        let dst = tmp.path().join("copy");
        fs::create_dir(&dst).unwrap();
        copy_afc(&src, &dst).unwrap();

        assert_eq!(fs::read(dst.join("sub/file")).unwrap(), b"data");
        let link = dst.join("link");
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(read_link(&link).unwrap(), Path::new("sub/file"));
    }

    #[test]
    fn link_dir_mirrors_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("sbin");
        fs::create_dir_all(src.join("d")).unwrap();
        fs::write(src.join("tool"), b"elf").unwrap();
        fs::write(src.join("d/inner"), b"x").unwrap();

        let dst = tmp.path().join("root");
        fs::create_dir(&dst).unwrap();
        link_dir(&src, &dst).unwrap();

        assert!(dst.join("tool").exists());
        assert!(dst.join("d/inner").exists());
        // hard link, not a copy
        let a = fs::metadata(src.join("tool")).unwrap();
        let b = fs::metadata(dst.join("tool")).unwrap();
        assert_eq!(a.ino(), b.ino());
    }
}
