// Copyright 2026 Magisk Boot Core Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Module image preparation: merge pending images into the main image,
//! create it when absent, loop-mount it, and trim it back after the
//! module pass. Filesystem tooling is consumed as an external capability
//! (e2fsck / mke2fs / resize2fs / losetup on PATH).

use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use rustix::mount::{unmount, UnmountFlags};

use crate::utils::{copy_afc, ensure_dir_exists, rm_rf};

fn log_lines(bytes: &[u8]) {
    let s = String::from_utf8_lossy(bytes);
    for line in s.lines() {
        if !line.trim().is_empty() {
            log::debug!("{}", line);
        }
    }
}

fn fsck(image: &Path) -> Result<()> {
    let output = Command::new("e2fsck")
        .args(["-yf"])
        .arg(image)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("Failed to execute e2fsck")?;
    log_lines(&output.stdout);
    log_lines(&output.stderr);
    // 0 = clean, 1/2 = repaired; anything above is a real failure
    if let Some(code) = output.status.code() {
        if code > 2 {
            bail!("e2fsck failed with exit code {code}");
        }
    }
    Ok(())
}

/// Merges every top-level module directory of `src` into `dst`, replacing
/// same-named modules wholesale. `src` is consumed. A missing `src` is a
/// no-op; a missing `dst` turns the merge into a rename.
pub fn merge_img<S: AsRef<Path>, D: AsRef<Path>>(src: S, dst: D, scratch: &Path) -> Result<()> {
    let src = src.as_ref();
    let dst = dst.as_ref();
    if !src.exists() {
        return Ok(());
    }
    log::info!("* Merging {} -> {}", src.display(), dst.display());
    fsck(src)?;
    if !dst.exists() {
        fs::rename(src, dst).or_else(|_| -> Result<()> {
            // cross-device: fall back to copy + unlink
            fs::copy(src, dst).with_context(|| format!("copy {}", src.display()))?;
            fs::remove_file(src)?;
            Ok(())
        })?;
        return Ok(());
    }

    let src_mnt = scratch.join("merge_src");
    let dst_mnt = scratch.join("merge_dst");
    let src_loop = mount_img(src, &src_mnt)?;
    let dst_loop = match mount_img(dst, &dst_mnt) {
        Ok(l) => l,
        Err(e) => {
            let _ = unmount(&src_mnt, UnmountFlags::DETACH);
            detach_loop(&src_loop);
            return Err(e);
        }
    };

    let mut result = Ok(());
    match fs::read_dir(&src_mnt) {
        Ok(entries) => {
            for entry in entries.flatten() {
                let name = entry.file_name();
                if name.to_string_lossy() == "lost+found" {
                    continue;
                }
                let target = dst_mnt.join(&name);
                rm_rf(&target);
                if let Err(e) = copy_afc(entry.path(), &target) {
                    result = Err(e).with_context(|| {
                        format!("merge module {}", name.to_string_lossy())
                    });
                    break;
                }
            }
        }
        Err(e) => result = Err(e.into()),
    }

    let _ = unmount(&src_mnt, UnmountFlags::DETACH);
    let _ = unmount(&dst_mnt, UnmountFlags::DETACH);
    detach_loop(&src_loop);
    detach_loop(&dst_loop);
    result?;

    fs::remove_file(src).with_context(|| format!("unlink {}", src.display()))?;
    Ok(())
}

/// Creates an empty ext4 image of `size_mb` megabytes.
pub fn create_img<P: AsRef<Path>>(path: P, size_mb: u32) -> Result<()> {
    let path = path.as_ref();
    log::info!("* Creating {} ({size_mb} MB)", path.display());
    if let Some(parent) = path.parent() {
        ensure_dir_exists(parent)?;
    }

    let size = format!("{size_mb}M");
    let status = Command::new("make_ext4fs")
        .args(["-l", &size, "-a", "/data", "-S", "/dev/null"])
        .arg(path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    let made = matches!(status, Ok(s) if s.success());
    if !made {
        // emulators and older tooling only ship mke2fs
        let output = Command::new("mke2fs")
            .args(["-t", "ext4", "-q"])
            .arg(path)
            .arg(format!("{}", u64::from(size_mb) * 1024))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .context("Failed to execute mke2fs")?;
        log_lines(&output.stderr);
        if !output.status.success() {
            bail!("mke2fs failed for {}", path.display());
        }
    }
    Ok(())
}

/// Loop-mounts `image` at `mountpoint` and returns the loop device name.
pub fn mount_img<P: AsRef<Path>, M: AsRef<Path>>(image: P, mountpoint: M) -> Result<String> {
    let image = image.as_ref();
    let mountpoint = mountpoint.as_ref();
    ensure_dir_exists(mountpoint)?;

    let output = Command::new("losetup")
        .args(["-f", "--show"])
        .arg(image)
        .output()
        .context("Failed to execute losetup")?;
    if !output.status.success() {
        log_lines(&output.stderr);
        bail!("losetup failed for {}", image.display());
    }
    let loop_dev = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if loop_dev.is_empty() {
        bail!("losetup returned no device for {}", image.display());
    }

    let status = Command::new("mount")
        .args(["-t", "ext4", "-o", "rw,noatime"])
        .arg(&loop_dev)
        .arg(mountpoint)
        .status()
        .context("Failed to execute mount")?;
    if !status.success() {
        detach_loop(&loop_dev);
        bail!("mount {} on {} failed", loop_dev, mountpoint.display());
    }
    log::debug!("mount: {} <- {}", mountpoint.display(), loop_dev);
    Ok(loop_dev)
}

/// Shrinks the image to its used size plus slack. Runs against the loop
/// device while unmounted; the caller re-mounts afterwards if needed.
pub fn trim_img<P: AsRef<Path>, M: AsRef<Path>>(
    image: P,
    mountpoint: M,
    loop_dev: &str,
) -> Result<()> {
    let image = image.as_ref();
    let mountpoint = mountpoint.as_ref();

    let stats = rustix::fs::statvfs(mountpoint)
        .with_context(|| format!("statvfs {}", mountpoint.display()))?;
    let block = stats.f_frsize;
    let used = (stats.f_blocks - stats.f_bfree) * block;
    let used_mb = used / (1024 * 1024);
    // keep headroom so post-fs-data scripts can still write
    let target_mb = used_mb + 16;

    unmount(mountpoint, UnmountFlags::empty())
        .with_context(|| format!("unmount {}", mountpoint.display()))?;

    let output = Command::new("resize2fs")
        .arg(loop_dev)
        .arg(format!("{target_mb}M"))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("Failed to execute resize2fs")?;
    log_lines(&output.stdout);
    log_lines(&output.stderr);
    if !output.status.success() {
        log::warn!("resize2fs failed for {}; image left untrimmed", image.display());
    }

    detach_loop(loop_dev);

    // re-mount for the rest of the boot
    mount_img(image, mountpoint)?;
    Ok(())
}

fn detach_loop(loop_dev: &str) {
    if let Err(e) = Command::new("losetup").arg("-d").arg(loop_dev).status() {
        log::warn!("losetup -d {loop_dev}: {e}");
    }
}
