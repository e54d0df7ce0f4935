// Copyright 2026 Magisk Boot Core Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Boot stage controller: drives startup -> post-fs-data -> late_start ->
//! boot_complete. Failures never block the device: every precondition
//! miss degrades to unblocking init, and the overlay itself is
//! best-effort.

use std::fs::{self, File};
use std::io::Write;
use std::os::fd::FromRawFd;
use std::os::unix::fs::{symlink, FileTypeExt, PermissionsExt};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use rustix::mount::{mount_remount, unmount, MountFlags, UnmountFlags};
use walkdir::WalkDir;

use crate::defs::*;
use crate::image;
use crate::mount::magic::MagicMount;
use crate::mount::{simple, MountPlan};
use crate::node::Node;
use crate::props::{self, load_prop_file};
use crate::registry;
use crate::script::{exec_common_scripts, exec_module_scripts, Stage};
use crate::state::RuntimeState;
use crate::utils::{
    bind_mount, clone_attr, ensure_dir_exists, link_dir, lsetfilecon, mount_tmpfs, rm_rf,
};

const WRAPPER: &str = "#!/system/bin/sh\n\
unset LD_LIBRARY_PATH\n\
unset LD_PRELOAD\n\
exec /sbin/magisk.bin \"${0##*/}\" \"$@\"\n";

/* BLKROSET = _IO(0x12, 93) */
const BLKROSET: libc::c_ulong = 0x125d;

/// Writes the 4-byte ack on the client socket and closes it. Always the
/// first thing a client-triggered stage does, so the caller can proceed.
fn ack_client(fd: i32) {
    if fd < 0 {
        return;
    }
    let mut client = unsafe { File::from_raw_fd(fd) };
    if let Err(e) = client.write_all(&0i32.to_le_bytes()) {
        log::warn!("client ack failed: {e}");
    }
    // drop closes the descriptor
}

/// Signals init to proceed and ends this stage. Modules are simply not
/// applied this boot; the next boot retries.
fn unblock_boot_process() -> ! {
    let _ = File::create(UNBLOCKFILE);
    std::process::exit(0);
}

/// The decryption gate: /data counts as usable when a non-tmpfs /data
/// mount exists and the device is either unencrypted (or says nothing)
/// or has its decryption service up.
fn data_usable(mounts: &str, crypto_state: Option<&str>, vold: Option<&str>) -> bool {
    let mounted = mounts.lines().any(|line| {
        let mut fields = line.split_whitespace();
        let _dev = fields.next();
        fields.next() == Some("/data") && !line.contains("tmpfs")
    });
    if !mounted {
        return false;
    }
    match crypto_state {
        // not set: assume unencrypted
        None => true,
        Some("unencrypted") => true,
        Some(_) => vold.map(|v| !v.is_empty()).unwrap_or(false),
    }
}

fn check_data() -> bool {
    let mounts = fs::read_to_string("/proc/mounts").unwrap_or_default();
    data_usable(
        &mounts,
        props::getprop("ro.crypto.state").as_deref(),
        props::getprop("init.svc.vold").as_deref(),
    )
}

/// Mount source specs recovered from /proc/mounts during mirror setup.
#[derive(Debug, Default, PartialEq, Eq)]
struct MirrorSources {
    system_as_root: bool,
    /// (device, fstype) of /system when not system-as-root.
    system: Option<(String, String)>,
    /// (device, fstype) of a distinct /vendor partition.
    vendor: Option<(String, String)>,
}

fn parse_mirror_sources(mounts: &str) -> MirrorSources {
    let mut sources = MirrorSources::default();
    for line in mounts.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            continue;
        }
        match fields[1] {
            "/system_root" => sources.system_as_root = true,
            "/system" if !sources.system_as_root => {
                sources.system = Some((fields[0].to_string(), fields[2].to_string()));
            }
            "/vendor" => {
                sources.vendor = Some((fields[0].to_string(), fields[2].to_string()));
            }
            _ => {}
        }
    }
    sources
}

fn unlock_blocks() {
    let entries = match fs::read_dir("/dev/block") {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let is_blk = entry
            .file_type()
            .map(|t| t.is_block_device())
            .unwrap_or(false);
        if !is_blk {
            continue;
        }
        let file = match File::open(entry.path()) {
            Ok(f) => f,
            Err(_) => continue,
        };
        let off: libc::c_int = 0;
        let ret = unsafe {
            libc::ioctl(
                std::os::fd::AsRawFd::as_raw_fd(&file),
                BLKROSET as _,
                &off,
            )
        };
        if ret == -1 {
            log::warn!(
                "unlock {}: {}",
                entry.file_name().to_string_lossy(),
                std::io::Error::last_os_error()
            );
        }
    }
}

/// Rebuilds /sbin as a tmpfs overlay: the original contents survive via
/// a hard-linked mirror at /root plus back-symlinks, and the framework
/// gains writable slots for its own binaries and applets.
fn rebuild_sbin_overlay() -> Result<()> {
    let magisk = fs::read("/sbin/magisk").context("read main binary")?;
    fs::remove_file("/sbin/magisk").ok();
    let init = fs::read(INIT_BIN).context("read init applet")?;
    fs::remove_file(INIT_BIN).ok();

    // hard-linked mirror of the original /sbin
    if !Path::new("/root").exists() {
        fs::create_dir("/root")?;
        fs::set_permissions("/root", fs::Permissions::from_mode(0o750))?;
    }
    clone_attr("/sbin", "/root")?;
    link_dir("/sbin", "/root")?;

    mount_tmpfs("/sbin")?;
    fs::set_permissions("/sbin", fs::Permissions::from_mode(0o755))?;
    lsetfilecon("/sbin", ROOTFS_CON)?;

    for applet in APPLET_NAMES {
        symlink("/sbin/magisk", format!("/sbin/{applet}"))?;
    }

    let write_bin = |path: &str, data: &[u8]| -> Result<()> {
        fs::write(path, data)?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
        lsetfilecon(path, SEPOL_FILE_CON)?;
        Ok(())
    };
    write_bin(MAIN_BIN, &magisk)?;
    write_bin("/sbin/magisk", WRAPPER.as_bytes())?;
    write_bin(INIT_BIN, &init)?;
    for applet in INIT_APPLETS {
        symlink(INIT_BIN, format!("/sbin/{applet}"))?;
    }

    // everything else resolves back into the mirror
    for entry in fs::read_dir("/root")?.flatten() {
        let name = entry.file_name();
        let slot = Path::new("/sbin").join(&name);
        if slot.symlink_metadata().is_err() {
            symlink(Path::new("/root").join(&name), &slot)?;
        }
    }
    Ok(())
}

/// Finds a freshly flashed framework data directory among the fixed
/// candidates and relocates it to DATABIN.
fn relocate_data_bin() {
    let mut bin_path = None;
    for candidate in ALT_BIN_DIRS {
        let path = Path::new(candidate);
        if let Ok(metadata) = path.symlink_metadata() {
            if !metadata.file_type().is_symlink() {
                bin_path = Some(path);
                break;
            }
        }
    }
    if let Some(path) = bin_path {
        log::info!("* Relocating {} -> {DATABIN}", path.display());
        rm_rf(DATABIN);
        let result = ensure_dir_exists(DATABIN)
            .and_then(|_| crate::utils::copy_afc(path, Path::new(DATABIN)));
        if let Err(e) = result {
            log::error!("relocate {}: {e:#}", path.display());
            return;
        }
        rm_rf(path);
    }
}

/// Binds the live system/vendor under MIRRDIR read-only. Returns whether
/// a distinct /vendor partition exists.
fn mount_mirrors() -> Result<bool> {
    log::info!("* Mounting mirrors");
    let mounts = fs::read_to_string("/proc/mounts").unwrap_or_default();
    let sources = parse_mirror_sources(&mounts);

    let mirror_system = format!("{MIRRDIR}/system");
    if crate::utils::is_mounted(&mirror_system) {
        log::debug!("mirror already mounted: {mirror_system}");
    } else if sources.system_as_root {
        bind_mount("/system_root/system", &mirror_system)?;
    } else if let Some((dev, fstype)) = &sources.system {
        rustix::mount::mount(
            dev.as_str(),
            mirror_system.as_str(),
            fstype.as_str(),
            MountFlags::RDONLY,
            "",
        )
        .with_context(|| format!("mount {dev} on {mirror_system}"))?;
        log::debug!("mount: {mirror_system} <- {dev}");
    }

    let mirror_vendor = format!("{MIRRDIR}/vendor");
    let separate_vendor = if let Some((dev, fstype)) = &sources.vendor {
        ensure_dir_exists(&mirror_vendor)?;
        rustix::mount::mount(
            dev.as_str(),
            mirror_vendor.as_str(),
            fstype.as_str(),
            MountFlags::RDONLY,
            "",
        )
        .with_context(|| format!("mount {dev} on {mirror_vendor}"))?;
        log::debug!("mount: {mirror_vendor} <- {dev}");
        true
    } else {
        symlink(format!("{MIRRDIR}/system/vendor"), &mirror_vendor)?;
        log::debug!("link: {mirror_vendor}");
        false
    };
    Ok(separate_vendor)
}

/// Re-derives the separate-vendor flag in a later stage: mirror setup
/// leaves a symlink at mirror/vendor exactly when vendor is not its own
/// partition.
fn detect_separate_vendor() -> bool {
    Path::new(MIRRDIR)
        .join("vendor")
        .symlink_metadata()
        .map(|m| !m.file_type().is_symlink())
        .unwrap_or(false)
}

fn setup_busybox() {
    let busybox = Path::new(MIRRDIR).join("bin/busybox");
    let executable = busybox
        .metadata()
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false);
    if !executable {
        return;
    }
    log::info!("* Setting up internal busybox");
    match Command::new(&busybox).args(["--install", "-s", BBPATH]).status() {
        Ok(status) if status.success() => {
            let _ = symlink(&busybox, format!("{BBPATH}/busybox"));
        }
        Ok(status) => log::warn!("busybox install exit {status}"),
        Err(e) => log::warn!("busybox install: {e}"),
    }
}

/// Phase 1. Ends by exec'ing into post-fs-data; only returns on error.
pub fn startup() -> Result<()> {
    if !check_data() {
        unblock_boot_process();
    }
    if !Path::new(SECURE_DIR).exists() {
        // Creating it here would bootloop FBE devices; let the system
        // make it and retry next boot.
        log::error!("{SECURE_DIR} is not present, abort");
        unblock_boot_process();
    }

    if !Path::new(DISABLEFILE).exists() {
        let mut plan = MountPlan::new();
        for part in ["system", "vendor"] {
            if let Err(e) = simple::emit(SIMPLEMOUNT, "/", Path::new(part), &mut plan) {
                log::warn!("simple mount {part}: {e:#}");
            }
        }
        plan.apply();
    }

    log::info!("** Initializing Magisk");

    unlock_blocks();

    log::info!("* Creating /sbin overlay");
    mount_remount("/", MountFlags::empty(), "").context("remount / rw")?;

    fs::remove_file(MAGISKRC).ok();

    // GSIs override /sbin/adbd with the system copy
    if Path::new("/sbin/adbd").exists() && Path::new("/system/bin/adbd").exists() {
        let _ = unmount("/sbin/adbd", UnmountFlags::DETACH);
        let _ = bind_mount("/system/bin/adbd", "/sbin/adbd");
    }

    rebuild_sbin_overlay()?;

    relocate_data_bin();

    // legacy artifacts from older installs
    rm_rf("/data/magisk");
    fs::remove_file("/data/magisk.img").ok();
    fs::remove_file("/data/magisk_debug.log").ok();

    ensure_dir_exists(format!("{MIRRDIR}/system"))?;
    ensure_dir_exists(format!("{MIRRDIR}/bin"))?;
    ensure_dir_exists(BBPATH)?;
    ensure_dir_exists(MOUNTPOINT)?;
    ensure_dir_exists(BLOCKDIR)?;

    mount_mirrors()?;

    ensure_dir_exists(DATABIN)?;
    bind_mount(DATABIN, format!("{MIRRDIR}/bin"))?;
    setup_busybox();

    // hand off
    let err = Command::new(MAIN_BIN).arg("--post-fs-data").exec();
    Err(err).context("exec post-fs-data")
}

/// Merge, create, mount and trim the module image; enumerate modules.
fn prepare_img() -> Result<Vec<String>> {
    for img in MERGE_IMAGES {
        image::merge_img(img, MAINIMG, Path::new(BLOCKDIR))?;
    }
    if !Path::new(MAINIMG).exists() {
        image::create_img(MAINIMG, 64)?;
    }

    log::info!("* Mounting {MAINIMG}");
    let loop_dev = image::mount_img(MAINIMG, MOUNTPOINT)?;
    registry::ensure_core_dirs(COREDIR)?;
    let modules = registry::collect_modules(MOUNTPOINT)?;
    image::trim_img(MAINIMG, MOUNTPOINT, &loop_dev)?;
    Ok(modules)
}

fn restorecon_data() {
    for entry in WalkDir::new(DATABIN).into_iter().flatten() {
        let _ = lsetfilecon(entry.path(), SEPOL_FILE_CON);
    }
    let _ = lsetfilecon(MAINIMG, SEPOL_FILE_CON);
}

fn start_hide_daemon() {
    if props::getprop(HIDE_PROP).as_deref() == Some("0") {
        return;
    }
    std::thread::spawn(|| match Command::new(HIDE_BIN).spawn() {
        Ok(mut child) => {
            let _ = child.wait();
        }
        Err(e) => log::warn!("hide daemon: {e}"),
    });
}

/// Degraded tail shared by every post-fs-data outcome: systemless hosts,
/// hide daemon, boot unblock.
fn core_only() -> ! {
    if Path::new(HOSTSFILE).exists() {
        log::info!("* Enabling systemless hosts file support");
        let _ = bind_mount(HOSTSFILE, "/system/etc/hosts");
    }
    start_hide_daemon();
    unblock_boot_process();
}

/// Phase 2.
pub fn post_fs_data(client: i32) -> ! {
    ack_client(client);

    // post-fs-data running at all means startup succeeded
    let _ = File::create(SETUPDONE);

    let _ = mount_remount("/", MountFlags::RDONLY, "");

    log::info!("** post-fs-data mode running");

    let modules = match prepare_img() {
        Ok(modules) => modules,
        Err(e) => {
            log::error!("image preparation failed: {e:#}");
            core_only();
        }
    };

    restorecon_data();
    let _ = fs::set_permissions(SECURE_DIR, fs::Permissions::from_mode(0o700));

    log::info!("* Running post-fs-data.d scripts");
    let _ = exec_common_scripts(COREDIR, Stage::PostFsData);

    if Path::new(DISABLEFILE).exists() {
        core_only();
    }

    log::info!("* Running module post-fs-data scripts");
    let _ = exec_module_scripts(MOUNTPOINT, &modules, Stage::PostFsData);

    let separate_vendor = detect_separate_vendor();
    let engine = MagicMount::with_defaults(separate_vendor);
    let mut sys_root = Node::new_root("system");
    let mut has_modules = false;

    log::info!("* Loading modules");
    for module in &modules {
        let module_dir = Path::new(MOUNTPOINT).join(module);
        let prop = module_dir.join(PROP_FILE_NAME);
        if prop.exists() {
            log::info!("{module}: loading [{PROP_FILE_NAME}]");
            if let Err(e) = load_prop_file(&prop) {
                log::warn!("{module}: {e:#}");
            }
        }
        if !module_dir.join(AUTO_MOUNT_FILE_NAME).exists() {
            continue;
        }
        if !module_dir.join("system").is_dir() {
            continue;
        }
        has_modules = true;
        log::info!("{module}: constructing magic mount structure");
        if let Err(e) = engine.create_module_tree(&mut sys_root, module) {
            log::error!("{module}: {e:#}");
        }
    }

    if has_modules {
        let ven_root = engine.extract_vendor(&mut sys_root);

        let mut plan = MountPlan::new();
        if let Err(e) = engine.emit(&mut sys_root, &mut plan) {
            log::error!("magic mount emission: {e:#}");
        }
        if let Some(mut ven_root) = ven_root {
            if let Err(e) = engine.emit(&mut ven_root, &mut plan) {
                log::error!("vendor mount emission: {e:#}");
            }
        }
        plan.log_summary();
        let applied = plan.apply();

        let state = RuntimeState {
            modules,
            mounts_emitted: applied,
            separate_vendor,
            core_only: false,
        };
        if let Err(e) = state.save(STATEFILE) {
            log::warn!("state snapshot: {e:#}");
        }
    }

    core_only();
}

/// Reads the registered manager package (database capability) and checks
/// whether it is actually present on the device.
fn manager_registered() -> bool {
    let pkg = match fs::read_to_string(MANAGER_PKG_FILE) {
        Ok(content) => content.trim().to_string(),
        Err(_) => return false,
    };
    if pkg.is_empty() {
        return false;
    }
    Path::new("/data/data").join(&pkg).exists()
}

/// Installs the manager APK through the package manager, which may not
/// be online yet. Bounded retry instead of spinning forever.
fn install_apk(apk: &Path) {
    let _ = lsetfilecon(apk, SEPOL_FILE_CON);
    let mut installed = false;
    for attempt in 1..=12 {
        std::thread::sleep(Duration::from_secs(5));
        log::debug!("apk_install: attempt {attempt}");
        let output = match Command::new("/system/bin/pm")
            .args(["install", "-r"])
            .arg(apk)
            .output()
        {
            Ok(output) => output,
            Err(e) => {
                log::debug!("apk_install: {e}");
                continue;
            }
        };
        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            log::debug!("apk_install: {line}");
        }
        // pm answers with Error: until it is actually up
        if output.status.success() && !text.contains("Error:") {
            installed = true;
            break;
        }
    }
    if !installed {
        log::error!("apk_install: package manager never accepted {}", apk.display());
    }
    let _ = fs::remove_file(apk);
}

fn install_manager() {
    if Path::new(MANAGERAPK).exists() {
        let staged = Path::new("/data/magisk.apk");
        if fs::rename(MANAGERAPK, staged).is_ok() {
            install_apk(staged);
        }
    } else if !manager_registered() {
        // no valid manager: extract the stub from the init applet
        let staged = Path::new("/data/magisk.apk");
        let status = Command::new(INIT_BIN)
            .args(["-x", "manager"])
            .arg(staged)
            .status();
        match status {
            Ok(s) if s.success() => install_apk(staged),
            Ok(s) => log::warn!("manager stub extraction exit {s}"),
            Err(e) => log::warn!("manager stub extraction: {e}"),
        }
    }
}

/// Phase 3.
pub fn late_start(client: i32) {
    log::info!("** late_start service mode running");
    ack_client(client);

    if !Path::new(SECURE_DIR).exists() {
        // safe to create at this point
        let _ = fs::create_dir(SECURE_DIR);
        let _ = fs::set_permissions(SECURE_DIR, fs::Permissions::from_mode(0o700));
    }

    if !Path::new(SETUPDONE).exists() {
        // setup failed somewhere before us; reboot and retry
        log::error!("setup incomplete, rebooting");
        let _ = Command::new("/system/bin/reboot").status();
        return;
    }

    start_hide_daemon();

    log::info!("* Running service.d scripts");
    let _ = exec_common_scripts(COREDIR, Stage::Service);

    if !Path::new(DISABLEFILE).exists() {
        log::info!("* Running module service scripts");
        match registry::list_modules(MOUNTPOINT) {
            Ok(modules) => {
                let _ = exec_module_scripts(MOUNTPOINT, &modules, Stage::Service);
            }
            Err(e) => log::warn!("module enumeration: {e:#}"),
        }
    }

    install_manager();
}

/// Phase 4.
pub fn boot_complete(client: i32) {
    log::info!("** boot_complete triggered");
    ack_client(client);
    fs::remove_file(BOOTCOUNT).ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTS: &str = "\
/dev/block/dm-0 /system ext4 ro,seclabel,relatime 0 0
/dev/block/sda1 /vendor ext4 ro,seclabel,relatime 0 0
/dev/block/sda2 /data ext4 rw,seclabel,nosuid,nodev 0 0
tmpfs /dev tmpfs rw,seclabel,nosuid 0 0
";

    #[test]
    fn data_gate_unencrypted() {
        assert!(data_usable(MOUNTS, Some("unencrypted"), None));
    }

    #[test]
    fn data_gate_unset_crypto_assumed_plain() {
        assert!(data_usable(MOUNTS, None, None));
    }

    #[test]
    fn data_gate_encrypted_needs_vold() {
        assert!(!data_usable(MOUNTS, Some("encrypted"), None));
        assert!(!data_usable(MOUNTS, Some("encrypted"), Some("")));
        assert!(data_usable(MOUNTS, Some("encrypted"), Some("running")));
    }

    #[test]
    fn data_gate_rejects_tmpfs_data() {
        let mounts = "tmpfs /data tmpfs rw 0 0\n";
        assert!(!data_usable(mounts, Some("unencrypted"), None));
        assert!(!data_usable("", None, None));
    }

    #[test]
    fn mirror_sources_separate_vendor() {
        let sources = parse_mirror_sources(MOUNTS);
        assert!(!sources.system_as_root);
        assert_eq!(
            sources.system,
            Some(("/dev/block/dm-0".into(), "ext4".into()))
        );
        assert_eq!(
            sources.vendor,
            Some(("/dev/block/sda1".into(), "ext4".into()))
        );
    }

    #[test]
    fn mirror_sources_system_as_root() {
        let mounts = "\
/dev/block/dm-0 /system_root ext4 ro 0 0
/dev/block/sda2 /data ext4 rw 0 0
";
        let sources = parse_mirror_sources(mounts);
        assert!(sources.system_as_root);
        assert_eq!(sources.system, None);
        assert_eq!(sources.vendor, None);
    }

    #[test]
    fn system_root_wins_over_later_system_line() {
        let mounts = "\
/dev/block/dm-0 /system_root ext4 ro 0 0
/dev/block/dm-1 /system ext4 ro 0 0
";
        let sources = parse_mirror_sources(mounts);
        assert!(sources.system_as_root);
        assert_eq!(sources.system, None);
    }
}
