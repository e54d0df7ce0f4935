// Framework path constants.
//
// Everything under /sbin/.core lives on the tmpfs overlay created during
// startup and disappears on reboot; everything under /data/adb survives.

/// Merged module image, loop-mounted every boot.
pub const MAINIMG: &str = "/data/adb/magisk.img";

/// Pending images merged into MAINIMG, in this order.
pub const MERGE_IMAGES: &[&str] = &[
    "/cache/magisk.img",
    "/data/magisk_merge.img",
    "/data/adb/magisk_merge.img",
];

/// Mountpoint of the merged module image.
pub const MOUNTPOINT: &str = "/sbin/.core/img";

/// Core directory inside the image: common scripts, props, hosts.
pub const COREDIR: &str = "/sbin/.core/img/.core";

/// Read-only mirrors of the live system/vendor partitions.
pub const MIRRDIR: &str = "/sbin/.core/mirror";

/// Internal busybox install prefix.
pub const BBPATH: &str = "/sbin/.core/busybox";

/// Scratch directory for block device nodes during image setup.
pub const BLOCKDIR: &str = "/sbin/.core/block";

/// Flat override tree consumed by the simple mounter.
pub const SIMPLEMOUNT: &str = "/cache/magisk_mount";

/// Secure directory; only ever created by the system (FBE) or late_start.
pub const SECURE_DIR: &str = "/data/adb";

/// Framework binaries and tools under the secure directory.
pub const DATABIN: &str = "/data/adb/magisk";

/// Bundled manager APK staged by the installer.
pub const MANAGERAPK: &str = "/data/adb/magisk/magisk.apk";

/// One-line file naming the registered manager package (database capability).
pub const MANAGER_PKG_FILE: &str = "/data/adb/.manager";

/// Core-only switch: skip all module logic this boot.
pub const DISABLEFILE: &str = "/cache/.disable_magisk";

/// Sentinel watched by init; creating it unblocks the boot process.
pub const UNBLOCKFILE: &str = "/dev/.magisk.unblock";

/// Created when post-fs-data starts running, which proves startup made
/// it through; /dev is tmpfs so this resets on every cold boot.
pub const SETUPDONE: &str = "/dev/.magisk.setup_done";

/// Failed-boot counter, cleared at boot_complete.
pub const BOOTCOUNT: &str = "/data/.magisk_boot_count";

/// Systemless hosts redirect, bind-mounted over /system/etc/hosts.
pub const HOSTSFILE: &str = "/sbin/.core/img/.core/hosts";

/// Boot rc trace removed during startup.
pub const MAGISKRC: &str = "/init.magisk.rc";

/// Main binary and its applet names exposed in /sbin.
pub const MAIN_BIN: &str = "/sbin/magisk.bin";
pub const APPLET_NAMES: &[&str] = &["su", "resetprop", "magiskhide"];

/// Init applet binary and its symlinks.
pub const INIT_BIN: &str = "/sbin/magiskinit";
pub const INIT_APPLETS: &[&str] = &["magiskpolicy", "supolicy"];

/// Candidate locations of a freshly flashed framework data directory,
/// relocated to DATABIN during startup. Priority order.
pub const ALT_BIN_DIRS: &[&str] = &[
    "/cache/data_bin",
    "/data/magisk",
    "/data/data/com.topjohnwu.magisk/install",
    "/data/user_de/0/com.topjohnwu.magisk/install",
];

// Per-module marker files.
pub const DISABLE_FILE_NAME: &str = "disable";
pub const REMOVE_FILE_NAME: &str = "remove";
pub const UPDATE_FILE_NAME: &str = "update";
pub const AUTO_MOUNT_FILE_NAME: &str = "auto_mount";
pub const REPLACE_DIR_FILE_NAME: &str = ".replace";
pub const PROP_FILE_NAME: &str = "system.prop";

// SELinux contexts applied to framework files.
pub const SEPOL_FILE_CON: &str = "u:object_r:magisk_file:s0";
pub const ROOTFS_CON: &str = "u:object_r:rootfs:s0";

/// Property gating the hide daemon; anything but "0" launches it.
pub const HIDE_PROP: &str = "persist.magisk.hide";
pub const HIDE_BIN: &str = "/sbin/magiskhide";

/// Runtime state snapshot for the manager app.
pub const STATEFILE: &str = "/sbin/.core/img/.core/state.json";
