use clap::Parser;

/// Boot stage entry points. Exactly one stage flag is expected; the
/// client-triggered stages carry the connected socket descriptor.
#[derive(Parser, Debug)]
#[command(name = "magiskd", version, about = "Boot-stage orchestration core")]
pub struct Cli {
    /// Early-boot setup: simple mounts, /sbin overlay, mirrors.
    #[arg(long)]
    pub startup: bool,

    /// Module image preparation and magic mount.
    #[arg(long = "post-fs-data")]
    pub post_fs_data: bool,

    /// late_start service stage.
    #[arg(long)]
    pub service: bool,

    /// Boot completed; clears the boot counter.
    #[arg(long = "boot-complete")]
    pub boot_complete: bool,

    /// Connected client socket for the ack protocol.
    #[arg(long = "client-fd", default_value_t = -1)]
    pub client_fd: i32,

    #[arg(short, long)]
    pub verbose: bool,
}
