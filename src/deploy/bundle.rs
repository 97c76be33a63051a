// src/deploy/bundle.rs

//! OCI runtime bundle description

use serde_json::{Value, json};
use std::path::PathBuf;

/// A composed bundle ready for an OCI runtime
#[derive(Debug, Clone)]
pub struct Bundle {
    /// Full name of the package the bundle runs
    pub name: String,
    /// Bundle directory holding `config.json`
    pub dir: PathBuf,
    /// Overlay mount point, the container's root
    pub rootfs: PathBuf,
    /// Read-only layers, most significant first
    pub lower_dirs: Vec<PathBuf>,
    /// Runtime configuration written to `config.json`
    pub config: Value,
}

/// Default runtime configuration
///
/// The container runs as root inside a user namespace mapped to uid/gid
/// 1000, with `rootfs` as its root and no arguments yet.
pub fn runtime_config_template() -> Value {
    let capabilities = json!([
        "CAP_SETPCAP",
        "CAP_FSETID",
        "CAP_KILL",
        "CAP_AUDIT_WRITE",
        "CAP_NET_BIND_SERVICE",
        "CAP_SETUID",
        "CAP_NET_RAW",
        "CAP_SETGID",
        "CAP_CHOWN"
    ]);

    json!({
        "ociVersion": "1.0.2",
        "process": {
            "terminal": true,
            "user": { "uid": 0, "gid": 0 },
            "args": [],
            "env": [
                "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
                "TERM=xterm",
                "HOME=/home/root"
            ],
            "cwd": "/",
            "capabilities": {
                "bounding": capabilities.clone(),
                "effective": capabilities.clone(),
                "inheritable": capabilities.clone(),
                "permitted": capabilities.clone(),
                "ambient": capabilities
            },
            "rlimits": [
                { "type": "RLIMIT_NOFILE", "hard": 1024, "soft": 1024 },
                { "type": "RLIMIT_NPROC", "hard": 300, "soft": 300 },
                { "type": "RLIMIT_RTPRIO", "hard": 6, "soft": 6 }
            ],
            "noNewPrivileges": true
        },
        "root": { "path": "rootfs" },
        "hostname": "default",
        "mounts": [
            { "destination": "/proc", "type": "proc", "source": "proc" },
            {
                "destination": "/dev",
                "type": "tmpfs",
                "source": "tmpfs",
                "options": ["nosuid", "strictatime", "mode=755", "size=65536k"]
            },
            {
                "destination": "/dev/pts",
                "type": "devpts",
                "source": "devpts",
                "options": ["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620"]
            },
            {
                "destination": "/dev/shm",
                "type": "tmpfs",
                "source": "shm",
                "options": ["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"]
            },
            {
                "destination": "/dev/mqueue",
                "type": "mqueue",
                "source": "mqueue",
                "options": ["nosuid", "noexec", "nodev"]
            },
            {
                "destination": "/sys",
                "type": "bind",
                "source": "/sys",
                "options": ["rbind", "nosuid", "noexec", "nodev", "ro"]
            }
        ],
        "linux": {
            "uidMappings": [{ "containerID": 0, "hostID": 1000, "size": 1 }],
            "gidMappings": [{ "containerID": 0, "hostID": 1000, "size": 1 }],
            "namespaces": [
                { "type": "pid" },
                { "type": "ipc" },
                { "type": "uts" },
                { "type": "mount" }
            ],
            "maskedPaths": [
                "/proc/kcore",
                "/proc/latency_stats",
                "/proc/timer_list",
                "/proc/timer_stats",
                "/proc/sched_debug",
                "/sys/firmware",
                "/proc/scsi"
            ],
            "readonlyPaths": [
                "/proc/asound",
                "/proc/bus",
                "/proc/fs",
                "/proc/irq",
                "/proc/sys",
                "/proc/sysrq-trigger"
            ],
            "resources": {
                "devices": [{ "allow": false, "access": "rwm" }]
            },
            "devices": []
        }
    })
}

/// Append an argument to `process.args`
pub fn push_process_arg(config: &mut Value, arg: &str) {
    if let Some(args) = config
        .pointer_mut("/process/args")
        .and_then(Value::as_array_mut)
    {
        args.push(Value::String(arg.to_string()));
    }
}
