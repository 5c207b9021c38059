//! Low-level mount capability.
//!
//! [`Mount`] is the seam between mount-state orchestration and the kernel:
//! bind-mount, unmount and mountpoint detection.  [`LinuxMount`] implements it
//! with `nix` and `/proc/self/mounts`; tests substitute a recording fake.
//!
//! Errors are plain [`std::io::Error`]s so callers can tell a missing path
//! (`ErrorKind::NotFound`, benign during cleanup) from real failures.

use std::borrow::Cow;
use std::io;
use std::path::Path;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags};
use tracing::debug;

pub mod args;

pub use args::MountArgs;

/// Kernel mount operations.
#[async_trait]
pub trait Mount: Send + Sync {
    /// Bind-mount `source` onto `target`, optionally read-only.
    async fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> io::Result<()>;

    /// Unmount `target`.
    async fn unmount(&self, target: &Path) -> io::Result<()>;

    /// Whether `target` is currently a mountpoint.
    ///
    /// Fails with `ErrorKind::NotFound` when `target` does not exist.  A
    /// mount whose filesystem process died (`ENOTCONN`) counts as mounted so
    /// that it still gets unmounted.
    async fn is_mount_point(&self, target: &Path) -> io::Result<bool>;
}

/// Whether `err` means the path is gone.
pub fn is_not_found(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound
}

/// [`Mount`] backed by Linux mount syscalls.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxMount;

impl LinuxMount {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Mount for LinuxMount {
    async fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> io::Result<()> {
        let mut flags = MsFlags::MS_BIND;
        if read_only {
            flags |= MsFlags::MS_RDONLY;
        }
        nix::mount::mount(Some(source), target, None::<&str>, flags, None::<&str>)?;

        // Some kernels ignore MS_RDONLY on the initial bind-mount call; a
        // separate remount is required to actually enforce read-only access.
        if read_only {
            nix::mount::mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )?;
        }
        debug!(source = %source.display(), target = %target.display(), read_only, "bind-mounted");
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> io::Result<()> {
        nix::mount::umount2(target, MntFlags::empty())?;
        debug!(target = %target.display(), "unmounted");
        Ok(())
    }

    async fn is_mount_point(&self, target: &Path) -> io::Result<bool> {
        match tokio::fs::metadata(target).await {
            Ok(_) => {}
            Err(e) if e.raw_os_error() == Some(Errno::ENOTCONN as i32) => return Ok(true),
            Err(e) => return Err(e),
        }

        let mounts = tokio::fs::read_to_string("/proc/self/mounts").await?;
        listed_in(&mounts, target).await
    }
}

/// Look `target` up in `mounts` under the name the kernel reports, which is
/// the path with every symlink resolved.
async fn listed_in(mounts: &str, target: &Path) -> io::Result<bool> {
    let resolved = tokio::fs::canonicalize(target).await?;
    Ok(is_listed(mounts, &resolved))
}

/// Whether `target` appears as a mountpoint in `/proc/self/mounts` content.
fn is_listed(mounts: &str, target: &Path) -> bool {
    let Some(target) = target.to_str() else {
        return false;
    };
    let target = match target.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    };
    // Format: <device> <mountpoint> <fstype> <options> <dump> <pass>
    mounts.lines().any(|line| {
        line.split_whitespace()
            .nth(1)
            .is_some_and(|mountpoint| unescape_octal(mountpoint) == target)
    })
}

/// Undo the `\ooo` escaping the kernel applies to space, tab, newline and
/// backslash in mount table fields.
fn unescape_octal(field: &str) -> Cow<'_, str> {
    if !field.contains('\\') {
        return Cow::Borrowed(field);
    }
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let digits = bytes
            .get(i + 1..i + 4)
            .filter(|digits| bytes[i] == b'\\' && digits.iter().all(|b| (b'0'..=b'7').contains(b)));
        if let Some(digits) = digits {
            let code = digits
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            if let Ok(byte) = u8::try_from(code) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    Cow::Owned(String::from_utf8_lossy(&out).into_owned())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    const MOUNTS: &str = "\
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
mountpoint-s3 /var/lib/kubelet/plugins/s3.csi.aws.com/mnt/uid1 fuse rw,nosuid,nodev 0 0
";

    #[test]
    fn listed_mountpoints() {
        assert!(is_listed(
            MOUNTS,
            Path::new("/var/lib/kubelet/plugins/s3.csi.aws.com/mnt/uid1")
        ));
        assert!(is_listed(
            MOUNTS,
            Path::new("/var/lib/kubelet/plugins/s3.csi.aws.com/mnt/uid1/")
        ));
        assert!(!is_listed(
            MOUNTS,
            Path::new("/var/lib/kubelet/plugins/s3.csi.aws.com/mnt/uid2")
        ));
    }

    #[test]
    fn escaped_mountpoints() {
        let mounts = "mountpoint-s3 /var/lib/kubelet/pods/p1/volumes/kubernetes.io~csi/my\\040vol/mount fuse rw 0 0\n";
        assert!(is_listed(
            mounts,
            Path::new("/var/lib/kubelet/pods/p1/volumes/kubernetes.io~csi/my vol/mount")
        ));
        assert_eq!(unescape_octal("a\\011b\\134c"), "a\tb\\c");
        assert_eq!(unescape_octal("trailing\\04"), "trailing\\04");
    }

    #[tokio::test]
    async fn symlinked_target_is_resolved() {
        let tmp = tempfile::tempdir().unwrap();
        let real = tmp.path().join("real");
        std::fs::create_dir(&real).unwrap();
        let link = tmp.path().join("kubelet");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let resolved = std::fs::canonicalize(&real).unwrap();
        let mounts = format!("tmpfs {} tmpfs rw 0 0\n", resolved.display());

        assert!(listed_in(&mounts, &link).await.unwrap());
        assert!(listed_in(&mounts, &real).await.unwrap());
        assert!(!listed_in(MOUNTS, &link).await.unwrap());
    }

    #[tokio::test]
    async fn missing_path_is_not_found() {
        let err = LinuxMount::new()
            .is_mount_point(&PathBuf::from("/nonexistent/path/for/test"))
            .await
            .unwrap_err();
        assert!(is_not_found(&err));
    }

    #[tokio::test]
    async fn plain_directory_is_not_a_mountpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("plain");
        std::fs::create_dir(&dir).unwrap();
        assert!(!LinuxMount::new().is_mount_point(&dir).await.unwrap());
    }
}
