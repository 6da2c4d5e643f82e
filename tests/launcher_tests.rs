//! Tests for detached launches

use childmux::error::ProcessError;
use childmux::process::Launcher;
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use serial_test::serial;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Wait for a detached child to finish writing `path`
fn read_when_written(path: &Path) -> String {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(content) = fs::read_to_string(path) {
            if content.ends_with('\n') {
                return content;
            }
        }
        assert!(Instant::now() < deadline, "{} was never written", path.display());
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[cfg(test)]
mod spawn_tests {
    use super::*;

    #[test]
    #[serial]
    fn test_returned_pid_is_the_program() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("pid");

        let pid = Launcher::new("sh")
            .arg("-c")
            .arg(format!("echo $$ > '{}'", out.display()))
            .spawn()
            .unwrap();

        let written: u32 = read_when_written(&out).trim().parse().unwrap();
        assert_eq!(written, pid);
    }

    #[test]
    #[serial]
    fn test_grandchild_is_not_our_child() {
        let pid = Launcher::new("sleep").arg("1").spawn().unwrap();

        let result = waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG));
        assert_eq!(result, Err(Errno::ECHILD), "Detached child must not be reapable here");
    }

    #[test]
    #[serial]
    fn test_repeated_launches_all_succeed() {
        for round in 0..200 {
            if let Err(e) = Launcher::new("true").spawn() {
                panic!("round {round}: launch of true failed: {e}");
            }
        }
    }

    #[test]
    #[serial]
    fn test_working_dir_and_environment() {
        let dir = TempDir::new().unwrap();

        Launcher::new("/bin/sh")
            .args(["-c", "echo \"$CHILDMUX_X\" > out"])
            .working_dir(dir.path())
            .env_override(vec!["CHILDMUX_X=seven".to_string()])
            .spawn()
            .unwrap();

        assert_eq!(read_when_written(&dir.path().join("out")), "seven\n");
    }
}

#[cfg(test)]
mod failure_tests {
    use super::*;

    #[test]
    #[serial]
    fn test_missing_program_is_reported() {
        let result = Launcher::new("childmux-no-such-program").spawn();
        assert!(matches!(result, Err(ProcessError::Exec { .. })));
    }

    #[test]
    #[serial]
    fn test_repeated_missing_program_launches_all_fail() {
        for round in 0..200 {
            let result = Launcher::new("childmux-no-such-program").spawn();
            assert!(
                matches!(result, Err(ProcessError::Exec { .. })),
                "round {round}: expected exec error, got {result:?}"
            );
        }
    }

    #[test]
    #[serial]
    fn test_missing_working_dir_is_reported() {
        let result = Launcher::new("true")
            .working_dir("/nonexistent/childmux-dir")
            .spawn();
        assert!(matches!(result, Err(ProcessError::WorkingDirectory { .. })));
    }

    #[test]
    #[serial]
    fn test_interior_nul_is_rejected_before_fork() {
        let result = Launcher::new("echo").arg("bad\0arg").spawn();
        assert!(matches!(result, Err(ProcessError::InvalidArgument(_))));
    }
}
