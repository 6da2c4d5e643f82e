//! Fork/exec plumbing shared by the controller and the launcher
//!
//! Everything the child needs is prepared in the parent before `fork()`:
//! between fork and exec the child may only make async-signal-safe calls, so
//! it never allocates, logs, or touches Rust-managed state.

use crate::config::EngineConfig;
use crate::error::{ProcessError, Result};
use crate::sys;
use nix::errno::Errno;
use nix::libc::{self, c_char};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use std::ffi::{CString, OsStr, OsString};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::ptr;
use tracing::warn;

/// Environment for a child given an override list.
///
/// The override entries (`KEY=value`) are used verbatim. The library search
/// path variable is carried over from `inherited` unless the overrides set it.
pub fn merged_environment<I, K, V>(
    overrides: &[String],
    inherited: I,
    library_var: &str,
) -> Vec<OsString>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<OsString>,
    V: Into<OsString>,
{
    let mut env: Vec<OsString> = overrides.iter().map(OsString::from).collect();

    let overridden = overrides
        .iter()
        .any(|entry| entry.split('=').next() == Some(library_var));
    if overridden || library_var.is_empty() {
        return env;
    }

    for (key, value) in inherited {
        let key = key.into();
        if key.as_os_str() == OsStr::new(library_var) {
            let mut entry = key;
            entry.push("=");
            entry.push(value.into());
            env.push(entry);
            break;
        }
    }
    env
}

fn c_string(bytes: impl Into<Vec<u8>>) -> Result<CString> {
    CString::new(bytes).map_err(|e| {
        ProcessError::InvalidArgument(format!(
            "{:?} contains a NUL byte",
            String::from_utf8_lossy(&e.into_vec())
        ))
    })
}

fn pointer_array(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

/// Everything `execve` needs, resolved before fork
pub(crate) struct ExecPlan {
    program: String,
    working_dir: Option<PathBuf>,
    candidates: Vec<CString>,
    // Pointer arrays borrow the heap buffers of the CStrings kept alongside.
    _argv: Vec<CString>,
    argv_ptrs: Vec<*const c_char>,
    shell: CString,
    /// `[shell, <candidate>, argv[1..], NULL]`; slot 1 is filled in the child
    shell_argv_ptrs: Vec<*const c_char>,
    _envp: Vec<CString>,
    envp_ptrs: Vec<*const c_char>,
    cwd: Option<CString>,
}

impl ExecPlan {
    pub(crate) fn new(
        argv: &[OsString],
        working_dir: Option<&Path>,
        env_override: Option<&[String]>,
        config: &EngineConfig,
    ) -> Result<Self> {
        let Some(program) = argv.first() else {
            return Err(ProcessError::NotConfigured);
        };

        let env: Vec<OsString> = match env_override {
            Some(overrides) => {
                merged_environment(overrides, std::env::vars_os(), &config.library_path_var)
            }
            None => std::env::vars_os()
                .map(|(k, v)| {
                    let mut entry = k;
                    entry.push("=");
                    entry.push(v);
                    entry
                })
                .collect(),
        };

        let search_path = env_override
            .and_then(|overrides| {
                overrides
                    .iter()
                    .find_map(|e| e.strip_prefix("PATH=").map(OsString::from))
            })
            .or_else(|| std::env::var_os("PATH"))
            .unwrap_or_else(|| OsString::from(&config.default_path));

        let candidates = resolve_candidates(program, &search_path)?;

        let argv_c = argv
            .iter()
            .map(|a| c_string(a.as_bytes()))
            .collect::<Result<Vec<_>>>()?;
        let argv_ptrs = pointer_array(&argv_c);

        let shell = c_string(config.shell.as_bytes())?;
        let mut shell_argv_ptrs = vec![shell.as_ptr(), ptr::null()];
        shell_argv_ptrs.extend(argv_c.iter().skip(1).map(|a| a.as_ptr()));
        shell_argv_ptrs.push(ptr::null());

        let envp = env
            .into_iter()
            .map(|e| c_string(e.into_vec()))
            .collect::<Result<Vec<_>>>()?;
        let envp_ptrs = pointer_array(&envp);

        let cwd = working_dir
            .map(|d| c_string(d.as_os_str().as_bytes()))
            .transpose()?;

        Ok(Self {
            program: program.to_string_lossy().into_owned(),
            working_dir: working_dir.map(Path::to_path_buf),
            candidates,
            _argv: argv_c,
            argv_ptrs,
            shell,
            shell_argv_ptrs,
            _envp: envp,
            envp_ptrs,
            cwd,
        })
    }

    pub(crate) fn program(&self) -> &str {
        &self.program
    }

    #[cfg(test)]
    fn candidates(&self) -> Vec<String> {
        self.candidates
            .iter()
            .map(|c| c.to_string_lossy().into_owned())
            .collect()
    }

    /// Change directory and exec. Runs in the forked child only.
    ///
    /// A program the kernel refuses as "not executable" is re-run through the
    /// shell, the way a shell runs a script without a `#!` line. On failure the
    /// stage and errno go to `report_fd` and the child exits with 127.
    pub(crate) unsafe fn exec(&mut self, report_fd: RawFd) -> ! {
        if let Some(cwd) = &self.cwd {
            if libc::chdir(cwd.as_ptr()) < 0 {
                report_failure(report_fd, ChildStage::WorkingDirectory, Errno::last() as i32);
                libc::_exit(127);
            }
        }

        let mut last_error = libc::ENOENT;
        for candidate in &self.candidates {
            libc::execve(
                candidate.as_ptr(),
                self.argv_ptrs.as_ptr(),
                self.envp_ptrs.as_ptr(),
            );
            let err = Errno::last() as i32;

            if err == libc::ENOEXEC {
                self.shell_argv_ptrs[1] = candidate.as_ptr();
                libc::execve(
                    self.shell.as_ptr(),
                    self.shell_argv_ptrs.as_ptr(),
                    self.envp_ptrs.as_ptr(),
                );
                last_error = Errno::last() as i32;
                break;
            }

            match err {
                libc::ENOENT | libc::ENOTDIR => {}
                libc::EACCES => last_error = err,
                _ => {
                    last_error = err;
                    break;
                }
            }
        }

        report_failure(report_fd, ChildStage::Exec, last_error);
        libc::_exit(127);
    }
}

fn resolve_candidates(program: &OsStr, search_path: &OsStr) -> Result<Vec<CString>> {
    let bytes = program.as_bytes();
    if bytes.is_empty() {
        return Err(ProcessError::NotConfigured);
    }
    if bytes.contains(&b'/') {
        return Ok(vec![c_string(bytes)?]);
    }

    search_path
        .as_bytes()
        .split(|&b| b == b':')
        .map(|dir| {
            let mut full = if dir.is_empty() { b".".to_vec() } else { dir.to_vec() };
            full.push(b'/');
            full.extend_from_slice(bytes);
            c_string(full)
        })
        .collect()
}

/// Point of failure reported by a child before exec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChildStage {
    WorkingDirectory = 1,
    Exec = 2,
    Fork = 3,
}

/// Failure decoded from the detection pipe
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChildFailure {
    stage: ChildStage,
    errno: i32,
}

impl ChildFailure {
    pub(crate) fn into_error(self, plan: &ExecPlan) -> ProcessError {
        let source = io::Error::from_raw_os_error(self.errno);
        match self.stage {
            ChildStage::WorkingDirectory => ProcessError::WorkingDirectory {
                dir: plan.working_dir.clone().unwrap_or_default(),
                source,
            },
            ChildStage::Exec => ProcessError::Exec {
                program: plan.program.clone(),
                source,
            },
            ChildStage::Fork => ProcessError::Fork(Errno::from_i32(self.errno)),
        }
    }
}

/// Write `stage` and `errno` to the detection pipe. Async-signal-safe.
pub(crate) unsafe fn report_failure(fd: RawFd, stage: ChildStage, errno: i32) {
    let mut msg = [0u8; 8];
    msg[..4].copy_from_slice(&(stage as i32).to_ne_bytes());
    msg[4..].copy_from_slice(&errno.to_ne_bytes());
    libc::write(fd, msg.as_ptr().cast::<libc::c_void>(), msg.len());
}

/// Block until the child either execs (the close-on-exec write end vanishes
/// with nothing written) or reports a failure.
///
/// Returns `None` when exec succeeded.
pub(crate) fn await_exec(read_end: OwnedFd) -> Option<ChildFailure> {
    let fd = read_end.as_raw_fd();
    let mut msg = [0u8; 8];
    let mut got = 0;
    while got < msg.len() {
        match sys::read_some(fd, &mut msg[got..]) {
            Ok(0) => break,
            Ok(n) => got += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // Without the report we cannot tell whether exec happened.
                warn!(error = %e, "failed to read exec status");
                return Some(ChildFailure {
                    stage: ChildStage::Exec,
                    errno: e.raw_os_error().unwrap_or(libc::EIO),
                });
            }
        }
    }

    if got == 0 {
        return None;
    }
    if got < msg.len() {
        return Some(ChildFailure {
            stage: ChildStage::Exec,
            errno: libc::EIO,
        });
    }

    let stage = i32::from_ne_bytes([msg[0], msg[1], msg[2], msg[3]]);
    let errno = i32::from_ne_bytes([msg[4], msg[5], msg[6], msg[7]]);
    let stage = match stage {
        1 => ChildStage::WorkingDirectory,
        3 => ChildStage::Fork,
        _ => ChildStage::Exec,
    };
    Some(ChildFailure { stage, errno })
}

/// Reap a child known to be exiting right now
pub(crate) fn reap_blocking(pid: Pid) {
    loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => continue,
            _ => return,
        }
    }
}

/// Child-side descriptor and signal setup before exec.
///
/// `redirects` pairs each child end with its target fd. Child ends and the
/// report fd are first moved above every target so no `dup2` can clobber a
/// descriptor that still has to be duplicated. `inherited` are parent ends of
/// other live children, closed so they never leak into this one.
pub(crate) unsafe fn wire_child(
    redirects: &mut [(RawFd, RawFd)],
    report_fd: &mut RawFd,
    inherited: &[RawFd],
) {
    libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    libc::signal(libc::SIGCHLD, libc::SIG_DFL);
    let mut mask: libc::sigset_t = std::mem::zeroed();
    libc::sigemptyset(&mut mask);
    libc::pthread_sigmask(libc::SIG_SETMASK, &mask, ptr::null_mut());

    for &fd in inherited {
        libc::close(fd);
    }

    let floor = redirects
        .iter()
        .map(|&(_, target)| target)
        .max()
        .unwrap_or(2)
        .max(2)
        + 1;

    for (src, _) in redirects.iter_mut() {
        if *src < floor {
            let moved = libc::fcntl(*src, libc::F_DUPFD_CLOEXEC, floor);
            if moved >= 0 {
                *src = moved;
            }
        }
    }
    if *report_fd < floor {
        let moved = libc::fcntl(*report_fd, libc::F_DUPFD_CLOEXEC, floor);
        if moved >= 0 {
            *report_fd = moved;
        }
    }

    for &(src, target) in redirects.iter() {
        libc::dup2(src, target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_name_expands_over_search_path() {
        let plan = ExecPlan::new(
            &[OsString::from("tool"), OsString::from("-v")],
            None,
            Some(&["PATH=/opt/a::/opt/b".to_string()]),
            &EngineConfig::default(),
        )
        .expect("plan");
        assert_eq!(plan.candidates(), vec!["/opt/a/tool", "./tool", "/opt/b/tool"]);
    }

    #[test]
    fn test_explicit_path_is_not_searched() {
        let plan = ExecPlan::new(
            &[OsString::from("./bin/tool")],
            None,
            Some(&["PATH=/opt/a".to_string()]),
            &EngineConfig::default(),
        )
        .expect("plan");
        assert_eq!(plan.candidates(), vec!["./bin/tool"]);
    }

    #[test]
    fn test_interior_nul_is_rejected() {
        let result = ExecPlan::new(
            &[OsString::from("echo"), OsString::from("a\0b")],
            None,
            None,
            &EngineConfig::default(),
        );
        assert!(matches!(result, Err(ProcessError::InvalidArgument(_))));
    }

    #[test]
    fn test_shell_fallback_argv_keeps_arguments() {
        let plan = ExecPlan::new(
            &[OsString::from("/x/script"), OsString::from("one")],
            None,
            None,
            &EngineConfig::default(),
        )
        .expect("plan");
        // shell, candidate slot, "one", NULL
        assert_eq!(plan.shell_argv_ptrs.len(), 4);
        assert!(plan.shell_argv_ptrs[1].is_null());
        assert!(plan.shell_argv_ptrs[3].is_null());
    }

    #[test]
    fn test_await_exec_treats_clean_eof_as_success() {
        let (read, write) = sys::cloexec_pipe().expect("pipe");
        drop(write);
        assert!(await_exec(read).is_none());
    }

    #[test]
    fn test_await_exec_read_error_is_a_failure() {
        let (_read, write) = sys::cloexec_pipe().expect("pipe");
        // The write end of a pipe cannot be read from.
        let failure = await_exec(write).expect("read error must not count as success");
        assert_eq!(failure.stage, ChildStage::Exec);
        assert_eq!(failure.errno, libc::EBADF);
    }

    #[test]
    fn test_await_exec_decodes_reported_failure() {
        let (read, write) = sys::cloexec_pipe().expect("pipe");
        unsafe { report_failure(write.as_raw_fd(), ChildStage::WorkingDirectory, libc::ENOENT) };
        drop(write);
        let failure = await_exec(read).expect("failure");
        assert_eq!(failure.stage, ChildStage::WorkingDirectory);
        assert_eq!(failure.errno, libc::ENOENT);
    }
}
