// src/psm/scriptlet.rs

//! Scriptlet execution and the failure policy table

use crate::config::TransactionConfig;
use crate::error::{Error, Result};
use crate::package::{Scriptlet, ScriptletKind, TriggerSense};
use crate::psm::reaper::Reaper;
use crate::transaction::element::Goal;
use nix::unistd::{chdir, chroot};
use std::ffi::CString;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

const SCRIPT_PATH: &str = "/sbin:/bin:/usr/sbin:/usr/bin:/usr/X11R6/bin";
const DEFAULT_INTERPRETER: &str = "/bin/sh";
const LUA_INTERPRETER: &str = "<lua>";

/// Which script of a package is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptSlot {
    Lifecycle(ScriptletKind),
    Trigger(TriggerSense),
}

impl ScriptSlot {
    pub fn tag_name(self) -> &'static str {
        match self {
            ScriptSlot::Lifecycle(kind) => kind.tag_name(),
            ScriptSlot::Trigger(sense) => sense.tag_name(),
        }
    }
}

/// What a scriptlet failure does to its element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// The element fails
    Fatal,
    /// Logged, the element carries on
    Warn,
}

const POLICY: &[(Goal, ScriptSlot, FailurePolicy)] = &[
    (Goal::Install, ScriptSlot::Lifecycle(ScriptletKind::PreTrans), FailurePolicy::Fatal),
    (Goal::Install, ScriptSlot::Lifecycle(ScriptletKind::PreInstall), FailurePolicy::Fatal),
    (Goal::Install, ScriptSlot::Lifecycle(ScriptletKind::PostInstall), FailurePolicy::Warn),
    (Goal::Install, ScriptSlot::Lifecycle(ScriptletKind::PostTrans), FailurePolicy::Warn),
    (Goal::Install, ScriptSlot::Trigger(TriggerSense::In), FailurePolicy::Warn),
    (Goal::Erase, ScriptSlot::Lifecycle(ScriptletKind::PreErase), FailurePolicy::Fatal),
    (Goal::Erase, ScriptSlot::Lifecycle(ScriptletKind::PostErase), FailurePolicy::Warn),
    (Goal::Erase, ScriptSlot::Trigger(TriggerSense::Un), FailurePolicy::Warn),
    (Goal::Erase, ScriptSlot::Trigger(TriggerSense::PostUn), FailurePolicy::Warn),
];

/// Failure policy for a script slot; anything not listed only warns
pub fn failure_policy(goal: Goal, slot: ScriptSlot) -> FailurePolicy {
    POLICY
        .iter()
        .find(|(g, s, _)| *g == goal && *s == slot)
        .map(|(_, _, policy)| *policy)
        .unwrap_or(FailurePolicy::Warn)
}

/// One scriptlet invocation
#[derive(Debug, Clone)]
pub struct ScriptRequest<'s> {
    /// NEVRA of the package owning the script
    pub package: &'s str,
    pub slot: ScriptSlot,
    pub script: &'s Scriptlet,
    /// Positional arguments (instance counts)
    pub args: Vec<i64>,
    /// Relocated install prefixes, exported as RPM_INSTALL_PREFIXn
    pub prefixes: &'s [String],
}

impl ScriptRequest<'_> {
    fn label(&self) -> String {
        format!("{}({})", self.slot.tag_name(), self.package)
    }
}

/// Runs scriptlets beneath the install root
pub struct ScriptRunner<'a> {
    config: &'a TransactionConfig,
    reaper: Reaper,
}

impl<'a> ScriptRunner<'a> {
    pub fn new(config: &'a TransactionConfig) -> Result<Self> {
        Ok(Self {
            config,
            reaper: Reaper::new()?,
        })
    }

    fn chrooted(&self) -> bool {
        !self.config.is_real_root() && self.config.script_chroot
    }

    /// Run a script, applying its failure policy for `goal`
    pub fn run_for(&self, goal: Goal, request: &ScriptRequest<'_>) -> Result<()> {
        match self.run(request) {
            Ok(()) => Ok(()),
            Err(e) => match failure_policy(goal, request.slot) {
                FailurePolicy::Fatal => Err(e),
                FailurePolicy::Warn => {
                    warn!("{}", e);
                    Ok(())
                }
            },
        }
    }

    /// Run a script; any failure is returned
    pub fn run(&self, request: &ScriptRequest<'_>) -> Result<()> {
        let label = request.label();
        let script = request.script;

        if script.interpreter.first().map(String::as_str) == Some(LUA_INTERPRETER) {
            warn!("{}: embedded lua scriptlets are not supported, skipping", label);
            return Ok(());
        }
        if script.body.is_none() && script.interpreter.is_empty() {
            return Ok(());
        }

        let interpreter: Vec<String> = if script.interpreter.is_empty() {
            vec![DEFAULT_INTERPRETER.to_string()]
        } else {
            script.interpreter.clone()
        };

        let mut command = Command::new(&interpreter[0]);
        command.args(&interpreter[1..]);

        let _script_file = match &script.body {
            Some(body) => {
                let file = self.write_script(body)?;
                command.arg(self.path_in_root(file.path()));
                Some(file)
            }
            None => None,
        };

        command.args(request.args.iter().map(i64::to_string));
        command.env("PATH", SCRIPT_PATH);
        for (index, prefix) in request.prefixes.iter().enumerate() {
            command.env(format!("RPM_INSTALL_PREFIX{}", index), prefix);
            if index == 0 {
                command.env("RPM_INSTALL_PREFIX", prefix);
            }
        }

        command.stdin(Stdio::piped());
        match &self.config.script_log {
            Some(log) => {
                let out = OpenOptions::new().create(true).append(true).open(log)?;
                let err = out.try_clone()?;
                command.stdout(out).stderr(err);
            }
            None => {
                command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
        }

        if self.chrooted() {
            let root = CString::new(self.config.root.as_os_str().as_bytes())
                .map_err(|e| Error::scriptlet(&label, e.to_string()))?;
            // chroot and chdir are async-signal-safe
            unsafe {
                command.pre_exec(move || {
                    chroot(root.as_c_str())?;
                    chdir(c"/")?;
                    Ok(())
                });
            }
        } else {
            command.current_dir(&self.config.root);
        }

        debug!("Running {}: {:?}", label, command);
        let mut child = command
            .spawn()
            .map_err(|e| Error::scriptlet(&label, format!("cannot execute {}: {}", interpreter[0], e)))?;
        let mut guard = self.reaper.register(child.id())?;
        drop(child.stdin.take());

        let status = guard.wait()?;
        if status.success() {
            info!("{} completed", label);
            return Ok(());
        }

        let reason = match status.code() {
            Some(code) => format!("exit status {}", code),
            None => format!("terminated by {}", status),
        };
        Err(Error::scriptlet(label, reason))
    }

    /// Write a script body to a temporary file the script can reach
    fn write_script(&self, body: &str) -> Result<tempfile::NamedTempFile> {
        let dir = if self.chrooted() {
            self.config.root_path("/var/tmp")
        } else {
            std::env::temp_dir()
        };
        fs::create_dir_all(&dir)?;

        let mut file = tempfile::Builder::new().prefix("rpm-tmp.").tempfile_in(&dir)?;
        file.write_all(body.as_bytes())?;
        file.flush()?;
        Ok(file)
    }

    fn path_in_root(&self, path: &Path) -> PathBuf {
        if !self.chrooted() {
            return path.to_path_buf();
        }
        match path.strip_prefix(&self.config.root) {
            Ok(relative) => Path::new("/").join(relative),
            Err(_) => path.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(root: &Path) -> TransactionConfig {
        let mut config = TransactionConfig::with_root(root);
        config.script_chroot = false;
        config
    }

    fn request<'s>(script: &'s Scriptlet, slot: ScriptSlot, prefixes: &'s [String]) -> ScriptRequest<'s> {
        ScriptRequest {
            package: "foo-1.0-1.noarch",
            slot,
            script,
            args: vec![1],
            prefixes,
        }
    }

    #[test]
    fn test_policy_table() {
        let pre = ScriptSlot::Lifecycle(ScriptletKind::PreInstall);
        let post = ScriptSlot::Lifecycle(ScriptletKind::PostInstall);
        assert_eq!(failure_policy(Goal::Install, pre), FailurePolicy::Fatal);
        assert_eq!(failure_policy(Goal::Install, post), FailurePolicy::Warn);
        assert_eq!(
            failure_policy(Goal::Erase, ScriptSlot::Lifecycle(ScriptletKind::PreErase)),
            FailurePolicy::Fatal
        );
        assert_eq!(
            failure_policy(Goal::Erase, ScriptSlot::Trigger(TriggerSense::Un)),
            FailurePolicy::Warn
        );
    }

    #[test]
    fn test_script_sees_args_prefix_and_cwd() {
        let root = TempDir::new().unwrap();
        let config = config(root.path());
        let runner = ScriptRunner::new(&config).unwrap();
        let out = root.path().join("out");

        let script = Scriptlet::shell(format!(
            "echo \"$1 $RPM_INSTALL_PREFIX0 $PATH\" > {}",
            out.display()
        ));
        let prefixes = vec!["/opt".to_string()];
        runner
            .run(&request(&script, ScriptSlot::Lifecycle(ScriptletKind::PostInstall), &prefixes))
            .unwrap();

        let written = fs::read_to_string(&out).unwrap();
        assert_eq!(written.trim(), format!("1 /opt {}", SCRIPT_PATH));
    }

    #[test]
    fn test_failure_policy_applies() {
        let root = TempDir::new().unwrap();
        let config = config(root.path());
        let runner = ScriptRunner::new(&config).unwrap();
        let script = Scriptlet::shell("exit 1");

        let pre = request(&script, ScriptSlot::Lifecycle(ScriptletKind::PreInstall), &[]);
        let err = runner.run_for(Goal::Install, &pre).unwrap_err();
        assert!(err.to_string().contains("%pre(foo-1.0-1.noarch)"));

        let post = request(&script, ScriptSlot::Lifecycle(ScriptletKind::PostInstall), &[]);
        assert!(runner.run_for(Goal::Install, &post).is_ok());
    }

    #[test]
    fn test_interpreter_only_and_lua_scripts() {
        let root = TempDir::new().unwrap();
        let config = config(root.path());
        let runner = ScriptRunner::new(&config).unwrap();

        let program = Scriptlet {
            interpreter: vec!["/bin/sh".to_string(), "-c".to_string(), "exit $0".to_string()],
            body: None,
        };
        let slot = ScriptSlot::Lifecycle(ScriptletKind::PostInstall);
        // `$0` receives the first positional argument, 1
        assert!(runner.run(&request(&program, slot, &[])).is_err());

        let lua = Scriptlet {
            interpreter: vec![LUA_INTERPRETER.to_string()],
            body: Some("error()".to_string()),
        };
        assert!(runner.run(&request(&lua, slot, &[])).is_ok());
    }

    #[test]
    fn test_output_goes_to_script_log() {
        let root = TempDir::new().unwrap();
        let mut config = config(root.path());
        let log = root.path().join("scripts.log");
        config.script_log = Some(log.clone());
        let runner = ScriptRunner::new(&config).unwrap();

        let script = Scriptlet::shell("echo to-stdout; echo to-stderr >&2");
        runner
            .run(&request(&script, ScriptSlot::Lifecycle(ScriptletKind::PostInstall), &[]))
            .unwrap();

        let logged = fs::read_to_string(&log).unwrap();
        assert!(logged.contains("to-stdout"));
        assert!(logged.contains("to-stderr"));
    }
}
