use crate::mock::MockCustomizer;
use crate::RuntimeError;
use serde::Serialize;
use std::ffi::OsString;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use templar_schema::TemplateDefinition;
use tracing::{debug, info, warn};

/// Wall-clock limit for one customization run.
pub const DEFAULT_CUSTOMIZE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const SSH_PASSWORD_AUTH_CMD: &str =
    "sed -i 's/^#*PasswordAuthentication .*/PasswordAuthentication yes/' /etc/ssh/sshd_config";
const SSH_ROOT_LOGIN_CMD: &str =
    "sed -i 's/^#*PermitRootLogin .*/PermitRootLogin yes/' /etc/ssh/sshd_config";

/// One offline operation applied to a disk image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CustomizeOp {
    Update,
    Install { packages: Vec<String> },
    CopyIn { source: PathBuf, destination: String },
    RunCommand { command: String },
}

impl CustomizeOp {
    fn push_args(&self, args: &mut Vec<OsString>) {
        match self {
            Self::Update => args.push("--update".into()),
            Self::Install { packages } => {
                args.push("--install".into());
                args.push(packages.join(",").into());
            }
            Self::CopyIn {
                source,
                destination,
            } => {
                args.push("--mkdir".into());
                args.push(destination.into());
                args.push("--copy-in".into());
                let mut spec = source.as_os_str().to_owned();
                spec.push(":");
                spec.push(destination);
                args.push(spec);
            }
            Self::RunCommand { command } => {
                args.push("--run-command".into());
                args.push(command.into());
            }
        }
    }

    /// Short human label, used for logs and mock bookkeeping.
    pub fn describe(&self) -> String {
        match self {
            Self::Update => "update packages".to_owned(),
            Self::Install { packages } => format!("install {}", packages.join(",")),
            Self::CopyIn {
                source,
                destination,
            } => format!("copy {} to {destination}", source.display()),
            Self::RunCommand { command } => format!("run {command}"),
        }
    }
}

/// The ordered batch of operations for one template.
///
/// Order is fixed: package update, package install, copy-in, then
/// run-commands in declared order, then the SSH policy edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CustomizationPlan {
    template: String,
    ops: Vec<CustomizeOp>,
}

impl CustomizationPlan {
    pub fn new(template: impl Into<String>, ops: Vec<CustomizeOp>) -> Self {
        Self {
            template: template.into(),
            ops,
        }
    }

    /// Build the plan for `def`. `force_update` adds the package update
    /// step even when the definition does not request it.
    pub fn from_definition(def: &TemplateDefinition, force_update: bool) -> Self {
        let mut ops = Vec::new();
        if def.update_packages || force_update {
            ops.push(CustomizeOp::Update);
        }
        if !def.install_packages.is_empty() {
            ops.push(CustomizeOp::Install {
                packages: def.install_packages.clone(),
            });
        }
        for file in &def.copy_files {
            ops.push(CustomizeOp::CopyIn {
                source: file.source.clone(),
                destination: file.destination.clone(),
            });
        }
        for command in &def.run_commands {
            ops.push(CustomizeOp::RunCommand {
                command: command.clone(),
            });
        }
        if def.ssh_password_auth {
            ops.push(CustomizeOp::RunCommand {
                command: SSH_PASSWORD_AUTH_CMD.to_owned(),
            });
        }
        if def.ssh_root_login {
            ops.push(CustomizeOp::RunCommand {
                command: SSH_ROOT_LOGIN_CMD.to_owned(),
            });
        }
        Self::new(def.name.as_str(), ops)
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn ops(&self) -> &[CustomizeOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Full argument vector for the customization tool.
    pub fn args(&self, image: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-a".into(), image.as_os_str().to_owned()];
        for op in &self.ops {
            op.push_args(&mut args);
        }
        args
    }
}

/// Applies a plan to a disk image in place.
pub trait Customizer: Send + Sync {
    fn name(&self) -> &'static str;

    fn customize(&self, image: &Path, plan: &CustomizationPlan) -> Result<(), RuntimeError>;
}

fn never_interrupted() -> bool {
    false
}

/// Runs `virt-customize` (or a compatible program) once per plan.
pub struct VirtCustomize {
    program: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
    interrupted: fn() -> bool,
}

impl VirtCustomize {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
            poll_interval: Duration::from_millis(100),
            interrupted: never_interrupted,
        }
    }

    /// Poll `check` while the tool runs; when it returns true the tool is
    /// killed and the run fails with [`RuntimeError::Interrupted`].
    #[must_use]
    pub fn with_interrupt_check(mut self, check: fn() -> bool) -> Self {
        self.interrupted = check;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

type OutputLines = Arc<Mutex<Vec<String>>>;

fn drain<R: Read + Send + 'static>(reader: R, sink: OutputLines) -> JoinHandle<()> {
    thread::spawn(move || {
        for line in BufReader::new(reader).lines() {
            let Ok(line) = line else { break };
            if let Ok(mut lines) = sink.lock() {
                lines.push(line);
            }
        }
    })
}

fn last_stage(lines: &OutputLines) -> String {
    lines
        .lock()
        .ok()
        .and_then(|l| l.iter().rev().find(|s| !s.trim().is_empty()).cloned())
        .map_or_else(|| "starting customization".to_owned(), |s| s.trim().to_owned())
}

/// SIGKILL the whole process group led by `child`, then reap it.
fn kill_process_group(child: &mut Child) {
    if let Ok(pgid) = i32::try_from(child.id()) {
        // SAFETY: kill() with a negated valid pgid and a valid signal is safe; the group
        // was created by process_group(0) at spawn so it only contains our descendants.
        #[allow(unsafe_code)]
        let ret = unsafe { libc::kill(-pgid, libc::SIGKILL) };
        if ret != 0 {
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() != Some(libc::ESRCH) {
                warn!("failed to kill process group {pgid}: {errno}");
            }
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

impl Customizer for VirtCustomize {
    fn name(&self) -> &'static str {
        "virt-customize"
    }

    fn customize(&self, image: &Path, plan: &CustomizationPlan) -> Result<(), RuntimeError> {
        let template = plan.template().to_owned();
        if plan.is_empty() {
            debug!("[{template}] nothing to customize");
            return Ok(());
        }

        info!(
            "[{template}] customizing {} ({} operations)",
            image.display(),
            plan.ops().len()
        );
        let mut child = Command::new(&self.program)
            .args(plan.args(image))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|e| RuntimeError::Spawn {
                program: self.program.display().to_string(),
                reason: e.to_string(),
            })?;

        let lines: OutputLines = Arc::new(Mutex::new(Vec::new()));
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(drain(out, Arc::clone(&lines)));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(drain(err, Arc::clone(&lines)));
        }

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if (self.interrupted)() {
                warn!("[{template}] interrupted, killing customization");
                kill_process_group(&mut child);
                return Err(RuntimeError::Interrupted { template });
            }
            if started.elapsed() >= self.timeout {
                let stage = last_stage(&lines);
                warn!(
                    "[{template}] customization exceeded {}s, killing",
                    self.timeout.as_secs()
                );
                kill_process_group(&mut child);
                return Err(RuntimeError::CustomizationTimeout {
                    template,
                    stage,
                    timeout_secs: self.timeout.as_secs(),
                });
            }
            thread::sleep(self.poll_interval);
        };

        for reader in readers {
            let _ = reader.join();
        }

        if status.success() {
            debug!("[{template}] customization finished in {:?}", started.elapsed());
            return Ok(());
        }
        let output = lines.lock().map(|l| l.join("\n")).unwrap_or_default();
        Err(RuntimeError::Customization {
            template,
            status: status.to_string(),
            output,
        })
    }
}

/// Select a customizer implementation by name.
pub fn select_customizer(
    name: &str,
    program: &Path,
    timeout: Duration,
    interrupted: fn() -> bool,
) -> Result<Box<dyn Customizer>, RuntimeError> {
    match name {
        "virt-customize" => Ok(Box::new(
            VirtCustomize::new(program, timeout).with_interrupt_check(interrupted),
        )),
        "mock" => Ok(Box::new(MockCustomizer::new())),
        other => Err(RuntimeError::UnknownCustomizer(other.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use templar_schema::{CopyFile, TemplateName, VmSettings};

    fn definition() -> TemplateDefinition {
        TemplateDefinition {
            name: TemplateName::new("debian-12").unwrap(),
            image_url: "https://example.com/debian-12.qcow2".to_owned(),
            install_packages: vec!["vim".to_owned(), "curl".to_owned()],
            copy_files: vec![CopyFile {
                source: PathBuf::from("/srv/files/motd.sh"),
                destination: "/etc/profile.d".to_owned(),
            }],
            run_commands: vec!["chmod +x /etc/profile.d/motd.sh".to_owned()],
            update_packages: false,
            ssh_password_auth: true,
            ssh_root_login: true,
            vm: VmSettings::default(),
        }
    }

    #[test]
    fn plan_order_is_packages_files_commands_ssh() {
        let plan = CustomizationPlan::from_definition(&definition(), false);
        let kinds: Vec<_> = plan.ops().iter().map(CustomizeOp::describe).collect();
        assert_eq!(kinds[0], "install vim,curl");
        assert!(kinds[1].starts_with("copy /srv/files/motd.sh"));
        assert_eq!(kinds[2], "run chmod +x /etc/profile.d/motd.sh");
        assert!(kinds[3].contains("PasswordAuthentication yes"));
        assert!(kinds[4].contains("PermitRootLogin yes"));
        assert_eq!(kinds.len(), 5);
    }

    #[test]
    fn forced_update_comes_first() {
        let plan = CustomizationPlan::from_definition(&definition(), true);
        assert_eq!(plan.ops()[0], CustomizeOp::Update);
    }

    #[test]
    fn args_match_tool_syntax() {
        let mut def = definition();
        def.ssh_password_auth = false;
        def.ssh_root_login = false;
        def.copy_files.clear();
        let plan = CustomizationPlan::from_definition(&def, false);
        let args: Vec<String> = plan
            .args(Path::new("/tmp/disk.qcow2"))
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "-a",
                "/tmp/disk.qcow2",
                "--install",
                "vim,curl",
                "--run-command",
                "chmod +x /etc/profile.d/motd.sh",
            ]
        );
    }

    #[test]
    fn copy_in_creates_destination_first() {
        let plan = CustomizationPlan::new(
            "t",
            vec![CustomizeOp::CopyIn {
                source: PathBuf::from("/a/b.sh"),
                destination: "/opt/x".to_owned(),
            }],
        );
        let args: Vec<String> = plan
            .args(Path::new("d"))
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(&args[2..], ["--mkdir", "/opt/x", "--copy-in", "/a/b.sh:/opt/x"]);
    }

    #[test]
    fn empty_plan_does_not_spawn() {
        let tool = VirtCustomize::new("/nonexistent/virt-customize", Duration::from_secs(1));
        let plan = CustomizationPlan::new("t", Vec::new());
        assert!(tool.customize(Path::new("/tmp/x"), &plan).is_ok());
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let tool = VirtCustomize::new("/nonexistent/virt-customize", Duration::from_secs(1));
        let plan = CustomizationPlan::new("t", vec![CustomizeOp::Update]);
        assert!(matches!(
            tool.customize(Path::new("/tmp/x"), &plan),
            Err(RuntimeError::Spawn { .. })
        ));
    }

    #[test]
    fn select_unknown_customizer_fails() {
        assert!(select_customizer("nope", Path::new("x"), Duration::from_secs(1), || false).is_err());
        assert_eq!(
            select_customizer("mock", Path::new("x"), Duration::from_secs(1), || false)
                .unwrap()
                .name(),
            "mock"
        );
    }
}
