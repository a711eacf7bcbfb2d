//! Backend Process Management
//!
//! Interpreter resolution, environment setup, and process spawning.
//! The backend always gets an explicit program path, working directory and
//! environment map; nothing is activated in the launcher's own environment.

use std::collections::HashMap;
use std::env;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use crate::config::{BackendConfig, BackendOutput};

/// Vars kept when the backend does not inherit the launcher's environment.
const ESSENTIAL_ENV: &[&str] = &["PATH", "HOME", "USERPROFILE", "SYSTEMROOT", "TEMP", "TMP"];

/// Resolve `program` against a virtual environment in `working_dir`.
///
/// Only bare `python`/`python3` are resolved; anything else is returned as
/// given. Falls back to the bare name so the OS search path applies.
/// A venv interpreter is returned as an absolute path, since the child is
/// spawned with `working_dir` as its current directory.
pub fn resolve_interpreter(program: &str, working_dir: &Path) -> PathBuf {
    if program != "python" && program != "python3" {
        return PathBuf::from(program);
    }

    let candidates: Vec<PathBuf> = if cfg!(target_os = "windows") {
        vec![
            working_dir.join("venv").join("Scripts").join("python.exe"),
            working_dir.join(".venv").join("Scripts").join("python.exe"),
        ]
    } else {
        vec![
            working_dir.join("venv").join("bin").join("python"),
            working_dir.join(".venv").join("bin").join("python"),
        ]
    };

    for path in candidates {
        if path.exists() {
            return absolute_path(path);
        }
    }

    PathBuf::from(program)
}

fn absolute_path(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    match env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(e) => {
            log::warn!("[Backend] Cannot resolve {:?} against current dir: {}", path, e);
            path
        }
    }
}

/// Build the environment for the backend process
pub fn backend_env(config: &BackendConfig) -> HashMap<String, String> {
    backend_env_from(config, env::vars())
}

pub fn backend_env_from<I>(config: &BackendConfig, parent: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let parent: HashMap<String, String> = parent.into_iter().collect();

    let mut env_vars: HashMap<String, String> = if config.inherit_env {
        parent.clone()
    } else {
        parent
            .iter()
            .filter(|(k, _)| ESSENTIAL_ENV.iter().any(|e| e.eq_ignore_ascii_case(k)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    };

    for key in &config.forward_env {
        match parent.get(key) {
            Some(value) => {
                log::info!("[Backend] Forwarding {}={}", key, value);
                env_vars.insert(key.clone(), value.clone());
            }
            None => log::debug!("[Backend] {} not set, nothing to forward", key),
        }
    }

    // Unbuffered output so forwarded log lines show up as they are written
    env_vars.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());

    for (key, value) in &config.env {
        env_vars.insert(key.clone(), value.clone());
    }

    env_vars
}

/// Build the backend command without spawning it.
pub fn backend_command(config: &BackendConfig) -> std::io::Result<Command> {
    let program = resolve_interpreter(&config.program, &config.working_dir);

    if !config.working_dir.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!(
                "working directory {} does not exist",
                config.working_dir.display()
            ),
        ));
    }

    let mut cmd = Command::new(&program);
    cmd.args(&config.args)
        .current_dir(&config.working_dir)
        .env_clear()
        .envs(backend_env(config))
        .stdin(Stdio::null());

    match config.effective_output() {
        BackendOutput::Forward => {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        BackendOutput::Inherit => {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }
        BackendOutput::Null => {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        BackendOutput::File(path) => {
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            let err_file = file.try_clone()?;
            log::info!("[Backend] Output: {}", path.display());
            cmd.stdout(file).stderr(err_file);
        }
    }

    // Own process group so terminal signals aimed at the launcher do not
    // reach the backend
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);
    }

    Ok(cmd)
}

/// Spawn the backend process
pub fn spawn_backend(config: &BackendConfig) -> std::io::Result<Child> {
    let mut cmd = backend_command(config)?;

    log::info!("[Backend] Program: {:?}", cmd.get_program());
    log::info!("[Backend] Working directory: {:?}", config.working_dir);

    let mut child = cmd.spawn()?;
    forward_output(&mut child);
    Ok(child)
}

/// Log piped stdout/stderr lines from background threads.
fn forward_output(child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        let reader = BufReader::new(stdout);
        std::thread::spawn(move || {
            for line in reader.lines().map_while(Result::ok) {
                if !line.is_empty() {
                    log::info!("[Backend] {}", line);
                }
            }
        });
    }

    if let Some(stderr) = child.stderr.take() {
        let reader = BufReader::new(stderr);
        std::thread::spawn(move || {
            for line in reader.lines().map_while(Result::ok) {
                if !line.is_empty() {
                    if line.contains("ERROR") || line.contains("Exception") {
                        log::error!("[Backend Error] {}", line);
                    } else {
                        log::info!("[Backend] {}", line);
                    }
                }
            }
        });
    }
}

/// Ask the backend's process group to stop (SIGINT).
#[cfg(not(target_os = "windows"))]
pub fn graceful_kill_process(pid: u32) {
    let _ = Command::new("kill")
        .args(["-INT", "--", &format!("-{}", pid)])
        .output();
}

#[cfg(target_os = "windows")]
pub fn graceful_kill_process(pid: u32) {
    let _ = Command::new("taskkill")
        .args(["/pid", &pid.to_string(), "/T"])
        .output();
}

/// Force kill the backend's process group
#[cfg(not(target_os = "windows"))]
pub fn force_kill_process(pid: u32) {
    let _ = Command::new("kill")
        .args(["-KILL", "--", &format!("-{}", pid)])
        .output();
}

#[cfg(target_os = "windows")]
pub fn force_kill_process(pid: u32) {
    let _ = Command::new("taskkill")
        .args(["/pid", &pid.to_string(), "/T", "/F"])
        .output();
}
