//! Rendering of automation inputs: WinRM inventories, single-role playbooks
//! and the marker-wrapped shell scripts run on the automation host.
//!
//! Everything here is string-in, string-out. Values interpolated into YAML go
//! through [`yaml_scalar`]; values interpolated into shell go through
//! [`shell_quote`].

use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Ansible host group every generated inventory declares.
pub const WINDOWS_GROUP: &str = "windows";

/// Quote a value as a single-quoted YAML scalar. Embedded quotes are doubled.
#[must_use]
pub fn yaml_scalar(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Quote a value for a POSIX shell using single quotes.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// INI inventory reaching `hosts` over plain-HTTP basic-auth WinRM.
#[must_use]
pub fn winrm_inventory(hosts: &[String], port: u16, user: &str, password: &str) -> String {
    let mut out = format!("[{WINDOWS_GROUP}]\n");
    for host in hosts {
        out.push_str(host);
        out.push('\n');
    }
    let _ = write!(
        out,
        "\n[{WINDOWS_GROUP}:vars]\n\
         ansible_user={user}\n\
         ansible_password={password}\n\
         ansible_port={port}\n\
         ansible_connection=winrm\n\
         ansible_winrm_scheme=http\n\
         ansible_winrm_transport=basic\n\
         ansible_winrm_server_cert_validation=ignore\n\
         ansible_winrm_read_timeout_sec=900\n\
         ansible_winrm_operation_timeout_sec=120\n"
    );
    out
}

/// Playbook applying `roles` in order to the windows group, each role
/// receiving `vars`.
#[must_use]
pub fn role_playbook(roles: &[String], vars: &BTreeMap<String, String>) -> String {
    let mut out = format!("- hosts: {WINDOWS_GROUP}\n  gather_facts: yes\n  roles:\n");
    for role in roles {
        let _ = writeln!(out, "  - role: {role}");
        for (key, value) in vars {
            let _ = writeln!(out, "    {key}: {}", yaml_scalar(value));
        }
    }
    out
}

/// Wrap `command` so its output and exit code land in `log_path` between
/// `===== TAG START =====` and `===== TAG END (exit=N) =====` markers.
/// The script exits with the command's exit code.
#[must_use]
pub fn marked_script(tag: &str, command: &str, log_path: &str, logs_dir: &str) -> String {
    format!(
        "mkdir -p {logs_dir}; \
         echo '===== {tag} START =====' >> {log_path}; \
         {{ {command} >> {log_path} 2>&1; rc=$?; }} ; \
         echo '===== {tag} END (exit='$rc') =====' >> {log_path}; \
         exit $rc"
    )
}

/// Append one timestamped line to a remote log.
#[must_use]
pub fn append_log_line(log_path: &str, timestamp: &str, message: &str) -> String {
    let line = format!("[{timestamp}] {message}");
    format!("echo {} >> {log_path}", shell_quote(&line))
}

/// Best-effort remote termination of a tracked job: the recorded playbook and
/// ssh PIDs, then anything still running its playbook file.
#[must_use]
pub fn kill_remote_script(pids_dir: &str, job_id: &str) -> String {
    format!(
        "(test -f {pids_dir}/{job_id}.pid && kill -9 $(cat {pids_dir}/{job_id}.pid) || true); \
         (test -f {pids_dir}/{job_id}.sshpid && kill -9 $(cat {pids_dir}/{job_id}.sshpid) || true); \
         pkill -f playbook_{job_id}.yml || true"
    )
}

/// One-shot role run: roles path exported, then a marker-wrapped playbook run.
#[must_use]
pub fn role_script(
    roles_dir: &str,
    tag: &str,
    inventory: &str,
    playbook: &str,
    log_path: &str,
    logs_dir: &str,
) -> String {
    format!(
        "export ANSIBLE_ROLES_PATH={}; {}",
        shell_quote(roles_dir),
        marked_script(
            tag,
            &format!("ansible-playbook -i {inventory} {playbook}"),
            log_path,
            logs_dir
        )
    )
}

/// Paths and ids one attempt of a tracked job needs.
#[derive(Debug, Clone, Copy)]
pub struct AttemptLayout<'a> {
    pub job_id: &'a str,
    pub roles_dir: &'a str,
    pub logs_dir: &'a str,
    pub pids_dir: &'a str,
    pub inventory: &'a str,
    pub playbook: &'a str,
    pub log_path: &'a str,
}

/// One attempt of a tracked job. The shell and playbook PIDs are written to
/// `{pids_dir}/{job_id}.sshpid` and `.pid` so [`kill_remote_script`] can find them.
#[must_use]
pub fn tracked_attempt_script(layout: &AttemptLayout<'_>, attempt: u32) -> String {
    let AttemptLayout {
        job_id,
        roles_dir,
        logs_dir,
        pids_dir,
        inventory,
        playbook,
        log_path,
    } = *layout;
    format!(
        "export ANSIBLE_ROLES_PATH={roles}; \
         mkdir -p {logs_dir} {pids_dir}; \
         echo $$ > {pids_dir}/{job_id}.sshpid; \
         echo '===== ATTEMPT #{attempt} START ansible-playbook =====' >> {log_path}; \
         {{ ansible-playbook -i {inventory} {playbook} >> {log_path} 2>&1 & \
         echo $! > {pids_dir}/{job_id}.pid; wait $!; rc=$?; }} ; \
         echo '===== ATTEMPT #{attempt} END (exit='$rc') =====' >> {log_path}; \
         exit $rc",
        roles = shell_quote(roles_dir)
    )
}

/// `-e "k=v k=v"` argument for appliance playbooks. Values are emitted in the
/// given order.
#[must_use]
pub fn extra_vars(pairs: &[(&str, &str)]) -> String {
    let joined = pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ");
    format!("-e \"{joined}\"")
}
