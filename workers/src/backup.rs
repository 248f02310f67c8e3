//! Backup operations: exports of a VM's disks into the repository the
//! backup record addresses (1 = primary store, 2 = secondary).

use serde::Serialize;
use tracing::{error, info, warn};

use executor::ssh::HYPERVISOR_USER;
use executor::{LinuxSsh, Remote, WindowsWinRm};
use iaas::client::service;
use iaas::resource::{Backup, Server, ServerKind};
use iaas::state::{Operation, ResourceKind, State};
use settings::Settings;

use crate::lifecycle::{self, Begin};
use crate::{Deps, Job, JobOp};

const SERVICE: &str = service::BACKUP;
const KIND: ResourceKind = ResourceKind::Backup;

#[derive(Debug, Clone, Serialize)]
pub(crate) struct BackupCtx {
    pub backup_id: i64,
    pub vm_identifier: String,
    pub backup_path: String,
    pub vms_path: String,
    pub host_sudo_passwd: String,
}

/// The on-host path for a backup, addressed by its repository index.
pub(crate) fn backup_path(
    settings: &Settings,
    kind: ServerKind,
    repository: i64,
    vm_identifier: &str,
    backup_id: i64,
) -> Result<String, String> {
    match (kind, repository) {
        (ServerKind::Kvm, 1) => {
            Ok(format!("{}{vm_identifier}/{backup_id}/", settings.kvm_primary_backup_path))
        }
        (ServerKind::Kvm, 2) => {
            Ok(format!("{}{vm_identifier}/{backup_id}/", settings.kvm_secondary_backup_path))
        }
        (ServerKind::HyperV, 1) => {
            Ok(format!("{}{vm_identifier}\\{backup_id}", settings.hyperv_primary_backup_path))
        }
        (ServerKind::HyperV, 2) => {
            Ok(format!("{}{vm_identifier}\\{backup_id}", settings.hyperv_secondary_backup_path))
        }
        _ => Err(format!("unknown backup repository {repository}")),
    }
}

fn backup_ctx(deps: &Deps, backup: &Backup, kind: ServerKind) -> Result<BackupCtx, String> {
    let vm_identifier = backup.vm.identifier();
    let path = backup_path(&deps.settings, kind, backup.repository, &vm_identifier, backup.id)?;
    let vms_path = match kind {
        ServerKind::HyperV => deps.settings.hyperv_vms_path.clone(),
        _ => deps.settings.kvm_vms_path.clone(),
    };
    Ok(BackupCtx {
        backup_id: backup.id,
        vm_identifier,
        backup_path: path,
        vms_path,
        host_sudo_passwd: deps.settings.network_password.clone(),
    })
}

pub async fn run(job: Job, deps: &Deps) {
    match job.op {
        JobOp::Build => lifecycle_op(deps, job.id, Operation::Build).await,
        JobOp::Update => lifecycle_op(deps, job.id, Operation::Update).await,
        JobOp::Scrub => lifecycle_op(deps, job.id, Operation::Scrub).await,
        _ => warn!(op = ?job.op, "unsupported backup operation"),
    }
}

fn template(op: Operation, kind: ServerKind) -> &'static str {
    match (op, kind) {
        (Operation::Build, ServerKind::Kvm) => "backup/kvm/build.sh",
        (Operation::Update, ServerKind::Kvm) => "backup/kvm/update.sh",
        (Operation::Scrub, ServerKind::Kvm) => "backup/kvm/scrub.sh",
        (Operation::Build, _) => "backup/hyperv/build.ps1",
        (Operation::Update, _) => "backup/hyperv/update.ps1",
        _ => "backup/hyperv/scrub.ps1",
    }
}

pub(crate) async fn deploy(
    remote: &impl Remote,
    ctx: &BackupCtx,
    op: Operation,
    kind: ServerKind,
    errors: &mut Vec<String>,
) -> bool {
    let script = match templates::render(template(op, kind), ctx) {
        Ok(script) => script,
        Err(err) => {
            error!(error = %err, failed_reason = "template_data_failed", "render failed");
            errors.push(err.to_string());
            return false;
        }
    };
    match remote.exec_script(&script).await {
        Ok(output) => {
            if let Some(stderr) = output.real_stderr() {
                error!(stderr, "backup script produced stderr");
                errors.push(stderr.to_string());
            }
            match (op, kind) {
                (Operation::Build, ServerKind::Kvm) => {
                    output.stdout.contains(&format!("Backup done {}", ctx.vm_identifier))
                }
                (Operation::Build | Operation::Update, ServerKind::HyperV) => {
                    output.stdout.contains("Created VM backup")
                }
                (Operation::Scrub, ServerKind::Kvm) => output.stdout.contains("removed"),
                // Linux update and Windows scrub are judged by clean stderr
                _ => output.real_stderr().is_none(),
            }
        }
        Err(err) => {
            error!(error = %err, failed_reason = err.class(), "backup script failed");
            errors.push(err.to_string());
            false
        }
    }
}

async fn lifecycle_op(deps: &Deps, id: i64, op: Operation) {
    info!("commencing {op} of backup");
    let backup: Backup = match deps.api.read(SERVICE, id).await {
        Ok(backup) => backup,
        Err(iaas::ApiError::NotFound) if op == Operation::Scrub => {
            info!(failed_reason = "already_deleted", "backup already removed from the API");
            return;
        }
        Err(err) => {
            error!(error = %err, failed_reason = "invalid_backup_id", "could not read backup");
            deps.metrics.op_result(KIND, op, false);
            return;
        }
    };

    let expected = match op {
        Operation::Build => Some(State::Requested),
        Operation::Update => lifecycle::update_trigger(backup.state),
        Operation::Scrub => Some(State::Scrub),
        _ => None,
    };
    let Some(expected) = expected else {
        warn!(live = %backup.state, "cancelling {op}, backup was picked up elsewhere");
        return;
    };
    let transition = match lifecycle::begin(&deps.api, SERVICE, KIND, id, backup.state, expected)
        .await
    {
        Begin::WrongState => return,
        Begin::UpdateFailed => {
            deps.metrics.op_result(KIND, op, false);
            return;
        }
        Begin::Proceed(t) => t,
    };

    let mut errors = Vec::new();
    let server = match deps.api.read::<Server>(service::SERVER, backup.vm.server_id).await {
        Ok(server) => Some(server),
        Err(err) => {
            error!(
                error = %err,
                failed_reason = "server_not_read",
                "could not read the backup's server",
            );
            None
        }
    };

    // Captured at build start and persisted with the success update so the
    // record states what point in time the backup preserves.
    let time_valid = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();

    let done = match server {
        None => false,
        Some(server) => match server.kind() {
            ServerKind::Phantom => true,
            ServerKind::Kvm => match server.host_ip() {
                Some(host_ip) => match backup_ctx(deps, &backup, ServerKind::Kvm) {
                    Ok(ctx) => {
                        match LinuxSsh::connect(
                            host_ip,
                            HYPERVISOR_USER,
                            &deps.settings.ssh_key_path,
                        )
                        .await
                        {
                            Ok(ssh) => deploy(&ssh, &ctx, op, ServerKind::Kvm, &mut errors).await,
                            Err(err) => {
                                error!(error = %err, failed_reason = err.class(), "could not reach KVM host");
                                errors.push(err.to_string());
                                false
                            }
                        }
                    }
                    Err(err) => {
                        error!(error = %err, failed_reason = "template_data_failed", "{err}");
                        errors.push(err);
                        false
                    }
                },
                None => {
                    errors.push(format!("host ip address not found for server #{}", server.id));
                    false
                }
            },
            ServerKind::HyperV => match server.host_name() {
                Some(host) => match backup_ctx(deps, &backup, ServerKind::HyperV) {
                    Ok(ctx) => {
                        let winrm = WindowsWinRm::new(
                            host,
                            "administrator",
                            &deps.settings.network_password,
                        );
                        deploy(&winrm, &ctx, op, ServerKind::HyperV, &mut errors).await
                    }
                    Err(err) => {
                        error!(error = %err, failed_reason = "template_data_failed", "{err}");
                        errors.push(err);
                        false
                    }
                },
                None => {
                    errors.push(format!("host name not found for server #{}", server.id));
                    false
                }
            },
            ServerKind::Unsupported => {
                let message = format!("unsupported server type for backup #{id}");
                error!(failed_reason = "unsupported_server_type", "{message}");
                errors.push(message);
                false
            }
        },
    };

    if done {
        info!("successfully completed {op} of backup");
        deps.metrics.op_result(KIND, op, true);
        if op == Operation::Build {
            let mut extra = serde_json::Map::new();
            extra.insert("time_valid".to_string(), serde_json::Value::from(time_valid));
            lifecycle::finish_with(&deps.api, SERVICE, id, extra, transition.success).await;
        } else {
            lifecycle::finish(&deps.api, SERVICE, id, transition.success).await;
        }
    } else {
        error!("failed {op} of backup");
        deps.metrics.op_result(KIND, op, false);
        lifecycle::unresource(&deps.api, SERVICE, id).await;
        match op {
            Operation::Build => deps.notifier.backup_build_failure(&backup, &errors).await,
            _ => deps.notifier.backup_failure(&backup, &op.to_string(), &errors).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use executor::mock::MockRemote;

    #[test]
    fn repository_index_selects_the_store() {
        let settings = Settings::default();
        assert_eq!(
            backup_path(&settings, ServerKind::Kvm, 1, "12_42", 7).unwrap(),
            "/mnt/backup-p/12_42/7/"
        );
        assert_eq!(
            backup_path(&settings, ServerKind::Kvm, 2, "12_42", 7).unwrap(),
            "/mnt/backup-s/12_42/7/"
        );
        assert_eq!(
            backup_path(&settings, ServerKind::HyperV, 1, "12_42", 7).unwrap(),
            "P:\\12_42\\7"
        );
        assert!(backup_path(&settings, ServerKind::Kvm, 3, "12_42", 7).is_err());
    }

    fn ctx() -> BackupCtx {
        BackupCtx {
            backup_id: 7,
            vm_identifier: "12_42".to_string(),
            backup_path: "/mnt/backup-p/12_42/7/".to_string(),
            vms_path: "/var/lib/libvirt/images/".to_string(),
            host_sudo_passwd: "pw".to_string(),
        }
    }

    #[tokio::test]
    async fn kvm_build_sentinel_includes_vm_identifier() {
        let (remote, _) = MockRemote::new();
        remote.push_output("Backup done 12_42\n", "");
        let mut errors = Vec::new();
        assert!(deploy(&remote, &ctx(), Operation::Build, ServerKind::Kvm, &mut errors).await);

        let (remote, _) = MockRemote::new();
        remote.push_output("Backup done 12_43\n", "");
        let mut errors = Vec::new();
        assert!(!deploy(&remote, &ctx(), Operation::Build, ServerKind::Kvm, &mut errors).await);
    }

    #[tokio::test]
    async fn kvm_scrub_needs_removed() {
        let (remote, _) = MockRemote::new();
        remote.push_output("removed\n", "");
        let mut errors = Vec::new();
        assert!(deploy(&remote, &ctx(), Operation::Scrub, ServerKind::Kvm, &mut errors).await);

        // Nothing removed (path did not exist): that is a failure
        let (remote, _) = MockRemote::new();
        remote.push_output("", "");
        let mut errors = Vec::new();
        assert!(!deploy(&remote, &ctx(), Operation::Scrub, ServerKind::Kvm, &mut errors).await);
    }

    #[tokio::test]
    async fn hyperv_build_and_update_share_a_sentinel() {
        for op in [Operation::Build, Operation::Update] {
            let (remote, _) = MockRemote::new();
            remote.push_output("Created VM backup", "");
            let mut errors = Vec::new();
            assert!(deploy(&remote, &ctx(), op, ServerKind::HyperV, &mut errors).await);
        }
    }

    #[tokio::test]
    async fn kvm_update_succeeds_on_clean_stderr() {
        let (remote, _) = MockRemote::new();
        remote.push_output("", "");
        let mut errors = Vec::new();
        assert!(deploy(&remote, &ctx(), Operation::Update, ServerKind::Kvm, &mut errors).await);

        let (remote, _) = MockRemote::new();
        remote.push_output("", "rsync: connection unexpectedly closed");
        let mut errors = Vec::new();
        assert!(!deploy(&remote, &ctx(), Operation::Update, ServerKind::Kvm, &mut errors).await);
    }
}
