//! Snapshot operations: checkpoints of a VM's disks on its hypervisor.

use serde::Serialize;
use tracing::{error, info, warn};

use executor::ssh::HYPERVISOR_USER;
use executor::{LinuxSsh, Remote, WindowsWinRm};
use iaas::client::service;
use iaas::resource::{Server, ServerKind, Snapshot};
use iaas::state::{Operation, ResourceKind, State};

use crate::lifecycle::{self, Begin};
use crate::{Deps, Job, JobOp};

const SERVICE: &str = service::SNAPSHOT;
const KIND: ResourceKind = ResourceKind::Snapshot;

#[derive(Debug, Clone, Serialize)]
pub(crate) struct SnapshotCtx {
    pub snapshot_id: i64,
    pub snapshot_identifier: String,
    pub vm_identifier: String,
    pub remove_subtree: bool,
    pub host_sudo_passwd: String,
}

fn snapshot_ctx(deps: &Deps, snapshot: &Snapshot) -> SnapshotCtx {
    let vm_identifier = snapshot.vm.identifier();
    SnapshotCtx {
        snapshot_id: snapshot.id,
        snapshot_identifier: format!("{vm_identifier}_snapshot_{}", snapshot.id),
        vm_identifier,
        remove_subtree: snapshot.remove_subtree,
        host_sudo_passwd: deps.settings.network_password.clone(),
    }
}

pub async fn run(job: Job, deps: &Deps) {
    match job.op {
        JobOp::Build => lifecycle_op(deps, job.id, Operation::Build).await,
        JobOp::Update => lifecycle_op(deps, job.id, Operation::Update).await,
        JobOp::Scrub => lifecycle_op(deps, job.id, Operation::Scrub).await,
        _ => warn!(op = ?job.op, "unsupported snapshot operation"),
    }
}

/// Sentinels per (operation, flavour). An empty sentinel means clean
/// stderr is the success signal.
fn sentinel(op: Operation, kind: ServerKind) -> &'static str {
    match (op, kind) {
        (Operation::Build, ServerKind::Kvm) => "created",
        (Operation::Build, ServerKind::HyperV) => "Created",
        (Operation::Scrub, ServerKind::Kvm) => "deleted",
        _ => "",
    }
}

fn template(op: Operation, kind: ServerKind) -> &'static str {
    match (op, kind) {
        (Operation::Build, ServerKind::Kvm) => "snapshot/kvm/build.sh",
        (Operation::Update, ServerKind::Kvm) => "snapshot/kvm/update.sh",
        (Operation::Scrub, ServerKind::Kvm) => "snapshot/kvm/scrub.sh",
        (Operation::Build, _) => "snapshot/hyperv/build.ps1",
        (Operation::Update, _) => "snapshot/hyperv/update.ps1",
        _ => "snapshot/hyperv/scrub.ps1",
    }
}

pub(crate) async fn deploy(
    remote: &impl Remote,
    ctx: &SnapshotCtx,
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
                error!(stderr, "snapshot script produced stderr");
                errors.push(stderr.to_string());
            }
            let expected = sentinel(op, kind);
            if expected.is_empty() {
                output.real_stderr().is_none()
            } else {
                output.stdout.contains(expected)
            }
        }
        Err(err) => {
            error!(error = %err, failed_reason = err.class(), "snapshot script failed");
            errors.push(err.to_string());
            false
        }
    }
}

async fn lifecycle_op(deps: &Deps, id: i64, op: Operation) {
    info!("commencing {op} of snapshot");
    let snapshot: Snapshot = match deps.api.read(SERVICE, id).await {
        Ok(snapshot) => snapshot,
        Err(iaas::ApiError::NotFound) if op == Operation::Scrub => {
            info!(failed_reason = "already_deleted", "snapshot already removed from the API");
            return;
        }
        Err(err) => {
            error!(error = %err, failed_reason = "invalid_snapshot_id", "could not read snapshot");
            deps.metrics.op_result(KIND, op, false);
            return;
        }
    };

    let expected = match op {
        Operation::Build => Some(State::Requested),
        Operation::Update => lifecycle::update_trigger(snapshot.state),
        Operation::Scrub => Some(State::Scrub),
        _ => None,
    };
    let Some(expected) = expected else {
        warn!(live = %snapshot.state, "cancelling {op}, snapshot was picked up elsewhere");
        return;
    };
    let transition = match lifecycle::begin(&deps.api, SERVICE, KIND, id, snapshot.state, expected)
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
    let server = match deps.api.read::<Server>(service::SERVER, snapshot.vm.server_id).await {
        Ok(server) => Some(server),
        Err(err) => {
            error!(
                error = %err,
                failed_reason = "server_not_read",
                "could not read the snapshot's server",
            );
            None
        }
    };

    let done = match server {
        None => false,
        Some(server) => match server.kind() {
            ServerKind::Phantom => true,
            ServerKind::Kvm => match server.host_ip() {
                Some(host_ip) => {
                    let ctx = snapshot_ctx(deps, &snapshot);
                    match LinuxSsh::connect(host_ip, HYPERVISOR_USER, &deps.settings.ssh_key_path)
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
                None => {
                    errors.push(format!("host ip address not found for server #{}", server.id));
                    false
                }
            },
            ServerKind::HyperV => match server.host_name() {
                Some(host) => {
                    let ctx = snapshot_ctx(deps, &snapshot);
                    let winrm =
                        WindowsWinRm::new(host, "administrator", &deps.settings.network_password);
                    deploy(&winrm, &ctx, op, ServerKind::HyperV, &mut errors).await
                }
                None => {
                    errors.push(format!("host name not found for server #{}", server.id));
                    false
                }
            },
            ServerKind::Unsupported => {
                let message = format!("unsupported server type for snapshot #{id}");
                error!(failed_reason = "unsupported_server_type", "{message}");
                errors.push(message);
                false
            }
        },
    };

    if done {
        info!("successfully completed {op} of snapshot");
        deps.metrics.op_result(KIND, op, true);
        lifecycle::finish(&deps.api, SERVICE, id, transition.success).await;
    } else {
        error!("failed {op} of snapshot");
        deps.metrics.op_result(KIND, op, false);
        lifecycle::unresource(&deps.api, SERVICE, id).await;
        match op {
            Operation::Build => deps.notifier.snapshot_build_failure(&snapshot, &errors).await,
            _ => deps.notifier.snapshot_failure(&snapshot, &op.to_string(), &errors).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use executor::mock::MockRemote;

    fn ctx(remove_subtree: bool) -> SnapshotCtx {
        SnapshotCtx {
            snapshot_id: 7,
            snapshot_identifier: "12_42_snapshot_7".to_string(),
            vm_identifier: "12_42".to_string(),
            remove_subtree,
            host_sudo_passwd: "pw".to_string(),
        }
    }

    #[tokio::test]
    async fn kvm_build_needs_created_in_stdout() {
        let (remote, _) = MockRemote::new();
        remote.push_output("Domain snapshot 12_42_snapshot_7 created\n", "");
        let mut errors = Vec::new();
        assert!(deploy(&remote, &ctx(false), Operation::Build, ServerKind::Kvm, &mut errors).await);

        let (remote, _) = MockRemote::new();
        remote.push_output("nothing happened", "");
        let mut errors = Vec::new();
        assert!(!deploy(&remote, &ctx(false), Operation::Build, ServerKind::Kvm, &mut errors).await);
    }

    #[tokio::test]
    async fn hyperv_build_needs_capitalized_sentinel() {
        let (remote, _) = MockRemote::new();
        remote.push_output("Created", "");
        let mut errors = Vec::new();
        assert!(deploy(&remote, &ctx(false), Operation::Build, ServerKind::HyperV, &mut errors).await);
    }

    #[tokio::test]
    async fn scrub_passes_remove_subtree_to_the_script() {
        let (remote, tracker) = MockRemote::new();
        remote.push_output("Domain snapshot 12_42_snapshot_7 deleted\n", "");
        let mut errors = Vec::new();
        assert!(deploy(&remote, &ctx(true), Operation::Scrub, ServerKind::Kvm, &mut errors).await);
        assert!(tracker.scripts()[0].contains("--children"));

        let (remote, tracker) = MockRemote::new();
        remote.push_output("Domain snapshot 12_42_snapshot_7 deleted\n", "");
        let mut errors = Vec::new();
        assert!(deploy(&remote, &ctx(false), Operation::Scrub, ServerKind::Kvm, &mut errors).await);
        assert!(!tracker.scripts()[0].contains("--children"));
    }

    #[tokio::test]
    async fn hyperv_scrub_fails_on_real_stderr() {
        let (remote, _) = MockRemote::new();
        remote.push_output("", "Remove-VMSnapshot : not found");
        let mut errors = Vec::new();
        assert!(!deploy(&remote, &ctx(false), Operation::Scrub, ServerKind::HyperV, &mut errors).await);
        assert_eq!(errors.len(), 1);
    }
}
