//! VM operations on KVM and Hyper-V hypervisors.
//!
//! The flavour is selected by the server record: KVM runs bash over SSH
//! with files staged on the region network share, Hyper-V runs PowerShell
//! over WinRM, and Phantom servers short-circuit to state updates only.
//! Success is judged by the explicit sentinel each template echoes.

use std::time::Duration;

use chrono::NaiveDateTime;
use tracing::{error, info, warn};

use executor::ssh::HYPERVISOR_USER;
use executor::{ExecOutput, LinuxSsh, Remote, WindowsWinRm};
use iaas::client::service;
use iaas::resource::{IpAddress, Server, ServerKind, Vm};
use iaas::state::{Operation, ResourceKind, State};

use crate::context::{self, VmHyperVCtx, VmKvmCtx};
use crate::lifecycle::{self, Begin, VmBuildGate};
use crate::stager::{self, StagingDir, ADMIN_PASSWORD_LEN, ROOT_PASSWORD_LEN};
use crate::{Deps, Job, JobOp};

const SERVICE: &str = service::VM;
const KIND: ResourceKind = ResourceKind::Vm;

/// How long a build waits for its project router to come up.
const ROUTER_RETRY: Duration = Duration::from_secs(10);
/// The midnight sweep scrubs queued VMs after this many days; quoted in
/// the scheduled-deletion email.
const SCRUB_RETENTION_DAYS: i64 = 7;

const KVM_BUILD_DONE: &str = "Domain creation completed";
const HYPERV_BUILD_DONE: &str = "VM Successfully Created";
const HYPERV_UPDATE_DONE: &str = "VM Successfully Updated";

pub async fn run(job: Job, deps: &Deps) {
    match job.op {
        JobOp::Build => build(deps, job).await,
        JobOp::Update => update(deps, job.id).await,
        JobOp::Quiesce => quiesce(deps, job.id).await,
        JobOp::Restart => restart(deps, job.id).await,
        JobOp::Scrub => scrub(deps, job.id).await,
        JobOp::DebugReset => warn!("debug reset is not a VM operation"),
    }
}

// ─── Shared pieces ─────────────────────────────────────────────────────────

async fn read_vm(deps: &Deps, id: i64) -> Option<Vm> {
    match deps.api.read::<Vm>(SERVICE, id).await {
        Ok(vm) => Some(vm),
        Err(err) => {
            error!(error = %err, failed_reason = "invalid_vm_id", "could not read VM");
            None
        }
    }
}

async fn read_server(deps: &Deps, server_id: i64) -> Option<Server> {
    match deps.api.read::<Server>(service::SERVER, server_id).await {
        Ok(server) => Some(server),
        Err(err) => {
            error!(
                server_id,
                error = %err,
                failed_reason = "server_not_read",
                "could not read the VM's server",
            );
            None
        }
    }
}

/// Quarantine the VM and send the operation's failure report.
async fn unresource(deps: &Deps, vm: &Vm, op: Operation, errors: &[String]) {
    deps.metrics.op_result(KIND, op, false);
    lifecycle::unresource(&deps.api, SERVICE, vm.id).await;
    match op {
        Operation::Build => deps.notifier.vm_build_failure(vm, errors).await,
        _ => deps.notifier.vm_failure(vm, &op.to_string(), errors).await,
    }
}

async fn connect_kvm(deps: &Deps, host_ip: &str, errors: &mut Vec<String>) -> Option<LinuxSsh> {
    match LinuxSsh::connect(host_ip, HYPERVISOR_USER, &deps.settings.ssh_key_path).await {
        Ok(ssh) => Some(ssh),
        Err(err) => {
            error!(error = %err, failed_reason = err.class(), "could not reach KVM host");
            errors.push(err.to_string());
            None
        }
    }
}

async fn exec(remote: &impl Remote, script: &str, errors: &mut Vec<String>) -> Option<ExecOutput> {
    match remote.exec_script(script).await {
        Ok(output) => {
            if let Some(stderr) = output.real_stderr() {
                error!(stderr, "remote script produced stderr");
                errors.push(stderr.to_string());
            }
            Some(output)
        }
        Err(err) => {
            error!(error = %err, failed_reason = err.class(), "remote script failed");
            errors.push(err.to_string());
            None
        }
    }
}

fn render_or_fail(template: &str, ctx: &impl serde::Serialize, errors: &mut Vec<String>) -> Option<String> {
    match templates::render(template, ctx) {
        Ok(rendered) => Some(rendered),
        Err(err) => {
            error!(template, error = %err, failed_reason = "template_data_failed", "render failed");
            errors.push(err.to_string());
            None
        }
    }
}

fn kvm_context(
    deps: &Deps,
    vm: &Vm,
    admin_password: String,
    crypted_admin_password: String,
    crypted_root_password: String,
) -> VmKvmCtx {
    VmKvmCtx {
        vm_identifier: vm.identifier(),
        image_filename: vm.image.filename.clone(),
        image_os_variant: vm.image.os_variant.clone(),
        cpu: vm.cpu,
        ram: vm.ram * 1024,
        dns: vm.dns.clone().unwrap_or_default(),
        admin_password,
        crypted_admin_password,
        crypted_root_password,
        ssh_public_key: vm.public_key.clone().filter(|key| !key.is_empty()),
        storages: context::storages_ctx(vm),
        storage_type: vm.storage_type.clone(),
        nics: context::derive_nics(vm),
        keyboard: context::KEYBOARD.to_string(),
        language: context::LANGUAGE.to_string(),
        timezone: context::TIMEZONE.to_string(),
        host_sudo_passwd: deps.settings.network_password.clone(),
        network_drive_path: deps.settings.kvm_host_drive_path.clone(),
        vms_path: deps.settings.kvm_vms_path.clone(),
        drives: context::derive_drive_updates(vm),
    }
}

fn hyperv_context(deps: &Deps, vm: &Vm, admin_password: String, restart: bool) -> VmHyperVCtx {
    VmHyperVCtx {
        vm_identifier: vm.identifier(),
        image_filename: vm.image.filename.clone(),
        cpu: vm.cpu,
        ram: vm.ram * 1024,
        dns: vm.dns.clone().unwrap_or_default(),
        admin_password,
        storages: context::storages_ctx(vm),
        storage_type: vm.storage_type.clone(),
        nics: context::derive_nics(vm),
        keyboard: context::KEYBOARD.to_string(),
        language: context::LANGUAGE.to_string(),
        timezone: context::TIMEZONE.to_string(),
        network_drive_url: deps.settings.hyperv_robot_drive_path.clone(),
        vms_path: deps.settings.hyperv_vms_path.clone(),
        drives: context::derive_drive_updates(vm),
        restart,
    }
}

fn winrm_driver(deps: &Deps, server: &Server, errors: &mut Vec<String>) -> Option<WindowsWinRm> {
    match server.host_name() {
        Some(host) => Some(WindowsWinRm::new(
            host,
            "administrator",
            &deps.settings.network_password,
        )),
        None => {
            let message = format!("host name not found for server #{}", server.id);
            error!(failed_reason = "template_data_failed", "{message}");
            errors.push(message);
            None
        }
    }
}

fn host_ip_or_fail(server: &Server, errors: &mut Vec<String>) -> Option<String> {
    match server.host_ip() {
        Some(ip) => Some(ip.to_string()),
        None => {
            let message = format!("host ip address not found for server #{}", server.id);
            error!(failed_reason = "template_data_failed", "{message}");
            errors.push(message);
            None
        }
    }
}

// ─── Deploy sequences (generic over the driver) ────────────────────────────

/// KVM build: bridge script first, then the domain build; success is the
/// explicit completion line from the build script.
pub(crate) async fn deploy_kvm_build(
    remote: &impl Remote,
    ctx: &VmKvmCtx,
    errors: &mut Vec<String>,
) -> bool {
    let Some(bridge_script) = render_or_fail("vm/kvm/bridge_build.sh", ctx, errors) else {
        return false;
    };
    let Some(build_script) = render_or_fail("vm/kvm/build.sh", ctx, errors) else {
        return false;
    };
    if exec(remote, &bridge_script, errors).await.is_none() {
        return false;
    }
    match exec(remote, &build_script, errors).await {
        Some(output) => output.stdout.contains(KVM_BUILD_DONE),
        None => false,
    }
}

/// KVM scrub: remove the domain, then the bridges when this was the last
/// KVM VM in its subnets.
pub(crate) async fn deploy_kvm_scrub(
    remote: &impl Remote,
    ctx: &VmKvmCtx,
    delete_bridge: bool,
    errors: &mut Vec<String>,
) -> bool {
    let Some(scrub_script) = render_or_fail("vm/kvm/scrub.sh", ctx, errors) else {
        return false;
    };
    let scrubbed = match exec(remote, &scrub_script, errors).await {
        Some(output) => !output.stdout.is_empty(),
        None => return false,
    };
    if delete_bridge {
        info!("last KVM VM in subnet, deleting its bridges");
        if let Some(bridge_script) = render_or_fail("vm/kvm/bridge_scrub.sh", ctx, errors) {
            exec(remote, &bridge_script, errors).await;
        }
    }
    scrubbed
}

/// The simple single-script KVM operations: success unless the channel
/// itself failed.
pub(crate) async fn deploy_kvm_script(
    remote: &impl Remote,
    template: &str,
    ctx: &VmKvmCtx,
    errors: &mut Vec<String>,
) -> bool {
    let Some(script) = render_or_fail(template, ctx, errors) else {
        return false;
    };
    exec(remote, &script, errors).await.is_some()
}

/// Hyper-V operations assert success with a sentinel in stdout; an empty
/// sentinel means "no real stderr" is enough.
pub(crate) async fn deploy_hyperv_script(
    remote: &impl Remote,
    template: &str,
    ctx: &VmHyperVCtx,
    sentinel: &str,
    errors: &mut Vec<String>,
) -> bool {
    let Some(script) = render_or_fail(template, ctx, errors) else {
        return false;
    };
    match exec(remote, &script, errors).await {
        Some(output) => {
            if sentinel.is_empty() {
                output.real_stderr().is_none()
            } else {
                output.stdout.contains(sentinel)
            }
        }
        None => false,
    }
}

// ─── Build ─────────────────────────────────────────────────────────────────

async fn build(deps: &Deps, job: Job) {
    let vm_id = job.id;
    info!("commencing build of VM");
    let Some(vm) = read_vm(deps, vm_id).await else {
        deps.metrics.op_result(KIND, Operation::Build, false);
        return;
    };
    if vm.state != State::Requested {
        warn!(live = %vm.state, "cancelling build, VM was picked up elsewhere");
        return;
    }

    let mut errors: Vec<String> = Vec::new();

    // A VM only builds behind a RUNNING project router
    let Some(vr_id) = vm.project.virtual_router_id else {
        errors.push(format!("VM #{vm_id} has no project virtual router"));
        unresource(deps, &vm, Operation::Build, &errors).await;
        return;
    };
    let router: iaas::resource::VirtualRouter = match deps
        .api
        .read(service::VIRTUAL_ROUTER, vr_id)
        .await
    {
        Ok(router) => router,
        Err(err) => {
            error!(vr_id, error = %err, "could not read the project virtual router");
            return;
        }
    };
    match lifecycle::vm_build_gate(router.state) {
        VmBuildGate::Proceed => {}
        VmBuildGate::Unresource => {
            let message = format!(
                "virtual router #{vr_id} is UNRESOURCED so VM #{vm_id} cannot be built"
            );
            error!(failed_reason = "vr_unresourced", "{message}");
            errors.push(message);
            unresource(deps, &vm, Operation::Build, &errors).await;
            return;
        }
        VmBuildGate::Reschedule => {
            warn!(
                vr_id,
                router_state = %router.state,
                failed_reason = "vr_not_ready",
                "virtual router not yet built, postponing VM build",
            );
            deps.queue.enqueue_after(job, ROUTER_RETRY);
            return;
        }
    }

    match lifecycle::begin(&deps.api, SERVICE, KIND, vm_id, vm.state, State::Requested).await {
        Begin::WrongState => return,
        Begin::UpdateFailed => {
            deps.metrics.op_result(KIND, Operation::Build, false);
            return;
        }
        Begin::Proceed(_) => {}
    }

    let Some(server) = read_server(deps, vm.server_id).await else {
        unresource(deps, &vm, Operation::Build, &errors).await;
        return;
    };

    let mut send_email = true;
    let built: Option<String> = match server.kind() {
        ServerKind::Kvm => build_kvm(deps, &vm, &server, &mut errors).await,
        ServerKind::HyperV => build_hyperv(deps, &vm, &server, &mut errors).await,
        ServerKind::Phantom => {
            send_email = false;
            Some(String::new())
        }
        ServerKind::Unsupported => {
            let message = format!(
                "unsupported server type {} for VM #{vm_id}",
                server.server_type.name
            );
            error!(failed_reason = "unsupported_server_type", "{message}");
            errors.push(message);
            None
        }
    };

    match built {
        Some(admin_password) => {
            info!("successfully built VM");
            lifecycle::finish(&deps.api, SERVICE, vm_id, State::Running).await;
            if send_email {
                deps.notifier.vm_build_success(&vm, &admin_password).await;
            }
            deps.metrics.op_result(KIND, Operation::Build, true);
            if let Some(seconds) = build_duration_secs(vm.created.as_deref()) {
                deps.metrics.vm_time_to_build(seconds);
            }
        }
        None => {
            // The plaintext admin password never entered the record, so
            // the failure report carries only the collected errors.
            error!("failed to build VM");
            unresource(deps, &vm, Operation::Build, &errors).await;
        }
    }
}

fn build_duration_secs(created: Option<&str>) -> Option<i64> {
    let created = NaiveDateTime::parse_from_str(created?, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    let elapsed = chrono::Utc::now().naive_utc() - created;
    Some(elapsed.num_seconds())
}

/// The day the scheduled sweep will remove a VM quiesced for scrub, e.g.
/// "Friday August 07, 2026".
fn scheduled_deletion_date() -> String {
    (chrono::Local::now() + chrono::Duration::days(SCRUB_RETENTION_DAYS))
        .format("%A %B %d, %Y")
        .to_string()
}

/// Returns the plaintext admin password on success, for the build email
/// only.
async fn build_kvm(
    deps: &Deps,
    vm: &Vm,
    server: &Server,
    errors: &mut Vec<String>,
) -> Option<String> {
    let host_ip = host_ip_or_fail(server, errors)?;

    if !vm.storages.iter().any(|s| s.primary) {
        let message = "no primary storage drive found, expected one primary storage drive";
        error!(failed_reason = "template_data_failed", "{message}");
        errors.push(message.to_string());
        return None;
    }

    let answer_template = format!("vm/kvm/answer_files/{}", vm.image.answer_file_name);
    if !templates::exists(&answer_template) {
        let message = format!("no answer file template named {}", vm.image.answer_file_name);
        error!(failed_reason = "template_data_failed", "{message}");
        errors.push(message);
        return None;
    }

    if let Err(err) = stager::ensure_image(
        &deps.settings.kvm_robot_drive_path,
        &deps.settings.image_mirror_url,
        &vm.image.filename,
    )
    .await
    {
        error!(error = %err, failed_reason = "template_data_failed", "image not available");
        errors.push(err);
        return None;
    }

    let admin_password = stager::generate_password(ADMIN_PASSWORD_LEN);
    let root_password = stager::generate_password(ROOT_PASSWORD_LEN);
    let ctx = kvm_context(
        deps,
        vm,
        admin_password.clone(),
        stager::sha512_crypt(&admin_password, &stager::generate_salt()),
        stager::sha512_crypt(&root_password, &stager::generate_salt()),
    );

    let staging = match StagingDir::create(&deps.settings.kvm_robot_drive_path, &ctx.vm_identifier)
        .await
    {
        Ok(staging) => staging,
        Err(err) => {
            error!(error = %err, "could not create staging directory");
            errors.push(err);
            return None;
        }
    };

    let built = stage_and_build_kvm(deps, &ctx, &answer_template, &host_ip, &staging, errors).await;
    // The staging directory goes away whether the build worked or not
    staging.remove().await;

    built.then_some(admin_password)
}

async fn stage_and_build_kvm(
    deps: &Deps,
    ctx: &VmKvmCtx,
    answer_template: &str,
    host_ip: &str,
    staging: &StagingDir,
    errors: &mut Vec<String>,
) -> bool {
    for vlan in &ctx.nics.vlans {
        #[derive(serde::Serialize)]
        struct BridgeCtx<'a> {
            vlan: &'a str,
        }
        let Some(bridge) = render_or_fail("vm/kvm/bridge.yaml", &BridgeCtx { vlan }, errors)
        else {
            return false;
        };
        if let Err(err) = staging.write(&format!("br{vlan}.yaml"), &bridge).await {
            errors.push(err);
            return false;
        }
    }

    let Some(answer_file) = render_or_fail(answer_template, ctx, errors) else {
        return false;
    };
    if let Err(err) = staging.write(&format!("{}.cfg", ctx.vm_identifier), &answer_file).await {
        errors.push(err);
        return false;
    }

    let Some(ssh) = connect_kvm(deps, host_ip, errors).await else {
        return false;
    };
    deploy_kvm_build(&ssh, ctx, errors).await
}

async fn build_hyperv(
    deps: &Deps,
    vm: &Vm,
    server: &Server,
    errors: &mut Vec<String>,
) -> Option<String> {
    let winrm = winrm_driver(deps, server, errors)?;

    if !vm.storages.iter().any(|s| s.primary) {
        let message = "no primary storage drive found, expected one primary storage drive";
        error!(failed_reason = "template_data_failed", "{message}");
        errors.push(message.to_string());
        return None;
    }

    let admin_password = stager::generate_password(ADMIN_PASSWORD_LEN);
    let ctx = hyperv_context(deps, vm, admin_password.clone(), false);

    let staging =
        match StagingDir::create(&deps.settings.hyperv_robot_drive_path, &ctx.vm_identifier).await
        {
            Ok(staging) => staging,
            Err(err) => {
                error!(error = %err, "could not create staging directory");
                errors.push(err);
                return None;
            }
        };

    let mut staged = true;
    for (filename, template) in [
        ("unattend.xml", "vm/hyperv/unattend.xml"),
        ("network.xml", "vm/hyperv/network.xml"),
        ("builder.psm1", "vm/hyperv/builder.psm1"),
    ] {
        let Some(contents) = render_or_fail(template, &ctx, errors) else {
            staged = false;
            break;
        };
        if let Err(err) = staging.write(filename, &contents).await {
            errors.push(err);
            staged = false;
            break;
        }
    }

    let built = if staged {
        deploy_hyperv_script(&winrm, "vm/hyperv/build.ps1", &ctx, HYPERV_BUILD_DONE, errors).await
    } else {
        false
    };
    staging.remove().await;

    built.then_some(admin_password)
}

// ─── Update ────────────────────────────────────────────────────────────────

async fn update(deps: &Deps, vm_id: i64) {
    info!("commencing update of VM");
    let Some(vm) = read_vm(deps, vm_id).await else {
        deps.metrics.op_result(KIND, Operation::Update, false);
        return;
    };
    let Some(trigger) = lifecycle::update_trigger(vm.state) else {
        warn!(live = %vm.state, "cancelling update, VM was picked up elsewhere");
        return;
    };
    let transition = match lifecycle::begin(&deps.api, SERVICE, KIND, vm_id, vm.state, trigger).await
    {
        Begin::WrongState => return,
        Begin::UpdateFailed => {
            deps.metrics.op_result(KIND, Operation::Update, false);
            return;
        }
        Begin::Proceed(t) => t,
    };

    let mut errors = Vec::new();
    let Some(server) = read_server(deps, vm.server_id).await else {
        unresource(deps, &vm, Operation::Update, &errors).await;
        return;
    };

    let updated = match server.kind() {
        ServerKind::Kvm => {
            let mut done = false;
            if let Some(host_ip) = host_ip_or_fail(&server, &mut errors) {
                let ctx = kvm_context(deps, &vm, String::new(), String::new(), String::new());
                if let Some(ssh) = connect_kvm(deps, &host_ip, &mut errors).await {
                    done = deploy_kvm_script(&ssh, "vm/kvm/update.sh", &ctx, &mut errors).await;
                }
            }
            done
        }
        ServerKind::HyperV => match winrm_driver(deps, &server, &mut errors) {
            Some(winrm) => {
                let restart = trigger == State::RunningUpdate;
                let ctx = hyperv_context(deps, &vm, String::new(), restart);
                deploy_hyperv_script(&winrm, "vm/hyperv/update.ps1", &ctx, HYPERV_UPDATE_DONE, &mut errors)
                    .await
            }
            None => false,
        },
        ServerKind::Phantom => true,
        ServerKind::Unsupported => {
            let message = format!(
                "unsupported server type {} for VM #{vm_id}",
                server.server_type.name
            );
            error!(failed_reason = "unsupported_server_type", "{message}");
            errors.push(message);
            false
        }
    };

    if updated {
        info!("successfully updated VM");
        deps.metrics.op_result(KIND, Operation::Update, true);
        lifecycle::finish(&deps.api, SERVICE, vm_id, transition.success).await;
    } else {
        error!("failed to update VM");
        unresource(deps, &vm, Operation::Update, &errors).await;
    }
}

// ─── Quiesce ───────────────────────────────────────────────────────────────

async fn quiesce(deps: &Deps, vm_id: i64) {
    info!("commencing quiesce of VM");
    let Some(vm) = read_vm(deps, vm_id).await else {
        deps.metrics.op_result(KIND, Operation::Quiesce, false);
        return;
    };
    if vm.state != State::Quiesce && vm.state != State::Scrub {
        warn!(live = %vm.state, "cancelling quiesce, VM was picked up elsewhere");
        return;
    }
    let transition = match lifecycle::begin(&deps.api, SERVICE, KIND, vm_id, vm.state, vm.state).await
    {
        Begin::WrongState => return,
        Begin::UpdateFailed => {
            deps.metrics.op_result(KIND, Operation::Quiesce, false);
            return;
        }
        Begin::Proceed(t) => t,
    };

    let mut errors = Vec::new();
    let Some(server) = read_server(deps, vm.server_id).await else {
        unresource(deps, &vm, Operation::Quiesce, &errors).await;
        return;
    };

    // Phantom VMs are quiesced silently
    let mut send_email = true;
    let quiesced = match server.kind() {
        ServerKind::Kvm => {
            let mut done = false;
            if let Some(host_ip) = host_ip_or_fail(&server, &mut errors) {
                let ctx = kvm_context(deps, &vm, String::new(), String::new(), String::new());
                if let Some(ssh) = connect_kvm(deps, &host_ip, &mut errors).await {
                    done = deploy_kvm_script(&ssh, "vm/kvm/quiesce.sh", &ctx, &mut errors).await;
                }
            }
            done
        }
        ServerKind::HyperV => match winrm_driver(deps, &server, &mut errors) {
            Some(winrm) => {
                let ctx = hyperv_context(deps, &vm, String::new(), false);
                deploy_hyperv_script(&winrm, "vm/hyperv/quiesce.ps1", &ctx, "", &mut errors).await
            }
            None => false,
        },
        ServerKind::Phantom => {
            send_email = false;
            true
        }
        ServerKind::Unsupported => {
            let message = format!(
                "unsupported server type {} for VM #{vm_id}",
                server.server_type.name
            );
            error!(failed_reason = "unsupported_server_type", "{message}");
            errors.push(message);
            false
        }
    };

    if quiesced {
        info!("successfully quiesced VM");
        deps.metrics.op_result(KIND, Operation::Quiesce, true);
        lifecycle::finish(&deps.api, SERVICE, vm_id, transition.success).await;
        if transition.trigger == State::Scrub && send_email {
            // The owner gets a courtesy note that their VM now awaits the
            // scheduled deletion sweep
            deps.notifier
                .delete_schedule_success(&vm, &scheduled_deletion_date())
                .await;
        }
    } else {
        error!("failed to quiesce VM");
        unresource(deps, &vm, Operation::Quiesce, &errors).await;
    }
}

// ─── Restart ───────────────────────────────────────────────────────────────

async fn restart(deps: &Deps, vm_id: i64) {
    info!("commencing restart of VM");
    let Some(vm) = read_vm(deps, vm_id).await else {
        deps.metrics.op_result(KIND, Operation::Restart, false);
        return;
    };
    match lifecycle::begin(&deps.api, SERVICE, KIND, vm_id, vm.state, State::Restart).await {
        Begin::WrongState => return,
        Begin::UpdateFailed => {
            deps.metrics.op_result(KIND, Operation::Restart, false);
            return;
        }
        Begin::Proceed(_) => {}
    }

    let mut errors = Vec::new();
    let Some(server) = read_server(deps, vm.server_id).await else {
        unresource(deps, &vm, Operation::Restart, &errors).await;
        return;
    };

    let restarted = match server.kind() {
        ServerKind::Kvm => {
            let mut done = false;
            if let Some(host_ip) = host_ip_or_fail(&server, &mut errors) {
                let ctx = kvm_context(deps, &vm, String::new(), String::new(), String::new());
                if let Some(ssh) = connect_kvm(deps, &host_ip, &mut errors).await {
                    done = deploy_kvm_script(&ssh, "vm/kvm/restart.sh", &ctx, &mut errors).await;
                }
            }
            done
        }
        ServerKind::HyperV => match winrm_driver(deps, &server, &mut errors) {
            Some(winrm) => {
                let ctx = hyperv_context(deps, &vm, String::new(), false);
                let sentinel = format!("{} Successfully Rebooted", ctx.vm_identifier);
                deploy_hyperv_script(&winrm, "vm/hyperv/restart.ps1", &ctx, &sentinel, &mut errors)
                    .await
            }
            None => false,
        },
        ServerKind::Phantom => true,
        ServerKind::Unsupported => {
            let message = format!(
                "unsupported server type {} for VM #{vm_id}",
                server.server_type.name
            );
            error!(failed_reason = "unsupported_server_type", "{message}");
            errors.push(message);
            false
        }
    };

    if restarted {
        info!("successfully restarted VM");
        deps.metrics.op_result(KIND, Operation::Restart, true);
        lifecycle::finish(&deps.api, SERVICE, vm_id, State::Running).await;
    } else {
        error!("failed to restart VM");
        unresource(deps, &vm, Operation::Restart, &errors).await;
    }
}

// ─── Scrub ─────────────────────────────────────────────────────────────────

async fn scrub(deps: &Deps, vm_id: i64) {
    info!("commencing scrub of VM");
    let vm: Vm = match deps.api.read(SERVICE, vm_id).await {
        Ok(vm) => vm,
        Err(iaas::ApiError::NotFound) => {
            info!(failed_reason = "already_deleted", "VM already removed from the API");
            return;
        }
        Err(err) => {
            error!(error = %err, failed_reason = "invalid_vm_id", "could not read VM");
            return;
        }
    };
    match lifecycle::begin(&deps.api, SERVICE, KIND, vm_id, vm.state, State::ScrubQueue).await {
        Begin::WrongState => return,
        Begin::UpdateFailed => {
            deps.metrics.op_result(KIND, Operation::Scrub, false);
            return;
        }
        Begin::Proceed(_) => {}
    }

    let mut errors = Vec::new();
    let Some(server) = read_server(deps, vm.server_id).await else {
        unresource(deps, &vm, Operation::Scrub, &errors).await;
        return;
    };

    let scrubbed = match server.kind() {
        ServerKind::Kvm => {
            let mut done = false;
            if let Some(host_ip) = host_ip_or_fail(&server, &mut errors) {
                let delete_bridge = bridge_deletion_needed(deps, &vm).await;
                let ctx = kvm_context(deps, &vm, String::new(), String::new(), String::new());
                if let Some(ssh) = connect_kvm(deps, &host_ip, &mut errors).await {
                    done = deploy_kvm_scrub(&ssh, &ctx, delete_bridge, &mut errors).await;
                }
            }
            done
        }
        ServerKind::HyperV => match winrm_driver(deps, &server, &mut errors) {
            Some(winrm) => {
                let ctx = hyperv_context(deps, &vm, String::new(), false);
                let sentinel = format!("{} Successfully Deleted", ctx.vm_identifier);
                deploy_hyperv_script(&winrm, "vm/hyperv/scrub.ps1", &ctx, &sentinel, &mut errors)
                    .await
            }
            None => false,
        },
        ServerKind::Phantom => true,
        ServerKind::Unsupported => {
            let message = format!(
                "unsupported server type {} for VM #{vm_id}",
                server.server_type.name
            );
            error!(failed_reason = "unsupported_server_type", "{message}");
            errors.push(message);
            false
        }
    };

    if scrubbed {
        info!("successfully scrubbed VM");
        deps.metrics.op_result(KIND, Operation::Scrub, true);
        lifecycle::finish(&deps.api, SERVICE, vm_id, State::Closed).await;
    } else {
        error!("failed to scrub VM");
        unresource(deps, &vm, Operation::Scrub, &errors).await;
    }
}

/// The bridges go when this VM is the last KVM VM in its subnets: list the
/// other addresses in those subnets, resolve their VMs' servers, and check
/// whether any of those servers is a KVM host.
async fn bridge_deletion_needed(deps: &Deps, vm: &Vm) -> bool {
    let mut subnet_ids: Vec<i64> = Vec::new();
    for ip in &vm.ip_addresses {
        if !subnet_ids.contains(&ip.subnet.id) {
            subnet_ids.push(ip.subnet.id);
        }
    }
    if subnet_ids.is_empty() {
        return false;
    }

    let subnet_ips: Vec<IpAddress> = deps
        .api
        .list(
            service::IP_ADDRESS,
            &[
                (
                    "search[subnet_id__in]",
                    subnet_ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(","),
                ),
                ("search[exclude__vm_id]", vm.id.to_string()),
            ],
        )
        .await;

    let mut vm_ids: Vec<i64> = Vec::new();
    for ip in &subnet_ips {
        if let Some(id) = ip.vm_id {
            if !vm_ids.contains(&id) {
                vm_ids.push(id);
            }
        }
    }
    if vm_ids.is_empty() {
        return true;
    }

    let vms: Vec<Vm> = deps
        .api
        .list(
            SERVICE,
            &[(
                "search[id__in]",
                vm_ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(","),
            )],
        )
        .await;
    let mut server_ids: Vec<i64> = Vec::new();
    for other in &vms {
        if !server_ids.contains(&other.server_id) {
            server_ids.push(other.server_id);
        }
    }
    if server_ids.is_empty() {
        return true;
    }

    let kvm_servers: Vec<Server> = deps
        .api
        .list(
            service::SERVER,
            &[
                (
                    "search[id__in]",
                    server_ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(","),
                ),
                ("search[type__name]", "KVM".to_string()),
            ],
        )
        .await;
    kvm_servers.is_empty()
}
