//! Virtual router operations on the PodNet appliance.
//!
//! A router is realized as a set of VLAN bridges, one nftables ruleset and
//! optional IPsec tunnels, all scoped by project. Every operation derives
//! the full template context, stages project files under the PodNet working
//! directory, and runs one script whose stderr must stay empty: the PodNet
//! scripts are silent on success, so any stderr is failure.

use std::time::Duration;

use serde_json::json;
use tracing::{error, info, warn};

use executor::ssh::PODNET_USER;
use executor::{FileTransfer, LinuxSsh, Remote};
use iaas::client::service;
use iaas::resource::{IpAddress, VirtualRouter, Vm, Vpn};
use iaas::state::{Operation, ResourceKind, State};
use notifier::email::VpnEmail;

use crate::context::{self, VirtualRouterCtx};
use crate::lifecycle::{self, Begin};
use crate::{Deps, Job, JobOp};

const SERVICE: &str = service::VIRTUAL_ROUTER;
const KIND: ResourceKind = ResourceKind::VirtualRouter;

/// How long a blocked scrub waits before trying again.
const SCRUB_RETRY: Duration = Duration::from_secs(60);
/// Delay before firewall debug logging is switched back off.
const DEBUG_RESET_DELAY: Duration = Duration::from_secs(15 * 60);

pub async fn run(job: Job, deps: &Deps) {
    if !deps.settings.virtual_routers_enabled {
        phantom(job, deps).await;
        return;
    }
    match job.op {
        JobOp::Build => build(deps, job.id).await,
        JobOp::Update => update(deps, job.id).await,
        JobOp::Quiesce => quiesce(deps, job.id).await,
        JobOp::Restart => restart(deps, job.id).await,
        JobOp::Scrub => scrub(deps, job).await,
        JobOp::DebugReset => debug_reset(deps, job.id).await,
    }
}

// ─── Reads and context assembly ────────────────────────────────────────────

async fn read_vr(deps: &Deps, id: i64) -> Option<VirtualRouter> {
    match deps.api.read::<VirtualRouter>(SERVICE, id).await {
        Ok(vr) => Some(vr),
        Err(err) => {
            error!(error = %err, failed_reason = "invalid_virtual_router_id", "could not read virtual router");
            None
        }
    }
}

/// Fetch the NAT addresses and VPNs, then derive the template context.
async fn assemble(deps: &Deps, vr: &VirtualRouter) -> Result<VirtualRouterCtx, String> {
    let nat_ips: Vec<IpAddress> = if vr.subnets.is_empty() {
        Vec::new()
    } else {
        let subnet_ids = vr
            .subnets
            .iter()
            .map(|s| s.id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        deps.api
            .list(
                service::IP_ADDRESS,
                &[
                    ("search[subnet_id__in]", subnet_ids),
                    ("search[public_ip_id__isnull]", "false".to_string()),
                ],
            )
            .await
    };

    let mut vpns: Vec<Vpn> = deps
        .api
        .list(service::VPN, &[("search[virtual_router_id]", vr.id.to_string())])
        .await;
    // The list payload omits recipients; fetch them where a mail is due
    for vpn in vpns.iter_mut().filter(|v| v.send_email) {
        match deps.api.read::<Vpn>(service::VPN, vpn.id).await {
            Ok(full) => vpn.emails = full.emails,
            Err(err) => warn!(vpn_id = vpn.id, error = %err, "could not read VPN recipients"),
        }
    }

    context::virtual_router_context(vr, &nat_ips, &vpns, &deps.settings)
}

async fn connect(deps: &Deps, errors: &mut Vec<String>) -> Option<LinuxSsh> {
    match LinuxSsh::connect(&deps.settings.mgmt_ip, PODNET_USER, &deps.settings.ssh_key_path).await
    {
        Ok(ssh) => Some(ssh),
        Err(err) => {
            error!(error = %err, failed_reason = err.class(), "could not reach PodNet");
            errors.push(err.to_string());
            None
        }
    }
}

// ─── Remote sequencing (generic over the driver for testability) ───────────

/// BUILD: install the floating bridge when absent, stage the ruleset and
/// VPN config, then run the build script.
pub(crate) async fn deploy_build<R>(
    remote: &R,
    ctx: &VirtualRouterCtx,
    errors: &mut Vec<String>,
) -> bool
where
    R: Remote + FileTransfer,
{
    let exists = match remote.file_exists(&ctx.floating_bridge_file()).await {
        Ok(exists) => exists,
        Err(err) => {
            errors.push(err.to_string());
            error!(error = %err, failed_reason = err.class(), "floating bridge check failed");
            return false;
        }
    };
    if !exists {
        info!(
            subnet_id = ctx.ipv4_floating_subnet_id,
            "floating bridge absent, installing it"
        );
        let bridge = match templates::render("virtual_router/floating_bridge.yaml", ctx) {
            Ok(bridge) => bridge,
            Err(err) => {
                errors.push(err.to_string());
                error!(error = %err, failed_reason = "template_data_failed", "floating bridge render failed");
                return false;
            }
        };
        let temp = ctx.temp_floating_bridge_file();
        if let Err(err) = remote.put_file(&temp, &bridge).await {
            errors.push(err.to_string());
            error!(error = %err, failed_reason = err.class(), "floating bridge write failed");
            return false;
        }
        let install = format!(
            "sudo mv {temp} {} && sudo netplan apply",
            ctx.floating_bridge_file()
        );
        match remote.exec_script(&install).await {
            Ok(output) => {
                if let Some(stderr) = output.real_stderr() {
                    error!(stderr, "netplan apply produced stderr");
                    errors.push(stderr.to_string());
                }
            }
            Err(err) => {
                errors.push(err.to_string());
                error!(error = %err, failed_reason = err.class(), "netplan apply failed");
                return false;
            }
        }
    }

    deploy_ruleset_and_script(remote, ctx, "virtual_router/build.sh", errors).await
}

/// UPDATE: identical to build minus the floating-bridge check.
pub(crate) async fn deploy_update<R>(
    remote: &R,
    ctx: &VirtualRouterCtx,
    errors: &mut Vec<String>,
) -> bool
where
    R: Remote + FileTransfer,
{
    deploy_ruleset_and_script(remote, ctx, "virtual_router/update.sh", errors).await
}

async fn deploy_ruleset_and_script<R>(
    remote: &R,
    ctx: &VirtualRouterCtx,
    script_template: &str,
    errors: &mut Vec<String>,
) -> bool
where
    R: Remote + FileTransfer,
{
    let firewall = match templates::render("virtual_router/firewall.nft", ctx) {
        Ok(firewall) => firewall,
        Err(err) => {
            errors.push(err.to_string());
            error!(error = %err, failed_reason = "template_data_failed", "firewall render failed");
            return false;
        }
    };
    if let Err(err) = remote.put_file(&ctx.remote_firewall_file(), &firewall).await {
        errors.push(err.to_string());
        error!(error = %err, failed_reason = err.class(), "firewall write failed");
        return false;
    }

    if !ctx.vpns.is_empty() {
        let vpn_conf = match templates::render("virtual_router/vpn.conf", ctx) {
            Ok(conf) => conf,
            Err(err) => {
                errors.push(err.to_string());
                error!(error = %err, failed_reason = "template_data_failed", "vpn config render failed");
                return false;
            }
        };
        if let Err(err) = remote.put_file(&ctx.temp_vpn_filename, &vpn_conf).await {
            errors.push(err.to_string());
            error!(error = %err, failed_reason = err.class(), "vpn config write failed");
            return false;
        }
    }

    run_script(remote, ctx, script_template, "", errors).await
}

/// QUIESCE: drop the VPN config when present, then run the quiesce script.
pub(crate) async fn deploy_quiesce<R>(
    remote: &R,
    ctx: &VirtualRouterCtx,
    errors: &mut Vec<String>,
) -> bool
where
    R: Remote + FileTransfer,
{
    let prefix = if ctx.vpns.is_empty() {
        String::new()
    } else {
        format!("sudo rm {}\n", ctx.vpn_filename)
    };
    run_script(remote, ctx, "virtual_router/quiesce.sh", &prefix, errors).await
}

/// SCRUB: remove only VPN config files that actually exist, then run the
/// scrub script.
pub(crate) async fn deploy_scrub<R>(
    remote: &R,
    ctx: &VirtualRouterCtx,
    errors: &mut Vec<String>,
) -> bool
where
    R: Remote + FileTransfer,
{
    let mut prefix = String::new();
    match remote.file_exists(&ctx.vpn_filename).await {
        Ok(true) => prefix = format!("sudo rm {}\n", ctx.vpn_filename),
        Ok(false) => {}
        Err(err) => {
            errors.push(err.to_string());
            error!(error = %err, failed_reason = err.class(), "vpn config check failed");
            return false;
        }
    }
    run_script(remote, ctx, "virtual_router/scrub.sh", &prefix, errors).await
}

pub(crate) async fn deploy_restart<R>(
    remote: &R,
    ctx: &VirtualRouterCtx,
    errors: &mut Vec<String>,
) -> bool
where
    R: Remote + FileTransfer,
{
    deploy_ruleset_and_script(remote, ctx, "virtual_router/restart.sh", errors).await
}

async fn run_script<R: Remote>(
    remote: &R,
    ctx: &VirtualRouterCtx,
    template: &str,
    prefix: &str,
    errors: &mut Vec<String>,
) -> bool {
    let script = match templates::render(template, ctx) {
        Ok(script) => format!("{prefix}{script}"),
        Err(err) => {
            errors.push(err.to_string());
            error!(error = %err, failed_reason = "template_data_failed", "script render failed");
            return false;
        }
    };
    match remote.exec_script(&script).await {
        Ok(output) => {
            if let Some(stderr) = output.real_stderr() {
                error!(stderr, "router script produced stderr");
                errors.push(stderr.to_string());
                false
            } else {
                true
            }
        }
        Err(err) => {
            errors.push(err.to_string());
            error!(error = %err, failed_reason = err.class(), "router script failed");
            false
        }
    }
}

// ─── Operations ────────────────────────────────────────────────────────────

async fn build(deps: &Deps, id: i64) {
    info!("commencing build of virtual router");
    let Some(vr) = read_vr(deps, id).await else {
        deps.metrics.op_result(KIND, Operation::Build, false);
        return;
    };
    match lifecycle::begin(&deps.api, SERVICE, KIND, id, vr.state, State::Requested).await {
        Begin::WrongState => return,
        Begin::UpdateFailed => {
            deps.metrics.op_result(KIND, Operation::Build, false);
            return;
        }
        Begin::Proceed(_) => {}
    }

    let mut errors = Vec::new();
    let outcome = perform(deps, &vr, JobOp::Build, &mut errors).await;

    match outcome {
        Some(ctx) => {
            info!("successfully built virtual router");
            deps.metrics.op_result(KIND, Operation::Build, true);
            lifecycle::finish(&deps.api, SERVICE, id, State::Running).await;
            send_vpn_mails(deps, &ctx, true).await;
            deps.queue.enqueue_after(
                Job::new(KIND, JobOp::DebugReset, id),
                DEBUG_RESET_DELAY,
            );
        }
        None => {
            error!("failed to build virtual router, moving it to UNRESOURCED");
            deps.metrics.op_result(KIND, Operation::Build, false);
            lifecycle::unresource(&deps.api, SERVICE, id).await;
            deps.notifier.virtual_router_failure(id, &vr, "build", &errors).await;
        }
    }
}

async fn update(deps: &Deps, id: i64) {
    info!("commencing update of virtual router");
    let Some(vr) = read_vr(deps, id).await else {
        deps.metrics.op_result(KIND, Operation::Update, false);
        return;
    };
    let Some(trigger) = lifecycle::update_trigger(vr.state) else {
        warn!(live = %vr.state, "cancelling update, virtual router was picked up elsewhere");
        return;
    };
    let transition = match lifecycle::begin(&deps.api, SERVICE, KIND, id, vr.state, trigger).await {
        Begin::WrongState => return,
        Begin::UpdateFailed => {
            deps.metrics.op_result(KIND, Operation::Update, false);
            return;
        }
        Begin::Proceed(t) => t,
    };

    let mut errors = Vec::new();
    match perform(deps, &vr, JobOp::Update, &mut errors).await {
        Some(ctx) => {
            info!("successfully updated virtual router");
            deps.metrics.op_result(KIND, Operation::Update, true);
            lifecycle::finish(&deps.api, SERVICE, id, transition.success).await;
            send_vpn_mails(deps, &ctx, false).await;
            deps.queue.enqueue_after(
                Job::new(KIND, JobOp::DebugReset, id),
                DEBUG_RESET_DELAY,
            );
        }
        None => {
            error!("failed to update virtual router, moving it to UNRESOURCED");
            deps.metrics.op_result(KIND, Operation::Update, false);
            lifecycle::unresource(&deps.api, SERVICE, id).await;
            deps.notifier.virtual_router_failure(id, &vr, "update", &errors).await;
        }
    }
}

async fn quiesce(deps: &Deps, id: i64) {
    info!("commencing quiesce of virtual router");
    let Some(vr) = read_vr(deps, id).await else {
        deps.metrics.op_result(KIND, Operation::Quiesce, false);
        return;
    };
    if vr.state != State::Quiesce && vr.state != State::Scrub {
        warn!(live = %vr.state, "cancelling quiesce, virtual router was picked up elsewhere");
        return;
    }
    let transition = match lifecycle::begin(&deps.api, SERVICE, KIND, id, vr.state, vr.state).await
    {
        Begin::WrongState => return,
        Begin::UpdateFailed => {
            deps.metrics.op_result(KIND, Operation::Quiesce, false);
            return;
        }
        Begin::Proceed(t) => t,
    };

    let mut errors = Vec::new();
    match perform(deps, &vr, JobOp::Quiesce, &mut errors).await {
        Some(_) => {
            info!("successfully quiesced virtual router");
            deps.metrics.op_result(KIND, Operation::Quiesce, true);
            lifecycle::finish(&deps.api, SERVICE, id, transition.success).await;
        }
        None => {
            error!("failed to quiesce virtual router, moving it to UNRESOURCED");
            deps.metrics.op_result(KIND, Operation::Quiesce, false);
            lifecycle::unresource(&deps.api, SERVICE, id).await;
            deps.notifier.virtual_router_failure(id, &vr, "quiesce", &errors).await;
        }
    }
}

async fn restart(deps: &Deps, id: i64) {
    info!("commencing restart of virtual router");
    let Some(vr) = read_vr(deps, id).await else {
        deps.metrics.op_result(KIND, Operation::Restart, false);
        return;
    };
    match lifecycle::begin(&deps.api, SERVICE, KIND, id, vr.state, State::Restart).await {
        Begin::WrongState => return,
        Begin::UpdateFailed => {
            deps.metrics.op_result(KIND, Operation::Restart, false);
            return;
        }
        Begin::Proceed(_) => {}
    }

    let mut errors = Vec::new();
    match perform(deps, &vr, JobOp::Restart, &mut errors).await {
        Some(_) => {
            info!("successfully restarted virtual router");
            deps.metrics.op_result(KIND, Operation::Restart, true);
            lifecycle::finish(&deps.api, SERVICE, id, State::Running).await;
        }
        None => {
            error!("failed to restart virtual router, moving it to UNRESOURCED");
            deps.metrics.op_result(KIND, Operation::Restart, false);
            lifecycle::unresource(&deps.api, SERVICE, id).await;
            deps.notifier.virtual_router_failure(id, &vr, "restart", &errors).await;
        }
    }
}

async fn scrub(deps: &Deps, job: Job) {
    let id = job.id;
    info!("commencing scrub of virtual router");
    let vr: VirtualRouter = match deps.api.read(SERVICE, id).await {
        Ok(vr) => vr,
        Err(iaas::ApiError::NotFound) => {
            info!(failed_reason = "already_deleted", "virtual router already removed from the API");
            return;
        }
        Err(err) => {
            error!(error = %err, failed_reason = "invalid_virtual_router_id", "could not read virtual router");
            return;
        }
    };
    if vr.state != State::ScrubQueue {
        warn!(live = %vr.state, "cancelling scrub, virtual router was picked up elsewhere");
        return;
    }

    // The scrub is gated on every VM in the project being CLOSED. Blocked
    // scrubs retry shortly and leave the state untouched.
    let open_vms: Vec<Vm> = deps
        .api
        .list(
            service::VM,
            &[
                ("search[project_id]", vr.project.id.to_string()),
                ("exclude[state]", State::Closed.code().to_string()),
            ],
        )
        .await;
    if lifecycle::vr_scrub_blocked(&open_vms.iter().map(|vm| vm.state).collect::<Vec<_>>()) {
        warn!(
            open_vms = open_vms.len(),
            "VMs still live in this project, postponing virtual router scrub"
        );
        deps.queue.enqueue_after(job, SCRUB_RETRY);
        return;
    }

    match lifecycle::begin(&deps.api, SERVICE, KIND, id, vr.state, State::ScrubQueue).await {
        Begin::WrongState => return,
        Begin::UpdateFailed => {
            deps.metrics.op_result(KIND, Operation::Scrub, false);
            return;
        }
        Begin::Proceed(_) => {}
    }

    let mut errors = Vec::new();
    match perform(deps, &vr, JobOp::Scrub, &mut errors).await {
        Some(_) => {
            info!("successfully scrubbed virtual router");
            deps.metrics.op_result(KIND, Operation::Scrub, true);
            lifecycle::finish(&deps.api, SERVICE, id, State::Closed).await;
        }
        None => {
            error!("failed to scrub virtual router, moving it to UNRESOURCED");
            deps.metrics.op_result(KIND, Operation::Scrub, false);
            lifecycle::unresource(&deps.api, SERVICE, id).await;
            deps.notifier.virtual_router_failure(id, &vr, "scrub", &errors).await;
        }
    }
}

/// Assemble, connect and run the remote sequencing for one operation.
/// Returns the context on success so callers can fire VPN side effects.
async fn perform(
    deps: &Deps,
    vr: &VirtualRouter,
    op: JobOp,
    errors: &mut Vec<String>,
) -> Option<VirtualRouterCtx> {
    let ctx = match assemble(deps, vr).await {
        Ok(ctx) => ctx,
        Err(err) => {
            error!(error = %err, failed_reason = "template_data_failed", "could not derive template context");
            errors.push(err);
            return None;
        }
    };
    let ssh = connect(deps, errors).await?;
    let done = match op {
        JobOp::Build => deploy_build(&ssh, &ctx, errors).await,
        JobOp::Update => deploy_update(&ssh, &ctx, errors).await,
        JobOp::Quiesce => deploy_quiesce(&ssh, &ctx, errors).await,
        JobOp::Restart => deploy_restart(&ssh, &ctx, errors).await,
        JobOp::Scrub => deploy_scrub(&ssh, &ctx, errors).await,
        JobOp::DebugReset => unreachable!("debug reset does no remote work"),
    };
    done.then_some(ctx)
}

/// Send the success email for each VPN that asked for one, then persist the
/// `send_email` reset. Both are attempted for every VPN; failures are
/// logged, never retried.
async fn send_vpn_mails(deps: &Deps, ctx: &VirtualRouterCtx, build: bool) {
    for vpn in ctx.vpns.iter().filter(|v| v.send_email) {
        deps.notifier
            .vpn_success(&VpnEmail {
                id: vpn.id,
                project_id: ctx.project_id,
                stif_number: vpn.stif_number,
                virtual_router_ip: ctx.virtual_router_ip.clone(),
                podnet_cpe: ctx.podnet_cpe.clone(),
                build,
                emails: vpn.emails.clone(),
            })
            .await;
        if let Err(err) = deps
            .api
            .partial_update(service::VPN, vpn.id, &json!({ "send_email": false }))
            .await
        {
            error!(vpn_id = vpn.id, error = %err, "could not reset send_email");
        }
    }
}

/// Turn every rule's `debug_logging` off in place. Returns whether any
/// rule actually had it on.
fn clear_debug_flags(rules: &mut [iaas::resource::FirewallRule]) -> bool {
    let mut had_debug = false;
    for rule in rules {
        if rule.debug_logging {
            had_debug = true;
            rule.debug_logging = false;
        }
    }
    had_debug
}

/// Delayed sweep that turns firewall debug logging back off once the
/// newest rule has been quiet for fifteen minutes. The ruleset is
/// redeployed with the flags cleared so the device stops logging, and only
/// then is the record's debug flag reset.
async fn debug_reset(deps: &Deps, id: i64) {
    let Some(mut vr) = read_vr(deps, id).await else {
        deps.metrics.op_result(KIND, Operation::Update, false);
        return;
    };
    if vr.state != State::Running {
        warn!(
            live = %vr.state,
            failed_reason = "not_in_valid_state",
            "cancelling firewall debug reset, another task owns the router",
        );
        return;
    }
    if vr.firewall_rules.is_empty() {
        return;
    }
    let Some(latest) = vr
        .firewall_rules
        .iter()
        .filter_map(|rule| rule.updated.as_deref())
        .max()
    else {
        return;
    };
    let trimmed = latest.split('+').next().unwrap_or(latest);
    let Ok(latest) = chrono::NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f") else {
        warn!(updated = trimmed, "could not parse firewall rule timestamp");
        return;
    };
    let age = chrono::Utc::now().naive_utc() - latest;
    if age < chrono::Duration::minutes(15) {
        return;
    }

    if !clear_debug_flags(&mut vr.firewall_rules) {
        info!("no firewall rule debug logging needs resetting");
        return;
    }

    // The router stays RUNNING throughout: this re-applies the ruleset
    // without the log statements, it is not a full update operation.
    info!("redeploying the ruleset with debug logging disabled");
    let mut errors = Vec::new();
    match perform(deps, &vr, JobOp::Update, &mut errors).await {
        Some(_) => {
            info!("successfully disabled firewall debug logging on the router");
            deps.metrics.op_result(KIND, Operation::Update, true);
            // Re-check the live state before touching the record; if the
            // router moved on, the next operation redeploys anyway.
            match deps.api.read::<VirtualRouter>(SERVICE, id).await {
                Ok(live) if live.state == State::Running => {
                    if let Err(err) = deps
                        .api
                        .partial_update(SERVICE, id, &json!({ "debug": false }))
                        .await
                    {
                        error!(error = %err, "could not reset the debug flag");
                    }
                }
                Ok(live) => {
                    warn!(live = %live.state, "router state changed, leaving the debug flag");
                }
                Err(err) => {
                    error!(error = %err, "could not re-read the virtual router");
                }
            }
        }
        None => {
            error!("failed to disable firewall debug logging on the router");
            deps.metrics.op_result(KIND, Operation::Update, false);
            deps.notifier.virtual_router_failure(id, &vr, "update", &errors).await;
        }
    }
}

// ─── Phantom mode ──────────────────────────────────────────────────────────

/// With virtual routers disabled for the region, operations only walk the
/// state transitions so the rest of the cloud flow keeps moving.
async fn phantom(job: Job, deps: &Deps) {
    let id = job.id;
    if job.op == JobOp::DebugReset {
        // No hardware, so nothing ever logs
        return;
    }
    info!("phantom virtual router operation");
    let Some(vr) = read_vr(deps, id).await else {
        return;
    };
    let expected = match job.op {
        JobOp::Build => Some(State::Requested),
        JobOp::Update => lifecycle::update_trigger(vr.state),
        JobOp::Quiesce => {
            (vr.state == State::Quiesce || vr.state == State::Scrub).then_some(vr.state)
        }
        JobOp::Restart => Some(State::Restart),
        JobOp::Scrub => Some(State::ScrubQueue),
        JobOp::DebugReset => None,
    };
    let Some(expected) = expected else {
        warn!(live = %vr.state, "cancelling phantom operation");
        return;
    };

    if job.op == JobOp::Scrub {
        let open_vms: Vec<Vm> = deps
            .api
            .list(
                service::VM,
                &[
                    ("search[project_id]", vr.project.id.to_string()),
                    ("exclude[state]", State::Closed.code().to_string()),
                ],
            )
            .await;
        if lifecycle::vr_scrub_blocked(&open_vms.iter().map(|vm| vm.state).collect::<Vec<_>>()) {
            deps.queue.enqueue_after(job, SCRUB_RETRY);
            return;
        }
    }

    let transition = match lifecycle::begin(&deps.api, SERVICE, KIND, id, vr.state, expected).await
    {
        Begin::Proceed(t) => t,
        Begin::WrongState | Begin::UpdateFailed => return,
    };
    lifecycle::finish(&deps.api, SERVICE, id, transition.success).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use executor::mock::{MockRemote, MockRemoteConfig};
    use iaas::resource::{FirewallRule, Project, Subnet, VirtualRouterIp, VpnRoute};
    use settings::Settings;

    fn test_vr() -> VirtualRouter {
        VirtualRouter {
            id: 9,
            state: State::Requested,
            project: Project { id: 9, address_id: Some(901), virtual_router_id: None },
            ip_address: VirtualRouterIp {
                address: "91.103.0.4".to_string(),
                subnet: Subnet {
                    id: 55,
                    address_range: "91.103.0.0/24".to_string(),
                    gateway: Some("91.103.0.1".to_string()),
                    vlan: None,
                },
            },
            subnets: vec![Subnet {
                id: 71,
                address_range: "192.168.0.0/24".to_string(),
                gateway: None,
                vlan: Some(1002),
            }],
            firewall_rules: vec![FirewallRule {
                id: 5,
                order: 1,
                destination: "192.168.0.0/24".to_string(),
                source: None,
                port: None,
                protocol: "tcp".to_string(),
                allow: true,
                debug_logging: false,
                pci_logging: false,
                updated: None,
            }],
        }
    }

    fn test_vpn() -> iaas::resource::Vpn {
        iaas::resource::Vpn {
            id: 77,
            virtual_router_id: 9,
            ike_authentication: "sha-256".to_string(),
            ike_dh_groups: "group2".to_string(),
            ike_encryption: "aes-256-cbc".to_string(),
            ike_mode: "main".to_string(),
            ike_pre_shared_key: "hunter2".to_string(),
            ike_version: "v2-only".to_string(),
            ike_public_ip: None,
            ipsec_authentication: "hmac-sha1-96".to_string(),
            ipsec_encryption: "aes-128-cbc".to_string(),
            ipsec_pfs_groups: "group5".to_string(),
            routes: vec![VpnRoute {
                id: 1,
                local_subnet: Subnet {
                    id: 71,
                    address_range: "192.168.0.0/24".to_string(),
                    gateway: None,
                    vlan: Some(1002),
                },
                remote_subnet: "10.9.0.0/16".to_string(),
            }],
            stif_number: 1001,
            traffic_selector: false,
            send_email: true,
            emails: None,
        }
    }

    fn ctx_with_vpn() -> VirtualRouterCtx {
        context::virtual_router_context(&test_vr(), &[], &[test_vpn()], &Settings::default())
            .unwrap()
    }

    #[tokio::test]
    async fn build_stages_bridge_firewall_and_vpn_when_bridge_absent() {
        let ctx = ctx_with_vpn();
        let (remote, tracker) = MockRemote::new();
        let mut errors = Vec::new();

        let built = deploy_build(&remote, &ctx, &mut errors).await;
        assert!(built, "clean run must succeed: {errors:?}");

        // Bridge staged to the temp path, firewall and VPN config to the
        // working directory.
        assert_eq!(
            tracker.file_paths(),
            vec![
                "/home/robot/55-config.yaml".to_string(),
                "/home/robot/P9_firewall.nft".to_string(),
                "/home/robot/P9_vpns.conf".to_string(),
            ]
        );
        // First script installs the bridge, second runs the router build
        let scripts = tracker.scripts();
        assert_eq!(scripts.len(), 2);
        assert!(scripts[0].contains("sudo mv /home/robot/55-config.yaml /etc/netplan/55-config.yaml"));
        assert!(scripts[0].contains("netplan apply"));
        assert!(scripts[1].contains("nft --file /home/robot/P9_firewall.nft"));
        assert!(scripts[1].contains("mv /home/robot/P9_vpns.conf /etc/swanctl/conf.d/P9_vpns.conf"));
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn build_skips_bridge_when_present() {
        let ctx = ctx_with_vpn();
        let mut config = MockRemoteConfig::default();
        config.existing_files.insert("/etc/netplan/55-config.yaml".to_string());
        let (remote, tracker) = MockRemote::with_config(config);
        let mut errors = Vec::new();

        assert!(deploy_build(&remote, &ctx, &mut errors).await);
        assert!(!tracker.file_paths().contains(&"/home/robot/55-config.yaml".to_string()));
        assert_eq!(tracker.scripts().len(), 1);
    }

    #[tokio::test]
    async fn update_never_touches_the_bridge() {
        let ctx = ctx_with_vpn();
        let (remote, tracker) = MockRemote::new();
        let mut errors = Vec::new();

        assert!(deploy_update(&remote, &ctx, &mut errors).await);
        assert!(tracker.existence_checks().is_empty());
        assert_eq!(
            tracker.file_paths(),
            vec![
                "/home/robot/P9_firewall.nft".to_string(),
                "/home/robot/P9_vpns.conf".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn any_stderr_is_failure() {
        let ctx = ctx_with_vpn();
        let (remote, _tracker) = MockRemote::new();
        // Bridge install succeeds silently, the build script then errors
        remote.push_output("", "");
        remote.push_output("", "nft: syntax error");
        let mut errors = Vec::new();

        let built = deploy_build(&remote, &ctx, &mut errors).await;
        assert!(!built);
        assert_eq!(errors, vec!["nft: syntax error".to_string()]);
    }

    #[tokio::test]
    async fn scrub_removes_only_existing_vpn_config() {
        let ctx = ctx_with_vpn();

        // Config present: the scrub script is prefixed with its removal
        let mut config = MockRemoteConfig::default();
        config.existing_files.insert(ctx.vpn_filename.clone());
        let (remote, tracker) = MockRemote::with_config(config);
        let mut errors = Vec::new();
        assert!(deploy_scrub(&remote, &ctx, &mut errors).await);
        assert!(tracker.scripts()[0].starts_with("sudo rm /etc/swanctl/conf.d/P9_vpns.conf\n"));

        // Config absent: plain scrub script
        let (remote, tracker) = MockRemote::new();
        let mut errors = Vec::new();
        assert!(deploy_scrub(&remote, &ctx, &mut errors).await);
        assert!(!tracker.scripts()[0].contains("sudo rm /etc/swanctl"));
    }

    #[tokio::test]
    async fn quiesce_drops_vpn_config_unconditionally_when_vpns_exist() {
        let ctx = ctx_with_vpn();
        let (remote, tracker) = MockRemote::new();
        let mut errors = Vec::new();
        assert!(deploy_quiesce(&remote, &ctx, &mut errors).await);
        let script = &tracker.scripts()[0];
        assert!(script.starts_with("sudo rm /etc/swanctl/conf.d/P9_vpns.conf\n"));
        assert!(script.contains("nft delete table inet P9"));
    }

    #[tokio::test]
    async fn ssh_failure_is_classified_and_fatal() {
        let ctx = ctx_with_vpn();
        let (remote, _) = MockRemote::with_config(MockRemoteConfig {
            exec_error: Some("connection reset".to_string()),
            ..Default::default()
        });
        let mut errors = Vec::new();
        assert!(!deploy_build(&remote, &ctx, &mut errors).await);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("connection reset"));
    }

    #[test]
    fn clearing_debug_flags_reports_whether_any_was_set() {
        let mut vr = test_vr();
        assert!(!clear_debug_flags(&mut vr.firewall_rules));

        vr.firewall_rules[0].debug_logging = true;
        assert!(clear_debug_flags(&mut vr.firewall_rules));
        assert!(vr.firewall_rules.iter().all(|rule| !rule.debug_logging));

        // Cleared rules render without their log statements
        let ctx =
            context::virtual_router_context(&vr, &[], &[], &Settings::default()).unwrap();
        let ruleset = templates::render("virtual_router/firewall.nft", &ctx).unwrap();
        assert!(!ruleset.contains("log prefix"));
    }

    #[test]
    fn rendered_firewall_is_byte_identical_across_runs() {
        let ctx = ctx_with_vpn();
        let first = templates::render("virtual_router/firewall.nft", &ctx).unwrap();
        let second = templates::render("virtual_router/firewall.nft", &ctx).unwrap();
        assert_eq!(first, second);
        assert!(first.contains("table inet P9"));
        // Port defaulted from null input
        assert!(first.contains("{ 0-65535 }"));
    }
}
