//! Render environment for every script, config file and email body the
//! agent produces.
//!
//! Templates are compiled into the binary; the workers only ever supply a
//! typed context struct. Rendering the same context twice must produce
//! byte-identical output, so nothing here may read the clock or any other
//! ambient state.

use std::fmt;
use std::sync::OnceLock;

use minijinja::Environment;
use serde::Serialize;

#[derive(Debug)]
pub enum RenderError {
    UnknownTemplate(String),
    Render(minijinja::Error),
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderError::UnknownTemplate(name) => write!(f, "unknown template: {name}"),
            RenderError::Render(err) => write!(f, "template render failed: {err}"),
        }
    }
}

impl std::error::Error for RenderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RenderError::Render(err) => Some(err),
            RenderError::UnknownTemplate(_) => None,
        }
    }
}

macro_rules! embed {
    ($env:expr, $($name:literal),+ $(,)?) => {
        $(
            $env.add_template($name, include_str!(concat!("../assets/", $name, ".j2")))
                .expect(concat!("embedded template ", $name, " must parse"));
        )+
    };
}

fn environment() -> &'static Environment<'static> {
    static ENV: OnceLock<Environment<'static>> = OnceLock::new();
    ENV.get_or_init(|| {
        let mut env = Environment::new();
        embed!(
            env,
            // PodNet / virtual router
            "virtual_router/build.sh",
            "virtual_router/update.sh",
            "virtual_router/quiesce.sh",
            "virtual_router/restart.sh",
            "virtual_router/scrub.sh",
            "virtual_router/firewall.nft",
            "virtual_router/vpn.conf",
            "virtual_router/floating_bridge.yaml",
            // KVM
            "vm/kvm/bridge.yaml",
            "vm/kvm/bridge_build.sh",
            "vm/kvm/bridge_scrub.sh",
            "vm/kvm/build.sh",
            "vm/kvm/update.sh",
            "vm/kvm/quiesce.sh",
            "vm/kvm/restart.sh",
            "vm/kvm/scrub.sh",
            "vm/kvm/answer_files/kickstart",
            "vm/kvm/answer_files/preseed",
            // Hyper-V
            "vm/hyperv/build.ps1",
            "vm/hyperv/update.ps1",
            "vm/hyperv/quiesce.ps1",
            "vm/hyperv/restart.ps1",
            "vm/hyperv/scrub.ps1",
            "vm/hyperv/unattend.xml",
            "vm/hyperv/network.xml",
            "vm/hyperv/builder.psm1",
            // Backups
            "backup/kvm/build.sh",
            "backup/kvm/update.sh",
            "backup/kvm/scrub.sh",
            "backup/hyperv/build.ps1",
            "backup/hyperv/update.ps1",
            "backup/hyperv/scrub.ps1",
            // Snapshots
            "snapshot/kvm/build.sh",
            "snapshot/kvm/update.sh",
            "snapshot/kvm/scrub.sh",
            "snapshot/hyperv/build.ps1",
            "snapshot/hyperv/update.ps1",
            "snapshot/hyperv/scrub.ps1",
            // Emails
            "emails/vm_build_success.html",
            "emails/vm_build_failure.html",
            "emails/vm_failure.html",
            "emails/virtual_router_failure.html",
            "emails/backup_failure.html",
            "emails/backup_build_failure.html",
            "emails/snapshot_failure.html",
            "emails/snapshot_build_failure.html",
            "emails/vpn_success.html",
            "emails/scheduled_delete_success.html",
        );
        env
    })
}

/// Render the named template with the given context.
pub fn render<S: Serialize>(name: &str, ctx: &S) -> Result<String, RenderError> {
    let template = environment()
        .get_template(name)
        .map_err(|_| RenderError::UnknownTemplate(name.to_string()))?;
    template.render(ctx).map_err(RenderError::Render)
}

/// Whether a template with this name is embedded. Used to validate
/// API-supplied answer-file names before staging.
pub fn exists(name: &str) -> bool {
    environment().get_template(name).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct BridgeCtx {
        vlan: String,
    }

    #[test]
    fn renders_embedded_template() {
        let out = render("vm/kvm/bridge.yaml", &BridgeCtx { vlan: "1002".into() }).unwrap();
        assert!(out.contains("br1002"));
    }

    #[test]
    fn unknown_template_is_an_error() {
        let err = render("vm/kvm/answer_files/amiga", &BridgeCtx { vlan: "1".into() })
            .unwrap_err();
        assert!(matches!(err, RenderError::UnknownTemplate(_)));
    }

    #[test]
    fn rendering_is_deterministic() {
        let ctx = BridgeCtx { vlan: "1002".into() };
        let first = render("vm/kvm/bridge.yaml", &ctx).unwrap();
        let second = render("vm/kvm/bridge.yaml", &ctx).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn every_embedded_template_parses() {
        // Forcing the environment to build parses every asset.
        assert!(exists("virtual_router/firewall.nft"));
        assert!(exists("emails/vpn_success.html"));
        assert!(!exists("virtual_router/nonsense"));
    }
}
