//! Process-wide configuration.
//!
//! Every tunable the agent needs comes from the environment with a safe
//! default, read once at startup into a [`Settings`] value that is shared
//! behind an `Arc`. There is no hot reload.

use std::env;

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => v.eq_ignore_ascii_case("true"),
        Err(_) => default,
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    // Region identity
    pub region_name: String,
    pub organization_url: String,

    // IaaS API
    pub api_url: String,
    pub api_username: String,
    pub api_key: String,
    pub api_password: String,

    // Email
    pub email_host: String,
    pub email_port: u16,
    pub email_user: String,
    pub email_password: String,
    pub email_reply_to: String,
    /// Comma-separated list of NOC addresses for failure reports
    pub send_to_fail: String,
    pub compute_ui_url: String,

    // PodNet / router
    pub mgmt_ip: String,
    pub podnet_cpe: String,
    pub private_interface: String,
    pub public_interface: String,
    pub virtual_routers_enabled: bool,

    // Remote access
    pub network_password: String,
    pub ssh_key_path: String,

    // Storage paths
    pub kvm_robot_drive_path: String,
    pub kvm_host_drive_path: String,
    pub kvm_vms_path: String,
    pub hyperv_robot_drive_path: String,
    pub hyperv_host_drive_path: String,
    pub hyperv_vms_path: String,
    pub kvm_primary_backup_path: String,
    pub kvm_secondary_backup_path: String,
    pub hyperv_primary_backup_path: String,
    pub hyperv_secondary_backup_path: String,

    // Image store
    pub image_mirror_url: String,

    // Telemetry
    pub log_endpoint: String,
    pub log_enabled: bool,
    pub log_buffer_path: String,
    pub metrics_endpoint: String,
    pub metrics_database: String,

    // Region behaviour
    pub in_production: bool,
}

impl Settings {
    pub fn from_env() -> Self {
        let organization_url = env_or("ORGANIZATION_URL", "example.com");
        let cop_name = env_or("COP_NAME", "cop");
        let cop_organization_url = env_or("COP_ORGANIZATION_URL", "example.com");
        let cop_portal = env_or("COP_PORTAL", "portal");

        Self {
            region_name: env_or("POD_NAME", "pod"),
            api_url: format!("https://{cop_name}.{cop_organization_url}/"),
            api_username: env_or("CUSTODIAN_API_USERNAME", "user@example.com"),
            api_key: env_or("CUSTODIAN_API_KEY", ""),
            api_password: env_or("CUSTODIAN_API_PASSWORD", ""),

            email_host: env_or("EMAIL_HOST", "mail.example.com"),
            email_port: env_or("EMAIL_PORT", "25").parse().unwrap_or(25),
            email_user: env_or("EMAIL_USER", "notifications@example.com"),
            email_password: env_or("EMAIL_PASSWORD", ""),
            email_reply_to: format!(
                "{organization_url} <{}>",
                env_or("EMAIL_REPLY_TO", "no-reply@example.com"),
            ),
            send_to_fail: env_or("SEND_TO_FAIL", ""),
            compute_ui_url: format!("https://{cop_portal}.{cop_organization_url}/compute/"),

            mgmt_ip: env_or("ROUTER_MGMT_IP", "2a02:2078:3::10:0:1"),
            podnet_cpe: env_or("PODNET_CPE", "x.x.x.x"),
            private_interface: env_or("ROUTER_PRIVATE_INTERFACE", "eth1"),
            public_interface: env_or("ROUTER_PUBLIC_INTERFACE", "eth0"),
            virtual_routers_enabled: env_flag("VIRTUAL_ROUTERS_ENABLED", true),

            network_password: env_or("NETWORK_PASSWORD", ""),
            ssh_key_path: env_or("SSH_KEY_PATH", "/root/.ssh/id_rsa"),

            kvm_robot_drive_path: env_or("KVM_ROBOT_DRIVE_PATH", "/mnt/images/KVM"),
            kvm_host_drive_path: env_or("KVM_HOST_DRIVE_PATH", "/var/lib/libvirt/ISOs/KVM"),
            kvm_vms_path: env_or("KVM_VMS_PATH", "/var/lib/libvirt/images/"),
            hyperv_robot_drive_path: env_or("HYPERV_ROBOT_DRIVE_PATH", "/mnt/images/HyperV"),
            hyperv_host_drive_path: env_or("HYPERV_HOST_DRIVE_PATH", "/var/lib/libvirt/ISOs/HyperV"),
            hyperv_vms_path: env_or("HYPERV_VMS_PATH", "D:\\HyperV\\"),
            kvm_primary_backup_path: env_or("KVM_PRIMARY_BACKUP_PATH", "/mnt/backup-p/"),
            kvm_secondary_backup_path: env_or("KVM_SECONDARY_BACKUP_PATH", "/mnt/backup-s/"),
            hyperv_primary_backup_path: env_or("HYPERV_PRIMARY_BACKUP_PATH", "P:\\"),
            hyperv_secondary_backup_path: env_or("HYPERV_SECONDARY_BACKUP_PATH", "S:\\"),

            image_mirror_url: env_or("IMAGE_MIRROR_URL", "https://downloads.example.com/custodian/"),

            log_endpoint: env_or("LOG_ENDPOINT", ""),
            log_enabled: env_flag("LOG_ENABLED", false),
            log_buffer_path: env_or("LOG_BUFFER_PATH", "log.db"),
            metrics_endpoint: env_or("METRICS_ENDPOINT", ""),
            metrics_database: env_or("METRICS_DATABASE", "custodian"),

            in_production: env_flag("IN_PRODUCTION", true),
            organization_url,
        }
    }

    // Email subjects are parameterized per event so the notifier does not
    // format strings itself.

    pub fn subject_vm_success(&self) -> String {
        format!("[{}] Your VM has been built successfully!", self.organization_url)
    }

    pub fn subject_vm_fail(&self) -> String {
        format!("[{}] Your VM has failed to build.", self.organization_url)
    }

    pub fn subject_project_fail(&self) -> String {
        format!("[{}] VM Failure Occurred!", self.organization_url)
    }

    pub fn subject_vm_schedule_delete(&self) -> String {
        format!("[{}] Your VM has been scheduled for deletion!", self.organization_url)
    }

    pub fn subject_virtual_router_fail(&self) -> String {
        format!("[{}] Virtual Router Failure Occurred!", self.organization_url)
    }

    pub fn subject_vpn_build_success(&self) -> String {
        format!("[{}] Your VPN Tunnel has been built successfully!", self.organization_url)
    }

    pub fn subject_vpn_update_success(&self) -> String {
        format!("[{}] Your VPN Tunnel has been updated successfully!", self.organization_url)
    }

    pub fn subject_backup_fail(&self) -> String {
        format!("[{}] Backup Failure Occurred!", self.organization_url)
    }

    pub fn subject_backup_build_fail(&self) -> String {
        format!("[{}] Your Backup has failed to build.", self.organization_url)
    }

    pub fn subject_snapshot_fail(&self) -> String {
        format!("[{}] Snapshot Failure Occurred!", self.organization_url)
    }

    pub fn subject_snapshot_build_fail(&self) -> String {
        format!("[{}] Your Snapshot has failed to build.", self.organization_url)
    }
}

impl Default for Settings {
    /// Baseline values used by tests; `from_env` layers the environment on
    /// top of the same defaults.
    fn default() -> Self {
        Self {
            region_name: "pod".to_string(),
            organization_url: "example.com".to_string(),
            api_url: "https://cop.example.com/".to_string(),
            api_username: "user@example.com".to_string(),
            api_key: String::new(),
            api_password: String::new(),
            email_host: "mail.example.com".to_string(),
            email_port: 25,
            email_user: "notifications@example.com".to_string(),
            email_password: String::new(),
            email_reply_to: "example.com <no-reply@example.com>".to_string(),
            send_to_fail: "noc@example.com".to_string(),
            compute_ui_url: "https://portal.example.com/compute/".to_string(),
            mgmt_ip: "2a02:2078:3::10:0:1".to_string(),
            podnet_cpe: "x.x.x.x".to_string(),
            private_interface: "eth1".to_string(),
            public_interface: "eth0".to_string(),
            virtual_routers_enabled: true,
            network_password: String::new(),
            ssh_key_path: "/root/.ssh/id_rsa".to_string(),
            kvm_robot_drive_path: "/mnt/images/KVM".to_string(),
            kvm_host_drive_path: "/var/lib/libvirt/ISOs/KVM".to_string(),
            kvm_vms_path: "/var/lib/libvirt/images/".to_string(),
            hyperv_robot_drive_path: "/mnt/images/HyperV".to_string(),
            hyperv_host_drive_path: "/var/lib/libvirt/ISOs/HyperV".to_string(),
            hyperv_vms_path: "D:\\HyperV\\".to_string(),
            kvm_primary_backup_path: "/mnt/backup-p/".to_string(),
            kvm_secondary_backup_path: "/mnt/backup-s/".to_string(),
            hyperv_primary_backup_path: "P:\\".to_string(),
            hyperv_secondary_backup_path: "S:\\".to_string(),
            image_mirror_url: "https://downloads.example.com/custodian/".to_string(),
            log_endpoint: String::new(),
            log_enabled: false,
            log_buffer_path: "log.db".to_string(),
            metrics_endpoint: String::new(),
            metrics_database: "custodian".to_string(),
            in_production: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subjects_carry_organization() {
        let settings = Settings::default();
        assert!(settings.subject_vm_success().starts_with("[example.com]"));
        assert!(settings.subject_vpn_build_success().contains("built successfully"));
        assert!(settings.subject_vpn_update_success().contains("updated successfully"));
    }

    #[test]
    fn default_email_port() {
        let settings = Settings::default();
        assert_eq!(settings.email_port, 25);
    }
}
