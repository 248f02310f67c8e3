//! Serde models for the API resources the agent consumes.
//!
//! Only the fields the agent actually reads are modelled; everything else in
//! the payloads is ignored. The shapes here are a wire contract, and the JSON
//! tests at the bottom pin them against literal API payloads.

use serde::{Deserialize, Serialize};

use crate::state::State;

// ─── Shared fragments ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    #[serde(default)]
    pub address_id: Option<i64>,
    #[serde(default)]
    pub virtual_router_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subnet {
    pub id: i64,
    pub address_range: String,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub vlan: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicIp {
    pub address: String,
}

// ─── VirtualRouter ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualRouterIp {
    pub address: String,
    pub subnet: Subnet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallRule {
    pub id: i64,
    pub order: i64,
    /// Destination CIDR; its privacy decides the rule direction.
    pub destination: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub port: Option<String>,
    pub protocol: String,
    #[serde(default)]
    pub allow: bool,
    #[serde(default)]
    pub debug_logging: bool,
    #[serde(default)]
    pub pci_logging: bool,
    #[serde(default)]
    pub updated: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualRouter {
    pub id: i64,
    pub state: State,
    pub project: Project,
    pub ip_address: VirtualRouterIp,
    #[serde(default)]
    pub subnets: Vec<Subnet>,
    #[serde(default)]
    pub firewall_rules: Vec<FirewallRule>,
}

// ─── VM ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: i64,
    pub filename: String,
    pub answer_file_name: String,
    pub os_variant: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Storage {
    pub id: i64,
    pub gb: i64,
    pub primary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmIpAddress {
    pub address: String,
    pub subnet: Subnet,
    #[serde(default)]
    pub public_ip: Option<PublicIp>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageHistory {
    pub storage_id: i64,
    pub gb_quantity: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmHistory {
    #[serde(default)]
    pub storage_histories: Vec<StorageHistory>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vm {
    pub id: i64,
    pub state: State,
    pub project: Project,
    pub server_id: i64,
    pub cpu: i64,
    /// RAM in GB; templates need MB.
    pub ram: i64,
    #[serde(default)]
    pub name: Option<String>,
    pub storages: Vec<Storage>,
    pub storage_type: String,
    pub image: Image,
    #[serde(default)]
    pub dns: Option<String>,
    #[serde(default)]
    pub ip_addresses: Vec<VmIpAddress>,
    #[serde(default)]
    pub gateway_subnet: Option<Subnet>,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub emails: Option<Vec<String>>,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub history: Vec<VmHistory>,
}

impl Vm {
    /// `<project>_<vm>`, the identifier used for staging directories,
    /// domain names and disk files.
    pub fn identifier(&self) -> String {
        format!("{}_{}", self.project.id, self.id)
    }
}

// ─── Snapshot / Backup ─────────────────────────────────────────────────────

/// The VM fragment embedded in snapshot and backup payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwningVm {
    pub id: i64,
    pub project: Project,
    pub server_id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub emails: Option<Vec<String>>,
}

impl OwningVm {
    pub fn identifier(&self) -> String {
        format!("{}_{}", self.project.id, self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: i64,
    pub state: State,
    pub vm: OwningVm,
    #[serde(default)]
    pub name: Option<String>,
    /// When set, scrub removes the snapshot's children as well.
    #[serde(default)]
    pub remove_subtree: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub id: i64,
    pub state: State,
    pub vm: OwningVm,
    #[serde(default)]
    pub name: Option<String>,
    /// 1 = primary repository, 2 = secondary.
    pub repository: i64,
    #[serde(default)]
    pub time_valid: Option<String>,
}

// ─── Server ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerKind {
    Kvm,
    HyperV,
    Phantom,
    Unsupported,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerType {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    pub enabled: bool,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: i64,
    #[serde(rename = "type")]
    pub server_type: ServerType,
    #[serde(default)]
    pub interfaces: Vec<Interface>,
}

impl Server {
    pub fn kind(&self) -> ServerKind {
        match self.server_type.name.as_str() {
            "KVM" => ServerKind::Kvm,
            "HyperV" => ServerKind::HyperV,
            "Phantom" => ServerKind::Phantom,
            _ => ServerKind::Unsupported,
        }
    }

    /// The first enabled interface with a non-null IPv6 address. The
    /// hypervisor network is addressed by stable per-region IPv6, so
    /// anything else is a misconfigured record.
    pub fn host_interface(&self) -> Option<&Interface> {
        self.interfaces.iter().find(|iface| {
            iface.enabled
                && iface
                    .ip_address
                    .as_deref()
                    .and_then(|a| a.parse::<std::net::IpAddr>().ok())
                    .is_some_and(|a| a.is_ipv6())
        })
    }

    pub fn host_ip(&self) -> Option<&str> {
        self.host_interface().and_then(|i| i.ip_address.as_deref())
    }

    /// WinRM cannot address IPv6 literals, so Windows hosts are reached by
    /// the DNS hostname of the selected interface.
    pub fn host_name(&self) -> Option<&str> {
        self.host_interface().and_then(|i| i.hostname.as_deref())
    }
}

// ─── VPN ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnRoute {
    pub id: i64,
    pub local_subnet: Subnet,
    pub remote_subnet: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vpn {
    pub id: i64,
    pub virtual_router_id: i64,
    pub ike_authentication: String,
    pub ike_dh_groups: String,
    pub ike_encryption: String,
    pub ike_mode: String,
    pub ike_pre_shared_key: String,
    pub ike_version: String,
    #[serde(default)]
    pub ike_public_ip: Option<String>,
    pub ipsec_authentication: String,
    pub ipsec_encryption: String,
    pub ipsec_pfs_groups: String,
    #[serde(default)]
    pub routes: Vec<VpnRoute>,
    pub stif_number: i64,
    #[serde(default)]
    pub traffic_selector: bool,
    #[serde(default)]
    pub send_email: bool,
    #[serde(default)]
    pub emails: Option<Vec<String>>,
}

// ─── IP address (standalone listing) ───────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpAddress {
    pub id: i64,
    pub address: String,
    pub subnet: Subnet,
    #[serde(default)]
    pub public_ip: Option<PublicIp>,
    #[serde(default)]
    pub vm_id: Option<i64>,
}

// ─── run_robot polling payload ─────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpBuckets {
    #[serde(default)]
    pub build: Vec<i64>,
    #[serde(default)]
    pub running_update: Vec<i64>,
    #[serde(default)]
    pub quiesced_update: Vec<i64>,
    #[serde(default)]
    pub quiesce: Vec<i64>,
    #[serde(default)]
    pub restart: Vec<i64>,
    #[serde(default)]
    pub scrub: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRobot {
    pub project_ids: Vec<i64>,
    #[serde(default)]
    pub backups: OpBuckets,
    #[serde(default)]
    pub snapshots: OpBuckets,
    #[serde(default)]
    pub virtual_routers: OpBuckets,
    #[serde(default)]
    pub vms: OpBuckets,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::State;

    /// The exact bucket shape the run_robot endpoint produces. If this test
    /// breaks, the poller and the API are out of sync.
    const RUN_ROBOT_JSON: &str = r#"{
        "project_ids": [12, 15],
        "backups": {"build": [], "running_update": [], "quiesced_update": [], "scrub": []},
        "snapshots": {"build": [7], "running_update": [], "quiesced_update": [], "scrub": []},
        "virtual_routers": {"build": [9], "running_update": [3], "quiesced_update": [],
                            "quiesce": [], "restart": [], "scrub": [4]},
        "vms": {"build": [42], "running_update": [], "quiesced_update": [],
                "quiesce": [2], "restart": [], "scrub": []}
    }"#;

    #[test]
    fn deserialize_run_robot_payload() {
        let work: RunRobot = serde_json::from_str(RUN_ROBOT_JSON).unwrap();
        assert_eq!(work.project_ids, vec![12, 15]);
        assert_eq!(work.snapshots.build, vec![7]);
        assert_eq!(work.virtual_routers.build, vec![9]);
        assert_eq!(work.virtual_routers.scrub, vec![4]);
        assert_eq!(work.vms.build, vec![42]);
        assert_eq!(work.vms.quiesce, vec![2]);
        assert!(work.backups.build.is_empty());
    }

    #[test]
    fn deserialize_virtual_router() {
        let json = r#"{
            "id": 9,
            "state": 1,
            "project": {"id": 12, "address_id": 901},
            "ip_address": {
                "address": "91.103.0.4",
                "subnet": {"id": 55, "address_range": "91.103.0.0/24", "gateway": "91.103.0.1"}
            },
            "subnets": [
                {"id": 71, "address_range": "192.168.0.0/24", "vlan": 1002}
            ],
            "firewall_rules": [
                {"id": 5, "order": 1, "destination": "192.168.0.0/24", "port": null,
                 "protocol": "tcp", "allow": true, "debug_logging": false, "pci_logging": true}
            ]
        }"#;
        let vr: VirtualRouter = serde_json::from_str(json).unwrap();
        assert_eq!(vr.state, State::Requested);
        assert_eq!(vr.ip_address.subnet.id, 55);
        assert_eq!(vr.subnets[0].vlan, Some(1002));
        assert!(vr.firewall_rules[0].port.is_none());
    }

    #[test]
    fn vm_identifier_is_project_underscore_vm() {
        let json = r#"{
            "id": 42,
            "state": 1,
            "project": {"id": 12, "virtual_router_id": 9},
            "server_id": 3,
            "cpu": 2,
            "ram": 4,
            "storages": [{"id": 1, "gb": 50, "primary": true}],
            "storage_type": "SSD",
            "image": {"id": 6, "filename": "ubuntu-22.04.qcow2",
                      "answer_file_name": "ubuntu", "os_variant": "ubuntu22.04"}
        }"#;
        let vm: Vm = serde_json::from_str(json).unwrap();
        assert_eq!(vm.identifier(), "12_42");
        assert_eq!(vm.project.virtual_router_id, Some(9));
    }

    #[test]
    fn host_selection_picks_first_enabled_ipv6() {
        let json = r#"{
            "id": 3,
            "type": {"name": "KVM"},
            "interfaces": [
                {"enabled": false, "ip_address": "2a02:2078:3::2", "hostname": null},
                {"enabled": true, "ip_address": "10.0.0.2", "hostname": null},
                {"enabled": true, "ip_address": null, "hostname": null},
                {"enabled": true, "ip_address": "2a02:2078:3::9", "hostname": "kvm-9.pod.example.com"}
            ]
        }"#;
        let server: Server = serde_json::from_str(json).unwrap();
        assert_eq!(server.kind(), ServerKind::Kvm);
        assert_eq!(server.host_ip(), Some("2a02:2078:3::9"));
        assert_eq!(server.host_name(), Some("kvm-9.pod.example.com"));
    }

    #[test]
    fn host_selection_absence_is_none() {
        let json = r#"{
            "id": 4,
            "type": {"name": "HyperV"},
            "interfaces": [{"enabled": true, "ip_address": "10.0.0.2"}]
        }"#;
        let server: Server = serde_json::from_str(json).unwrap();
        assert_eq!(server.kind(), ServerKind::HyperV);
        assert!(server.host_ip().is_none());
    }

    #[test]
    fn unknown_server_type_is_unsupported() {
        let json = r#"{"id": 5, "type": {"name": "Xen"}, "interfaces": []}"#;
        let server: Server = serde_json::from_str(json).unwrap();
        assert_eq!(server.kind(), ServerKind::Unsupported);
    }
}
