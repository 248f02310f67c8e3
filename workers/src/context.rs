//! Template-context derivation: pure functions from API payloads to the
//! typed context structs the templates consume.
//!
//! Everything here must be deterministic: the same payload always produces
//! byte-identical artifacts. Ordering therefore never depends on hash maps
//! or set iteration; duplicates are removed preserving first occurrence.

use std::collections::HashMap;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::Serialize;

use iaas::resource::{IpAddress, Vm, VirtualRouter, Vpn};
use settings::Settings;

use crate::vpn_map;

/// The PodNet working directory for staged project files.
pub const REMOTE_PATH: &str = "/home/robot/";
/// Where the IPsec daemon picks up tunnel definitions.
pub const SWANCTL_DIR: &str = "/etc/swanctl/conf.d/";

// ─── Address helpers ───────────────────────────────────────────────────────

/// RFC1918 for IPv4, unique-local for IPv6. Decides firewall-rule
/// direction and which VM addresses become NICs.
pub fn ip_is_private(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

fn parse_net(cidr: &str) -> Result<IpNet, String> {
    cidr.parse::<IpNet>().map_err(|_| format!("invalid CIDR: {cidr}"))
}

fn family_of(net: &IpNet) -> u8 {
    match net {
        IpNet::V4(_) => 4,
        IpNet::V6(_) => 6,
    }
}

// ─── Virtual router context ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct VlanCtx {
    pub address_family: u8,
    pub address_range: String,
    pub vlan: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NatCtx {
    pub private_address: String,
    pub public_address: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FirewallRuleCtx {
    pub order: i64,
    pub destination: String,
    pub port: String,
    pub protocol: String,
    pub allow: bool,
    pub log: bool,
    pub address_family: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteCtx {
    pub id: i64,
    pub local: String,
    pub remote: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VpnCtx {
    pub id: i64,
    pub stif_number: i64,
    /// `"1"` iff the API says v1-only, else `"2"`.
    pub version: String,
    /// `"yes"` iff ike_mode is aggressive.
    pub aggressive: String,
    pub ike_pre_shared_key: String,
    pub ike_authentication: String,
    pub ike_dh_groups: String,
    pub ike_encryption: String,
    pub ipsec_authentication: String,
    pub ipsec_encryption: String,
    pub ipsec_pfs_groups: String,
    pub local_ts: String,
    pub remote_ts: String,
    pub routes: Vec<RouteCtx>,
    #[serde(skip)]
    pub send_email: bool,
    #[serde(skip)]
    pub emails: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VirtualRouterCtx {
    pub project_id: i64,
    pub vxlan: i64,
    pub virtual_router_ip: String,
    pub virtual_router_gateway: String,
    pub virtual_router_subnet_mask: String,
    pub ipv4_floating_subnet_id: i64,
    pub management_ip: String,
    pub podnet_cpe: String,
    pub private_interface: String,
    pub public_interface: String,
    pub vlans: Vec<VlanCtx>,
    pub local_subnets: Vec<String>,
    pub nats: Vec<NatCtx>,
    pub inbound_firewall_rules: Vec<FirewallRuleCtx>,
    pub outbound_firewall_rules: Vec<FirewallRuleCtx>,
    pub vpns: Vec<VpnCtx>,
    pub remote_path: String,
    pub firewall_filename: String,
    pub temp_vpn_filename: String,
    pub vpn_filename: String,
}

impl VirtualRouterCtx {
    pub fn floating_bridge_file(&self) -> String {
        format!("/etc/netplan/{}-config.yaml", self.ipv4_floating_subnet_id)
    }

    pub fn temp_floating_bridge_file(&self) -> String {
        format!("{}{}-config.yaml", self.remote_path, self.ipv4_floating_subnet_id)
    }

    pub fn remote_firewall_file(&self) -> String {
        format!("{}{}", self.remote_path, self.firewall_filename)
    }
}

/// Derive the full template context for a virtual router from its API
/// payload, the NAT-eligible addresses of its subnets, and its VPNs (with
/// emails already filled in where `send_email` is set).
pub fn virtual_router_context(
    vr: &VirtualRouter,
    nat_ips: &[IpAddress],
    vpns: &[Vpn],
    settings: &Settings,
) -> Result<VirtualRouterCtx, String> {
    let project_id = vr.project.id;
    let vxlan = vr
        .project
        .address_id
        .ok_or_else(|| format!("virtual router #{} has no project address id", vr.id))?;

    let floating = &vr.ip_address.subnet;
    let virtual_router_subnet_mask = floating
        .address_range
        .split('/')
        .nth(1)
        .ok_or_else(|| format!("floating subnet range is not CIDR: {}", floating.address_range))?
        .to_string();
    let virtual_router_gateway = floating
        .gateway
        .clone()
        .ok_or_else(|| format!("floating subnet #{} has no gateway", floating.id))?;

    // VLAN bridges and CIDR-normalized local subnets
    let mut vlans = Vec::with_capacity(vr.subnets.len());
    let mut local_subnets = Vec::with_capacity(vr.subnets.len());
    for subnet in &vr.subnets {
        let net = parse_net(&subnet.address_range)?;
        let vlan = subnet
            .vlan
            .ok_or_else(|| format!("subnet #{} has no VLAN tag", subnet.id))?;
        vlans.push(VlanCtx {
            address_family: family_of(&net),
            address_range: subnet.address_range.clone(),
            vlan,
        });
        local_subnets.push(net.trunc().to_string());
    }

    // NAT pairs: every subnet address with a public counterpart
    let mut nats = Vec::with_capacity(nat_ips.len());
    for ip in nat_ips {
        let public = ip
            .public_ip
            .as_ref()
            .ok_or_else(|| format!("NAT listing returned ip #{} without a public address", ip.id))?;
        nats.push(NatCtx {
            private_address: ip.address.clone(),
            public_address: public.address.clone(),
        });
    }

    // Firewall rules, totally ordered, split by destination privacy
    let mut rules: Vec<&iaas::resource::FirewallRule> = vr.firewall_rules.iter().collect();
    rules.sort_by_key(|r| r.order);
    let mut inbound = Vec::new();
    let mut outbound = Vec::new();
    for rule in rules {
        let destination = parse_net(&rule.destination)?;
        let ctx = FirewallRuleCtx {
            order: rule.order,
            destination: rule.destination.clone(),
            port: rule.port.clone().unwrap_or_else(|| "0-65535".to_string()),
            protocol: rule.protocol.clone(),
            allow: rule.allow,
            log: rule.pci_logging || rule.debug_logging,
            address_family: family_of(&destination),
        };
        if ip_is_private(&destination.addr()) {
            inbound.push(ctx);
        } else {
            outbound.push(ctx);
        }
    }

    let vpns = vpns
        .iter()
        .map(|vpn| vpn_context(project_id, vpn))
        .collect::<Result<Vec<_>, _>>()?;

    let firewall_filename = format!("P{project_id}_firewall.nft");
    Ok(VirtualRouterCtx {
        project_id,
        vxlan,
        virtual_router_ip: vr.ip_address.address.clone(),
        virtual_router_gateway,
        virtual_router_subnet_mask,
        ipv4_floating_subnet_id: floating.id,
        management_ip: settings.mgmt_ip.clone(),
        podnet_cpe: settings.podnet_cpe.clone(),
        private_interface: settings.private_interface.clone(),
        public_interface: settings.public_interface.clone(),
        vlans,
        local_subnets,
        nats,
        inbound_firewall_rules: inbound,
        outbound_firewall_rules: outbound,
        vpns,
        remote_path: REMOTE_PATH.to_string(),
        firewall_filename: firewall_filename.clone(),
        temp_vpn_filename: format!("{REMOTE_PATH}P{project_id}_vpns.conf"),
        vpn_filename: format!("{SWANCTL_DIR}P{project_id}_vpns.conf"),
    })
}

fn vpn_context(project_id: i64, vpn: &Vpn) -> Result<VpnCtx, String> {
    let mut routes = Vec::with_capacity(vpn.routes.len());
    let mut local_ts: Vec<String> = Vec::new();
    let mut remote_ts: Vec<String> = Vec::new();
    for route in &vpn.routes {
        let local = parse_net(&route.local_subnet.address_range)?.trunc().to_string();
        let remote = parse_net(&route.remote_subnet)?.trunc().to_string();
        if !local_ts.contains(&local) {
            local_ts.push(local.clone());
        }
        if !remote_ts.contains(&remote) {
            remote_ts.push(remote.clone());
        }
        routes.push(RouteCtx { id: route.id, local, remote });
    }

    let (local_ts, remote_ts) = if vpn.traffic_selector {
        (local_ts.join(","), remote_ts.join(","))
    } else {
        ("0.0.0.0/0".to_string(), "0.0.0.0/0".to_string())
    };

    let unknown = |field: &str, value: &str| {
        format!("VPN #{} for project #{project_id} has unknown {field}: {value}", vpn.id)
    };
    Ok(VpnCtx {
        id: vpn.id,
        stif_number: vpn.stif_number,
        version: if vpn.ike_version == "v1-only" { "1" } else { "2" }.to_string(),
        aggressive: if vpn.ike_mode == "aggressive" { "yes" } else { "no" }.to_string(),
        ike_pre_shared_key: vpn.ike_pre_shared_key.clone(),
        ike_authentication: vpn_map::ike_authentication(&vpn.ike_authentication)
            .ok_or_else(|| unknown("IKE authentication", &vpn.ike_authentication))?
            .to_string(),
        ike_dh_groups: vpn_map::ike_dh_group(&vpn.ike_dh_groups)
            .ok_or_else(|| unknown("IKE DH group", &vpn.ike_dh_groups))?
            .to_string(),
        ike_encryption: vpn_map::ike_encryption(&vpn.ike_encryption)
            .ok_or_else(|| unknown("IKE encryption", &vpn.ike_encryption))?
            .to_string(),
        ipsec_authentication: vpn_map::ipsec_authentication(&vpn.ipsec_authentication)
            .ok_or_else(|| unknown("IPsec authentication", &vpn.ipsec_authentication))?
            .to_string(),
        ipsec_encryption: vpn_map::ipsec_encryption(&vpn.ipsec_encryption)
            .ok_or_else(|| unknown("IPsec encryption", &vpn.ipsec_encryption))?
            .to_string(),
        ipsec_pfs_groups: vpn_map::ipsec_pfs_group(&vpn.ipsec_pfs_groups)
            .ok_or_else(|| unknown("IPsec PFS group", &vpn.ipsec_pfs_groups))?
            .to_string(),
        local_ts,
        remote_ts,
        routes,
        send_email: vpn.send_email,
        emails: vpn.emails.clone().unwrap_or_default(),
    })
}

// ─── VM NIC layout ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct NicCtx {
    pub ips: Vec<String>,
    pub gateway: String,
    pub netmask: String,
    pub netmask_int: String,
    pub vlan: String,
    pub order: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrimaryNicCtx {
    pub ip: String,
    pub gateway: String,
    pub netmask: String,
    pub netmask_int: String,
    pub vlan: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NicLayout {
    /// All VLAN tags the VM touches, for bridge staging.
    pub vlans: Vec<String>,
    /// Secondary NICs, one per non-gateway subnet.
    pub nics: Vec<NicCtx>,
    /// The boot NIC. The gateway subnet's first address when one exists.
    pub first_nic_primary: Option<PrimaryNicCtx>,
    /// Remaining addresses of the primary NIC's subnet, if any.
    pub first_nic_secondary: Option<NicCtx>,
}

/// Lay the VM's private addresses out as NICs, one per subnet. The gateway
/// subnet's interface, when present, becomes the primary NIC.
pub fn derive_nics(vm: &Vm) -> NicLayout {
    struct SubnetSlot {
        id: i64,
        gateway: String,
        netmask: String,
        netmask_int: String,
        vlan: String,
    }

    let mut layout = NicLayout::default();

    // Private addresses only, most recent first
    let mut addresses: Vec<&iaas::resource::VmIpAddress> = vm
        .ip_addresses
        .iter()
        .filter(|ip| {
            ip.address
                .parse::<IpAddr>()
                .map(|a| ip_is_private(&a))
                .unwrap_or(false)
        })
        .collect();
    addresses.reverse();

    // Distinct subnets in first-seen order
    let mut subnets: Vec<SubnetSlot> = Vec::new();
    for ip in &addresses {
        if subnets.iter().any(|s| s.id == ip.subnet.id) {
            continue;
        }
        let Ok(net) = ip.subnet.address_range.parse::<IpNet>() else {
            continue;
        };
        let Some(vlan) = ip.subnet.vlan else {
            continue;
        };
        subnets.push(SubnetSlot {
            id: ip.subnet.id,
            gateway: ip.subnet.address_range.split('/').next().unwrap_or_default().to_string(),
            netmask: net.netmask().to_string(),
            netmask_int: net.prefix_len().to_string(),
            vlan: vlan.to_string(),
        });
    }

    let gateway_subnet_id = vm.gateway_subnet.as_ref().map(|s| s.id);
    let mut default_ips: Vec<String> = Vec::new();
    let mut default_slot: Option<usize> = None;

    for (index, slot) in subnets.iter().enumerate() {
        layout.vlans.push(slot.vlan.clone());

        let mut non_default: Vec<String> = Vec::new();
        for ip in &addresses {
            if ip.subnet.id != slot.id {
                continue;
            }
            if gateway_subnet_id == Some(slot.id) {
                default_ips.push(ip.address.clone());
                default_slot = Some(index);
            } else {
                non_default.push(ip.address.clone());
            }
        }
        if !non_default.is_empty() {
            layout.nics.push(NicCtx {
                ips: non_default,
                gateway: slot.gateway.clone(),
                netmask: slot.netmask.clone(),
                netmask_int: slot.netmask_int.clone(),
                vlan: slot.vlan.clone(),
                order: 0,
            });
        }
    }

    if let Some(index) = default_slot {
        // The gateway subnet's first address boots the VM
        let slot = &subnets[index];
        let mut rest = default_ips;
        let first = rest.remove(0);
        layout.first_nic_primary = Some(PrimaryNicCtx {
            ip: first,
            gateway: slot.gateway.clone(),
            netmask: slot.netmask.clone(),
            netmask_int: slot.netmask_int.clone(),
            vlan: slot.vlan.clone(),
        });
        if !rest.is_empty() {
            layout.first_nic_secondary = Some(NicCtx {
                ips: rest,
                gateway: slot.gateway.clone(),
                netmask: slot.netmask.clone(),
                netmask_int: slot.netmask_int.clone(),
                vlan: slot.vlan.clone(),
                order: 0,
            });
        }
    } else if !layout.nics.is_empty() {
        // No gateway subnet: promote the first NIC's first address
        let mut nic0 = layout.nics.remove(0);
        let first = nic0.ips.remove(0);
        layout.first_nic_primary = Some(PrimaryNicCtx {
            ip: first,
            gateway: nic0.gateway.clone(),
            netmask: nic0.netmask.clone(),
            netmask_int: nic0.netmask_int.clone(),
            vlan: nic0.vlan.clone(),
        });
        if !nic0.ips.is_empty() {
            layout.first_nic_secondary = Some(nic0);
        }
    }

    for (i, nic) in layout.nics.iter_mut().enumerate() {
        nic.order = i + 1;
    }

    layout
}

// ─── VM contexts ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct StorageCtx {
    pub id: i64,
    pub gb: i64,
    pub primary: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriveCtx {
    pub id: i64,
    pub new_size: i64,
    pub old_size: i64,
}

/// Drives whose size changed in the most recent update request, derived
/// from the storage history the API attaches to the VM.
pub fn derive_drive_updates(vm: &Vm) -> Vec<DriveCtx> {
    let Some(newest) = vm.history.first() else {
        return Vec::new();
    };
    let old_sizes: HashMap<i64, i64> = vm
        .history
        .get(1)
        .map(|entry| {
            entry
                .storage_histories
                .iter()
                .map(|h| (h.storage_id, h.gb_quantity))
                .collect()
        })
        .unwrap_or_default();

    let mut drives = Vec::new();
    for change in &newest.storage_histories {
        let Some(storage) = vm.storages.iter().find(|s| s.id == change.storage_id) else {
            continue;
        };
        drives.push(DriveCtx {
            id: storage.id,
            new_size: storage.gb,
            old_size: old_sizes.get(&storage.id).copied().unwrap_or(0),
        });
    }
    drives
}

/// Locale constants for answer files.
pub const KEYBOARD: &str = "ie";
pub const LANGUAGE: &str = "en_IE";
pub const TIMEZONE: &str = "Europe/Dublin";

#[derive(Debug, Clone, Serialize)]
pub struct VmKvmCtx {
    pub vm_identifier: String,
    pub image_filename: String,
    pub image_os_variant: String,
    pub cpu: i64,
    /// MB, converted from the API's GB.
    pub ram: i64,
    pub dns: String,
    pub admin_password: String,
    pub crypted_admin_password: String,
    pub crypted_root_password: String,
    pub ssh_public_key: Option<String>,
    pub storages: Vec<StorageCtx>,
    pub storage_type: String,
    #[serde(flatten)]
    pub nics: NicLayout,
    pub keyboard: String,
    pub language: String,
    pub timezone: String,
    pub host_sudo_passwd: String,
    pub network_drive_path: String,
    pub vms_path: String,
    pub drives: Vec<DriveCtx>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VmHyperVCtx {
    pub vm_identifier: String,
    pub image_filename: String,
    pub cpu: i64,
    pub ram: i64,
    pub dns: String,
    pub admin_password: String,
    pub storages: Vec<StorageCtx>,
    pub storage_type: String,
    #[serde(flatten)]
    pub nics: NicLayout,
    pub keyboard: String,
    pub language: String,
    pub timezone: String,
    pub network_drive_url: String,
    pub vms_path: String,
    pub drives: Vec<DriveCtx>,
    /// Whether the update should boot the VM again afterwards.
    pub restart: bool,
}

pub fn storages_ctx(vm: &Vm) -> Vec<StorageCtx> {
    vm.storages
        .iter()
        .map(|s| StorageCtx { id: s.id, gb: s.gb, primary: s.primary })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use iaas::resource::{
        FirewallRule, Project, Subnet, VirtualRouterIp, VmIpAddress, VpnRoute,
    };
    use iaas::State;

    fn subnet(id: i64, range: &str, vlan: i64) -> Subnet {
        Subnet {
            id,
            address_range: range.to_string(),
            gateway: None,
            vlan: Some(vlan),
        }
    }

    fn rule(order: i64, destination: &str, port: Option<&str>, pci: bool, debug: bool) -> FirewallRule {
        FirewallRule {
            id: order,
            order,
            destination: destination.to_string(),
            source: None,
            port: port.map(String::from),
            protocol: "tcp".to_string(),
            allow: true,
            debug_logging: debug,
            pci_logging: pci,
            updated: None,
        }
    }

    fn test_vr() -> VirtualRouter {
        VirtualRouter {
            id: 9,
            state: State::Requested,
            project: Project { id: 12, address_id: Some(901), virtual_router_id: None },
            ip_address: VirtualRouterIp {
                address: "91.103.0.4".to_string(),
                subnet: Subnet {
                    id: 55,
                    address_range: "91.103.0.0/24".to_string(),
                    gateway: Some("91.103.0.1".to_string()),
                    vlan: None,
                },
            },
            subnets: vec![subnet(71, "192.168.0.0/24", 1002)],
            firewall_rules: vec![
                rule(2, "8.8.8.0/24", None, false, false),
                rule(1, "192.168.0.0/24", Some("443"), true, false),
            ],
        }
    }

    fn test_vpn() -> Vpn {
        Vpn {
            id: 77,
            virtual_router_id: 9,
            ike_authentication: "sha-256".to_string(),
            ike_dh_groups: "group2".to_string(),
            ike_encryption: "aes-256-cbc".to_string(),
            ike_mode: "main".to_string(),
            ike_pre_shared_key: "hunter2".to_string(),
            ike_version: "v1-only".to_string(),
            ike_public_ip: None,
            ipsec_authentication: "hmac-sha1-96".to_string(),
            ipsec_encryption: "aes-256-gcm".to_string(),
            ipsec_pfs_groups: "group14".to_string(),
            routes: vec![VpnRoute {
                id: 1,
                local_subnet: subnet(71, "192.168.0.5/24", 1002),
                remote_subnet: "10.9.0.0/16".to_string(),
            }],
            stif_number: 1001,
            traffic_selector: true,
            send_email: true,
            emails: Some(vec!["net@example.com".to_string()]),
        }
    }

    #[test]
    fn firewall_rules_sorted_and_split_by_privacy() {
        let ctx = virtual_router_context(&test_vr(), &[], &[], &Settings::default()).unwrap();
        // order 1 is private destination: inbound; order 2 public: outbound
        assert_eq!(ctx.inbound_firewall_rules.len(), 1);
        assert_eq!(ctx.inbound_firewall_rules[0].order, 1);
        assert_eq!(ctx.inbound_firewall_rules[0].port, "443");
        assert!(ctx.inbound_firewall_rules[0].log);
        assert_eq!(ctx.outbound_firewall_rules.len(), 1);
        assert_eq!(ctx.outbound_firewall_rules[0].order, 2);
        // port defaults exactly when input is null
        assert_eq!(ctx.outbound_firewall_rules[0].port, "0-65535");
        assert!(!ctx.outbound_firewall_rules[0].log);
    }

    #[test]
    fn filenames_follow_project_scheme() {
        let ctx = virtual_router_context(&test_vr(), &[], &[], &Settings::default()).unwrap();
        assert_eq!(ctx.firewall_filename, "P12_firewall.nft");
        assert_eq!(ctx.temp_vpn_filename, "/home/robot/P12_vpns.conf");
        assert_eq!(ctx.vpn_filename, "/etc/swanctl/conf.d/P12_vpns.conf");
        assert_eq!(ctx.floating_bridge_file(), "/etc/netplan/55-config.yaml");
        assert_eq!(ctx.temp_floating_bridge_file(), "/home/robot/55-config.yaml");
        assert_eq!(ctx.virtual_router_subnet_mask, "24");
    }

    #[test]
    fn local_subnets_are_cidr_normalized() {
        let mut vr = test_vr();
        vr.subnets = vec![subnet(71, "192.168.0.17/24", 1002)];
        let ctx = virtual_router_context(&vr, &[], &[], &Settings::default()).unwrap();
        assert_eq!(ctx.local_subnets, vec!["192.168.0.0/24".to_string()]);
        assert_eq!(ctx.vlans[0].address_family, 4);
    }

    #[test]
    fn vpn_context_translates_crypto_and_selectors() {
        let ctx = virtual_router_context(&test_vr(), &[], &[test_vpn()], &Settings::default())
            .unwrap();
        let vpn = &ctx.vpns[0];
        assert_eq!(vpn.version, "1");
        assert_eq!(vpn.aggressive, "no");
        assert_eq!(vpn.ike_encryption, "aes256");
        assert_eq!(vpn.ipsec_encryption, "aes256gcm64");
        assert_eq!(vpn.ipsec_pfs_groups, "modp2048");
        assert_eq!(vpn.local_ts, "192.168.0.0/24");
        assert_eq!(vpn.remote_ts, "10.9.0.0/16");
        assert_eq!(vpn.routes[0].local, "192.168.0.0/24");
    }

    #[test]
    fn vpn_selectors_default_when_unset() {
        let mut vpn = test_vpn();
        vpn.traffic_selector = false;
        let ctx = virtual_router_context(&test_vr(), &[], &[vpn], &Settings::default()).unwrap();
        assert_eq!(ctx.vpns[0].local_ts, "0.0.0.0/0");
        assert_eq!(ctx.vpns[0].remote_ts, "0.0.0.0/0");
    }

    #[test]
    fn unknown_vpn_crypto_is_an_error() {
        let mut vpn = test_vpn();
        vpn.ike_encryption = "rot13".to_string();
        let err = virtual_router_context(&test_vr(), &[], &[vpn], &Settings::default())
            .unwrap_err();
        assert!(err.contains("unknown IKE encryption"));
    }

    #[test]
    fn context_derivation_is_deterministic() {
        let vr = test_vr();
        let vpns = [test_vpn()];
        let settings = Settings::default();
        let first = virtual_router_context(&vr, &[], &vpns, &settings).unwrap();
        let second = virtual_router_context(&vr, &[], &vpns, &settings).unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    // ─── NIC derivation ────────────────────────────────────────────────

    fn vm_ip(address: &str, subnet_id: i64, range: &str, vlan: i64) -> VmIpAddress {
        VmIpAddress {
            address: address.to_string(),
            subnet: subnet(subnet_id, range, vlan),
            public_ip: None,
        }
    }

    fn test_vm(ips: Vec<VmIpAddress>, gateway_subnet: Option<Subnet>) -> Vm {
        Vm {
            id: 42,
            state: State::Requested,
            project: Project { id: 12, address_id: None, virtual_router_id: Some(9) },
            server_id: 3,
            cpu: 2,
            ram: 4,
            name: Some("web-1".to_string()),
            storages: vec![iaas::resource::Storage { id: 1, gb: 50, primary: true }],
            storage_type: "SSD".to_string(),
            image: iaas::resource::Image {
                id: 6,
                filename: "ubuntu.qcow2".to_string(),
                answer_file_name: "kickstart".to_string(),
                os_variant: "ubuntu22.04".to_string(),
            },
            dns: Some("8.8.8.8".to_string()),
            ip_addresses: ips,
            gateway_subnet,
            public_key: None,
            emails: None,
            created: None,
            history: Vec::new(),
        }
    }

    #[test]
    fn gateway_subnet_interface_becomes_primary() {
        let ips = vec![
            vm_ip("192.168.1.10", 80, "192.168.1.1/24", 1003),
            vm_ip("192.168.0.10", 71, "192.168.0.1/24", 1002),
            vm_ip("91.103.0.9", 55, "91.103.0.1/24", 1),
        ];
        let vm = test_vm(ips, Some(subnet(71, "192.168.0.1/24", 1002)));
        let layout = derive_nics(&vm);

        let primary = layout.first_nic_primary.expect("gateway subnet must be primary");
        assert_eq!(primary.ip, "192.168.0.10");
        assert_eq!(primary.vlan, "1002");
        assert_eq!(primary.gateway, "192.168.0.1");
        assert_eq!(primary.netmask, "255.255.255.0");
        assert_eq!(primary.netmask_int, "24");
        // Public 91.103.0.9 filtered; the other subnet is a secondary NIC
        assert_eq!(layout.nics.len(), 1);
        assert_eq!(layout.nics[0].ips, vec!["192.168.1.10".to_string()]);
        assert_eq!(layout.nics[0].order, 1);
        assert!(layout.first_nic_secondary.is_none());
    }

    #[test]
    fn no_gateway_subnet_promotes_first_nic() {
        let ips = vec![
            vm_ip("192.168.0.10", 71, "192.168.0.1/24", 1002),
            vm_ip("192.168.0.11", 71, "192.168.0.1/24", 1002),
        ];
        let vm = test_vm(ips, None);
        let layout = derive_nics(&vm);

        let primary = layout.first_nic_primary.expect("first NIC promoted");
        // Addresses are considered most-recent-first
        assert_eq!(primary.ip, "192.168.0.11");
        let secondary = layout.first_nic_secondary.expect("leftover address kept");
        assert_eq!(secondary.ips, vec!["192.168.0.10".to_string()]);
        assert!(layout.nics.is_empty());
    }

    #[test]
    fn vm_with_no_private_addresses_has_no_nics() {
        let vm = test_vm(vec![vm_ip("91.103.0.9", 55, "91.103.0.1/24", 1)], None);
        let layout = derive_nics(&vm);
        assert!(layout.first_nic_primary.is_none());
        assert!(layout.nics.is_empty());
        assert!(layout.vlans.is_empty());
    }

    #[test]
    fn drive_updates_compare_history_entries() {
        let mut vm = test_vm(Vec::new(), None);
        vm.storages = vec![
            iaas::resource::Storage { id: 1, gb: 80, primary: true },
            iaas::resource::Storage { id: 2, gb: 20, primary: false },
        ];
        vm.history = vec![
            iaas::resource::VmHistory {
                storage_histories: vec![
                    iaas::resource::StorageHistory { storage_id: 1, gb_quantity: 80 },
                    iaas::resource::StorageHistory { storage_id: 2, gb_quantity: 20 },
                ],
            },
            iaas::resource::VmHistory {
                storage_histories: vec![iaas::resource::StorageHistory {
                    storage_id: 1,
                    gb_quantity: 50,
                }],
            },
        ];
        let drives = derive_drive_updates(&vm);
        assert_eq!(drives.len(), 2);
        assert_eq!(drives[0].id, 1);
        assert_eq!(drives[0].new_size, 80);
        assert_eq!(drives[0].old_size, 50);
        // Drive 2 is new in this update
        assert_eq!(drives[1].old_size, 0);
    }

    #[test]
    fn drive_updates_empty_without_history() {
        let vm = test_vm(Vec::new(), None);
        assert!(derive_drive_updates(&vm).is_empty());
    }
}
