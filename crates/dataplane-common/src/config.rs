//! Container image defaults for data plane services
//!
//! Each image can be overridden through a `RELATED_IMAGE_*` environment
//! variable. The struct is built once at startup and then shared read-only
//! through the controller context.

use std::collections::BTreeMap;

/// Default FRR image
pub const FRR_DEFAULT_IMAGE: &str = "quay.io/podified-antelope-centos9/openstack-frr:current-podified";
/// Default iSCSI daemon image
pub const ISCSID_DEFAULT_IMAGE: &str =
    "quay.io/podified-antelope-centos9/openstack-iscsid:current-podified";
/// Default logrotate (cron) image
pub const LOGROTATE_DEFAULT_IMAGE: &str =
    "quay.io/podified-antelope-centos9/openstack-cron:current-podified";
/// Default multipathd image
pub const MULTIPATHD_DEFAULT_IMAGE: &str =
    "quay.io/podified-antelope-centos9/openstack-multipathd:current-podified";
/// Default Neutron metadata agent image
pub const NEUTRON_METADATA_AGENT_DEFAULT_IMAGE: &str =
    "quay.io/podified-antelope-centos9/openstack-neutron-metadata-agent-ovn:current-podified";
/// Default Neutron SR-IOV agent image
pub const NEUTRON_SRIOV_AGENT_DEFAULT_IMAGE: &str =
    "quay.io/podified-antelope-centos9/openstack-neutron-sriov-agent:current-podified";
/// Default Nova compute image
pub const NOVA_COMPUTE_DEFAULT_IMAGE: &str =
    "quay.io/podified-antelope-centos9/openstack-nova-compute:current-podified";
/// Default OVN controller image
pub const OVN_CONTROLLER_AGENT_DEFAULT_IMAGE: &str =
    "quay.io/podified-antelope-centos9/openstack-ovn-controller:current-podified";
/// Default OVN BGP agent image
pub const OVN_BGP_AGENT_DEFAULT_IMAGE: &str =
    "quay.io/podified-antelope-centos9/openstack-ovn-bgp-agent:current-podified";
/// Default Ceilometer compute image
pub const CEILOMETER_COMPUTE_DEFAULT_IMAGE: &str =
    "quay.io/podified-antelope-centos9/openstack-ceilometer-compute:current-podified";
/// Default Ceilometer IPMI image
pub const CEILOMETER_IPMI_DEFAULT_IMAGE: &str =
    "quay.io/podified-antelope-centos9/openstack-ceilometer-ipmi:current-podified";
/// Default node exporter image
pub const NODE_EXPORTER_DEFAULT_IMAGE: &str = "quay.io/prometheus/node-exporter:v1.5.0";

/// Images used by the data plane services, one per service container
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageDefaults {
    /// FRR routing daemon
    pub frr: String,
    /// iSCSI daemon
    pub iscsid: String,
    /// Log rotation (cron)
    pub logrotate: String,
    /// Multipath daemon
    pub multipathd: String,
    /// Neutron OVN metadata agent
    pub neutron_metadata_agent: String,
    /// Neutron SR-IOV agent
    pub neutron_sriov_agent: String,
    /// Nova compute
    pub nova_compute: String,
    /// OVN controller
    pub ovn_controller_agent: String,
    /// OVN BGP agent
    pub ovn_bgp_agent: String,
    /// Ceilometer compute agent
    pub ceilometer_compute: String,
    /// Ceilometer IPMI agent
    pub ceilometer_ipmi: String,
    /// Prometheus node exporter
    pub node_exporter: String,
}

impl Default for ImageDefaults {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl ImageDefaults {
    /// Read every override from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup, using built-in defaults for missing keys
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        Self {
            frr: get("RELATED_IMAGE_EDPM_FRR_IMAGE_URL_DEFAULT", FRR_DEFAULT_IMAGE),
            iscsid: get("RELATED_IMAGE_EDPM_ISCSID_IMAGE_URL_DEFAULT", ISCSID_DEFAULT_IMAGE),
            logrotate: get(
                "RELATED_IMAGE_EDPM_LOGROTATE_CROND_IMAGE_URL_DEFAULT",
                LOGROTATE_DEFAULT_IMAGE,
            ),
            multipathd: get(
                "RELATED_IMAGE_EDPM_MULTIPATHD_IMAGE_URL_DEFAULT",
                MULTIPATHD_DEFAULT_IMAGE,
            ),
            neutron_metadata_agent: get(
                "RELATED_IMAGE_EDPM_NEUTRON_METADATA_AGENT_IMAGE_URL_DEFAULT",
                NEUTRON_METADATA_AGENT_DEFAULT_IMAGE,
            ),
            neutron_sriov_agent: get(
                "RELATED_IMAGE_EDPM_NEUTRON_SRIOV_AGENT_IMAGE_URL_DEFAULT",
                NEUTRON_SRIOV_AGENT_DEFAULT_IMAGE,
            ),
            nova_compute: get(
                "RELATED_IMAGE_EDPM_NOVA_COMPUTE_IMAGE_URL_DEFAULT",
                NOVA_COMPUTE_DEFAULT_IMAGE,
            ),
            ovn_controller_agent: get(
                "RELATED_IMAGE_EDPM_OVN_CONTROLLER_AGENT_IMAGE_URL_DEFAULT",
                OVN_CONTROLLER_AGENT_DEFAULT_IMAGE,
            ),
            ovn_bgp_agent: get(
                "RELATED_IMAGE_EDPM_OVN_BGP_AGENT_IMAGE_URL_DEFAULT",
                OVN_BGP_AGENT_DEFAULT_IMAGE,
            ),
            ceilometer_compute: get(
                "RELATED_IMAGE_EDPM_CEILOMETER_COMPUTE_IMAGE_URL_DEFAULT",
                CEILOMETER_COMPUTE_DEFAULT_IMAGE,
            ),
            ceilometer_ipmi: get(
                "RELATED_IMAGE_EDPM_CEILOMETER_IPMI_IMAGE_URL_DEFAULT",
                CEILOMETER_IPMI_DEFAULT_IMAGE,
            ),
            node_exporter: get(
                "RELATED_IMAGE_EDPM_NODE_EXPORTER_IMAGE_URL_DEFAULT",
                NODE_EXPORTER_DEFAULT_IMAGE,
            ),
        }
    }

    /// Inventory variables naming each image
    pub fn ansible_vars(&self) -> BTreeMap<String, String> {
        [
            ("edpm_frr_image", &self.frr),
            ("edpm_iscsid_image", &self.iscsid),
            ("edpm_logrotate_crond_image", &self.logrotate),
            ("edpm_multipathd_image", &self.multipathd),
            ("edpm_neutron_metadata_agent_image", &self.neutron_metadata_agent),
            ("edpm_neutron_sriov_image", &self.neutron_sriov_agent),
            ("edpm_nova_compute_image", &self.nova_compute),
            ("edpm_ovn_controller_agent_image", &self.ovn_controller_agent),
            ("edpm_ovn_bgp_agent_image", &self.ovn_bgp_agent),
            ("edpm_telemetry_ceilometer_compute_image", &self.ceilometer_compute),
            ("edpm_telemetry_ceilometer_ipmi_image", &self.ceilometer_ipmi),
            ("edpm_telemetry_node_exporter_image", &self.node_exporter),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_overrides() {
        let images = ImageDefaults::default();
        assert_eq!(images.frr, FRR_DEFAULT_IMAGE);
        assert_eq!(images.node_exporter, NODE_EXPORTER_DEFAULT_IMAGE);
    }

    #[test]
    fn lookup_overrides_single_image() {
        let images = ImageDefaults::from_lookup(|key| {
            (key == "RELATED_IMAGE_EDPM_NOVA_COMPUTE_IMAGE_URL_DEFAULT")
                .then(|| "registry.local/nova:1".to_string())
        });
        assert_eq!(images.nova_compute, "registry.local/nova:1");
        assert_eq!(images.iscsid, ISCSID_DEFAULT_IMAGE);
    }

    #[test]
    fn empty_override_falls_back_to_default() {
        let images = ImageDefaults::from_lookup(|_| Some(String::new()));
        assert_eq!(images, ImageDefaults::default());
    }

    #[test]
    fn ansible_vars_cover_every_image() {
        let vars = ImageDefaults::default().ansible_vars();
        assert_eq!(vars.len(), 12);
        assert_eq!(vars["edpm_frr_image"], FRR_DEFAULT_IMAGE);
    }
}
