//! DNS records for reserved addresses, published as one DNSData per node set

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, ListParams};
use kube::{Client, ResourceExt};
use serde_json::{json, Value};
use tracing::debug;

use dataplane_common::crd::OpenStackDataPlaneNodeSet;
use dataplane_common::kube_utils::{
    apply_if_changed, dns_data_resource, dns_masq_resource, dynamic_ready,
};
use dataplane_common::Error;

use super::owned_object;
use crate::orchestrator::{DnsDataEnsurer, DnsOutcome, Reservations};

const CTLPLANE_NETWORK: &str = "ctlplane";
const DNS_DATA_LABEL_VALUE: &str = "dnsdata";

/// Records derived from the reservations of a node set
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DnsRecords {
    /// DNSData host entries: `{ip, hostnames}`
    pub hosts: Vec<Value>,
    /// node → network → fully qualified host name
    pub hostnames: BTreeMap<String, BTreeMap<String, String>>,
    /// node → network → address
    pub all_ips: BTreeMap<String, BTreeMap<String, String>>,
    /// DNS domain of the control plane network
    pub ctlplane_search_domain: String,
}

/// Build the DNS records for every reservation
///
/// The short host name is the part before the first dot; the FQDN appends
/// the network's DNS domain. Reservations without a domain publish the
/// short name only.
pub fn dns_records(reservations: &Reservations) -> DnsRecords {
    let mut records = DnsRecords::default();
    for (host, node_reservations) in reservations {
        let short = host.split('.').next().unwrap_or(host);
        for r in node_reservations {
            let fqdn = match r.dns_domain.as_deref().filter(|d| !d.is_empty()) {
                Some(domain) => format!("{short}.{domain}"),
                None => short.to_string(),
            };
            if r.network.eq_ignore_ascii_case(CTLPLANE_NETWORK) {
                if let Some(domain) = &r.dns_domain {
                    records.ctlplane_search_domain = domain.clone();
                }
            }
            records.hosts.push(json!({ "ip": r.address, "hostnames": [fqdn] }));
            records
                .hostnames
                .entry(host.clone())
                .or_default()
                .insert(r.network.clone(), fqdn);
            records
                .all_ips
                .entry(host.clone())
                .or_default()
                .insert(r.network.clone(), r.address.clone());
        }
    }
    records
}

/// Creates the node set's DNSData and reads the DNSMasq addresses
pub struct KubeDnsDataEnsurer {
    client: Client,
    field_manager: String,
}

impl KubeDnsDataEnsurer {
    /// Create a new DNS data ensurer
    pub fn new(client: Client, field_manager: &str) -> Self {
        Self {
            client,
            field_manager: field_manager.to_string(),
        }
    }
}

fn strings_at(obj: &DynamicObject, pointer: &str) -> Vec<String> {
    obj.data
        .pointer(pointer)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl DnsDataEnsurer for KubeDnsDataEnsurer {
    async fn ensure(
        &self,
        node_set: &OpenStackDataPlaneNodeSet,
        reservations: &Reservations,
    ) -> Result<DnsOutcome, Error> {
        let name = node_set.name_any();
        let namespace = node_set.namespace().ok_or(Error::MissingNamespace)?;

        let masq_api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &namespace, &dns_masq_resource());
        let masqs = masq_api.list(&ListParams::default()).await?.items;
        let Some(masq) = masqs.first() else {
            debug!(node_set = %name, "no DNSMasq in namespace, skipping DNS data");
            return Ok(DnsOutcome {
                ready: true,
                ..Default::default()
            });
        };

        let records = dns_records(reservations);
        let resource = dns_data_resource();
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &namespace, &resource);
        let desired = owned_object(
            &resource,
            &name,
            node_set,
            json!({
                "hosts": records.hosts,
                "dnsDataLabelSelectorValue": DNS_DATA_LABEL_VALUE,
            }),
        )?;
        let (dns_data, changed) =
            apply_if_changed(&api, &name, &desired, &self.field_manager).await?;

        Ok(DnsOutcome {
            ready: !changed && dynamic_ready(&dns_data),
            cluster_addresses: strings_at(masq, "/status/dnsClusterAddresses"),
            server_addresses: strings_at(masq, "/status/dnsAddresses"),
            ctlplane_search_domain: records.ctlplane_search_domain,
            hostnames: records.hostnames,
            all_ips: records.all_ips,
        })
    }
}
