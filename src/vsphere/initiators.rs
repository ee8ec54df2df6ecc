//! ESXi storage initiator discovery
//!
//! Collects the identifiers an array needs to present a LUN to a host:
//! online FC/iSCSI/NVMe adapter UIDs, or the PowerFlex SDC GUID.

use crate::domain::ports::{esx_args, EsxRow, HostSystem, InitiatorSource, VCenterClient};
use crate::error::Result;
use tracing::{debug, info};

const INITIATOR_PREFIXES: [&str; 3] = ["fc.", "iqn.", "nqn."];
const ONLINE_STATES: [&str; 2] = ["link-up", "online"];
const SCINI_GUID_PARAM: &str = "IoctlIniGuidStr";

/// Discover the host's initiators the way the adapter expects them
pub async fn discover(
    vcenter: &dyn VCenterClient,
    host: &HostSystem,
    source: InitiatorSource,
) -> Result<Vec<String>> {
    let initiators = match source {
        InitiatorSource::HbaAdapters => {
            let rows = vcenter
                .run_esx_command(host, &esx_args(&["storage", "core", "adapter", "list"]))
                .await?;
            adapter_initiators(&rows)
        }
        InitiatorSource::SciniGuid => {
            let rows = vcenter
                .run_esx_command(
                    host,
                    &esx_args(&["system", "module", "parameters", "list", "-m", "scini"]),
                )
                .await?;
            scini_guid(&rows).into_iter().collect()
        }
    };

    info!(
        "Discovered {} initiator(s) on host {}: {:?}",
        initiators.len(),
        host.name,
        initiators
    );
    Ok(initiators)
}

/// UIDs of online storage adapters, de-duplicated in listing order
pub fn adapter_initiators(rows: &[EsxRow]) -> Vec<String> {
    let mut uids: Vec<String> = Vec::new();

    for row in rows {
        if !row.has("Driver") || !row.has("UID") {
            continue;
        }
        let state = if row.has("LinkState") {
            row.value("LinkState")
        } else {
            row.value("State")
        };
        if !ONLINE_STATES.contains(&state.as_str()) {
            debug!("Skipping adapter {} in state {}", row.value("HBAName"), state);
            continue;
        }

        let uid = row.value("UID");
        let lower = uid.to_lowercase();
        if !INITIATOR_PREFIXES.iter().any(|p| lower.starts_with(p)) {
            continue;
        }
        if !uids.contains(&uid) {
            uids.push(uid);
        }
    }

    uids
}

/// PowerFlex SDC GUID from the `scini` module parameters
pub fn scini_guid(rows: &[EsxRow]) -> Option<String> {
    rows.iter()
        .find(|r| r.value("Name") == SCINI_GUID_PARAM)
        .map(|r| r.value("Value").trim().to_uppercase())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(name: &str, state_key: &str, state: &str, uid: &str) -> EsxRow {
        EsxRow::from_pairs([
            ("HBAName", name),
            ("Driver", "lpfc"),
            (state_key, state),
            ("UID", uid),
        ])
    }

    #[test]
    fn test_adapter_initiators_filters_and_dedupes() {
        let rows = vec![
            adapter("vmhba0", "LinkState", "link-up", "sata.vmhba0"),
            adapter("vmhba1", "LinkState", "link-up", "fc.20000000c0a80abc:21000000c0a80def"),
            adapter("vmhba2", "LinkState", "link-down", "fc.20000000c0a80abc:21000000c0a80aaa"),
            adapter("vmhba64", "State", "online", "iqn.1998-01.com.vmware:esx-1"),
            adapter("vmhba65", "LinkState", "link-up", "fc.20000000c0a80abc:21000000c0a80def"),
            EsxRow::from_pairs([("HBAName", "vmhba9"), ("UID", "iqn.orphan")]),
        ];

        assert_eq!(
            adapter_initiators(&rows),
            vec![
                "fc.20000000c0a80abc:21000000c0a80def".to_string(),
                "iqn.1998-01.com.vmware:esx-1".to_string(),
            ]
        );
    }

    #[test]
    fn test_scini_guid() {
        let rows = vec![
            EsxRow::from_pairs([("Name", "IoctlMdmIPStr"), ("Value", "10.0.0.1")]),
            EsxRow::from_pairs([("Name", "IoctlIniGuidStr"), ("Value", "5b2c1a9e-aaaa-bbbb")]),
        ];
        assert_eq!(scini_guid(&rows).as_deref(), Some("5B2C1A9E-AAAA-BBBB"));
        assert!(scini_guid(&rows[..1]).is_none());
    }
}
