//! vCenter Client
//!
//! Implements [`VCenterClient`] over the vSphere SOAP API: session login,
//! inventory lookups through the SearchIndex and PropertyCollector, and esxcli
//! execution through the host's managed method executer.

use super::disk;
use super::esxcli::{self, EsxCliCommand, ExecuteOutcome, CliTypeInfo};
use super::soap::{self, MoRef, SoapClient};
use super::xml;
use crate::domain::ports::{Datastore, DiskBacking, EsxRow, HostSystem, VCenterClient};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Depth limit when walking folders and parents
const MAX_INVENTORY_DEPTH: usize = 16;

// =============================================================================
// Configuration
// =============================================================================

/// Connection settings for vCenter
#[derive(Debug)]
pub struct VSphereConfig {
    /// vCenter host name or URL
    pub hostname: String,
    pub username: String,
    pub password: SecretString,
    /// Skip TLS verification
    pub insecure: bool,
    /// API version sent as SOAPAction
    pub api_version: String,
    /// Per-request HTTP timeout
    pub request_timeout: Duration,
}

impl VSphereConfig {
    pub fn new(hostname: &str, username: &str, password: SecretString) -> Self {
        Self {
            hostname: hostname.to_string(),
            username: username.to_string(),
            password,
            insecure: false,
            api_version: "7.0".to_string(),
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// ServiceInstance content fields the client needs
#[derive(Debug, Clone)]
struct ServiceContent {
    root_folder: String,
    property_collector: String,
    search_index: String,
    session_manager: String,
}

// =============================================================================
// vSphere Client
// =============================================================================

/// SOAP-backed vCenter client
pub struct VSphereClient {
    config: VSphereConfig,
    soap: SoapClient,
    content: ServiceContent,
    /// vm id -> resolved VirtualMachine moref
    vms: Mutex<BTreeMap<String, MoRef>>,
    /// host moref -> ReflectManagedMethodExecuter moref
    executers: Mutex<BTreeMap<String, String>>,
    /// (host moref, type name) -> CLI type information
    cli_info: Mutex<BTreeMap<(String, String), CliTypeInfo>>,
}

impl VSphereClient {
    /// Connect and log in
    pub async fn connect(config: VSphereConfig) -> Result<Self> {
        let soap = SoapClient::new(
            &config.hostname,
            config.insecure,
            config.request_timeout,
            &config.api_version,
        )?;

        info!("Connecting to vCenter at {}", soap.endpoint());

        let body = format!(
            r#"<RetrieveServiceContent xmlns="urn:vim25">{}</RetrieveServiceContent>"#,
            soap::this("ServiceInstance", "ServiceInstance")
        );
        let response = soap
            .invoke("RetrieveServiceContent", &body)
            .await?
            .map_err(|f| f.into_error("RetrieveServiceContent"))?;

        let field = |name: &str| -> Result<String> {
            soap::returnval_field(&response, name)?.ok_or_else(|| Error::Soap {
                operation: "RetrieveServiceContent".into(),
                reason: format!("service content has no {}", name),
            })
        };
        let content = ServiceContent {
            root_folder: field("rootFolder")?,
            property_collector: field("propertyCollector")?,
            search_index: field("searchIndex")?,
            session_manager: field("sessionManager")?,
        };

        let client = Self {
            config,
            soap,
            content,
            vms: Mutex::new(BTreeMap::new()),
            executers: Mutex::new(BTreeMap::new()),
            cli_info: Mutex::new(BTreeMap::new()),
        };
        client.login().await?;
        Ok(client)
    }

    async fn login(&self) -> Result<()> {
        let body = format!(
            r#"<Login xmlns="urn:vim25">{}<userName>{}</userName><password>{}</password></Login>"#,
            soap::this("SessionManager", &self.content.session_manager),
            xml::escape(&self.config.username),
            xml::escape(self.config.password.expose_secret())
        );
        self.soap
            .invoke("Login", &body)
            .await?
            .map_err(|f| f.into_error("Login"))?;

        info!("Logged in to vCenter as {}", self.config.username);
        Ok(())
    }

    /// Invoke an operation, logging in again once if the session expired
    async fn call(&self, operation: &str, body: &str) -> Result<String> {
        match self.soap.invoke(operation, body).await? {
            Ok(text) => Ok(text),
            Err(fault) if fault.is_not_authenticated() => {
                warn!("vCenter session expired, logging in again");
                self.login().await?;
                self.soap
                    .invoke(operation, body)
                    .await?
                    .map_err(|f| f.into_error(operation))
            }
            Err(fault) => Err(fault.into_error(operation)),
        }
    }

    async fn properties(&self, obj: &MoRef, paths: &[&str]) -> Result<String> {
        let body = soap::retrieve_properties(&self.content.property_collector, obj, paths);
        self.call("RetrievePropertiesEx", &body).await
    }

    async fn find_by_inventory_path(&self, path: &str) -> Result<Option<MoRef>> {
        let body = format!(
            r#"<FindByInventoryPath xmlns="urn:vim25">{}<inventoryPath>{}</inventoryPath></FindByInventoryPath>"#,
            soap::this("SearchIndex", &self.content.search_index),
            xml::escape(path)
        );
        let response = self.call("FindByInventoryPath", &body).await?;
        soap::returnval_moref(&response)
    }

    /// All datacenter names, descending into folders
    async fn datacenters(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut folders = vec![(
            MoRef {
                kind: "Folder".into(),
                value: self.content.root_folder.clone(),
            },
            0usize,
        )];

        while let Some((folder, depth)) = folders.pop() {
            let response = self.properties(&folder, &["childEntity"]).await?;
            for child in soap::property_morefs(&response, "childEntity")? {
                match child.kind.as_str() {
                    "Datacenter" => {
                        let response = self.properties(&child, &["name"]).await?;
                        if let Some(name) = soap::property_text(&response, "name")? {
                            names.push(name);
                        }
                    }
                    "Folder" if depth < MAX_INVENTORY_DEPTH => folders.push((child, depth + 1)),
                    _ => {}
                }
            }
        }

        debug!("Found datacenters: {:?}", names);
        Ok(names)
    }

    /// Resolve a vm id as an inventory path in any datacenter, or as a moref
    async fn resolve_vm(&self, vm_id: &str) -> Result<MoRef> {
        if let Some(vm) = self.vms.lock().get(vm_id) {
            return Ok(vm.clone());
        }

        let mut found = None;
        for dc in self.datacenters().await? {
            let path = format!("{}/vm/{}", dc, vm_id);
            if let Some(vm) = self.find_by_inventory_path(&path).await? {
                if vm.kind == "VirtualMachine" {
                    debug!("Found VM {} at {}", vm.value, path);
                    found = Some(vm);
                    break;
                }
            }
        }

        let vm = match found {
            Some(vm) => vm,
            None => {
                let candidate = MoRef {
                    kind: "VirtualMachine".into(),
                    value: vm_id.to_string(),
                };
                match self.properties(&candidate, &["name"]).await {
                    Ok(_) => candidate,
                    Err(Error::ResourceNotFound { .. }) | Err(Error::Soap { .. }) => {
                        return Err(Error::VmNotFound {
                            vm_id: vm_id.to_string(),
                        })
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        self.vms.lock().insert(vm_id.to_string(), vm.clone());
        Ok(vm)
    }

    /// Name of the datacenter containing `obj`
    async fn datacenter_of(&self, obj: &MoRef) -> Result<String> {
        let mut current = obj.clone();
        for _ in 0..MAX_INVENTORY_DEPTH {
            let response = self.properties(&current, &["parent"]).await?;
            let Some(parent) = soap::property_moref(&response, "parent")? else {
                break;
            };
            if parent.kind == "Datacenter" {
                let response = self.properties(&parent, &["name"]).await?;
                return soap::property_text(&response, "name")?.ok_or_else(|| Error::Soap {
                    operation: "RetrievePropertiesEx".into(),
                    reason: format!("datacenter {} has no name", parent.value),
                });
            }
            current = parent;
        }

        Err(Error::Soap {
            operation: "RetrievePropertiesEx".into(),
            reason: format!("no datacenter above {}", obj.value),
        })
    }

    async fn executer(&self, host: &HostSystem) -> Result<String> {
        if let Some(mme) = self.executers.lock().get(&host.moref) {
            return Ok(mme.clone());
        }

        let body = format!(
            r#"<RetrieveManagedMethodExecuter xmlns="urn:vim25">{}</RetrieveManagedMethodExecuter>"#,
            soap::this("HostSystem", &host.moref)
        );
        let response = self.call("RetrieveManagedMethodExecuter", &body).await?;
        let mme = soap::returnval_moref(&response)?
            .ok_or_else(|| Error::Soap {
                operation: "RetrieveManagedMethodExecuter".into(),
                reason: format!("host {} returned no executer", host.name),
            })?
            .value;

        self.executers.lock().insert(host.moref.clone(), mme.clone());
        Ok(mme)
    }

    async fn execute(
        &self,
        host: &HostSystem,
        command: &str,
        moid: &str,
        method: &str,
        args: &[(String, String)],
    ) -> Result<String> {
        let mme = self.executer(host).await?;
        let body = esxcli::execute_soap_body(&mme, moid, method, args);
        let response = self.call("ExecuteSoap", &body).await?;

        match esxcli::parse_execute_response(&response)? {
            ExecuteOutcome::Response(inner) => Ok(inner),
            ExecuteOutcome::Fault { message, detail } => {
                let err = esxcli::fault_error(command, message, &detail);
                warn!("esxcli {} on {} faulted: {}", command, host.name, err);
                Err(err)
            }
        }
    }

    async fn type_info(&self, host: &HostSystem, command: &EsxCliCommand) -> Result<CliTypeInfo> {
        let key = (host.moref.clone(), command.type_name());
        if let Some(info) = self.cli_info.lock().get(&key) {
            return Ok(info.clone());
        }

        let inner = self
            .execute(
                host,
                &command.to_string(),
                esxcli::CLI_INFO_MOID,
                esxcli::CLI_INFO_METHOD,
                &[("typeName".to_string(), command.type_name())],
            )
            .await?;
        let info = CliTypeInfo::parse(&inner)?;

        self.cli_info.lock().insert(key, info.clone());
        Ok(info)
    }
}

#[async_trait]
impl VCenterClient for VSphereClient {
    async fn get_esx_by_vm(&self, vm_id: &str) -> Result<HostSystem> {
        let vm = self.resolve_vm(vm_id).await?;

        let response = self.properties(&vm, &["runtime.host"]).await?;
        let host = soap::property_moref(&response, "runtime.host")?.ok_or_else(|| {
            Error::VmNotFound {
                vm_id: format!("{} (not running on any host)", vm_id),
            }
        })?;

        let response = self.properties(&host, &["name"]).await?;
        let name = soap::property_text(&response, "name")?.unwrap_or_else(|| host.value.clone());
        let datacenter = self.datacenter_of(&host).await?;

        info!("VM {} runs on host {} in {}", vm_id, name, datacenter);
        Ok(HostSystem {
            moref: host.value,
            name,
            datacenter,
        })
    }

    async fn get_vm_disk_backing(&self, vm_id: &str, vmdk_path: &str) -> Result<DiskBacking> {
        let vm = self.resolve_vm(vm_id).await?;
        let response = self.properties(&vm, &["config.hardware.device"]).await?;
        let disks = disk::parse_virtual_disks(&response)?;
        let backing = disk::classify(&disks, vmdk_path);

        info!("Disk {} of {} is {}", vmdk_path, vm_id, backing.kind());
        Ok(backing)
    }

    async fn run_esx_command(&self, host: &HostSystem, argv: &[String]) -> Result<Vec<EsxRow>> {
        let command = EsxCliCommand::parse(argv)?;
        let command_line = command.to_string();
        debug!("esxcli {} on {}", command_line, host.name);

        let info = self.type_info(host, &command).await?;
        let args = command.bind(&info)?;
        let inner = self
            .execute(host, &command_line, &command.moid(), &command.method_name(), &args)
            .await?;

        let rows = esxcli::parse_rows(&inner)?;
        esxcli::check_status(&command_line, &rows)?;
        Ok(rows)
    }

    async fn get_datastore(&self, datacenter: &str, name: &str) -> Result<Datastore> {
        let path = format!("{}/datastore/{}", datacenter, name);
        match self.find_by_inventory_path(&path).await? {
            Some(ds) if ds.kind == "Datastore" => Ok(Datastore {
                moref: ds.value,
                name: name.to_string(),
            }),
            _ => Err(Error::DatastoreNotFound {
                datacenter: datacenter.to_string(),
                name: name.to_string(),
            }),
        }
    }

    async fn logout(&self) {
        let body = format!(
            r#"<Logout xmlns="urn:vim25">{}</Logout>"#,
            soap::this("SessionManager", &self.content.session_manager)
        );
        match self.soap.invoke("Logout", &body).await {
            Ok(Ok(_)) => debug!("Logged out of vCenter"),
            Ok(Err(fault)) => warn!("vCenter logout fault: {}", fault.message),
            Err(e) => warn!("vCenter logout failed: {}", e),
        }
    }
}
