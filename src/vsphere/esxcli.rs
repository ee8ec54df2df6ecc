//! esxcli over the vSphere API
//!
//! esxcli commands are executed through a host's
//! `ReflectManagedMethodExecuter`: the command words become a managed object
//! id (`ha-cli-handler-storage-core-device`) and a method name
//! (`vim.EsxCLI.storage.core.device.list`), and flags are bound to parameter
//! names using the host's CLI type information. Responses are XML documents
//! that flatten to rows of field name to values.

use super::xml;
use crate::domain::ports::EsxRow;
use crate::error::{Error, Result};
use std::collections::BTreeMap;

/// Managed object id of the CLI type information handler
pub const CLI_INFO_MOID: &str = "ha-dynamic-type-manager-local-cli-cliinfo";
/// Method returning CLI type information
pub const CLI_INFO_METHOD: &str = "vim.CLIInfo.FetchCLIInfo";
/// Version string expected by ExecuteSoap
pub const EXECUTE_VERSION: &str = "urn:vim25/5.0";

// =============================================================================
// Command
// =============================================================================

/// An esxcli invocation split into namespace, method and raw flag tokens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsxCliCommand {
    pub namespace: Vec<String>,
    pub method: String,
    pub tokens: Vec<String>,
}

impl EsxCliCommand {
    /// Split an argv such as `storage core device list -d naa.1`
    pub fn parse(argv: &[String]) -> Result<Self> {
        let split = argv
            .iter()
            .position(|a| a.starts_with('-'))
            .unwrap_or(argv.len());
        let (words, tokens) = argv.split_at(split);

        match words {
            [namespace @ .., method] if !namespace.is_empty() => Ok(Self {
                namespace: namespace.to_vec(),
                method: method.clone(),
                tokens: tokens.to_vec(),
            }),
            _ => Err(Error::Configuration(format!(
                "esxcli command needs a namespace and a method: {:?}",
                argv
            ))),
        }
    }

    /// Type name, e.g. `vim.EsxCLI.storage.core.device`
    pub fn type_name(&self) -> String {
        format!("vim.EsxCLI.{}", self.namespace.join("."))
    }

    /// Handler id, e.g. `ha-cli-handler-storage-core-device`
    pub fn moid(&self) -> String {
        format!("ha-cli-handler-{}", self.namespace.join("-"))
    }

    /// Fully qualified method, e.g. `vim.EsxCLI.storage.core.device.list`
    pub fn method_name(&self) -> String {
        format!("{}.{}", self.type_name(), self.method)
    }

    /// Bind flag tokens to parameter names
    pub fn bind(&self, info: &CliTypeInfo) -> Result<Vec<(String, String)>> {
        let method = info.method(&self.method).ok_or_else(|| Error::EsxCli {
            command: self.to_string(),
            message: format!("unknown method {} in {}", self.method, info.name),
        })?;

        let mut args = Vec::new();
        let mut tokens = self.tokens.iter().peekable();
        while let Some(token) = tokens.next() {
            let (flag, inline) = match token.split_once('=') {
                Some((f, v)) if f.starts_with("--") => (f, Some(v.to_string())),
                _ => (token.as_str(), None),
            };
            let param = method.param(flag).ok_or_else(|| Error::EsxCli {
                command: self.to_string(),
                message: format!("unknown option {}", flag),
            })?;

            let value = match inline {
                Some(v) => v,
                None if param.flag => "true".to_string(),
                None => tokens.next().cloned().ok_or_else(|| Error::EsxCli {
                    command: self.to_string(),
                    message: format!("option {} requires a value", flag),
                })?,
            };
            args.push((param.name.clone(), value));
        }
        Ok(args)
    }
}

impl std::fmt::Display for EsxCliCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.namespace.join(" "), self.method)?;
        for t in &self.tokens {
            write!(f, " {}", t)?;
        }
        Ok(())
    }
}

// =============================================================================
// CLI Type Information
// =============================================================================

/// Parameter of an esxcli method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliParam {
    pub name: String,
    pub aliases: Vec<String>,
    /// Boolean switch that takes no value
    pub flag: bool,
}

/// Method of an esxcli namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliMethod {
    pub name: String,
    pub params: Vec<CliParam>,
}

impl CliMethod {
    /// Find a parameter by alias (`-d`, `--device`)
    pub fn param(&self, alias: &str) -> Option<&CliParam> {
        self.params.iter().find(|p| {
            p.aliases.iter().any(|a| a == alias)
                || alias.strip_prefix("--") == Some(p.name.as_str())
        })
    }
}

/// CLI type information of one namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliTypeInfo {
    pub name: String,
    pub methods: Vec<CliMethod>,
}

impl CliTypeInfo {
    pub fn method(&self, name: &str) -> Option<&CliMethod> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// Parse the inner document returned by `FetchCLIInfo`
    pub fn parse(inner: &str) -> Result<Self> {
        let doc = roxmltree::Document::parse(inner)?;
        let root = doc.root_element();

        let methods = xml::elements(root)
            .filter(|n| n.tag_name().name() == "method")
            .map(|m| CliMethod {
                name: xml::child_text(m, "name").unwrap_or_default(),
                params: xml::elements(m)
                    .filter(|n| n.tag_name().name() == "param")
                    .map(|p| CliParam {
                        name: xml::child_text(p, "name").unwrap_or_default(),
                        aliases: xml::elements(p)
                            .filter(|n| n.tag_name().name() == "aliases")
                            .map(xml::text)
                            .collect(),
                        flag: xml::child_text(p, "flag").as_deref() == Some("true"),
                    })
                    .collect(),
            })
            .collect();

        Ok(Self {
            name: xml::child_text(root, "name").unwrap_or_default(),
            methods,
        })
    }
}

// =============================================================================
// ExecuteSoap
// =============================================================================

/// Body of a ReflectManagedMethodExecuter.ExecuteSoap call
pub fn execute_soap_body(executer: &str, moid: &str, method: &str, args: &[(String, String)]) -> String {
    let arguments: String = args
        .iter()
        .map(|(name, value)| {
            let inner = format!("<{0}>{1}</{0}>", name, xml::escape(value));
            format!(
                "<argument><name>{}</name><val>{}</val></argument>",
                xml::escape(name),
                xml::escape(&inner)
            )
        })
        .collect();

    format!(
        concat!(
            r#"<ExecuteSoap xmlns="urn:vim25">{}"#,
            "<moid>{}</moid><version>{}</version><method>{}</method>{}",
            "</ExecuteSoap>"
        ),
        super::soap::this("ReflectManagedMethodExecuter", executer),
        xml::escape(moid),
        EXECUTE_VERSION,
        xml::escape(method),
        arguments
    )
}

/// Outcome of an ExecuteSoap call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// Inner response document
    Response(String),
    /// Method-level fault
    Fault { message: String, detail: String },
}

/// Read the ExecuteSoap envelope
pub fn parse_execute_response(body: &str) -> Result<ExecuteOutcome> {
    let doc = roxmltree::Document::parse(body)?;
    let returnval = xml::descendants_named(doc.root_element(), "returnval").next();

    let Some(returnval) = returnval else {
        return Ok(ExecuteOutcome::Response(String::new()));
    };

    if let Some(fault) = xml::child(returnval, "fault") {
        return Ok(ExecuteOutcome::Fault {
            message: xml::child_text(fault, "faultMsg").unwrap_or_default(),
            detail: xml::child_text(fault, "faultDetail").unwrap_or_default(),
        });
    }

    Ok(ExecuteOutcome::Response(
        xml::child_text(returnval, "response").unwrap_or_default(),
    ))
}

/// Fault type and error messages from an XML-encoded fault detail
pub fn parse_fault_detail(detail: &str) -> Option<(String, Vec<String>)> {
    let doc = roxmltree::Document::parse(detail).ok()?;
    let root = doc.root_element();
    let fault_type = xml::xsi_type(root)
        .unwrap_or(root.tag_name().name())
        .to_string();
    let messages = xml::descendants_named(root, "errMsg")
        .map(xml::text)
        .filter(|m| !m.is_empty())
        .collect();
    Some((fault_type, messages))
}

/// Turn a method fault into an error, preferring the decoded detail
pub fn fault_error(command: &str, message: String, detail: &str) -> Error {
    match parse_fault_detail(detail) {
        Some((fault_type, messages)) if !messages.is_empty() => Error::EsxCliFault {
            fault_type,
            messages,
        },
        _ => Error::EsxCli {
            command: command.to_string(),
            message,
        },
    }
}

// =============================================================================
// Rows
// =============================================================================

/// Flatten an esxcli response document into rows
pub fn parse_rows(inner: &str) -> Result<Vec<EsxRow>> {
    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }
    let doc = roxmltree::Document::parse(inner)?;
    let root = doc.root_element();

    let structures: Vec<_> = xml::descendants_named(root, "structure").collect();
    if !structures.is_empty() {
        return Ok(structures.into_iter().map(row_from).collect());
    }

    let is_array = xml::xsi_type(root).is_some_and(|t| t.starts_with("ArrayOf"));
    if is_array {
        return Ok(xml::elements(root).map(row_from).collect());
    }

    if xml::elements(root).next().is_some() {
        return Ok(vec![row_from(root)]);
    }

    let mut row = BTreeMap::new();
    row.insert("message".to_string(), vec![xml::text(root)]);
    Ok(vec![EsxRow(row)])
}

fn row_from(node: roxmltree::Node<'_, '_>) -> EsxRow {
    let mut row: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for field in xml::elements(node) {
        let key = if field.tag_name().name() == "field" {
            field.attribute("name").unwrap_or("field").to_string()
        } else {
            field.tag_name().name().to_string()
        };
        let values: Vec<String> = if xml::elements(field).next().is_some() {
            xml::elements(field).map(xml::text).collect()
        } else {
            vec![xml::text(field)]
        };
        row.entry(key).or_default().extend(values);
    }
    EsxRow(row)
}

/// Fail on the first row whose `status` is not `0`
pub fn check_status(command: &str, rows: &[EsxRow]) -> Result<()> {
    for row in rows {
        if row.has("status") && row.value("status") != "0" {
            return Err(Error::EsxCli {
                command: command.to_string(),
                message: row.value("message"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::esx_args;
    use assert_matches::assert_matches;

    const DEVICE_INFO: &str = r#"<obj xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xmlns="urn:vim25" versionId="5.0" xsi:type="vim.CLIInfo">
<name>vim.EsxCLI.storage.core.adapter</name>
<method><name>list</name></method>
<method><name>rescan</name>
  <param><name>adapter</name><aliases>-A</aliases><aliases>--adapter</aliases><flag>false</flag></param>
  <param><name>all</name><aliases>-a</aliases><aliases>--all</aliases><flag>true</flag></param>
  <param><name>type</name><aliases>-t</aliases><aliases>--type</aliases><flag>false</flag></param>
</method>
</obj>"#;

    #[test]
    fn test_command_naming() {
        let cmd = EsxCliCommand::parse(&esx_args(&["storage", "core", "device", "list", "-d", "naa.1"])).unwrap();
        assert_eq!(cmd.moid(), "ha-cli-handler-storage-core-device");
        assert_eq!(cmd.method_name(), "vim.EsxCLI.storage.core.device.list");
        assert_eq!(cmd.tokens, esx_args(&["-d", "naa.1"]));
        assert_eq!(cmd.to_string(), "storage core device list -d naa.1");
    }

    #[test]
    fn test_command_needs_namespace() {
        assert!(EsxCliCommand::parse(&esx_args(&["list"])).is_err());
        assert!(EsxCliCommand::parse(&esx_args(&["-d", "x"])).is_err());
    }

    #[test]
    fn test_bind_flags_and_values() {
        let info = CliTypeInfo::parse(DEVICE_INFO).unwrap();
        assert_eq!(info.name, "vim.EsxCLI.storage.core.adapter");

        let cmd = EsxCliCommand::parse(&esx_args(&["storage", "core", "adapter", "rescan", "--all"])).unwrap();
        assert_eq!(cmd.bind(&info).unwrap(), vec![("all".to_string(), "true".to_string())]);

        let cmd = EsxCliCommand::parse(&esx_args(&[
            "storage", "core", "adapter", "rescan", "-t", "delete", "--adapter=vmhba1",
        ]))
        .unwrap();
        assert_eq!(
            cmd.bind(&info).unwrap(),
            vec![
                ("type".to_string(), "delete".to_string()),
                ("adapter".to_string(), "vmhba1".to_string())
            ]
        );

        let cmd = EsxCliCommand::parse(&esx_args(&["storage", "core", "adapter", "rescan", "-x"])).unwrap();
        assert_matches!(cmd.bind(&info), Err(Error::EsxCli { .. }));
    }

    #[test]
    fn test_execute_soap_body_double_escapes_arguments() {
        let body = execute_soap_body(
            "ha-mme",
            "ha-cli-handler-storage-core-device",
            "vim.EsxCLI.storage.core.device.list",
            &[("device".to_string(), "naa.1".to_string())],
        );
        assert!(body.contains("<name>device</name><val>&lt;device&gt;naa.1&lt;/device&gt;</val>"));
        assert!(body.contains("<version>urn:vim25/5.0</version>"));
    }

    #[test]
    fn test_parse_rows_array() {
        let inner = r#"<obj xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xmlns="urn:vim25" versionId="5.0" xsi:type="ArrayOfDataObject">
<DataObject xsi:type="vim.EsxCLI.storage.vmfs.extent.list.Extent"><DeviceName>naa.600a0980383030</DeviceName><Partition>1</Partition><VolumeName>ds1</VolumeName></DataObject>
<DataObject xsi:type="vim.EsxCLI.storage.vmfs.extent.list.Extent"><DeviceName>naa.624a9370aaaa</DeviceName><Partition>1</Partition><VolumeName>ds2</VolumeName></DataObject>
</obj>"#;
        let rows = parse_rows(inner).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].value("VolumeName"), "ds2");
        assert_eq!(rows[0].value("DeviceName"), "naa.600a0980383030");
    }

    #[test]
    fn test_parse_rows_structure_output_and_status() {
        let inner = r#"<?xml version="1.0" ?>
<output xmlns="http://www.vmware.com/Products/ESX/5.0/esxcli/">
    <structure typeName="result">
        <field name="status"><string>1</string></field>
        <field name="message"><string>reservation conflict</string></field>
    </structure>
</output>"#;
        let rows = parse_rows(inner).unwrap();
        assert_eq!(rows[0].value("status"), "1");
        let err = check_status("vmkfstools clone", &rows).unwrap_err();
        assert!(err.to_string().contains("reservation conflict"));
    }

    #[test]
    fn test_parse_rows_plain_string() {
        let inner = r#"<obj xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xsi:type="xsd:string">Rescan complete</obj>"#;
        let rows = parse_rows(inner).unwrap();
        assert_eq!(rows[0].value("message"), "Rescan complete");
        assert!(check_status("x", &rows).is_ok());
    }

    #[test]
    fn test_parse_execute_response_fault() {
        let body = r#"<Envelope><Body><ExecuteSoapResponse><returnval><fault>
<faultMsg>Unable to find device</faultMsg>
<faultDetail>&lt;obj xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xsi:type="vim.EsxCLI.CLIFault"&gt;&lt;errMsg&gt;Unknown device naa.1&lt;/errMsg&gt;&lt;/obj&gt;</faultDetail>
</fault></returnval></ExecuteSoapResponse></Body></Envelope>"#;

        let outcome = parse_execute_response(body).unwrap();
        let ExecuteOutcome::Fault { message, detail } = outcome else {
            panic!("expected a fault");
        };
        assert_eq!(message, "Unable to find device");

        let err = fault_error("storage core device list", message, &detail);
        assert_matches!(
            err,
            Error::EsxCliFault { ref fault_type, ref messages }
                if fault_type == "vim.EsxCLI.CLIFault" && messages == &vec!["Unknown device naa.1".to_string()]
        );
    }
}
